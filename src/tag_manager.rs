//! Tag metadata cache and Get_Attribute_List response parsing, backing the
//! `list_tags` / `browse_tags` RPC methods (§6.1).

use crate::error::{Result, WorkerError};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Scope a tag lives in.
#[derive(Debug, Clone, PartialEq)]
pub enum TagScope {
    Controller,
    Program(String),
    Global,
    Local,
}

/// Array dimensionality for an array-typed tag.
#[derive(Debug, Clone)]
pub struct ArrayInfo {
    pub dimensions: Vec<u32>,
    pub element_count: u32,
}

/// Metadata describing a discovered tag.
#[derive(Debug, Clone)]
pub struct TagMetadata {
    pub data_type: u16,
    pub size: u32,
    pub is_array: bool,
    pub dimensions: Vec<u32>,
    pub permissions: TagPermissions,
    pub scope: TagScope,
    pub last_access: Instant,
    pub array_info: Option<ArrayInfo>,
    pub last_updated: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagPermissions {
    pub readable: bool,
    pub writable: bool,
}

/// Tag cache with time-based expiration, keyed by tag name.
#[derive(Debug)]
pub struct TagCache {
    tags: HashMap<String, (TagMetadata, Instant)>,
    expiration: Duration,
}

impl TagCache {
    pub fn new(expiration: Duration) -> Self {
        Self {
            tags: HashMap::new(),
            expiration,
        }
    }

    pub fn update_tag(&mut self, name: String, metadata: TagMetadata) {
        self.tags.insert(name, (metadata, Instant::now()));
    }

    pub fn get_tag(&self, name: &str) -> Option<&TagMetadata> {
        if let Some((metadata, timestamp)) = self.tags.get(name) {
            if timestamp.elapsed() < self.expiration {
                return Some(metadata);
            }
        }
        None
    }

    pub fn cleanup(&mut self) {
        self.tags
            .retain(|_, (_, timestamp)| timestamp.elapsed() < self.expiration);
    }
}

/// Holds discovered tag metadata for one PLC connection.
#[derive(Debug)]
pub struct TagManager {
    pub cache: RwLock<HashMap<String, TagMetadata>>,
    cache_duration: Duration,
}

impl TagManager {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            cache_duration: Duration::from_secs(300),
        }
    }

    pub async fn get_metadata(&self, tag_name: &str) -> Option<TagMetadata> {
        let cache = self.cache.read().unwrap();
        cache.get(tag_name).and_then(|metadata| {
            if metadata.last_updated.elapsed() < self.cache_duration {
                Some(metadata.clone())
            } else {
                None
            }
        })
    }

    pub async fn update_metadata(&self, tag_name: String, metadata: TagMetadata) {
        self.cache.write().unwrap().insert(tag_name, metadata);
    }

    pub async fn validate_tag(
        &self,
        tag_name: &str,
        required_permissions: &TagPermissions,
    ) -> Result<()> {
        if let Some(metadata) = self.get_metadata(tag_name).await {
            if !metadata.permissions.readable && required_permissions.readable {
                return Err(WorkerError::Protocol(format!(
                    "tag '{tag_name}' is not readable"
                )));
            }
            if !metadata.permissions.writable && required_permissions.writable {
                return Err(WorkerError::Protocol(format!(
                    "tag '{tag_name}' is not writable"
                )));
            }
            Ok(())
        } else {
            Err(WorkerError::TagNotFound(tag_name.to_string()))
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.write().unwrap().clear();
    }

    pub async fn remove_stale_entries(&self) {
        self.cache
            .write()
            .unwrap()
            .retain(|_, metadata| metadata.last_updated.elapsed() < self.cache_duration);
    }

    /// Replaces the cache with tags parsed from a raw Get_Attribute_List
    /// response. The caller (the driver facade) owns the CIP round trip;
    /// this manager only owns parsing and caching.
    pub fn ingest_tag_list(&self, response: &[u8]) -> Result<usize> {
        let tags = self.parse_tag_list(response)?;
        let count = tags.len();
        let mut cache = self.cache.write().unwrap();
        for (name, metadata) in tags {
            cache.insert(name, metadata);
        }
        Ok(count)
    }

    /// Parses a Get_Attribute_List (Symbol Object, class 0x6B) response body
    /// into `(name, metadata)` pairs. Each entry is laid out as
    /// `[InstanceID(4)][NameLength(2)][Name][Type(2)]`.
    pub fn parse_tag_list(&self, response: &[u8]) -> Result<Vec<(String, TagMetadata)>> {
        log::trace!(
            "parsing tag list response ({} bytes): {:02X?}",
            response.len(),
            response
        );

        let mut tags = Vec::new();
        let mut offset = 0;

        while offset < response.len() {
            if offset + 4 > response.len() {
                log::warn!("not enough bytes for instance id at offset {offset}");
                break;
            }

            let instance_id = u32::from_le_bytes([
                response[offset],
                response[offset + 1],
                response[offset + 2],
                response[offset + 3],
            ]);
            offset += 4;

            if offset + 2 > response.len() {
                log::warn!("not enough bytes for name length at offset {offset}");
                break;
            }

            let name_length = u16::from_le_bytes([response[offset], response[offset + 1]]) as usize;
            offset += 2;

            if offset + name_length > response.len() {
                log::warn!(
                    "not enough bytes for tag name at offset {offset} (need {name_length}, have {})",
                    response.len() - offset
                );
                break;
            }

            let name = String::from_utf8_lossy(&response[offset..offset + name_length]).to_string();
            offset += name_length;

            if offset + 2 > response.len() {
                log::warn!("not enough bytes for tag type at offset {offset}");
                break;
            }

            let tag_type = u16::from_le_bytes([response[offset], response[offset + 1]]);
            offset += 2;

            let (type_code, _is_structure, array_dims, _reserved) = self.parse_tag_type(tag_type);

            let is_array = array_dims > 0;
            let dimensions = if is_array {
                vec![0; array_dims as usize]
            } else {
                Vec::new()
            };

            let array_info = if is_array && !dimensions.is_empty() {
                Some(ArrayInfo {
                    element_count: dimensions.iter().product(),
                    dimensions: dimensions.clone(),
                })
            } else {
                None
            };

            let metadata = TagMetadata {
                data_type: type_code,
                scope: TagScope::Controller,
                permissions: TagPermissions {
                    readable: true,
                    writable: true,
                },
                is_array,
                dimensions,
                last_access: Instant::now(),
                size: 0,
                array_info,
                last_updated: Instant::now(),
            };

            log::debug!("parsed tag: {name} (id: {instance_id}, type: 0x{type_code:04X})");
            tags.push((name, metadata));
        }

        log::debug!("parsed {} tags from response", tags.len());
        Ok(tags)
    }

    /// Unpacks the packed type word the Symbol Object returns: base type
    /// code in the low byte/nibble, structure flag, array-dimension count,
    /// and a reserved bit.
    fn parse_tag_type(&self, tag_type: u16) -> (u16, bool, u8, bool) {
        let type_code = if (tag_type & 0x00ff) == 0xc1 {
            0x00c1
        } else {
            tag_type & 0x0fff
        };

        let is_structure = (tag_type & 0x8000) != 0;
        let array_dims = ((tag_type & 0x6000) >> 13) as u8;
        let reserved = (tag_type & 0x1000) != 0;

        (type_code, is_structure, array_dims, reserved)
    }
}

impl Default for TagManager {
    fn default() -> Self {
        Self::new()
    }
}
