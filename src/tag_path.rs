//! Symbolic tag path parsing and CIP path generation for Allen-Bradley PLCs.
//!
//! Supports program-scoped tags (`Program:MainProgram.Tag1`), array elements
//! (`MyArray[5]`, `MyArray[1,2,3]`), bit access (`MyDINT.15`), UDT members
//! (`MyUDT.Member1`), and string pseudo-members (`MyString.LEN`,
//! `MyString.DATA[5]`).

use crate::error::{Result, WorkerError};
use std::fmt;

/// Structured representation of a tag addressing expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TagPath {
    /// Simple controller-scoped tag: "MyTag"
    Controller { tag_name: String },

    /// Program-scoped tag: "Program:MainProgram.MyTag"
    Program {
        program_name: String,
        tag_name: String,
    },

    /// Array element access: "MyArray[5]" or "MyArray[1,2,3]"
    Array {
        base_path: Box<TagPath>,
        indices: Vec<u32>,
    },

    /// Bit access within a tag: "MyDINT.15"
    Bit {
        base_path: Box<TagPath>,
        bit_index: u8,
    },

    /// UDT member access: "MyUDT.Member1"
    Member {
        base_path: Box<TagPath>,
        member_name: String,
    },

    /// String length access: "MyString.LEN"
    StringLength { base_path: Box<TagPath> },

    /// String data access: "MyString.DATA[5]"
    StringData { base_path: Box<TagPath>, index: u32 },
}

impl TagPath {
    /// Parses a tag path string into a structured TagPath.
    ///
    /// ```rust
    /// use cip_poll_worker::tag_path::TagPath;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let path = TagPath::parse("MyTag")?;
    /// let path = TagPath::parse("Program:MainProgram.MyTag")?;
    /// let path = TagPath::parse("MyArray[5]")?;
    /// let path = TagPath::parse("Matrix[1,2,3]")?;
    /// let path = TagPath::parse("StatusWord.15")?;
    /// let path = TagPath::parse("MotorData.Speed")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(path_str: &str) -> Result<Self> {
        let parser = TagPathParser::new(path_str);
        parser.parse()
    }

    pub fn as_string(&self) -> String {
        match self {
            TagPath::Controller { tag_name } => tag_name.clone(),
            TagPath::Program {
                program_name,
                tag_name,
            } => {
                format!("Program:{program_name}.{tag_name}")
            }
            TagPath::Array { base_path, indices } => {
                let base = base_path.as_string();
                let indices_str = indices
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{base}[{indices_str}]")
            }
            TagPath::Bit {
                base_path,
                bit_index,
            } => {
                format!("{base_path}.{bit_index}")
            }
            TagPath::Member {
                base_path,
                member_name,
            } => {
                format!("{base_path}.{member_name}")
            }
            TagPath::StringLength { base_path } => {
                format!("{base_path}.LEN")
            }
            TagPath::StringData { base_path, index } => {
                format!("{base_path}.DATA[{index}]")
            }
        }
    }

    /// Generates the CIP path bytes for this tag path.
    pub fn to_cip_path(&self) -> Result<Vec<u8>> {
        let mut path = Vec::new();
        self.build_cip_path(&mut path)?;

        if path.len() % 2 != 0 {
            path.push(0x00);
        }

        Ok(path)
    }

    fn build_cip_path(&self, path: &mut Vec<u8>) -> Result<()> {
        match self {
            TagPath::Controller { tag_name } => {
                path.push(0x91);
                path.push(tag_name.len() as u8);
                path.extend_from_slice(tag_name.as_bytes());
            }

            TagPath::Program {
                program_name,
                tag_name,
            } => {
                path.push(0x91);
                let program_path = format!("Program:{program_name}");
                path.push(program_path.len() as u8);
                path.extend_from_slice(program_path.as_bytes());

                path.push(0x91);
                path.push(tag_name.len() as u8);
                path.extend_from_slice(tag_name.as_bytes());
            }

            TagPath::Array { base_path, indices } => {
                base_path.build_cip_path(path)?;

                for &index in indices {
                    path.push(0x28); // Element segment
                    path.extend_from_slice(&index.to_le_bytes());
                }
            }

            TagPath::Bit {
                base_path,
                bit_index,
            } => {
                base_path.build_cip_path(path)?;
                path.push(0x29); // Bit segment
                path.push(*bit_index);
            }

            TagPath::Member {
                base_path,
                member_name,
            } => {
                base_path.build_cip_path(path)?;
                path.push(0x91);
                path.push(member_name.len() as u8);
                path.extend_from_slice(member_name.as_bytes());
            }

            TagPath::StringLength { base_path } => {
                base_path.build_cip_path(path)?;
                path.push(0x91);
                path.push(3);
                path.extend_from_slice(b"LEN");
            }

            TagPath::StringData { base_path, index } => {
                base_path.build_cip_path(path)?;
                path.push(0x91);
                path.push(4);
                path.extend_from_slice(b"DATA");
                path.push(0x28);
                path.extend_from_slice(&index.to_le_bytes());
            }
        }

        Ok(())
    }

    pub fn base_tag_name(&self) -> String {
        match self {
            TagPath::Controller { tag_name } => tag_name.clone(),
            TagPath::Program { tag_name, .. } => tag_name.clone(),
            TagPath::Array { base_path, .. } => base_path.base_tag_name(),
            TagPath::Bit { base_path, .. } => base_path.base_tag_name(),
            TagPath::Member { base_path, .. } => base_path.base_tag_name(),
            TagPath::StringLength { base_path } => base_path.base_tag_name(),
            TagPath::StringData { base_path, .. } => base_path.base_tag_name(),
        }
    }

    pub fn is_program_scoped(&self) -> bool {
        match self {
            TagPath::Program { .. } => true,
            TagPath::Array { base_path, .. } => base_path.is_program_scoped(),
            TagPath::Bit { base_path, .. } => base_path.is_program_scoped(),
            TagPath::Member { base_path, .. } => base_path.is_program_scoped(),
            TagPath::StringLength { base_path } => base_path.is_program_scoped(),
            TagPath::StringData { base_path, .. } => base_path.is_program_scoped(),
            _ => false,
        }
    }

    pub fn program_name(&self) -> Option<String> {
        match self {
            TagPath::Program { program_name, .. } => Some(program_name.clone()),
            TagPath::Array { base_path, .. } => base_path.program_name(),
            TagPath::Bit { base_path, .. } => base_path.program_name(),
            TagPath::Member { base_path, .. } => base_path.program_name(),
            TagPath::StringLength { base_path } => base_path.program_name(),
            TagPath::StringData { base_path, .. } => base_path.program_name(),
            _ => None,
        }
    }
}

impl fmt::Display for TagPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// A tag name split into its array base and requested element, used by the
/// Batch Planner to group per-element subscriptions by underlying array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayElementRef {
    pub base: String,
    pub index: u32,
}

/// Classifies a tag expression as either a plain scalar/complex accessor or
/// a single-dimension array element reference.
///
/// Only a trailing `[<integer>]` with no further qualifiers after it
/// counts — `Foo.5` is bit access, not an array index, and `Foo[1,2]` is a
/// multi-dimensional index the planner cannot batch as a single-dimension
/// array read. Both fall through to `None` and are treated as individual
/// tags by the planner.
pub fn classify_array_element(tag_name: &str) -> Option<ArrayElementRef> {
    let open = tag_name.find('[')?;
    if !tag_name.ends_with(']') {
        return None;
    }
    let base = &tag_name[..open];
    let inside = &tag_name[open + 1..tag_name.len() - 1];
    if base.is_empty() || inside.contains(',') || inside.is_empty() {
        return None;
    }
    let index: u32 = inside.parse().ok()?;
    Some(ArrayElementRef {
        base: base.to_string(),
        index,
    })
}

struct TagPathParser<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> TagPathParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn parse(mut self) -> Result<TagPath> {
        self.parse_path()
    }

    fn parse_path(&mut self) -> Result<TagPath> {
        if self.input.starts_with("Program:") {
            self.parse_program_scoped()
        } else {
            self.parse_controller_scoped()
        }
    }

    fn parse_program_scoped(&mut self) -> Result<TagPath> {
        self.position = 8; // Skip "Program:"

        let program_name = self.parse_identifier()?;

        if !self.consume_char('.') {
            return Err(WorkerError::Protocol(
                "Expected '.' after program name".to_string(),
            ));
        }

        let tag_name = self.parse_identifier()?;

        let mut path = TagPath::Program {
            program_name,
            tag_name,
        };

        while self.position < self.input.len() {
            path = self.parse_qualifier(path)?;
        }

        Ok(path)
    }

    fn parse_controller_scoped(&mut self) -> Result<TagPath> {
        let tag_name = self.parse_identifier()?;
        let mut path = TagPath::Controller { tag_name };

        while self.position < self.input.len() {
            path = self.parse_qualifier(path)?;
        }

        Ok(path)
    }

    fn parse_qualifier(&mut self, base_path: TagPath) -> Result<TagPath> {
        match self.peek_char() {
            Some('[') => self.parse_array_access(base_path),
            Some('.') => self.parse_member_or_bit_access(base_path),
            _ => Err(WorkerError::Protocol(format!(
                "Unexpected character at position {}",
                self.position
            ))),
        }
    }

    fn parse_array_access(&mut self, base_path: TagPath) -> Result<TagPath> {
        self.consume_char('[');

        let mut indices = Vec::new();
        indices.push(self.parse_number()?);

        while self.peek_char() == Some(',') {
            self.consume_char(',');
            indices.push(self.parse_number()?);
        }

        if !self.consume_char(']') {
            return Err(WorkerError::Protocol(
                "Expected ']' after array indices".to_string(),
            ));
        }

        Ok(TagPath::Array {
            base_path: Box::new(base_path),
            indices,
        })
    }

    fn parse_member_or_bit_access(&mut self, base_path: TagPath) -> Result<TagPath> {
        self.consume_char('.');

        if self.input[self.position..].starts_with("LEN") {
            self.position += 3;
            return Ok(TagPath::StringLength {
                base_path: Box::new(base_path),
            });
        }

        if self.input[self.position..].starts_with("DATA[") {
            self.position += 5;
            let index = self.parse_number()?;
            if !self.consume_char(']') {
                return Err(WorkerError::Protocol(
                    "Expected ']' after DATA index".to_string(),
                ));
            }
            return Ok(TagPath::StringData {
                base_path: Box::new(base_path),
                index,
            });
        }

        let identifier = self.parse_identifier()?;

        if let Ok(bit_index) = identifier.parse::<u8>() {
            if bit_index < 32 {
                return Ok(TagPath::Bit {
                    base_path: Box::new(base_path),
                    bit_index,
                });
            }
        }

        Ok(TagPath::Member {
            base_path: Box::new(base_path),
            member_name: identifier,
        })
    }

    fn parse_identifier(&mut self) -> Result<String> {
        let start = self.position;

        while self.position < self.input.len() {
            let ch = self.input.chars().nth(self.position).unwrap();
            if ch.is_alphanumeric() || ch == '_' {
                self.position += 1;
            } else {
                break;
            }
        }

        if start == self.position {
            return Err(WorkerError::Protocol("Expected identifier".to_string()));
        }

        Ok(self.input[start..self.position].to_string())
    }

    fn parse_number(&mut self) -> Result<u32> {
        let start = self.position;

        while self.position < self.input.len() {
            let ch = self.input.chars().nth(self.position).unwrap();
            if ch.is_ascii_digit() {
                self.position += 1;
            } else {
                break;
            }
        }

        if start == self.position {
            return Err(WorkerError::Protocol("Expected number".to_string()));
        }

        self.input[start..self.position]
            .parse()
            .map_err(|_| WorkerError::Protocol("Invalid number".to_string()))
    }

    fn peek_char(&self) -> Option<char> {
        self.input.chars().nth(self.position)
    }

    fn consume_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_scoped_tag() {
        let path = TagPath::parse("MyTag").unwrap();
        assert_eq!(
            path,
            TagPath::Controller {
                tag_name: "MyTag".to_string()
            }
        );
        assert_eq!(path.to_string(), "MyTag");
    }

    #[test]
    fn test_program_scoped_tag() {
        let path = TagPath::parse("Program:MainProgram.MyTag").unwrap();
        assert_eq!(
            path,
            TagPath::Program {
                program_name: "MainProgram".to_string(),
                tag_name: "MyTag".to_string()
            }
        );
        assert_eq!(path.to_string(), "Program:MainProgram.MyTag");
        assert!(path.is_program_scoped());
        assert_eq!(path.program_name(), Some("MainProgram".to_string()));
    }

    #[test]
    fn test_array_access() {
        let path = TagPath::parse("MyArray[5]").unwrap();
        if let TagPath::Array { base_path, indices } = path {
            assert_eq!(
                *base_path,
                TagPath::Controller {
                    tag_name: "MyArray".to_string()
                }
            );
            assert_eq!(indices, vec![5]);
        } else {
            panic!("Expected Array path");
        }
    }

    #[test]
    fn test_multi_dimensional_array() {
        let path = TagPath::parse("Matrix[1,2,3]").unwrap();
        if let TagPath::Array { base_path, indices } = path {
            assert_eq!(
                *base_path,
                TagPath::Controller {
                    tag_name: "Matrix".to_string()
                }
            );
            assert_eq!(indices, vec![1, 2, 3]);
        } else {
            panic!("Expected Array path");
        }
    }

    #[test]
    fn test_bit_access() {
        let path = TagPath::parse("StatusWord.15").unwrap();
        if let TagPath::Bit {
            base_path,
            bit_index,
        } = path
        {
            assert_eq!(
                *base_path,
                TagPath::Controller {
                    tag_name: "StatusWord".to_string()
                }
            );
            assert_eq!(bit_index, 15);
        } else {
            panic!("Expected Bit path");
        }
    }

    #[test]
    fn test_member_access() {
        let path = TagPath::parse("MotorData.Speed").unwrap();
        if let TagPath::Member {
            base_path,
            member_name,
        } = path
        {
            assert_eq!(
                *base_path,
                TagPath::Controller {
                    tag_name: "MotorData".to_string()
                }
            );
            assert_eq!(member_name, "Speed");
        } else {
            panic!("Expected Member path");
        }
    }

    #[test]
    fn test_string_length() {
        let path = TagPath::parse("MyString.LEN").unwrap();
        if let TagPath::StringLength { base_path } = path {
            assert_eq!(
                *base_path,
                TagPath::Controller {
                    tag_name: "MyString".to_string()
                }
            );
        } else {
            panic!("Expected StringLength path");
        }
    }

    #[test]
    fn test_string_data() {
        let path = TagPath::parse("MyString.DATA[5]").unwrap();
        if let TagPath::StringData { base_path, index } = path {
            assert_eq!(
                *base_path,
                TagPath::Controller {
                    tag_name: "MyString".to_string()
                }
            );
            assert_eq!(index, 5);
        } else {
            panic!("Expected StringData path");
        }
    }

    #[test]
    fn test_complex_nested_path() {
        let path = TagPath::parse("Program:Safety.Devices[2].Status.15").unwrap();

        if let TagPath::Bit {
            base_path,
            bit_index,
        } = path
        {
            assert_eq!(bit_index, 15);

            if let TagPath::Member {
                base_path,
                member_name,
            } = *base_path
            {
                assert_eq!(member_name, "Status");

                if let TagPath::Array { base_path, indices } = *base_path {
                    assert_eq!(indices, vec![2]);

                    if let TagPath::Program {
                        program_name,
                        tag_name,
                    } = *base_path
                    {
                        assert_eq!(program_name, "Safety");
                        assert_eq!(tag_name, "Devices");
                    } else {
                        panic!("Expected Program path");
                    }
                } else {
                    panic!("Expected Array path");
                }
            } else {
                panic!("Expected Member path");
            }
        } else {
            panic!("Expected Bit path");
        }
    }

    #[test]
    fn test_cip_path_generation() {
        let path = TagPath::parse("MyTag").unwrap();
        let cip_path = path.to_cip_path().unwrap();

        assert_eq!(cip_path[0], 0x91);
        assert_eq!(cip_path[1], 5);
        assert_eq!(&cip_path[2..7], b"MyTag");
        assert_eq!(cip_path[7], 0x00);
    }

    #[test]
    fn test_base_tag_name() {
        let path = TagPath::parse("Program:Main.MotorData[1].Speed.15").unwrap();
        assert_eq!(path.base_tag_name(), "MotorData");
    }

    #[test]
    fn test_invalid_paths() {
        assert!(TagPath::parse("").is_err());
        assert!(TagPath::parse("Program:").is_err());
        assert!(TagPath::parse("MyArray[").is_err());
        assert!(TagPath::parse("MyArray]").is_err());
        assert!(TagPath::parse("MyTag.").is_err());
    }

    #[test]
    fn classifies_simple_array_element() {
        let r = classify_array_element("MyArray[5]").unwrap();
        assert_eq!(r.base, "MyArray");
        assert_eq!(r.index, 5);
    }

    #[test]
    fn rejects_bit_access_as_array_element() {
        // "Tag.15" never goes through classify_array_element (no bracket at
        // all) but a lookalike bracketed bit mask must not be misread either.
        assert!(classify_array_element("StatusWord.15").is_none());
    }

    #[test]
    fn rejects_multi_dimensional_index() {
        assert!(classify_array_element("Matrix[1,2,3]").is_none());
    }

    #[test]
    fn rejects_non_integer_index() {
        assert!(classify_array_element("MyArray[abc]").is_none());
    }

    #[test]
    fn rejects_trailing_qualifier_after_index() {
        // Not produced by the current grammar (brackets must be the final
        // qualifier to pass `ends_with(']')`), but guard the boundary anyway.
        assert!(classify_array_element("MyArray[5].Member").is_none());
    }
}
