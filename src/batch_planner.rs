//! Groups a poll group's tag expressions into a read plan that minimizes CIP
//! round trips (§4.2).
//!
//! A tag expression referencing a single-dimension array element (`Base[i]`)
//! is classified against every other tag in the group that shares the same
//! array base. The request extent `N` is always `max_subscribed_index + 1` —
//! the planner only ever asks for as much of the array as something in the
//! group actually references.

use crate::config::ArrayMode;
use crate::tag_path::classify_array_element;
use std::collections::HashMap;

/// One entry of a read plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanEntry {
    /// Read a single tag expression as-is; maps back to one tag_id.
    Scalar { tag_id: u64, tag_name: String },
    /// Read `extent` contiguous elements of `base` starting at 0, then
    /// distribute the elements each `tag_id` asked for out of the result.
    FullArray {
        base: String,
        extent: u32,
        members: Vec<(u64, u32)>,
    },
    /// Read each referenced element of `base` individually; used when the
    /// batch heuristic doesn't trigger.
    SparseElements { members: Vec<(u64, String, u32)> },
}

/// A single poll iteration's read plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan {
    pub entries: Vec<PlanEntry>,
}

struct ArrayGroup {
    members: Vec<(u64, u32)>,
}

/// Builds a read plan for one poll iteration of a group's tag list.
///
/// `tags` is `(tag_id, tag_expression)` pairs.
pub fn plan_reads(tags: &[(u64, String)], array_mode: ArrayMode) -> ReadPlan {
    let mut scalars: Vec<(u64, String)> = Vec::new();
    let mut array_groups: HashMap<String, ArrayGroup> = HashMap::new();
    let mut group_order: Vec<String> = Vec::new();

    for (tag_id, expr) in tags {
        match classify_array_element(expr) {
            Some(elem) => {
                let group = array_groups.entry(elem.base.clone()).or_insert_with(|| {
                    group_order.push(elem.base.clone());
                    ArrayGroup {
                        members: Vec::new(),
                    }
                });
                group.members.push((*tag_id, elem.index));
            }
            None => scalars.push((*tag_id, expr.clone())),
        }
    }

    let mut entries = Vec::new();

    for (tag_id, tag_name) in scalars {
        entries.push(PlanEntry::Scalar { tag_id, tag_name });
    }

    for base in group_order {
        let group = array_groups.remove(&base).unwrap();
        let s = group.members.len() as u32;
        let m = group.members.iter().map(|(_, i)| *i).max().unwrap_or(0);
        let n = m + 1;

        let use_batch = match array_mode {
            ArrayMode::Individual => false,
            ArrayMode::Batch => s >= 10 || (s as f64) >= 0.1 * (n as f64),
        };

        if use_batch {
            entries.push(PlanEntry::FullArray {
                base,
                extent: n,
                members: group.members,
            });
        } else {
            let members = group
                .members
                .into_iter()
                .map(|(tag_id, index)| (tag_id, format!("{base}[{index}]"), index))
                .collect();
            entries.push(PlanEntry::SparseElements { members });
        }
    }

    ReadPlan { entries }
}
