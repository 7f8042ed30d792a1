//! Keel apply: managed-fields ownership (server-side apply) and change summaries.

#![forbid(unsafe_code)]

mod diff;
mod fields;
mod merge;

pub use diff::{diff_summary, json_node_budget_exceeded, max_object_nodes, strip_noisy, DiffSummary};
pub use fields::{extract, FieldManager, FieldPath, FieldsV1, PathElement, FIELDS_TYPE_V1, MERGE_KEY};
pub use merge::{merge, merge_objects, purge_removed, Conflict, FieldConflict, MergeOutcome};
