//! Defines the metric keys and labels used throughout stratamap.
//!
//! Using a central module for these constants helps prevent typos and ensures
//! consistency across the codebase.

// --- Metric Keys ---

/// Tracks the total number of user-initiated operations.
///
/// Labels:
/// - `type`: "insert", "get", "remove"
pub const OPERATIONS_TOTAL: &str = "stratamap_operations_total";

/// A gauge tracking the current number of live entries in the map.
pub const ENTRIES: &str = "stratamap_entries";

/// Tracks the total number of nodes physically unlinked from a level list.
/// Each unlink is the retire event after which a node can no longer be
/// reached through the list.
pub const NODES_UNLINKED_TOTAL: &str = "stratamap_nodes_unlinked_total";

/// Tracks the total number of slabs the node arena has allocated.
pub const ARENA_SLABS_TOTAL: &str = "stratamap_arena_slabs_total";

// --- Label Keys ---

pub const LABEL_OPERATION_TYPE: &str = "type";
