//! redb table definitions for the persistence file.

use redb::TableDefinition;

/// Metric groups keyed by the canonical JSON form of their grouping key.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
