//! redb table definitions for the coordinator store.
//!
//! The store is a single flat namespace: `&str` keys laid out as
//! slash-delimited paths (see [`crate::keys`]) and raw `&[u8]` values.
//! Prefix scans are range scans over this table.

use redb::TableDefinition;

/// Every coordinator key, keyed by its full path.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
