//! SQLite schema for the build store.
//!
//! Build documents are stored as JSON text, keyed by build id. The revision
//! is kept in its own column so conditional replaces stay a single UPDATE.

use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Build documents
// =============================================================================

const BUILDS_TABLE_V1: Table = Table {
    name: "builds",
    columns: &[
        Column::new("id", SqlType::Text).primary_key(),
        Column::new("revision", SqlType::Integer).non_null(),
        Column::new("document", SqlType::Text).non_null(),
        Column::new("updated_at", SqlType::Text).non_null(),
    ],
    indices: &[("idx_builds_updated_at", "updated_at DESC")],
};

pub const BUILD_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[BUILDS_TABLE_V1],
    migration: None,
}];
