//! Column metadata shared by every collection of an engine.
//!
//! The reserved metadata collection (`collection`, `column`, `type`,
//! `indexed`) is the single source of truth for column types. Engines load
//! it into a [`ColumnCatalog`] after connecting and keep both in step when
//! columns are added or removed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bazaar_types::{Column, ColumnType, ID_COLUMN};

use crate::error::DbError;

/// Name of the reserved metadata collection.
pub const METADATA_COLLECTION: &str = "collection_column_info";

/// Longest accepted collection or column name.
const MAX_NAME_LEN: usize = 63;

/// One row of the metadata collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    /// Owning collection.
    pub collection: String,
    /// Column name.
    pub column: String,
    /// Canonical logical type name.
    pub kind: String,
    /// Whether the column is indexed.
    pub indexed: bool,
}

/// Reject names that are not plain identifiers.
///
/// Names are quoted when emitted, but restricting them keeps generated
/// index names and document keys predictable.
pub fn validate_name(name: &str) -> Result<(), DbError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid = valid_start
        && name.len() <= MAX_NAME_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidName(name.to_owned()))
    }
}

type Tables = HashMap<String, BTreeMap<String, Column>>;

/// In-memory view of the metadata collection, shared across collections.
#[derive(Debug, Clone, Default)]
pub struct ColumnCatalog {
    tables: Arc<RwLock<Tables>>,
}

impl ColumnCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the catalog with the given collections and metadata rows.
    ///
    /// Rows whose type no longer parses are skipped with a warning.
    pub fn load(&self, collections: impl IntoIterator<Item = String>, rows: Vec<MetadataRow>) {
        let mut tables: Tables = collections
            .into_iter()
            .filter(|name| name != METADATA_COLLECTION)
            .map(|name| (name, BTreeMap::new()))
            .collect();
        for row in rows {
            match ColumnType::parse(&row.kind) {
                Ok(kind) => {
                    tables
                        .entry(row.collection)
                        .or_default()
                        .insert(row.column.clone(), Column::new(row.column, kind, row.indexed));
                }
                Err(err) => tracing::warn!(
                    collection = %row.collection,
                    column = %row.column,
                    error = %err,
                    "Skipping column with unreadable type"
                ),
            }
        }
        *self.write() = tables;
    }

    /// Register a collection with no columns yet. No-op if present.
    pub fn register_collection(&self, collection: &str) {
        self.write().entry(collection.to_owned()).or_default();
    }

    /// Forget a collection and its columns.
    pub fn forget_collection(&self, collection: &str) {
        self.write().remove(collection);
    }

    /// Whether the collection is known.
    pub fn has_collection(&self, collection: &str) -> bool {
        self.read().contains_key(collection)
    }

    /// Names of all known collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Columns of a collection, `_id` first, then by name.
    pub fn columns(&self, collection: &str) -> Vec<Column> {
        let mut columns = vec![Column::new(ID_COLUMN, ColumnType::Id, true)];
        let tables = self.read();
        if let Some(table) = tables.get(collection) {
            columns.extend(table.values().cloned());
        }
        columns
    }

    /// Look up a column; `_id` is always present.
    pub fn column(&self, collection: &str, column: &str) -> Option<Column> {
        if column == ID_COLUMN {
            return Some(Column::new(ID_COLUMN, ColumnType::Id, true));
        }
        self.read().get(collection)?.get(column).cloned()
    }

    /// Logical type of a column, failing with `UnknownColumn`.
    pub fn column_type(&self, collection: &str, column: &str) -> Result<ColumnType, DbError> {
        self.column(collection, column)
            .map(|c| c.kind)
            .ok_or_else(|| DbError::UnknownColumn {
                collection: collection.to_owned(),
                column: column.to_owned(),
            })
    }

    /// Record a new column.
    pub fn insert(&self, collection: &str, column: Column) {
        self.write()
            .entry(collection.to_owned())
            .or_default()
            .insert(column.name.clone(), column);
    }

    /// Drop a column, returning its descriptor if it existed.
    pub fn remove(&self, collection: &str, column: &str) -> Option<Column> {
        self.write().get_mut(collection)?.remove(column)
    }
}
