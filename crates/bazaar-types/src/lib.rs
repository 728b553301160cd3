//! Shared logical data model for the Bazaar persistence layer.
//!
//! Every engine speaks in these types: callers describe columns with
//! [`ColumnType`], hand over [`Value`]s and get [`Record`]s back, and the
//! deployment-wide [`IdKind`] decides how identifiers are stored.
//!
//! # Modules
//!
//! - [`column`] -- Logical column types and column descriptors
//! - [`value`] -- The closed value union, coercion and JSON mapping
//! - [`ids`] -- Identifier strategy and opaque id generation
//! - [`error`] -- Type parsing and coercion errors

pub mod column;
pub mod error;
pub mod ids;
pub mod value;

pub use column::{Column, ColumnType};
pub use error::TypeError;
pub use ids::{ID_COLUMN, IdKind, OPAQUE_ID_LEN, new_opaque_id};
pub use value::{Record, Value};
