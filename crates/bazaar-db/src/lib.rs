//! Pluggable persistence layer for the Bazaar storefront.
//!
//! Business code works with named [`Collection`]s of typed [`Record`]s and
//! never sees the backend. Exactly one [`Engine`] is active per process,
//! registered in an [`EngineRegistry`] owned by the application root.
//!
//! # Architecture
//!
//! ```text
//! Collection (filters, sort, projection, window)
//!     |
//!     +-- SqlCompiler + Dialect ---> PostgresEngine (sqlx)
//!     |                         +--> SqliteEngine   (sqlx)
//!     |
//!     +-- Selector ----------------> DragonflyEngine (fred)
//!
//! ConnectionManager: connect with retry -> after_connect -> ReadyBroadcast
//!                    -> liveness ping / reconnect
//! ```
//!
//! Column metadata lives in a reserved `collection_column_info` collection
//! on every backend and is cached in a shared [`ColumnCatalog`].
//!
//! # Modules
//!
//! - [`codec`] -- native types and literal encoding per SQL dialect
//! - [`filter`] -- operators, predicates and the filter group forest
//! - [`query`] -- per-collection query state
//! - [`sql`] -- SQL statement compilation
//! - [`selector`] -- client-side document selectors
//! - [`schema`] -- column catalog and the metadata collection
//! - [`collection`] -- the collection surface used by business code
//! - [`postgres`], [`sqlite`], [`dragonfly`] -- backends
//! - [`engine`] -- backend dispatch and supervision
//! - [`lifecycle`] -- connect, retry, liveness and reconnect
//! - [`ready`] -- one-shot "database ready" callbacks
//! - [`registry`] -- the single engine slot
//! - [`error`] -- shared error type

pub mod codec;
pub mod collection;
pub mod dragonfly;
pub mod engine;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod postgres;
pub mod query;
pub mod ready;
pub mod registry;
pub mod schema;
pub mod selector;
pub mod sql;
pub mod sqlite;

// Re-export primary types for convenience.
pub use bazaar_types::{Column, ColumnType, IdKind, Record, Value};
pub use collection::Collection;
pub use dragonfly::{DragonflyConfig, DragonflyEngine};
pub use engine::{Engine, Supervisor};
pub use error::DbError;
pub use filter::Operand;
pub use lifecycle::{ConnectionManager, Connector, LinkState, LinkStatus};
pub use postgres::{PostgresConfig, PostgresEngine};
pub use ready::ReadyBroadcast;
pub use registry::EngineRegistry;
pub use schema::{ColumnCatalog, METADATA_COLLECTION};
pub use sqlite::{SqliteConfig, SqliteEngine};
