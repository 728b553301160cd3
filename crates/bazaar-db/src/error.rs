//! Error types for the persistence layer.
//!
//! Caller mistakes (unknown columns, operators or types) surface
//! synchronously and are never retried. Driver failures carry the generated
//! statement that triggered them.

use bazaar_types::TypeError;

/// Errors that can occur in the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The column is not registered on the collection.
    #[error("unknown column {column} in collection {collection}")]
    UnknownColumn {
        /// Collection the lookup ran against.
        collection: String,
        /// Column that was not found.
        column: String,
    },

    /// The filter operator is not supported, or not for this column/operand.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// The logical type name is not recognized.
    #[error("unknown column type: {0}")]
    UnknownType(String),

    /// A filter group parent does not exist.
    #[error("unknown filter group: {0}")]
    UnknownFilterGroup(String),

    /// An existing filter group was asked to move under another parent.
    #[error("filter group {group} already has a different parent than {parent}")]
    FilterGroupParent {
        /// Group being set up.
        group: String,
        /// Requested parent.
        parent: String,
    },

    /// An engine is already registered for this process.
    #[error("engine already registered: {registered} (rejected {rejected})")]
    EngineAlreadyRegistered {
        /// Name of the engine holding the slot.
        registered: &'static str,
        /// Name of the engine that tried to register.
        rejected: &'static str,
    },

    /// No engine has been registered.
    #[error("no database engine registered")]
    EngineUnavailable,

    /// Connecting to the backend failed. Always retried by the lifecycle manager.
    #[error("{engine} connection failed: {source}")]
    ConnectFailure {
        /// Engine that failed to connect.
        engine: &'static str,
        /// Driver error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A generated statement failed in the driver.
    #[error("query failed: {source} (statement: {statement})")]
    QueryFailure {
        /// Statement as sent to the backend.
        statement: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// The engine has no live connection.
    #[error("{0} is not connected")]
    NotConnected(&'static str),

    /// A collection or column name is not a safe identifier.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// The column already exists on the collection.
    #[error("column {column} already exists in collection {collection}")]
    ColumnExists {
        /// Collection name.
        collection: String,
        /// Column name.
        column: String,
    },

    /// A value cannot be stored in, or compared against, its column.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// No record has the requested id.
    #[error("record {id} not found in collection {collection}")]
    RecordNotFound {
        /// Collection name.
        collection: String,
        /// Requested id.
        id: String,
    },

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TypeError> for DbError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::UnknownType(name) => Self::UnknownType(name),
            conversion @ TypeError::Conversion { .. } => Self::InvalidValue(conversion.to_string()),
        }
    }
}

impl DbError {
    /// Wrap a driver error raised while establishing a connection.
    pub fn connect(engine: &'static str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::ConnectFailure {
            engine,
            source: Box::new(source),
        }
    }
}
