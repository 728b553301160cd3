//! `SQLite` engine.
//!
//! Same table layout as the `PostgreSQL` engine with `SQLite` storage
//! classes: booleans are `0`/`1`, datetimes are epoch seconds and JSON is
//! text. In-memory databases live exactly as long as their one pooled
//! connection, so the pool is pinned to a single connection that is never
//! reaped.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::DateTime;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as _, Row, SqlitePool, ValueRef};
use tokio::sync::RwLock;

use bazaar_types::{Column, ColumnType, ID_COLUMN, IdKind, Record, Value};

use crate::codec::{Dialect, decode_array, row_count};
use crate::error::DbError;
use crate::lifecycle::{Connector, LinkStatus};
use crate::query::Query;
use crate::schema::{ColumnCatalog, MetadataRow, validate_name};
use crate::sql::SqlCompiler;

/// Engine name used in logs and the registry.
pub const ENGINE_NAME: &str = "sqlite";

const DEFAULT_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_VALIDATION_INTERVAL_SECS: u64 = 10;

/// Configuration for the `SQLite` engine.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// `SQLite` URI, e.g. `sqlite://bazaar.db` or `sqlite::memory:`.
    pub uri: String,
    /// Maximum number of connections for file databases.
    pub max_connections: u32,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Retry and liveness tick period.
    pub validation_interval: Duration,
}

impl SqliteConfig {
    /// Create a new configuration from a URI.
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_owned(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            validation_interval: Duration::from_secs(DEFAULT_VALIDATION_INTERVAL_SECS),
        }
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the retry and liveness tick period.
    #[must_use]
    pub const fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Whether the URI names an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.uri.contains(":memory:") || self.uri.contains("mode=memory")
    }
}

/// `SQLite`-backed engine.
pub struct SqliteEngine {
    config: SqliteConfig,
    compiler: SqlCompiler,
    uri: Mutex<String>,
    pool: RwLock<Option<SqlitePool>>,
    catalog: ColumnCatalog,
    status: LinkStatus,
}

impl core::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("uri", &self.config.uri)
            .field("ids", &self.compiler.ids())
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

impl SqliteEngine {
    /// Create a disconnected engine.
    pub fn new(config: SqliteConfig, ids: IdKind) -> Self {
        Self {
            uri: Mutex::new(config.uri.clone()),
            config,
            compiler: SqlCompiler::new(Dialect::Sqlite, ids),
            pool: RwLock::new(None),
            catalog: ColumnCatalog::new(),
            status: LinkStatus::new(),
        }
    }

    /// Shared column metadata.
    pub const fn catalog(&self) -> &ColumnCatalog {
        &self.catalog
    }

    /// Whether the engine currently has a live connection.
    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    async fn pool(&self) -> Result<SqlitePool, DbError> {
        self.pool.read().await.clone().ok_or(DbError::NotConnected(ENGINE_NAME))
    }

    async fn execute(&self, sql: String) -> Result<u64, DbError> {
        tracing::debug!(engine = ENGINE_NAME, sql = %sql, "execute");
        let pool = self.pool().await?;
        let result = sqlx::query(&sql).persistent(false).execute(&pool).await;
        result
            .map(|done| done.rows_affected())
            .map_err(|source| DbError::QueryFailure { statement: sql, source })
    }

    async fn fetch_all(&self, sql: String) -> Result<Vec<SqliteRow>, DbError> {
        tracing::debug!(engine = ENGINE_NAME, sql = %sql, "fetch");
        let pool = self.pool().await?;
        let result = sqlx::query(&sql).persistent(false).fetch_all(&pool).await;
        result.map_err(|source| DbError::QueryFailure { statement: sql, source })
    }

    async fn fetch_optional(&self, sql: String) -> Result<Option<SqliteRow>, DbError> {
        tracing::debug!(engine = ENGINE_NAME, sql = %sql, "fetch");
        let pool = self.pool().await?;
        let result = sqlx::query(&sql).persistent(false).fetch_optional(&pool).await;
        result.map_err(|source| DbError::QueryFailure { statement: sql, source })
    }

    fn decode_row(&self, collection: &str, row: &SqliteRow) -> Result<Record, DbError> {
        let mut record = Record::new();
        for (index, column) in row.columns().iter().enumerate() {
            let name = column.name();
            let kind = self
                .catalog
                .column(collection, name)
                .map_or(ColumnType::Text, |c| c.kind);
            let value = decode_value(row, index, &kind, self.compiler.ids())
                .map_err(|source| DbError::QueryFailure {
                    statement: format!("decode {collection}.{name}"),
                    source,
                })??;
            record.insert(name.to_owned(), value);
        }
        Ok(record)
    }

    // -------------------------------------------------------------------------
    // Collection operations
    // -------------------------------------------------------------------------

    /// Create the table for a collection if it does not exist.
    pub async fn create_collection(&self, name: &str) -> Result<(), DbError> {
        validate_name(name)?;
        self.execute(self.compiler.create_table(name)).await?;
        self.catalog.register_collection(name);
        Ok(())
    }

    /// Whether the collection is known.
    pub fn has_collection(&self, name: &str) -> bool {
        self.catalog.has_collection(name)
    }

    /// Load every record matching the query.
    pub async fn load(&self, query: &Query) -> Result<Vec<Record>, DbError> {
        let rows = self.fetch_all(self.compiler.select(query)?).await?;
        rows.iter().map(|row| self.decode_row(query.collection(), row)).collect()
    }

    /// Stream records matching the query until `visit` returns `false`.
    pub async fn iterate(&self, query: &Query, visit: &mut (dyn FnMut(Record) -> bool + Send)) -> Result<(), DbError> {
        let sql = self.compiler.select(query)?;
        tracing::debug!(engine = ENGINE_NAME, sql = %sql, "iterate");
        let pool = self.pool().await?;
        let mut rows = sqlx::query(&sql).persistent(false).fetch(&pool);
        loop {
            let row = match rows.try_next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(source) => {
                    return Err(DbError::QueryFailure {
                        statement: sql.clone(),
                        source,
                    });
                }
            };
            if !visit(self.decode_row(query.collection(), &row)?) {
                break;
            }
        }
        Ok(())
    }

    /// Load one record by id; filters do not apply.
    pub async fn load_by_id(&self, query: &Query, id: &str) -> Result<Record, DbError> {
        let row = self.fetch_optional(self.compiler.load_by_id(query, id)?).await?;
        row.map_or_else(
            || {
                Err(DbError::RecordNotFound {
                    collection: query.collection().to_owned(),
                    id: id.to_owned(),
                })
            },
            |row| self.decode_row(query.collection(), &row),
        )
    }

    /// Count records matching the query's filters.
    pub async fn count(&self, query: &Query) -> Result<u64, DbError> {
        let sql = self.compiler.count(query)?;
        let row = self.fetch_optional(sql.clone()).await?;
        let count: i64 = match row {
            Some(row) => row
                .try_get_unchecked("cnt")
                .map_err(|source| DbError::QueryFailure { statement: sql, source })?,
            None => 0,
        };
        row_count(count)
    }

    /// Distinct values of a column among matching records.
    pub async fn distinct(&self, query: &Query, column: &str) -> Result<Vec<Value>, DbError> {
        let kind = query.column_type(column)?;
        let sql = self.compiler.distinct(query, column)?;
        let rows = self.fetch_all(sql.clone()).await?;
        rows.iter()
            .map(|row| {
                decode_value(row, 0, &kind, self.compiler.ids())
                    .map_err(|source| DbError::QueryFailure {
                        statement: sql.clone(),
                        source,
                    })?
            })
            .collect()
    }

    /// Insert or update a record, returning its id.
    pub async fn save(&self, query: &Query, record: &Record) -> Result<String, DbError> {
        let statement = self.compiler.save(query, record)?;
        let row = self.fetch_optional(statement.sql.clone()).await?;
        if let Some(id) = statement.id {
            return Ok(id);
        }
        let row = row.ok_or_else(|| DbError::InvalidValue(format!("insert into {} returned no id", query.collection())))?;
        let id = decode_value(&row, 0, &ColumnType::Id, self.compiler.ids())
            .map_err(|source| DbError::QueryFailure {
                statement: statement.sql,
                source,
            })??;
        Ok(id.to_string())
    }

    /// Delete records matching the query's filters.
    pub async fn delete(&self, query: &Query) -> Result<u64, DbError> {
        self.execute(self.compiler.delete(query)?).await
    }

    /// Delete one record by id.
    pub async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, DbError> {
        Ok(self.execute(self.compiler.delete_by_id(collection, id)?).await? > 0)
    }

    /// Add a column, its index and its metadata row.
    pub async fn add_column(&self, collection: &str, column: Column) -> Result<(), DbError> {
        validate_name(&column.name)?;
        if self.catalog.column(collection, &column.name).is_some() {
            return Err(DbError::ColumnExists {
                collection: collection.to_owned(),
                column: column.name,
            });
        }
        self.execute(self.compiler.add_column(collection, &column.name, &column.kind)).await?;
        if column.indexed {
            self.execute(self.compiler.create_index(collection, &column.name)).await?;
        }
        let row = MetadataRow {
            collection: collection.to_owned(),
            column: column.name.clone(),
            kind: column.kind.to_string(),
            indexed: column.indexed,
        };
        self.execute(self.compiler.insert_metadata(&row)?).await?;
        tracing::info!(engine = ENGINE_NAME, collection, column = %column.name, kind = %column.kind, "Column added");
        self.catalog.insert(collection, column);
        Ok(())
    }

    /// Drop a column, its index and its metadata row.
    pub async fn remove_column(&self, collection: &str, column: &str) -> Result<(), DbError> {
        let existing = self
            .catalog
            .column(collection, column)
            .filter(|c| c.name != ID_COLUMN)
            .ok_or_else(|| DbError::UnknownColumn {
                collection: collection.to_owned(),
                column: column.to_owned(),
            })?;
        if existing.indexed {
            self.execute(self.compiler.drop_index(collection, column)).await?;
        }
        self.execute(self.compiler.drop_column(collection, column)).await?;
        self.execute(self.compiler.delete_metadata(collection, column)?).await?;
        self.catalog.remove(collection, column);
        tracing::info!(engine = ENGINE_NAME, collection, column, "Column removed");
        Ok(())
    }

    async fn load_catalog(&self) -> Result<(), DbError> {
        let sql = "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'".to_owned();
        let tables = self.fetch_all(sql.clone()).await?;
        let collections = tables
            .iter()
            .map(|row| row.try_get_unchecked::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| DbError::QueryFailure { statement: sql, source })?;

        let sql = self.compiler.select_metadata();
        let rows = self.fetch_all(sql.clone()).await?;
        let metadata = rows
            .iter()
            .map(|row| {
                Ok(MetadataRow {
                    collection: row.try_get_unchecked(0)?,
                    column: row.try_get_unchecked(1)?,
                    kind: row.try_get_unchecked(2)?,
                    indexed: row.try_get_unchecked::<i64, _>(3)? != 0,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|source| DbError::QueryFailure { statement: sql, source })?;

        tracing::info!(engine = ENGINE_NAME, collections = collections.len(), columns = metadata.len(), "Column catalog loaded");
        self.catalog.load(collections, metadata);
        Ok(())
    }
}

/// Decode one column of a row. The outer result carries driver errors,
/// the inner one value conversion errors.
fn decode_value(row: &SqliteRow, index: usize, kind: &ColumnType, ids: IdKind) -> Result<Result<Value, DbError>, sqlx::Error> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Ok(Value::Null));
    }
    let value = match kind {
        ColumnType::Id => match ids {
            IdKind::Integer => Value::Text(row.try_get_unchecked::<i64, _>(index)?.to_string()),
            IdKind::Opaque => Value::Text(row.try_get_unchecked::<String, _>(index)?.trim().to_owned()),
        },
        ColumnType::Boolean => Value::Bool(row.try_get_unchecked::<i64, _>(index)? != 0),
        ColumnType::Integer => Value::Int(row.try_get_unchecked(index)?),
        ColumnType::Float => Value::Float(row.try_get_unchecked(index)?),
        ColumnType::Decimal(_) | ColumnType::Money => {
            let text: String = row.try_get_unchecked(index)?;
            let parsed = text
                .parse::<Decimal>()
                .or_else(|_| Decimal::from_scientific(&text))
                .map_err(|err| DbError::InvalidValue(format!("stored decimal {text:?}: {err}")));
            return Ok(parsed.map(Value::Decimal));
        }
        ColumnType::Varchar(_) | ColumnType::Text => Value::Text(row.try_get_unchecked(index)?),
        ColumnType::DateTime => {
            let secs: i64 = row.try_get_unchecked(index)?;
            return Ok(DateTime::from_timestamp(secs, 0)
                .map(Value::DateTime)
                .ok_or_else(|| DbError::InvalidValue(format!("stored timestamp {secs} is out of range"))));
        }
        ColumnType::Json => {
            let text: String = row.try_get_unchecked(index)?;
            return Ok(serde_json::from_str(&text).map(Value::Json).map_err(DbError::from));
        }
        ColumnType::Array(item) => {
            let text: String = row.try_get_unchecked(index)?;
            return Ok(decode_array(&text, item));
        }
    };
    Ok(Ok(value))
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

impl Connector for SqliteEngine {
    type Params = String;

    fn engine_name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn connection_params(&self) -> String {
        self.uri.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn validation_interval(&self) -> Duration {
        self.config.validation_interval
    }

    fn status(&self) -> &LinkStatus {
        &self.status
    }

    async fn connect(&self, uri: &String) -> Result<(), DbError> {
        let options: SqliteConnectOptions = uri
            .parse()
            .map_err(|e: sqlx::Error| DbError::Config(format!("Invalid SQLite URI: {e}")))?;
        let options = options.create_if_missing(true);

        let pool_options = if self.config.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(self.config.max_connections)
        };
        let pool = pool_options
            .acquire_timeout(self.config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| DbError::connect(ENGINE_NAME, e))?;

        tracing::info!(uri = %uri, in_memory = self.config.is_in_memory(), "Connected to SQLite");
        let stale = self.pool.write().await.replace(pool);
        if let Some(stale) = stale {
            stale.close().await;
        }
        Ok(())
    }

    async fn after_connect(&self, _uri: &String) -> Result<(), DbError> {
        self.execute(self.compiler.create_metadata_table()).await?;
        self.load_catalog().await
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.fetch_optional("SELECT count(*) FROM sqlite_master".to_owned())
            .await
            .map(|_| ())
    }

    async fn reconnect(&self, uri: &String) -> Result<(), DbError> {
        if self.config.is_in_memory() && self.pool.read().await.is_some() {
            return Ok(());
        }
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.connect(uri).await
    }
}
