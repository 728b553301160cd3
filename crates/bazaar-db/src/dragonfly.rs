//! `Dragonfly` (Redis-compatible) document engine.
//!
//! Each collection is one hash of JSON documents keyed by id. There is no
//! server-side query language, so filters compile to a [`Selector`] that is
//! evaluated client side, and sorting, pagination and projection happen in
//! memory after the scan.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{ns}:collections` | Set | Known collection names |
//! | `{ns}:c:{collection}` | Hash | id -> JSON document |
//! | `{ns}:seq:{collection}` | Integer | Last integer id handed out |
//! | `{ns}:meta:{collection}` | Hash | column -> `{"type", "indexed"}` |
//!
//! Column indexes are recorded in the metadata but not materialized.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use fred::prelude::*;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use bazaar_types::{Column, ColumnType, ID_COLUMN, IdKind, Record, Value, new_opaque_id};

use crate::error::DbError;
use crate::filter::Operand;
use crate::lifecycle::{Connector, LinkStatus};
use crate::query::Query;
use crate::schema::{ColumnCatalog, MetadataRow, validate_name};
use crate::selector::{Selector, project, sort_records, window};

/// Engine name used in logs and the registry.
pub const ENGINE_NAME: &str = "dragonfly";

const DEFAULT_NAMESPACE: &str = "bazaar";
const DEFAULT_VALIDATION_INTERVAL_SECS: u64 = 10;

/// Configuration for the `Dragonfly` engine.
#[derive(Debug, Clone)]
pub struct DragonflyConfig {
    /// Redis URL: `redis://host:port` or `redis://host:port/db`.
    pub url: String,
    /// Prefix of every key this engine writes.
    pub namespace: String,
    /// Retry and liveness tick period.
    pub validation_interval: Duration,
}

impl DragonflyConfig {
    /// Create a new configuration from a Redis URL.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            validation_interval: Duration::from_secs(DEFAULT_VALIDATION_INTERVAL_SECS),
        }
    }

    /// Set the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the retry and liveness tick period.
    #[must_use]
    pub const fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }
}

/// Stored form of one column's metadata.
#[derive(Debug, Serialize, Deserialize)]
struct StoredColumn {
    #[serde(rename = "type")]
    kind: String,
    indexed: bool,
}

/// `Dragonfly`-backed engine.
pub struct DragonflyEngine {
    config: DragonflyConfig,
    ids: IdKind,
    url: Mutex<String>,
    client: tokio::sync::RwLock<Option<Client>>,
    catalog: ColumnCatalog,
    status: LinkStatus,
}

impl core::fmt::Debug for DragonflyEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DragonflyEngine")
            .field("namespace", &self.config.namespace)
            .field("ids", &self.ids)
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

impl DragonflyEngine {
    /// Create a disconnected engine.
    pub fn new(config: DragonflyConfig, ids: IdKind) -> Self {
        Self {
            url: Mutex::new(config.url.clone()),
            config,
            ids,
            client: tokio::sync::RwLock::new(None),
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

    async fn client(&self) -> Result<Client, DbError> {
        self.client.read().await.clone().ok_or(DbError::NotConnected(ENGINE_NAME))
    }

    // =========================================================================
    // Keys
    // =========================================================================

    fn collections_key(&self) -> String {
        format!("{}:collections", self.config.namespace)
    }

    fn documents_key(&self, collection: &str) -> String {
        format!("{}:c:{collection}", self.config.namespace)
    }

    fn sequence_key(&self, collection: &str) -> String {
        format!("{}:seq:{collection}", self.config.namespace)
    }

    fn metadata_key(&self, collection: &str) -> String {
        format!("{}:meta:{collection}", self.config.namespace)
    }

    // =========================================================================
    // Documents
    // =========================================================================

    fn decode_document(&self, collection: &str, id: &str, json: &str) -> Result<Record, DbError> {
        let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut record = Record::new();
        for (name, field) in doc {
            let value = match self.catalog.column(collection, &name) {
                Some(column) if column.kind == ColumnType::Id => match Value::from_json(field, &column.kind)? {
                    Value::Int(id) => Value::Text(id.to_string()),
                    other => other,
                },
                Some(column) => Value::from_json(field, &column.kind)?,
                None => Value::from_json_untyped(field),
            };
            record.insert(name, value);
        }
        record.insert(ID_COLUMN.to_owned(), Value::Text(id.to_owned()));
        Ok(record)
    }

    fn encode_document(record: &Record) -> Result<String, DbError> {
        let doc: serde_json::Map<String, serde_json::Value> = record
            .iter()
            .filter(|(name, _)| name.as_str() != ID_COLUMN)
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        Ok(serde_json::to_string(&doc)?)
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Record>, DbError> {
        let client = self.client().await?;
        let docs: HashMap<String, String> = client.hgetall(self.documents_key(collection)).await?;
        let mut records = docs
            .iter()
            .map(|(id, json)| self.decode_document(collection, id, json))
            .collect::<Result<Vec<_>, _>>()?;
        // Hash order is arbitrary; fall back to id order.
        records.sort_by(|a, b| compare_ids(a.get(ID_COLUMN), b.get(ID_COLUMN)));
        Ok(records)
    }

    /// Copy of `query` whose sub-select operands are replaced by the
    /// values they select.
    fn resolve<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Query, DbError>> {
        async move {
            let mut resolved = query.clone();
            for predicate in resolved.filters_mut().predicates_mut() {
                if let Operand::Select(sub) = &predicate.operand {
                    let column = sub.subselect_column().to_owned();
                    let rows = self.matching(sub).await?;
                    let values = rows
                        .into_iter()
                        .filter_map(|mut row| row.remove(&column))
                        .filter(|v| !v.is_null())
                        .map(|v| v.coerce(&predicate.kind))
                        .collect::<Result<Vec<_>, _>>()?;
                    predicate.operand = Operand::List(values);
                }
            }
            Ok(resolved)
        }
        .boxed()
    }

    /// Records matching the query's filters, sorted and windowed but not
    /// projected.
    fn matching<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Vec<Record>, DbError>> {
        async move {
            let mut records = self.filtered(query).await?;
            sort_records(&mut records, query.sort_keys());
            Ok(window(records, query.offset(), query.limit()))
        }
        .boxed()
    }

    async fn filtered(&self, query: &Query) -> Result<Vec<Record>, DbError> {
        let resolved = self.resolve(query).await?;
        let condition = resolved.filters().condition();
        let selector = Selector::compile(condition.as_ref())?;
        tracing::debug!(engine = ENGINE_NAME, collection = query.collection(), selector = %selector.to_json(), "scan");
        let mut records = self.scan(query.collection()).await?;
        records.retain(|record| selector.matches(record));
        Ok(records)
    }

    // =========================================================================
    // Collection operations
    // =========================================================================

    /// Register a collection.
    pub async fn create_collection(&self, name: &str) -> Result<(), DbError> {
        validate_name(name)?;
        let client = self.client().await?;
        let _: u32 = client.sadd(self.collections_key(), name).await?;
        self.catalog.register_collection(name);
        Ok(())
    }

    /// Whether the collection is known.
    pub fn has_collection(&self, name: &str) -> bool {
        self.catalog.has_collection(name)
    }

    /// Load every record matching the query.
    pub async fn load(&self, query: &Query) -> Result<Vec<Record>, DbError> {
        let records = self.matching(query).await?;
        Ok(records
            .into_iter()
            .map(|record| project(record, query.result_columns()))
            .collect())
    }

    /// Visit records matching the query until `visit` returns `false`.
    pub async fn iterate(&self, query: &Query, visit: &mut (dyn FnMut(Record) -> bool + Send)) -> Result<(), DbError> {
        for record in self.load(query).await? {
            if !visit(record) {
                break;
            }
        }
        Ok(())
    }

    /// Load one record by id; filters do not apply.
    pub async fn load_by_id(&self, query: &Query, id: &str) -> Result<Record, DbError> {
        let id = self.normalize_id(id)?;
        let client = self.client().await?;
        let doc: Option<String> = client.hget(self.documents_key(query.collection()), id.as_str()).await?;
        let doc = doc.ok_or_else(|| DbError::RecordNotFound {
            collection: query.collection().to_owned(),
            id: id.clone(),
        })?;
        let record = self.decode_document(query.collection(), &id, &doc)?;
        Ok(project(record, query.result_columns()))
    }

    /// Count records matching the query's filters.
    pub async fn count(&self, query: &Query) -> Result<u64, DbError> {
        let records = self.filtered(query).await?;
        Ok(u64::try_from(records.len()).unwrap_or(u64::MAX))
    }

    /// Distinct values of a column among matching records, in first-seen order.
    pub async fn distinct(&self, query: &Query, column: &str) -> Result<Vec<Value>, DbError> {
        query.column_type(column)?;
        let mut seen: Vec<Value> = Vec::new();
        for mut record in self.filtered(query).await? {
            let value = record.remove(column).unwrap_or_default();
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        Ok(seen)
    }

    /// Insert or merge a record, returning its id.
    pub async fn save(&self, query: &Query, record: &Record) -> Result<String, DbError> {
        let collection = query.collection();
        let mut typed = Record::new();
        for (name, value) in record.iter().filter(|(name, _)| name.as_str() != ID_COLUMN) {
            let kind = query.column_type(name)?;
            typed.insert(name.clone(), value.coerce(&kind)?);
        }

        let client = self.client().await?;
        let key = self.documents_key(collection);
        let id = match record.get(ID_COLUMN) {
            Some(Value::Null) | None => match self.ids {
                IdKind::Integer => {
                    let next: i64 = client.incr(self.sequence_key(collection)).await?;
                    next.to_string()
                }
                IdKind::Opaque => new_opaque_id(),
            },
            Some(id) => self.normalize_id(&id.to_string())?,
        };

        let existing: Option<String> = client.hget(&key, id.as_str()).await?;
        let mut merged = match existing {
            Some(json) => self.decode_document(collection, &id, &json)?,
            None => Record::new(),
        };
        merged.extend(typed);

        let doc = Self::encode_document(&merged)?;
        let _: u32 = client.hset(&key, (id.as_str(), doc.as_str())).await?;
        if self.ids == IdKind::Integer {
            // Keep the sequence ahead of explicitly supplied ids.
            if let Ok(explicit) = id.parse::<i64>() {
                let current: Option<i64> = client.get(self.sequence_key(collection)).await?;
                if current.is_none_or(|c| c < explicit) {
                    let _: () = client
                        .set(self.sequence_key(collection), explicit, None, None, false)
                        .await?;
                }
            }
        }
        Ok(id)
    }

    /// Delete records matching the query's filters.
    pub async fn delete(&self, query: &Query) -> Result<u64, DbError> {
        let ids: Vec<String> = self
            .filtered(query)
            .await?
            .into_iter()
            .filter_map(|record| record.get(ID_COLUMN).map(ToString::to_string))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let client = self.client().await?;
        let removed: u64 = client.hdel(self.documents_key(query.collection()), ids).await?;
        Ok(removed)
    }

    /// Delete one record by id.
    pub async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, DbError> {
        let id = self.normalize_id(id)?;
        let client = self.client().await?;
        let removed: u32 = client.hdel(self.documents_key(collection), id.as_str()).await?;
        Ok(removed > 0)
    }

    /// Register a column in the metadata hash.
    pub async fn add_column(&self, collection: &str, column: Column) -> Result<(), DbError> {
        validate_name(&column.name)?;
        if self.catalog.column(collection, &column.name).is_some() {
            return Err(DbError::ColumnExists {
                collection: collection.to_owned(),
                column: column.name,
            });
        }
        let stored = serde_json::to_string(&StoredColumn {
            kind: column.kind.to_string(),
            indexed: column.indexed,
        })?;
        let client = self.client().await?;
        let _: u32 = client
            .hset(self.metadata_key(collection), (column.name.as_str(), stored.as_str()))
            .await?;
        tracing::info!(engine = ENGINE_NAME, collection, column = %column.name, kind = %column.kind, "Column added");
        self.catalog.insert(collection, column);
        Ok(())
    }

    /// Unregister a column and strip it from every document.
    pub async fn remove_column(&self, collection: &str, column: &str) -> Result<(), DbError> {
        if column == ID_COLUMN || self.catalog.column(collection, column).is_none() {
            return Err(DbError::UnknownColumn {
                collection: collection.to_owned(),
                column: column.to_owned(),
            });
        }
        let client = self.client().await?;
        let key = self.documents_key(collection);
        let docs: HashMap<String, String> = client.hgetall(&key).await?;
        for (id, json) in docs {
            let mut doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&json)?;
            if doc.remove(column).is_some() {
                let rewritten = serde_json::to_string(&doc)?;
                let _: u32 = client.hset(&key, (id.as_str(), rewritten.as_str())).await?;
            }
        }
        let _: u32 = client.hdel(self.metadata_key(collection), column).await?;
        self.catalog.remove(collection, column);
        tracing::info!(engine = ENGINE_NAME, collection, column, "Column removed");
        Ok(())
    }

    fn normalize_id(&self, id: &str) -> Result<String, DbError> {
        let id = id.trim();
        if self.ids.accepts(id) {
            Ok(id.to_owned())
        } else {
            Err(DbError::InvalidValue(format!("{id:?} is not a valid {} id", self.ids)))
        }
    }

    async fn load_catalog(&self) -> Result<(), DbError> {
        let client = self.client().await?;
        let collections: Vec<String> = client.smembers(self.collections_key()).await?;
        let mut rows = Vec::new();
        for collection in &collections {
            let columns: HashMap<String, String> = client.hgetall(self.metadata_key(collection)).await?;
            for (column, json) in columns {
                let stored: StoredColumn = serde_json::from_str(&json)?;
                rows.push(MetadataRow {
                    collection: collection.clone(),
                    column,
                    kind: stored.kind,
                    indexed: stored.indexed,
                });
            }
        }
        tracing::info!(engine = ENGINE_NAME, collections = collections.len(), columns = rows.len(), "Column catalog loaded");
        self.catalog.load(collections, rows);
        Ok(())
    }
}

/// Order ids numerically when both are integers, else as text.
fn compare_ids(a: Option<&Value>, b: Option<&Value>) -> core::cmp::Ordering {
    let text = |v: Option<&Value>| v.map(ToString::to_string).unwrap_or_default();
    let (a, b) = (text(a), text(b));
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(&b),
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

impl Connector for DragonflyEngine {
    type Params = String;

    fn engine_name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn connection_params(&self) -> String {
        self.url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn validation_interval(&self) -> Duration {
        self.config.validation_interval
    }

    fn status(&self) -> &LinkStatus {
        &self.status
    }

    async fn connect(&self, url: &String) -> Result<(), DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await.map_err(|e| DbError::connect(ENGINE_NAME, e))?;

        tracing::info!(namespace = %self.config.namespace, "Connected to Dragonfly");
        let stale = self.client.write().await.replace(client);
        if let Some(stale) = stale {
            if let Err(err) = stale.quit().await {
                tracing::debug!(error = %err, "Closing stale Dragonfly client failed");
            }
        }
        Ok(())
    }

    async fn after_connect(&self, _url: &String) -> Result<(), DbError> {
        self.load_catalog().await
    }

    async fn ping(&self) -> Result<(), DbError> {
        let client = self.client().await?;
        let _: u32 = client.exists(self.collections_key()).await?;
        Ok(())
    }

    async fn reconnect(&self, url: &String) -> Result<(), DbError> {
        let stale = self.client.write().await.take();
        if let Some(stale) = stale {
            if let Err(err) = stale.quit().await {
                tracing::debug!(error = %err, "Closing stale Dragonfly client failed");
            }
        }
        self.connect(url).await
    }
}
