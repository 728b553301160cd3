//! Engine dispatch.
//!
//! The backends expose the same inherent async API but `async fn` in traits
//! is not object safe, so the active backend is carried as an enum and every
//! call is forwarded with `dispatch!`.

use std::sync::Arc;

use bazaar_types::IdKind;

use crate::collection::Collection;
use crate::dragonfly::{DragonflyConfig, DragonflyEngine};
use crate::error::DbError;
use crate::lifecycle::{ConnectionManager, Connector as _, LinkState};
use crate::postgres::{PostgresConfig, PostgresEngine};
use crate::ready::ReadyBroadcast;
use crate::schema::ColumnCatalog;
use crate::sqlite::{SqliteConfig, SqliteEngine};

/// Forward an expression to whichever backend `$engine` holds.
macro_rules! dispatch {
    ($engine:expr, $backend:ident => $call:expr) => {
        match $engine {
            $crate::engine::Engine::Postgres($backend) => $call,
            $crate::engine::Engine::Sqlite($backend) => $call,
            $crate::engine::Engine::Dragonfly($backend) => $call,
        }
    };
}

pub(crate) use dispatch;

/// The active persistence backend.
#[derive(Debug, Clone)]
pub enum Engine {
    /// `PostgreSQL` via `sqlx`.
    Postgres(Arc<PostgresEngine>),
    /// `SQLite` via `sqlx`.
    Sqlite(Arc<SqliteEngine>),
    /// `Dragonfly`/Redis via `fred`.
    Dragonfly(Arc<DragonflyEngine>),
}

impl Engine {
    /// `PostgreSQL` engine, not yet connected.
    pub fn postgres(config: PostgresConfig, ids: IdKind) -> Self {
        Self::Postgres(Arc::new(PostgresEngine::new(config, ids)))
    }

    /// `SQLite` engine, not yet connected.
    pub fn sqlite(config: SqliteConfig, ids: IdKind) -> Self {
        Self::Sqlite(Arc::new(SqliteEngine::new(config, ids)))
    }

    /// `Dragonfly` engine, not yet connected.
    pub fn dragonfly(config: DragonflyConfig, ids: IdKind) -> Self {
        Self::Dragonfly(Arc::new(DragonflyEngine::new(config, ids)))
    }

    /// Backend name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => crate::postgres::ENGINE_NAME,
            Self::Sqlite(_) => crate::sqlite::ENGINE_NAME,
            Self::Dragonfly(_) => crate::dragonfly::ENGINE_NAME,
        }
    }

    /// Whether the backend currently has a live connection.
    pub fn is_connected(&self) -> bool {
        dispatch!(self, e => e.is_connected())
    }

    /// Column metadata shared by every collection of this engine.
    pub fn catalog(&self) -> &ColumnCatalog {
        dispatch!(self, e => e.catalog())
    }

    /// Create a collection if it does not exist.
    pub async fn create_collection(&self, name: &str) -> Result<(), DbError> {
        dispatch!(self, e => e.create_collection(name).await)?;
        tracing::debug!(engine = self.name(), collection = name, "Collection ready");
        Ok(())
    }

    /// Whether a collection exists.
    pub fn has_collection(&self, name: &str) -> bool {
        dispatch!(self, e => e.has_collection(name))
    }

    /// Every known collection, sorted.
    pub fn collections(&self) -> Vec<String> {
        self.catalog().collections()
    }

    /// Fresh collection handle, creating the collection if it is absent.
    pub async fn get_collection(&self, name: &str) -> Result<Collection, DbError> {
        if !self.has_collection(name) {
            self.create_collection(name).await?;
        }
        Ok(Collection::new(self.clone(), name))
    }

    /// Wrap the backend in a lifecycle manager that fires `ready` after the
    /// first successful connect.
    pub fn supervise(&self, ready: Arc<ReadyBroadcast>) -> Supervisor {
        match self {
            Self::Postgres(e) => Supervisor::Postgres(Arc::new(ConnectionManager::new(Arc::clone(e), ready))),
            Self::Sqlite(e) => Supervisor::Sqlite(Arc::new(ConnectionManager::new(Arc::clone(e), ready))),
            Self::Dragonfly(e) => Supervisor::Dragonfly(Arc::new(ConnectionManager::new(Arc::clone(e), ready))),
        }
    }
}

/// Lifecycle manager of the active backend. Dropping it stops the liveness
/// loop.
#[derive(Debug, Clone)]
pub enum Supervisor {
    /// Manages a [`PostgresEngine`].
    Postgres(Arc<ConnectionManager<PostgresEngine>>),
    /// Manages a [`SqliteEngine`].
    Sqlite(Arc<ConnectionManager<SqliteEngine>>),
    /// Manages a [`DragonflyEngine`].
    Dragonfly(Arc<ConnectionManager<DragonflyEngine>>),
}

impl Supervisor {
    /// Connect, retrying until the backend answers, then fire the ready
    /// broadcast.
    pub async fn connect(&self) -> Result<(), DbError> {
        match self {
            Self::Postgres(m) => m.connect().await,
            Self::Sqlite(m) => m.connect().await,
            Self::Dragonfly(m) => m.connect().await,
        }
    }

    /// Run [`connect`](Self::connect) in the background.
    pub fn connect_async(&self) {
        match self {
            Self::Postgres(m) => m.connect_async(),
            Self::Sqlite(m) => m.connect_async(),
            Self::Dragonfly(m) => m.connect_async(),
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        match self {
            Self::Postgres(m) => m.connector().status().state(),
            Self::Sqlite(m) => m.connector().status().state(),
            Self::Dragonfly(m) => m.connector().status().state(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_backend() {
        let sqlite = Engine::sqlite(SqliteConfig::in_memory(), IdKind::Integer);
        let pg = Engine::postgres(PostgresConfig::new("postgres://localhost/shop"), IdKind::Opaque);
        let df = Engine::dragonfly(DragonflyConfig::new("redis://localhost:6379"), IdKind::Integer);
        assert_eq!(sqlite.name(), "sqlite");
        assert_eq!(pg.name(), "postgres");
        assert_eq!(df.name(), "dragonfly");
        assert!(!sqlite.is_connected());
    }

    #[tokio::test]
    async fn supervised_engine_reaches_connected() {
        let engine = Engine::sqlite(SqliteConfig::in_memory(), IdKind::Integer);
        let ready = Arc::new(ReadyBroadcast::new());
        let supervisor = engine.supervise(Arc::clone(&ready));
        assert_eq!(supervisor.state(), LinkState::Disconnected);

        supervisor.connect().await.unwrap();
        assert_eq!(supervisor.state(), LinkState::Connected);
        assert!(ready.has_fired());

        let products = engine.get_collection("product").await.unwrap();
        assert_eq!(products.name(), "product");
        assert!(engine.has_collection("product"));
        assert!(engine.collections().contains(&"product".to_owned()));
    }
}
