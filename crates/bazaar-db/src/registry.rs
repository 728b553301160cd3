//! Engine Registry.
//!
//! A single registration slot owned by the application root and handed to
//! whatever needs persistence. The first registration wins for the
//! lifetime of the registry; later attempts fail without replacing it.

use std::sync::OnceLock;

use crate::collection::Collection;
use crate::engine::Engine;
use crate::error::DbError;

/// Holds the one active [`Engine`].
#[derive(Debug, Default)]
pub struct EngineRegistry {
    slot: OnceLock<Engine>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the process engine.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::EngineAlreadyRegistered`] if an engine is already
    /// registered. The registered engine is kept.
    pub fn register(&self, engine: Engine) -> Result<(), DbError> {
        let name = engine.name();
        match self.slot.set(engine) {
            Ok(()) => {
                tracing::info!(engine = name, "Engine registered");
                Ok(())
            }
            Err(rejected) => {
                let registered = self.slot.get().map_or("unknown", Engine::name);
                tracing::error!(registered, rejected = rejected.name(), "Engine already registered");
                Err(DbError::EngineAlreadyRegistered {
                    registered,
                    rejected: rejected.name(),
                })
            }
        }
    }

    /// Whether an engine is registered.
    pub fn is_registered(&self) -> bool {
        self.slot.get().is_some()
    }

    /// The registered engine.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::EngineUnavailable`] before registration.
    pub fn engine(&self) -> Result<&Engine, DbError> {
        self.slot.get().ok_or(DbError::EngineUnavailable)
    }

    /// Collection of the registered engine, created if absent.
    pub async fn get_collection(&self, name: &str) -> Result<Collection, DbError> {
        self.engine()?.get_collection(name).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bazaar_types::IdKind;

    use super::*;
    use crate::dragonfly::DragonflyConfig;
    use crate::sqlite::SqliteConfig;

    #[test]
    fn empty_registry_has_no_engine() {
        let registry = EngineRegistry::new();
        assert!(!registry.is_registered());
        assert!(matches!(registry.engine(), Err(DbError::EngineUnavailable)));
    }

    #[test]
    fn second_registration_fails_and_keeps_the_first() {
        let registry = EngineRegistry::new();
        registry
            .register(Engine::sqlite(SqliteConfig::in_memory(), IdKind::Integer))
            .unwrap();

        let err = registry
            .register(Engine::dragonfly(DragonflyConfig::new("redis://localhost:6379"), IdKind::Integer))
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::EngineAlreadyRegistered {
                registered: "sqlite",
                rejected: "dragonfly"
            }
        ));
        assert_eq!(registry.engine().unwrap().name(), "sqlite");
    }

    #[tokio::test]
    async fn collection_lookup_needs_an_engine() {
        let registry = EngineRegistry::new();
        let err = registry.get_collection("product").await.unwrap_err();
        assert!(matches!(err, DbError::EngineUnavailable));
    }
}
