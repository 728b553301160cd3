//! Storefront schema bootstrap.
//!
//! Registered as a ready callback: once the database is reachable, every
//! storefront collection is created and any missing column is added.
//! Existing columns are left alone, so the bootstrap is safe to run on
//! every start.

use std::sync::Arc;

use bazaar_db::{ColumnType, DbError, Engine, ReadyBroadcast};

/// A column the storefront expects.
struct ColumnDef {
    name: &'static str,
    kind: ColumnType,
    indexed: bool,
}

const fn col(name: &'static str, kind: ColumnType, indexed: bool) -> ColumnDef {
    ColumnDef { name, kind, indexed }
}

fn storefront_schema() -> Vec<(&'static str, Vec<ColumnDef>)> {
    vec![
        (
            "category",
            vec![
                col("parent_id", ColumnType::Id, true),
                col("path", ColumnType::Text, true),
                col("name", ColumnType::Text, true),
            ],
        ),
        (
            "category_product",
            vec![
                col("category_id", ColumnType::Id, true),
                col("product_id", ColumnType::Id, true),
            ],
        ),
        (
            "cms_page",
            vec![
                col("enabled", ColumnType::Boolean, true),
                col("identifier", ColumnType::Varchar(None), true),
                col("title", ColumnType::Varchar(None), false),
                col("content", ColumnType::Text, false),
                col("created_at", ColumnType::DateTime, false),
                col("updated_at", ColumnType::DateTime, false),
            ],
        ),
        (
            "coupon_discounts",
            vec![
                col("code", ColumnType::Varchar(None), true),
                col("name", ColumnType::Varchar(None), false),
                col("amount", ColumnType::Decimal(None), false),
                col("percent", ColumnType::Decimal(None), false),
                col("times", ColumnType::Integer, false),
                col("since", ColumnType::DateTime, false),
                col("until", ColumnType::DateTime, false),
                col("limits", ColumnType::Json, false),
                col("target", ColumnType::Varchar(None), false),
            ],
        ),
    ]
}

/// Create the storefront collections and add missing columns.
///
/// Returns the number of columns added.
pub async fn ensure_schema(engine: &Engine) -> Result<usize, DbError> {
    let mut added: usize = 0;
    for (name, columns) in storefront_schema() {
        let collection = engine.get_collection(name).await?;
        for def in columns {
            if collection.has_column(def.name) {
                continue;
            }
            collection.add_column(def.name, def.kind, def.indexed).await?;
            added = added.saturating_add(1);
        }
    }
    tracing::info!(engine = engine.name(), added, "Storefront schema ready");
    Ok(added)
}

/// Run [`ensure_schema`] when `ready` fires.
pub fn register(ready: &Arc<ReadyBroadcast>, engine: Engine) -> bool {
    ready.on_ready(move || async move { ensure_schema(&engine).await.map(|_| ()) })
}
