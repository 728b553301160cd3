//! Collection handle: query state bound to an engine.
//!
//! Filter, sort, projection and pagination mutators only touch the local
//! [`Query`] and validate against the engine's column catalog. The async
//! operations forward the query to the backend. Query state is never reset
//! implicitly between operations.

use bazaar_types::{Column, ColumnType, Record, Value};

use crate::engine::{Engine, dispatch};
use crate::error::DbError;
use crate::filter::Operand;
use crate::query::Query;

/// A named record set of the active engine, with its own query state.
#[derive(Debug, Clone)]
pub struct Collection {
    engine: Engine,
    query: Query,
}

impl Collection {
    pub(crate) fn new(engine: Engine, name: &str) -> Self {
        let query = Query::new(name, engine.catalog().clone());
        Self { engine, query }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        self.query.collection()
    }

    /// Engine the collection belongs to.
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Current query state.
    pub const fn query(&self) -> &Query {
        &self.query
    }

    // =========================================================================
    // Filters
    // =========================================================================

    /// Add a filter to the default group.
    ///
    /// `operator` is one of `=`, `!=`, `<>`, `>`, `>=`, `<`, `<=`, `like`,
    /// `in`. The operand is coerced to the column's type immediately.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownColumn`], [`DbError::UnsupportedOperator`]
    /// or [`DbError::InvalidValue`].
    pub fn add_filter(&mut self, column: &str, operator: &str, value: impl Into<Operand>) -> Result<(), DbError> {
        self.query.add_filter(column, operator, value)
    }

    /// Add a filter that [`clear_filters`](Self::clear_filters) keeps.
    pub fn add_static_filter(&mut self, column: &str, operator: &str, value: impl Into<Operand>) -> Result<(), DbError> {
        self.query.add_static_filter(column, operator, value)
    }

    /// Add a filter to a named group.
    pub fn add_group_filter(
        &mut self,
        group: &str,
        column: &str,
        operator: &str,
        value: impl Into<Operand>,
    ) -> Result<(), DbError> {
        self.query.add_group_filter(group, column, operator, value)
    }

    /// Create a filter group, or change the join of an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownFilterGroup`] when `parent` does not exist
    /// and [`DbError::FilterGroupParent`] when an existing group would move.
    pub fn setup_filter_group(&mut self, name: &str, or: bool, parent: Option<&str>) -> Result<(), DbError> {
        self.query.setup_filter_group(name, or, parent)
    }

    /// Remove a filter group and everything nested under it.
    pub fn remove_filter_group(&mut self, name: &str) -> bool {
        self.query.remove_filter_group(name)
    }

    /// Drop all filters except static ones.
    pub fn clear_filters(&mut self) {
        self.query.clear_filters();
    }

    // =========================================================================
    // Sort, projection, pagination
    // =========================================================================

    /// Append a sort key.
    pub fn add_sort(&mut self, column: &str, descending: bool) -> Result<(), DbError> {
        self.query.add_sort(column, descending)
    }

    /// Remove every sort key.
    pub fn clear_sort(&mut self) {
        self.query.clear_sort();
    }

    /// Restrict returned columns. `_id` is always returned; an empty list
    /// returns everything.
    pub fn set_result_columns<S: AsRef<str>>(&mut self, columns: &[S]) -> Result<(), DbError> {
        self.query.set_result_columns(columns)
    }

    /// Set offset and limit; a zero limit is unbounded.
    pub const fn set_limit(&mut self, offset: u64, limit: u64) {
        self.query.set_limit(offset, limit);
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Load every matching record.
    pub async fn load(&self) -> Result<Vec<Record>, DbError> {
        dispatch!(&self.engine, e => e.load(&self.query).await)
    }

    /// Stream matching records into `visit` until it returns `false`.
    pub async fn iterate<F>(&self, mut visit: F) -> Result<(), DbError>
    where
        F: FnMut(Record) -> bool + Send,
    {
        dispatch!(&self.engine, e => e.iterate(&self.query, &mut visit).await)
    }

    /// Load one record by id, ignoring filters.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::RecordNotFound`] when no record has the id.
    pub async fn load_by_id(&self, id: &str) -> Result<Record, DbError> {
        dispatch!(&self.engine, e => e.load_by_id(&self.query, id).await)
    }

    /// Insert a record, or update it when it carries an existing `_id`.
    /// Returns the record's id.
    pub async fn save(&self, record: &Record) -> Result<String, DbError> {
        dispatch!(&self.engine, e => e.save(&self.query, record).await)
    }

    /// Delete every matching record, returning how many were removed.
    pub async fn delete(&self) -> Result<u64, DbError> {
        dispatch!(&self.engine, e => e.delete(&self.query).await)
    }

    /// Delete one record by id. Returns whether it existed.
    pub async fn delete_by_id(&self, id: &str) -> Result<bool, DbError> {
        dispatch!(&self.engine, e => e.delete_by_id(self.name(), id).await)
    }

    /// Number of matching records; sort and pagination are ignored.
    pub async fn count(&self) -> Result<u64, DbError> {
        dispatch!(&self.engine, e => e.count(&self.query).await)
    }

    /// Distinct values of `column` among matching records.
    pub async fn distinct(&self, column: &str) -> Result<Vec<Value>, DbError> {
        dispatch!(&self.engine, e => e.distinct(&self.query, column).await)
    }

    // =========================================================================
    // Columns
    // =========================================================================

    /// Every column, `_id` first.
    pub fn list_columns(&self) -> Vec<Column> {
        self.engine.catalog().columns(self.name())
    }

    /// Whether the column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.engine.catalog().column(self.name(), column).is_some()
    }

    /// Logical type of a column.
    pub fn get_column_type(&self, column: &str) -> Result<ColumnType, DbError> {
        self.query.column_type(column)
    }

    /// Add a column. Indexed columns get a native index where the backend
    /// supports one.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ColumnExists`] if the column is already defined.
    pub async fn add_column(&self, column: &str, kind: ColumnType, indexed: bool) -> Result<(), DbError> {
        let column = Column::new(column, kind, indexed);
        dispatch!(&self.engine, e => e.add_column(self.name(), column).await)
    }

    /// Remove a column and its data.
    pub async fn remove_column(&self, column: &str) -> Result<(), DbError> {
        dispatch!(&self.engine, e => e.remove_column(self.name(), column).await)
    }
}

/// A collection used as an `IN` operand becomes a sub-select over its
/// current filters, selecting its first result column (or `_id`).
impl From<&Collection> for Operand {
    fn from(collection: &Collection) -> Self {
        Self::Select(Box::new(collection.query.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::filter::Operator;
    use crate::sqlite::SqliteConfig;
    use bazaar_types::IdKind;

    fn collection() -> Collection {
        let engine = Engine::sqlite(SqliteConfig::in_memory(), IdKind::Integer);
        engine.catalog().register_collection("product");
        engine
            .catalog()
            .insert("product", Column::new("sku", ColumnType::Varchar(Some(64)), true));
        Collection::new(engine, "product")
    }

    #[test]
    fn columns_come_from_the_engine_catalog() {
        let products = collection();
        let names: Vec<String> = products.list_columns().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["_id".to_owned(), "sku".to_owned()]);
        assert!(products.has_column("sku"));
        assert!(!products.has_column("price"));
        assert_eq!(products.get_column_type("sku").unwrap(), ColumnType::Varchar(Some(64)));
        assert!(matches!(
            products.get_column_type("price"),
            Err(DbError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn collections_become_subselects() {
        let mut products = collection();
        products.set_result_columns(&["sku"]).unwrap();
        let operand = Operand::from(&products);
        assert!(matches!(&operand, Operand::Select(q) if q.subselect_column() == "sku"));

        let mut other = collection();
        other.add_filter("sku", "in", &products).unwrap();
        let predicates = other.query().filters().condition();
        assert!(predicates.is_some());
    }

    #[test]
    fn filters_are_validated_locally() {
        let mut products = collection();
        assert!(matches!(
            products.add_filter("sku", "~", "x"),
            Err(DbError::UnsupportedOperator(_))
        ));
        products.add_static_filter("sku", "!=", "retired").unwrap();
        products.add_filter("sku", "like", "shoe").unwrap();
        products.clear_filters();
        let remaining = products.query().filters().condition();
        assert!(matches!(
            remaining,
            Some(crate::filter::Condition::Predicate(p)) if p.op == Operator::NotEq
        ));
    }
}
