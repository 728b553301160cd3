//! Per-collection query state: filters, sort keys, projection, pagination.
//!
//! Every mutator validates eagerly. Unknown columns and unsupported
//! operators fail at the call that introduced them, and operands are coerced
//! to the column's logical type right away so engines only ever see
//! well-typed predicates.

use bazaar_types::{ColumnType, ID_COLUMN, Value};

use crate::error::DbError;
use crate::filter::{DEFAULT_GROUP, FilterForest, Join, Operand, Operator, Predicate, STATIC_GROUP};
use crate::schema::ColumnCatalog;

/// One sort key; earlier keys take priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Column to sort on.
    pub column: String,
    /// Logical type of the column.
    pub kind: ColumnType,
    /// Sort descending instead of ascending.
    pub descending: bool,
}

/// Mutable query state of one collection instance.
#[derive(Debug, Clone)]
pub struct Query {
    collection: String,
    catalog: ColumnCatalog,
    filters: FilterForest,
    sort: Vec<SortKey>,
    columns: Vec<String>,
    offset: u64,
    limit: u64,
}

impl Query {
    /// Start an unfiltered query over `collection`.
    pub fn new(collection: impl Into<String>, catalog: ColumnCatalog) -> Self {
        Self {
            collection: collection.into(),
            catalog,
            filters: FilterForest::new(),
            sort: Vec::new(),
            columns: Vec::new(),
            offset: 0,
            limit: 0,
        }
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Column metadata the query validates against.
    pub const fn catalog(&self) -> &ColumnCatalog {
        &self.catalog
    }

    /// Filter forest.
    pub const fn filters(&self) -> &FilterForest {
        &self.filters
    }

    pub(crate) const fn filters_mut(&mut self) -> &mut FilterForest {
        &mut self.filters
    }

    /// Sort keys in priority order.
    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort
    }

    /// Projected columns; empty means all.
    pub fn result_columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows to skip.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Maximum rows to return; zero is unbounded.
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Logical type of a column of this collection.
    pub fn column_type(&self, column: &str) -> Result<ColumnType, DbError> {
        self.catalog.column_type(&self.collection, column)
    }

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    /// Validate and coerce a predicate without adding it.
    pub fn predicate(&self, column: &str, operator: &str, operand: impl Into<Operand>) -> Result<Predicate, DbError> {
        let kind = self.column_type(column)?;
        let op = Operator::parse(operator)?;
        let operand = compile_operand(column, &kind, op, operand.into())?;
        Ok(Predicate {
            column: column.to_owned(),
            kind,
            op,
            operand,
        })
    }

    /// Add a predicate to the default group.
    pub fn add_filter(&mut self, column: &str, operator: &str, operand: impl Into<Operand>) -> Result<(), DbError> {
        self.add_group_filter(DEFAULT_GROUP, column, operator, operand)
    }

    /// Add a predicate to the static group, which `clear_filters` keeps.
    pub fn add_static_filter(&mut self, column: &str, operator: &str, operand: impl Into<Operand>) -> Result<(), DbError> {
        self.add_group_filter(STATIC_GROUP, column, operator, operand)
    }

    /// Add a predicate to a named group, creating it as a parentless AND
    /// group if needed.
    pub fn add_group_filter(
        &mut self,
        group: &str,
        column: &str,
        operator: &str,
        operand: impl Into<Operand>,
    ) -> Result<(), DbError> {
        let predicate = self.predicate(column, operator, operand)?;
        self.filters.push(group, predicate);
        Ok(())
    }

    /// Create or update a filter group.
    pub fn setup_filter_group(&mut self, name: &str, or: bool, parent: Option<&str>) -> Result<(), DbError> {
        self.filters.setup_group(name, Join::from_or(or), parent).map(|_| ())
    }

    /// Remove a filter group and its descendants.
    pub fn remove_filter_group(&mut self, name: &str) -> bool {
        self.filters.remove_group(name)
    }

    /// Drop every filter group except the static one.
    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    // -----------------------------------------------------------------------
    // Sort, projection, pagination
    // -----------------------------------------------------------------------

    /// Append a sort key.
    pub fn add_sort(&mut self, column: &str, descending: bool) -> Result<(), DbError> {
        let kind = self.column_type(column)?;
        self.sort.push(SortKey {
            column: column.to_owned(),
            kind,
            descending,
        });
        Ok(())
    }

    /// Remove all sort keys.
    pub fn clear_sort(&mut self) {
        self.sort.clear();
    }

    /// Restrict the returned columns; an empty list restores all columns.
    pub fn set_result_columns<S: AsRef<str>>(&mut self, columns: &[S]) -> Result<(), DbError> {
        let mut projection = Vec::with_capacity(columns.len());
        for column in columns {
            let column = column.as_ref();
            self.column_type(column)?;
            if !projection.iter().any(|c: &String| c == column) {
                projection.push(column.to_owned());
            }
        }
        self.columns = projection;
        Ok(())
    }

    /// Replace pagination; `limit == 0` means unbounded.
    pub const fn set_limit(&mut self, offset: u64, limit: u64) {
        self.offset = offset;
        self.limit = limit;
    }

    /// Column a sub-select over this query yields: the first projected
    /// column, or `_id`.
    pub fn subselect_column(&self) -> &str {
        self.columns.first().map_or(ID_COLUMN, String::as_str)
    }
}

fn unsupported(op: Operator, column: &str, detail: &str) -> DbError {
    DbError::UnsupportedOperator(format!("{op} on {column}: {detail}"))
}

fn coerce_all(items: Vec<Value>, kind: &ColumnType) -> Result<Vec<Value>, DbError> {
    items
        .iter()
        .map(|v| v.coerce(kind).map_err(DbError::from))
        .collect()
}

fn compile_operand(column: &str, kind: &ColumnType, op: Operator, operand: Operand) -> Result<Operand, DbError> {
    if let Some(item_kind) = kind.element_type() {
        if !matches!(op, Operator::Eq | Operator::NotEq | Operator::In) {
            return Err(unsupported(op, column, "array columns only support membership"));
        }
        let items = match operand {
            Operand::Value(Value::Array(items)) | Operand::List(items) => items,
            Operand::Value(value) => vec![value],
            Operand::Select(_) => return Err(unsupported(op, column, "array columns cannot match a sub-select")),
        };
        return coerce_all(items, item_kind).map(Operand::List);
    }

    match (op, operand) {
        (Operator::In, Operand::Select(sub)) => Ok(Operand::Select(sub)),
        (Operator::In, Operand::List(items) | Operand::Value(Value::Array(items))) => {
            coerce_all(items, kind).map(Operand::List)
        }
        (Operator::In, Operand::Value(value)) => coerce_all(vec![value], kind).map(Operand::List),
        (_, Operand::Select(_)) => Err(unsupported(op, column, "a sub-select needs IN")),
        (_, Operand::List(_)) => Err(unsupported(op, column, "a value list needs IN")),
        (Operator::Like, Operand::Value(value)) => {
            if value.is_null() || matches!(value, Value::Array(_)) {
                return Err(DbError::InvalidValue(format!("LIKE pattern for {column} must be a scalar")));
            }
            let text = value.to_string();
            let pattern = if text.contains('%') { text } else { format!("%{text}%") };
            Ok(Operand::Value(Value::Text(pattern)))
        }
        (op, Operand::Value(value)) => {
            if value.is_null() && !matches!(op, Operator::Eq | Operator::NotEq) {
                return Err(DbError::InvalidValue(format!("NULL cannot be compared with {op}")));
            }
            Ok(Operand::Value(value.coerce(kind)?))
        }
    }
}
