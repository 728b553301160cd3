//! Document selectors for engines without a query language.
//!
//! A [`Condition`] compiles into a [`Selector`] tree that is evaluated
//! against decoded [`Record`]s. Sub-select operands must be resolved into
//! value lists by the engine before compiling. Sorting, windowing and
//! projection helpers mirror what the SQL engines get from `ORDER BY`,
//! `LIMIT` and the column list.

use core::cmp::Ordering;

use serde_json::json;

use bazaar_types::{ColumnType, ID_COLUMN, Record, Value};

use crate::error::DbError;
use crate::filter::{Condition, Operand, Operator, Predicate};
use crate::query::SortKey;

/// Test applied to one field of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldTest {
    /// Equal (or both null).
    Eq(Value),
    /// Not equal.
    Ne(Value),
    /// Greater than.
    Gt(Value),
    /// Greater or equal.
    Ge(Value),
    /// Less than.
    Lt(Value),
    /// Less or equal.
    Le(Value),
    /// Case-insensitive wildcard match (`%`, `_`).
    Like(String),
    /// Equal to any listed value.
    In(Vec<Value>),
    /// Array field holds any listed item.
    Contains(Vec<Value>),
    /// Array field holds none of the listed items.
    NotContains(Vec<Value>),
}

/// Boolean selector tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Every child matches (empty matches everything).
    And(Vec<Self>),
    /// Some child matches (empty matches nothing).
    Or(Vec<Self>),
    /// Field test.
    Match {
        /// Field name.
        column: String,
        /// Test to apply.
        test: FieldTest,
        /// The field is an identifier column.
        id: bool,
    },
}

impl Selector {
    /// Selector that matches every document.
    pub const fn all() -> Self {
        Self::And(Vec::new())
    }

    /// Compile an optional condition; `None` matches everything.
    pub fn compile(condition: Option<&Condition<'_>>) -> Result<Self, DbError> {
        condition.map_or_else(|| Ok(Self::all()), Self::from_condition)
    }

    fn from_condition(condition: &Condition<'_>) -> Result<Self, DbError> {
        match condition {
            Condition::All(parts) => parts.iter().map(Self::from_condition).collect::<Result<_, _>>().map(Self::And),
            Condition::Any(parts) => parts.iter().map(Self::from_condition).collect::<Result<_, _>>().map(Self::Or),
            Condition::Predicate(p) => Self::from_predicate(p),
        }
    }

    fn from_predicate(p: &Predicate) -> Result<Self, DbError> {
        // Decoded documents carry ids as text.
        let normalize = |v: &Value| match (&p.kind, v) {
            (ColumnType::Id, Value::Int(i)) => Value::Text(i.to_string()),
            _ => v.clone(),
        };
        let test = match (&p.operand, p.op) {
            (Operand::Select(_), _) => {
                return Err(DbError::UnsupportedOperator(format!(
                    "unresolved sub-select on {}",
                    p.column
                )));
            }
            (Operand::List(items), Operator::NotEq) if p.kind.is_array() => {
                FieldTest::NotContains(items.iter().map(normalize).collect())
            }
            (Operand::List(items), _) if p.kind.is_array() => FieldTest::Contains(items.iter().map(normalize).collect()),
            (Operand::List(items), _) => FieldTest::In(items.iter().map(normalize).collect()),
            (Operand::Value(v), op) => match op {
                Operator::Like => FieldTest::Like(v.to_string()),
                Operator::Eq | Operator::In => FieldTest::Eq(normalize(v)),
                Operator::NotEq => FieldTest::Ne(normalize(v)),
                Operator::Gt => FieldTest::Gt(normalize(v)),
                Operator::Ge => FieldTest::Ge(normalize(v)),
                Operator::Lt => FieldTest::Lt(normalize(v)),
                Operator::Le => FieldTest::Le(normalize(v)),
            },
        };
        Ok(Self::Match {
            column: p.column.clone(),
            test,
            id: p.kind == ColumnType::Id,
        })
    }

    /// Whether a record satisfies the selector.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::And(parts) => parts.iter().all(|s| s.matches(record)),
            Self::Or(parts) => parts.iter().any(|s| s.matches(record)),
            Self::Match { column, test, id } => {
                let field = record.get(column).unwrap_or(&Value::Null);
                test.holds(field, *id)
            }
        }
    }

    /// Query-document rendering, for logs.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::And(parts) => json!({ "$and": parts.iter().map(Self::to_json).collect::<Vec<_>>() }),
            Self::Or(parts) => json!({ "$or": parts.iter().map(Self::to_json).collect::<Vec<_>>() }),
            Self::Match { column, test, .. } => {
                let list = |items: &[Value]| items.iter().map(Value::to_json).collect::<Vec<_>>();
                let body = match test {
                    FieldTest::Eq(v) => json!({ "$eq": v.to_json() }),
                    FieldTest::Ne(v) => json!({ "$ne": v.to_json() }),
                    FieldTest::Gt(v) => json!({ "$gt": v.to_json() }),
                    FieldTest::Ge(v) => json!({ "$gte": v.to_json() }),
                    FieldTest::Lt(v) => json!({ "$lt": v.to_json() }),
                    FieldTest::Le(v) => json!({ "$lte": v.to_json() }),
                    FieldTest::Like(p) => json!({ "$like": p }),
                    FieldTest::In(items) => json!({ "$in": list(items) }),
                    FieldTest::Contains(items) => json!({ "$elemMatch": { "$in": list(items) } }),
                    FieldTest::NotContains(items) => json!({ "$not": { "$elemMatch": { "$in": list(items) } } }),
                };
                let mut doc = serde_json::Map::new();
                doc.insert(column.clone(), body);
                serde_json::Value::Object(doc)
            }
        }
    }
}

impl FieldTest {
    fn holds(&self, field: &Value, id: bool) -> bool {
        let ordered = |v: &Value, accept: fn(Ordering) -> bool| compare_field(field, v, id).is_some_and(accept);
        match self {
            Self::Eq(v) => equals(field, v),
            Self::Ne(v) => !field.is_null() && !equals(field, v),
            Self::Gt(v) => ordered(v, Ordering::is_gt),
            Self::Ge(v) => ordered(v, Ordering::is_ge),
            Self::Lt(v) => ordered(v, Ordering::is_lt),
            Self::Le(v) => ordered(v, Ordering::is_le),
            Self::Like(pattern) => !field.is_null() && like(pattern, &field.to_string()),
            Self::In(items) => items.iter().any(|v| equals(field, v)),
            Self::Contains(items) => array_holds_any(field, items),
            Self::NotContains(items) => matches!(field, Value::Array(_)) && !array_holds_any(field, items),
        }
    }
}

/// Order two field values. Integer ids are decoded as text and compare
/// numerically, as they do in the SQL engines.
fn compare_field(a: &Value, b: &Value, id: bool) -> Option<Ordering> {
    match (a, b) {
        (Value::Text(x), Value::Text(y)) if id => match (x.parse::<i64>(), y.parse::<i64>()) {
            (Ok(x), Ok(y)) => Some(x.cmp(&y)),
            _ => a.compare(b),
        },
        _ => a.compare(b),
    }
}

fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Json(x), Value::Json(y)) => x == y,
        _ => a.compare(b) == Some(Ordering::Equal),
    }
}

fn array_holds_any(field: &Value, items: &[Value]) -> bool {
    match field {
        Value::Array(elements) => elements.iter().any(|e| items.iter().any(|i| equals(e, i))),
        _ => false,
    }
}

/// Case-insensitive SQL `LIKE`: `%` matches any run, `_` one character.
pub fn like(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let (mut p, mut t) = (0_usize, 0_usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(&'%') => {
                backtrack = Some((p, t));
                p = p.saturating_add(1);
            }
            Some(&c) if c == '_' || Some(&c) == text.get(t) => {
                p = p.saturating_add(1);
                t = t.saturating_add(1);
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star.saturating_add(1);
                    t = matched.saturating_add(1);
                    backtrack = Some((star, matched.saturating_add(1)));
                }
                None => return false,
            },
        }
    }
    pattern.iter().skip(p).all(|&c| c == '%')
}

// ---------------------------------------------------------------------------
// Ordering, windowing, projection
// ---------------------------------------------------------------------------

/// Stable sort by the given keys. Nulls sort first; incomparable values
/// keep their relative order.
pub fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for key in keys {
            let left = a.get(&key.column).unwrap_or(&Value::Null);
            let right = b.get(&key.column).unwrap_or(&Value::Null);
            let order = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => {
                    compare_field(left, right, key.kind == ColumnType::Id).unwrap_or(Ordering::Equal)
                }
            };
            let order = if key.descending { order.reverse() } else { order };
            if order != Ordering::Equal {
                return order;
            }
        }
        Ordering::Equal
    });
}

/// Apply offset and limit; a zero limit is unbounded.
pub fn window(records: Vec<Record>, offset: u64, limit: u64) -> Vec<Record> {
    let skip = usize::try_from(offset).unwrap_or(usize::MAX);
    let take = if limit == 0 {
        usize::MAX
    } else {
        usize::try_from(limit).unwrap_or(usize::MAX)
    };
    records.into_iter().skip(skip).take(take).collect()
}

/// Keep `_id` plus the listed columns; an empty list keeps everything.
pub fn project(mut record: Record, columns: &[String]) -> Record {
    if !columns.is_empty() {
        record.retain(|name, _| name == ID_COLUMN || columns.iter().any(|c| c == name));
    }
    record
}
