//! Type Registry & Value Codec for the SQL engines.
//!
//! Every literal that ends up in a generated statement is produced here.
//! Values are coerced to their column's logical type first and then encoded
//! per [`Dialect`]; nothing else in the crate builds literals by hand.
//!
//! # Native types
//!
//! | Logical | `PostgreSQL` | `SQLite` |
//! |---------|--------------|----------|
//! | `id` | `BIGINT` / `CHAR(32)` | `INTEGER` / `CHAR(32)` |
//! | `bool` | `BOOLEAN` | `INTEGER` (0/1) |
//! | `varchar(n)` | `VARCHAR(n)` | `VARCHAR(n)` |
//! | `text` | `TEXT` | `TEXT` |
//! | `int` | `BIGINT` | `INTEGER` |
//! | `float` | `DOUBLE PRECISION` | `REAL` |
//! | `decimal(p,s)` | `NUMERIC(p,s)` | `NUMERIC` |
//! | `money` | `NUMERIC(14,2)` | `NUMERIC` |
//! | `datetime` | `TIMESTAMPTZ` | `INTEGER` (epoch seconds) |
//! | `json` | `JSONB` | `TEXT` |
//! | `[]T` | `TEXT` | `TEXT` |

use bazaar_types::{ColumnType, IdKind, Value};

use crate::error::DbError;

/// Default length for `varchar` columns declared without one.
const DEFAULT_VARCHAR_LEN: u32 = 255;

/// Separator between array items in their stored text form.
const ARRAY_SEPARATOR: char = ',';

/// SQL flavor a statement is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `PostgreSQL`.
    Postgres,
    /// `SQLite`.
    Sqlite,
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl Dialect {
    /// Native column type for a logical type.
    pub fn native_type(self, kind: &ColumnType, ids: IdKind) -> String {
        match (self, kind) {
            (_, ColumnType::Id) => match (self, ids) {
                (Self::Postgres, IdKind::Integer) => "BIGINT".to_owned(),
                (Self::Sqlite, IdKind::Integer) => "INTEGER".to_owned(),
                (_, IdKind::Opaque) => "CHAR(32)".to_owned(),
            },
            (Self::Postgres, ColumnType::Boolean) => "BOOLEAN".to_owned(),
            (Self::Sqlite, ColumnType::Boolean | ColumnType::Integer | ColumnType::DateTime) => {
                "INTEGER".to_owned()
            }
            (_, ColumnType::Varchar(len)) => {
                format!("VARCHAR({})", len.unwrap_or(DEFAULT_VARCHAR_LEN))
            }
            (_, ColumnType::Text | ColumnType::Array(_)) | (Self::Sqlite, ColumnType::Json) => {
                "TEXT".to_owned()
            }
            (Self::Postgres, ColumnType::Integer) => "BIGINT".to_owned(),
            (Self::Postgres, ColumnType::Float) => "DOUBLE PRECISION".to_owned(),
            (Self::Sqlite, ColumnType::Float) => "REAL".to_owned(),
            (Self::Postgres, ColumnType::Decimal(None)) | (Self::Sqlite, ColumnType::Decimal(_) | ColumnType::Money) => {
                "NUMERIC".to_owned()
            }
            (Self::Postgres, ColumnType::Decimal(Some((precision, scale)))) => {
                format!("NUMERIC({precision},{scale})")
            }
            (Self::Postgres, ColumnType::Money) => "NUMERIC(14,2)".to_owned(),
            (Self::Postgres, ColumnType::DateTime) => "TIMESTAMPTZ".to_owned(),
            (Self::Postgres, ColumnType::Json) => "JSONB".to_owned(),
        }
    }

    /// Column definition of the `_id` primary key.
    pub const fn id_definition(self, ids: IdKind) -> &'static str {
        match (self, ids) {
            (Self::Postgres, IdKind::Integer) => "\"_id\" BIGSERIAL PRIMARY KEY",
            (Self::Sqlite, IdKind::Integer) => "\"_id\" INTEGER PRIMARY KEY AUTOINCREMENT",
            (_, IdKind::Opaque) => "\"_id\" CHAR(32) PRIMARY KEY",
        }
    }

    /// Quote a string literal.
    ///
    /// `PostgreSQL` gets an `E'...'` literal with quotes and backslashes
    /// escaped; `SQLite` treats backslash literally so only quotes double.
    pub fn quote_text(self, s: &str) -> Result<String, DbError> {
        if s.contains('\0') {
            return Err(DbError::InvalidValue("string contains a NUL character".to_owned()));
        }
        Ok(match self {
            Self::Postgres => format!("E'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
            Self::Sqlite => format!("'{}'", s.replace('\'', "''")),
        })
    }

    /// Coerce `value` to `kind` and encode it as a native literal.
    pub fn encode_literal(self, value: &Value, kind: &ColumnType, ids: IdKind) -> Result<String, DbError> {
        let coerced = value.coerce(kind)?;
        self.encode_coerced(&coerced, kind, ids)
    }

    /// Encode a value that already has `kind`'s representation.
    pub fn encode_coerced(self, value: &Value, kind: &ColumnType, ids: IdKind) -> Result<String, DbError> {
        let invalid = || DbError::InvalidValue(format!("{} {value} for {kind}", value.kind_name()));
        match (kind, value) {
            (_, Value::Null) => Ok("NULL".to_owned()),
            (ColumnType::Id, id) => self.encode_id(id, ids),
            (ColumnType::Array(_), Value::Array(items)) => self.quote_text(&encode_array(items)),
            (_, Value::Bool(b)) => Ok(match (self, b) {
                (Self::Postgres, true) => "TRUE",
                (Self::Postgres, false) => "FALSE",
                (Self::Sqlite, true) => "1",
                (Self::Sqlite, false) => "0",
            }
            .to_owned()),
            (_, Value::Int(i)) => Ok(i.to_string()),
            (_, Value::Float(f)) if f.is_finite() => Ok(f.to_string()),
            (_, Value::Decimal(d)) => Ok(d.to_string()),
            (_, Value::Text(s)) => self.quote_text(s),
            (_, Value::DateTime(dt)) => Ok(match self {
                Self::Postgres => format!("'{}'::timestamptz", dt.to_rfc3339()),
                Self::Sqlite => dt.timestamp().to_string(),
            }),
            (_, Value::Json(doc)) => {
                let text = self.quote_text(&serde_json::to_string(doc)?)?;
                Ok(match self {
                    Self::Postgres => format!("{text}::jsonb"),
                    Self::Sqlite => text,
                })
            }
            _ => Err(invalid()),
        }
    }

    fn encode_id(self, value: &Value, ids: IdKind) -> Result<String, DbError> {
        let external = value.to_string();
        if !ids.accepts(&external) {
            return Err(DbError::InvalidValue(format!("{external:?} is not a valid {ids} id")));
        }
        match ids {
            IdKind::Integer => Ok(external),
            IdKind::Opaque => self.quote_text(&external),
        }
    }

    /// Cast an expression to the native string type.
    pub fn text_cast(self, expr: &str) -> String {
        match self {
            Self::Postgres => format!("{expr}::text"),
            Self::Sqlite => format!("CAST({expr} AS TEXT)"),
        }
    }

    /// Case-insensitive pattern operator.
    pub const fn like_operator(self) -> &'static str {
        match self {
            Self::Postgres => "ILIKE",
            Self::Sqlite => "LIKE",
        }
    }

    /// Membership test of one item in an array column's stored text.
    ///
    /// Uses a substring-position function rather than `LIKE`, so wildcard
    /// characters inside the item match literally.
    pub fn array_contains(self, column: &str, item: &Value) -> Result<String, DbError> {
        let needle = self.quote_text(&format!(",{},", escape_item(&item.to_string())))?;
        let haystack = format!("(',' || {column} || ',')");
        Ok(match self {
            Self::Postgres => format!("strpos({haystack}, {needle}) > 0"),
            Self::Sqlite => format!("instr({haystack}, {needle}) > 0"),
        })
    }

    /// `LIMIT`/`OFFSET` clause; a zero limit means unbounded.
    pub fn pagination(self, offset: u64, limit: u64) -> Option<String> {
        match (offset, limit) {
            (0, 0) => None,
            (0, limit) => Some(format!("LIMIT {limit}")),
            (offset, 0) => Some(match self {
                Self::Postgres => format!("OFFSET {offset}"),
                Self::Sqlite => format!("LIMIT -1 OFFSET {offset}"),
            }),
            (offset, limit) => Some(format!("LIMIT {limit} OFFSET {offset}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Array text form
// ---------------------------------------------------------------------------

/// Stored form of an empty item, so `[""]` stays distinct from `[]`.
const EMPTY_ITEM: &str = "%00";

/// Percent-escape the separator (and the escape character itself).
fn escape_item(item: &str) -> String {
    if item.is_empty() {
        return EMPTY_ITEM.to_owned();
    }
    item.replace('%', "%25").replace(ARRAY_SEPARATOR, "%2C")
}

fn unescape_item(item: &str) -> String {
    if item == EMPTY_ITEM {
        return String::new();
    }
    let mut out = String::with_capacity(item.len());
    let mut rest = item;
    while let Some(pos) = rest.find('%') {
        let (head, tail) = rest.split_at(pos);
        out.push_str(head);
        if let Some(after) = tail.strip_prefix("%2C") {
            out.push(ARRAY_SEPARATOR);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("%25") {
            out.push('%');
            rest = after;
        } else {
            out.push('%');
            rest = tail.get(1..).unwrap_or_default();
        }
    }
    out.push_str(rest);
    out
}

/// Stored text form of an array: escaped items joined by commas.
pub fn encode_array(items: &[Value]) -> String {
    items
        .iter()
        .map(|item| escape_item(&item.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the stored text form back into items of `item_kind`.
pub fn decode_array(text: &str, item_kind: &ColumnType) -> Result<Value, DbError> {
    if text.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    text.split(ARRAY_SEPARATOR)
        .map(|item| Value::Text(unescape_item(item)).coerce(item_kind))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
        .map_err(DbError::from)
}

/// Native `COUNT(*)` result as a record count.
pub fn row_count(count: i64) -> Result<u64, DbError> {
    u64::try_from(count).map_err(|err| DbError::InvalidValue(format!("row count {count}: {err}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    #[test]
    fn native_types_follow_id_kind() {
        assert_eq!(Dialect::Postgres.native_type(&ColumnType::Id, IdKind::Integer), "BIGINT");
        assert_eq!(Dialect::Sqlite.native_type(&ColumnType::Id, IdKind::Opaque), "CHAR(32)");
        assert_eq!(
            Dialect::Postgres.native_type(&ColumnType::Varchar(None), IdKind::Integer),
            "VARCHAR(255)"
        );
        assert_eq!(
            Dialect::Postgres.native_type(&ColumnType::parse("[]int").unwrap(), IdKind::Integer),
            "TEXT"
        );
    }

    #[test]
    fn postgres_escapes_quotes_and_backslashes() {
        assert_eq!(
            Dialect::Postgres.quote_text(r"it's a \ test").unwrap(),
            r"E'it''s a \\ test'"
        );
        assert_eq!(Dialect::Sqlite.quote_text(r"it's \").unwrap(), r"'it''s \'");
        assert!(Dialect::Sqlite.quote_text("a\0b").is_err());
    }

    #[test]
    fn booleans_use_native_tokens() {
        let t = Value::Bool(true);
        assert_eq!(
            Dialect::Postgres.encode_literal(&t, &ColumnType::Boolean, IdKind::Integer).unwrap(),
            "TRUE"
        );
        assert_eq!(
            Dialect::Sqlite.encode_literal(&t, &ColumnType::Boolean, IdKind::Integer).unwrap(),
            "1"
        );
    }

    #[test]
    fn ids_coerce_through_id_kind() {
        let encoded = Dialect::Postgres
            .encode_literal(&Value::from("17"), &ColumnType::Id, IdKind::Integer)
            .unwrap();
        assert_eq!(encoded, "17");
        let bad = Dialect::Postgres.encode_literal(&Value::from("x1"), &ColumnType::Id, IdKind::Integer);
        assert!(matches!(bad, Err(DbError::InvalidValue(_))));
        let opaque = "0190a5b2c3d47e8f9a0b1c2d3e4f5a6b";
        assert_eq!(
            Dialect::Sqlite
                .encode_literal(&Value::from(opaque), &ColumnType::Id, IdKind::Opaque)
                .unwrap(),
            format!("'{opaque}'")
        );
    }

    #[test]
    fn datetimes_are_dialect_specific() {
        let dt = Value::DateTime(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(
            Dialect::Sqlite.encode_literal(&dt, &ColumnType::DateTime, IdKind::Integer).unwrap(),
            "1704164645"
        );
        assert_eq!(
            Dialect::Postgres.encode_literal(&dt, &ColumnType::DateTime, IdKind::Integer).unwrap(),
            "'2024-01-02T03:04:05+00:00'::timestamptz"
        );
    }

    #[test]
    fn money_rounds_to_cents() {
        let encoded = Dialect::Postgres
            .encode_literal(&Value::Decimal(Decimal::new(12_345, 3)), &ColumnType::Money, IdKind::Integer)
            .unwrap();
        assert_eq!(encoded, "12.34");
    }

    #[test]
    fn json_is_serialized_and_quoted() {
        let doc = Value::Json(serde_json::json!({"name": "O'Brien"}));
        assert_eq!(
            Dialect::Postgres.encode_literal(&doc, &ColumnType::Json, IdKind::Integer).unwrap(),
            r#"E'{"name":"O''Brien"}'::jsonb"#
        );
    }

    #[test]
    fn array_items_escape_the_separator() {
        let kind = ColumnType::parse("[]text").unwrap();
        let items = vec![Value::from("a,b"), Value::from("50%"), Value::from("c")];
        let stored = encode_array(&items);
        assert_eq!(stored, "a%2Cb,50%25,c");
        assert_eq!(decode_array(&stored, kind.element_type().unwrap()).unwrap(), Value::Array(items));
        assert_eq!(decode_array("", &ColumnType::Text).unwrap(), Value::Array(vec![]));
    }

    #[test]
    fn empty_items_survive_storage() {
        let empty = encode_array(&[]);
        assert_eq!(decode_array(&empty, &ColumnType::Text).unwrap(), Value::Array(vec![]));

        let blank = encode_array(&[Value::from("")]);
        assert_ne!(blank, empty);
        assert_eq!(decode_array(&blank, &ColumnType::Text).unwrap(), Value::Array(vec![Value::from("")]));

        let items = vec![Value::from(""), Value::from("%00"), Value::from("")];
        let stored = encode_array(&items);
        assert_eq!(stored, "%00,%2500,%00");
        assert_eq!(decode_array(&stored, &ColumnType::Text).unwrap(), Value::Array(items));
    }

    #[test]
    fn array_membership_uses_position_functions() {
        let sql = Dialect::Sqlite.array_contains("\"tags\"", &Value::from("a,b")).unwrap();
        assert_eq!(sql, "instr((',' || \"tags\" || ','), ',a%2Cb,') > 0");
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert_eq!(row_count(0).unwrap(), 0);
        assert_eq!(row_count(42).unwrap(), 42);
        assert!(matches!(row_count(-1), Err(DbError::InvalidValue(_))));
    }

    #[test]
    fn zero_limit_is_unbounded() {
        assert_eq!(Dialect::Postgres.pagination(0, 0), None);
        assert_eq!(Dialect::Postgres.pagination(5, 0).as_deref(), Some("OFFSET 5"));
        assert_eq!(Dialect::Sqlite.pagination(5, 0).as_deref(), Some("LIMIT -1 OFFSET 5"));
        assert_eq!(Dialect::Sqlite.pagination(1, 2).as_deref(), Some("LIMIT 2 OFFSET 1"));
    }
}
