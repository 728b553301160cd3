//! Storable values.
//!
//! [`Value`] is a closed union of everything a column can hold. Caller input
//! is brought into a column's representation with [`Value::coerce`]; engines
//! only ever encode values that went through it.

use core::cmp::Ordering;
use core::fmt;
use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Serialize, Serializer};

use crate::column::ColumnType;
use crate::error::TypeError;

/// A record: column name to value, ordered by column name.
pub type Record = BTreeMap<String, Value>;

/// A value stored in, or compared against, a column.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Exact decimal.
    Decimal(Decimal),
    /// String.
    Text(String),
    /// UTC timestamp.
    DateTime(DateTime<Utc>),
    /// Structured document.
    Json(serde_json::Value),
    /// List of values.
    Array(Vec<Self>),
}

impl Value {
    /// Short name of the variant, for diagnostics.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::DateTime(_) => "datetime",
            Self::Json(_) => "json",
            Self::Array(_) => "array",
        }
    }

    /// Whether the value is [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the string inside a [`Value::Text`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of an `Int`, or of a `Text` holding an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// The boolean inside a [`Value::Bool`].
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn conversion(&self, target: &ColumnType) -> TypeError {
        TypeError::Conversion {
            value: format!("{} {self}", self.kind_name()),
            target: target.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Coercion
    // -----------------------------------------------------------------------

    /// Convert the value into the representation of `target`.
    ///
    /// `Null` passes through for every type. Strings are parsed for numeric,
    /// boolean and datetime targets; arrays coerce item by item, and a
    /// comma-separated string is split into items.
    pub fn coerce(&self, target: &ColumnType) -> Result<Self, TypeError> {
        if self.is_null() {
            return Ok(Self::Null);
        }
        match target {
            ColumnType::Id => match self {
                Self::Int(_) => Ok(self.clone()),
                Self::Text(s) => Ok(Self::Text(s.trim().to_owned())),
                _ => Err(self.conversion(target)),
            },
            ColumnType::Boolean => self.coerce_bool(target),
            ColumnType::Varchar(_) | ColumnType::Text => match self {
                Self::Text(_) => Ok(self.clone()),
                Self::Array(_) => Err(self.conversion(target)),
                other => Ok(Self::Text(other.to_string())),
            },
            ColumnType::Integer => self.coerce_int(target),
            ColumnType::Float => self.coerce_float(target),
            ColumnType::Decimal(_) => self.coerce_decimal(target).map(Self::Decimal),
            ColumnType::Money => self
                .coerce_decimal(target)
                .map(|d| Self::Decimal(d.round_dp(2))),
            ColumnType::DateTime => self.coerce_datetime(target),
            ColumnType::Json => Ok(match self {
                Self::Json(_) => self.clone(),
                Self::Text(s) => Self::Json(
                    serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
                ),
                other => Self::Json(other.to_json()),
            }),
            ColumnType::Array(item) => {
                let items = match self {
                    Self::Array(items) => items.clone(),
                    Self::Json(serde_json::Value::Array(items)) => {
                        items.iter().cloned().map(Self::from_json_untyped).collect()
                    }
                    Self::Text(s) if s.trim().is_empty() => Vec::new(),
                    Self::Text(s) => s.split(',').map(|p| Self::Text(p.trim().to_owned())).collect(),
                    scalar => vec![scalar.clone()],
                };
                items
                    .iter()
                    .map(|v| v.coerce(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::Array)
            }
        }
    }

    fn coerce_bool(&self, target: &ColumnType) -> Result<Self, TypeError> {
        match self {
            Self::Bool(_) => Ok(self.clone()),
            Self::Int(0) => Ok(Self::Bool(false)),
            Self::Int(1) => Ok(Self::Bool(true)),
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Self::Bool(true)),
                "false" | "0" | "no" | "off" | "" => Ok(Self::Bool(false)),
                _ => Err(self.conversion(target)),
            },
            _ => Err(self.conversion(target)),
        }
    }

    fn coerce_int(&self, target: &ColumnType) -> Result<Self, TypeError> {
        let converted = match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Float(f) if f.fract() == 0.0 => Decimal::try_from(*f).ok().and_then(|d| d.to_i64()),
            Self::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        };
        converted.map(Self::Int).ok_or_else(|| self.conversion(target))
    }

    fn coerce_float(&self, target: &ColumnType) -> Result<Self, TypeError> {
        let converted = match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => i.to_f64(),
            Self::Decimal(d) => d.to_f64(),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        };
        converted
            .filter(|f| f.is_finite())
            .map(Self::Float)
            .ok_or_else(|| self.conversion(target))
    }

    fn coerce_decimal(&self, target: &ColumnType) -> Result<Decimal, TypeError> {
        let converted = match self {
            Self::Decimal(d) => Some(*d),
            Self::Int(i) => Some(Decimal::from(*i)),
            Self::Float(f) => Decimal::try_from(*f).ok(),
            Self::Text(s) => {
                let s = s.trim();
                Decimal::from_str(s)
                    .or_else(|_| Decimal::from_scientific(s))
                    .ok()
            }
            _ => None,
        };
        converted.ok_or_else(|| self.conversion(target))
    }

    fn coerce_datetime(&self, target: &ColumnType) -> Result<Self, TypeError> {
        let converted = match self {
            Self::DateTime(_) => return Ok(self.clone()),
            Self::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
            Self::Text(s) => parse_datetime(s.trim()),
            _ => None,
        };
        converted
            .map(Self::DateTime)
            .ok_or_else(|| self.conversion(target))
    }

    // -----------------------------------------------------------------------
    // Comparison
    // -----------------------------------------------------------------------

    /// Order two values of compatible kinds; numeric kinds compare across
    /// variants. Incomparable kinds yield `None`.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Decimal(a), Self::Decimal(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Decimal(b)) => Some(Decimal::from(*a).cmp(b)),
            (Self::Decimal(a), Self::Int(b)) => Some(a.cmp(&Decimal::from(*b))),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Float(_), Self::Int(_) | Self::Decimal(_))
            | (Self::Int(_) | Self::Decimal(_), Self::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Json(a), Self::Json(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => i.to_f64(),
            Self::Float(f) => Some(*f),
            Self::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // JSON
    // -----------------------------------------------------------------------

    /// JSON form of the value. Decimals become strings to keep precision;
    /// datetimes become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::Text(s) => Json::String(s.clone()),
            Self::DateTime(dt) => Json::String(dt.to_rfc3339()),
            Self::Json(j) => j.clone(),
            Self::Array(items) => Json::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Map JSON onto the closest value variant without type information.
    pub fn from_json_untyped(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            Json::String(s) => Self::Text(s),
            Json::Array(items) => Self::Array(items.into_iter().map(Self::from_json_untyped).collect()),
            object @ Json::Object(_) => Self::Json(object),
        }
    }

    /// Decode JSON stored for a column of type `kind`.
    pub fn from_json(json: serde_json::Value, kind: &ColumnType) -> Result<Self, TypeError> {
        if matches!(kind, ColumnType::Json) {
            return Ok(if json.is_null() { Self::Null } else { Self::Json(json) });
        }
        Self::from_json_untyped(json).coerce(kind)
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(s) => f.write_str(s),
            Self::DateTime(dt) => f.write_str(&dt.to_rfc3339()),
            Self::Json(j) => write!(f, "{j}"),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

macro_rules! value_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(v: $source) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int,
    u32 => Int,
    i64 => Int,
    f64 => Float,
    Decimal => Decimal,
    String => Text,
    &str => Text,
    DateTime<Utc> => DateTime,
    serde_json::Value => Json,
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn null_survives_every_type() {
        for kind in [ColumnType::Integer, ColumnType::Json, ColumnType::Boolean] {
            assert_eq!(Value::Null.coerce(&kind).unwrap(), Value::Null);
        }
    }

    #[test]
    fn strings_parse_into_numbers() {
        assert_eq!(
            Value::from("42").coerce(&ColumnType::Integer).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::from("19.999").coerce(&ColumnType::Money).unwrap(),
            Value::Decimal(Decimal::new(2000, 2))
        );
        assert!(Value::from("abc").coerce(&ColumnType::Integer).is_err());
    }

    #[test]
    fn floats_only_become_integers_when_whole() {
        assert_eq!(
            Value::Float(3.0).coerce(&ColumnType::Integer).unwrap(),
            Value::Int(3)
        );
        assert!(Value::Float(3.5).coerce(&ColumnType::Integer).is_err());
    }

    #[test]
    fn booleans_accept_common_spellings() {
        assert_eq!(
            Value::from("yes").coerce(&ColumnType::Boolean).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::Int(0).coerce(&ColumnType::Boolean).unwrap(),
            Value::Bool(false)
        );
        assert!(Value::Int(7).coerce(&ColumnType::Boolean).is_err());
    }

    #[test]
    fn datetimes_parse_from_text_and_epoch() {
        let from_text = Value::from("2024-03-01 12:00:00")
            .coerce(&ColumnType::DateTime)
            .unwrap();
        let from_epoch = Value::Int(1_709_294_400)
            .coerce(&ColumnType::DateTime)
            .unwrap();
        assert_eq!(from_text, from_epoch);
    }

    #[test]
    fn arrays_split_comma_strings() {
        let kind = ColumnType::parse("[]int").unwrap();
        assert_eq!(
            Value::from("1, 2,3").coerce(&kind).unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(Value::from("").coerce(&kind).unwrap(), Value::Array(vec![]));
        assert_eq!(
            Value::Int(5).coerce(&kind).unwrap(),
            Value::Array(vec![Value::Int(5)])
        );
    }

    #[test]
    fn numeric_kinds_compare_across_variants() {
        assert_eq!(
            Value::Int(2).compare(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Decimal(Decimal::new(250, 2)).compare(&Value::Int(2)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Int(1).compare(&Value::from("1")), None);
    }

    #[test]
    fn decimals_serialize_as_strings() {
        let json = Value::Decimal(Decimal::new(1050, 2)).to_json();
        assert_eq!(json, serde_json::json!("10.50"));
        let back = Value::from_json(json, &ColumnType::Money).unwrap();
        assert_eq!(back, Value::Decimal(Decimal::new(1050, 2)));
    }

    #[test]
    fn json_columns_keep_documents() {
        let doc = serde_json::json!({"limit": 3});
        let back = Value::from_json(doc.clone(), &ColumnType::Json).unwrap();
        assert_eq!(back, Value::Json(doc));
    }
}
