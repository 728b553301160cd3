//! Logical column types and column descriptors.
//!
//! Logical types are backend-agnostic. Each engine maps them to its own
//! native types; the canonical [`Display`](core::fmt::Display) form is what
//! gets persisted in the metadata collection.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

// ---------------------------------------------------------------------------
// ColumnType
// ---------------------------------------------------------------------------

/// Backend-agnostic column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    /// Record identifier (integer or opaque string, per [`IdKind`](crate::IdKind)).
    Id,
    /// True/false flag.
    Boolean,
    /// Bounded string; the length defaults to the backend's choice.
    Varchar(Option<u32>),
    /// Unbounded string.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// Double-precision float.
    Float,
    /// Exact decimal with optional precision and scale.
    Decimal(Option<(u32, u32)>),
    /// Exact decimal rounded to two places.
    Money,
    /// Timestamp in UTC.
    DateTime,
    /// Structured JSON document.
    Json,
    /// Homogeneous list of items.
    Array(Box<Self>),
}

impl ColumnType {
    /// Parse a logical type name, accepting the common aliases.
    ///
    /// `[]T` denotes an array of `T`; `varchar(n)` and `decimal(p,s)`
    /// carry size parameters.
    pub fn parse(input: &str) -> Result<Self, TypeError> {
        let unknown = || TypeError::UnknownType(input.to_owned());
        let normalized = input.trim().to_ascii_lowercase();

        if let Some(inner) = normalized.strip_prefix("[]") {
            return Self::parse(inner).map(|item| Self::Array(Box::new(item)));
        }

        let (name, params) = match normalized.split_once('(') {
            Some((name, rest)) => {
                let params = rest.strip_suffix(')').ok_or_else(unknown)?;
                let parsed = params
                    .split(',')
                    .map(|p| p.trim().parse::<u32>())
                    .collect::<Result<Vec<_>, _>>()
                    .ok()
                    .ok_or_else(unknown)?;
                (name.trim(), Some(parsed))
            }
            None => (normalized.as_str(), None),
        };

        let kind = match (name, params.as_deref()) {
            ("id", None) => Self::Id,
            ("bool" | "boolean", None) => Self::Boolean,
            ("varchar" | "char" | "string", None) => Self::Varchar(None),
            ("varchar" | "char" | "string", Some(&[len])) => Self::Varchar(Some(len)),
            ("text", None) => Self::Text,
            ("int" | "integer", None) => Self::Integer,
            ("float" | "real" | "double", None) => Self::Float,
            ("decimal" | "numeric", None) => Self::Decimal(None),
            ("decimal" | "numeric", Some(&[precision])) => Self::Decimal(Some((precision, 0))),
            ("decimal" | "numeric", Some(&[precision, scale])) if scale <= precision => {
                Self::Decimal(Some((precision, scale)))
            }
            ("money", None) => Self::Money,
            ("datetime" | "date" | "time" | "timestamp", None) => Self::DateTime,
            ("json" | "struct", None) => Self::Json,
            _ => return Err(unknown()),
        };
        Ok(kind)
    }

    /// Whether the column stores a list of items.
    pub const fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// Item type of an array column.
    pub fn element_type(&self) -> Option<&Self> {
        match self {
            Self::Array(item) => Some(item),
            _ => None,
        }
    }

    /// Whether values are stored as strings.
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Varchar(_) | Self::Text)
    }

    /// Whether values are numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Integer | Self::Float | Self::Decimal(_) | Self::Money
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id => f.write_str("id"),
            Self::Boolean => f.write_str("bool"),
            Self::Varchar(None) => f.write_str("varchar"),
            Self::Varchar(Some(len)) => write!(f, "varchar({len})"),
            Self::Text => f.write_str("text"),
            Self::Integer => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Decimal(None) => f.write_str("decimal"),
            Self::Decimal(Some((precision, scale))) => write!(f, "decimal({precision},{scale})"),
            Self::Money => f.write_str("money"),
            Self::DateTime => f.write_str("datetime"),
            Self::Json => f.write_str("json"),
            Self::Array(item) => write!(f, "[]{item}"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ColumnType {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A column registered on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within its collection.
    pub name: String,
    /// Logical type.
    #[serde(rename = "type")]
    pub kind: ColumnType,
    /// Whether the backend should maintain an index on the column.
    pub indexed: bool,
}

impl Column {
    /// Build a column descriptor.
    pub fn new(name: impl Into<String>, kind: ColumnType, indexed: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            indexed,
        }
    }
}
