//! Record identifier strategy.
//!
//! A deployment picks exactly one [`IdKind`] at startup. Integer ids are
//! assigned by the backend (auto-increment or a counter); opaque ids are
//! generated here from a time-ordered UUID v7.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the identifier column every collection carries.
pub const ID_COLUMN: &str = "_id";

/// Length of an opaque identifier in hex characters.
pub const OPAQUE_ID_LEN: usize = 32;

/// How record identifiers are stored natively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    /// Backend-assigned auto-increment integer.
    #[default]
    Integer,
    /// Application-assigned fixed-length hex string.
    Opaque,
}

impl IdKind {
    /// Whether a caller-supplied external id is well formed for this kind.
    pub fn accepts(self, id: &str) -> bool {
        match self {
            Self::Integer => id.parse::<i64>().is_ok(),
            Self::Opaque => {
                id.len() == OPAQUE_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
            }
        }
    }
}

impl core::fmt::Display for IdKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Integer => f.write_str("integer"),
            Self::Opaque => f.write_str("opaque"),
        }
    }
}

/// Generate a new opaque identifier (UUID v7, lowercase hex, no dashes).
pub fn new_opaque_id() -> String {
    Uuid::now_v7().simple().to_string()
}
