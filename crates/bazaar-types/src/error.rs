//! Errors raised while parsing logical types or coercing values.

/// Errors produced by the logical type layer.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// The logical type name is not one the registry recognizes.
    #[error("unknown column type: {0}")]
    UnknownType(String),

    /// A value could not be represented as the requested logical type.
    #[error("cannot convert {value} to {target}")]
    Conversion {
        /// Rendering of the offending value.
        value: String,
        /// Canonical name of the target logical type.
        target: String,
    },
}
