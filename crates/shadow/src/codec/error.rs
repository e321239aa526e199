use thiserror::Error;

/// An error that can occur while decoding an envelope.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload is not a JSON object.
    #[error("malformed document: {0}")]
    Malformed(String),

    /// A mandatory field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("field `{0}` has an unexpected type")]
    TypeMismatch(&'static str),

    /// A closed string enumeration received a value outside its set.
    #[error("field `{field}` has unknown value `{value}`")]
    UnknownVariant {
        /// The field holding the value.
        field: &'static str,
        /// The unrecognized value.
        value: String,
    },
}
