mod error;

pub use error::DecodeError;

use bytes::Bytes;
use serde_json::{Map, Value};

/// A generic structured document: string keys mapped to JSON values.
pub type Document = Map<String, Value>;

/// A typed request or response that travels over the transport as a [`Document`].
pub trait Envelope: Sized {
    /// Converts the value into a document. Absent optional fields are omitted.
    fn encode(&self) -> Document;

    /// Reads a value back from a document. Unknown fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::MissingField` if a mandatory field is absent and
    /// `DecodeError::TypeMismatch` if a field has the wrong shape.
    fn decode(document: &Document) -> Result<Self, DecodeError>;

    /// Encodes the value straight to a transport payload.
    fn to_payload(&self) -> Bytes {
        to_payload(self.encode())
    }

    /// Decodes the value straight from a transport payload.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::Malformed` if the payload is not a JSON object, or
    /// any error `decode` returns.
    fn from_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&from_payload(payload)?)
    }
}

/// Responses that echo the correlation token of the request they answer.
pub trait Correlated {
    /// The echoed client token, if the server sent one.
    fn client_token(&self) -> Option<&str>;
}

/// Serializes a document as JSON text.
#[must_use]
pub fn to_payload(document: Document) -> Bytes {
    Bytes::from(Value::Object(document).to_string())
}

/// Parses JSON text into a document.
///
/// # Errors
///
/// Returns `DecodeError::Malformed` if the payload is not valid JSON or its
/// top level is not an object.
pub fn from_payload(payload: &[u8]) -> Result<Document, DecodeError> {
    match serde_json::from_slice(payload) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(_) => Err(DecodeError::Malformed("top level is not an object".to_string())),
        Err(e) => Err(DecodeError::Malformed(e.to_string())),
    }
}

/// A value that can be read out of a single document field.
pub trait FieldValue: Sized {
    /// Reads the value, reporting failures against `field`.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::TypeMismatch` (or `UnknownVariant` for closed
    /// enumerations) if the value has the wrong shape.
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError>;
}

impl FieldValue for String {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or(DecodeError::TypeMismatch(field))
    }
}

impl FieldValue for u64 {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        value.as_u64().ok_or(DecodeError::TypeMismatch(field))
    }
}

impl FieldValue for i64 {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        value.as_i64().ok_or(DecodeError::TypeMismatch(field))
    }
}

impl FieldValue for u16 {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        value
            .as_u64()
            .and_then(|n| Self::try_from(n).ok())
            .ok_or(DecodeError::TypeMismatch(field))
    }
}

impl FieldValue for bool {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        value.as_bool().ok_or(DecodeError::TypeMismatch(field))
    }
}

impl FieldValue for Document {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        value
            .as_object()
            .cloned()
            .ok_or(DecodeError::TypeMismatch(field))
    }
}

/// Read access to the fields of a document.
///
/// A present `null` is never treated as absent: typed readers reject it as a
/// type mismatch, and `nullable` hands it back as `Some(Value::Null)`.
pub struct Fields<'a> {
    document: &'a Document,
}

impl<'a> Fields<'a> {
    /// Wraps a document.
    #[must_use]
    pub const fn new(document: &'a Document) -> Self {
        Self { document }
    }

    /// Reads a mandatory field.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::MissingField` if the field is absent.
    pub fn required<T: FieldValue>(&self, field: &'static str) -> Result<T, DecodeError> {
        self.document
            .get(field)
            .ok_or(DecodeError::MissingField(field))
            .and_then(|value| T::read(field, value))
    }

    /// Reads an optional field.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is present with the wrong shape.
    pub fn optional<T: FieldValue>(&self, field: &'static str) -> Result<Option<T>, DecodeError> {
        self.document
            .get(field)
            .map(|value| T::read(field, value))
            .transpose()
    }

    /// Reads an optional nested envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not an object or the nested envelope
    /// fails to decode.
    pub fn envelope<T: Envelope>(&self, field: &'static str) -> Result<Option<T>, DecodeError> {
        self.optional::<Document>(field)?
            .map(|document| T::decode(&document))
            .transpose()
    }

    /// Reads an optional field of any shape, keeping a present `null`.
    #[must_use]
    pub fn nullable(&self, field: &'static str) -> Option<Value> {
        self.document.get(field).cloned()
    }
}

/// Incrementally builds a document, skipping absent optional fields.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Starts an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field unconditionally.
    #[must_use]
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.document.insert(name.to_string(), value.into());
        self
    }

    /// Sets a field only when a value is present.
    #[must_use]
    pub fn optional<V: Into<Value>>(self, name: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.field(name, value),
            None => self,
        }
    }

    /// Sets a nested envelope only when present.
    #[must_use]
    pub fn envelope<E: Envelope>(self, name: &str, value: Option<&E>) -> Self {
        self.optional(name, value.map(|envelope| Value::Object(envelope.encode())))
    }

    /// Finishes the document.
    #[must_use]
    pub fn build(self) -> Document {
        self.document
    }
}
