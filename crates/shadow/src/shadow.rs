use crate::codec::{Correlated, DecodeError, Document, DocumentBuilder, Envelope, Fields};

use serde_json::Value;

/// The `state` object of a shadow document.
///
/// Each partition is `None` when absent and `Some(Value::Null)` when the
/// server (or caller) explicitly sent `null`, which deletes the partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShadowState {
    /// The state the owner wants the device to be in.
    pub desired: Option<Value>,
    /// The state the device last reported.
    pub reported: Option<Value>,
    /// Difference between desired and reported, only ever sent by the server.
    pub delta: Option<Value>,
}

impl ShadowState {
    /// A state carrying the same single property in both partitions.
    #[must_use]
    pub fn mirrored(property: &str, value: Value) -> Self {
        let mut fragment = Document::new();
        fragment.insert(property.to_string(), value);

        Self {
            desired: Some(Value::Object(fragment.clone())),
            reported: Some(Value::Object(fragment)),
            delta: None,
        }
    }

    /// Looks up a property in the desired partition.
    #[must_use]
    pub fn desired_property(&self, property: &str) -> Option<&Value> {
        self.desired.as_ref().and_then(|d| d.get(property))
    }

    /// Looks up a property in the reported partition.
    #[must_use]
    pub fn reported_property(&self, property: &str) -> Option<&Value> {
        self.reported.as_ref().and_then(|r| r.get(property))
    }
}

fn partition(fields: &Fields<'_>, name: &'static str) -> Result<Option<Value>, DecodeError> {
    match fields.nullable(name) {
        Some(value @ (Value::Object(_) | Value::Null)) => Ok(Some(value)),
        Some(_) => Err(DecodeError::TypeMismatch(name)),
        None => Ok(None),
    }
}

impl Envelope for ShadowState {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .optional("desired", self.desired.clone())
            .optional("reported", self.reported.clone())
            .optional("delta", self.delta.clone())
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            desired: partition(&fields, "desired")?,
            reported: partition(&fields, "reported")?,
            delta: partition(&fields, "delta")?,
        })
    }
}

/// Request to change the desired and/or reported state of a shadow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateShadowRequest {
    /// Correlation token echoed in the response.
    pub client_token: String,
    /// The state fragment to apply.
    pub state: ShadowState,
    /// Expected current version; the update is rejected on mismatch.
    pub version: Option<u64>,
}

impl UpdateShadowRequest {
    /// An update reporting `value` for `property` while also setting it as
    /// the desired value, which clears the matching delta.
    #[must_use]
    pub fn mirrored(client_token: impl Into<String>, property: &str, value: Value) -> Self {
        Self {
            client_token: client_token.into(),
            state: ShadowState::mirrored(property, value),
            version: None,
        }
    }
}

impl Envelope for UpdateShadowRequest {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .field("clientToken", self.client_token.clone())
            .field("state", Value::Object(self.state.encode()))
            .optional("version", self.version)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            client_token: fields.required("clientToken")?,
            state: ShadowState::decode(&fields.required::<Document>("state")?)?,
            version: fields.optional("version")?,
        })
    }
}

impl Correlated for UpdateShadowRequest {
    fn client_token(&self) -> Option<&str> {
        Some(&self.client_token)
    }
}

/// Response published on the `accepted` channel of an update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateShadowResponse {
    /// The new version of the shadow.
    pub version: u64,
    /// The state as applied.
    pub state: Option<ShadowState>,
    /// Per-field timestamps.
    pub metadata: Option<Document>,
    /// Echoed correlation token.
    pub client_token: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
}

impl Envelope for UpdateShadowResponse {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .field("version", self.version)
            .envelope("state", self.state.as_ref())
            .optional("metadata", self.metadata.clone())
            .optional("clientToken", self.client_token.clone())
            .optional("timestamp", self.timestamp)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            version: fields.required("version")?,
            state: fields.envelope("state")?,
            metadata: fields.optional("metadata")?,
            client_token: fields.optional("clientToken")?,
            timestamp: fields.optional("timestamp")?,
        })
    }
}

impl Correlated for UpdateShadowResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Response published on the `rejected` channel of any shadow operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    /// HTTP-style status code, e.g. 409 on a version conflict.
    pub code: u16,
    /// Human readable description.
    pub message: Option<String>,
    /// Echoed correlation token.
    pub client_token: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
}

impl ErrorResponse {
    /// Creates an error response with a code and message.
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            client_token: None,
            timestamp: None,
        }
    }

    /// Sets the echoed token.
    #[must_use]
    pub fn with_client_token(mut self, client_token: Option<String>) -> Self {
        self.client_token = client_token;
        self
    }
}

impl Envelope for ErrorResponse {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .field("code", self.code)
            .optional("message", self.message.clone())
            .optional("clientToken", self.client_token.clone())
            .optional("timestamp", self.timestamp)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            code: fields.required("code")?,
            message: fields.optional("message")?,
            client_token: fields.optional("clientToken")?,
            timestamp: fields.optional("timestamp")?,
        })
    }
}

impl Correlated for ErrorResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Notification that desired state differs from reported state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowDeltaUpdatedEvent {
    /// The differing subset of `state.desired`.
    pub state: Document,
    /// Version of the shadow that produced this delta.
    pub version: u64,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
    /// Per-field timestamps.
    pub metadata: Option<Document>,
    /// Token of the update that caused the delta, if any.
    pub client_token: Option<String>,
}

impl Envelope for ShadowDeltaUpdatedEvent {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .field("state", Value::Object(self.state.clone()))
            .field("version", self.version)
            .optional("timestamp", self.timestamp)
            .optional("metadata", self.metadata.clone())
            .optional("clientToken", self.client_token.clone())
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            state: fields.required("state")?,
            version: fields.required("version")?,
            timestamp: fields.optional("timestamp")?,
            metadata: fields.optional("metadata")?,
            client_token: fields.optional("clientToken")?,
        })
    }
}

/// Request for the full current shadow document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetShadowRequest {
    /// Correlation token echoed in the response.
    pub client_token: Option<String>,
}

impl Envelope for GetShadowRequest {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .optional("clientToken", self.client_token.clone())
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        Ok(Self {
            client_token: Fields::new(document).optional("clientToken")?,
        })
    }
}

impl Correlated for GetShadowRequest {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// The full shadow document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetShadowResponse {
    /// Desired, reported and delta partitions.
    pub state: Option<ShadowState>,
    /// Per-field timestamps.
    pub metadata: Option<Document>,
    /// Current version.
    pub version: Option<u64>,
    /// Echoed correlation token.
    pub client_token: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
}

impl Envelope for GetShadowResponse {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .envelope("state", self.state.as_ref())
            .optional("metadata", self.metadata.clone())
            .optional("version", self.version)
            .optional("clientToken", self.client_token.clone())
            .optional("timestamp", self.timestamp)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            state: fields.envelope("state")?,
            metadata: fields.optional("metadata")?,
            version: fields.optional("version")?,
            client_token: fields.optional("clientToken")?,
            timestamp: fields.optional("timestamp")?,
        })
    }
}

impl Correlated for GetShadowResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Request to delete the shadow.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteShadowRequest {
    /// Correlation token echoed in the response.
    pub client_token: Option<String>,
    /// Expected current version.
    pub version: Option<u64>,
}

impl Envelope for DeleteShadowRequest {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .optional("clientToken", self.client_token.clone())
            .optional("version", self.version)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            client_token: fields.optional("clientToken")?,
            version: fields.optional("version")?,
        })
    }
}

impl Correlated for DeleteShadowRequest {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Acknowledgement of a delete.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteShadowResponse {
    /// Version of the deleted document.
    pub version: Option<u64>,
    /// Echoed correlation token.
    pub client_token: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
}

impl Envelope for DeleteShadowResponse {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .optional("version", self.version)
            .optional("clientToken", self.client_token.clone())
            .optional("timestamp", self.timestamp)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            version: fields.optional("version")?,
            client_token: fields.optional("clientToken")?,
            timestamp: fields.optional("timestamp")?,
        })
    }
}

impl Correlated for DeleteShadowResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    fn object(value: Value) -> Document {
        match value {
            Value::Object(document) => document,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_update_request_wire_shape() {
        let request = UpdateShadowRequest::mirrored("T", "power", json!("on"));

        assert_eq!(
            Value::Object(request.encode()),
            json!({
                "clientToken": "T",
                "state": {
                    "desired": {"power": "on"},
                    "reported": {"power": "on"}
                }
            })
        );
    }

    #[test]
    fn test_null_partition_survives_round_trip() {
        let state = ShadowState {
            desired: Some(Value::Null),
            reported: None,
            delta: None,
        };

        let encoded = state.encode();
        assert_eq!(Value::Object(encoded.clone()), json!({"desired": null}));
        assert_eq!(ShadowState::decode(&encoded), Ok(state));
    }

    #[test]
    fn test_partition_must_be_object_or_null() {
        let document = object(json!({"desired": "on"}));
        assert_eq!(
            ShadowState::decode(&document),
            Err(DecodeError::TypeMismatch("desired"))
        );
    }

    #[test]
    fn test_delta_requires_state_and_version() {
        assert_eq!(
            ShadowDeltaUpdatedEvent::decode(&object(json!({"state": {"power": "on"}}))),
            Err(DecodeError::MissingField("version"))
        );
        assert_eq!(
            ShadowDeltaUpdatedEvent::decode(&object(json!({"version": 6}))),
            Err(DecodeError::MissingField("state"))
        );
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let document = object(json!({
            "code": 409,
            "message": "Version conflict",
            "clientToken": "T",
            "requestId": "ignored"
        }));

        let response = ErrorResponse::decode(&document).unwrap();
        assert_eq!(response.code, 409);
        assert_eq!(response.message.as_deref(), Some("Version conflict"));
        assert_eq!(response.client_token(), Some("T"));
    }

    #[test]
    fn test_accepted_response_exposes_reported_property() {
        let payload = br#"{"version":6,"clientToken":"T","state":{"reported":{"power":"on"}}}"#;
        let response = UpdateShadowResponse::from_payload(payload).unwrap();

        assert_eq!(response.version, 6);
        assert_eq!(
            response.state.as_ref().and_then(|s| s.reported_property("power")),
            Some(&json!("on"))
        );
        assert_eq!(response.client_token(), Some("T"));
    }

    fn arb_partition() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            Just(Some(Value::Null)),
            "[a-z]{1,8}".prop_map(|v| Some(json!({ "power": v }))),
        ]
    }

    proptest! {
        #[test]
        fn prop_get_response_any_optional_subset(
            desired in arb_partition(),
            reported in arb_partition(),
            version in proptest::option::of(any::<u64>()),
            token in proptest::option::of("[a-f0-9-]{1,36}"),
            timestamp in proptest::option::of(any::<u64>()),
            with_state in any::<bool>(),
        ) {
            let response = GetShadowResponse {
                state: with_state.then(|| ShadowState { desired, reported, delta: None }),
                metadata: None,
                version,
                client_token: token,
                timestamp,
            };

            prop_assert_eq!(GetShadowResponse::decode(&response.encode()), Ok(response));
        }

        #[test]
        fn prop_delete_request_any_optional_subset(
            token in proptest::option::of("[a-z0-9]{1,12}"),
            version in proptest::option::of(any::<u64>()),
        ) {
            let request = DeleteShadowRequest { client_token: token, version };
            let encoded = request.encode();

            prop_assert_eq!(encoded.len(), usize::from(request.client_token.is_some()) + usize::from(request.version.is_some()));
            prop_assert_eq!(DeleteShadowRequest::decode(&encoded), Ok(request));
        }
    }

    fn arb_token() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[a-f0-9-]{1,36}")
    }

    fn arb_state() -> impl Strategy<Value = ShadowState> {
        (arb_partition(), arb_partition(), arb_partition()).prop_map(|(desired, reported, delta)| {
            ShadowState {
                desired,
                reported,
                delta,
            }
        })
    }

    fn arb_metadata() -> impl Strategy<Value = Option<Document>> {
        proptest::option::of(
            any::<u32>().prop_map(|at| object(json!({"desired": {"power": {"timestamp": at}}}))),
        )
    }

    fn arb_delta_state() -> impl Strategy<Value = Document> {
        prop_oneof![
            Just(object(json!({"power": null}))),
            "[a-z]{1,8}".prop_map(|v| object(json!({ "power": v }))),
            ("[a-z]{1,8}", any::<u8>())
                .prop_map(|(v, level)| object(json!({ "power": v, "level": level }))),
        ]
    }

    proptest! {
        #[test]
        fn prop_update_request_any_optional_subset(
            client_token in "[a-f0-9-]{1,36}",
            state in arb_state(),
            version in proptest::option::of(any::<u64>()),
        ) {
            let request = UpdateShadowRequest { client_token, state, version };
            prop_assert_eq!(UpdateShadowRequest::decode(&request.encode()), Ok(request));
        }

        #[test]
        fn prop_update_response_any_optional_subset(
            version in any::<u64>(),
            state in proptest::option::of(arb_state()),
            metadata in arb_metadata(),
            client_token in arb_token(),
            timestamp in proptest::option::of(any::<u64>()),
        ) {
            let response = UpdateShadowResponse { version, state, metadata, client_token, timestamp };
            prop_assert_eq!(UpdateShadowResponse::decode(&response.encode()), Ok(response));
        }

        #[test]
        fn prop_error_response_any_optional_subset(
            code in any::<u16>(),
            message in proptest::option::of("[a-zA-Z ]{0,24}"),
            client_token in arb_token(),
            timestamp in proptest::option::of(any::<u64>()),
        ) {
            let response = ErrorResponse { code, message, client_token, timestamp };
            prop_assert_eq!(ErrorResponse::decode(&response.encode()), Ok(response));
        }

        #[test]
        fn prop_delta_event_any_optional_subset(
            state in arb_delta_state(),
            version in any::<u64>(),
            timestamp in proptest::option::of(any::<u64>()),
            metadata in arb_metadata(),
            client_token in arb_token(),
        ) {
            let event = ShadowDeltaUpdatedEvent { state, version, timestamp, metadata, client_token };
            prop_assert_eq!(ShadowDeltaUpdatedEvent::decode(&event.encode()), Ok(event));
        }

        #[test]
        fn prop_get_request_any_optional_subset(client_token in arb_token()) {
            let request = GetShadowRequest { client_token };
            prop_assert_eq!(GetShadowRequest::decode(&request.encode()), Ok(request));
        }

        #[test]
        fn prop_delete_response_any_optional_subset(
            version in proptest::option::of(any::<u64>()),
            client_token in arb_token(),
            timestamp in proptest::option::of(any::<u64>()),
        ) {
            let response = DeleteShadowResponse { version, client_token, timestamp };
            prop_assert_eq!(DeleteShadowResponse::decode(&response.encode()), Ok(response));
        }
    }
}
