use crate::codec::{Correlated, DecodeError, Document, DocumentBuilder, Envelope, FieldValue, Fields};

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// The status of a job execution.
///
/// `Succeeded` is written as `SUCCEEDED`, the spelling the jobs service uses.
/// Readers also accept the legacy `SUCCESS` written by older SDK marshallers,
/// so documents from either side decode, but peers that only understand
/// `SUCCESS` will not recognise what this crate writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Waiting to be picked up by the device.
    Queued,
    /// The device is working on it.
    InProgress,
    /// The device reported failure.
    Failed,
    /// The device reported success.
    Succeeded,
    /// Cancelled by the owner.
    Canceled,
    /// The device refused the job.
    Rejected,
    /// Removed before completion.
    Removed,
}

impl JobStatus {
    /// The wire spelling of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Failed => "FAILED",
            Self::Succeeded => "SUCCEEDED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Removed => "REMOVED",
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "FAILED" => Ok(Self::Failed),
            // Older services spell it SUCCESS.
            "SUCCEEDED" | "SUCCESS" => Ok(Self::Succeeded),
            "CANCELED" => Ok(Self::Canceled),
            "REJECTED" => Ok(Self::Rejected),
            "REMOVED" => Ok(Self::Removed),
            other => Err(DecodeError::UnknownVariant {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl FieldValue for JobStatus {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        String::read(field, value)?
            .parse::<Self>()
            .map_err(|e| match e {
                DecodeError::UnknownVariant { value, .. } => {
                    DecodeError::UnknownVariant { field, value }
                }
                other => other,
            })
    }
}

/// Error codes returned on a jobs `rejected` channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobsErrorCode {
    /// The request was sent to a topic the service does not serve.
    InvalidTopic,
    /// The payload was not valid JSON.
    InvalidJson,
    /// The request contents were invalid.
    InvalidRequest,
    /// The requested status transition is not allowed.
    InvalidStateTransition,
    /// The job or execution does not exist.
    ResourceNotFound,
    /// The expected version did not match.
    VersionMismatch,
    /// The service failed internally.
    InternalError,
    /// Too many requests.
    RequestThrottled,
    /// The execution already reached a terminal status.
    TerminalStateReached,
}

impl JobsErrorCode {
    /// The wire spelling of this code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTopic => "InvalidTopic",
            Self::InvalidJson => "InvalidJson",
            Self::InvalidRequest => "InvalidRequest",
            Self::InvalidStateTransition => "InvalidStateTransition",
            Self::ResourceNotFound => "ResourceNotFound",
            Self::VersionMismatch => "VersionMismatch",
            Self::InternalError => "InternalError",
            Self::RequestThrottled => "RequestThrottled",
            Self::TerminalStateReached => "TerminalStateReached",
        }
    }
}

impl fmt::Display for JobsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobsErrorCode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InvalidTopic" => Ok(Self::InvalidTopic),
            "InvalidJson" => Ok(Self::InvalidJson),
            "InvalidRequest" => Ok(Self::InvalidRequest),
            "InvalidStateTransition" => Ok(Self::InvalidStateTransition),
            "ResourceNotFound" => Ok(Self::ResourceNotFound),
            "VersionMismatch" => Ok(Self::VersionMismatch),
            "InternalError" => Ok(Self::InternalError),
            "RequestThrottled" => Ok(Self::RequestThrottled),
            "TerminalStateReached" => Ok(Self::TerminalStateReached),
            other => Err(DecodeError::UnknownVariant {
                field: "code",
                value: other.to_string(),
            }),
        }
    }
}

impl FieldValue for JobsErrorCode {
    fn read(field: &'static str, value: &Value) -> Result<Self, DecodeError> {
        String::read(field, value)?
            .parse::<Self>()
            .map_err(|e| match e {
                DecodeError::UnknownVariant { value, .. } => {
                    DecodeError::UnknownVariant { field, value }
                }
                other => other,
            })
    }
}

/// A snapshot of one job execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobExecutionData {
    /// Job identifier.
    pub job_id: Option<String>,
    /// The thing executing the job.
    pub thing_name: Option<String>,
    /// The job document, when requested.
    pub job_document: Option<Document>,
    /// Current status.
    pub status: Option<JobStatus>,
    /// Seconds since epoch.
    pub queued_at: Option<u64>,
    /// Seconds since epoch.
    pub started_at: Option<u64>,
    /// Seconds since epoch.
    pub last_updated_at: Option<u64>,
    /// Version of the execution record.
    pub version_number: Option<i64>,
    /// Which execution of the job this is.
    pub execution_number: Option<i64>,
}

impl Envelope for JobExecutionData {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .optional("jobId", self.job_id.clone())
            .optional("thingName", self.thing_name.clone())
            .optional("jobDocument", self.job_document.clone())
            .optional("status", self.status.map(|s| s.as_str()))
            .optional("queuedAt", self.queued_at)
            .optional("startedAt", self.started_at)
            .optional("lastUpdatedAt", self.last_updated_at)
            .optional("versionNumber", self.version_number)
            .optional("executionNumber", self.execution_number)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            job_id: fields.optional("jobId")?,
            thing_name: fields.optional("thingName")?,
            job_document: fields.optional("jobDocument")?,
            status: fields.optional("status")?,
            queued_at: fields.optional("queuedAt")?,
            started_at: fields.optional("startedAt")?,
            last_updated_at: fields.optional("lastUpdatedAt")?,
            version_number: fields.optional("versionNumber")?,
            execution_number: fields.optional("executionNumber")?,
        })
    }
}

/// Request to describe a job execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescribeJobExecutionRequest {
    /// Correlation token echoed in the response.
    pub client_token: Option<String>,
    /// A specific execution; the latest when absent.
    pub execution_number: Option<i64>,
    /// Whether to include the job document.
    pub include_job_document: Option<bool>,
}

impl Envelope for DescribeJobExecutionRequest {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .optional("clientToken", self.client_token.clone())
            .optional("executionNumber", self.execution_number)
            .optional("includeJobDocument", self.include_job_document)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            client_token: fields.optional("clientToken")?,
            execution_number: fields.optional("executionNumber")?,
            include_job_document: fields.optional("includeJobDocument")?,
        })
    }
}

impl Correlated for DescribeJobExecutionRequest {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Response on the `accepted` channel of a describe request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescribeJobExecutionResponse {
    /// Echoed correlation token.
    pub client_token: Option<String>,
    /// The described execution.
    pub execution: Option<JobExecutionData>,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
}

impl Envelope for DescribeJobExecutionResponse {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .optional("clientToken", self.client_token.clone())
            .envelope("execution", self.execution.as_ref())
            .optional("timestamp", self.timestamp)
            .build()
    }

    fn decode(document: &Document) -> Result<Self, DecodeError> {
        let fields = Fields::new(document);

        Ok(Self {
            client_token: fields.optional("clientToken")?,
            execution: fields.envelope("execution")?,
            timestamp: fields.optional("timestamp")?,
        })
    }
}

impl Correlated for DescribeJobExecutionResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Response on a jobs `rejected` channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobsError {
    /// What went wrong.
    pub code: JobsErrorCode,
    /// Human readable description.
    pub message: Option<String>,
    /// Echoed correlation token.
    pub client_token: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<u64>,
}

impl Envelope for JobsError {
    fn encode(&self) -> Document {
        DocumentBuilder::new()
            .field("code", self.code.as_str())
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

impl Correlated for JobsError {
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
    fn test_status_parses_legacy_success() {
        assert_eq!("SUCCESS".parse::<JobStatus>(), Ok(JobStatus::Succeeded));
        assert_eq!("SUCCEEDED".parse::<JobStatus>(), Ok(JobStatus::Succeeded));
        assert_eq!(JobStatus::Succeeded.as_str(), "SUCCEEDED");
    }

    #[test]
    fn test_succeeded_is_written_as_succeeded() {
        let execution = JobExecutionData {
            status: Some(JobStatus::Succeeded),
            ..JobExecutionData::default()
        };
        assert_eq!(
            Value::Object(execution.encode()),
            json!({"status": "SUCCEEDED"})
        );

        let legacy = object(json!({"status": "SUCCESS"}));
        assert_eq!(
            JobExecutionData::decode(&legacy).map(|e| e.status),
            Ok(Some(JobStatus::Succeeded))
        );
    }

    #[test]
    fn test_unknown_status_is_an_error() {
        let document = object(json!({"status": "PAUSED"}));
        assert_eq!(
            JobExecutionData::decode(&document),
            Err(DecodeError::UnknownVariant {
                field: "status",
                value: "PAUSED".to_string()
            })
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Removed.is_terminal());
    }

    #[test]
    fn test_describe_response_decodes_nested_execution() {
        let payload = json!({
            "clientToken": "T",
            "timestamp": 1_700_000_000_u64,
            "execution": {
                "jobId": "firmware-7",
                "thingName": "lamp",
                "status": "IN_PROGRESS",
                "executionNumber": 1,
                "versionNumber": 2,
                "jobDocument": {"url": "https://example.invalid/fw.bin"}
            }
        });

        let response = DescribeJobExecutionResponse::decode(&object(payload)).unwrap();
        let execution = response.execution.unwrap();

        assert_eq!(execution.job_id.as_deref(), Some("firmware-7"));
        assert_eq!(execution.status, Some(JobStatus::InProgress));
        assert_eq!(execution.execution_number, Some(1));
        assert!(execution.job_document.is_some());
    }

    #[test]
    fn test_jobs_error_code_is_closed() {
        let known = object(json!({"code": "ResourceNotFound", "message": "no such job"}));
        assert_eq!(
            JobsError::decode(&known).map(|e| e.code),
            Ok(JobsErrorCode::ResourceNotFound)
        );

        let unknown = object(json!({"code": "Teapot"}));
        assert!(matches!(
            JobsError::decode(&unknown),
            Err(DecodeError::UnknownVariant { field: "code", .. })
        ));
    }

    const STATUSES: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::Failed,
        JobStatus::Succeeded,
        JobStatus::Canceled,
        JobStatus::Rejected,
        JobStatus::Removed,
    ];

    const ERROR_CODES: [JobsErrorCode; 9] = [
        JobsErrorCode::InvalidTopic,
        JobsErrorCode::InvalidJson,
        JobsErrorCode::InvalidRequest,
        JobsErrorCode::InvalidStateTransition,
        JobsErrorCode::ResourceNotFound,
        JobsErrorCode::VersionMismatch,
        JobsErrorCode::InternalError,
        JobsErrorCode::RequestThrottled,
        JobsErrorCode::TerminalStateReached,
    ];

    fn arb_token() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[a-f0-9-]{1,36}")
    }

    fn arb_execution() -> impl Strategy<Value = JobExecutionData> {
        (
            (
                proptest::option::of("[a-z0-9-]{1,16}"),
                proptest::option::of("[a-z0-9]{1,16}"),
                proptest::option::of("[a-z]{1,8}".prop_map(|url| object(json!({ "url": url })))),
                proptest::option::of(proptest::sample::select(STATUSES.to_vec())),
            ),
            (
                proptest::option::of(any::<u64>()),
                proptest::option::of(any::<u64>()),
                proptest::option::of(any::<u64>()),
                proptest::option::of(any::<i64>()),
                proptest::option::of(any::<i64>()),
            ),
        )
            .prop_map(
                |(
                    (job_id, thing_name, job_document, status),
                    (queued_at, started_at, last_updated_at, version_number, execution_number),
                )| JobExecutionData {
                    job_id,
                    thing_name,
                    job_document,
                    status,
                    queued_at,
                    started_at,
                    last_updated_at,
                    version_number,
                    execution_number,
                },
            )
    }

    proptest! {
        #[test]
        fn prop_execution_any_optional_subset(execution in arb_execution()) {
            prop_assert_eq!(JobExecutionData::decode(&execution.encode()), Ok(execution));
        }

        #[test]
        fn prop_describe_request_any_optional_subset(
            client_token in arb_token(),
            execution_number in proptest::option::of(any::<i64>()),
            include_job_document in proptest::option::of(any::<bool>()),
        ) {
            let request = DescribeJobExecutionRequest {
                client_token,
                execution_number,
                include_job_document,
            };

            prop_assert_eq!(DescribeJobExecutionRequest::decode(&request.encode()), Ok(request));
        }

        #[test]
        fn prop_describe_response_any_optional_subset(
            client_token in arb_token(),
            execution in proptest::option::of(arb_execution()),
            timestamp in proptest::option::of(any::<u64>()),
        ) {
            let response = DescribeJobExecutionResponse {
                client_token,
                execution,
                timestamp,
            };

            prop_assert_eq!(DescribeJobExecutionResponse::decode(&response.encode()), Ok(response));
        }

        #[test]
        fn prop_jobs_error_any_optional_subset(
            code in proptest::sample::select(ERROR_CODES.to_vec()),
            message in proptest::option::of("[a-zA-Z ]{0,24}"),
            client_token in arb_token(),
            timestamp in proptest::option::of(any::<u64>()),
        ) {
            let error = JobsError {
                code,
                message,
                client_token,
                timestamp,
            };

            prop_assert_eq!(JobsError::decode(&error.encode()), Ok(error));
        }
    }
}
