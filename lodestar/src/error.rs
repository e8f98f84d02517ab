//! Error taxonomy for Data API client operations
//!
//! Every failure surfaces as a single [`Error`] enum. [`ErrorKind`] is the
//! fieldless tag callers match on when they only care about the category,
//! and it doubles as the label used for metrics.
//!
//! Server-reported errors are translated once through [`ERROR_CODES`];
//! codes missing from the table become [`Error::Api`].

use crate::command::ApiErrorEntry;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Largest upper bound accepted by `countDocuments`
pub const MAX_COUNT_UPPER_BOUND: u64 = 1000;

/// Category of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NamespaceNotFound,
    CollectionNotFound,
    DocumentAlreadyExists,
    InvalidArgument,
    TooManyDocuments,
    Auth,
    ExhaustedTopology,
    FaultyResponse,
    GenericApi,
    IllegalState,
    Config,
}

impl ErrorKind {
    /// Get the kind as a string for metrics labeling
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NamespaceNotFound => "namespace_not_found",
            ErrorKind::CollectionNotFound => "collection_not_found",
            ErrorKind::DocumentAlreadyExists => "document_already_exists",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::TooManyDocuments => "too_many_documents",
            ErrorKind::Auth => "auth",
            ErrorKind::ExhaustedTopology => "exhausted_topology",
            ErrorKind::FaultyResponse => "faulty_response",
            ErrorKind::GenericApi => "generic_api",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server error codes (or exception classes) with a dedicated kind.
///
/// Keys are unique; anything not listed maps to [`ErrorKind::GenericApi`].
pub const ERROR_CODES: &[(&str, ErrorKind)] = &[
    ("NAMESPACE_DOES_NOT_EXIST", ErrorKind::NamespaceNotFound),
    ("KEYSPACE_DOES_NOT_EXIST", ErrorKind::NamespaceNotFound),
    ("COLLECTION_NOT_EXIST", ErrorKind::CollectionNotFound),
    ("DOCUMENT_ALREADY_EXISTS", ErrorKind::DocumentAlreadyExists),
    ("INVALID_REQUEST", ErrorKind::InvalidArgument),
    ("INVALID_ARGUMENT", ErrorKind::InvalidArgument),
    ("INVALID_FILTER_EXPRESSION", ErrorKind::InvalidArgument),
    ("INVALID_COLLECTION_NAME", ErrorKind::InvalidArgument),
    ("INVALID_JSONAPI_COMMAND", ErrorKind::InvalidArgument),
    ("SHRED_BAD_DOCUMENT_TYPE", ErrorKind::InvalidArgument),
    ("TOO_MANY_DOCUMENTS_TO_COUNT", ErrorKind::TooManyDocuments),
    ("UNAUTHENTICATED_REQUEST", ErrorKind::Auth),
];

/// Look up the kind registered for a server error code
pub fn kind_for_code(code: &str) -> Option<ErrorKind> {
    ERROR_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, kind)| *kind)
}

/// Last failure observed in one datacenter before moving on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatacenterFailure {
    /// Datacenter identifier
    pub datacenter: String,
    /// Attempts spent in this datacenter
    pub attempts: u32,
    /// Description of the last failed attempt
    pub last_error: String,
}

/// Server-reported failure without a more specific mapping
#[derive(Debug, Clone)]
pub struct ApiFailure {
    pub error_code: Option<String>,
    pub exception_class: Option<String>,
    pub message: String,
    /// Every error entry from the response, first one included
    pub errors: Vec<ApiErrorEntry>,
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors that can occur while talking to a Data API deployment
#[derive(Error, Debug)]
pub enum Error {
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Document already exists: {0}")]
    DocumentAlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Too many documents: more than {limit} match")]
    TooManyDocuments { limit: u64 },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{}", exhausted_message(.attempts, .failures, .deadline_exceeded))]
    ExhaustedTopology {
        attempts: u32,
        failures: Vec<DatacenterFailure>,
        deadline_exceeded: bool,
    },

    #[error("Faulty response: {0}")]
    FaultyResponse(String),

    #[error("Server error: {0}")]
    Api(ApiFailure),

    #[error("Command failed with status {}", Value::Object(.status.clone()))]
    CommandFailed { status: Map<String, Value> },

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Cursor error: {0}")]
    CursorState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn exhausted_message(attempts: &u32, failures: &[DatacenterFailure], deadline_exceeded: &bool) -> String {
    let reason = if *deadline_exceeded {
        "Deadline exceeded"
    } else {
        "All nodes failed"
    };
    let detail = failures
        .iter()
        .map(|f| format!("{} ({} attempts): {}", f.datacenter, f.attempts, f.last_error))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} after {} attempts [{}]", reason, attempts, detail)
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NamespaceNotFound(_) => ErrorKind::NamespaceNotFound,
            Error::CollectionNotFound(_) => ErrorKind::CollectionNotFound,
            Error::DocumentAlreadyExists(_) => ErrorKind::DocumentAlreadyExists,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::TooManyDocuments { .. } => ErrorKind::TooManyDocuments,
            Error::Auth(_) => ErrorKind::Auth,
            Error::ExhaustedTopology { .. } => ErrorKind::ExhaustedTopology,
            Error::FaultyResponse(_) => ErrorKind::FaultyResponse,
            Error::Api(_) | Error::CommandFailed { .. } | Error::HttpStatus { .. } => {
                ErrorKind::GenericApi
            }
            Error::CursorState(_) => ErrorKind::IllegalState,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Translate server-reported errors, keyed on the first entry
    pub(crate) fn from_server_errors(errors: Vec<ApiErrorEntry>) -> Self {
        let Some(first) = errors.first() else {
            return Error::FaultyResponse("error list is empty".to_string());
        };

        let kind = first
            .error_code
            .as_deref()
            .and_then(kind_for_code)
            .or_else(|| first.exception_class.as_deref().and_then(kind_for_code))
            .unwrap_or(ErrorKind::GenericApi);

        let message = first
            .message
            .clone()
            .or_else(|| first.error_code.clone())
            .unwrap_or_else(|| "unknown server error".to_string());

        match kind {
            ErrorKind::NamespaceNotFound => Error::NamespaceNotFound(message),
            ErrorKind::CollectionNotFound => Error::CollectionNotFound(message),
            ErrorKind::DocumentAlreadyExists => Error::DocumentAlreadyExists(message),
            ErrorKind::InvalidArgument => Error::InvalidArgument(message),
            ErrorKind::TooManyDocuments => Error::TooManyDocuments {
                limit: MAX_COUNT_UPPER_BOUND,
            },
            ErrorKind::Auth => Error::Auth(message),
            _ => Error::Api(ApiFailure {
                error_code: first.error_code.clone(),
                exception_class: first.exception_class.clone(),
                message,
                errors,
            }),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::FaultyResponse(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
