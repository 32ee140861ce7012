//! Error taxonomy, typed failures, and their wire representations.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::error;

/// Classified error kinds.
///
/// Codes are grouped in stable ranges (1xx auth, 2xx browser operation,
/// 3xx resource lifecycle, 4xx input validation, 5xx system) so new kinds
/// can be added without renumbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorKind {
    // Authentication (1xx)
    InvalidCredentials,
    TokenExpired,
    InvalidToken,
    InsufficientPermissions,

    // Browser operation (2xx)
    NavigationFailed,
    Timeout,
    ElementNotFound,
    JavascriptError,
    PageCrash,

    // Resource lifecycle (3xx)
    ResourceExhausted,
    BrowserLaunchFailed,
    ContextCreationFailed,
    ResourceNotFound,

    // Input validation (4xx)
    InvalidUrl,
    InvalidSelector,
    InvalidParameters,
    InvalidOperation,

    // System (5xx)
    InternalError,
    DependencyError,
    NetworkError,
    RateLimited,
}

/// Coarse grouping of [`ErrorKind`]s, derived from the code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Authentication,
    Operation,
    Lifecycle,
    Validation,
    System,
}

impl ErrorKind {
    /// Every kind, in code order.
    pub const ALL: [ErrorKind; 21] = [
        ErrorKind::InvalidCredentials,
        ErrorKind::TokenExpired,
        ErrorKind::InvalidToken,
        ErrorKind::InsufficientPermissions,
        ErrorKind::NavigationFailed,
        ErrorKind::Timeout,
        ErrorKind::ElementNotFound,
        ErrorKind::JavascriptError,
        ErrorKind::PageCrash,
        ErrorKind::ResourceExhausted,
        ErrorKind::BrowserLaunchFailed,
        ErrorKind::ContextCreationFailed,
        ErrorKind::ResourceNotFound,
        ErrorKind::InvalidUrl,
        ErrorKind::InvalidSelector,
        ErrorKind::InvalidParameters,
        ErrorKind::InvalidOperation,
        ErrorKind::InternalError,
        ErrorKind::DependencyError,
        ErrorKind::NetworkError,
        ErrorKind::RateLimited,
    ];

    /// Stable numeric code.
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidCredentials => 100,
            Self::TokenExpired => 101,
            Self::InvalidToken => 102,
            Self::InsufficientPermissions => 103,
            Self::NavigationFailed => 200,
            Self::Timeout => 201,
            Self::ElementNotFound => 202,
            Self::JavascriptError => 203,
            Self::PageCrash => 204,
            Self::ResourceExhausted => 300,
            Self::BrowserLaunchFailed => 301,
            Self::ContextCreationFailed => 302,
            Self::ResourceNotFound => 303,
            Self::InvalidUrl => 400,
            Self::InvalidSelector => 401,
            Self::InvalidParameters => 402,
            Self::InvalidOperation => 403,
            Self::InternalError => 500,
            Self::DependencyError => 501,
            Self::NetworkError => 502,
            Self::RateLimited => 503,
        }
    }

    /// Wire name, e.g. `RESOURCE_EXHAUSTED`.
    pub fn name(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            Self::NavigationFailed => "NAVIGATION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::ElementNotFound => "ELEMENT_NOT_FOUND",
            Self::JavascriptError => "JAVASCRIPT_ERROR",
            Self::PageCrash => "PAGE_CRASH",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::BrowserLaunchFailed => "BROWSER_LAUNCH_FAILED",
            Self::ContextCreationFailed => "CONTEXT_CREATION_FAILED",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidSelector => "INVALID_SELECTOR",
            Self::InvalidParameters => "INVALID_PARAMETERS",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DependencyError => "DEPENDENCY_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimited => "RATE_LIMITED",
        }
    }

    /// Group this kind belongs to, from its code range.
    pub fn class(self) -> ErrorClass {
        match self.code() / 100 {
            1 => ErrorClass::Authentication,
            2 => ErrorClass::Operation,
            3 => ErrorClass::Lifecycle,
            4 => ErrorClass::Validation,
            _ => ErrorClass::System,
        }
    }

    /// HTTP status for this kind. Kinds without an explicit mapping
    /// resolve to 500.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidCredentials | Self::TokenExpired | Self::InvalidToken => 401,
            Self::InsufficientPermissions => 403,
            Self::NavigationFailed | Self::JavascriptError => 400,
            Self::Timeout => 504,
            Self::ElementNotFound | Self::ResourceNotFound => 404,
            Self::ResourceExhausted | Self::RateLimited => 429,
            Self::InvalidUrl
            | Self::InvalidSelector
            | Self::InvalidParameters
            | Self::InvalidOperation => 400,
            Self::NetworkError => 502,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A classified failure: kind, human message, optional structured details
/// and an optional underlying cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BrowserError {
    kind: ErrorKind,
    message: String,
    details: Option<Map<String, Value>>,
    #[source]
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, BrowserError>;

impl BrowserError {
    /// A failure with no details or cause.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            cause: None,
        }
    }

    /// Convert an arbitrary error into an `INTERNAL_ERROR` failure.
    pub fn wrap<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::wrap_as(err, ErrorKind::InternalError)
    }

    /// Convert an arbitrary error into a failure of the given kind, keeping
    /// its message, its type name under `details.exception_type`, and the
    /// error itself as the cause.
    pub fn wrap_as<E>(err: E, kind: ErrorKind) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let type_name = short_type_name::<E>();
        let message = match err.to_string() {
            m if m.is_empty() => format!("An error of type {type_name} occurred"),
            m => m,
        };
        Self::new(kind, message)
            .with_detail("exception_type", type_name)
            .with_cause(err)
    }

    /// Replace the details map.
    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    /// Set one detail entry, creating the map if needed.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Attach the underlying error.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.cause = Some(cause.into());
        self
    }

    /// Taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured context, if any was attached.
    pub fn details(&self) -> Option<&Map<String, Value>> {
        self.details.as_ref()
    }

    /// Underlying error, if this failure wraps one.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// HTTP status for this failure's kind.
    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Wire error object for this failure.
    pub fn to_error_detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }

    /// `{ success: false, error }` envelope for this failure.
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            success: false,
            error: self.to_error_detail(),
        }
    }

    /// Status code plus wire error object.
    pub fn to_http_error(&self) -> HttpError {
        HttpError {
            status_code: self.http_status(),
            detail: self.to_error_detail(),
        }
    }
}

impl From<std::io::Error> for BrowserError {
    fn from(err: std::io::Error) -> Self {
        Self::wrap(err)
    }
}

impl From<serde_json::Error> for BrowserError {
    fn from(err: serde_json::Error) -> Self {
        Self::wrap(err)
    }
}

impl From<anyhow::Error> for BrowserError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<BrowserError>() {
            Ok(typed) => typed,
            Err(err) => {
                let message = err.to_string();
                Self::new(ErrorKind::InternalError, message)
                    .with_detail("exception_type", "anyhow::Error")
                    .with_cause(err)
            }
        }
    }
}

/// Wire error object: `{ code, message, details }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorKind,
    pub message: String,
    pub details: Option<Map<String, Value>>,
}

/// Standard failed-call envelope returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

/// Transport-layer rendering: the status code plus the wire error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpError {
    pub status_code: u16,
    pub detail: ErrorDetail,
}

/// Run a fallible operation and turn any failure into an [`ErrorResponse`],
/// logging it under the operation's name. Untyped errors become
/// `INTERNAL_ERROR`.
pub async fn handle_errors<T, E, F>(operation: &str, fut: F) -> std::result::Result<T, ErrorResponse>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<BrowserError>,
{
    match fut.await {
        Ok(value) => Ok(value),
        Err(err) => {
            let err: BrowserError = err.into();
            error!(
                operation,
                code = %err.kind(),
                cause = ?err.cause(),
                "{}",
                err.message()
            );
            Err(err.to_error_response())
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid value {value:?} for {var}")]
    Env { var: String, value: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
