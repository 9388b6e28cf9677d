//! Structured error surface shared across the resiliency core.

use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Classification of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Transport-level failure with no HTTP response (DNS, connect, reset).
    Network,
    /// The call (or its timeout wrapper) ran out of time.
    Timeout,
    /// The backend answered with a non-2xx HTTP status.
    Http,
    /// The backend answered 2xx but the body carried an error object.
    Backend,
    /// Rejected by an open circuit breaker without calling the backend.
    CircuitOpen,
    /// Aborted through a cancellation token.
    Cancelled,
    /// The backend reported neither an error nor any data.
    NoData,
    /// A bug-shaped failure inside this library or its collaborators.
    Internal,
}

/// Structured error for wrapped backend operations.
///
/// Carries the HTTP status and backend error code/details where derivable so
/// retry classification and caller-side messaging can inspect them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    kind: ApiErrorKind,
    message: String,
    status: Option<u16>,
    code: Option<String>,
    details: Option<String>,
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Network,
            message: message.into(),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Timeout,
            message: message.into(),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Http,
            message: message.into(),
            status: Some(status),
            code: None,
            details: None,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Backend,
            message: message.into(),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn circuit_open() -> Self {
        Self {
            kind: ApiErrorKind::CircuitOpen,
            message: String::from("circuit breaker is open; request rejected without reaching the backend"),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ApiErrorKind::Cancelled,
            message: String::from("operation aborted by cancellation signal"),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn no_data() -> Self {
        Self {
            kind: ApiErrorKind::NoData,
            message: String::from("backend reported success but returned no data"),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Internal,
            message: message.into(),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub const fn kind(&self) -> ApiErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn backend_code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub const fn error_code(&self) -> &'static str {
        match self.kind {
            ApiErrorKind::Network => "core.network",
            ApiErrorKind::Timeout => "core.timeout",
            ApiErrorKind::Http => "core.http",
            ApiErrorKind::Backend => "core.backend",
            ApiErrorKind::CircuitOpen => "core.circuit_open",
            ApiErrorKind::Cancelled => "core.cancelled",
            ApiErrorKind::NoData => "core.no_data",
            ApiErrorKind::Internal => "core.internal",
        }
    }

    /// Default retry classification.
    ///
    /// Network-level failures and timeouts retry; HTTP failures retry on
    /// 5xx, 408 and 429; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ApiErrorKind::Network | ApiErrorKind::Timeout => true,
            ApiErrorKind::Http => self.status.is_some_and(retryable_status),
            // A backend error without an HTTP status is treated as a
            // transient backend fault.
            ApiErrorKind::Backend => self.status.map_or(true, retryable_status),
            ApiErrorKind::CircuitOpen
            | ApiErrorKind::Cancelled
            | ApiErrorKind::NoData
            | ApiErrorKind::Internal => false,
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.error_code())
    }
}

impl std::error::Error for ApiError {}

const fn retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// Contract violations caught at the call boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("target table name cannot be empty")]
    EmptyTableName,
    #[error("cache key cannot be empty")]
    EmptyCacheKey,
    #[error("backend base URL cannot be empty")]
    EmptyBaseUrl,
    #[error("batch concurrency must be greater than zero")]
    ZeroBatchConcurrency,
}

/// Errors surfaced by the offline queue's bookkeeping.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] coral_store::StoreError),
}
