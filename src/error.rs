use std::fmt;

/// A single offending field from a structured `422` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `401`: the session is gone and the user must log in again.
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// `403`: authenticated, but not allowed to touch the resource.
    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{}", join_field_errors(.0))]
    ValidationRejected(Vec<FieldError>),

    /// Network failure or a response body that is not JSON.
    #[error("Server unreachable: {reason}")]
    Unreachable {
        reason: String,
        raw: Option<String>,
    },

    /// Any other 4xx/5xx; `message` is the backend's `detail` when present.
    #[error("Request failed ({status}): {message}")]
    Api { status: u16, message: String },

    /// Rejected client-side before a request was sent.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HOTP validation requires a counter value")]
    CounterRequired,

    #[error("A generation request is already in flight")]
    GenerationInFlight,

    #[error("A validation request is already in flight")]
    ValidationInFlight,

    #[error("The owning view has been closed")]
    TornDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the caller has to send the user back through login.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::Unauthenticated(_))
    }

    pub(crate) fn unreachable(reason: impl Into<String>, raw: Option<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
            raw,
        }
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
