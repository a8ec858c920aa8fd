use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::{Error, FieldError};

/// Every gateway call ends in exactly one of these.
#[derive(Debug, Clone)]
pub enum ApiOutcome<T> {
    Success(T),
    ClientError(ClientError),
    Unreachable(Unreachable),
}

/// An HTTP error answer with a usable body (or an auth failure, whatever its body).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientError {
    pub status: u16,
    pub message: String,
    /// Populated from a `422` `detail: [{loc, msg}]` body.
    pub field_errors: Vec<FieldError>,
    pub body: Option<JsonValue>,
}

impl ClientError {
    /// Reads a boolean flag from the JSON body, `false` when absent.
    #[must_use]
    pub fn body_flag(&self, key: &str) -> bool {
        self.body
            .as_ref()
            .and_then(|b| b.get(key))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}

/// No usable answer: transport failure, non-JSON body, or an unexpected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreachable {
    pub reason: String,
    /// Raw response text, kept for diagnostics.
    pub raw: Option<String>,
}

impl Unreachable {
    pub(crate) fn new(reason: impl Into<String>, raw: Option<String>) -> Self {
        Self {
            reason: reason.into(),
            raw,
        }
    }
}

impl<T> ApiOutcome<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// HTTP status of a client error, if that is what this is.
    #[must_use]
    pub fn error_status(&self) -> Option<u16> {
        match self {
            Self::ClientError(e) => Some(e.status),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiOutcome<U> {
        match self {
            Self::Success(value) => ApiOutcome::Success(f(value)),
            Self::ClientError(e) => ApiOutcome::ClientError(e),
            Self::Unreachable(u) => ApiOutcome::Unreachable(u),
        }
    }

    /// Maps the outcome onto the error taxonomy.
    ///
    /// # Errors
    ///
    /// `401` → [`Error::Unauthenticated`], `403` → [`Error::Forbidden`],
    /// `404` → [`Error::NotFound`], `422` with field errors →
    /// [`Error::ValidationRejected`], any other status → [`Error::Api`],
    /// and [`ApiOutcome::Unreachable`] → [`Error::Unreachable`].
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Unreachable(u) => Err(Error::Unreachable {
                reason: u.reason,
                raw: u.raw,
            }),
            Self::ClientError(e) => Err(match e.status {
                401 => Error::Unauthenticated(e.message),
                403 => Error::Forbidden(e.message),
                404 => Error::NotFound(e.message),
                422 if !e.field_errors.is_empty() => Error::ValidationRejected(e.field_errors),
                status => Error::Api {
                    status,
                    message: e.message,
                },
            }),
        }
    }
}

/// Classifies a finished HTTP exchange.
///
/// A body is only parsed as JSON when the `Content-Type` says JSON (or is
/// absent). `401`/`403` are always client errors, even with an empty or
/// non-JSON body; for every other status a non-JSON body means
/// [`ApiOutcome::Unreachable`] with the raw text kept.
pub fn classify<T: DeserializeOwned>(
    status: u16,
    content_type: Option<&str>,
    body: &str,
) -> ApiOutcome<T> {
    let declared_json = content_type.is_none_or(is_json_media_type);
    let empty = body.trim().is_empty();

    if (200..300).contains(&status) {
        if empty {
            return serde_json::from_value(JsonValue::Null)
                .map(ApiOutcome::Success)
                .unwrap_or_else(|_| {
                    ApiOutcome::Unreachable(Unreachable::new(
                        format!("empty response body (status {status})"),
                        None,
                    ))
                });
        }
        if !declared_json {
            return non_json(status, body);
        }
        let value: JsonValue = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => return non_json(status, body),
        };
        return match serde_json::from_value(value) {
            Ok(payload) => ApiOutcome::Success(payload),
            Err(e) => ApiOutcome::Unreachable(Unreachable::new(
                format!("unexpected response shape: {e}"),
                Some(body.to_owned()),
            )),
        };
    }

    if !(400..600).contains(&status) {
        return ApiOutcome::Unreachable(Unreachable::new(
            format!("unexpected status {status}"),
            (!empty).then(|| body.to_owned()),
        ));
    }

    let parsed: Option<JsonValue> = if declared_json && !empty {
        serde_json::from_str(body).ok()
    } else {
        None
    };

    let auth_failure = status == 401 || status == 403;
    match parsed {
        Some(value) => ApiOutcome::ClientError(client_error(status, value)),
        None if auth_failure => ApiOutcome::ClientError(ClientError {
            status,
            message: default_message(status),
            field_errors: Vec::new(),
            body: None,
        }),
        None if empty && status < 500 => ApiOutcome::ClientError(ClientError {
            status,
            message: default_message(status),
            field_errors: Vec::new(),
            body: None,
        }),
        None => non_json(status, body),
    }
}

fn non_json<T>(status: u16, body: &str) -> ApiOutcome<T> {
    tracing::warn!(status, "Backend answered with a non-JSON body");
    ApiOutcome::Unreachable(Unreachable::new(
        format!("non-JSON response (status {status})"),
        (!body.is_empty()).then(|| body.to_owned()),
    ))
}

fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

fn client_error(status: u16, body: JsonValue) -> ClientError {
    let field_errors = match body.get("detail") {
        Some(JsonValue::Array(items)) => items.iter().filter_map(field_error).collect(),
        _ => Vec::new(),
    };

    let message = match body.get("detail") {
        Some(JsonValue::String(detail)) if !detail.is_empty() => detail.clone(),
        _ if !field_errors.is_empty() => field_errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
        _ => body
            .get("message")
            .and_then(JsonValue::as_str)
            .filter(|m| !m.is_empty())
            .map_or_else(|| default_message(status), str::to_owned),
    };

    ClientError {
        status,
        message,
        field_errors,
        body: Some(body),
    }
}

/// One `{loc: [...], msg: "..."}` entry; the field is the last `loc` segment.
fn field_error(item: &JsonValue) -> Option<FieldError> {
    let message = item.get("msg")?.as_str()?.to_owned();
    let field = match item.get("loc").and_then(JsonValue::as_array).and_then(|l| l.last()) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "request".to_owned(),
    };
    Some(FieldError { field, message })
}

fn default_message(status: u16) -> String {
    match status {
        401 => "Authentication required".to_owned(),
        403 => "You do not have permission to access this resource".to_owned(),
        _ => StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Request failed")
            .to_owned(),
    }
}
