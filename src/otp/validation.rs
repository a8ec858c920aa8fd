//! Validation Controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::InFlight;
use super::traits::{OtpBackend, ValidationRequest};
use crate::error::Error;
use crate::types::{ConfigId, OtpType, ValidationResult};

/// Shown when the backend gave no usable message.
pub const GENERIC_FAILURE_MESSAGE: &str = "OTP validation failed";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ValidationState {
    #[default]
    Idle,
    Validating,
    /// The backend's answer, valid or not. Display-only.
    Verdict(ValidationResult),
    Failed {
        message: String,
    },
}

/// Submits candidate codes for one config, one at a time.
///
/// A verdict is stored for display and nothing else: validation never
/// touches the config (a HOTP counter is not assumed to have moved) and is
/// never retried.
pub struct ValidationController<B> {
    backend: Arc<B>,
    config_id: ConfigId,
    otp_type: OtpType,
    state: watch::Sender<ValidationState>,
    in_flight: AtomicBool,
    cancel: CancellationToken,
}

impl<B: OtpBackend> ValidationController<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, config_id: ConfigId, otp_type: OtpType) -> Self {
        let (state, _) = watch::channel(ValidationState::Idle);
        Self {
            backend,
            config_id,
            otp_type,
            state,
            in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Validates `code`. `counter` is required for HOTP and ignored for TOTP.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if `code` is empty or not all digits
    /// - [`Error::CounterRequired`] for a HOTP config without `counter`
    /// - [`Error::ValidationInFlight`] while another validation is pending
    /// - [`Error::TornDown`] after teardown
    /// - the backend error otherwise
    ///
    /// The first two are rejected before any request is sent.
    pub async fn validate(&self, code: &str, counter: Option<u64>) -> Result<ValidationResult, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::TornDown);
        }
        // Taken before the pre-checks so a bad submission cannot overwrite
        // the state of a pending one.
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            return Err(Error::ValidationInFlight);
        };
        let request = match self.build_request(code, counter) {
            Ok(request) => request,
            Err(e) => {
                self.publish(ValidationState::Failed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        self.publish(ValidationState::Validating);

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::TornDown),
            outcome = self.backend.validate(request) => outcome,
        };

        match outcome {
            Ok(result) => {
                tracing::debug!(config_id = %self.config_id, is_valid = result.is_valid, "OTP validated");
                self.publish(ValidationState::Verdict(result.clone()));
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(config_id = %self.config_id, error = %e, "OTP validation failed");
                self.publish(ValidationState::Failed {
                    message: failure_message(&e),
                });
                Err(e)
            }
        }
    }

    fn build_request(&self, code: &str, counter: Option<u64>) -> Result<ValidationRequest, Error> {
        let code = code.trim();
        if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidInput(
                "OTP code must be a non-empty string of digits".into(),
            ));
        }
        let counter = match self.otp_type {
            OtpType::Hotp => Some(counter.ok_or(Error::CounterRequired)?),
            OtpType::Totp => None,
        };
        Ok(ValidationRequest {
            config_id: self.config_id,
            otp_code: code.to_owned(),
            counter,
        })
    }
}

impl<B> ValidationController<B> {
    #[must_use]
    pub fn state(&self) -> ValidationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ValidationState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_validating(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Discards the displayed verdict.
    pub fn reset(&self) {
        if !self.in_flight.load(Ordering::Acquire) {
            self.publish(ValidationState::Idle);
        }
    }

    pub fn teardown(&self) {
        self.cancel.cancel();
    }

    fn publish(&self, state: ValidationState) {
        if !self.cancel.is_cancelled() {
            self.state.send_replace(state);
        }
    }
}

impl<B> Drop for ValidationController<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<B> std::fmt::Debug for ValidationController<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationController")
            .field("config_id", &self.config_id)
            .field("otp_type", &self.otp_type)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// The backend's own words when it sent any, otherwise the generic message.
fn failure_message(error: &Error) -> String {
    match error {
        Error::Unauthenticated(message)
        | Error::Forbidden(message)
        | Error::NotFound(message)
        | Error::InvalidInput(message)
        | Error::Api { message, .. }
            if !message.is_empty() =>
        {
            message.clone()
        }
        Error::ValidationRejected(_) => error.to_string(),
        _ => GENERIC_FAILURE_MESSAGE.to_owned(),
    }
}
