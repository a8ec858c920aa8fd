//! In-memory [`OtpBackend`] for controller tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;
use tokio::sync::Semaphore;

use super::traits::{OtpBackend, ValidationRequest};
use crate::error::Error;
use crate::types::{
    ConfigId, GenerateResponse, OtpAlgorithm, OtpConfig, OtpType, ValidationResult,
};

pub(crate) struct FakeBackend {
    config: Mutex<OtpConfig>,
    code_override: Option<String>,
    issued: Mutex<Vec<String>>,
    gated: bool,
    gate: Semaphore,
    pub(crate) generate_calls: AtomicUsize,
    pub(crate) fetch_calls: AtomicUsize,
    pub(crate) validate_calls: AtomicUsize,
    pub(crate) fail_generate: AtomicBool,
    pub(crate) fail_validate: AtomicBool,
    last_increment: Mutex<Option<Option<bool>>>,
    last_validation: Mutex<Option<ValidationRequest>>,
}

impl FakeBackend {
    pub(crate) fn totp(interval: u32) -> Self {
        Self::new(OtpConfig {
            id: ConfigId(1),
            name: "VPN".into(),
            otp_type: OtpType::Totp,
            algorithm: OtpAlgorithm::Sha1,
            digits: 6,
            interval,
            counter: 0,
            issuer: "Acme".into(),
            is_active: true,
        })
    }

    pub(crate) fn hotp(counter: u64) -> Self {
        Self::new(OtpConfig {
            id: ConfigId(1),
            name: "Door".into(),
            otp_type: OtpType::Hotp,
            algorithm: OtpAlgorithm::Sha1,
            digits: 6,
            interval: 30,
            counter,
            issuer: "Acme".into(),
            is_active: true,
        })
    }

    fn new(config: OtpConfig) -> Self {
        Self {
            config: Mutex::new(config),
            code_override: None,
            issued: Mutex::new(Vec::new()),
            gated: false,
            gate: Semaphore::new(0),
            generate_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
            fail_generate: AtomicBool::new(false),
            fail_validate: AtomicBool::new(false),
            last_increment: Mutex::new(None),
            last_validation: Mutex::new(None),
        }
    }

    /// Backend calls block until [`release`](Self::release) is called.
    pub(crate) fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub(crate) fn release(&self) {
        self.gate.add_permits(1);
    }

    pub(crate) fn with_code_override(mut self, code: &str) -> Self {
        self.code_override = Some(code.to_owned());
        self
    }

    pub(crate) fn config(&self) -> OtpConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// `counter_increment` of the last generate call: outer `None` if there
    /// was none.
    pub(crate) fn last_counter_increment(&self) -> Option<Option<bool>> {
        *self.last_increment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn last_validation(&self) -> Option<ValidationRequest> {
        self.last_validation.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn pass_gate(&self) {
        if self.gated {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
    }
}

impl OtpBackend for FakeBackend {
    async fn fetch_config(&self, _config_id: ConfigId) -> Result<OtpConfig, Error> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.config())
    }

    async fn generate(
        &self,
        config_id: ConfigId,
        counter_increment: Option<bool>,
    ) -> Result<GenerateResponse, Error> {
        let n = self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_increment.lock().unwrap_or_else(PoisonError::into_inner) = Some(counter_increment);
        self.pass_gate().await;

        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(Error::Api {
                status: 500,
                message: "boom".into(),
            });
        }

        let (code, remaining_seconds, next_counter) = {
            let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            let width = usize::from(config.digits);
            let code = self
                .code_override
                .clone()
                .unwrap_or_else(|| format!("{:0>width$}", 100_000 + n));
            match config.otp_type {
                OtpType::Totp => (code, Some(i64::from(config.interval)), None),
                OtpType::Hotp => {
                    if counter_increment == Some(true) {
                        config.counter += 1;
                    }
                    (code, None, Some(config.counter))
                }
            }
        };
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(code.clone());

        Ok(GenerateResponse {
            otp_code: code,
            config_id,
            remaining_seconds,
            next_counter,
            generated_at: OffsetDateTime::now_utc(),
        })
    }

    async fn validate(&self, request: ValidationRequest) -> Result<ValidationResult, Error> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_validation.lock().unwrap_or_else(PoisonError::into_inner) = Some(request.clone());
        self.pass_gate().await;

        if self.fail_validate.load(Ordering::SeqCst) {
            return Err(Error::NotFound("OTP configuration not found".into()));
        }

        let is_valid = request.otp_code == "123456"
            || self
                .issued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&request.otp_code);
        Ok(ValidationResult {
            is_valid,
            config_id: request.config_id,
            message: if is_valid { "OTP is valid" } else { "Invalid OTP code" }.into(),
        })
    }
}
