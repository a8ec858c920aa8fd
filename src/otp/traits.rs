use std::future::Future;

use crate::error::Error;
use crate::types::{ConfigId, GenerateResponse, OtpConfig, ValidationResult};

/// A code submitted for validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub config_id: ConfigId,
    pub otp_code: String,
    /// Required for HOTP, never sent for TOTP.
    pub counter: Option<u64>,
}

/// Backend operations the OTP controllers depend on.
///
/// Implemented by [`SessionGuard`](crate::guard::SessionGuard), so every call
/// a controller makes goes through auth-failure handling. Tests substitute an
/// in-memory backend.
pub trait OtpBackend: Send + Sync + 'static {
    /// Current backend view of a config, including the authoritative HOTP counter.
    fn fetch_config(
        &self,
        config_id: ConfigId,
    ) -> impl Future<Output = Result<OtpConfig, Error>> + Send;

    /// Generate one code. `counter_increment` is `Some` only for HOTP.
    fn generate(
        &self,
        config_id: ConfigId,
        counter_increment: Option<bool>,
    ) -> impl Future<Output = Result<GenerateResponse, Error>> + Send;

    fn validate(
        &self,
        request: ValidationRequest,
    ) -> impl Future<Output = Result<ValidationResult, Error>> + Send;
}
