use std::collections::BTreeMap;
use std::fmt;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::error::Error;

/// Backend identifier of an OTP configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct ConfigId(pub i64);

/// Backend identifier of a user account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpType {
    Totp,
    Hotp,
}

impl fmt::Display for OtpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Totp => "totp",
            Self::Hotp => "hotp",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

/// Client view of an OTP configuration.
///
/// Advisory only: after a HOTP generation the backend's counter may be ahead
/// of `counter` until the config is fetched again. The secret key is never
/// part of this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpConfig {
    pub id: ConfigId,
    pub name: String,
    pub otp_type: OtpType,
    pub algorithm: OtpAlgorithm,
    pub digits: u8,
    /// Seconds per TOTP window. Meaningless for HOTP.
    pub interval: u32,
    /// HOTP counter position. Meaningless for TOTP.
    pub counter: u64,
    pub issuer: String,
    pub is_active: bool,
}

impl OtpConfig {
    #[must_use]
    pub fn is_totp(&self) -> bool {
        self.otp_type == OtpType::Totp
    }

    #[must_use]
    pub fn is_hotp(&self) -> bool {
        self.otp_type == OtpType::Hotp
    }
}

/// Payload for `POST /otp/configs/`.
///
/// ```rust,ignore
/// let new = NewOtpConfig::totp("VPN", "Acme Corp")
///     .with_digits(8)
///     .with_algorithm(OtpAlgorithm::Sha256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct NewOtpConfig {
    pub name: String,
    pub otp_type: OtpType,
    pub algorithm: OtpAlgorithm,
    pub digits: u8,
    pub interval: u32,
    pub counter: u64,
    pub issuer: String,
}

impl NewOtpConfig {
    /// Time-based config with the backend defaults (SHA1, 6 digits, 30s).
    #[must_use]
    pub fn totp(name: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self::with_type(OtpType::Totp, name.into(), issuer.into())
    }

    /// Counter-based config starting at counter 0.
    #[must_use]
    pub fn hotp(name: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self::with_type(OtpType::Hotp, name.into(), issuer.into())
    }

    fn with_type(otp_type: OtpType, name: String, issuer: String) -> Self {
        Self {
            name,
            otp_type,
            algorithm: OtpAlgorithm::Sha1,
            digits: 6,
            interval: 30,
            counter: 0,
            issuer,
        }
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: OtpAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn with_digits(mut self, digits: u8) -> Self {
        self.digits = digits;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, seconds: u32) -> Self {
        self.interval = seconds;
        self
    }

    #[must_use]
    pub fn with_counter(mut self, counter: u64) -> Self {
        self.counter = counter;
        self
    }

    /// Checks the constraints the backend enforces, so obviously bad input
    /// never leaves the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("name: must not be empty".into()));
        }
        if self.issuer.trim().is_empty() {
            return Err(Error::InvalidInput("issuer: must not be empty".into()));
        }
        if !(6..=8).contains(&self.digits) {
            return Err(Error::InvalidInput(format!(
                "digits: expected 6, 7 or 8, got {}",
                self.digits
            )));
        }
        if !(10..=300).contains(&self.interval) {
            return Err(Error::InvalidInput(format!(
                "interval: expected 10..=300 seconds, got {}",
                self.interval
            )));
        }
        Ok(())
    }
}

/// Secret key returned once when a config is created.
///
/// Opaque passthrough: redacted in `Debug`, never serialized back out.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct OtpSecret(String);

impl OtpSecret {
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OtpSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OtpSecret(<redacted>)")
    }
}

/// Response to a successful config creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedOtpConfig {
    #[serde(flatten)]
    pub config: OtpConfig,
    #[serde(rename = "secret_key")]
    pub secret: OtpSecret,
}

/// Raw `POST /otp/generate` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    pub otp_code: String,
    pub config_id: ConfigId,
    #[serde(default)]
    pub remaining_seconds: Option<i64>,
    #[serde(default)]
    pub next_counter: Option<u64>,
    #[serde(with = "timestamp")]
    pub generated_at: OffsetDateTime,
}

/// Type-specific part of a generation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationDetail {
    Totp { remaining_seconds: u32 },
    /// `next_counter` is for display only and never fed into validation.
    Hotp { next_counter: Option<u64> },
}

/// One displayed code. Superseded by the next generation, never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpGenerationResult {
    pub config_id: ConfigId,
    pub code: String,
    pub generated_at: OffsetDateTime,
    pub detail: GenerationDetail,
}

impl OtpGenerationResult {
    /// Builds a result from the wire response, checking it against `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unreachable`] when the response is malformed: wrong
    /// code length, a TOTP response without `remaining_seconds`, or a
    /// negative remaining time.
    pub fn from_response(response: GenerateResponse, config: &OtpConfig) -> Result<Self, Error> {
        if response.otp_code.len() != usize::from(config.digits) {
            return Err(Error::unreachable(
                format!(
                    "generated code has {} characters, expected {}",
                    response.otp_code.len(),
                    config.digits
                ),
                None,
            ));
        }

        let detail = match config.otp_type {
            OtpType::Totp => {
                let remaining = response.remaining_seconds.ok_or_else(|| {
                    Error::unreachable("TOTP response is missing remaining_seconds", None)
                })?;
                let remaining = u32::try_from(remaining).map_err(|_| {
                    Error::unreachable(format!("invalid remaining_seconds: {remaining}"), None)
                })?;
                GenerationDetail::Totp {
                    remaining_seconds: remaining.min(config.interval),
                }
            }
            OtpType::Hotp => GenerationDetail::Hotp {
                next_counter: response.next_counter,
            },
        };

        Ok(Self {
            config_id: response.config_id,
            code: response.otp_code,
            generated_at: response.generated_at,
            detail,
        })
    }

    #[must_use]
    pub fn remaining_seconds(&self) -> Option<u32> {
        match self.detail {
            GenerationDetail::Totp { remaining_seconds } => Some(remaining_seconds),
            GenerationDetail::Hotp { .. } => None,
        }
    }

    #[must_use]
    pub fn next_counter(&self) -> Option<u64> {
        match self.detail {
            GenerationDetail::Totp { .. } => None,
            GenerationDetail::Hotp { next_counter } => next_counter,
        }
    }
}

/// One config's entry in a bulk generation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkGenerateItem {
    pub config_id: ConfigId,
    pub success: bool,
    #[serde(default)]
    pub otp_code: Option<String>,
    /// TOTP only.
    #[serde(default)]
    pub remaining_seconds: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `POST /otp/bulk/generate` response, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkGenerateResult {
    pub results: Vec<BulkGenerateItem>,
}

impl BulkGenerateResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &BulkGenerateItem> {
        self.results.iter().filter(|item| item.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &BulkGenerateItem> {
        self.results.iter().filter(|item| !item.success)
    }
}

/// Verdict of `POST /otp/validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub config_id: ConfigId,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
    #[serde(other)]
    Unknown,
}

/// Read-only audit record.
///
/// `details` is whatever the backend stored; use [`AuditLogEntry::detail`]
/// rather than assuming any key exists.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    #[serde(default, rename = "user_id")]
    pub actor_id: Option<UserId>,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub resource_id: Option<i64>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
    pub status: AuditStatus,
    #[serde(default)]
    pub details: JsonValue,
}

impl AuditLogEntry {
    #[must_use]
    pub fn detail(&self, key: &str) -> Option<&JsonValue> {
        self.details.get(key)
    }

    #[must_use]
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.detail(key).and_then(JsonValue::as_str)
    }
}

/// `GET /users/me/` profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub mfa_enabled: bool,
    #[serde(default, with = "timestamp::option")]
    pub last_login: Option<OffsetDateTime>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub access_level: i32,
    #[serde(default)]
    pub must_change_password: bool,
}

/// Signup payload for `POST /users/`.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
}

impl NewUser {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            department: None,
            job_title: None,
        }
    }

    #[must_use]
    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    #[must_use]
    pub fn with_job_title(mut self, job_title: impl Into<String>) -> Self {
        self.job_title = Some(job_title.into());
        self
    }
}

/// `POST /token` response.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub mfa_required: bool,
}

/// Body of simple `{"message": ...}` acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// `POST /users/me/mfa/enable` response.
#[derive(Debug, Clone, Deserialize)]
pub struct MfaSetup {
    pub mfa_uri: String,
    pub mfa_secret: OtpSecret,
}

/// `GET /otp/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OtpStats {
    pub total_configs: u64,
    pub active_configs: u64,
    pub total_generations: u64,
    pub total_validations: u64,
    pub successful_validations: u64,
}

/// `GET /otp/stats/enhanced`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnhancedOtpStats {
    #[serde(flatten)]
    pub totals: OtpStats,
    pub recent_generations: u64,
    pub recent_validations: u64,
    pub recent_success_rate: f64,
    pub analysis_period: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UsageMetrics {
    pub total_generations: u64,
    pub total_validations: u64,
    pub successful_validations: u64,
    #[serde(default)]
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigCounts {
    pub total: u64,
    pub active: u64,
    #[serde(default)]
    pub by_type: BTreeMap<String, u64>,
}

/// `GET /system/metrics` (admin only).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemMetrics {
    pub users: BTreeMap<String, u64>,
    pub configurations: ConfigCounts,
    pub otp_usage: UsageMetrics,
    #[serde(default)]
    pub recent_activity_24h: BTreeMap<String, u64>,
    #[serde(default)]
    pub security: BTreeMap<String, u64>,
}

/// `GET /user/metrics`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserMetrics {
    pub configurations: ConfigCounts,
    pub otp_usage: UsageMetrics,
    #[serde(default)]
    pub recent_activity_7d: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventConfigRef {
    pub name: String,
}

/// Entry of `GET /otp/events/recent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecentOtpEvent {
    pub id: i64,
    pub event_type: String,
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub is_success: Option<bool>,
    pub config: EventConfigRef,
}

/// `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

/// Serde glue for backend timestamps.
///
/// The backend emits naive ISO-8601 (`2024-05-01T12:00:00.123456`) in UTC;
/// RFC 3339 with an offset is accepted too. Serialized as RFC 3339.
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;
    use time::{OffsetDateTime, PrimitiveDateTime};

    pub fn parse(s: &str) -> Option<OffsetDateTime> {
        if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
            return Some(dt);
        }
        let naive = format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
        );
        PrimitiveDateTime::parse(s, naive)
            .ok()
            .map(PrimitiveDateTime::assume_utc)
    }

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = value.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}")))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => parse(&s)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}"))),
                None => Ok(None),
            }
        }
    }
}
