use std::sync::Arc;
use std::time::Instant;

use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::outcome::{ApiOutcome, Unreachable, classify};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::token::TokenStore;
use crate::types::{
    AuditLogEntry, BulkGenerateResult, ConfigId, CreatedOtpConfig, EnhancedOtpStats,
    GenerateResponse, HealthStatus, MessageResponse, MfaSetup, NewOtpConfig, NewUser, OtpConfig,
    OtpStats, RecentOtpEvent, SystemMetrics, TokenResponse, UserMetrics, UserProfile, ValidationResult,
};

const NO_BODY: Option<&()> = None;

/// `POST /token` body.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa_code: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    config_id: ConfigId,
    #[serde(skip_serializing_if = "Option::is_none")]
    counter_increment: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    config_id: ConfigId,
    otp_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    counter: Option<u64>,
}

#[derive(Serialize)]
struct PasswordChangeRequest<'a> {
    current_password: &'a str,
    new_password: &'a str,
}

#[derive(Serialize)]
struct MfaCodeRequest<'a> {
    mfa_code: &'a str,
}

/// Typed wrapper over the backend's HTTP contract.
///
/// Each operation attaches the bearer token from the [`TokenStore`] when one
/// is live and classifies the response into an [`ApiOutcome`]. Nothing here
/// interprets auth failures; that is the session guard's job.
#[derive(Clone)]
pub struct ApiClient {
    base_url: Url,
    http: reqwest::Client,
    tokens: Arc<TokenStore>,
    /// Sent instead of the store's token when set.
    bearer: Option<String>,
}

impl ApiClient {
    #[must_use]
    pub fn new(base_url: Url, tokens: Arc<TokenStore>) -> Self {
        Self {
            base_url: normalize_base(base_url),
            http: reqwest::Client::new(),
            tokens,
            bearer: None,
        }
    }

    /// Build a client with the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn from_config(config: &ClientConfig, tokens: Arc<TokenStore>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self::new(config.base_url.clone(), tokens).with_http_client(http))
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// A copy that authenticates every request with `access_token` instead
    /// of reading the token store.
    #[must_use]
    pub fn with_bearer(&self, access_token: &str) -> Self {
        Self {
            bearer: Some(access_token.to_owned()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    // ── Auth & account ────────────────────────────────────────────────

    pub async fn login(&self, request: &LoginRequest<'_>) -> ApiOutcome<TokenResponse> {
        self.call("login", Method::POST, "token", &[], Some(request)).await
    }

    pub async fn signup(&self, user: &NewUser) -> ApiOutcome<UserProfile> {
        self.call("signup", Method::POST, "users/", &[], Some(user)).await
    }

    /// `GET /users/`, admin only.
    pub async fn list_users(&self) -> ApiOutcome<Vec<UserProfile>> {
        self.call("list_users", Method::GET, "users/", &[], NO_BODY).await
    }

    pub async fn current_user(&self) -> ApiOutcome<UserProfile> {
        self.call("current_user", Method::GET, "users/me/", &[], NO_BODY).await
    }

    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> ApiOutcome<MessageResponse> {
        let body = PasswordChangeRequest {
            current_password,
            new_password,
        };
        self.call("change_password", Method::POST, "users/me/change-password", &[], Some(&body))
            .await
    }

    pub async fn enable_mfa(&self) -> ApiOutcome<MfaSetup> {
        self.call("enable_mfa", Method::POST, "users/me/mfa/enable", &[], NO_BODY).await
    }

    pub async fn verify_mfa(&self, mfa_code: &str) -> ApiOutcome<MessageResponse> {
        let body = MfaCodeRequest { mfa_code };
        self.call("verify_mfa", Method::POST, "users/me/mfa/verify", &[], Some(&body)).await
    }

    pub async fn disable_mfa(&self) -> ApiOutcome<MessageResponse> {
        self.call("disable_mfa", Method::POST, "users/me/mfa/disable", &[], NO_BODY).await
    }

    // ── OTP configs ───────────────────────────────────────────────────

    pub async fn list_configs(&self) -> ApiOutcome<Vec<OtpConfig>> {
        self.call("list_configs", Method::GET, "otp/configs/", &[], NO_BODY).await
    }

    pub async fn fetch_config(&self, config_id: ConfigId) -> ApiOutcome<OtpConfig> {
        let path = format!("otp/configs/{config_id}");
        self.call("fetch_config", Method::GET, &path, &[], NO_BODY).await
    }

    pub async fn create_config(&self, config: &NewOtpConfig) -> ApiOutcome<CreatedOtpConfig> {
        self.call("create_config", Method::POST, "otp/configs/", &[], Some(config)).await
    }

    pub async fn delete_config(&self, config_id: ConfigId) -> ApiOutcome<Option<MessageResponse>> {
        let path = format!("otp/configs/{config_id}");
        self.call("delete_config", Method::DELETE, &path, &[], NO_BODY).await
    }

    // ── Generation & validation ───────────────────────────────────────

    /// `counter_increment` is only sent when `Some` (HOTP configs).
    pub async fn generate_otp(
        &self,
        config_id: ConfigId,
        counter_increment: Option<bool>,
    ) -> ApiOutcome<GenerateResponse> {
        let body = GenerateRequest {
            config_id,
            counter_increment,
        };
        self.call("generate_otp", Method::POST, "otp/generate", &[], Some(&body)).await
    }

    /// `POST /otp/bulk/generate`. The backend never advances HOTP counters here.
    pub async fn bulk_generate(&self, config_ids: &[ConfigId]) -> ApiOutcome<BulkGenerateResult> {
        self.call("bulk_generate", Method::POST, "otp/bulk/generate", &[], Some(config_ids))
            .await
    }

    pub async fn validate_otp(
        &self,
        config_id: ConfigId,
        otp_code: &str,
        counter: Option<u64>,
    ) -> ApiOutcome<ValidationResult> {
        let body = ValidateRequest {
            config_id,
            otp_code,
            counter,
        };
        self.call("validate_otp", Method::POST, "otp/validate", &[], Some(&body)).await
    }

    // ── Metrics & audit ───────────────────────────────────────────────

    pub async fn system_metrics(&self) -> ApiOutcome<SystemMetrics> {
        self.call("system_metrics", Method::GET, "system/metrics", &[], NO_BODY).await
    }

    pub async fn user_metrics(&self) -> ApiOutcome<UserMetrics> {
        self.call("user_metrics", Method::GET, "user/metrics", &[], NO_BODY).await
    }

    pub async fn otp_stats(&self) -> ApiOutcome<OtpStats> {
        self.call("otp_stats", Method::GET, "otp/stats", &[], NO_BODY).await
    }

    pub async fn enhanced_stats(&self) -> ApiOutcome<EnhancedOtpStats> {
        self.call("enhanced_stats", Method::GET, "otp/stats/enhanced", &[], NO_BODY).await
    }

    pub async fn recent_events(&self, limit: u32) -> ApiOutcome<Vec<RecentOtpEvent>> {
        let query = [("limit", limit.to_string())];
        self.call("recent_events", Method::GET, "otp/events/recent", &query, NO_BODY).await
    }

    pub async fn audit_logs(&self, limit: u32) -> ApiOutcome<Vec<AuditLogEntry>> {
        let query = [("limit", limit.to_string())];
        self.call("audit_logs", Method::GET, "audit/logs", &query, NO_BODY).await
    }

    pub async fn audit_timeline(&self, hours: u32) -> ApiOutcome<Vec<AuditLogEntry>> {
        let query = [("hours", hours.to_string())];
        self.call("audit_timeline", Method::GET, "audit/timeline", &query, NO_BODY).await
    }

    pub async fn health(&self) -> ApiOutcome<HealthStatus> {
        self.call("health", Method::GET, "health", &[], NO_BODY).await
    }

    // ── Transport ─────────────────────────────────────────────────────

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url, url::ParseError> {
        let mut url = self.base_url.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn call<B, T>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> ApiOutcome<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = match self.endpoint(path, query) {
            Ok(url) => url,
            Err(e) => {
                return ApiOutcome::Unreachable(Unreachable::new(
                    format!("invalid endpoint '{path}': {e}"),
                    None,
                ));
            }
        };

        let mut request = self.http.request(method, url);
        if let Some(token) = self.bearer.clone().or_else(|| self.tokens.access_token()) {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(operation, error = %e, "Backend request failed");
                return ApiOutcome::Unreachable(Unreachable::new(e.to_string(), None));
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(operation, status, error = %e, "Failed to read response body");
                return ApiOutcome::Unreachable(Unreachable::new(e.to_string(), None));
            }
        };

        tracing::debug!(
            operation,
            status,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Backend responded"
        );

        classify(status, content_type.as_deref(), &text)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("pinned", &self.bearer.is_some())
            .finish_non_exhaustive()
    }
}

/// Makes `join` append to the base path instead of replacing its last segment.
fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
