//! Session Guard: the one place auth failures are interpreted.
//!
//! Every backend call made on behalf of a user goes through [`SessionGuard`].
//! A `401` clears the [`TokenStore`] (once, for the session the call was made
//! with) and publishes [`AuthStatus::MustReauthenticate`]; a `403` is returned
//! as [`Error::Forbidden`] and leaves the session alone. Navigation is left to
//! whoever watches [`SessionGuard::subscribe`].

use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::watch;

use crate::error::Error;
use crate::gateway::{ApiClient, ApiOutcome, LoginRequest};
use crate::otp::{OtpBackend, ValidationRequest};
use crate::token::{Session, TokenStore};
use crate::types::{
    AuditLogEntry, BulkGenerateResult, ConfigId, CreatedOtpConfig, EnhancedOtpStats,
    GenerateResponse, HealthStatus, MessageResponse, MfaSetup, NewOtpConfig, NewUser, OtpConfig,
    OtpStats, RecentOtpEvent, SystemMetrics, UserMetrics, UserProfile, ValidationResult,
};

/// Authentication state as seen by an outer navigation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No session, and none was lost.
    Anonymous,
    Authenticated,
    /// The backend rejected the session; send the user to login.
    MustReauthenticate,
}

/// Result of a login attempt that the backend did not reject.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(Session),
    /// Credentials were accepted but the account needs an MFA code. Retry
    /// [`SessionGuard::login`] with the code.
    MfaRequired,
}

#[derive(Clone)]
pub struct SessionGuard {
    api: ApiClient,
    status: Arc<watch::Sender<AuthStatus>>,
}

impl SessionGuard {
    #[must_use]
    pub fn new(api: ApiClient) -> Self {
        let initial = if api.tokens().has_session() {
            AuthStatus::Authenticated
        } else {
            AuthStatus::Anonymous
        };
        let (status, _) = watch::channel(initial);
        Self {
            api,
            status: Arc::new(status),
        }
    }

    #[must_use]
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        self.api.tokens()
    }

    #[must_use]
    pub fn status(&self) -> AuthStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    /// Log in and store the resulting session.
    ///
    /// A rejected login never touches an existing session: the credentials
    /// were wrong, not the token.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] for bad credentials or an invalid MFA code,
    /// [`Error::Unreachable`] when the backend answers without a token.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        mfa_code: Option<&str>,
    ) -> Result<LoginOutcome, Error> {
        let request = LoginRequest {
            username,
            password,
            mfa_code,
        };
        let outcome = self.api.login(&request).await;

        if let ApiOutcome::ClientError(e) = &outcome {
            if e.status == 401 && e.body_flag("mfa_required") {
                tracing::debug!(username, "MFA code required");
                return Ok(LoginOutcome::MfaRequired);
            }
        }

        let response = outcome.into_result()?;
        if response.mfa_required {
            tracing::debug!(username, "MFA code required");
            return Ok(LoginOutcome::MfaRequired);
        }
        if response.access_token.is_empty() {
            return Err(Error::unreachable("login response carried no access token", None));
        }

        let session = Session::new(response.access_token, response.refresh_token);
        let epoch = self.tokens().set_session(session.clone());
        self.status.send_replace(AuthStatus::Authenticated);
        tracing::info!(username, epoch, "Logged in");
        Ok(LoginOutcome::Authenticated(session))
    }

    /// Drop the session. Safe to call with no session.
    pub fn logout(&self) {
        self.tokens().clear();
        self.status.send_replace(AuthStatus::Anonymous);
        tracing::debug!("Logged out");
    }

    // ── Unauthenticated endpoints ─────────────────────────────────────

    pub async fn signup(&self, user: &NewUser) -> Result<UserProfile, Error> {
        self.api.signup(user).await.into_result()
    }

    pub async fn health(&self) -> Result<HealthStatus, Error> {
        self.api.health().await.into_result()
    }

    // ── Authenticated endpoints ───────────────────────────────────────

    pub async fn current_user(&self) -> Result<UserProfile, Error> {
        self.authenticated("current_user", |api| async move { api.current_user().await }).await
    }

    /// Admin only; other users get [`Error::Forbidden`].
    pub async fn list_users(&self) -> Result<Vec<UserProfile>, Error> {
        self.authenticated("list_users", |api| async move { api.list_users().await }).await
    }

    pub async fn list_configs(&self) -> Result<Vec<OtpConfig>, Error> {
        self.authenticated("list_configs", |api| async move { api.list_configs().await }).await
    }

    pub async fn fetch_config(&self, config_id: ConfigId) -> Result<OtpConfig, Error> {
        self.authenticated("fetch_config", |api| async move {
            api.fetch_config(config_id).await
        })
        .await
    }

    pub async fn create_config(&self, config: &NewOtpConfig) -> Result<CreatedOtpConfig, Error> {
        self.authenticated("create_config", |api| async move {
            api.create_config(config).await
        })
        .await
    }

    pub async fn delete_config(&self, config_id: ConfigId) -> Result<(), Error> {
        self.authenticated("delete_config", |api| async move { api.delete_config(config_id).await })
            .await
            .map(|_| ())
    }

    pub async fn generate_otp(
        &self,
        config_id: ConfigId,
        counter_increment: Option<bool>,
    ) -> Result<GenerateResponse, Error> {
        self.authenticated(
            "generate_otp",
            |api| async move { api.generate_otp(config_id, counter_increment).await },
        )
        .await
    }

    /// One code per config; failures are reported per entry, not as an error.
    pub async fn bulk_generate(&self, config_ids: &[ConfigId]) -> Result<BulkGenerateResult, Error> {
        self.authenticated("bulk_generate", |api| async move {
            api.bulk_generate(config_ids).await
        })
        .await
    }

    pub async fn validate_otp(
        &self,
        config_id: ConfigId,
        otp_code: &str,
        counter: Option<u64>,
    ) -> Result<ValidationResult, Error> {
        self.authenticated(
            "validate_otp",
            |api| async move { api.validate_otp(config_id, otp_code, counter).await },
        )
        .await
    }

    pub async fn system_metrics(&self) -> Result<SystemMetrics, Error> {
        self.authenticated("system_metrics", |api| async move { api.system_metrics().await }).await
    }

    pub async fn user_metrics(&self) -> Result<UserMetrics, Error> {
        self.authenticated("user_metrics", |api| async move { api.user_metrics().await }).await
    }

    pub async fn otp_stats(&self) -> Result<OtpStats, Error> {
        self.authenticated("otp_stats", |api| async move { api.otp_stats().await }).await
    }

    pub async fn enhanced_stats(&self) -> Result<EnhancedOtpStats, Error> {
        self.authenticated("enhanced_stats", |api| async move { api.enhanced_stats().await }).await
    }

    pub async fn recent_events(&self, limit: u32) -> Result<Vec<RecentOtpEvent>, Error> {
        self.authenticated("recent_events", |api| async move {
            api.recent_events(limit).await
        })
        .await
    }

    /// Admin only; other users get [`Error::Forbidden`].
    pub async fn audit_logs(&self, limit: u32) -> Result<Vec<AuditLogEntry>, Error> {
        self.authenticated("audit_logs", |api| async move { api.audit_logs(limit).await }).await
    }

    pub async fn audit_timeline(&self, hours: u32) -> Result<Vec<AuditLogEntry>, Error> {
        self.authenticated("audit_timeline", |api| async move {
            api.audit_timeline(hours).await
        })
        .await
    }

    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<MessageResponse, Error> {
        self.authenticated(
            "change_password",
            |api| async move { api.change_password(current_password, new_password).await },
        )
        .await
    }

    pub async fn enable_mfa(&self) -> Result<MfaSetup, Error> {
        self.authenticated("enable_mfa", |api| async move { api.enable_mfa().await }).await
    }

    pub async fn verify_mfa(&self, mfa_code: &str) -> Result<MessageResponse, Error> {
        self.authenticated("verify_mfa", |api| async move { api.verify_mfa(mfa_code).await }).await
    }

    pub async fn disable_mfa(&self) -> Result<MessageResponse, Error> {
        self.authenticated("disable_mfa", |api| async move { api.disable_mfa().await }).await
    }

    // ── Interception ──────────────────────────────────────────────────

    /// Runs `call` against the session that is live right now.
    ///
    /// `call` gets a gateway pinned to that session's token, so a 401 is
    /// always charged to the session that sent it. It is not invoked at all
    /// when there is no usable session.
    async fn authenticated<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, Error>
    where
        F: FnOnce(ApiClient) -> Fut,
        Fut: Future<Output = ApiOutcome<T>>,
    {
        let snapshot = self.tokens().snapshot();
        let epoch = snapshot.epoch;
        let api = match snapshot.session {
            None => {
                tracing::debug!(operation, "No live session, request not sent");
                return Err(Error::Unauthenticated("No active session".to_owned()));
            }
            Some(session) if session.is_expired_at(OffsetDateTime::now_utc()) => {
                tracing::debug!(operation, "Session expired, request not sent");
                self.invalidate(operation, epoch);
                return Err(Error::Unauthenticated("Session expired".to_owned()));
            }
            Some(session) => self.api.with_bearer(session.access_token()),
        };

        let outcome = call(api).await;
        self.settle(operation, epoch, outcome)
    }

    fn settle<T>(&self, operation: &'static str, epoch: u64, outcome: ApiOutcome<T>) -> Result<T, Error> {
        match outcome.error_status() {
            Some(401) => self.invalidate(operation, epoch),
            Some(403) => tracing::debug!(operation, "Access denied, session kept"),
            _ => {}
        }
        outcome.into_result()
    }

    fn invalidate(&self, operation: &'static str, epoch: u64) {
        if self.tokens().invalidate_if_current(epoch) {
            tracing::warn!(operation, "Session rejected by backend, re-authentication required");
            self.status.send_replace(AuthStatus::MustReauthenticate);
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("api", &self.api)
            .field("status", &self.status())
            .finish()
    }
}

impl OtpBackend for SessionGuard {
    fn fetch_config(
        &self,
        config_id: ConfigId,
    ) -> impl Future<Output = Result<OtpConfig, Error>> + Send {
        SessionGuard::fetch_config(self, config_id)
    }

    fn generate(
        &self,
        config_id: ConfigId,
        counter_increment: Option<bool>,
    ) -> impl Future<Output = Result<GenerateResponse, Error>> + Send {
        self.generate_otp(config_id, counter_increment)
    }

    fn validate(
        &self,
        request: ValidationRequest,
    ) -> impl Future<Output = Result<ValidationResult, Error>> + Send {
        async move {
            self.validate_otp(request.config_id, &request.otp_code, request.counter)
                .await
        }
    }
}
