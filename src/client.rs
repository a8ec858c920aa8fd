use std::sync::Arc;

use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::gateway::ApiClient;
use crate::guard::{AuthStatus, LoginOutcome, SessionGuard};
use crate::otp::{ConfigView, GenerationOptions};
use crate::password::{check_new_user, check_password};
use crate::token::TokenStore;
use crate::types::{
    AuditLogEntry, BulkGenerateResult, ConfigId, CreatedOtpConfig, EnhancedOtpStats,
    HealthStatus, MessageResponse, MfaSetup, NewOtpConfig, NewUser, OtpConfig, OtpStats,
    RecentOtpEvent, SystemMetrics, UserMetrics, UserProfile,
};

/// Entry point: token store, gateway and session guard wired from one
/// [`ClientConfig`].
///
/// ```rust,ignore
/// let client = OtpClient::from_env()?;
/// match client.login("alice", "Sup3r$ecretPass", None).await? {
///     LoginOutcome::Authenticated(_) => {}
///     LoginOutcome::MfaRequired => { /* ask for the code, log in again */ }
/// }
/// let view = client.open_config(ConfigId(3)).await?;
/// let code = view.generate().await?;
/// ```
#[derive(Debug, Clone)]
pub struct OtpClient {
    guard: Arc<SessionGuard>,
    options: GenerationOptions,
}

impl OtpClient {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        let tokens = Arc::new(Self::token_store(config));
        let api = ApiClient::from_config(config, tokens)?;
        Ok(Self::with_api(api, config))
    }

    /// [`ClientConfig::from_env`] followed by [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on missing or malformed environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::new(&ClientConfig::from_env()?)
    }

    /// Builds the client around an existing gateway (custom HTTP client or
    /// token store). Only the generation options are taken from `config`.
    #[must_use]
    pub fn with_api(api: ApiClient, config: &ClientConfig) -> Self {
        Self {
            guard: Arc::new(SessionGuard::new(api)),
            options: GenerationOptions {
                auto_refresh: config.auto_refresh,
                increment_hotp_counter: config.increment_hotp_counter,
            },
        }
    }

    #[cfg(feature = "persist")]
    fn token_store(config: &ClientConfig) -> TokenStore {
        match &config.session_file {
            Some(path) => TokenStore::with_storage(crate::token::FileSessionStorage::new(path)),
            None => TokenStore::new(),
        }
    }

    #[cfg(not(feature = "persist"))]
    fn token_store(config: &ClientConfig) -> TokenStore {
        if config.session_file.is_some() {
            tracing::warn!("Session file configured but the `persist` feature is disabled");
        }
        TokenStore::new()
    }

    #[must_use]
    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        self.guard.tokens()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.tokens().has_session()
    }

    #[must_use]
    pub fn auth_status(&self) -> AuthStatus {
        self.guard.status()
    }

    /// Watch this to send the user back to login when the backend drops
    /// the session.
    pub fn subscribe_auth(&self) -> watch::Receiver<AuthStatus> {
        self.guard.subscribe()
    }

    // ── Account ───────────────────────────────────────────────────────

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        mfa_code: Option<&str>,
    ) -> Result<LoginOutcome, Error> {
        self.guard.login(username, password, mfa_code).await
    }

    pub fn logout(&self) {
        self.guard.logout();
    }

    /// Creates an account. Checked locally against the backend's rules first.
    pub async fn signup(&self, user: &NewUser) -> Result<UserProfile, Error> {
        check_new_user(user)?;
        self.guard.signup(user).await
    }

    pub async fn current_user(&self) -> Result<UserProfile, Error> {
        self.guard.current_user().await
    }

    /// Every account. Admin only.
    pub async fn list_users(&self) -> Result<Vec<UserProfile>, Error> {
        self.guard.list_users().await
    }

    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<MessageResponse, Error> {
        check_password(new_password)?;
        self.guard.change_password(current_password, new_password).await
    }

    pub async fn enable_mfa(&self) -> Result<MfaSetup, Error> {
        self.guard.enable_mfa().await
    }

    pub async fn verify_mfa(&self, mfa_code: &str) -> Result<MessageResponse, Error> {
        self.guard.verify_mfa(mfa_code).await
    }

    pub async fn disable_mfa(&self) -> Result<MessageResponse, Error> {
        self.guard.disable_mfa().await
    }

    // ── OTP configs ───────────────────────────────────────────────────

    pub async fn list_configs(&self) -> Result<Vec<OtpConfig>, Error> {
        self.guard.list_configs().await
    }

    pub async fn fetch_config(&self, config_id: ConfigId) -> Result<OtpConfig, Error> {
        self.guard.fetch_config(config_id).await
    }

    /// The returned secret is shown once and never stored.
    pub async fn create_config(&self, config: &NewOtpConfig) -> Result<CreatedOtpConfig, Error> {
        config.validate()?;
        self.guard.create_config(config).await
    }

    pub async fn delete_config(&self, config_id: ConfigId) -> Result<(), Error> {
        self.guard.delete_config(config_id).await
    }

    /// Generates one code for each config. HOTP counters are not advanced.
    pub async fn bulk_generate(&self, config_ids: &[ConfigId]) -> Result<BulkGenerateResult, Error> {
        self.guard.bulk_generate(config_ids).await
    }

    /// Opens a fresh view (generation + validation) for one config.
    pub async fn open_config(&self, config_id: ConfigId) -> Result<ConfigView<SessionGuard>, Error> {
        ConfigView::open(self.guard.clone(), config_id, self.options).await
    }

    // ── Metrics & audit ───────────────────────────────────────────────

    pub async fn system_metrics(&self) -> Result<SystemMetrics, Error> {
        self.guard.system_metrics().await
    }

    pub async fn user_metrics(&self) -> Result<UserMetrics, Error> {
        self.guard.user_metrics().await
    }

    pub async fn otp_stats(&self) -> Result<OtpStats, Error> {
        self.guard.otp_stats().await
    }

    pub async fn enhanced_stats(&self) -> Result<EnhancedOtpStats, Error> {
        self.guard.enhanced_stats().await
    }

    pub async fn recent_events(&self, limit: u32) -> Result<Vec<RecentOtpEvent>, Error> {
        self.guard.recent_events(limit).await
    }

    pub async fn audit_logs(&self, limit: u32) -> Result<Vec<AuditLogEntry>, Error> {
        self.guard.audit_logs(limit).await
    }

    pub async fn audit_timeline(&self, hours: u32) -> Result<Vec<AuditLogEntry>, Error> {
        self.guard.audit_timeline(hours).await
    }

    pub async fn health(&self) -> Result<HealthStatus, Error> {
        self.guard.health().await
    }
}
