use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Client configuration.
///
/// The backend base URL is the only required field: it is a constructor
/// parameter, so there is no runtime "missing field" error.
///
/// ```rust,ignore
/// use openpam_client::ClientConfig;
///
/// let config = ClientConfig::new("http://localhost:8000".parse()?)
///     .with_session_file("/tmp/openpam-session.json")
///     .with_auto_refresh(true);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) session_file: Option<PathBuf>,
    pub(crate) auto_refresh: bool,
    pub(crate) increment_hotp_counter: bool,
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            session_file: None,
            auto_refresh: false,
            increment_hotp_counter: true,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `OTP_API_BASE_URL`: backend base URL (must be a valid URL)
    ///
    /// # Optional env vars
    /// - `OTP_API_TIMEOUT_SECS`: whole-request timeout (default 30)
    /// - `OTP_API_CONNECT_TIMEOUT_SECS`: connect timeout (default 10)
    /// - `OTP_SESSION_FILE`: persist the session to this JSON file
    /// - `OTP_AUTO_REFRESH`: `"1"` or `"true"` to regenerate TOTP codes on expiry
    /// - `OTP_HOTP_INCREMENT`: `"0"` or `"false"` to stop advancing HOTP counters on generate
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is missing or any value fails to parse.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is missing or any value fails to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let base_url_str = lookup("OTP_API_BASE_URL")
            .ok_or_else(|| Error::Config("OTP_API_BASE_URL is required".into()))?;
        let base_url: Url = base_url_str
            .parse()
            .map_err(|e| Error::Config(format!("OTP_API_BASE_URL: {e}")))?;

        let mut config = Self::new(base_url);

        if let Some(secs) = lookup("OTP_API_TIMEOUT_SECS") {
            config = config.with_timeout(parse_secs("OTP_API_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("OTP_API_CONNECT_TIMEOUT_SECS") {
            config = config.with_connect_timeout(parse_secs("OTP_API_CONNECT_TIMEOUT_SECS", &secs)?);
        }
        if let Some(path) = lookup("OTP_SESSION_FILE").filter(|p| !p.trim().is_empty()) {
            config = config.with_session_file(path);
        }
        if let Some(flag) = lookup("OTP_AUTO_REFRESH") {
            config = config.with_auto_refresh(parse_flag("OTP_AUTO_REFRESH", &flag)?);
        }
        if let Some(flag) = lookup("OTP_HOTP_INCREMENT") {
            config = config.with_hotp_counter_increment(parse_flag("OTP_HOTP_INCREMENT", &flag)?);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    /// Regenerate a TOTP code as soon as its countdown reaches zero.
    #[must_use]
    pub fn with_auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    /// Send `counter_increment: true` with HOTP generation requests (default).
    #[must_use]
    pub fn with_hotp_counter_increment(mut self, enabled: bool) -> Self {
        self.increment_hotp_counter = enabled;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn session_file(&self) -> Option<&std::path::Path> {
        self.session_file.as_deref()
    }

    #[must_use]
    pub fn auto_refresh(&self) -> bool {
        self.auto_refresh
    }

    #[must_use]
    pub fn increment_hotp_counter(&self) -> bool {
        self.increment_hotp_counter
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, Error> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}
