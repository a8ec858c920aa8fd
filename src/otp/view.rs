use std::sync::Arc;

use super::generation::{GenerationController, GenerationOptions, GenerationState};
use super::traits::OtpBackend;
use super::validation::{ValidationController, ValidationState};
use crate::error::Error;
use crate::types::{ConfigId, OtpConfig, OtpGenerationResult, ValidationResult};

/// Everything one opened config owns: its generation and validation
/// controllers.
///
/// Each view starts from fresh state, so nothing carries over between
/// configs opened one after another. Closing or dropping the view cancels
/// the countdown and abandons in-flight requests.
///
/// ```rust,ignore
/// let view = client.open_config(ConfigId(3)).await?;
/// let code = view.generate().await?;
/// let mut updates = view.generation().subscribe();
/// while updates.changed().await.is_ok() {
///     render(&*updates.borrow());
/// }
/// ```
pub struct ConfigView<B> {
    config_id: ConfigId,
    generation: GenerationController<B>,
    validation: ValidationController<B>,
}

impl<B: OtpBackend> ConfigView<B> {
    /// Fetches `config_id` and builds controllers for it.
    ///
    /// # Errors
    ///
    /// Whatever fetching the config fails with, e.g. [`Error::NotFound`].
    pub async fn open(
        backend: Arc<B>,
        config_id: ConfigId,
        options: GenerationOptions,
    ) -> Result<Self, Error> {
        let config = backend.fetch_config(config_id).await?;
        tracing::debug!(%config_id, otp_type = %config.otp_type, "Config view opened");
        Ok(Self::with_config(backend, config, options))
    }

    /// Builds a view around an already fetched config.
    #[must_use]
    pub fn with_config(backend: Arc<B>, config: OtpConfig, options: GenerationOptions) -> Self {
        let config_id = config.id;
        let validation = ValidationController::new(backend.clone(), config.id, config.otp_type);
        let generation = GenerationController::new(backend, config, options);
        Self {
            config_id,
            generation,
            validation,
        }
    }

    /// Shorthand for [`GenerationController::generate`].
    pub async fn generate(&self) -> Result<OtpGenerationResult, Error> {
        self.generation.generate().await
    }

    /// Shorthand for [`ValidationController::validate`].
    pub async fn validate(&self, code: &str, counter: Option<u64>) -> Result<ValidationResult, Error> {
        self.validation.validate(code, counter).await
    }
}

impl<B> ConfigView<B> {
    #[must_use]
    pub fn config_id(&self) -> ConfigId {
        self.config_id
    }

    /// Advisory copy of the config; see [`OtpConfig`].
    #[must_use]
    pub fn config(&self) -> OtpConfig {
        self.generation.config()
    }

    #[must_use]
    pub fn generation(&self) -> &GenerationController<B> {
        &self.generation
    }

    #[must_use]
    pub fn validation(&self) -> &ValidationController<B> {
        &self.validation
    }

    #[must_use]
    pub fn generation_state(&self) -> GenerationState {
        self.generation.state()
    }

    #[must_use]
    pub fn validation_state(&self) -> ValidationState {
        self.validation.state()
    }

    /// Tears the view down. Later calls fail with [`Error::TornDown`].
    pub fn close(&self) {
        self.generation.teardown();
        self.validation.teardown();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.generation.is_torn_down()
    }
}

impl<B> std::fmt::Debug for ConfigView<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigView")
            .field("config_id", &self.config_id)
            .field("generation", &self.generation)
            .field("validation", &self.validation)
            .finish()
    }
}
