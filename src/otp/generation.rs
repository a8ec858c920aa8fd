//! OTP Generation Controller.
//!
//! ```text
//! Idle ─generate─▶ Generating ─ok(totp)─▶ Displayed ─expired─▶ Expiring
//!   ▲                  │   └─ok(hotp)─▶ AwaitingManualRegeneration
//!   └──────err─────────┘        Displayed ─expired + auto-refresh─▶ Generating
//! ```
//!
//! At most one generation request is outstanding per controller; a second
//! [`GenerationController::generate`] while one is pending fails with
//! [`Error::GenerationInFlight`] instead of queueing. Failures are never
//! retried.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::InFlight;
use super::countdown::{Countdown, CountdownEvent};
use super::traits::OtpBackend;
use crate::error::Error;
use crate::types::{ConfigId, GenerationDetail, OtpConfig, OtpGenerationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOptions {
    /// Regenerate a TOTP code as soon as its countdown reaches zero.
    pub auto_refresh: bool,
    /// Value of `counter_increment` sent with HOTP generation requests.
    pub increment_hotp_counter: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            auto_refresh: false,
            increment_hotp_counter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationState {
    Idle {
        /// Message of the generation that failed, if the last one did.
        last_error: Option<String>,
    },
    Generating,
    /// A TOTP code with its live countdown.
    Displayed {
        result: OtpGenerationResult,
        remaining_seconds: u32,
    },
    /// The TOTP window closed; the stale code is still shown.
    Expiring { result: OtpGenerationResult },
    /// A HOTP code. Stays until the user asks for the next one.
    AwaitingManualRegeneration { result: OtpGenerationResult },
}

impl GenerationState {
    /// The code currently on display, if any.
    #[must_use]
    pub fn result(&self) -> Option<&OtpGenerationResult> {
        match self {
            Self::Displayed { result, .. }
            | Self::Expiring { result }
            | Self::AwaitingManualRegeneration { result } => Some(result),
            Self::Idle { .. } | Self::Generating => None,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expiring { .. })
    }
}

impl Default for GenerationState {
    fn default() -> Self {
        Self::Idle { last_error: None }
    }
}

/// Drives generate/display/expire/regenerate for one config.
///
/// Dropping the controller (or calling [`teardown`](Self::teardown)) stops
/// its countdown and abandons any in-flight request; the published state is
/// frozen from then on.
pub struct GenerationController<B> {
    shared: Arc<Shared<B>>,
}

struct Shared<B> {
    backend: Arc<B>,
    /// Advisory copy; refreshed from the backend after each HOTP generation.
    config: Mutex<OtpConfig>,
    increment_hotp_counter: bool,
    auto_refresh: AtomicBool,
    state: watch::Sender<GenerationState>,
    in_flight: AtomicBool,
    timer: Mutex<Option<Timer>>,
    /// Identifies the current timer; events from older timers are dropped.
    timer_seq: AtomicU64,
    cancel: CancellationToken,
}

struct Timer {
    countdown: Countdown,
    pump: JoinHandle<()>,
}

impl<B: OtpBackend> GenerationController<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, config: OtpConfig, options: GenerationOptions) -> Self {
        let (state, _) = watch::channel(GenerationState::default());
        Self {
            shared: Arc::new(Shared {
                backend,
                config: Mutex::new(config),
                increment_hotp_counter: options.increment_hotp_counter,
                auto_refresh: AtomicBool::new(options.auto_refresh),
                state,
                in_flight: AtomicBool::new(false),
                timer: Mutex::new(None),
                timer_seq: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Requests a new code, replacing whatever is displayed.
    ///
    /// # Errors
    ///
    /// [`Error::GenerationInFlight`] if a request is already pending,
    /// [`Error::TornDown`] after teardown, otherwise whatever the backend
    /// call failed with. A failure leaves the controller in
    /// [`GenerationState::Idle`] with the message recorded.
    pub async fn generate(&self) -> Result<OtpGenerationResult, Error> {
        self.shared.generate().await
    }
}

impl<B> GenerationController<B> {
    #[must_use]
    pub fn state(&self) -> GenerationState {
        self.shared.state.borrow().clone()
    }

    /// Receives every state change, including each countdown tick.
    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> OtpConfig {
        self.shared.config()
    }

    #[must_use]
    pub fn config_id(&self) -> ConfigId {
        self.shared.config().id
    }

    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn auto_refresh(&self) -> bool {
        self.shared.auto_refresh.load(Ordering::Acquire)
    }

    /// Takes effect at the next expiry.
    pub fn set_auto_refresh(&self, enabled: bool) {
        self.shared.auto_refresh.store(enabled, Ordering::Release);
    }

    /// Stops the countdown and abandons in-flight work. Idempotent.
    pub fn teardown(&self) {
        self.shared.teardown();
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl<B> Drop for GenerationController<B> {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl<B> std::fmt::Debug for GenerationController<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationController")
            .field("config_id", &self.config_id())
            .field("state", &*self.shared.state.borrow())
            .field("auto_refresh", &self.auto_refresh())
            .finish_non_exhaustive()
    }
}

impl<B> Shared<B> {
    fn config(&self) -> OtpConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn stop_timer(&self) {
        self.timer_seq.fetch_add(1, Ordering::AcqRel);
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.countdown.cancel();
        }
    }

    fn teardown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.timer_seq.fetch_add(1, Ordering::AcqRel);
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.countdown.cancel();
            timer.pump.abort();
        }
        tracing::debug!(config_id = %self.config().id, "Generation controller torn down");
    }

    /// Publishes `state` unless the controller has been torn down.
    fn publish(&self, state: GenerationState) {
        if !self.cancel.is_cancelled() {
            self.state.send_replace(state);
        }
    }
}

impl<B: OtpBackend> Shared<B> {
    async fn generate(self: &Arc<Self>) -> Result<OtpGenerationResult, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::TornDown);
        }
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("Generation already in flight, request rejected");
            return Err(Error::GenerationInFlight);
        };

        // The previous countdown belongs to a code that is being replaced.
        // Detach its pump instead of aborting it: auto-refresh runs inside it.
        self.stop_timer();
        self.publish(GenerationState::Generating);

        let config = self.config();
        let counter_increment = config.is_hotp().then_some(self.increment_hotp_counter);

        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::TornDown),
            response = self.backend.generate(config.id, counter_increment) => response,
        };

        let result = match response.and_then(|r| OtpGenerationResult::from_response(r, &config)) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(config_id = %config.id, error = %e, "OTP generation failed");
                self.publish(GenerationState::Idle {
                    last_error: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        match result.detail {
            GenerationDetail::Totp { remaining_seconds } => {
                tracing::debug!(config_id = %config.id, remaining_seconds, "TOTP code generated");
                self.publish(GenerationState::Displayed {
                    result: result.clone(),
                    remaining_seconds,
                });
                self.start_timer(remaining_seconds);
            }
            GenerationDetail::Hotp { next_counter } => {
                tracing::debug!(config_id = %config.id, ?next_counter, "HOTP code generated");
                self.publish(GenerationState::AwaitingManualRegeneration {
                    result: result.clone(),
                });
                self.refresh_config(config.id).await;
            }
        }

        Ok(result)
    }

    /// Replaces the advisory config with the backend's copy. The HOTP
    /// counter moved server-side; nothing here predicts where to.
    async fn refresh_config(&self, config_id: ConfigId) {
        let fetched = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            fetched = self.backend.fetch_config(config_id) => fetched,
        };
        match fetched {
            Ok(config) => {
                tracing::debug!(%config_id, counter = config.counter, "Config re-fetched after HOTP generation");
                *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
            }
            Err(e) => {
                tracing::warn!(%config_id, error = %e, "Failed to re-fetch config after HOTP generation");
            }
        }
    }

    fn start_timer(self: &Arc<Self>, remaining_seconds: u32) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.timer_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let (countdown, events) = Countdown::start(remaining_seconds);
        let pump = tokio::spawn(pump(Arc::downgrade(self), seq, events));
        *slot = Some(Timer { countdown, pump });
    }

    async fn on_expired(self: &Arc<Self>) {
        if self.auto_refresh.load(Ordering::Acquire) {
            tracing::debug!("TOTP code expired, regenerating");
            // Failures are already published as Idle and are never retried.
            if let Err(Error::GenerationInFlight) = self.generate().await {
                tracing::debug!("Auto-refresh skipped, a generation is already in flight");
            }
            return;
        }

        self.state.send_if_modified(|state| {
            let GenerationState::Displayed { result, .. } = state else {
                return false;
            };
            if self.cancel.is_cancelled() {
                return false;
            }
            let result = result.clone();
            *state = GenerationState::Expiring { result };
            true
        });
    }
}

/// Applies one countdown's events to the controller state.
///
/// Holds the controller weakly so a dropped controller is never kept alive
/// by its own timer.
async fn pump<B: OtpBackend>(
    shared: Weak<Shared<B>>,
    seq: u64,
    mut events: mpsc::Receiver<CountdownEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.cancel.is_cancelled() || shared.timer_seq.load(Ordering::Acquire) != seq {
            return;
        }
        match event {
            CountdownEvent::Tick { remaining } => {
                shared.state.send_if_modified(|state| match state {
                    GenerationState::Displayed {
                        remaining_seconds, ..
                    } => {
                        *remaining_seconds = remaining;
                        true
                    }
                    _ => false,
                });
            }
            CountdownEvent::Expired => {
                shared.on_expired().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::otp::testing::FakeBackend;

    fn controller(backend: &Arc<FakeBackend>, options: GenerationOptions) -> GenerationController<FakeBackend> {
        GenerationController::new(backend.clone(), backend.config(), options)
    }

    /// Lets spawned tasks run without advancing the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn totp_countdown_decreases_each_second() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(&backend, GenerationOptions::default());

        let result = generation.generate().await.unwrap();
        assert_eq!(result.remaining_seconds(), Some(30));
        assert_eq!(result.code.len(), 6);

        let mut seen = Vec::new();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            settle().await;
            match generation.state() {
                GenerationState::Displayed {
                    remaining_seconds, ..
                } => seen.push(remaining_seconds),
                other => panic!("expected Displayed, got {other:?}"),
            }
        }
        assert_eq!(seen, vec![29, 28, 27, 26, 25]);
    }

    #[tokio::test(start_paused = true)]
    async fn totp_expires_without_auto_refresh() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(&backend, GenerationOptions::default());
        let result = generation.generate().await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(
            generation.state(),
            GenerationState::Expiring {
                result: result.clone()
            }
        );
        assert_eq!(generation.state().result().map(|r| r.code.as_str()), Some(result.code.as_str()));

        // Nothing else happens on its own.
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert!(generation.state().is_expired());
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn totp_auto_refresh_regenerates_on_expiry() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(
            &backend,
            GenerationOptions {
                auto_refresh: true,
                ..GenerationOptions::default()
            },
        );
        let first = generation.generate().await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 2);
        match generation.state() {
            GenerationState::Displayed {
                result,
                remaining_seconds,
            } => {
                assert_ne!(result.code, first.code);
                assert_eq!(remaining_seconds, 30);
            }
            other => panic!("expected a fresh code, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_regeneration_replaces_countdown() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(&backend, GenerationOptions::default());
        generation.generate().await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        generation.generate().await.unwrap();

        // The first countdown would have expired here.
        tokio::time::sleep(Duration::from_secs(15)).await;
        settle().await;
        match generation.state() {
            GenerationState::Displayed {
                remaining_seconds, ..
            } => assert_eq!(remaining_seconds, 15),
            other => panic!("expected Displayed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hotp_second_generate_is_rejected_while_in_flight() {
        let backend = Arc::new(FakeBackend::hotp(0).gated());
        let generation = controller(&backend, GenerationOptions::default());

        let (first, second) = tokio::join!(generation.generate(), async {
            let second = generation.generate().await;
            backend.release();
            second
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::GenerationInFlight)));
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hotp_has_no_countdown_and_refetches_config() {
        let backend = Arc::new(FakeBackend::hotp(4));
        let generation = controller(&backend, GenerationOptions::default());

        let result = generation.generate().await.unwrap();
        assert_eq!(result.remaining_seconds(), None);
        assert_eq!(result.next_counter(), Some(5));
        assert_eq!(backend.last_counter_increment(), Some(Some(true)));

        assert!(matches!(
            generation.state(),
            GenerationState::AwaitingManualRegeneration { .. }
        ));
        assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(generation.config().counter, 5);

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert!(matches!(
            generation.state(),
            GenerationState::AwaitingManualRegeneration { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hotp_increment_flag_follows_options() {
        let backend = Arc::new(FakeBackend::hotp(4));
        let generation = controller(
            &backend,
            GenerationOptions {
                increment_hotp_counter: false,
                ..GenerationOptions::default()
            },
        );
        generation.generate().await.unwrap();
        assert_eq!(backend.last_counter_increment(), Some(Some(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn totp_request_carries_no_increment_flag() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(&backend, GenerationOptions::default());
        generation.generate().await.unwrap();
        assert_eq!(backend.last_counter_increment(), Some(None));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_returns_to_idle_without_retry() {
        let backend = Arc::new(FakeBackend::hotp(0));
        backend.fail_generate.store(true, Ordering::SeqCst);
        let generation = controller(&backend, GenerationOptions::default());

        let err = generation.generate().await.unwrap_err();
        assert!(matches!(err, Error::Api { status: 500, .. }));
        match generation.state() {
            GenerationState::Idle { last_error } => {
                assert_eq!(last_error.as_deref(), Some(err.to_string().as_str()));
            }
            other => panic!("expected Idle, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
        assert!(!generation.is_generating());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_failure_is_not_retried() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(
            &backend,
            GenerationOptions {
                auto_refresh: true,
                ..GenerationOptions::default()
            },
        );
        generation.generate().await.unwrap();
        backend.fail_generate.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(90)).await;
        settle().await;
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 2);
        match generation.state() {
            GenerationState::Idle { last_error } => {
                assert_eq!(last_error.as_deref(), Some("Request failed (500): boom"));
            }
            other => panic!("expected Idle, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_code_length_is_a_failure() {
        let backend = Arc::new(FakeBackend::totp(30).with_code_override("12345"));
        let generation = controller(&backend, GenerationOptions::default());

        let err = generation.generate().await.unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }));
        assert!(matches!(generation.state(), GenerationState::Idle { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_freezes_state_and_stops_auto_refresh() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(
            &backend,
            GenerationOptions {
                auto_refresh: true,
                ..GenerationOptions::default()
            },
        );
        generation.generate().await.unwrap();
        let updates = generation.subscribe();

        generation.teardown();
        tokio::time::sleep(Duration::from_secs(90)).await;
        settle().await;

        assert!(!updates.has_changed().unwrap_or(false));
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(generation.generate().await, Err(Error::TornDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_abandons_in_flight_request() {
        let backend = Arc::new(FakeBackend::totp(30).gated());
        let generation = controller(&backend, GenerationOptions::default());

        let (result, ()) = tokio::join!(generation.generate(), async {
            settle().await;
            generation.teardown();
        });

        assert!(matches!(result, Err(Error::TornDown)));
        assert_eq!(generation.state(), GenerationState::Generating);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_controller_stops_its_timer() {
        let backend = Arc::new(FakeBackend::totp(30));
        let generation = controller(
            &backend,
            GenerationOptions {
                auto_refresh: true,
                ..GenerationOptions::default()
            },
        );
        generation.generate().await.unwrap();
        drop(generation);

        tokio::time::sleep(Duration::from_secs(90)).await;
        settle().await;
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
    }
}
