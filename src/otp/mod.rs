//! OTP credential lifecycle: countdown, generation, validation and the
//! per-config view that owns them.

mod countdown;
mod generation;
mod traits;
mod validation;
mod view;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicBool, Ordering};

pub use countdown::{Countdown, CountdownEvent};
pub use generation::{GenerationController, GenerationOptions, GenerationState};
pub use traits::{OtpBackend, ValidationRequest};
pub use validation::{GENERIC_FAILURE_MESSAGE, ValidationController, ValidationState};
pub use view::ConfigView;

/// Holds a one-request-at-a-time flag; released on drop, so an abandoned
/// request frees the slot too.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
