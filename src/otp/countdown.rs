//! One-second countdown feeding the generation controller.
//!
//! The engine never talks to the backend. It is seeded with the remaining
//! seconds of one generation result and reports each decrement by value.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEvent {
    /// Seconds left after this tick.
    Tick { remaining: u32 },
    /// Sent exactly once, right after the tick that reached zero.
    Expired,
}

/// Handle to a running countdown. Dropping it stops the countdown.
#[derive(Debug)]
pub struct Countdown {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Countdown {
    /// Starts ticking from `remaining` seconds on the current tokio runtime.
    ///
    /// The first tick arrives one second from now. A countdown seeded with
    /// `0` still waits one tick before reporting expiry.
    #[must_use]
    pub fn start(remaining: u32) -> (Self, mpsc::Receiver<CountdownEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(remaining, tx, cancel.clone()));
        (Self { cancel, handle }, rx)
    }

    /// Stops the countdown. No event is sent after this returns, except ones
    /// already queued in the channel.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run(mut remaining: u32, events: mpsc::Sender<CountdownEvent>, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        remaining = remaining.saturating_sub(1);
        if events.send(CountdownEvent::Tick { remaining }).await.is_err() {
            return;
        }
        if remaining == 0 {
            let _ = events.send(CountdownEvent::Expired).await;
            return;
        }
    }
}
