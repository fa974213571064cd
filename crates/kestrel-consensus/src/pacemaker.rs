use serde::{Deserialize, Serialize};
use std::time::Duration;

use kestrel_core::{Step, View};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::ConsensusEvent;

/// Consecutive timeouts beyond this no longer double the timeout
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Furthest a message may move the round forward in one catch up
pub const MAX_ROUND_SKIP: u64 = 10_000;

/// Pacemaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacemakerConfig {
    /// Base round timeout in milliseconds
    pub timeout_ms: u64,
    /// Upper bound for the backed-off timeout
    pub max_timeout_ms: u64,
    /// No timers are armed; rounds only change on explicit triggers
    pub manual_mode: bool,
    /// Pause before flushing outbound messages (debug pacing)
    pub inter_step_delay_ms: u64,
}

impl Default for PacemakerConfig {
    fn default() -> Self {
        PacemakerConfig {
            timeout_ms: 10_000,
            max_timeout_ms: 60_000,
            manual_mode: false,
            inter_step_delay_ms: 0,
        }
    }
}

impl PacemakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms.max(self.timeout_ms))
    }

    pub fn inter_step_delay(&self) -> Duration {
        Duration::from_millis(self.inter_step_delay_ms)
    }

    /// Timeout after `consecutive` expired rounds at the current height
    pub fn backoff(&self, consecutive: u32) -> Duration {
        let factor = 1u32 << consecutive.min(MAX_BACKOFF_EXPONENT);
        self.timeout()
            .saturating_mul(factor)
            .min(self.max_timeout())
    }
}

/// Owns the (height, round, step) pointer and the single round timer.
///
/// The timer never touches consensus state: on expiry it posts a
/// [`ConsensusEvent::Timeout`] into the worker queue, tagged with a
/// generation so that expiries of replaced timers are recognisable.
pub struct Pacemaker {
    config: PacemakerConfig,
    view: View,
    consecutive_timeouts: u32,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    events: Option<mpsc::Sender<ConsensusEvent>>,
}

impl Pacemaker {
    /// `events` is the worker queue; without it no timers are armed
    pub fn new(
        config: PacemakerConfig,
        start: View,
        events: Option<mpsc::Sender<ConsensusEvent>>,
    ) -> Self {
        Pacemaker {
            config,
            view: start,
            consecutive_timeouts: 0,
            generation: 0,
            timer: None,
            events,
        }
    }

    pub fn start(&mut self) {
        info!(
            height = self.view.height,
            round = self.view.round,
            manual = self.config.manual_mode,
            "Pacemaker started"
        );
        self.restart_timer();
    }

    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn config(&self) -> &PacemakerConfig {
        &self.config
    }

    pub fn is_manual(&self) -> bool {
        self.config.manual_mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn current_timeout(&self) -> Duration {
        self.config.backoff(self.consecutive_timeouts)
    }

    /// Whether a timer expiry still refers to the armed timer
    pub fn is_current_timer(&self, height: u64, round: u64, generation: u64) -> bool {
        generation == self.generation && height == self.view.height && round == self.view.round
    }

    /// Whether `observed` is close enough ahead to be adopted: at most
    /// [`MAX_ROUND_SKIP`] rounds forward and leaving room for a next round
    pub fn within_reach(&self, observed: View) -> bool {
        if observed.round == u64::MAX || observed.height == u64::MAX {
            return false;
        }
        observed.height != self.view.height
            || observed.round <= self.view.round.saturating_add(MAX_ROUND_SKIP)
    }

    /// Expire the current round: next round, back to NewRound.
    ///
    /// At the last representable round the pointer stays put.
    pub fn on_timeout(&mut self) -> View {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        match self.view.round.checked_add(1) {
            Some(round) => self.view = View::new(self.view.height, round, Step::NewRound),
            None => error!(height = self.view.height, "Round counter exhausted"),
        }
        warn!(
            height = self.view.height,
            round = self.view.round,
            consecutive = self.consecutive_timeouts,
            timeout_ms = self.current_timeout().as_millis() as u64,
            "Round interrupted"
        );
        self.restart_timer();
        self.view
    }

    /// Adopt a later (height, round, step) observed in a message.
    ///
    /// Never regresses; returns whether the pointer moved.
    pub fn catch_up(&mut self, observed: View) -> bool {
        if observed <= self.view || !self.within_reach(observed) {
            return false;
        }
        if observed.height > self.view.height {
            self.consecutive_timeouts = 0;
        }
        debug!(from = %self.view, to = %observed, "Pacemaker catch up");
        self.view = observed;
        self.restart_timer();
        true
    }

    /// Move to a later step of the current round
    pub fn advance_step(&mut self, step: Step) -> bool {
        self.catch_up(View::new(self.view.height, self.view.round, step))
    }

    /// First round of the next height; resets the backoff.
    ///
    /// `None` when the height counter is exhausted.
    pub fn new_height(&mut self) -> Option<View> {
        let height = self.view.height.checked_add(1)?;
        self.consecutive_timeouts = 0;
        self.view = View::new(height, 0, Step::NewRound);
        info!(height, "Starting first round at new height");
        self.restart_timer();
        Some(self.view)
    }

    /// Unconditional pointer override for test harnesses
    #[cfg(any(test, feature = "debug-control"))]
    pub fn override_view(&mut self, view: View) {
        self.view = view;
        self.restart_timer();
    }

    fn restart_timer(&mut self) {
        self.stop();
        self.generation = self.generation.wrapping_add(1);

        if self.config.manual_mode {
            return;
        }
        let Some(events) = self.events.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, round timer not armed");
            return;
        };

        let timeout = self.current_timeout();
        let (height, round, generation) = (self.view.height, self.view.round, self.generation);
        self.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(ConsensusEvent::Timeout {
                    height,
                    round,
                    generation,
                })
                .await;
        }));
    }
}

impl Drop for Pacemaker {
    fn drop(&mut self) {
        self.stop();
    }
}
