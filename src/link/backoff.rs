//! Bounded exponential-backoff reconnection policy.
//!
//! Pure retry bookkeeping: the session actor asks for the next delay after
//! every unexpected link termination and resets the counters whenever a
//! connect attempt succeeds.

use std::time::Duration;

use crate::config::ReconnectionConfig;

/// Retry state for one session, parameterized at connect time.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
   enabled: bool,
   attempts: u32,
   initial_delay: Duration,
   multiplier: f64,
   max_delay: Duration,

   attempts_remaining: u32,
   delay: Duration,
}

impl ReconnectPolicy {
   pub fn new(config: &ReconnectionConfig) -> Self {
      // A non-finite or non-positive multiplier degenerates to a constant
      // delay schedule.
      let multiplier = if config.backoff_multiplier.is_finite() && config.backoff_multiplier > 0.0 {
         config.backoff_multiplier
      } else {
         1.0
      };

      let initial_delay = Duration::from_millis(config.initial_delay_ms);
      Self {
         enabled: config.enabled,
         attempts: config.attempts,
         initial_delay,
         multiplier,
         max_delay: Duration::from_millis(config.max_delay_ms),
         attempts_remaining: config.attempts,
         delay: initial_delay,
      }
   }

   pub const fn enabled(&self) -> bool {
      self.enabled
   }

   pub const fn attempts_remaining(&self) -> u32 {
      self.attempts_remaining
   }

   /// Restores the full attempt budget and the initial delay. Called on
   /// session creation and on every successful connect.
   pub const fn reset(&mut self) {
      self.attempts_remaining = self.attempts;
      self.delay = self.initial_delay;
   }

   /// Decides the next retry: `Some(delay)` to schedule, `None` when the
   /// attempt budget is exhausted.
   ///
   /// The returned delay is the pre-update value; the growth and the
   /// decrement apply immediately, not after the attempt's outcome is known.
   pub fn next(&mut self) -> Option<Duration> {
      if self.attempts_remaining == 0 {
         return None;
      }

      let scheduled = self.delay;
      self.delay = self.delay.mul_f64(self.multiplier).min(self.max_delay);
      self.attempts_remaining -= 1;
      Some(scheduled)
   }
}
