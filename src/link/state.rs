//! Session state machine.
//!
//! Pure transition logic for one connection session: every input returns the
//! list of effects (timer arm/cancel, transport calls, state publications,
//! teardown) for the actor to carry out. Keeping the transitions free of I/O
//! makes the lifecycle testable without a live transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::{config::ConnectionConfig, link::backoff::ReconnectPolicy};

/// Lifecycle state of a session. Exactly one holds at any time.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum SessionState {
   Disconnected,
   Connecting,
   Connected,
   Reconnecting,
   Failed,
   TimedOut,
}

impl SessionState {
   /// Resting states: no link activity in flight, `connect()` is accepted.
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Disconnected | Self::Failed | Self::TimedOut)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
   /// Publish the new state to the shared snapshot and the subscriber.
   State(SessionState),
   StartConnectTimer(Duration),
   CancelConnectTimer,
   StartRetryTimer(Duration),
   CancelRetryTimer,
   OpenLink,
   CloseLink,
   RequestParameter(u16),
   DiscoverGroups,
   /// Cancel all timers, drop the attribute caches, forget the link.
   Teardown,
}

pub type Effects = SmallVec<[Effect; 4]>;

/// Transition function for one session.
///
/// Owns the state, the user-initiated-disconnect flag and the reconnection
/// policy; the config snapshot taken at `connect` is reused verbatim for
/// every retry.
#[derive(Debug)]
pub struct StateMachine {
   state: SessionState,
   user_initiated: bool,
   config: ConnectionConfig,
   policy: ReconnectPolicy,
}

impl Default for StateMachine {
   fn default() -> Self {
      Self::new()
   }
}

impl StateMachine {
   pub fn new() -> Self {
      let config = ConnectionConfig::default();
      let policy = ReconnectPolicy::new(&config.reconnection);
      Self {
         state: SessionState::Disconnected,
         user_initiated: false,
         config,
         policy,
      }
   }

   pub const fn state(&self) -> SessionState {
      self.state
   }

   pub const fn config(&self) -> &ConnectionConfig {
      &self.config
   }

   /// Whether the current or pending teardown was requested by the user.
   pub const fn user_initiated(&self) -> bool {
      self.user_initiated
   }

   #[cfg(test)]
   pub(crate) const fn attempts_remaining(&self) -> u32 {
      self.policy.attempts_remaining()
   }

   /// Starts a connect attempt. Accepted only from a resting state;
   /// returns `None` (no state touched) while connecting or connected.
   pub fn connect(&mut self, config: ConnectionConfig) -> Option<Effects> {
      if !self.state.is_terminal() {
         return None;
      }

      self.user_initiated = false;
      self.policy = ReconnectPolicy::new(&config.reconnection);
      self.config = config;
      self.state = SessionState::Connecting;

      Some(smallvec![
         Effect::StartConnectTimer(self.config.connect_timeout()),
         Effect::OpenLink,
         Effect::State(SessionState::Connecting),
      ])
   }

   /// Transport reported the link established.
   ///
   /// Wins the race against the connect timeout by cancelling it, then
   /// sequences the post-connect negotiation: parameter request first when
   /// one is configured, attribute-group discovery otherwise.
   pub fn link_up(&mut self) -> Effects {
      let prior = self.state;
      if !matches!(
         prior,
         SessionState::Connecting | SessionState::Reconnecting
      ) {
         // Stale link-up from an abandoned attempt.
         return SmallVec::new();
      }

      self.state = SessionState::Connected;
      self.policy.reset();

      let mut effects: Effects = smallvec![Effect::CancelConnectTimer];
      if prior == SessionState::Reconnecting {
         effects.push(Effect::CancelRetryTimer);
      }
      effects.push(Effect::State(SessionState::Connected));
      match self.config.desired_parameter {
         Some(value) => effects.push(Effect::RequestParameter(value)),
         None => effects.push(Effect::DiscoverGroups),
      }
      effects
   }

   /// Transport reported the link down or the connect attempt failed.
   ///
   /// One collapsed path for both; the prior state decides `Failed` vs
   /// `Disconnected` when reconnection is not eligible.
   pub fn link_down(&mut self, status: i32) -> Effects {
      let prior = self.state;
      if prior.is_terminal() {
         // Late event for a session already settled.
         return SmallVec::new();
      }

      let mut effects: Effects = smallvec![Effect::CancelConnectTimer];

      if self.user_initiated {
         self.state = SessionState::Disconnected;
         effects.push(Effect::State(SessionState::Disconnected));
         effects.push(Effect::Teardown);
         return effects;
      }

      if !self.policy.enabled() {
         self.state = if prior == SessionState::Connecting {
            SessionState::Failed
         } else {
            SessionState::Disconnected
         };
         effects.push(Effect::State(self.state));
         effects.push(Effect::Teardown);
         return effects;
      }

      match self.policy.next() {
         Some(delay) => {
            self.state = SessionState::Reconnecting;
            effects.push(Effect::State(SessionState::Reconnecting));
            effects.push(Effect::StartRetryTimer(delay));
         },
         None => {
            log::info!(
               "{} (last status {status})",
               crate::error::LinkError::ReconnectExhausted
            );
            self.state = SessionState::Disconnected;
            effects.push(Effect::State(SessionState::Disconnected));
            effects.push(Effect::Teardown);
         },
      }
      effects
   }

   /// The connect-timeout timer fired. Only honored while still
   /// `Connecting`; a link-up that won the race already cancelled it.
   pub fn connect_timeout_fired(&mut self) -> Effects {
      if self.state != SessionState::Connecting {
         return SmallVec::new();
      }

      self.state = SessionState::TimedOut;
      smallvec![
         Effect::State(SessionState::TimedOut),
         Effect::CloseLink,
         Effect::Teardown,
      ]
   }

   /// The reconnect-delay timer fired. Only honored while still
   /// `Reconnecting`; a concurrent disconnect or close invalidates it.
   pub fn retry_due(&mut self) -> Effects {
      if self.state != SessionState::Reconnecting {
         return SmallVec::new();
      }

      // Every attempt starts with the flag cleared.
      self.user_initiated = false;
      self.state = SessionState::Connecting;
      smallvec![
         Effect::StartConnectTimer(self.config.connect_timeout()),
         Effect::OpenLink,
         Effect::State(SessionState::Connecting),
      ]
   }

   /// Deliberate teardown requested by the user.
   pub fn disconnect(&mut self) -> Effects {
      match self.state {
         SessionState::Connecting | SessionState::Connected => {
            self.user_initiated = true;
            // The resulting link-down completes the transition.
            smallvec![Effect::CancelRetryTimer, Effect::CloseLink]
         },
         SessionState::Reconnecting => {
            // No live link, so no link-down event will ever arrive.
            self.user_initiated = true;
            self.state = SessionState::Disconnected;
            smallvec![
               Effect::CancelRetryTimer,
               Effect::CloseLink,
               Effect::State(SessionState::Disconnected),
               Effect::Teardown,
            ]
         },
         _ => SmallVec::new(),
      }
   }

   /// Parameter negotiation completed (either way); discovery follows.
   /// Failure is non-fatal and only affects what the actor reports.
   pub fn parameter_negotiated(&mut self) -> Effects {
      if self.state != SessionState::Connected {
         return SmallVec::new();
      }
      smallvec![Effect::DiscoverGroups]
   }
}
