//! Connection lifecycle for one remote peripheral.
//!
//! This module owns the session state machine, the bounded-backoff
//! reconnection policy and the actor that drives them against a transport.

pub mod backoff;
pub mod session;
pub mod state;
