//! Event delivery for session and scan subscribers.
//!
//! This module provides the sink contracts through which the engine reports
//! state changes, discovery results and attribute data. Sinks are held
//! weakly and checked for liveness before every delivery; a torn-down
//! subscriber silently drops events.

use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   link::state::SessionState,
   transport::{AttributeGroup, AttributeRef, Payload, ScannedPeer},
};

/// Events delivered to a session subscriber.
///
/// All variants are dispatched from the session actor loop, so a subscriber
/// observes them in order and never concurrently.
#[derive(Debug, Clone)]
pub enum SessionEvent {
   StateChanged(SessionState),
   AttributeGroupsDiscovered(Vec<AttributeGroup>),
   ParameterChanged(u16),
   AttributeRead(AttributeRef, Payload),
   AttributeWritten(AttributeRef),
   AttributeChanged(AttributeRef, Payload),
}

/// Trait for receiving session events.
pub trait SessionSink: Send + Sync {
   /// Delivers one event for the session at `address`.
   fn on_session_event(&self, address: &SmolStr, event: SessionEvent);
}

/// Why a scan session was rejected or aborted.
///
/// These are expected outcomes, delivered through [`ScanEvent::Failed`]
/// rather than returned as call errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanFailure {
   #[error("A scan is already in progress")]
   AlreadyScanning,

   #[error("Missing permissions: {0:?}")]
   InsufficientPermissions(Vec<SmolStr>),

   #[error("Transport does not support scanning")]
   TransportUnsupported,

   #[error("Transport scan error (code {0})")]
   Transport(i32),
}

/// Events delivered to a scan subscriber.
#[derive(Debug, Clone)]
pub enum ScanEvent {
   Started,
   Stopped,
   PeerFound(ScannedPeer),
   Failed(ScanFailure),
}

/// Trait for receiving scan events.
pub trait ScanSink: Send + Sync {
   fn on_scan_event(&self, event: ScanEvent);
}
