//! Connection lifecycle and scan filtering for BLE-style peripherals.
//!
//! This crate manages one logical connection per remote peer over an
//! abstract packet-oriented transport: connect/disconnect/reconnect with
//! bounded exponential backoff, a connect-timeout race against the
//! transport, post-connect parameter negotiation and attribute discovery,
//! plus a scan engine that compiles name/manufacturer-data filters and
//! forwards matching discoveries.
//!
//! The transport itself (radio scanning, link establishment, attribute
//! access) is supplied by the host through the [`transport::Transport`]
//! trait; results flow back as [`transport::TransportEvent`]s.

pub mod config;
pub mod error;
pub mod event;
pub mod link;
pub mod scan;
pub mod transport;

pub use config::{Config, ConnectionConfig, ReconnectionConfig, ScanConfig};
pub use error::{LinkError, Result};
pub use event::{ScanEvent, ScanFailure, ScanSink, SessionEvent, SessionSink};
pub use link::{
   backoff::ReconnectPolicy,
   session::{SelectedAttributes, Session},
   state::SessionState,
};
pub use scan::{filter::ScanFilterSpec, scanner::Scanner};
pub use transport::{
   Attribute, AttributeGroup, AttributeRef, Capabilities, Payload, ScannedPeer, Transport,
   TransportEvent, WriteMode, event_channel,
};
