//! Abstract transport boundary for the link engine.
//!
//! This module defines the primitives the engine invokes on the underlying
//! radio stack and the asynchronous events it receives back. Every primitive
//! is fire-and-forget; results arrive later as [`TransportEvent`]s on the
//! channel created by [`event_channel`]. Connection sessions each own a
//! transport instance; scanning uses one shared instance.

use std::{collections::HashMap, time::Duration};

use serde_json::json;
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type Payload = SmallVec<[u8; 32]>;

/// Control value written to an attribute's configuration descriptor to
/// enable change notifications.
pub const NOTIFY_ENABLE: &[u8] = &[0x01, 0x00];
/// Control value disabling change notifications.
pub const NOTIFY_DISABLE: &[u8] = &[0x00, 0x00];

/// Event channel capacity per transport instance.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Reference to one addressable value exposed by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRef {
   pub group: Uuid,
   pub id: Uuid,
}

/// One addressable value within an attribute group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
   pub id: Uuid,
}

/// A named collection of attributes exposed by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeGroup {
   pub id: Uuid,
   pub attributes: Vec<Attribute>,
}

impl AttributeGroup {
   /// Looks up an attribute by id, returning a reference usable in
   /// transport operations.
   pub fn attribute(&self, id: Uuid) -> Option<AttributeRef> {
      self
         .attributes
         .iter()
         .find(|a| a.id == id)
         .map(|a| AttributeRef {
            group: self.id,
            id: a.id,
         })
   }
}

/// Write acknowledgment mode for attribute writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum WriteMode {
   #[strum(serialize = "with_response")]
   WithResponse,
   #[strum(serialize = "without_response")]
   WithoutResponse,
}

/// One discovery sighting of a remote peer.
///
/// Ephemeral: consumed by the scan filter and forwarded or discarded, never
/// persisted by the engine.
#[derive(Debug, Clone)]
pub struct ScannedPeer {
   pub address: SmolStr,
   pub name: Option<SmolStr>,
   pub rssi: i16,
   /// Raw advertisement payload as received.
   pub payload: Payload,
   /// Manufacturer-specific data keyed by company id.
   pub manufacturer_data: HashMap<u16, Payload>,
}

impl ScannedPeer {
   /// Converts the sighting to a JSON representation for host surfaces.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address.as_str(),
          "rssi": self.rssi,
          "payload": hex::encode(&self.payload),
      });

      if let Some(name) = &self.name {
         info["name"] = json!(name.as_str());
      }

      let mfr: HashMap<String, String> = self
         .manufacturer_data
         .iter()
         .map(|(cid, data)| (format!("{cid:04x}"), hex::encode(data)))
         .collect();
      info["manufacturer_data"] = json!(mfr);
      info
   }
}

/// Asynchronous events produced by a transport instance.
///
/// Link termination is a single collapsed `LinkDown` regardless of whether
/// an in-progress attempt failed outright or an established link dropped;
/// the session's prior state distinguishes the two.
#[derive(Debug, Clone)]
pub enum TransportEvent {
   LinkUp,
   LinkDown { status: i32 },
   ParameterChanged(u16),
   ParameterFailed,
   GroupsDiscovered(Vec<AttributeGroup>),
   DiscoveryFailed(i32),
   AttributeRead(AttributeRef, Payload),
   AttributeWritten(AttributeRef),
   AttributeChanged(AttributeRef, Payload),
   NotificationAck(AttributeRef, bool),
   DescriptorWritten(AttributeRef),
   OperationFailed { op: &'static str, code: i32 },
   PeerFound(ScannedPeer),
   ScanFailed(i32),
}

/// Creates the event channel pairing a transport instance with its consumer.
///
/// The sender half goes to the transport implementation, the receiver half
/// to [`Session::spawn`](crate::link::session::Session::spawn) or
/// [`Scanner::spawn`](crate::scan::scanner::Scanner::spawn).
pub fn event_channel() -> (mpsc::Sender<TransportEvent>, mpsc::Receiver<TransportEvent>) {
   mpsc::channel(CHANNEL_BUFFER_SIZE)
}

/// Primitive operations on the underlying radio stack.
///
/// Implementations must not block; each method requests work and returns,
/// with the outcome reported later as a [`TransportEvent`].
pub trait Transport: Send + Sync {
   fn open_link(&self, address: &SmolStr);
   fn close_link(&self);
   fn request_parameter(&self, value: u16);
   fn discover_attribute_groups(&self);
   fn read_attribute(&self, attr: &AttributeRef);
   fn write_attribute(&self, attr: &AttributeRef, data: &[u8], mode: WriteMode);
   fn set_notification(&self, attr: &AttributeRef, enabled: bool);
   fn write_descriptor(&self, attr: &AttributeRef, value: &[u8]);
   fn start_scan(&self, duration_hint: Duration);
   fn stop_scan(&self);
}

/// Host environment capability probe consumed before scanning.
///
/// The engine only branches on the results; it never implements the checks.
pub trait Capabilities: Send + Sync {
   /// Names of required grants the host is still missing, empty when all
   /// are held.
   fn missing_permissions(&self) -> Vec<SmolStr>;

   /// Whether the host radio stack supports scanning at all.
   fn transport_supported(&self) -> bool;
}
