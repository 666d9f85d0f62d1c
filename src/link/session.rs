//! Session actor driving one connection lifecycle.
//!
//! This module provides the public `Session` handle and the actor behind
//! it. All transport events, user commands and timer fires funnel through
//! one `select!` loop, so session state needs no locks and subscribers see
//! events in order from a single delivery context.

use std::sync::{Arc, Weak};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Duration},
};
use uuid::Uuid;

use crate::{
   config::ConnectionConfig,
   error::{LinkError, Result},
   event::{SessionEvent, SessionSink},
   link::state::{Effect, Effects, SessionState, StateMachine},
   transport::{
      AttributeGroup, AttributeRef, NOTIFY_DISABLE, NOTIFY_ENABLE, Payload, Transport,
      TransportEvent, WriteMode,
   },
};

/// Command channel buffer size.
const CHANNEL_BUFFER_SIZE: usize = 64;

// === Selected Attributes ===

/// Which convenience slot an attribute selection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AttributeRole {
   Read,
   Write,
   Notify,
}

/// Attribute references cached for the convenience operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectedAttributes {
   pub read: Option<AttributeRef>,
   pub write: Option<AttributeRef>,
   pub notify: Option<AttributeRef>,
}

impl SelectedAttributes {
   const fn get(&self, role: AttributeRole) -> Option<AttributeRef> {
      match role {
         AttributeRole::Read => self.read,
         AttributeRole::Write => self.write,
         AttributeRole::Notify => self.notify,
      }
   }

   const fn set(&mut self, role: AttributeRole, attr: AttributeRef) {
      match role {
         AttributeRole::Read => self.read = Some(attr),
         AttributeRole::Write => self.write = Some(attr),
         AttributeRole::Notify => self.notify = Some(attr),
      }
   }
}

// === Commands ===

enum SessionCommand {
   Connect(
      ConnectionConfig,
      Weak<dyn SessionSink>,
      oneshot::Sender<Result<()>>,
   ),
   Disconnect(oneshot::Sender<()>),
   Close(oneshot::Sender<()>),
   SelectAttribute(AttributeRole, Uuid, Uuid, oneshot::Sender<bool>),
   ReadSelected(oneshot::Sender<Result<()>>),
   WriteSelected(Payload, WriteMode, oneshot::Sender<Result<()>>),
   SetNotifications(bool, oneshot::Sender<Result<()>>),
}

/// Timer fires posted back through the actor's loopback channel so they
/// share the delivery context with everything else.
enum Loopback {
   ConnectTimeout(u64),
   RetryDue(u64),
}

// === Public Handle ===

struct SessionShared {
   address: SmolStr,
   state: AtomicCell<SessionState>,
   selected: Mutex<SelectedAttributes>,
}

/// Handle to one connection session.
///
/// Cheaply cloneable; all methods post commands to the session actor and
/// never block on transport work.
#[derive(Clone)]
pub struct Session {
   inbox: mpsc::Sender<SessionCommand>,
   shared: Arc<SessionShared>,
}

impl Session {
   /// Spawns the actor for one peer. The transport instance and its event
   /// receiver are dedicated to this session.
   pub fn spawn(
      address: impl Into<SmolStr>,
      transport: Box<dyn Transport>,
      events: mpsc::Receiver<TransportEvent>,
   ) -> Self {
      let shared = Arc::new(SessionShared {
         address: address.into(),
         state: AtomicCell::new(SessionState::Disconnected),
         selected: Mutex::new(SelectedAttributes::default()),
      });

      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

      tokio::spawn(
         SessionActor {
            shared: shared.clone(),
            transport,
            command_rx,
            transport_rx: events,
            transport_closed: false,
            loopback_tx,
            loopback_rx,
            machine: StateMachine::new(),
            sink: None,
            groups: Vec::new(),
            connect_timer: TimerSlot::default(),
            retry_timer: TimerSlot::default(),
         }
         .run(),
      );

      Self {
         inbox: command_tx,
         shared,
      }
   }

   pub fn address(&self) -> &SmolStr {
      &self.shared.address
   }

   /// Current lifecycle state, readable without touching the actor.
   pub fn state(&self) -> SessionState {
      self.shared.state.load()
   }

   /// Snapshot of the cached convenience attribute selections.
   pub fn selected_attributes(&self) -> SelectedAttributes {
      *self.shared.selected.lock()
   }

   /// Starts a connect attempt with `sink` as the session subscriber.
   ///
   /// Rejected with [`LinkError::AlreadyConnecting`] while an attempt or an
   /// established link is in progress; the session state is left untouched.
   pub async fn connect(
      &self,
      config: ConnectionConfig,
      sink: &Arc<dyn SessionSink>,
   ) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(SessionCommand::Connect(config, Arc::downgrade(sink), tx))
         .await
         .map_err(|_| LinkError::SessionClosed)?;
      rx.await.map_err(|_| LinkError::SessionClosed)?
   }

   /// Requests deliberate teardown. The terminal state will be
   /// `Disconnected`, never a retry.
   pub async fn disconnect(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(SessionCommand::Disconnect(tx))
         .await
         .map_err(|_| LinkError::SessionClosed)?;
      rx.await.map_err(|_| LinkError::SessionClosed)
   }

   /// Disconnects, releases the transport link, clears the subscriber and
   /// stops the actor. Idempotent; after the first call every other method
   /// reports [`LinkError::SessionClosed`] and no event is ever delivered
   /// again.
   pub async fn close(&self) {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(SessionCommand::Close(tx)).await.is_err() {
         // Already closed.
         return;
      }
      let _ = rx.await;
   }

   /// Selects the attribute used by [`Session::read`].
   pub async fn set_read_attribute(&self, group: Uuid, attribute: Uuid) -> bool {
      self.select(AttributeRole::Read, group, attribute).await
   }

   /// Selects the attribute used by [`Session::write`].
   pub async fn set_write_attribute(&self, group: Uuid, attribute: Uuid) -> bool {
      self.select(AttributeRole::Write, group, attribute).await
   }

   /// Selects the attribute used for change notifications.
   pub async fn set_notify_attribute(&self, group: Uuid, attribute: Uuid) -> bool {
      self.select(AttributeRole::Notify, group, attribute).await
   }

   async fn select(&self, role: AttributeRole, group: Uuid, attribute: Uuid) -> bool {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(SessionCommand::SelectAttribute(role, group, attribute, tx))
         .await
         .is_err()
      {
         return false;
      }
      rx.await.unwrap_or(false)
   }

   /// Issues a read of the selected read attribute; the value arrives as
   /// [`SessionEvent::AttributeRead`].
   pub async fn read(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(SessionCommand::ReadSelected(tx))
         .await
         .map_err(|_| LinkError::SessionClosed)?;
      rx.await.map_err(|_| LinkError::SessionClosed)?
   }

   /// Issues a write to the selected write attribute.
   pub async fn write(&self, data: &[u8], mode: WriteMode) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(SessionCommand::WriteSelected(
            Payload::from_slice(data),
            mode,
            tx,
         ))
         .await
         .map_err(|_| LinkError::SessionClosed)?;
      rx.await.map_err(|_| LinkError::SessionClosed)?
   }

   /// Subscribes or unsubscribes the selected notify attribute. The
   /// configuration-descriptor write follows the transport's subscription
   /// ack as a separate asynchronous step.
   pub async fn set_notifications_enabled(&self, enabled: bool) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(SessionCommand::SetNotifications(enabled, tx))
         .await
         .map_err(|_| LinkError::SessionClosed)?;
      rx.await.map_err(|_| LinkError::SessionClosed)?
   }
}

// === Timers ===

#[derive(Default)]
struct TimerSlot {
   handle: Option<JoinHandle<()>>,
   epoch: u64,
}

impl TimerSlot {
   /// Aborts any pending fire and invalidates in-flight ones. At most one
   /// timer per slot is ever live.
   fn cancel(&mut self) {
      self.epoch += 1;
      if let Some(handle) = self.handle.take() {
         handle.abort();
      }
   }
}

// === Session Actor ===

struct SessionActor {
   shared: Arc<SessionShared>,
   transport: Box<dyn Transport>,
   command_rx: mpsc::Receiver<SessionCommand>,
   transport_rx: mpsc::Receiver<TransportEvent>,
   transport_closed: bool,
   loopback_tx: mpsc::Sender<Loopback>,
   loopback_rx: mpsc::Receiver<Loopback>,

   machine: StateMachine,
   sink: Option<Weak<dyn SessionSink>>,
   groups: Vec<AttributeGroup>,
   connect_timer: TimerSlot,
   retry_timer: TimerSlot,
}

impl SessionActor {
   async fn run(mut self) {
      debug!("{}: session actor starting", self.shared.address);

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     // All handles dropped.
                     break;
                 };
                 if !self.handle_command(cmd) {
                     break;
                 }
             }
             ev = self.transport_rx.recv(), if !self.transport_closed => {
                 match ev {
                     Some(ev) => self.handle_transport_event(ev),
                     None => {
                         warn!("{}: transport event channel closed", self.shared.address);
                         self.transport_closed = true;
                     }
                 }
             }
             Some(lb) = self.loopback_rx.recv() => {
                 self.handle_loopback(lb);
             }
         }
      }

      self.shutdown();
   }

   /// Returns false when the actor should stop.
   fn handle_command(&mut self, cmd: SessionCommand) -> bool {
      match cmd {
         SessionCommand::Connect(config, sink, reply) => {
            match self.machine.connect(config) {
               Some(effects) => {
                  // New subscriber sees the Connecting transition.
                  self.sink = Some(sink);
                  self.apply(effects);
                  let _ = reply.send(Ok(()));
               },
               None => {
                  let _ = reply.send(Err(LinkError::AlreadyConnecting));
               },
            }
         },
         SessionCommand::Disconnect(reply) => {
            info!("{}: disconnect requested", self.shared.address);
            let effects = self.machine.disconnect();
            self.apply(effects);
            let _ = reply.send(());
         },
         SessionCommand::Close(reply) => {
            self.close_session();
            let _ = reply.send(());
            return false;
         },
         SessionCommand::SelectAttribute(role, group, attribute, reply) => {
            let _ = reply.send(self.select_attribute(role, group, attribute));
         },
         SessionCommand::ReadSelected(reply) => {
            let _ = reply.send(self.read_selected());
         },
         SessionCommand::WriteSelected(data, mode, reply) => {
            let _ = reply.send(self.write_selected(&data, mode));
         },
         SessionCommand::SetNotifications(enabled, reply) => {
            let _ = reply.send(self.set_notifications(enabled));
         },
      }
      true
   }

   fn handle_transport_event(&mut self, event: TransportEvent) {
      match event {
         TransportEvent::LinkUp => {
            info!("{}: link established", self.shared.address);
            let effects = self.machine.link_up();
            self.apply(effects);
         },
         TransportEvent::LinkDown { status } => {
            if !self.machine.user_initiated() && self.machine.state() == SessionState::Connected {
               info!("{}: {}", self.shared.address, LinkError::LinkLost(status));
            } else {
               info!("{}: link down (status {status})", self.shared.address);
            }
            let effects = self.machine.link_down(status);
            self.apply(effects);
         },
         TransportEvent::ParameterChanged(value) => {
            debug!("{}: parameter negotiated to {value}", self.shared.address);
            self.deliver(SessionEvent::ParameterChanged(value));
            let effects = self.machine.parameter_negotiated();
            self.apply(effects);
         },
         TransportEvent::ParameterFailed => {
            // Non-fatal; discovery proceeds regardless.
            warn!("{}: parameter negotiation failed", self.shared.address);
            let effects = self.machine.parameter_negotiated();
            self.apply(effects);
         },
         TransportEvent::GroupsDiscovered(groups) => {
            if self.machine.state() != SessionState::Connected {
               debug!("{}: dropping discovery result, link gone", self.shared.address);
               return;
            }
            debug!(
               "{}: discovered {} attribute groups",
               self.shared.address,
               groups.len()
            );
            self.groups = groups.clone();
            self.deliver(SessionEvent::AttributeGroupsDiscovered(groups));
         },
         TransportEvent::DiscoveryFailed(code) => {
            // Not retried; the caller may issue another discovery via a
            // fresh connect.
            warn!(
               "{}: attribute discovery failed (code {code})",
               self.shared.address
            );
         },
         TransportEvent::AttributeRead(attr, value) => {
            debug!("{}: ← {}", self.shared.address, hex::encode(&value));
            self.deliver(SessionEvent::AttributeRead(attr, value));
         },
         TransportEvent::AttributeWritten(attr) => {
            self.deliver(SessionEvent::AttributeWritten(attr));
         },
         TransportEvent::AttributeChanged(attr, value) => {
            debug!("{}: ⇠ {}", self.shared.address, hex::encode(&value));
            self.deliver(SessionEvent::AttributeChanged(attr, value));
         },
         TransportEvent::NotificationAck(attr, enabled) => {
            // Descriptor write follows the subscription ack; its failure
            // never rolls the subscription back.
            let value = if enabled { NOTIFY_ENABLE } else { NOTIFY_DISABLE };
            debug!(
               "{}: notification {} acked, writing descriptor",
               self.shared.address,
               if enabled { "enable" } else { "disable" }
            );
            self.transport.write_descriptor(&attr, value);
         },
         TransportEvent::DescriptorWritten(attr) => {
            debug!(
               "{}: descriptor written for {}",
               self.shared.address, attr.id
            );
         },
         TransportEvent::OperationFailed { op, code } => {
            // Per-operation failure; never feeds the reconnection policy.
            warn!(
               "{}: {}",
               self.shared.address,
               LinkError::OperationFailed { op, code }
            );
         },
         TransportEvent::PeerFound(_) | TransportEvent::ScanFailed(_) => {
            // Scan traffic does not belong on a session transport.
            debug!("{}: ignoring scan event", self.shared.address);
         },
      }
   }

   fn handle_loopback(&mut self, lb: Loopback) {
      match lb {
         Loopback::ConnectTimeout(epoch) => {
            if epoch != self.connect_timer.epoch {
               return;
            }
            warn!("{}: {}", self.shared.address, LinkError::ConnectTimeout);
            let effects = self.machine.connect_timeout_fired();
            self.apply(effects);
         },
         Loopback::RetryDue(epoch) => {
            if epoch != self.retry_timer.epoch {
               return;
            }
            let effects = self.machine.retry_due();
            self.apply(effects);
         },
      }
   }

   // === Effects ===

   fn apply(&mut self, effects: Effects) {
      for effect in effects {
         match effect {
            Effect::State(state) => {
               info!("{}: state -> {state}", self.shared.address);
               self.shared.state.store(state);
               self.deliver(SessionEvent::StateChanged(state));
            },
            Effect::StartConnectTimer(delay) => self.arm_connect_timer(delay),
            Effect::CancelConnectTimer => self.connect_timer.cancel(),
            Effect::StartRetryTimer(delay) => {
               info!(
                  "{}: scheduling reconnect in {delay:?}",
                  self.shared.address
               );
               self.arm_retry_timer(delay);
            },
            Effect::CancelRetryTimer => self.retry_timer.cancel(),
            Effect::OpenLink => {
               debug!("{}: opening link", self.shared.address);
               self.transport.open_link(&self.shared.address);
            },
            Effect::CloseLink => self.transport.close_link(),
            Effect::RequestParameter(value) => self.transport.request_parameter(value),
            Effect::DiscoverGroups => self.transport.discover_attribute_groups(),
            Effect::Teardown => self.teardown(),
         }
      }
   }

   fn arm_connect_timer(&mut self, delay: Duration) {
      self.connect_timer.cancel();
      let epoch = self.connect_timer.epoch;
      let loopback = self.loopback_tx.clone();
      self.connect_timer.handle = Some(tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(Loopback::ConnectTimeout(epoch)).await;
      }));
   }

   fn arm_retry_timer(&mut self, delay: Duration) {
      self.retry_timer.cancel();
      let epoch = self.retry_timer.epoch;
      let loopback = self.loopback_tx.clone();
      self.retry_timer.handle = Some(tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(Loopback::RetryDue(epoch)).await;
      }));
   }

   // === Attribute Operations ===

   fn select_attribute(&mut self, role: AttributeRole, group: Uuid, attribute: Uuid) -> bool {
      let resolved = self
         .groups
         .iter()
         .find(|g| g.id == group)
         .and_then(|g| g.attribute(attribute));

      let Some(attr) = resolved else {
         debug!(
            "{}: {role} attribute {attribute} not in discovered groups",
            self.shared.address
         );
         return false;
      };

      self.shared.selected.lock().set(role, attr);
      true
   }

   fn read_selected(&self) -> Result<()> {
      let attr = self.require_selected(AttributeRole::Read)?;
      self.transport.read_attribute(&attr);
      Ok(())
   }

   fn write_selected(&self, data: &Payload, mode: WriteMode) -> Result<()> {
      let attr = self.require_selected(AttributeRole::Write)?;
      debug!("{}: → {}", self.shared.address, hex::encode(data));
      self.transport.write_attribute(&attr, data, mode);
      Ok(())
   }

   fn set_notifications(&self, enabled: bool) -> Result<()> {
      let attr = self.require_selected(AttributeRole::Notify)?;
      self.transport.set_notification(&attr, enabled);
      Ok(())
   }

   fn require_selected(&self, role: AttributeRole) -> Result<AttributeRef> {
      if self.machine.state() != SessionState::Connected {
         return Err(LinkError::NotConnected);
      }
      self
         .shared
         .selected
         .lock()
         .get(role)
         .ok_or(LinkError::AttributeNotFound)
   }

   // === Teardown ===

   fn deliver(&self, event: SessionEvent) {
      match self.sink.as_ref().and_then(Weak::upgrade) {
         Some(sink) => sink.on_session_event(&self.shared.address, event),
         None => debug!("{}: subscriber gone, dropping event", self.shared.address),
      }
   }

   fn teardown(&mut self) {
      self.connect_timer.cancel();
      self.retry_timer.cancel();
      self.groups.clear();
      *self.shared.selected.lock() = SelectedAttributes::default();
   }

   fn close_session(&mut self) {
      info!("{}: closing session", self.shared.address);
      let effects = self.machine.disconnect();
      self.apply(effects);

      self.transport.close_link();
      self.sink = None;
      self.teardown();
      self.shared.state.store(SessionState::Disconnected);
   }

   fn shutdown(&mut self) {
      self.sink = None;
      self.teardown();
      debug!("{}: session actor stopped", self.shared.address);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::config::ReconnectionConfig;
   use crate::transport::Attribute;

   #[derive(Debug, Clone, PartialEq)]
   enum Call {
      Open,
      Close,
      RequestParameter(u16),
      Discover,
      Read(Uuid),
      Write(Uuid, Vec<u8>, WriteMode),
      SetNotification(Uuid, bool),
      WriteDescriptor(Uuid, Vec<u8>),
   }

   #[derive(Default)]
   struct MockTransport {
      calls: Mutex<Vec<Call>>,
   }

   impl MockTransport {
      fn calls(&self) -> Vec<Call> {
         self.calls.lock().clone()
      }

      fn count(&self, call: &Call) -> usize {
         self.calls.lock().iter().filter(|c| *c == call).count()
      }
   }

   impl Transport for Arc<MockTransport> {
      fn open_link(&self, _address: &SmolStr) {
         self.calls.lock().push(Call::Open);
      }
      fn close_link(&self) {
         self.calls.lock().push(Call::Close);
      }
      fn request_parameter(&self, value: u16) {
         self.calls.lock().push(Call::RequestParameter(value));
      }
      fn discover_attribute_groups(&self) {
         self.calls.lock().push(Call::Discover);
      }
      fn read_attribute(&self, attr: &AttributeRef) {
         self.calls.lock().push(Call::Read(attr.id));
      }
      fn write_attribute(&self, attr: &AttributeRef, data: &[u8], mode: WriteMode) {
         self
            .calls
            .lock()
            .push(Call::Write(attr.id, data.to_vec(), mode));
      }
      fn set_notification(&self, attr: &AttributeRef, enabled: bool) {
         self
            .calls
            .lock()
            .push(Call::SetNotification(attr.id, enabled));
      }
      fn write_descriptor(&self, attr: &AttributeRef, value: &[u8]) {
         self
            .calls
            .lock()
            .push(Call::WriteDescriptor(attr.id, value.to_vec()));
      }
      fn start_scan(&self, _duration_hint: Duration) {}
      fn stop_scan(&self) {}
   }

   #[derive(Default)]
   struct RecordingSink {
      events: Mutex<Vec<SessionEvent>>,
   }

   impl RecordingSink {
      fn states(&self) -> Vec<SessionState> {
         self
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
               SessionEvent::StateChanged(s) => Some(*s),
               _ => None,
            })
            .collect()
      }

      fn len(&self) -> usize {
         self.events.lock().len()
      }
   }

   impl SessionSink for RecordingSink {
      fn on_session_event(&self, _address: &SmolStr, event: SessionEvent) {
         self.events.lock().push(event);
      }
   }

   struct Fixture {
      session: Session,
      transport: Arc<MockTransport>,
      events: mpsc::Sender<TransportEvent>,
      sink: Arc<RecordingSink>,
      dyn_sink: Arc<dyn SessionSink>,
   }

   fn fixture() -> Fixture {
      let transport = Arc::new(MockTransport::default());
      let (events, events_rx) = crate::transport::event_channel();
      let session = Session::spawn("AA:BB:CC:DD:EE:FF", Box::new(transport.clone()), events_rx);
      let sink = Arc::new(RecordingSink::default());
      let dyn_sink: Arc<dyn SessionSink> = sink.clone();
      Fixture {
         session,
         transport,
         events,
         sink,
         dyn_sink,
      }
   }

   fn config(reconnection: ReconnectionConfig) -> ConnectionConfig {
      ConnectionConfig {
         connect_timeout_ms: 5_000,
         desired_parameter: None,
         reconnection,
      }
   }

   fn retries(attempts: u32) -> ConnectionConfig {
      config(ReconnectionConfig {
         enabled: true,
         attempts,
         initial_delay_ms: 1_000,
         backoff_multiplier: 2.0,
         max_delay_ms: 8_000,
      })
   }

   /// Lets the actor drain its channels on the current-thread runtime.
   async fn settle() {
      for _ in 0..32 {
         tokio::task::yield_now().await;
      }
   }

   fn sample_groups() -> Vec<AttributeGroup> {
      vec![AttributeGroup {
         id: Uuid::from_u128(0x10),
         attributes: vec![
            Attribute {
               id: Uuid::from_u128(0x11),
            },
            Attribute {
               id: Uuid::from_u128(0x12),
            },
         ],
      }]
   }

   #[tokio::test(start_paused = true)]
   async fn connect_link_up_discovers_groups() {
      let f = fixture();
      f.session.connect(retries(3), &f.dyn_sink).await.expect("connect");
      settle().await;
      assert_eq!(f.session.state(), SessionState::Connecting);

      f.events.send(TransportEvent::LinkUp).await.unwrap();
      f.events
         .send(TransportEvent::GroupsDiscovered(sample_groups()))
         .await
         .unwrap();
      settle().await;

      assert_eq!(f.session.state(), SessionState::Connected);
      assert_eq!(
         f.sink.states(),
         vec![SessionState::Connecting, SessionState::Connected]
      );
      assert_eq!(f.transport.calls(), vec![Call::Open, Call::Discover]);
      assert!(f.sink.events.lock().iter().any(|e| matches!(
         e,
         SessionEvent::AttributeGroupsDiscovered(groups) if groups.len() == 1
      )));
   }

   #[tokio::test(start_paused = true)]
   async fn parameter_negotiation_precedes_discovery() {
      let f = fixture();
      let mut cfg = retries(1);
      cfg.desired_parameter = Some(247);
      f.session.connect(cfg, &f.dyn_sink).await.expect("connect");

      f.events.send(TransportEvent::LinkUp).await.unwrap();
      settle().await;
      assert_eq!(
         f.transport.calls(),
         vec![Call::Open, Call::RequestParameter(247)]
      );

      f.events
         .send(TransportEvent::ParameterChanged(247))
         .await
         .unwrap();
      settle().await;
      assert_eq!(
         f.transport.calls(),
         vec![Call::Open, Call::RequestParameter(247), Call::Discover]
      );
      assert!(f.sink.events.lock().iter().any(|e| matches!(
         e,
         SessionEvent::ParameterChanged(247)
      )));
   }

   #[tokio::test(start_paused = true)]
   async fn failed_negotiation_still_discovers() {
      let f = fixture();
      let mut cfg = retries(1);
      cfg.desired_parameter = Some(512);
      f.session.connect(cfg, &f.dyn_sink).await.expect("connect");

      f.events.send(TransportEvent::LinkUp).await.unwrap();
      f.events.send(TransportEvent::ParameterFailed).await.unwrap();
      settle().await;

      assert_eq!(f.transport.count(&Call::Discover), 1);
      assert!(!f.sink.events.lock().iter().any(|e| matches!(
         e,
         SessionEvent::ParameterChanged(_)
      )));
   }

   #[tokio::test(start_paused = true)]
   async fn concurrent_connect_is_rejected() {
      let f = fixture();
      f.session.connect(retries(1), &f.dyn_sink).await.expect("connect");

      let second = f.session.connect(retries(1), &f.dyn_sink).await;
      assert!(matches!(second, Err(LinkError::AlreadyConnecting)));
      assert_eq!(f.transport.count(&Call::Open), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn connect_timeout_reaches_timed_out() {
      let f = fixture();
      f.session.connect(retries(3), &f.dyn_sink).await.expect("connect");
      settle().await;

      // No link-up: the timeout wins the race.
      time::sleep(Duration::from_millis(5_100)).await;
      settle().await;

      assert_eq!(f.session.state(), SessionState::TimedOut);
      assert_eq!(f.transport.count(&Call::Close), 1);

      // The late link-up loses and is dropped.
      f.events.send(TransportEvent::LinkUp).await.unwrap();
      settle().await;
      assert_eq!(f.session.state(), SessionState::TimedOut);
   }

   #[tokio::test(start_paused = true)]
   async fn reconnect_exhaustion_walk() {
      let f = fixture();
      f.session.connect(retries(2), &f.dyn_sink).await.expect("connect");
      f.events.send(TransportEvent::LinkUp).await.unwrap();
      settle().await;

      // First unexpected drop: retry after 1s.
      f.events
         .send(TransportEvent::LinkDown { status: 8 })
         .await
         .unwrap();
      settle().await;
      assert_eq!(f.session.state(), SessionState::Reconnecting);

      time::sleep(Duration::from_millis(1_100)).await;
      settle().await;
      assert_eq!(f.session.state(), SessionState::Connecting);
      assert_eq!(f.transport.count(&Call::Open), 2);

      // Second drop: retry after 2s.
      f.events
         .send(TransportEvent::LinkDown { status: 8 })
         .await
         .unwrap();
      settle().await;
      assert_eq!(f.session.state(), SessionState::Reconnecting);

      time::sleep(Duration::from_millis(2_100)).await;
      settle().await;
      assert_eq!(f.transport.count(&Call::Open), 3);

      // Third drop exhausts the budget.
      f.events
         .send(TransportEvent::LinkDown { status: 8 })
         .await
         .unwrap();
      settle().await;

      assert_eq!(f.session.state(), SessionState::Disconnected);
      assert_eq!(
         f.sink.states(),
         vec![
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Reconnecting,
            SessionState::Connecting,
            SessionState::Reconnecting,
            SessionState::Connecting,
            SessionState::Disconnected,
         ]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn disconnect_before_response_never_reconnects() {
      let f = fixture();
      f.session.connect(retries(5), &f.dyn_sink).await.expect("connect");
      f.session.disconnect().await.expect("disconnect");
      settle().await;

      f.events
         .send(TransportEvent::LinkDown { status: 0 })
         .await
         .unwrap();
      settle().await;

      assert_eq!(f.session.state(), SessionState::Disconnected);
      assert!(!f.sink.states().contains(&SessionState::Reconnecting));
   }

   #[tokio::test(start_paused = true)]
   async fn close_suppresses_late_events() {
      let f = fixture();
      f.session.connect(retries(5), &f.dyn_sink).await.expect("connect");
      f.events.send(TransportEvent::LinkUp).await.unwrap();
      settle().await;

      f.session.close().await;
      let delivered = f.sink.len();

      // Late transport traffic after close: zero further deliveries.
      let _ = f.events.send(TransportEvent::LinkDown { status: 8 }).await;
      let _ = f
         .events
         .send(TransportEvent::AttributeChanged(
            AttributeRef {
               group: Uuid::from_u128(0x10),
               id: Uuid::from_u128(0x11),
            },
            Payload::from_slice(&[0xAA]),
         ))
         .await;
      settle().await;
      time::sleep(Duration::from_secs(30)).await;
      settle().await;

      assert_eq!(f.sink.len(), delivered);
      assert_eq!(f.session.state(), SessionState::Disconnected);

      // Closed is terminal: connect is refused from now on.
      let again = f.session.connect(retries(1), &f.dyn_sink).await;
      assert!(matches!(again, Err(LinkError::SessionClosed)));

      // And close stays idempotent.
      f.session.close().await;
   }

   #[tokio::test(start_paused = true)]
   async fn attribute_selection_and_operations() {
      let f = fixture();
      f.session.connect(retries(1), &f.dyn_sink).await.expect("connect");
      f.events.send(TransportEvent::LinkUp).await.unwrap();
      f.events
         .send(TransportEvent::GroupsDiscovered(sample_groups()))
         .await
         .unwrap();
      settle().await;

      let group = Uuid::from_u128(0x10);
      let attr = Uuid::from_u128(0x11);
      let notify_attr = Uuid::from_u128(0x12);

      assert!(f.session.set_write_attribute(group, attr).await);
      assert!(f.session.set_notify_attribute(group, notify_attr).await);
      assert!(!f.session.set_read_attribute(group, Uuid::from_u128(0xFF)).await);
      assert!(f.session.selected_attributes().read.is_none());

      f.session
         .write(&[0x01, 0x02], WriteMode::WithResponse)
         .await
         .expect("write issued");
      assert_eq!(
         f.transport.count(&Call::Write(
            attr,
            vec![0x01, 0x02],
            WriteMode::WithResponse
         )),
         1
      );

      // Written ack comes back as an event.
      f.events
         .send(TransportEvent::AttributeWritten(AttributeRef {
            group,
            id: attr,
         }))
         .await
         .unwrap();
      settle().await;
      assert!(f.sink.events.lock().iter().any(|e| matches!(
         e,
         SessionEvent::AttributeWritten(a) if a.id == attr
      )));

      // Read without a selected read attribute is refused per-call.
      let read = f.session.read().await;
      assert!(matches!(read, Err(LinkError::AttributeNotFound)));
   }

   #[tokio::test(start_paused = true)]
   async fn notification_descriptor_follows_ack() {
      let f = fixture();
      f.session.connect(retries(1), &f.dyn_sink).await.expect("connect");
      f.events.send(TransportEvent::LinkUp).await.unwrap();
      f.events
         .send(TransportEvent::GroupsDiscovered(sample_groups()))
         .await
         .unwrap();
      settle().await;

      let group = Uuid::from_u128(0x10);
      let notify_attr = Uuid::from_u128(0x12);
      assert!(f.session.set_notify_attribute(group, notify_attr).await);

      f.session
         .set_notifications_enabled(true)
         .await
         .expect("subscription issued");
      settle().await;
      assert_eq!(f.transport.count(&Call::SetNotification(notify_attr, true)), 1);
      // Descriptor write waits for the ack.
      assert_eq!(
         f.transport.count(&Call::WriteDescriptor(notify_attr, vec![0x01, 0x00])),
         0
      );

      f.events
         .send(TransportEvent::NotificationAck(
            AttributeRef {
               group,
               id: notify_attr,
            },
            true,
         ))
         .await
         .unwrap();
      settle().await;
      assert_eq!(
         f.transport.count(&Call::WriteDescriptor(notify_attr, vec![0x01, 0x00])),
         1
      );

      // Pushed value reaches the subscriber.
      f.events
         .send(TransportEvent::AttributeChanged(
            AttributeRef {
               group,
               id: notify_attr,
            },
            Payload::from_slice(&[0x42]),
         ))
         .await
         .unwrap();
      settle().await;
      assert!(f.sink.events.lock().iter().any(|e| matches!(
         e,
         SessionEvent::AttributeChanged(a, v) if a.id == notify_attr && v.as_slice() == [0x42]
      )));
   }

   #[tokio::test(start_paused = true)]
   async fn dropped_subscriber_drops_events_silently() {
      let f = fixture();
      let sink = Arc::new(RecordingSink::default());
      let dyn_sink: Arc<dyn SessionSink> = sink.clone();
      f.session.connect(retries(1), &dyn_sink).await.expect("connect");
      settle().await;

      drop(dyn_sink);
      drop(sink);

      // Deliveries after subscriber teardown must not error or panic.
      f.events.send(TransportEvent::LinkUp).await.unwrap();
      settle().await;
      assert_eq!(f.session.state(), SessionState::Connected);
   }
}
