//! Scan session actor.
//!
//! Drives one scan at a time against the shared transport instance: gates
//! on host capabilities, compiles the filter spec, runs the duration timer
//! and forwards matching sightings to the subscriber without deduplication.

use std::sync::{
   Arc, Weak,
   atomic::{AtomicBool, Ordering},
};

use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Duration},
};

use crate::{
   config::ScanConfig,
   error::{LinkError, Result},
   event::{ScanEvent, ScanFailure, ScanSink},
   scan::filter::ScanFilterSpec,
   transport::{Capabilities, Transport, TransportEvent},
};

const CHANNEL_BUFFER_SIZE: usize = 64;

enum ScanCommand {
   Start(ScanConfig, Weak<dyn ScanSink>, oneshot::Sender<()>),
   Stop(oneshot::Sender<()>),
}

enum Loopback {
   DurationElapsed(u64),
}

struct ScannerShared {
   is_scanning: AtomicBool,
}

/// Handle to the scan engine.
///
/// Cheaply cloneable. Scan rejections (already scanning, missing
/// permissions, unsupported transport) are delivered through the scan sink
/// as [`ScanEvent::Failed`] outcomes, not returned as call errors.
#[derive(Clone)]
pub struct Scanner {
   inbox: mpsc::Sender<ScanCommand>,
   shared: Arc<ScannerShared>,
}

impl Scanner {
   /// Spawns the scan actor over the shared transport instance and the
   /// host capability probe.
   pub fn spawn(
      transport: Arc<dyn Transport>,
      capabilities: Arc<dyn Capabilities>,
      events: mpsc::Receiver<TransportEvent>,
   ) -> Self {
      let shared = Arc::new(ScannerShared {
         is_scanning: AtomicBool::new(false),
      });

      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

      tokio::spawn(
         ScannerActor {
            shared: shared.clone(),
            transport,
            capabilities,
            command_rx,
            transport_rx: events,
            transport_closed: false,
            loopback_tx,
            loopback_rx,
            active: None,
            duration_timer: None,
            timer_epoch: 0,
         }
         .run(),
      );

      Self {
         inbox: command_tx,
         shared,
      }
   }

   pub fn is_scanning(&self) -> bool {
      self.shared.is_scanning.load(Ordering::Relaxed)
   }

   /// Requests a scan session; the outcome (started or a failure kind)
   /// arrives through `sink`.
   pub async fn start_scan(&self, config: ScanConfig, sink: &Arc<dyn ScanSink>) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ScanCommand::Start(config, Arc::downgrade(sink), tx))
         .await
         .map_err(|_| LinkError::ScannerShutdown)?;
      rx.await.map_err(|_| LinkError::ScannerShutdown)
   }

   /// Stops the scan in progress; a no-op when idle.
   pub async fn stop_scan(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ScanCommand::Stop(tx))
         .await
         .map_err(|_| LinkError::ScannerShutdown)?;
      rx.await.map_err(|_| LinkError::ScannerShutdown)
   }
}

struct ActiveScan {
   spec: ScanFilterSpec,
   sink: Weak<dyn ScanSink>,
}

struct ScannerActor {
   shared: Arc<ScannerShared>,
   transport: Arc<dyn Transport>,
   capabilities: Arc<dyn Capabilities>,
   command_rx: mpsc::Receiver<ScanCommand>,
   transport_rx: mpsc::Receiver<TransportEvent>,
   transport_closed: bool,
   loopback_tx: mpsc::Sender<Loopback>,
   loopback_rx: mpsc::Receiver<Loopback>,

   active: Option<ActiveScan>,
   duration_timer: Option<JoinHandle<()>>,
   timer_epoch: u64,
}

impl ScannerActor {
   async fn run(mut self) {
      debug!("Scan actor starting");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     break;
                 };
                 self.handle_command(cmd);
             }
             ev = self.transport_rx.recv(), if !self.transport_closed => {
                 match ev {
                     Some(ev) => self.handle_transport_event(ev),
                     None => {
                         warn!("Scan transport event channel closed");
                         self.transport_closed = true;
                     }
                 }
             }
             Some(lb) = self.loopback_rx.recv() => {
                 let Loopback::DurationElapsed(epoch) = lb;
                 if epoch == self.timer_epoch {
                     self.finish_scan(true);
                 }
             }
         }
      }

      if self.active.is_some() {
         self.transport.stop_scan();
      }
      self.cancel_duration_timer();
      debug!("Scan actor stopped");
   }

   fn handle_command(&mut self, cmd: ScanCommand) {
      match cmd {
         ScanCommand::Start(config, sink, reply) => {
            self.handle_start(config, sink);
            let _ = reply.send(());
         },
         ScanCommand::Stop(reply) => {
            if self.active.is_some() {
               self.finish_scan(false);
            } else {
               debug!("Stop requested while not scanning, ignoring");
            }
            let _ = reply.send(());
         },
      }
   }

   fn handle_start(&mut self, config: ScanConfig, sink: Weak<dyn ScanSink>) {
      if self.active.is_some() {
         warn!("Scan rejected: already scanning");
         Self::deliver_to(&sink, ScanEvent::Failed(ScanFailure::AlreadyScanning));
         return;
      }

      if !self.capabilities.transport_supported() {
         warn!("Scan rejected: transport unsupported");
         Self::deliver_to(&sink, ScanEvent::Failed(ScanFailure::TransportUnsupported));
         return;
      }

      let missing = self.capabilities.missing_permissions();
      if !missing.is_empty() {
         warn!("Scan rejected: missing permissions {missing:?}");
         Self::deliver_to(
            &sink,
            ScanEvent::Failed(ScanFailure::InsufficientPermissions(missing)),
         );
         return;
      }

      let spec = ScanFilterSpec::compile(&config.filters);
      let duration = config.scan_duration();
      info!(
         "Starting scan for {duration:?} ({})",
         if spec.is_open() { "open filter" } else { "filtered" }
      );

      self.transport.start_scan(duration);
      self.arm_duration_timer(duration);
      self.shared.is_scanning.store(true, Ordering::Relaxed);
      self.active = Some(ActiveScan { spec, sink });
      self.deliver(ScanEvent::Started);
   }

   fn handle_transport_event(&mut self, event: TransportEvent) {
      match event {
         TransportEvent::PeerFound(peer) => {
            let Some(scan) = &self.active else {
               return;
            };
            // Repeat sightings are all forwarded; dedup is the
            // subscriber's business.
            if scan.spec.matches(&peer) {
               debug!("Peer {} matched filter (rssi {})", peer.address, peer.rssi);
               self.deliver(ScanEvent::PeerFound(peer));
            }
         },
         TransportEvent::ScanFailed(code) => {
            if self.active.is_none() {
               return;
            }
            warn!("Transport scan failed with code {code}");
            self.cancel_duration_timer();
            self.shared.is_scanning.store(false, Ordering::Relaxed);
            let scan = self.active.take();
            if let Some(scan) = scan {
               Self::deliver_to(&scan.sink, ScanEvent::Failed(ScanFailure::Transport(code)));
            }
         },
         _ => {
            debug!("Ignoring non-scan transport event");
         },
      }
   }

   /// Ends the active scan, delivering the stopped event exactly once.
   fn finish_scan(&mut self, expired: bool) {
      let Some(scan) = self.active.take() else {
         return;
      };

      if expired {
         info!("Scan duration elapsed, stopping");
      } else {
         info!("Scan stopped on request");
      }

      self.cancel_duration_timer();
      self.transport.stop_scan();
      self.shared.is_scanning.store(false, Ordering::Relaxed);
      Self::deliver_to(&scan.sink, ScanEvent::Stopped);
   }

   fn arm_duration_timer(&mut self, duration: Duration) {
      self.cancel_duration_timer();
      let epoch = self.timer_epoch;
      let loopback = self.loopback_tx.clone();
      self.duration_timer = Some(tokio::spawn(async move {
         time::sleep(duration).await;
         let _ = loopback.send(Loopback::DurationElapsed(epoch)).await;
      }));
   }

   fn cancel_duration_timer(&mut self) {
      self.timer_epoch += 1;
      if let Some(handle) = self.duration_timer.take() {
         handle.abort();
      }
   }

   fn deliver(&self, event: ScanEvent) {
      if let Some(scan) = &self.active {
         Self::deliver_to(&scan.sink, event);
      }
   }

   fn deliver_to(sink: &Weak<dyn ScanSink>, event: ScanEvent) {
      match sink.upgrade() {
         Some(sink) => sink.on_scan_event(event),
         None => debug!("Scan subscriber gone, dropping event"),
      }
   }
}
