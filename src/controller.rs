//! Scan controller.
//!
//! Owns the scanning state of one adapter and decides when to issue start and
//! stop requests. The controller never awaits the adapter inline: requests are
//! queued to a single worker task that runs them against the adapter strictly
//! in request order and posts a [`Completion`] back to the owning event loop,
//! which feeds it to [`ScanController::handle_completion`]. Every request bumps
//! a generation counter, and completions that do not carry the latest
//! generation are discarded, so overlapping start/stop requests settle on the
//! most recent one and the adapter sees them in the same order.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::ble::adapter::{AdapterState, Advertisement, BleAdapter, ScanOptions};
use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::message::{DiscoveryMessage, Notice, ScanCommand, ScanMessage, StatusMessage, Warning};
use crate::utils::epoch_millis;

/// Scanning state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanState {
    /// Not scanning.
    #[default]
    Idle,
    /// Start requested, waiting for the adapter.
    Starting,
    /// The adapter is scanning.
    Scanning,
    /// Stop requested, waiting for the adapter.
    Stopping,
}

impl ScanState {
    /// Check if the adapter is confirmed to be scanning.
    pub fn is_scanning(&self) -> bool {
        matches!(self, Self::Scanning)
    }

    /// Check if scanning is running or about to.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Scanning)
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// What caused a start or stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// An operator command.
    Operator,
    /// The initial start when the node launches.
    Startup,
    /// The adapter changed power state.
    AdapterStateChange,
    /// The node is shutting down.
    Teardown,
}

impl Trigger {
    /// Whether status messages for this trigger are flagged `stateChange`.
    pub fn is_state_change(&self) -> bool {
        matches!(self, Self::AdapterStateChange)
    }
}

/// Adapter request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanOp {
    /// `start_scan`
    Start,
    /// `stop_scan`
    Stop,
}

/// Result of an adapter request, posted back to the event loop.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) generation: u64,
    pub(crate) op: ScanOp,
    pub(crate) trigger: Trigger,
    pub(crate) result: Result<()>,
}

/// Work queued for the adapter worker.
enum Request {
    Start {
        generation: u64,
        trigger: Trigger,
        options: ScanOptions,
    },
    Stop {
        generation: u64,
        trigger: Trigger,
    },
    /// Final stop, answered directly to the caller.
    Teardown(oneshot::Sender<Result<()>>),
    /// Answered once every request queued before it has run.
    Flush(oneshot::Sender<()>),
}

/// Runs adapter requests one at a time, in the order they were queued.
async fn adapter_worker(
    adapter: Arc<dyn BleAdapter>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    completion_tx: mpsc::UnboundedSender<Completion>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            Request::Start {
                generation,
                trigger,
                options,
            } => {
                let result = adapter.start_scan(options).await;
                let _ = completion_tx.send(Completion {
                    generation,
                    op: ScanOp::Start,
                    trigger,
                    result,
                });
            }
            Request::Stop {
                generation,
                trigger,
            } => {
                let result = adapter.stop_scan().await;
                let _ = completion_tx.send(Completion {
                    generation,
                    op: ScanOp::Stop,
                    trigger,
                    result,
                });
            }
            Request::Teardown(reply) => {
                let _ = reply.send(adapter.stop_scan().await);
            }
            Request::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }

    debug!("Adapter worker ended");
}

/// Output side of a controller.
#[derive(Clone)]
pub(crate) struct Outputs {
    pub(crate) messages: broadcast::Sender<ScanMessage>,
    pub(crate) notices: broadcast::Sender<Notice>,
    pub(crate) state: Arc<RwLock<ScanState>>,
}

/// Scan state machine for one adapter.
pub(crate) struct ScanController {
    config: ScanConfig,
    state: ScanState,
    /// Last adapter state seen, reported in status messages.
    adapter_state: AdapterState,
    /// Generation of the latest adapter request.
    generation: u64,
    outputs: Outputs,
    request_tx: mpsc::UnboundedSender<Request>,
}

impl ScanController {
    /// Create a controller and spawn its adapter worker.
    ///
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(
        adapter: Arc<dyn BleAdapter>,
        config: ScanConfig,
        adapter_state: AdapterState,
        outputs: Outputs,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        *outputs.state.write() = ScanState::Idle;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        tokio::spawn(adapter_worker(adapter, request_rx, completion_tx));

        Self {
            config,
            state: ScanState::Idle,
            adapter_state,
            generation: 0,
            outputs,
            request_tx,
        }
    }

    pub(crate) fn state(&self) -> ScanState {
        self.state
    }

    pub(crate) fn adapter_state(&self) -> AdapterState {
        self.adapter_state
    }

    /// Request the adapter to start scanning.
    ///
    /// No-op while scanning or while a start is already in flight.
    pub(crate) fn start(&mut self, trigger: Trigger, caused_by_error: bool) {
        if self.state.is_active() {
            debug!("Already scanning, ignoring start request");
            return;
        }

        self.emit_status(trigger, caused_by_error);
        self.set_state(ScanState::Starting);

        let generation = self.next_generation();
        self.queue(Request::Start {
            generation,
            trigger,
            options: self.config.scan_options(),
        });
    }

    /// Request the adapter to stop scanning.
    ///
    /// No-op while idle or while a stop is already in flight.
    pub(crate) fn stop(&mut self, trigger: Trigger, caused_by_error: bool) {
        if !self.state.is_active() {
            debug!("Not scanning, ignoring stop request");
            return;
        }

        self.emit_status(trigger, caused_by_error);
        self.set_state(ScanState::Stopping);

        let generation = self.next_generation();
        self.queue(Request::Stop {
            generation,
            trigger,
        });

        if caused_by_error {
            self.warn(Warning::StoppedByStateChange);
        }
    }

    /// Apply the adapter's answer to a start or stop request.
    pub(crate) fn handle_completion(&mut self, completion: Completion) {
        if completion.generation != self.generation {
            debug!(
                "Discarding stale {:?} completion (generation {}, latest {})",
                completion.op, completion.generation, self.generation
            );
            return;
        }

        match (completion.op, completion.result) {
            (ScanOp::Start, Ok(())) => {
                info!(
                    "Scanning for BLEs started. UUIDs: {:?} - Duplicates allowed: {}",
                    self.config.service_uuids, self.config.allow_duplicates
                );
                self.set_state(ScanState::Scanning);
                let _ = self.outputs.notices.send(Notice::Started);
            }
            (ScanOp::Start, Err(e)) => {
                self.set_state(ScanState::Idle);
                self.send(ScanMessage::Status(StatusMessage::new(
                    true,
                    completion.trigger.is_state_change(),
                    self.adapter_state,
                )));
                self.warn(Warning::StartFailed {
                    reason: e.to_string(),
                });
            }
            (ScanOp::Stop, result) => {
                if let Err(e) = result {
                    self.warn(Warning::StopFailed {
                        reason: e.to_string(),
                    });
                }
                info!("BLE scanning stopped.");
                self.set_state(ScanState::Idle);
                let _ = self.outputs.notices.send(Notice::Stopped);
            }
        }
    }

    /// React to an adapter power-state change.
    pub(crate) fn handle_adapter_state(&mut self, adapter_state: AdapterState) {
        debug!("Adapter state changed: {} -> {}", self.adapter_state, adapter_state);
        self.adapter_state = adapter_state;

        if adapter_state.is_powered_on() {
            self.start(Trigger::AdapterStateChange, false);
        } else {
            self.stop(Trigger::AdapterStateChange, true);
        }
    }

    /// Forward an advertisement as a discovery message.
    pub(crate) fn handle_discovery(&mut self, advertisement: Advertisement) {
        let message = DiscoveryMessage::new(advertisement, &self.config.detected_by, epoch_millis());
        self.send(ScanMessage::Discovery(message));
    }

    /// Handle an operator input message.
    pub(crate) fn handle_message(&mut self, message: &Value) {
        match ScanCommand::from_message(message) {
            Some(command) => self.apply(command),
            None => self.warn(Warning::InvalidCommand),
        }
    }

    /// Apply an operator command.
    pub(crate) fn apply(&mut self, command: ScanCommand) {
        match command {
            ScanCommand::Start => self.start(Trigger::Operator, false),
            ScanCommand::Stop => self.stop(Trigger::Operator, false),
        }
    }

    /// Initial start attempt.
    ///
    /// Returns the delay after which [`Self::report_unavailable`] should run
    /// when the adapter was not ready.
    pub(crate) fn startup(&mut self) -> Option<Duration> {
        if self.adapter_state.is_powered_on() {
            self.start(Trigger::Startup, false);
            return None;
        }

        self.warn(Warning::AdapterUnavailable {
            state: self.adapter_state,
        });
        Some(self.config.startup_grace)
    }

    /// Report that scanning could not start, unless the adapter came up and
    /// scanning began in the meantime.
    pub(crate) fn report_unavailable(&mut self) {
        if self.state != ScanState::Idle {
            debug!("Adapter became ready during startup grace, nothing to report");
            return;
        }

        self.send(ScanMessage::Status(StatusMessage::new(
            true,
            false,
            self.adapter_state,
        )));
    }

    /// Stop scanning for good. Always leaves the controller idle.
    ///
    /// The final stop is queued behind any request still in flight, and this
    /// waits until the adapter has answered it.
    pub(crate) async fn teardown(&mut self) {
        // Anything still in flight is superseded.
        self.next_generation();

        match self.state {
            ScanState::Starting | ScanState::Scanning => {
                self.emit_status(Trigger::Teardown, false);

                let (reply_tx, reply_rx) = oneshot::channel();
                self.queue(Request::Teardown(reply_tx));
                let result = reply_rx
                    .await
                    .unwrap_or_else(|_| Err(Error::Internal("adapter worker gone".to_string())));

                match result {
                    Ok(()) => {
                        info!("BLE scanning stopped.");
                        let _ = self.outputs.notices.send(Notice::Stopped);
                    }
                    Err(e) => self.warn(Warning::StopFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            ScanState::Stopping => {
                let (reply_tx, reply_rx) = oneshot::channel();
                self.queue(Request::Flush(reply_tx));
                let _ = reply_rx.await;
            }
            ScanState::Idle => {}
        }

        self.set_state(ScanState::Idle);
    }

    fn queue(&self, request: Request) {
        if self.request_tx.send(request).is_err() {
            warn!("Adapter worker is gone, request dropped");
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn set_state(&mut self, state: ScanState) {
        self.state = state;
        *self.outputs.state.write() = state;
    }

    fn emit_status(&self, trigger: Trigger, caused_by_error: bool) {
        self.send(ScanMessage::Status(StatusMessage::new(
            caused_by_error,
            trigger.is_state_change(),
            self.adapter_state,
        )));
    }

    fn send(&self, message: ScanMessage) {
        let _ = self.outputs.messages.send(message);
    }

    fn warn(&self, warning: Warning) {
        warn!("{}", warning);
        let _ = self.outputs.notices.send(Notice::Warning(warning));
    }
}
