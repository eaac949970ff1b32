//! Scan node: wires a [`BleAdapter`] to a scan controller and runs its event
//! loop.
//!
//! All inputs of a node (adapter events, operator input, adapter request
//! completions and the startup timer) are serialized through one tokio task,
//! so controller state needs no locking. Subscribers read outputs from
//! broadcast channels.

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::adapter::{AdapterEvent, AdapterEventStream, BleAdapter};
use crate::config::ScanConfig;
use crate::controller::{Completion, Outputs, ScanController, ScanState};
use crate::error::{Error, Result};
use crate::message::{Notice, ScanCommand, ScanMessage};

/// Capacity of the output broadcast channels.
const CHANNEL_CAPACITY: usize = 100;

/// Handle for a registered callback.
///
/// The callback is unregistered when this handle is dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

enum NodeInput {
    Message(Value),
    Command(ScanCommand),
    Shutdown(oneshot::Sender<()>),
}

/// A BLE scan node.
///
/// Subscribe to its outputs first, then [`launch`](Self::launch) it.
pub struct ScanNode {
    adapter: Arc<dyn BleAdapter>,
    config: ScanConfig,
    message_tx: broadcast::Sender<ScanMessage>,
    notice_tx: broadcast::Sender<Notice>,
    /// Mirror of the controller state.
    state: Arc<RwLock<ScanState>>,
    /// Set from the start of `launch` until `shutdown`.
    launched: AtomicBool,
    input_tx: Mutex<Option<mpsc::UnboundedSender<NodeInput>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    callback_counter: AtomicU64,
}

impl ScanNode {
    /// Create a node for an adapter. Nothing happens until it is launched.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: ScanConfig) -> Self {
        let (message_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (notice_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            adapter,
            config,
            message_tx,
            notice_tx,
            state: Arc::new(RwLock::new(ScanState::Idle)),
            launched: AtomicBool::new(false),
            input_tx: Mutex::new(None),
            task: Mutex::new(None),
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to adapter events and start the event loop.
    ///
    /// Scanning starts right away if the adapter is powered on; otherwise a
    /// warning is raised and an error status follows after the startup grace
    /// period unless the adapter comes up first.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter event subscription fails.
    pub async fn launch(&self) -> Result<()> {
        if self
            .launched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Scan node already launched");
            return Ok(());
        }

        let events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                self.launched.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let adapter_state = self.adapter.state().await;
        info!("Launching scan node, adapter state: {}", adapter_state);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let controller = ScanController::new(
            self.adapter.clone(),
            self.config.clone(),
            adapter_state,
            Outputs {
                messages: self.message_tx.clone(),
                notices: self.notice_tx.clone(),
                state: self.state.clone(),
            },
            completion_tx,
        );

        let handle = tokio::spawn(run(controller, events, input_rx, completion_rx));

        *self.input_tx.lock() = Some(input_tx);
        *self.task.lock() = Some(handle);

        Ok(())
    }

    /// Queue an operator input message such as `{"payload": {"scan": true}}`.
    ///
    /// Messages of any other shape are rejected with a warning notice.
    pub fn send_message(&self, message: Value) -> Result<()> {
        self.send_input(NodeInput::Message(message))
    }

    /// Queue an operator start request.
    pub fn start_scan(&self) -> Result<()> {
        self.send_input(NodeInput::Command(ScanCommand::Start))
    }

    /// Queue an operator stop request.
    pub fn stop_scan(&self) -> Result<()> {
        self.send_input(NodeInput::Command(ScanCommand::Stop))
    }

    /// Current scan state.
    pub fn scan_state(&self) -> ScanState {
        *self.state.read()
    }

    /// Check if the adapter is confirmed to be scanning.
    pub fn is_scanning(&self) -> bool {
        self.scan_state().is_scanning()
    }

    /// Check if the event loop is running.
    pub fn is_running(&self) -> bool {
        self.input_tx.lock().is_some()
    }

    /// Subscribe to output messages.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ScanMessage> {
        self.message_tx.subscribe()
    }

    /// Subscribe to started/stopped indicators and warnings.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    /// Register a callback for output messages.
    pub fn on_message<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ScanMessage) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.message_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => callback(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Message callback lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Stop scanning, release the adapter subscription and end the event
    /// loop. Safe to call more than once, or on a node never launched.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(input_tx) = self.input_tx.lock().take() else {
            debug!("Scan node not running, nothing to shut down");
            return Ok(());
        };

        info!("Shutting down scan node");

        let (done_tx, done_rx) = oneshot::channel();
        if input_tx.send(NodeInput::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }

        let handle = self.task.lock().take();
        let result = match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("scan node task failed: {}", e))),
            None => Ok(()),
        };

        self.launched.store(false, Ordering::SeqCst);
        result
    }

    fn send_input(&self, input: NodeInput) -> Result<()> {
        self.input_tx
            .lock()
            .as_ref()
            .ok_or(Error::NotRunning)?
            .send(input)
            .map_err(|_| Error::NotRunning)
    }
}

impl Drop for ScanNode {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            debug!("Scan node dropped without shutdown, aborting event loop");
            handle.abort();
        }
    }
}

/// The node's event loop.
async fn run(
    mut controller: ScanController,
    events: AdapterEventStream,
    mut inputs: mpsc::UnboundedReceiver<NodeInput>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) {
    let mut events = Some(events);
    let grace = controller.startup();
    let mut grace_pending = grace.is_some();
    let grace_timer = tokio::time::sleep(grace.unwrap_or(Duration::ZERO));
    tokio::pin!(grace_timer);

    loop {
        tokio::select! {
            Some(completion) = completions.recv() => {
                controller.handle_completion(completion);
            }
            event = next_event(&mut events), if events.is_some() => match event {
                Some(AdapterEvent::Discovered(advertisement)) => {
                    controller.handle_discovery(advertisement);
                }
                Some(AdapterEvent::StateChanged(state)) => {
                    controller.handle_adapter_state(state);
                }
                None => {
                    warn!("Adapter event stream ended");
                    events = None;
                }
            },
            input = inputs.recv() => match input {
                Some(NodeInput::Message(message)) => controller.handle_message(&message),
                Some(NodeInput::Command(command)) => controller.apply(command),
                Some(NodeInput::Shutdown(done)) => {
                    controller.teardown().await;
                    drop(events.take());
                    let _ = done.send(());
                    break;
                }
                None => {
                    controller.teardown().await;
                    break;
                }
            },
            _ = &mut grace_timer, if grace_pending => {
                grace_pending = false;
                controller.report_unavailable();
            }
        }
    }

    debug!(
        "Scan node event loop ended (state {}, adapter state {})",
        controller.state(),
        controller.adapter_state()
    );
}

async fn next_event(events: &mut Option<AdapterEventStream>) -> Option<AdapterEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => None,
    }
}

/// Convenience for hosts that only need a running node.
///
/// Equivalent to [`ScanNode::new`] followed by [`ScanNode::launch`].
pub async fn launch(adapter: Arc<dyn BleAdapter>, config: ScanConfig) -> Result<ScanNode> {
    let node = ScanNode::new(adapter, config);
    node.launch().await?;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::testing::RecordingAdapter;
    use crate::ble::adapter::{AdapterState, Advertisement, AdvertisementData, MockBleAdapter};
    use crate::message::{StatusMessage, Warning};
    use bytes::Bytes;
    use futures::channel::mpsc as fmpsc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(2);

    /// Mock adapter whose event stream is fed through the returned sender.
    fn mock_adapter(
        state: AdapterState,
        starts: usize,
        stops: usize,
    ) -> (MockBleAdapter, fmpsc::UnboundedSender<AdapterEvent>) {
        let (event_tx, event_rx) = fmpsc::unbounded();
        let event_rx = Mutex::new(Some(event_rx));

        let mut adapter = MockBleAdapter::new();
        adapter.expect_events().times(1).returning(move || {
            let rx = event_rx.lock().take().ok_or(Error::NotRunning)?;
            Ok(Box::pin(rx) as AdapterEventStream)
        });
        adapter.expect_state().returning(move || state);
        adapter
            .expect_start_scan()
            .times(starts)
            .returning(|_| Ok(()));
        adapter.expect_stop_scan().times(stops).returning(|| Ok(()));

        (adapter, event_tx)
    }

    fn config() -> ScanConfig {
        ScanConfig::new()
            .with_detected_by("test-host")
            .with_startup_grace(Duration::from_millis(20))
    }

    async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("channel closed")
    }

    fn ibeacon_advertisement() -> Advertisement {
        let mut data = vec![0x4c, 0x00, 0x02, 0x15];
        data.extend(0x01..=0x10u8);
        data.extend([0x00, 0x01, 0x00, 0x02, 0xc5]);

        Advertisement {
            peripheral_id: "beacon-1".to_string(),
            rssi: -59,
            data: AdvertisementData {
                local_name: Some("Beacon".to_string()),
                manufacturer_data: Some(Bytes::from(data)),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (adapter, event_tx) = mock_adapter(AdapterState::PoweredOn, 1, 1);
        let node = ScanNode::new(Arc::new(adapter), config());
        let mut messages = node.subscribe_messages();
        let mut notices = node.subscribe_notices();

        node.launch().await.unwrap();
        assert!(node.is_running());

        assert_eq!(
            next(&mut messages).await,
            ScanMessage::Status(StatusMessage::new(false, false, AdapterState::PoweredOn))
        );
        assert_eq!(next(&mut notices).await, Notice::Started);
        assert!(node.is_scanning());

        event_tx
            .unbounded_send(AdapterEvent::Discovered(ibeacon_advertisement()))
            .unwrap();
        let message = next(&mut messages).await;
        let discovery = message.as_discovery().unwrap();
        assert_eq!(discovery.peripheral_uuid, "beacon-1");
        assert_eq!(discovery.local_name.as_deref(), Some("Beacon"));
        let frame = discovery.ibeacon.as_ref().unwrap();
        assert_eq!((frame.major, frame.minor), (1, 2));

        event_tx
            .unbounded_send(AdapterEvent::StateChanged(AdapterState::PoweredOff))
            .unwrap();
        assert_eq!(
            next(&mut messages).await,
            ScanMessage::Status(StatusMessage::new(true, true, AdapterState::PoweredOff))
        );
        assert_eq!(
            next(&mut notices).await,
            Notice::Warning(Warning::StoppedByStateChange)
        );
        assert_eq!(next(&mut notices).await, Notice::Stopped);
        assert!(!node.is_scanning());

        node.shutdown().await.unwrap();
        assert!(!node.is_running());
        assert!(event_tx.is_closed());
    }

    #[tokio::test]
    async fn test_operator_commands() {
        let (adapter, _event_tx) = mock_adapter(AdapterState::PoweredOn, 2, 2);
        let node = ScanNode::new(Arc::new(adapter), config());
        let mut notices = node.subscribe_notices();
        node.launch().await.unwrap();

        assert_eq!(next(&mut notices).await, Notice::Started);

        node.send_message(json!({"payload": {"scan": false}})).unwrap();
        assert_eq!(next(&mut notices).await, Notice::Stopped);

        node.send_message(json!({"payload": 42})).unwrap();
        assert_eq!(
            next(&mut notices).await,
            Notice::Warning(Warning::InvalidCommand)
        );

        node.start_scan().unwrap();
        assert_eq!(next(&mut notices).await, Notice::Started);

        node.stop_scan().unwrap();
        assert_eq!(next(&mut notices).await, Notice::Stopped);
        assert_eq!(node.scan_state(), ScanState::Idle);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_adapter_not_ready_at_startup() {
        let (adapter, event_tx) = mock_adapter(AdapterState::PoweredOff, 1, 1);
        let node = ScanNode::new(Arc::new(adapter), config());
        let mut messages = node.subscribe_messages();
        let mut notices = node.subscribe_notices();

        node.launch().await.unwrap();

        assert_eq!(
            next(&mut notices).await,
            Notice::Warning(Warning::AdapterUnavailable {
                state: AdapterState::PoweredOff
            })
        );
        assert_eq!(
            next(&mut messages).await,
            ScanMessage::Status(StatusMessage::new(true, false, AdapterState::PoweredOff))
        );

        event_tx
            .unbounded_send(AdapterEvent::StateChanged(AdapterState::PoweredOn))
            .unwrap();
        assert_eq!(
            next(&mut messages).await,
            ScanMessage::Status(StatusMessage::new(false, true, AdapterState::PoweredOn))
        );
        assert_eq!(next(&mut notices).await, Notice::Started);

        node.shutdown().await.unwrap();
        assert_eq!(
            next(&mut messages).await,
            ScanMessage::Status(StatusMessage::new(false, false, AdapterState::PoweredOn))
        );
        assert_eq!(next(&mut notices).await, Notice::Stopped);
        assert!(!node.is_scanning());
        assert!(event_tx.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (adapter, event_tx) = mock_adapter(AdapterState::PoweredOff, 0, 0);
        let node = launch(Arc::new(adapter), config()).await.unwrap();

        node.shutdown().await.unwrap();
        node.shutdown().await.unwrap();

        assert_eq!(node.scan_state(), ScanState::Idle);
        assert!(event_tx.is_closed());
        assert!(matches!(node.start_scan(), Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn test_shutdown_before_launch() {
        let node = ScanNode::new(Arc::new(MockBleAdapter::new()), config());

        node.shutdown().await.unwrap();
        assert!(matches!(
            node.send_message(json!({"payload": {"scan": true}})),
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let mut adapter = MockBleAdapter::new();
        adapter
            .expect_events()
            .returning(|| Err(Error::BluetoothUnavailable));
        let node = ScanNode::new(Arc::new(adapter), config());

        assert!(matches!(
            node.launch().await,
            Err(Error::BluetoothUnavailable)
        ));
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_launch_subscribes_once() {
        let adapter = Arc::new(RecordingAdapter::new(AdapterState::PoweredOff, Duration::ZERO));
        let node = ScanNode::new(adapter.clone(), config());

        let (first, second) = tokio::join!(node.launch(), node.launch());
        tokio_test::assert_ok!(first);
        tokio_test::assert_ok!(second);

        assert_eq!(adapter.subscriptions(), 1);
        assert!(node.is_running());

        node.shutdown().await.unwrap();
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_relaunch_after_shutdown() {
        let adapter = Arc::new(RecordingAdapter::new(AdapterState::PoweredOff, Duration::ZERO));
        let node = ScanNode::new(adapter.clone(), config());

        node.launch().await.unwrap();
        node.shutdown().await.unwrap();
        node.launch().await.unwrap();

        assert_eq!(adapter.subscriptions(), 2);
        assert!(node.is_running());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_slow_start_stops_radio() {
        let adapter = Arc::new(RecordingAdapter::new(
            AdapterState::PoweredOn,
            Duration::from_millis(100),
        ));
        let node = ScanNode::new(adapter.clone(), config());

        node.launch().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        node.shutdown().await.unwrap();

        assert_eq!(adapter.log(), vec!["start-begin", "start-done", "stop-done"]);
        assert!(!adapter.radio_scanning());
        assert_eq!(node.scan_state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_operator_stop_during_slow_start_stops_radio() {
        let adapter = Arc::new(RecordingAdapter::new(
            AdapterState::PoweredOn,
            Duration::from_millis(100),
        ));
        let node = ScanNode::new(adapter.clone(), config());
        let mut notices = node.subscribe_notices();

        node.launch().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        node.stop_scan().unwrap();

        assert_eq!(next(&mut notices).await, Notice::Stopped);
        assert_eq!(adapter.log(), vec!["start-begin", "start-done", "stop-done"]);
        assert!(!adapter.radio_scanning());

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_on_message_callback() {
        let (adapter, event_tx) = mock_adapter(AdapterState::PoweredOn, 1, 1);
        let node = ScanNode::new(Arc::new(adapter), config());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let handle = node.on_message(move |message| {
            if let Some(discovery) = message.as_discovery() {
                let _ = seen_tx.send(discovery.peripheral_uuid.clone());
            }
        });
        assert_eq!(handle.id(), 0);

        node.launch().await.unwrap();
        event_tx
            .unbounded_send(AdapterEvent::Discovered(ibeacon_advertisement()))
            .unwrap();

        let seen = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap();
        assert_eq!(seen.as_deref(), Some("beacon-1"));

        handle.unregister();
        node.shutdown().await.unwrap();
    }
}
