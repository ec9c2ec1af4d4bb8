//! WebSocket client for the obs-websocket v5 protocol.
//!
//! [`ObsClient`] owns one session with the OBS WebSocket server. A single
//! background task reads frames in arrival order and routes them: handshake
//! messages to the [`Handshake`] state machine, responses to the
//! [`Correlator`], events to the [`EventDispatcher`]. Callers never touch the
//! socket directly; outgoing frames go through an mpsc channel to the same
//! task.
//!
//! ## Session lifecycle
//!
//! ```text
//! Idle → Connecting → AwaitingHandshake → Authenticated → Closing → Idle
//! ```
//!
//! When the transport closes for any reason, every pending request fails with
//! [`ObsError::ConnectionClosed`], the state returns to `Idle`, and a
//! [`LifecycleEvent::Disconnected`] is broadcast. Event subscriptions survive.
//! The client never reconnects on its own; calling [`ObsClient::connect`] again
//! starts a fresh session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::correlator::{Correlator, PendingSummary, Reply, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{ObsError, CLOSE_CODE_AUTHENTICATION_FAILED};
use crate::events::{EventDispatcher, HandlerError, ObsEvent, SubscriptionId};
use crate::handshake::Handshake;
use crate::protocol::{
    self, BatchRequest, BatchResult, EventSubscription, Message, Reidentify, Request,
    RequestBatch,
};

pub const DEFAULT_URL: &str = "ws://localhost:4455";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5_000);

const OUTBOUND_CAPACITY: usize = 256;
const LIFECYCLE_CAPACITY: usize = 16;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;

/// Connection settings for [`ObsClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    /// Never sent over the wire; only used to answer the server's challenge.
    pub password: Option<String>,
    pub event_subscriptions: EventSubscription,
    /// Deadline for the whole Hello/Identify/Identified exchange.
    pub handshake_timeout: Duration,
    /// Default per-request deadline.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            password: None,
            event_subscriptions: EventSubscription::ALL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingHandshake,
    Authenticated,
    Closing,
}

/// Session lifecycle notifications for collaborators (e.g. a reconnect policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected { rpc_version: u32 },
    Disconnected { reason: String },
}

enum Outbound {
    Frame(Message),
    Close,
}

/// The live transport of the current session.
struct Link {
    outbound: mpsc::Sender<Outbound>,
    task: JoinHandle<()>,
}

struct Slot {
    state: SessionState,
    link: Option<Link>,
    rpc_version: Option<u32>,
    subscriptions: EventSubscription,
}

struct Shared {
    options: ClientOptions,
    slot: Mutex<Slot>,
    correlator: Correlator,
    dispatcher: EventDispatcher,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    /// Waiter for the `Identified` that answers a `Reidentify`.
    reidentify_waiter: Mutex<Option<oneshot::Sender<u32>>>,
    /// Serialises connect, disconnect, and reidentify.
    control: tokio::sync::Mutex<()>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reidentify_waiter(&self) -> MutexGuard<'_, Option<oneshot::Sender<u32>>> {
        self.reidentify_waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dropped with the last [`ObsClient`] clone; releases the session's outbound
/// channel so the reader task closes the socket.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(link) = self.shared.slot().link.take() {
            let _ = link.outbound.try_send(Outbound::Close);
        }
    }
}

/// Client for one OBS WebSocket server. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ObsClient {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

impl ObsClient {
    pub fn new(options: ClientOptions) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: SessionState::Idle,
                link: None,
                rpc_version: None,
                subscriptions: options.event_subscriptions,
            }),
            options,
            correlator: Correlator::new(),
            dispatcher: EventDispatcher::new(),
            lifecycle,
            reidentify_waiter: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
        });
        Self {
            _owner: Arc::new(Owner {
                shared: Arc::clone(&shared),
            }),
            shared,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    pub fn state(&self) -> SessionState {
        self.shared.slot().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// RPC version agreed in `Identified`, while a session is up.
    pub fn negotiated_rpc_version(&self) -> Option<u32> {
        self.shared.slot().rpc_version
    }

    /// Event categories the current (or next) session subscribes to.
    pub fn event_subscriptions(&self) -> EventSubscription {
        self.shared.slot().subscriptions
    }

    pub fn pending_requests(&self) -> Vec<PendingSummary> {
        self.shared.correlator.snapshot()
    }

    /// Open the WebSocket and complete the handshake.
    ///
    /// Returns immediately if the session is already authenticated.
    pub async fn connect(&self) -> Result<(), ObsError> {
        let _control = self.shared.control.lock().await;

        {
            let mut slot = self.shared.slot();
            match slot.state {
                SessionState::Authenticated => return Ok(()),
                SessionState::Idle => slot.state = SessionState::Connecting,
                other => {
                    return Err(ObsError::Connection(format!(
                        "cannot connect while session is {other:?}"
                    )))
                }
            }
        }

        let url = self.shared.options.url.as_str();
        info!(url, "Connecting to OBS WebSocket server");

        let timeout = self.shared.options.handshake_timeout;
        let opening = tokio_tungstenite::connect_async(url);
        let ws_stream = match tokio::time::timeout(timeout, opening).await {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                self.shared.slot().state = SessionState::Idle;
                warn!(url, "WebSocket connect failed: {e}");
                return Err(ObsError::Connection(format!("WebSocket connect failed: {e}")));
            }
            Err(_) => {
                self.shared.slot().state = SessionState::Idle;
                warn!(url, ?timeout, "WebSocket connect timed out");
                return Err(ObsError::Connection(format!(
                    "WebSocket connect timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        let subscriptions = self.shared.slot().subscriptions;
        let handshake = Handshake::new(
            self.shared.options.password.clone(),
            subscriptions,
            result_tx,
        );

        {
            let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
            let mut slot = self.shared.slot();
            slot.state = SessionState::AwaitingHandshake;
            // Spawned under the slot lock so teardown can't run before the link is stored.
            let task = tokio::spawn(run_session(
                ws_stream,
                out_rx,
                Arc::clone(&self.shared),
                handshake,
            ));
            slot.link = Some(Link {
                outbound: out_tx,
                task,
            });
        }

        let result = match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ObsError::Connection(
                "connection closed during handshake".to_string(),
            )),
            Err(_) => Err(ObsError::HandshakeTimeout(timeout)),
        };

        match result {
            Ok(rpc_version) => {
                info!(rpc_version, "Identified with OBS WebSocket server");
                Ok(())
            }
            Err(e) => {
                warn!("Handshake failed: {e}");
                self.shutdown().await;
                Err(e)
            }
        }
    }

    /// Close the session. Pending requests fail with `ConnectionClosed`.
    /// No-op when idle.
    pub async fn disconnect(&self) {
        let _control = self.shared.control.lock().await;
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        let link = {
            let mut slot = self.shared.slot();
            if slot.state == SessionState::Idle {
                return;
            }
            slot.state = SessionState::Closing;
            slot.link.take()
        };

        if let Some(link) = link {
            let _ = link.outbound.send(Outbound::Close).await;
            let _ = link.task.await;
        }
    }

    fn outbound(&self) -> Result<mpsc::Sender<Outbound>, ObsError> {
        let slot = self.shared.slot();
        if slot.state != SessionState::Authenticated {
            return Err(ObsError::NotReady);
        }
        slot.link
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(ObsError::NotReady)
    }

    /// Send a request with the default timeout and return its `responseData`.
    pub async fn send_request(
        &self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> Result<Value, ObsError> {
        let timeout = self.shared.options.request_timeout;
        self.send_request_with_timeout(request_type, request_data, timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// Fails with [`ObsError::NotReady`] without sending anything unless the
    /// session is authenticated.
    pub async fn send_request_with_timeout(
        &self,
        request_type: &str,
        request_data: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ObsError> {
        let outbound = self.outbound()?;
        let pending = self.shared.correlator.register(request_type, timeout)?;

        let request = Message::Request(Request {
            request_type: request_type.to_string(),
            request_id: pending.request_id().to_string(),
            request_data,
        });
        debug!(request_type, request_id = pending.request_id(), "Sending request");
        outbound
            .send(Outbound::Frame(request))
            .await
            .map_err(|_| ObsError::ConnectionClosed)?;

        match pending.wait().await? {
            Reply::Single(data) => Ok(data),
            Reply::Batch(_) => Err(ObsError::MalformedMessage(format!(
                "batch response to single request {request_type}"
            ))),
        }
    }

    /// Send several requests in one `RequestBatch` frame.
    ///
    /// The batch as a whole succeeds if the server answers; per-request
    /// failures are reported in each result's `request_status`.
    pub async fn send_batch(
        &self,
        requests: Vec<BatchRequest>,
        halt_on_failure: bool,
    ) -> Result<Vec<BatchResult>, ObsError> {
        let outbound = self.outbound()?;
        let pending = self
            .shared
            .correlator
            .register("RequestBatch", self.shared.options.request_timeout)?;

        let batch = Message::RequestBatch(RequestBatch {
            request_id: pending.request_id().to_string(),
            halt_on_failure: halt_on_failure.then_some(true),
            execution_type: None,
            requests,
        });
        outbound
            .send(Outbound::Frame(batch))
            .await
            .map_err(|_| ObsError::ConnectionClosed)?;

        match pending.wait().await? {
            Reply::Batch(results) => Ok(results),
            Reply::Single(_) => Err(ObsError::MalformedMessage(
                "single response to RequestBatch".to_string(),
            )),
        }
    }

    /// Change the event subscriptions of the live session.
    pub async fn reidentify(&self, subscriptions: EventSubscription) -> Result<(), ObsError> {
        let _control = self.shared.control.lock().await;
        let outbound = self.outbound()?;

        let (tx, rx) = oneshot::channel();
        *self.shared.reidentify_waiter() = Some(tx);

        outbound
            .send(Outbound::Frame(Message::Reidentify(Reidentify {
                event_subscriptions: Some(subscriptions.bits()),
            })))
            .await
            .map_err(|_| ObsError::ConnectionClosed)?;

        let timeout = self.shared.options.handshake_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(_)) => {
                self.shared.slot().subscriptions = subscriptions;
                info!(?subscriptions, "Reidentified with OBS WebSocket server");
                Ok(())
            }
            Ok(Err(_)) => Err(ObsError::ConnectionClosed),
            Err(_) => {
                self.shared.reidentify_waiter().take();
                Err(ObsError::RequestTimedOut {
                    request_type: "Reidentify".to_string(),
                    timeout,
                })
            }
        }
    }

    /// Call `handler` for every event of type `event_type`.
    pub fn on<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ObsEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(event_type, handler)
    }

    /// Call `handler` for every event.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ObsEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe_all(handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(id)
    }

    /// Stream of every event received from now on.
    pub fn events(&self) -> broadcast::Receiver<ObsEvent> {
        self.shared.dispatcher.stream()
    }

    /// Stream of connect/disconnect notifications.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.lifecycle.subscribe()
    }

    /// Number of event handler calls that failed or panicked.
    pub fn handler_failures(&self) -> u64 {
        self.shared.dispatcher.failure_count()
    }
}

/// Reader/writer task for one session. Ends when the socket closes or the
/// client asks it to, then tears the session down.
async fn run_session(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    mut handshake: Handshake,
) {
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            frame = ws_reader.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = handle_frame(&text, &shared, &mut handshake, &mut ws_sink).await {
                            handshake.fail(e.clone());
                            let _ = ws_sink.send(WsMessage::Close(None)).await;
                            break e.to_string();
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = close_reason(frame.as_ref());
                        let auth_failed = frame
                            .as_ref()
                            .is_some_and(|f| u16::from(f.code) == CLOSE_CODE_AUTHENTICATION_FAILED);
                        if auth_failed {
                            handshake.fail(ObsError::AuthenticationFailed(reason.clone()));
                        }
                        break reason;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        debug!("Ignoring binary frame");
                    }
                    Some(Ok(_)) => {} // Ping/Pong/Frame
                    Some(Err(e)) => {
                        warn!("WebSocket error: {e}");
                        break format!("WebSocket error: {e}");
                    }
                    None => break "connection closed by server".to_string(),
                }
            }
            msg = outbound.recv() => {
                match msg {
                    Some(Outbound::Frame(message)) => {
                        let text = match protocol::encode(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Dropping outbound message: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                            warn!("WebSocket send failed: {e}");
                            break format!("WebSocket send failed: {e}");
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        let _ = ws_sink.close().await;
                        break "closed by client".to_string();
                    }
                }
            }
        }
    };

    teardown(&shared, &mut handshake, &reason);
}

/// Decode and route one text frame. An error ends the session.
async fn handle_frame(
    text: &str,
    shared: &Shared,
    handshake: &mut Handshake,
    ws_sink: &mut WsSink,
) -> Result<(), ObsError> {
    let message = match protocol::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping frame: {e}");
            return Ok(());
        }
    };

    match message {
        Message::Hello(hello) => {
            let Some(identify) = handshake.on_hello(&hello)? else {
                debug!("Ignoring unexpected Hello");
                return Ok(());
            };
            debug!(
                obs_studio_version = %hello.obs_studio_version,
                obs_web_socket_version = %hello.obs_web_socket_version,
                rpc_version = hello.rpc_version,
                authenticated = identify.authentication.is_some(),
                "Received Hello, sending Identify"
            );
            let text = protocol::encode(&Message::Identify(identify))?;
            ws_sink
                .send(WsMessage::Text(text))
                .await
                .map_err(|e| ObsError::Connection(format!("failed to send Identify: {e}")))?;
        }
        Message::Identified(identified) => {
            if let Some(rpc_version) = handshake.on_identified(&identified) {
                // Ready for requests before connect() returns.
                shared.correlator.reopen();
                {
                    let mut slot = shared.slot();
                    slot.state = SessionState::Authenticated;
                    slot.rpc_version = Some(rpc_version);
                    slot.subscriptions = handshake.subscriptions();
                }
                handshake.complete(rpc_version);
                let _ = shared.lifecycle.send(LifecycleEvent::Connected { rpc_version });
            } else if let Some(waiter) = shared.reidentify_waiter().take() {
                let _ = waiter.send(identified.negotiated_rpc_version);
            } else {
                debug!("Ignoring unexpected Identified");
            }
        }
        Message::RequestResponse(response) => {
            if !handshake.is_identified() {
                debug!(request_id = %response.request_id, "Dropping response received before Identified");
                return Ok(());
            }
            let status = response.request_status;
            let outcome = if status.result {
                Ok(Reply::Single(response.response_data.unwrap_or_else(|| json!({}))))
            } else {
                Err(ObsError::Remote {
                    request_type: response.request_type,
                    code: status.code,
                    comment: status.comment,
                })
            };
            if !shared.correlator.complete(&response.request_id, outcome) {
                debug!(request_id = %response.request_id, "Dropping response with no pending request");
            }
        }
        Message::RequestBatchResponse(response) => {
            if !handshake.is_identified() {
                debug!(request_id = %response.request_id, "Dropping batch response received before Identified");
                return Ok(());
            }
            if !shared
                .correlator
                .complete(&response.request_id, Ok(Reply::Batch(response.results)))
            {
                debug!(request_id = %response.request_id, "Dropping batch response with no pending request");
            }
        }
        Message::Event(event) => {
            if !handshake.is_identified() {
                debug!(event_type = %event.event_type, "Dropping event received before Identified");
                return Ok(());
            }
            shared.dispatcher.dispatch(&ObsEvent::from(event));
        }
        Message::Unhandled { op, .. } => {
            debug!(op, "Unhandled message type");
        }
        other @ (Message::Identify(_)
        | Message::Reidentify(_)
        | Message::Request(_)
        | Message::RequestBatch(_)) => {
            debug!(op = other.op(), "Ignoring server-bound opcode received from server");
        }
    }
    Ok(())
}

fn close_reason(frame: Option<&CloseFrame<'_>>) -> String {
    match frame {
        Some(f) if f.reason.is_empty() => format!("closed by server (code {})", u16::from(f.code)),
        Some(f) => format!("closed by server (code {}): {}", u16::from(f.code), f.reason),
        None => "closed by server".to_string(),
    }
}

/// Fail everything tied to the session and return to `Idle`.
fn teardown(shared: &Shared, handshake: &mut Handshake, reason: &str) {
    handshake.fail(ObsError::Connection(reason.to_string()));
    let drained = shared.correlator.drain();
    shared.reidentify_waiter().take();

    let was_authenticated = {
        let mut slot = shared.slot();
        let was = slot.rpc_version.is_some();
        slot.state = SessionState::Idle;
        slot.rpc_version = None;
        slot.link = None;
        was
    };

    if drained > 0 {
        info!(count = drained, "Failed {drained} pending requests: {reason}");
    }
    if was_authenticated {
        info!("Disconnected from OBS WebSocket server: {reason}");
        let _ = shared.lifecycle.send(LifecycleEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}
