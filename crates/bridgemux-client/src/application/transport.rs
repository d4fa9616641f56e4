//! The transport: one physical socket, many logical channels.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!  Idle ──start()──▶ Connecting ──socket up──▶ Open (waiting for init)
//!                                                  │ server "init"
//!                                                  ▼
//!                                              Open (ready) ──close()──▶ Closed
//! ```
//!
//! 1. Nothing happens until the first channel asks for the transport (or
//!    [`Transport::start`] is called).  The socket is connected lazily.
//! 2. As soon as the socket is up the client sends
//!    `{"command":"init","version":1}`.
//! 3. The server answers with its own `init`, carrying the channel seed, the
//!    default host and the capabilities.  Only then are channels allowed to
//!    open; until that moment they queue their traffic.
//! 4. Every inbound frame is decoded, passed through the incoming filters and
//!    dispatched to the handler registered for its channel id.  Frames for
//!    unknown channels are ignored: a channel may have closed locally while
//!    the server was still sending.
//! 5. A close (requested, socket loss, protocol violation or failed health
//!    check) is broadcast once to every registered channel, then the registry
//!    is cleared.  A closed transport stays closed.
//!
//! # Locking
//!
//! The state mutex is never held while calling a channel handler or a frame
//! filter.  Channels may call into the transport while holding their own lock;
//! the transport never calls back into a channel while holding its lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use bridgemux_core::protocol::{ChannelIdGenerator, InitOptions, PROTOCOL_VERSION};
use bridgemux_core::{decode_frame, encode_frame, Command, Control, Payload, WireMessage};

use crate::application::connector::{Connector, SocketCommand, SocketEvent, SocketHandle};
use crate::application::dbus::client::DBusShared;
use crate::domain::config::TransportConfig;
use crate::domain::errors::TransportError;

/// Receiver of one channel's inbound traffic.
pub trait ChannelHandler: Send + Sync {
    fn on_control(&self, control: Control);
    fn on_message(&self, payload: Payload);
}

/// Observes `(raw message, channel id, control)` for every frame in one
/// direction.  Returning `false` swallows the frame.
pub type FrameFilter = Arc<dyn Fn(&WireMessage, &str, Option<&Control>) -> bool + Send + Sync>;

/// Readiness as seen by channels.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadyState {
    /// Not yet ready for channels.
    Connecting,
    /// `init` exchanged; channels may open.
    Open,
    /// Closed with these options.
    Closed(Control),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct State {
    phase: Phase,
    outbound: Option<mpsc::UnboundedSender<SocketCommand>>,
    registry: HashMap<String, Weak<dyn ChannelHandler>>,
    ids: ChannelIdGenerator,
    socket_binary: bool,
    binary: bool,
    waiting_for_init: bool,
    init: Option<Control>,
    host: Option<String>,
    got_message: bool,
    ignore_health_check: bool,
    incoming_filters: Vec<FrameFilter>,
    outgoing_filters: Vec<FrameFilter>,
    tasks: Vec<JoinHandle<()>>,
}

/// A multiplexed connection to a bridge.
///
/// Always handled as `Arc<Transport>`; every channel and client holds one.
pub struct Transport {
    config: TransportConfig,
    connector: Box<dyn Connector>,
    state: Mutex<State>,
    ready_tx: watch::Sender<ReadyState>,
    /// Shared well-known bus clients, see `DBusClient::shared`.
    pub(crate) shared_dbus: Mutex<HashMap<String, Weak<DBusShared>>>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Transport")
            .field("endpoint", &self.connector.describe())
            .field("phase", &state.phase)
            .field("channels", &state.registry.len())
            .finish()
    }
}

impl Transport {
    /// Creates a transport that will connect through `connector` on first use.
    pub fn new(config: TransportConfig, connector: impl Connector + 'static) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(ReadyState::Connecting);
        let host = config.default_host.clone();
        Arc::new(Self {
            config,
            connector: Box::new(connector),
            state: Mutex::new(State {
                phase: Phase::Idle,
                outbound: None,
                registry: HashMap::new(),
                ids: ChannelIdGenerator::new(),
                socket_binary: false,
                binary: false,
                waiting_for_init: true,
                init: None,
                host,
                got_message: false,
                ignore_health_check: false,
                incoming_filters: Vec::new(),
                outgoing_filters: Vec::new(),
                tasks: Vec::new(),
            }),
            ready_tx,
            shared_dbus: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    // ── Connection ────────────────────────────────────────────────────────────

    /// Starts connecting if nothing has happened yet.  Must be called inside
    /// a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.phase != Phase::Idle {
            return;
        }
        state.phase = Phase::Connecting;
        debug!(target: "bridgemux::transport", "connecting to {}", self.connector.describe());
        let task = tokio::spawn(run(Arc::downgrade(self)));
        state.tasks.push(task);
    }

    /// Waits until channels may open.  Starts the connection if needed.
    ///
    /// # Errors
    ///
    /// Returns the close options if the transport closed before (or instead
    /// of) becoming ready.
    pub async fn ready(self: &Arc<Self>) -> Result<(), Control> {
        self.start();
        let mut rx = self.ready_tx.subscribe();
        let outcome = match rx.wait_for(|state| *state != ReadyState::Connecting).await {
            Ok(state) => match &*state {
                ReadyState::Closed(options) => Err(options.clone()),
                _ => Ok(()),
            },
            Err(_) => Err(Control::close(Some("disconnected"))),
        };
        outcome
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_tx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().phase == Phase::Closed
    }

    /// Stores the socket after a successful connect and sends `init`.
    /// Returns the inbound queue, or `None` if the transport closed meanwhile.
    fn attach(self: &Arc<Self>, handle: SocketHandle) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        let mut state = self.lock();
        if state.phase == Phase::Closed {
            let _ = handle.outbound.send(SocketCommand::Close);
            return None;
        }

        state.phase = Phase::Open;
        state.socket_binary = handle.binary;
        state.waiting_for_init = true;
        // Straight to the socket: the handshake bypasses the frame filters.
        let _ = handle
            .outbound
            .send(SocketCommand::Send(Control::init().to_wire()));
        state.outbound = Some(handle.outbound);

        if let Some(period) = self.config.health_check_interval() {
            let task = tokio::spawn(check_health(Arc::downgrade(self), period));
            state.tasks.push(task);
        }
        info!(target: "bridgemux::transport", "connected to {}", self.connector.describe());
        Some(handle.inbound)
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Decodes and routes one inbound wire message.  Returns `false` if the
    /// message was malformed or vetoed by a filter.
    fn dispatch(self: &Arc<Self>, message: WireMessage) -> bool {
        let filters = {
            let mut state = self.lock();
            state.got_message = true;
            state.incoming_filters.clone()
        };
        let raw = (!filters.is_empty()).then(|| message.clone());

        let frame = match decode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "bridgemux::transport", "dropping malformed frame: {e}");
                return false;
            }
        };

        let control = if frame.is_control() {
            match Control::parse(&frame.payload) {
                Ok(control) => {
                    debug!(target: "bridgemux::transport", "recv control: {:?}", control);
                    Some(control)
                }
                Err(e) => {
                    warn!(target: "bridgemux::transport", "invalid control message: {e}");
                    self.close(Some(Control::close(Some("protocol-error"))));
                    return false;
                }
            }
        } else {
            debug!(target: "bridgemux::transport", "recv {}: {} bytes", frame.channel, frame.payload.len());
            None
        };

        if let Some(raw) = &raw {
            if !filters.iter().all(|filter| filter(raw, &frame.channel, control.as_ref())) {
                return false;
            }
        }

        match control {
            Some(control) => self.process_control(control),
            None => self.process_message(&frame.channel, frame.payload),
        }
        true
    }

    fn process_control(self: &Arc<Self>, control: Control) {
        if control.is(&Command::Init) {
            self.process_init(control);
            return;
        }

        let was_waiting = std::mem::replace(&mut self.lock().waiting_for_init, false);
        if was_waiting {
            if !control.is(&Command::Close) || control.channel.is_some() {
                error!(target: "bridgemux::transport", "received message before init: {}", control.command);
                self.close(Some(Control::close(Some("protocol-error"))));
            } else {
                self.close(Some(control));
            }
            return;
        }

        match control.command {
            Command::Ping => {}
            Command::Hint => {
                debug!(target: "bridgemux::transport", "hint: {:?}", control.get_str("hint"));
            }
            _ => {
                let Some(channel) = control.channel.as_deref() else {
                    return;
                };
                if let Some(handler) = self.handler(channel) {
                    handler.on_control(control);
                }
            }
        }
    }

    fn process_init(self: &Arc<Self>, control: Control) {
        let init = InitOptions::from_control(&control);

        if let Some(problem) = &init.problem {
            self.close(Some(Control::close(Some(problem))));
            return;
        }

        if init.version != Some(PROTOCOL_VERSION) {
            error!(
                target: "bridgemux::transport",
                "received unsupported version in init message: {:?}", init.version
            );
            self.close(Some(Control::close(Some("not-supported"))));
            return;
        }

        let was_waiting = {
            let mut state = self.lock();
            if state.phase == Phase::Closed {
                return;
            }
            if init.has_capability("binary") {
                state.binary = state.socket_binary;
            }
            if let Some(seed) = init.channel_seed {
                state.ids.set_seed(seed);
            }
            if let Some(host) = init.host {
                state.host = Some(host);
            }
            state.init = Some(control);
            std::mem::replace(&mut state.waiting_for_init, false)
        };

        if was_waiting {
            info!(target: "bridgemux::transport", "transport ready");
            self.ready_tx.send_if_modified(|state| {
                if *state == ReadyState::Connecting {
                    *state = ReadyState::Open;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn process_message(&self, channel: &str, payload: Payload) {
        if let Some(handler) = self.handler(channel) {
            handler.on_message(payload);
        }
    }

    fn handler(&self, channel: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.lock().registry.get(channel).and_then(Weak::upgrade)
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Sends a raw wire message through the outgoing filters.  Returns
    /// `false` if the transport is not open or a filter vetoed it.
    pub fn send_data(&self, message: WireMessage, channel: &str, control: Option<&Control>) -> bool {
        let (outbound, filters) = {
            let state = self.lock();
            match &state.outbound {
                Some(outbound) => (outbound.clone(), state.outgoing_filters.clone()),
                None => {
                    warn!(target: "bridgemux::transport", "transport closed, dropped message for channel {channel:?}");
                    return false;
                }
            }
        };

        if !filters.iter().all(|filter| filter(&message, channel, control)) {
            return false;
        }
        outbound.send(SocketCommand::Send(message)).is_ok()
    }

    /// Frames and sends a payload on `channel`.
    pub fn send_message(&self, channel: &str, payload: &Payload) -> bool {
        match encode_frame(channel, payload) {
            Ok(wire) => {
                debug!(target: "bridgemux::transport", "send {}: {} bytes", channel, payload.len());
                self.send_data(wire, channel, None)
            }
            Err(e) => {
                warn!(target: "bridgemux::transport", "cannot frame message for {channel:?}: {e}");
                false
            }
        }
    }

    /// Sends a control command.
    ///
    /// `close` and `kill` on a transport that is not open are dropped
    /// without complaint.  The `ignore_transport_health_check` hint is
    /// handled locally and never sent.
    pub fn send_control(&self, control: Control) -> bool {
        {
            let mut state = self.lock();
            if state.outbound.is_none() && (control.is(&Command::Close) || control.is(&Command::Kill)) {
                return false;
            }
            if control.is(&Command::Hint) && control.get_str("hint") == Some("ignore_transport_health_check") {
                state.ignore_health_check = control.get("data").and_then(Value::as_bool).unwrap_or(false);
                return true;
            }
        }
        debug!(target: "bridgemux::transport", "send control: {:?}", control);
        self.send_data(control.to_wire(), "", Some(&control))
    }

    // ── Close ─────────────────────────────────────────────────────────────────

    /// Closes the transport and every channel on it.
    ///
    /// `None` means `{"problem": "disconnected"}`.  Calling it again is a
    /// no-op.
    pub fn close(&self, options: Option<Control>) {
        let mut options = options.unwrap_or_else(|| Control::close(Some("disconnected")));
        options.command = Command::Close;

        let (handlers, tasks) = {
            let mut state = self.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.waiting_for_init = false;
            if let Some(outbound) = state.outbound.take() {
                let _ = outbound.send(SocketCommand::Close);
            }
            (std::mem::take(&mut state.registry), std::mem::take(&mut state.tasks))
        };

        for task in tasks {
            task.abort();
        }

        info!(
            target: "bridgemux::transport",
            "transport closed: {}",
            options.problem().unwrap_or("no problem")
        );
        self.ready_tx.send_replace(ReadyState::Closed(options.clone()));

        for handler in handlers.values().filter_map(Weak::upgrade) {
            handler.on_control(options.clone());
        }
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    pub fn next_channel_id(&self) -> String {
        self.lock().ids.next_id()
    }

    pub fn register(&self, channel: &str, handler: Weak<dyn ChannelHandler>) {
        self.lock().registry.insert(channel.to_owned(), handler);
    }

    /// Removes a channel.  Unknown ids are ignored.
    pub fn unregister(&self, channel: &str) {
        self.lock().registry.remove(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.lock().registry.len()
    }

    // ── Negotiated options ────────────────────────────────────────────────────

    /// Whether binary frames are in use (server capability and socket support).
    pub fn binary(&self) -> bool {
        self.lock().binary
    }

    /// Host for channels that do not name one.
    pub fn host(&self) -> Option<String> {
        self.lock().host.clone()
    }

    /// The server's `init` options, once received.
    pub fn options(&self) -> Option<Control> {
        self.lock().init.clone()
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.lock()
            .init
            .as_ref()
            .and_then(|init| init.get_str("csrf-token"))
            .map(str::to_owned)
    }

    // ── Extras ────────────────────────────────────────────────────────────────

    /// Installs a frame filter for inbound (`outgoing == false`) or outbound
    /// frames.
    pub fn add_filter(&self, filter: FrameFilter, outgoing: bool) {
        let mut state = self.lock();
        if outgoing {
            state.outgoing_filters.push(filter);
        } else {
            state.incoming_filters.push(filter);
        }
    }

    /// Pushes a raw wire message into the transport, either out to the
    /// bridge or in as if the bridge had sent it.
    pub fn inject(self: &Arc<Self>, message: WireMessage, outbound: bool) -> bool {
        if outbound {
            let channel = match &message {
                WireMessage::Text(text) => text.split('\n').next().unwrap_or_default().to_owned(),
                WireMessage::Binary(bytes) => bytes
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|pos| String::from_utf8_lossy(&bytes[..pos]).into_owned())
                    .unwrap_or_default(),
            };
            self.send_data(message, &channel, None)
        } else {
            self.dispatch(message)
        }
    }

    /// Asks the bridge to terminate channels, optionally limited to a host
    /// and/or a channel group.
    pub async fn kill(self: &Arc<Self>, host: Option<&str>, group: Option<&str>) {
        if self.ready().await.is_err() {
            return;
        }
        let mut control = Control::new(Command::Kill);
        if let Some(host) = host {
            control.set("host", host);
        }
        if let Some(group) = group {
            control.set("group", group);
        }
        self.send_control(control);
    }

    /// Sends a `hint` command named `name` with extra `options`.
    pub async fn hint(self: &Arc<Self>, name: &str, options: &Map<String, Value>) {
        if self.ready().await.is_err() {
            return;
        }
        let mut control = Control::new(Command::Hint).with("hint", name);
        control.merge(options);
        self.send_control(control);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(outbound) = state.outbound.take() {
            let _ = outbound.send(SocketCommand::Close);
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

/// Connects, then pumps socket events into the transport until the socket
/// closes.
async fn run(weak: Weak<Transport>) {
    let Some(transport) = weak.upgrade() else {
        return;
    };

    let mut inbound = match transport.connector.connect().await {
        Ok(handle) => match transport.attach(handle) {
            Some(inbound) => inbound,
            None => return,
        },
        Err(e) => {
            warn!(target: "bridgemux::transport", "{e}");
            let problem = match e {
                TransportError::InvalidUrl { .. } => "no-cockpit",
                _ => "disconnected",
            };
            transport.close(Some(Control::close(Some(problem))));
            return;
        }
    };
    drop(transport);

    while let Some(event) = inbound.recv().await {
        let Some(transport) = weak.upgrade() else {
            return;
        };
        match event {
            SocketEvent::Message(message) => {
                transport.dispatch(message);
            }
            SocketEvent::Activity => transport.lock().got_message = true,
            SocketEvent::Closed => break,
        }
    }

    if let Some(transport) = weak.upgrade() {
        debug!(target: "bridgemux::transport", "socket closed");
        transport.close(None);
    }
}

/// Closes the transport with `timeout` when a whole period passes without
/// any inbound traffic.
async fn check_health(weak: Weak<Transport>, period: Duration) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(transport) = weak.upgrade() else {
            return;
        };

        let failed = {
            let mut state = transport.lock();
            if state.phase == Phase::Closed {
                return;
            }
            let quiet = !state.got_message;
            state.got_message = false;
            if quiet && state.ignore_health_check {
                info!(target: "bridgemux::transport", "health check failure ignored");
            }
            quiet && !state.ignore_health_check
        };

        if failed {
            warn!(target: "bridgemux::transport", "health check failed");
            transport.close(Some(Control::close(Some("timeout"))));
            return;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::parent::{ParentConnector, ParentPeer};

    #[derive(Default)]
    struct Recorder {
        controls: Mutex<Vec<Control>>,
        messages: Mutex<Vec<Payload>>,
    }

    impl ChannelHandler for Recorder {
        fn on_control(&self, control: Control) {
            self.controls.lock().unwrap().push(control);
        }
        fn on_message(&self, payload: Payload) {
            self.messages.lock().unwrap().push(payload);
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            health_check_interval_secs: 0,
            ..TransportConfig::default()
        }
    }

    /// Starts a transport and consumes the client's `init`.
    async fn connected(config: TransportConfig) -> (Arc<Transport>, ParentPeer) {
        let (connector, mut peer) = ParentConnector::pair();
        let transport = Transport::new(config, connector);
        transport.start();
        let init = peer.recv().await.expect("init frame");
        assert_eq!(init, Control::init().to_wire());
        (transport, peer)
    }

    async fn ready(config: TransportConfig, init: &str) -> (Arc<Transport>, ParentPeer) {
        let (transport, peer) = connected(config).await;
        peer.send_text(format!("\n{init}"));
        transport.ready().await.expect("transport ready");
        (transport, peer)
    }

    fn closed_problem(transport: &Transport) -> Option<String> {
        match transport.ready_state() {
            ReadyState::Closed(options) => options.problem().map(str::to_owned),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_init_reply_makes_transport_ready() {
        // Arrange / Act
        let (transport, _peer) = ready(
            config(),
            r#"{"command":"init","version":1,"channel-seed":"x:","host":"db1","capabilities":["binary"],"csrf-token":"tok"}"#,
        )
        .await;

        // Assert
        assert_eq!(transport.ready_state(), ReadyState::Open);
        assert_eq!(transport.next_channel_id(), "x:1");
        assert_eq!(transport.next_channel_id(), "x:2");
        assert_eq!(transport.host().as_deref(), Some("db1"));
        assert_eq!(transport.csrf_token().as_deref(), Some("tok"));
        assert!(transport.binary());
    }

    #[tokio::test]
    async fn test_binary_needs_both_capability_and_socket_support() {
        let (connector, mut peer) = ParentConnector::pair_with_binary(false);
        let transport = Transport::new(config(), connector);
        transport.start();
        peer.recv().await.unwrap();
        peer.send_text("\n{\"command\":\"init\",\"version\":1,\"capabilities\":[\"binary\"]}");
        transport.ready().await.unwrap();

        assert!(!transport.binary());
    }

    #[tokio::test]
    async fn test_wrong_version_closes_not_supported() {
        // Arrange
        let (transport, peer) = connected(config()).await;

        // Act
        peer.send_text("\n{\"command\":\"init\",\"version\":2}");
        let result = transport.ready().await;

        // Assert
        assert_eq!(result.unwrap_err().problem(), Some("not-supported"));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_problem_in_init_closes_with_that_problem() {
        let (transport, peer) = connected(config()).await;
        peer.send_text("\n{\"command\":\"init\",\"problem\":\"access-denied\"}");
        let result = transport.ready().await;
        assert_eq!(result.unwrap_err().problem(), Some("access-denied"));
    }

    #[tokio::test]
    async fn test_message_before_init_is_protocol_error() {
        let (transport, peer) = connected(config()).await;
        peer.send_text("\n{\"command\":\"open\",\"channel\":\"1\"}");
        let result = transport.ready().await;
        assert_eq!(result.unwrap_err().problem(), Some("protocol-error"));
    }

    #[tokio::test]
    async fn test_close_before_init_keeps_server_problem() {
        let (transport, peer) = connected(config()).await;
        peer.send_text("\n{\"command\":\"close\",\"problem\":\"no-session\"}");
        let result = transport.ready().await;
        assert_eq!(result.unwrap_err().problem(), Some("no-session"));
    }

    #[tokio::test]
    async fn test_frames_route_to_registered_handler() {
        // Arrange
        let (transport, peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ChannelHandler> = Arc::downgrade(&recorder) as Weak<dyn ChannelHandler>;
        transport.register("4", weak);

        // Act
        peer.send_text("4\nhello");
        peer.send_text("5\nnobody listens");
        peer.send_text("\n{\"command\":\"ready\",\"channel\":\"4\"}");
        peer.send_text("\n{\"command\":\"ping\"}");
        transport.ready().await.unwrap();
        tokio::task::yield_now().await;
        // Frames are pumped by a background task; wait until both arrived.
        for _ in 0..100 {
            if recorder.controls.lock().unwrap().len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        // Assert
        assert_eq!(*recorder.messages.lock().unwrap(), vec![Payload::Text("hello".into())]);
        assert_eq!(recorder.controls.lock().unwrap()[0].command, Command::Ready);
    }

    #[tokio::test]
    async fn test_close_broadcasts_once_and_clears_registry() {
        // Arrange
        let (transport, _peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        let recorder = Arc::new(Recorder::default());
        transport.register("1", Arc::downgrade(&recorder) as Weak<dyn ChannelHandler>);

        // Act
        transport.close(Some(Control::close(Some("terminated"))));
        transport.close(None);

        // Assert
        let controls = recorder.controls.lock().unwrap();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].problem(), Some("terminated"));
        assert_eq!(transport.channel_count(), 0);
        assert_eq!(closed_problem(&transport).as_deref(), Some("terminated"));
    }

    #[tokio::test]
    async fn test_sends_are_dropped_after_close() {
        let (transport, mut peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        transport.close(None);

        assert!(!transport.send_message("1", &Payload::Text("x".into())));
        assert!(!transport.send_control(Control::close(None).with_channel("1")));
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_outgoing_filter_can_veto() {
        // Arrange
        let (transport, mut peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        let filter: FrameFilter =
            Arc::new(|_: &WireMessage, channel: &str, _: Option<&Control>| channel != "secret");
        transport.add_filter(filter, true);

        // Act
        let vetoed = transport.send_message("secret", &Payload::Text("x".into()));
        let passed = transport.send_message("open", &Payload::Text("y".into()));

        // Assert
        assert!(!vetoed);
        assert!(passed);
        assert_eq!(peer.recv().await, Some(WireMessage::Text("open\ny".into())));
    }

    #[tokio::test]
    async fn test_incoming_filter_sees_control_and_can_veto() {
        let (transport, _peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let filter: FrameFilter = Arc::new(move |_: &WireMessage, _: &str, control: Option<&Control>| {
            if let Some(control) = control {
                record.lock().unwrap().push(control.command.clone());
            }
            false
        });
        transport.add_filter(filter, false);

        let accepted = transport.inject(WireMessage::Text("\n{\"command\":\"ping\"}".into()), false);

        assert!(!accepted);
        assert_eq!(*seen.lock().unwrap(), vec![Command::Ping]);
    }

    #[tokio::test]
    async fn test_inject_outbound_reaches_socket() {
        let (transport, mut peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        assert!(transport.inject(WireMessage::Text("9\nraw".into()), true));
        assert_eq!(peer.recv().await, Some(WireMessage::Text("9\nraw".into())));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_without_closing() {
        let (transport, _peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        assert!(!transport.inject(WireMessage::Text("no newline".into()), false));
        assert!(!transport.inject(WireMessage::Binary(b"\nbinary control".to_vec()), false));
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_control_json_is_protocol_error() {
        let (transport, _peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        transport.inject(WireMessage::Text("\n{not json".into()), false);
        assert_eq!(closed_problem(&transport).as_deref(), Some("protocol-error"));
    }

    #[tokio::test]
    async fn test_socket_loss_closes_disconnected() {
        let (transport, peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        peer.close();
        for _ in 0..100 {
            if transport.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(closed_problem(&transport).as_deref(), Some("disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_closes_silent_transport() {
        // Arrange
        let cfg = TransportConfig {
            health_check_interval_secs: 30,
            ..TransportConfig::default()
        };
        let (transport, _peer) = ready(cfg, r#"{"command":"init","version":1}"#).await;

        // Act: the init reply counts for the first period, nothing for the second
        time::sleep(Duration::from_secs(61)).await;

        // Assert
        assert_eq!(closed_problem(&transport).as_deref(), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_health_check_hint_is_local() {
        // Arrange
        let cfg = TransportConfig {
            health_check_interval_secs: 30,
            ..TransportConfig::default()
        };
        let (transport, mut peer) = ready(cfg, r#"{"command":"init","version":1}"#).await;

        // Act
        let hint = Control::new(Command::Hint)
            .with("hint", "ignore_transport_health_check")
            .with("data", true);
        assert!(transport.send_control(hint));
        time::sleep(Duration::from_secs(95)).await;

        // Assert
        assert!(!transport.is_closed());
        assert!(peer.try_recv_command().is_none());
    }

    #[tokio::test]
    async fn test_kill_sends_control_with_host_and_group() {
        let (transport, mut peer) = ready(config(), r#"{"command":"init","version":1}"#).await;
        transport.kill(Some("db1"), Some("cockpit1:storage")).await;

        let WireMessage::Text(text) = peer.recv().await.unwrap() else {
            panic!("control frames are text");
        };
        let control = Control::parse(&Payload::Text(text[1..].to_owned())).unwrap();
        assert_eq!(control.command, Command::Kill);
        assert_eq!(control.get_str("host"), Some("db1"));
        assert_eq!(control.get_str("group"), Some("cockpit1:storage"));
    }
}
