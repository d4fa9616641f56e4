//! A logical channel over a [`Transport`].
//!
//! # Life of a channel (for beginners)
//!
//! 1. [`Channel::open`] returns immediately with a handle and an event
//!    stream.  Anything sent before the transport is ready is queued.
//! 2. Once the transport is ready the channel takes an id, registers itself,
//!    sends `open` (with the negotiated binary mode) and flushes its queue in
//!    order.
//! 3. The bridge answers with `ready`, then data and controls flow both ways.
//!    Either side may send `done` to say "no more data from me".
//! 4. A `close` from either side (or the transport closing) ends the channel.
//!    [`ChannelEvent::Close`] is always the last event.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use bridgemux_core::protocol::PayloadEncoding;
use bridgemux_core::{Command, Control, Payload};

use crate::application::transport::{ChannelHandler, Transport};

/// What to ask the bridge for in `open`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOptions {
    /// The payload type (`stream`, `dbus-json3`, `fsread1`…).
    pub payload: String,
    /// Whether messages are raw bytes rather than text.
    pub binary: bool,
    /// Target host; defaults to the transport's host.
    pub host: Option<String>,
    /// Any further open options, copied verbatim.
    pub extra: Map<String, Value>,
}

impl ChannelOptions {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }

    /// Copies every entry of `options` into the extra open options.
    pub fn merge(mut self, options: &Map<String, Value>) -> Self {
        for (key, value) in options {
            self.extra.insert(key.clone(), value.clone());
        }
        self
    }
}

/// Something the bridge (or the transport) told this channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The bridge accepted the `open`.
    Ready(Control),
    /// Any other control for this channel (`done`, `options`…).
    Control(Control),
    /// A data payload, already decoded from base64 where negotiated.
    Message(Payload),
    /// The channel closed.  Always the last event.
    Close(Control),
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

#[derive(Debug, Clone, PartialEq)]
enum Waiting {
    Pending,
    Ready(Control),
    Closed(Control),
}

#[derive(Debug)]
enum Pending {
    Message(Payload),
    Control(Control),
}

#[derive(Debug)]
struct State {
    id: Option<String>,
    attached: bool,
    queue: Vec<Pending>,
    sent_done: bool,
    received_done: bool,
    closed: Option<Control>,
    encoding: PayloadEncoding,
}

pub(crate) struct ChannelShared {
    transport: Arc<Transport>,
    options: ChannelOptions,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    waiting: watch::Sender<Waiting>,
}

/// Handle to one logical channel.  Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Opens a channel.  The `open` is sent once the transport is ready.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(transport: &Arc<Transport>, options: ChannelOptions) -> (Channel, ChannelEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let (waiting, _) = watch::channel(Waiting::Pending);
        let shared = Arc::new(ChannelShared {
            transport: Arc::clone(transport),
            options,
            state: Mutex::new(State {
                id: None,
                attached: false,
                queue: Vec::new(),
                sent_done: false,
                received_done: false,
                closed: None,
                encoding: PayloadEncoding::Text,
            }),
            events,
            waiting,
        });

        let weak = Arc::downgrade(&shared);
        let transport = Arc::clone(transport);
        tokio::spawn(async move {
            let result = transport.ready().await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => shared.attach(),
                Err(options) => shared.on_close(options),
            }
        });

        (Channel { shared }, rx)
    }

    /// The channel id, once assigned.
    pub fn id(&self) -> Option<String> {
        self.shared.lock().id.clone()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.shared.options
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.shared.transport
    }

    /// `false` once the channel has closed.
    pub fn is_valid(&self) -> bool {
        self.shared.lock().closed.is_none()
    }

    /// Whether payloads travel as bytes (raw or base64) on this channel.
    pub fn binary(&self) -> bool {
        self.shared.options.binary
    }

    /// Sends a data payload.  Dropped with a warning after `close` or `done`.
    pub fn send(&self, payload: impl Into<Payload>) {
        let payload = payload.into();
        let mut state = self.shared.lock();
        if state.closed.is_some() {
            warn!(target: "bridgemux::channel", "sending message on closed channel {}", self);
            return;
        }
        if state.sent_done {
            warn!(target: "bridgemux::channel", "sending message after done on channel {}", self);
            return;
        }
        if !state.attached {
            state.queue.push(Pending::Message(payload));
            return;
        }
        let payload = state.encoding.encode(payload);
        if let Some(id) = &state.id {
            self.shared.transport.send_message(id, &payload);
        }
    }

    /// Sends a control command on this channel.
    pub fn control(&self, control: Control) {
        let mut control = control;
        let mut state = self.shared.lock();
        if state.closed.is_some() {
            warn!(target: "bridgemux::channel", "sending control on closed channel {}", self);
            return;
        }
        if control.is(&Command::Done) {
            state.sent_done = true;
        }
        if !state.attached {
            state.queue.push(Pending::Control(control));
            return;
        }
        control.channel = state.id.clone();
        self.shared.transport.send_control(control);
    }

    /// Shortcut for `control(done)`.
    pub fn done(&self) {
        self.control(Control::new(Command::Done));
    }

    /// Closes the channel, optionally with a problem code.
    pub fn close(&self, problem: Option<&str>) {
        self.close_with(Control::close(problem));
    }

    /// Closes the channel with full close options.
    pub fn close_with(&self, options: Control) {
        self.shared.close_with(options);
    }

    /// Waits for `ready`.
    ///
    /// # Errors
    ///
    /// Returns the close options if the channel closed before becoming ready.
    pub async fn wait(&self) -> Result<Control, Control> {
        let mut rx = self.shared.waiting.subscribe();
        let outcome = match rx.wait_for(|waiting| *waiting != Waiting::Pending).await {
            Ok(waiting) => match &*waiting {
                Waiting::Ready(options) => Ok(options.clone()),
                Waiting::Closed(options) => Err(options.clone()),
                Waiting::Pending => Err(Control::close(Some("internal-error"))),
            },
            Err(_) => Err(Control::close(Some("disconnected"))),
        };
        outcome
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelShared> {
        Arc::downgrade(&self.shared)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display may run while the state lock is held, so peek without blocking.
        let id = match self.shared.state.try_lock() {
            Ok(state) if state.closed.is_some() => "<invalid>".to_owned(),
            Ok(state) => state.id.clone().unwrap_or_else(|| "<pending>".to_owned()),
            Err(_) => "?".to_owned(),
        };
        let host = self.shared.options.host.as_deref().unwrap_or("localhost");
        write!(f, "[Channel {id} -> {host}]")
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("payload", &self.shared.options.payload)
            .field("state", &*self.shared.lock())
            .finish()
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

impl ChannelShared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Channel {
        Channel {
            shared: Arc::clone(self),
        }
    }

    /// Takes an id, sends `open` and flushes the queue.
    fn attach(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }

        let id = self.transport.next_channel_id();
        state.encoding = PayloadEncoding::negotiate(self.options.binary, self.transport.binary());

        let mut open = Control::new(Command::Open)
            .with_channel(id.clone())
            .with("payload", self.options.payload.as_str());
        open.merge(&self.options.extra);
        if let Some(mode) = state.encoding.open_option() {
            open.set("binary", mode);
        }
        if let Some(host) = self.options.host.clone().or_else(|| self.transport.host()) {
            open.set("host", host);
        }

        let handler: Weak<dyn ChannelHandler> = Arc::downgrade(self) as Weak<dyn ChannelHandler>;
        self.transport.register(&id, handler);
        state.id = Some(id.clone());
        state.attached = true;
        debug!(target: "bridgemux::channel", "open {id}: {}", self.options.payload);
        self.transport.send_control(open);

        for pending in std::mem::take(&mut state.queue) {
            match pending {
                Pending::Message(payload) => {
                    let payload = state.encoding.encode(payload);
                    self.transport.send_message(&id, &payload);
                }
                Pending::Control(mut control) => {
                    control.channel = Some(id.clone());
                    self.transport.send_control(control);
                }
            }
        }
    }

    fn close_with(&self, options: Control) {
        let mut options = options;
        options.command = Command::Close;
        options.channel = None;
        {
            let state = self.lock();
            if state.closed.is_some() {
                return;
            }
            if let (true, Some(id)) = (state.attached, &state.id) {
                self.transport.send_control(options.clone().with_channel(id.clone()));
            }
        }
        self.on_close(options);
    }

    /// Marks the channel closed and emits the final event.
    fn on_close(&self, options: Control) {
        let id = {
            let mut state = self.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(options.clone());
            state.queue.clear();
            state.id.clone()
        };
        if let Some(id) = &id {
            self.transport.unregister(id);
        }
        debug!(
            target: "bridgemux::channel",
            "channel {:?} closed: {}",
            id,
            options.problem().unwrap_or("no problem")
        );

        self.waiting.send_if_modified(|waiting| {
            if *waiting == Waiting::Pending {
                *waiting = Waiting::Closed(options.clone());
                true
            } else {
                false
            }
        });
        let _ = self.events.send(ChannelEvent::Close(options));
    }

    fn protocol_error(&self, reason: &str) {
        warn!(target: "bridgemux::channel", "protocol error: {reason}");
        self.close_with(Control::close(Some("protocol-error")));
    }
}

impl ChannelHandler for ChannelShared {
    fn on_control(&self, control: Control) {
        match control.command {
            Command::Close => self.on_close(control),
            Command::Ready => {
                self.waiting.send_if_modified(|waiting| {
                    if *waiting == Waiting::Pending {
                        *waiting = Waiting::Ready(control.clone());
                        true
                    } else {
                        false
                    }
                });
                let _ = self.events.send(ChannelEvent::Ready(control));
            }
            Command::Done => {
                let duplicate = std::mem::replace(&mut self.lock().received_done, true);
                if duplicate {
                    self.protocol_error("channel received second done");
                } else {
                    let _ = self.events.send(ChannelEvent::Control(control));
                }
            }
            _ => {
                let _ = self.events.send(ChannelEvent::Control(control));
            }
        }
    }

    fn on_message(&self, payload: Payload) {
        let encoding = {
            let state = self.lock();
            if state.closed.is_some() {
                return;
            }
            if state.received_done {
                None
            } else {
                Some(state.encoding)
            }
        };
        let Some(encoding) = encoding else {
            self.protocol_error("channel received message after done");
            return;
        };

        match encoding.decode(payload) {
            Ok(payload) => {
                let _ = self.events.send(ChannelEvent::Message(payload));
            }
            Err(e) => self.protocol_error(&e.to_string()),
        }
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.closed.is_some() || !state.attached {
            return;
        }
        if let Some(id) = state.id.take() {
            debug!(target: "bridgemux::channel", "channel {id} dropped while open");
            self.transport.send_control(Control::close(None).with_channel(id.clone()));
            self.transport.unregister(&id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
