//! The `dbus-json3` client: method calls, signal subscriptions, property
//! watches and the notify-fed cache.
//!
//! Every outstanding request (call or watch) is keyed by a cookie string
//! taken from one counter per client.  Replies and errors carry the cookie
//! back, so concurrent calls never cross.  When the channel closes, every
//! outstanding request fails with the close problem.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use bridgemux_core::protocol::dbus::{
    add_match_message, call_message, meta_message, remove_match_message, signal_message,
    unwatch_message, watch_message, DBusMessage, MatchRule, Signal,
};
use bridgemux_core::{Control, Payload, Problem};

use crate::application::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions};
use crate::application::dbus::cache::DBusCache;
use crate::application::dbus::proxy::{DBusProxies, DBusProxy, ProxyOptions};
use crate::application::transport::Transport;
use crate::domain::errors::DBusError;

/// Buses that are shared per transport when opened without a name.
const SHARED_BUSES: [&str; 3] = ["system", "session", "internal"];

/// How to reach the bus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DBusOptions {
    /// `system` (the bridge default), `session`, `user`, `internal`…
    pub bus: Option<String>,
    pub host: Option<String>,
    pub superuser: Option<String>,
    /// Close the client when the bus name changes owner.
    pub track: bool,
    pub extra: Map<String, Value>,
}

impl DBusOptions {
    pub fn bus(bus: impl Into<String>) -> Self {
        Self {
            bus: Some(bus.into()),
            ..Self::default()
        }
    }

    fn only_bus(&self) -> Option<&str> {
        let plain = self.host.is_none() && self.superuser.is_none() && !self.track && self.extra.is_empty();
        self.bus.as_deref().filter(|bus| plain && SHARED_BUSES.contains(bus))
    }
}

/// Extra options of a method call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Signature of the arguments, when they cannot be introspected.
    pub type_signature: Option<String>,
    /// `i` to allow interactive authorization.
    pub flags: Option<String>,
    /// Timeout in milliseconds, enforced by the bridge.
    pub timeout: Option<u64>,
}

impl CallOptions {
    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(signature) = &self.type_signature {
            map.insert("type".to_owned(), Value::from(signature.as_str()));
        }
        if let Some(flags) = &self.flags {
            map.insert("flags".to_owned(), Value::from(flags.as_str()));
        }
        if let Some(timeout) = self.timeout {
            map.insert("timeout".to_owned(), Value::from(timeout));
        }
        map
    }
}

/// A method reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReply {
    pub values: Vec<Value>,
    pub type_signature: Option<String>,
    pub flags: Option<String>,
}

/// Client-wide happenings.
#[derive(Debug, Clone, PartialEq)]
pub enum DBusEvent {
    /// Property changes, after the cache applied them.
    Notify(Map<String, Value>),
    /// Interface descriptions, after the cache stored them.
    Meta(Map<String, Value>),
    /// The unique name now owning the bus name, or `None` if it vanished.
    Owner(Option<String>),
    Close(Control),
}

pub type SignalCallback = Arc<dyn Fn(&Signal) + Send + Sync>;

enum Pending {
    Call(oneshot::Sender<Result<CallReply, DBusError>>),
    Watch(oneshot::Sender<Result<(), DBusError>>),
}

impl Pending {
    fn fail(self, error: DBusError) {
        match self {
            Pending::Call(tx) => {
                let _ = tx.send(Err(error));
            }
            Pending::Watch(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct Subscriber {
    rule: MatchRule,
    callback: SignalCallback,
}

struct State {
    last_cookie: u64,
    calls: HashMap<String, Pending>,
    subscribers: HashMap<String, Subscriber>,
    closed: Option<DBusError>,
    unique_name: Option<String>,
    owner: Option<String>,
}

impl State {
    fn cookie(&mut self) -> String {
        let id = self.last_cookie.to_string();
        self.last_cookie += 1;
        id
    }
}

pub(crate) struct DBusShared {
    name: Option<String>,
    track: bool,
    shared_bus: Option<String>,
    channel: Channel,
    transport: Weak<Transport>,
    state: Mutex<State>,
    cache: Arc<DBusCache>,
    events: broadcast::Sender<DBusEvent>,
}

/// Handle to a D-Bus client.  Cheap to clone.
#[derive(Clone)]
pub struct DBusClient {
    shared: Arc<DBusShared>,
}

impl std::fmt::Debug for DBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBusClient")
            .field("name", &self.shared.name)
            .field("channel", &self.shared.channel.to_string())
            .finish()
    }
}

impl DBusClient {
    /// Opens a client for bus name `name`.
    ///
    /// Without a name, and with options that only pick one of the well-known
    /// buses, the transport's shared client for that bus is returned.
    pub fn open(transport: &Arc<Transport>, name: Option<&str>, options: DBusOptions) -> Self {
        if name.is_none() {
            if let Some(bus) = options.only_bus() {
                return Self::shared(transport, bus);
            }
        }
        Self::create(transport, name, options, None)
    }

    /// The transport-wide client for a well-known bus.
    pub fn shared(transport: &Arc<Transport>, bus: &str) -> Self {
        let mut slots = transport
            .shared_dbus
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.get(bus).and_then(Weak::upgrade) {
            if existing.channel.is_valid() {
                return Self { shared: existing };
            }
        }
        let client = Self::create(transport, None, DBusOptions::bus(bus), Some(bus.to_owned()));
        slots.insert(bus.to_owned(), Arc::downgrade(&client.shared));
        client
    }

    fn create(transport: &Arc<Transport>, name: Option<&str>, options: DBusOptions, shared_bus: Option<String>) -> Self {
        let mut open = ChannelOptions::new("dbus-json3").merge(&options.extra);
        open.host = options.host;
        if let Some(name) = name {
            open = open.with("name", name);
        }
        if let Some(bus) = options.bus {
            open = open.with("bus", bus);
        }
        if let Some(superuser) = options.superuser {
            open = open.with("superuser", superuser);
        }
        debug!(target: "bridgemux::dbus", "dbus open: {:?}", open.extra);

        let (channel, events) = Channel::open(transport, open);
        let (event_tx, _) = broadcast::channel(64);
        let shared = Arc::new(DBusShared {
            name: name.map(str::to_owned),
            track: options.track,
            shared_bus,
            channel,
            transport: Arc::downgrade(transport),
            state: Mutex::new(State {
                last_cookie: 1,
                calls: HashMap::new(),
                subscribers: HashMap::new(),
                closed: None,
                unique_name: None,
                owner: None,
            }),
            cache: DBusCache::new(),
            events: event_tx,
        });
        tokio::spawn(pump(Arc::downgrade(&shared), events));
        Self { shared }
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// The client's unique bus name, known once the channel is ready.
    pub fn unique_name(&self) -> Option<String> {
        self.shared.lock().unique_name.clone()
    }

    pub fn cache(&self) -> &Arc<DBusCache> {
        &self.shared.cache
    }

    pub fn channel(&self) -> &Channel {
        &self.shared.channel
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DBusEvent> {
        self.shared.events.subscribe()
    }

    /// Waits until the bridge has opened the bus.
    ///
    /// # Errors
    ///
    /// Returns the close problem if the channel could not be opened.
    pub async fn wait(&self) -> Result<(), DBusError> {
        self.shared
            .channel
            .wait()
            .await
            .map(|_| ())
            .map_err(|options| close_error(&options))
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    /// Calls `method` and returns its out arguments.
    ///
    /// # Errors
    ///
    /// [`DBusError::Remote`] for a D-Bus error reply, [`DBusError::Problem`]
    /// if the channel is or becomes closed.
    pub async fn call(&self, path: &str, interface: &str, method: &str, args: Vec<Value>) -> Result<Vec<Value>, DBusError> {
        self.call_with(path, interface, method, args, &CallOptions::default())
            .await
            .map(|reply| reply.values)
    }

    /// Like [`DBusClient::call`], with call options, returning the full reply.
    pub async fn call_with(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
        options: &CallOptions,
    ) -> Result<CallReply, DBusError> {
        let rx = {
            let mut state = self.shared.lock();
            self.shared.ensure_open(&state)?;
            let id = state.cookie();
            let message = call_message(path, interface, method, &args, &id, &options.to_map());
            let (tx, rx) = oneshot::channel();
            state.calls.insert(id, Pending::Call(tx));
            self.shared.send(message);
            rx
        };
        rx.await.unwrap_or_else(|_| Err(DBusError::problem(Problem::Disconnected)))
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    /// Delivers signals matching `rule` to `callback`, and asks the bridge
    /// to forward them.
    pub fn subscribe(&self, rule: MatchRule, callback: impl Fn(&Signal) + Send + Sync + 'static) -> Subscription {
        let callback: SignalCallback = Arc::new(callback);
        self.subscribe_with(rule, Some(callback), true)
    }

    /// Full form of [`DBusClient::subscribe`].  Without a callback only the
    /// match rule is installed; with `send_rule == false` only the local
    /// callback is.
    pub fn subscribe_with(&self, rule: MatchRule, callback: Option<SignalCallback>, send_rule: bool) -> Subscription {
        if send_rule {
            self.shared.send(add_match_message(&rule));
        }
        let id = callback.map(|callback| {
            let mut state = self.shared.lock();
            let id = state.cookie();
            state.subscribers.insert(
                id.clone(),
                Subscriber {
                    rule: rule.clone(),
                    callback,
                },
            );
            id
        });
        Subscription {
            client: Arc::downgrade(&self.shared),
            id,
            rule,
            send_rule,
        }
    }

    /// Emits a signal from a published object.
    pub fn signal(&self, signal: &Signal, options: &Map<String, Value>) {
        if self.shared.channel.is_valid() {
            self.shared.send(signal_message(signal, options));
        }
    }

    // ── Properties ────────────────────────────────────────────────────────────

    /// Starts watching properties of objects matching `rule`.  The handle
    /// resolves once the bridge has sent the initial values.
    pub fn watch(&self, rule: MatchRule) -> WatchHandle {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.shared.lock();
            let id = state.cookie();
            match self.shared.ensure_open(&state) {
                Ok(()) => {
                    state.calls.insert(id.clone(), Pending::Watch(tx));
                    self.shared.send(watch_message(&rule, &id));
                }
                Err(error) => {
                    let _ = tx.send(Err(error));
                }
            }
            id
        };
        let result: BoxFuture<'static, Result<(), DBusError>> = async move {
            rx.await
                .unwrap_or_else(|_| Err(DBusError::problem(Problem::Disconnected)))
        }
        .boxed();
        WatchHandle {
            client: Arc::downgrade(&self.shared),
            id,
            rule,
            result: result.shared(),
        }
    }

    /// Shortcut for watching every interface on one object path.
    pub fn watch_path(&self, path: &str) -> WatchHandle {
        self.watch(MatchRule::path(path))
    }

    /// Applies a `notify` payload to the cache as if the bridge had sent it.
    pub fn notify(&self, data: &Map<String, Value>) {
        self.shared.notify(data.clone());
    }

    /// Publishes interface descriptions to the bridge and records them
    /// locally.
    pub fn meta(&self, data: &Map<String, Value>, options: &Map<String, Value>) {
        self.shared.cache.merge_meta(data);
        self.shared.send(meta_message(data, options));
    }

    /// A live view of one object's interface.
    ///
    /// `interface` defaults to the client's bus name; `path` defaults to the
    /// interface with dots turned into slashes.
    pub fn proxy(&self, interface: Option<&str>, path: Option<&str>, options: ProxyOptions) -> DBusProxy {
        let interface = interface.or(self.name()).unwrap_or_default().to_owned();
        let path = path
            .map(str::to_owned)
            .unwrap_or_else(|| format!("/{}", interface.replace('.', "/")));
        DBusProxy::new(self.clone(), interface, path, options)
    }

    /// Proxies for every object under `path_namespace` implementing
    /// `interface`.
    pub fn proxies(&self, interface: Option<&str>, path_namespace: Option<&str>, options: ProxyOptions) -> DBusProxies {
        let interface = interface.or(self.name()).unwrap_or_default().to_owned();
        let namespace = path_namespace.unwrap_or("/").to_owned();
        DBusProxies::new(self.clone(), interface, namespace, options)
    }

    // ── Close ─────────────────────────────────────────────────────────────────

    /// Closes the client.  A shared bus client ignores a close without a
    /// problem, since other users still rely on it.
    pub fn close(&self, problem: Option<&str>) {
        if self.shared.shared_bus.is_some() && problem.is_none() {
            return;
        }
        self.shared.channel.close(problem);
    }
}

impl DBusShared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self, state: &State) -> Result<(), DBusError> {
        if let Some(error) = &state.closed {
            return Err(error.clone());
        }
        if !self.channel.is_valid() {
            return Err(DBusError::problem(Problem::Disconnected));
        }
        Ok(())
    }

    fn send(&self, message: String) {
        debug!(target: "bridgemux::dbus", "dbus: {message}");
        self.channel.send(Payload::Text(message));
    }

    fn on_message(self: &Arc<Self>, payload: Payload) {
        let text = payload.into_text_lossy();
        debug!(target: "bridgemux::dbus", "dbus: {text}");
        let message = match DBusMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "bridgemux::dbus", "received invalid dbus json message: {e}");
                self.channel.close(Some("protocol-error"));
                return;
            }
        };

        match message {
            DBusMessage::Reply {
                id,
                values,
                type_signature,
                flags,
            } => match self.lock().calls.remove(&id) {
                Some(Pending::Call(tx)) => {
                    let _ = tx.send(Ok(CallReply {
                        values,
                        type_signature,
                        flags,
                    }));
                }
                Some(Pending::Watch(tx)) => {
                    let _ = tx.send(Ok(()));
                }
                None => {}
            },
            DBusMessage::Error { id, name, message } => {
                if let Some(pending) = self.lock().calls.remove(&id) {
                    pending.fail(DBusError::Remote { name, message });
                }
            }
            DBusMessage::Signal(signal) => {
                let callbacks: Vec<SignalCallback> = self
                    .lock()
                    .subscribers
                    .values()
                    .filter(|subscriber| subscriber.rule.matches(&signal))
                    .map(|subscriber| Arc::clone(&subscriber.callback))
                    .collect();
                for callback in callbacks {
                    callback(&signal);
                }
            }
            DBusMessage::Notify(data) => self.notify(data),
            DBusMessage::Meta(data) => {
                self.cache.merge_meta(&data);
                let _ = self.events.send(DBusEvent::Meta(data));
            }
            DBusMessage::Owner(owner) => {
                let _ = self.events.send(DBusEvent::Owner(owner.clone()));
                // An owner is only reported once, so a second report means a
                // different process now owns the name.
                let previous = std::mem::replace(&mut self.lock().owner, owner);
                if self.track && previous.is_some() {
                    debug!(target: "bridgemux::dbus", "bus name owner changed, closing");
                    self.channel.close(None);
                }
            }
            DBusMessage::Call { .. } | DBusMessage::Unknown(_) => {
                debug!(target: "bridgemux::dbus", "received unexpected dbus json message: {text}");
            }
        }
    }

    fn notify(&self, data: Map<String, Value>) {
        for (path, interfaces) in &data {
            let Some(interfaces) = interfaces.as_object() else {
                continue;
            };
            for (interface, props) in interfaces {
                match props.as_object() {
                    Some(props) => self.cache.update(path, interface, props.clone()),
                    None => self.cache.remove(path, interface),
                }
            }
        }
        let _ = self.events.send(DBusEvent::Notify(data));
    }

    fn on_close(&self, options: Control) {
        debug!(target: "bridgemux::dbus", "dbus close: {}", options.to_value());
        let error = close_error(&options);
        let outstanding = {
            let mut state = self.lock();
            state.closed = Some(error.clone());
            std::mem::take(&mut state.calls)
        };
        for (_, pending) in outstanding {
            pending.fail(error.clone());
        }

        if let (Some(bus), Some(transport)) = (&self.shared_bus, self.transport.upgrade()) {
            let mut slots = transport
                .shared_dbus
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let ours = slots
                .get(bus)
                .is_some_and(|slot| std::ptr::eq(slot.as_ptr(), self as *const DBusShared));
            if ours {
                slots.remove(bus);
            }
        }
        let _ = self.events.send(DBusEvent::Close(options));
    }
}

/// The error requests fail with once the channel closed this way.
fn close_error(options: &Control) -> DBusError {
    let problem = Problem::from_code(options.problem().unwrap_or("disconnected"));
    match options.message() {
        Some(message) => DBusError::Problem {
            problem,
            message: message.to_owned(),
        },
        None => DBusError::problem(problem),
    }
}

async fn pump(weak: Weak<DBusShared>, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Ready(options) => {
                debug!(target: "bridgemux::dbus", "dbus ready: {}", options.to_value());
                shared.lock().unique_name = options.get_str("unique-name").map(str::to_owned);
            }
            ChannelEvent::Message(payload) => shared.on_message(payload),
            ChannelEvent::Close(options) => {
                shared.on_close(options);
                return;
            }
            ChannelEvent::Control(_) => {}
        }
    }
}

// ── Handles ───────────────────────────────────────────────────────────────────

/// A signal subscription.  Call [`Subscription::remove`] to end it.
#[derive(Debug)]
pub struct Subscription {
    client: Weak<DBusShared>,
    id: Option<String>,
    rule: MatchRule,
    send_rule: bool,
}

impl Subscription {
    /// Stops local delivery and removes the bridge-side match rule.
    pub fn remove(&self) {
        let Some(shared) = self.client.upgrade() else {
            return;
        };
        let removed = match &self.id {
            Some(id) => shared.lock().subscribers.remove(id).is_some(),
            None => true,
        };
        if self.send_rule && removed {
            shared.send(remove_match_message(&self.rule));
        }
    }
}

/// A property watch.
#[derive(Clone)]
pub struct WatchHandle {
    client: Weak<DBusShared>,
    id: String,
    rule: MatchRule,
    result: Shared<BoxFuture<'static, Result<(), DBusError>>>,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("rule", &self.rule)
            .finish()
    }
}

impl WatchHandle {
    /// Resolves once the initial property values have arrived.
    ///
    /// # Errors
    ///
    /// Fails if the watch was rejected, removed, or the client closed.
    pub async fn wait(&self) -> Result<(), DBusError> {
        self.result.clone().await
    }

    /// Stops the watch.  A still-pending wait fails with `cancelled`.
    pub fn remove(&self) {
        let Some(shared) = self.client.upgrade() else {
            return;
        };
        let pending = shared.lock().calls.remove(&self.id);
        if let Some(pending) = pending {
            pending.fail(DBusError::problem(Problem::Cancelled));
        }
        shared.send(unwatch_message(&self.rule));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
