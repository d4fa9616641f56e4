//! Live views of remote objects.
//!
//! A [`DBusProxy`] mirrors one interface on one object path: its
//! properties follow the client's cache, its signals are re-emitted, and
//! its methods are plain calls.  [`DBusProxies`] keeps one proxy per object
//! under a path namespace, adding and removing them as the cache sees
//! objects appear and vanish.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use bridgemux_core::protocol::dbus::{variant, MatchRule, Props, Signal};
use bridgemux_core::Problem;

use crate::application::dbus::cache::CacheSubscription;
use crate::application::dbus::client::{DBusClient, SignalCallback, Subscription, WatchHandle};
use crate::domain::errors::DBusError;

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// How a proxy hooks itself up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Send a `watch` for the object's properties.
    pub watch: bool,
    /// Send an `add-match` for the object's signals.
    pub subscribe: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            watch: true,
            subscribe: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    /// Merged properties after an update, or `None` once the interface is gone.
    Changed(Option<Props>),
    Signal { member: String, args: Vec<Value> },
}

#[derive(Default)]
struct ProxyData {
    props: Props,
    valid: bool,
}

struct ProxyInner {
    client: DBusClient,
    interface: String,
    path: String,
    data: Mutex<ProxyData>,
    events: broadcast::Sender<ProxyEvent>,
    watch: Option<WatchHandle>,
    cache_link: CacheSubscription,
    signal_link: Subscription,
}

impl ProxyInner {
    fn lock(&self) -> MutexGuard<'_, ProxyData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, props: Option<&Props>) {
        {
            let mut data = self.lock();
            match props {
                Some(props) => {
                    data.props.extend(props.iter().map(|(k, v)| (k.clone(), v.clone())));
                    data.valid = true;
                }
                None => data.valid = false,
            }
        }
        let _ = self.events.send(ProxyEvent::Changed(props.cloned()));
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        self.cache_link.remove();
        self.signal_link.remove();
    }
}

/// One interface on one remote object.  Cheap to clone.
#[derive(Clone)]
pub struct DBusProxy {
    inner: Arc<ProxyInner>,
}

impl std::fmt::Debug for DBusProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBusProxy")
            .field("path", &self.inner.path)
            .field("interface", &self.inner.interface)
            .field("valid", &self.valid())
            .finish()
    }
}

impl DBusProxy {
    pub(crate) fn new(client: DBusClient, interface: String, path: String, options: ProxyOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        let rule = MatchRule::path(path.clone()).with_interface(interface.clone());
        let watch = options.watch.then(|| client.watch(rule.clone()));

        let inner = Arc::new_cyclic(|weak: &Weak<ProxyInner>| {
            let on_cache = weak.clone();
            let cache_link = client.cache().connect(
                Some(path.as_str()),
                Some(interface.as_str()),
                Arc::new(move |props: Option<&Props>, _path: &str| {
                    if let Some(inner) = on_cache.upgrade() {
                        inner.apply(props);
                    }
                }),
                true,
            );

            let on_signal = weak.clone();
            let on_signal: SignalCallback = Arc::new(move |signal: &Signal| {
                if let Some(inner) = on_signal.upgrade() {
                    let _ = inner.events.send(ProxyEvent::Signal {
                        member: signal.member.clone(),
                        args: signal.args.clone(),
                    });
                }
            });
            let signal_link = client.subscribe_with(rule, Some(on_signal), options.subscribe);

            ProxyInner {
                client,
                interface,
                path,
                data: Mutex::new(ProxyData::default()),
                events,
                watch,
                cache_link,
                signal_link,
            }
        });

        let cached = inner.client.cache().lookup(&inner.path, &inner.interface);
        inner.apply(cached.as_ref());
        Self { inner }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn interface(&self) -> &str {
        &self.inner.interface
    }

    pub fn client(&self) -> &DBusClient {
        &self.inner.client
    }

    /// `true` while the object is known to implement the interface.
    pub fn valid(&self) -> bool {
        self.inner.lock().valid
    }

    /// Last known value of property `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.lock().props.get(name).cloned()
    }

    /// Snapshot of all known properties.
    pub fn data(&self) -> Props {
        self.inner.lock().props.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.events.subscribe()
    }

    /// Waits for the initial properties.
    ///
    /// # Errors
    ///
    /// Fails with the watch error, or `not-found` if the object did not turn
    /// up.
    pub async fn wait(&self) -> Result<(), DBusError> {
        let watched = match &self.inner.watch {
            Some(watch) => watch.wait().await,
            None => Ok(()),
        };
        if self.valid() {
            return Ok(());
        }
        Err(watched.err().unwrap_or_else(|| DBusError::problem(Problem::NotFound)))
    }

    /// Calls `method` on this object and interface.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, DBusError> {
        self.inner
            .client
            .call(&self.inner.path, &self.inner.interface, method, args)
            .await
    }

    /// Writes property `name` through `org.freedesktop.DBus.Properties.Set`.
    ///
    /// # Errors
    ///
    /// Fails without a call if the interface description does not mark the
    /// property writable.
    pub async fn set(&self, name: &str, value: Value) -> Result<(), DBusError> {
        let property = self
            .inner
            .client
            .cache()
            .meta(&self.inner.interface)
            .and_then(|meta| meta.get("properties")?.get(name).cloned());
        let writable = property
            .as_ref()
            .and_then(|p| p.get("flags")?.as_str())
            .is_some_and(|flags| flags.contains('w'));
        let signature = property.as_ref().and_then(|p| p.get("type")?.as_str().map(str::to_owned));

        let (true, Some(signature)) = (writable, signature) else {
            return Err(DBusError::Problem {
                problem: Problem::NotSupported,
                message: format!("{name} is not writable"),
            });
        };
        let args = vec![
            Value::from(self.inner.interface.as_str()),
            Value::from(name),
            variant(&signature, value),
        ];
        self.inner
            .client
            .call(&self.inner.path, PROPERTIES_INTERFACE, "Set", args)
            .await
            .map(|_| ())
    }
}

// ── Proxies ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ProxiesEvent {
    Added(DBusProxy),
    Changed(DBusProxy),
    Removed(DBusProxy),
}

struct ProxiesInner {
    client: DBusClient,
    interface: String,
    path_namespace: String,
    proxies: Mutex<BTreeMap<String, DBusProxy>>,
    events: broadcast::Sender<ProxiesEvent>,
    watch: Option<WatchHandle>,
    cache_link: CacheSubscription,
    match_link: Subscription,
}

impl ProxiesInner {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DBusProxy>> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_namespace(&self, path: &str) -> bool {
        let ns = self.path_namespace.as_str();
        ns == "/" || path == ns || path.strip_prefix(ns).is_some_and(|rest| rest.starts_with('/'))
    }

    fn update(&self, props: Option<&Props>, path: &str) {
        if !self.in_namespace(path) {
            return;
        }
        if props.is_none() {
            let removed = self.lock().remove(path);
            if let Some(proxy) = removed {
                debug!(target: "bridgemux::dbus", "proxy removed: {path}");
                let _ = self.events.send(ProxiesEvent::Removed(proxy));
            }
            return;
        }

        let existing = self.lock().get(path).cloned();
        let proxy = match existing {
            Some(proxy) => proxy,
            None => {
                let children = ProxyOptions {
                    watch: false,
                    subscribe: false,
                };
                let proxy = self
                    .client
                    .proxy(Some(self.interface.as_str()), Some(path), children);
                self.lock().insert(path.to_owned(), proxy.clone());
                let _ = self.events.send(ProxiesEvent::Added(proxy.clone()));
                proxy
            }
        };
        let _ = self.events.send(ProxiesEvent::Changed(proxy));
    }
}

impl Drop for ProxiesInner {
    fn drop(&mut self) {
        self.cache_link.remove();
        self.match_link.remove();
    }
}

/// Every object under a path namespace implementing one interface.
#[derive(Clone)]
pub struct DBusProxies {
    inner: Arc<ProxiesInner>,
}

impl std::fmt::Debug for DBusProxies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBusProxies")
            .field("interface", &self.inner.interface)
            .field("path_namespace", &self.inner.path_namespace)
            .field("count", &self.inner.lock().len())
            .finish()
    }
}

impl DBusProxies {
    pub(crate) fn new(client: DBusClient, interface: String, path_namespace: String, options: ProxyOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        let rule = MatchRule::default()
            .with_interface(interface.clone())
            .with_path_namespace(path_namespace.clone());
        // One match rule and one watch for all proxies; the children skip theirs.
        let match_link = client.subscribe_with(rule.clone(), None, true);
        let watch = options.watch.then(|| client.watch(rule));

        let inner = Arc::new_cyclic(|weak: &Weak<ProxiesInner>| {
            let on_cache = weak.clone();
            let cache_link = client.cache().connect(
                None,
                Some(interface.as_str()),
                Arc::new(move |props: Option<&Props>, path: &str| {
                    if let Some(inner) = on_cache.upgrade() {
                        inner.update(props, path);
                    }
                }),
                false,
            );
            ProxiesInner {
                client,
                interface,
                path_namespace,
                proxies: Mutex::new(BTreeMap::new()),
                events,
                watch,
                cache_link,
                match_link,
            }
        });

        inner
            .client
            .cache()
            .each(&inner.interface, |props, path| inner.update(Some(props), path));
        Self { inner }
    }

    pub fn interface(&self) -> &str {
        &self.inner.interface
    }

    pub fn path_namespace(&self) -> &str {
        &self.inner.path_namespace
    }

    pub fn get(&self, path: &str) -> Option<DBusProxy> {
        self.inner.lock().get(path).cloned()
    }

    /// Paths of the current proxies, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> broadcast::Receiver<ProxiesEvent> {
        self.inner.events.subscribe()
    }

    /// Waits for the initial property values of the namespace.
    pub async fn wait(&self) -> Result<(), DBusError> {
        match &self.inner.watch {
            Some(watch) => watch.wait().await,
            None => Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
