//! Property cache fed by `notify` messages.
//!
//! The cache maps `path → interface → properties`.  Every update merges
//! into what is already known and tells the interested callbacks about the
//! merged result; a removal tells them `None`.  Proxies are built on top of
//! these callbacks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map, Value};

use bridgemux_core::protocol::dbus::Props;

/// Called with the merged properties (or `None` when the interface went
/// away) and the object path.
pub type CacheCallback = Arc<dyn Fn(Option<&Props>, &str) + Send + Sync>;

struct Listener {
    id: u64,
    path: Option<String>,
    interface: Option<String>,
    callback: CacheCallback,
}

impl Listener {
    fn wants(&self, path: &str, interface: &str) -> bool {
        self.path.as_deref().map_or(true, |p| p == path)
            && self.interface.as_deref().map_or(true, |i| i == interface)
    }
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, BTreeMap<String, Props>>,
    meta: Map<String, Value>,
    listeners: Vec<Listener>,
    next_id: u64,
}

/// Shared per-client cache of remote object properties.
#[derive(Default)]
pub struct DBusCache {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for DBusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("DBusCache")
            .field("paths", &inner.data.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Handle returned by [`DBusCache::connect`].
#[derive(Debug)]
pub struct CacheSubscription {
    cache: Weak<DBusCache>,
    id: u64,
}

impl CacheSubscription {
    /// Stops the callback.  Safe to call more than once.
    pub fn remove(&self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.lock().listeners.retain(|listener| listener.id != self.id);
        }
    }
}

impl DBusCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `callback` for changes on `path`/`interface` (`None`
    /// matches anything).  With `first` the callback runs before the ones
    /// already registered.
    pub fn connect(
        self: &Arc<Self>,
        path: Option<&str>,
        interface: Option<&str>,
        callback: CacheCallback,
        first: bool,
    ) -> CacheSubscription {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let listener = Listener {
            id,
            path: path.map(str::to_owned),
            interface: interface.map(str::to_owned),
            callback,
        };
        if first {
            inner.listeners.insert(0, listener);
        } else {
            inner.listeners.push(listener);
        }
        CacheSubscription {
            cache: Arc::downgrade(self),
            id,
        }
    }

    /// Merges `props` into the cached interface and notifies.
    pub fn update(&self, path: &str, interface: &str, props: Props) {
        let (merged, callbacks) = {
            let mut inner = self.lock();
            let cached = inner
                .data
                .entry(path.to_owned())
                .or_default()
                .entry(interface.to_owned())
                .or_default();
            cached.extend(props);
            let merged = cached.clone();
            (merged, Self::interested(&inner, path, interface))
        };
        for callback in callbacks {
            callback(Some(&merged), path);
        }
    }

    /// Forgets an interface.  Listeners hear about it only if the path was
    /// known; a path left without interfaces is dropped.
    pub fn remove(&self, path: &str, interface: &str) {
        let callbacks = {
            let mut inner = self.lock();
            let Some(interfaces) = inner.data.get_mut(path) else {
                return;
            };
            interfaces.remove(interface);
            if interfaces.is_empty() {
                inner.data.remove(path);
            }
            Self::interested(&inner, path, interface)
        };
        for callback in callbacks {
            callback(None, path);
        }
    }

    pub fn lookup(&self, path: &str, interface: &str) -> Option<Props> {
        self.lock().data.get(path)?.get(interface).cloned()
    }

    /// Calls `f` for every cached object implementing `interface`.
    pub fn each(&self, interface: &str, mut f: impl FnMut(&Props, &str)) {
        let matching: Vec<(String, Props)> = {
            let inner = self.lock();
            inner
                .data
                .iter()
                .filter_map(|(path, interfaces)| interfaces.get(interface).map(|p| (path.clone(), p.clone())))
                .collect()
        };
        for (path, props) in &matching {
            f(props, path);
        }
    }

    /// Cached paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().data.keys().cloned().collect()
    }

    pub fn merge_meta(&self, data: &Map<String, Value>) {
        let mut inner = self.lock();
        for (interface, description) in data {
            inner.meta.insert(interface.clone(), description.clone());
        }
    }

    /// Interface description received through `meta`.
    pub fn meta(&self, interface: &str) -> Option<Value> {
        self.lock().meta.get(interface).cloned()
    }

    /// Drops all data and listeners.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.data.clear();
        inner.listeners.clear();
    }

    fn interested(inner: &Inner, path: &str, interface: &str) -> Vec<CacheCallback> {
        inner
            .listeners
            .iter()
            .filter(|listener| listener.wants(path, interface))
            .map(|listener| Arc::clone(&listener.callback))
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
