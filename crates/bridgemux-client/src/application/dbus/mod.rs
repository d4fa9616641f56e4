//! D-Bus over the `dbus-json3` payload.

pub mod cache;
pub mod client;
pub mod proxy;

pub use cache::{CacheCallback, CacheSubscription, DBusCache};
pub use client::{CallOptions, CallReply, DBusClient, DBusEvent, DBusOptions, SignalCallback, Subscription, WatchHandle};
pub use proxy::{DBusProxies, DBusProxy, ProxiesEvent, ProxyEvent, ProxyOptions};

pub use bridgemux_core::protocol::dbus::{byte_array, variant, MatchRule, Signal};
