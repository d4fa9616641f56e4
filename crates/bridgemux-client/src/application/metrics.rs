//! Metrics over `metrics1` channels, fed into a [`SeriesSink`].
//!
//! # Sources and fallback (for beginners)
//!
//! A [`MetricsChannel`] is given an ordered list of [`MetricsSource`]s, for
//! example live sampling (`direct`) followed by a pre-aggregated source
//! (`internal`).  When a source's channel closes with `not-supported` or
//! `not-found` and more sources remain, the next one is tried without the
//! caller noticing.
//!
//! Live data ("follow") and historical data ("fetch") travel on separate
//! channels.  Historical fetches use each source's `archive_source`; a
//! successful archive transfer only flips [`MetricsChannel::archives`] and
//! never interrupts the live stream.
//!
//! The sink asks for data itself: a grid walking forward triggers `follow`,
//! a grid moved into the past triggers `fetch` for the missing range.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use bridgemux_core::metrics::{Decoded, MetricsDecoder, MetricsMeta};
use bridgemux_core::series::{now_ms, FetchCallback, Mapping, SeriesStorage};
use bridgemux_core::{Control, Payload, SeriesSink};

use crate::application::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions};
use crate::application::transport::Transport;

/// One place metrics can come from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSource {
    /// `direct`, `internal`, `pcp-archive`…
    pub source: String,
    /// Source used for historical fetches; sources without one are skipped
    /// by [`MetricsChannel::fetch`].
    pub archive_source: Option<String>,
    /// Names to file the metrics under instead of their own, by position.
    pub metrics_path_names: Option<Vec<String>>,
    pub host: Option<String>,
    /// Further open options (`metrics`, `instances`, `omit-instances`…).
    pub options: Map<String, Value>,
}

impl MetricsSource {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn archive(mut self, archive_source: impl Into<String>) -> Self {
        self.archive_source = Some(archive_source.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_owned(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricsEvent {
    /// A new meta message arrived.
    Meta(Arc<MetricsMeta>),
    /// An archive transfer finished; historical data is available.
    Archives,
}

#[derive(Default)]
struct State {
    following: bool,
    channels: Vec<Channel>,
    meta: Option<Arc<MetricsMeta>>,
    archives: bool,
}

struct Shared {
    transport: Arc<Transport>,
    interval: u64,
    sources: Vec<MetricsSource>,
    series: SeriesSink,
    state: Mutex<State>,
    events: broadcast::Sender<MetricsEvent>,
}

/// A metrics feed bound to one sampling interval.  Cheap to clone.
#[derive(Clone)]
pub struct MetricsChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MetricsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsChannel")
            .field("interval", &self.shared.interval)
            .field("sources", &self.shared.sources.len())
            .finish()
    }
}

impl MetricsChannel {
    /// Creates the feed and its sink.  With `cache` the sink's store is the
    /// one shared under that identifier in the storage.
    pub fn new(
        transport: &Arc<Transport>,
        interval: u64,
        sources: Vec<MetricsSource>,
        cache: Option<(&str, &SeriesStorage)>,
    ) -> Self {
        let limits = &transport.config().series;
        let series = match cache {
            Some((identifier, storage)) => {
                let sink = SeriesSink::shared(interval, identifier, storage);
                sink.set_limit(limits.shared_limit);
                sink
            }
            None => {
                let sink = SeriesSink::new(interval);
                sink.set_limit(limits.private_limit);
                sink
            }
        };
        let (events, _) = broadcast::channel(64);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let fetch: FetchCallback = Arc::new(move |beg: i64, end: i64, for_walking: bool| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if for_walking {
                    shared.follow();
                } else {
                    shared.fetch(beg, end);
                }
            });
            series.set_fetch(Some(fetch));
            Shared {
                transport: Arc::clone(transport),
                interval: interval.max(1),
                sources,
                series,
                state: Mutex::new(State::default()),
                events,
            }
        });
        Self { shared }
    }

    /// The sink grids attach to.
    pub fn series(&self) -> &SeriesSink {
        &self.shared.series
    }

    pub fn interval(&self) -> u64 {
        self.shared.interval
    }

    /// The most recent meta message.
    pub fn meta(&self) -> Option<Arc<MetricsMeta>> {
        self.shared.lock().meta.clone()
    }

    /// Whether an archive transfer has completed.
    pub fn archives(&self) -> bool {
        self.shared.lock().archives
    }

    pub fn events(&self) -> broadcast::Receiver<MetricsEvent> {
        self.shared.events.subscribe()
    }

    /// Starts the live stream, unless it is already running.
    pub fn follow(&self) {
        self.shared.follow();
    }

    /// Fetches timesteps `[beg, end)` from the archive sources.
    pub fn fetch(&self, beg: i64, end: i64) {
        self.shared.fetch(beg, end);
    }

    /// Closes every channel of this feed.
    pub fn close(&self, problem: Option<&str>) {
        let channels = std::mem::take(&mut self.shared.lock().channels);
        for channel in channels {
            channel.close(problem);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn follow(self: &Arc<Self>) {
        self.transfer(self.sources.clone(), false);
    }

    fn fetch(self: &Arc<Self>, beg: i64, end: i64) {
        let timestamp = beg * self.interval as i64 - now_ms();
        let limit = end - beg;
        let archives: Vec<MetricsSource> = self
            .sources
            .iter()
            .filter_map(|source| {
                let archive = source.archive_source.as_ref()?;
                let mut source = source.clone();
                source.source = archive.clone();
                source.options.insert("timestamp".to_owned(), timestamp.into());
                source.options.insert("limit".to_owned(), limit.into());
                Some(source)
            })
            .collect();
        self.transfer(archives, true);
    }

    /// Opens a channel for the first of `sources`; the rest are fallbacks.
    fn transfer(self: &Arc<Self>, sources: Vec<MetricsSource>, archive: bool) {
        let Some(first) = sources.first() else {
            return;
        };
        let mut state = self.lock();
        if !archive {
            if state.following {
                return;
            }
            state.following = true;
        }

        let mut open = ChannelOptions::new("metrics1")
            .merge(&first.options)
            .with("interval", self.interval)
            .with("source", first.source.as_str());
        open.host = first.host.clone();

        debug!(target: "bridgemux::metrics", "metrics transfer from {} (archive: {archive})", first.source);
        let (channel, events) = Channel::open(&self.transport, open);
        state.channels.retain(Channel::is_valid);
        state.channels.push(channel.clone());
        drop(state);

        tokio::spawn(pump(Arc::downgrade(self), channel, events, sources, archive));
    }

    /// Decodes one message into the sink.  Returns `false` for a message
    /// that is not valid metrics JSON.
    fn on_message(
        &self,
        decoder: &mut MetricsDecoder,
        mapping: &mut Option<Arc<Mapping>>,
        source: &MetricsSource,
        payload: Payload,
    ) -> bool {
        let text = payload.into_text_lossy();
        let decoded = match decoder.feed_text(&text, now_ms() as f64) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(target: "bridgemux::metrics", "invalid metrics message: {e}");
                return false;
            }
        };
        match decoded {
            Some(Decoded::Meta { beg }) => {
                let Some(meta) = decoder.meta() else {
                    return true;
                };
                debug!(target: "bridgemux::metrics", "metrics meta: {} metrics from timestep {beg}", meta.metrics.len());
                *mapping = Some(Arc::new(meta.mapping(source.metrics_path_names.as_deref())));
                let meta = Arc::new(meta.clone());
                self.lock().meta = Some(Arc::clone(&meta));
                let _ = self.events.send(MetricsEvent::Meta(meta));
            }
            Some(Decoded::Data { beg, rows }) => self.series.input(beg, rows, mapping.clone()),
            None => {}
        }
        true
    }

    fn on_close(self: &Arc<Self>, options: &Control, sources: Vec<MetricsSource>, archive: bool) {
        {
            let mut state = self.lock();
            if !archive {
                state.following = false;
            }
            state.channels.retain(Channel::is_valid);
        }

        let problem = options.problem();
        if sources.len() > 1 && matches!(problem, Some("not-supported" | "not-found")) {
            debug!(
                target: "bridgemux::metrics",
                "metrics source {} unavailable, trying {}",
                sources[0].source,
                sources[1].source
            );
            self.transfer(sources[1..].to_vec(), archive);
        } else if let Some(problem) = problem {
            let quiet = matches!(problem, "terminated" | "disconnected" | "authentication-failed")
                || (archive && matches!(problem, "not-found" | "not-supported"));
            if !quiet {
                warn!(target: "bridgemux::metrics", "metrics channel failed: {problem}");
            }
        } else if archive {
            let first = !std::mem::replace(&mut self.lock().archives, true);
            if first {
                let _ = self.events.send(MetricsEvent::Archives);
            }
        }
    }
}

async fn pump(
    weak: Weak<Shared>,
    channel: Channel,
    mut events: ChannelEvents,
    sources: Vec<MetricsSource>,
    archive: bool,
) {
    let interval = match weak.upgrade() {
        Some(shared) => shared.interval,
        None => return,
    };
    let mut decoder = MetricsDecoder::new(interval);
    let mut mapping = None;

    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Message(payload) => {
                if !shared.on_message(&mut decoder, &mut mapping, &sources[0], payload) {
                    channel.close(Some("protocol-error"));
                }
            }
            ChannelEvent::Close(options) => {
                shared.on_close(&options, sources, archive);
                return;
            }
            ChannelEvent::Ready(_) | ChannelEvent::Control(_) => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
