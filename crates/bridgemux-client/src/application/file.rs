//! File access over `fsread1`, `fsreplace1` and `fswatch1`.
//!
//! # Tags (for beginners)
//!
//! Every read hands back the content together with an opaque *tag* naming
//! the version that was read.  Passing the tag to [`FileClient::replace`]
//! makes the write conditional: if the file changed in the meantime the
//! bridge refuses with `change-conflict`.  The tag `-` means "the file does
//! not exist", which is different from an empty file.
//!
//! [`FileClient::modify`] wraps the read, change, replace cycle and starts
//! over on conflicts.  [`FileClient::watch`] keeps a watch channel open and
//! re-reads the file whenever the bridge reports a tag other than the last
//! one seen.
//!
//! Both the read retry on conflict and the modify cycle are bounded by
//! `file.conflict_retries` in the transport configuration.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use bridgemux_core::{Control, Payload};

use crate::application::buffer::ChannelBuffer;
use crate::application::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions};
use crate::application::transport::Transport;
use crate::domain::errors::{ChannelError, FileError};

/// Tag reported for a file that does not exist.
pub const ABSENT_TAG: &str = "-";

// ── Syntax ────────────────────────────────────────────────────────────────────

/// How file content is turned into a value and back.
pub trait Syntax: Send + Sync + 'static {
    type Content: Clone + Send + Sync + 'static;

    /// Whether the file travels as raw bytes.
    fn binary(&self) -> bool {
        false
    }

    fn parse(&self, data: Payload) -> Result<Self::Content, FileError>;

    fn stringify(&self, content: &Self::Content) -> Result<Payload, FileError>;
}

/// Plain UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Text;

impl Syntax for Text {
    type Content = String;

    fn parse(&self, data: Payload) -> Result<String, FileError> {
        Ok(data.into_text_lossy())
    }

    fn stringify(&self, content: &String) -> Result<Payload, FileError> {
        Ok(Payload::Text(content.clone()))
    }
}

/// Uninterpreted bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Syntax for Raw {
    type Content = Vec<u8>;

    fn binary(&self) -> bool {
        true
    }

    fn parse(&self, data: Payload) -> Result<Vec<u8>, FileError> {
        Ok(data.into_bytes())
    }

    fn stringify(&self, content: &Vec<u8>) -> Result<Payload, FileError> {
        Ok(Payload::Binary(content.clone()))
    }
}

/// A JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Syntax for Json {
    type Content = Value;

    fn parse(&self, data: Payload) -> Result<Value, FileError> {
        serde_json::from_slice(data.as_bytes()).map_err(|e| FileError::Parse(e.to_string()))
    }

    fn stringify(&self, content: &Value) -> Result<Payload, FileError> {
        let mut text = serde_json::to_string_pretty(content).map_err(|e| FileError::Stringify(e.to_string()))?;
        text.push('\n');
        Ok(Payload::Text(text))
    }
}

// ── Options and results ───────────────────────────────────────────────────────

/// Extra open options shared by every channel of one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileOptions {
    pub host: Option<String>,
    pub superuser: Option<String>,
    /// Refuse reads of files larger than this (`too-large`).
    pub max_read_size: Option<u64>,
    pub extra: Map<String, Value>,
}

/// Content plus the tag of the version it came from.  `content` is `None`
/// for a file that does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContent<T> {
    pub content: Option<T>,
    pub tag: Option<String>,
}

/// Receives `(content, tag, error)` after every read or replace.
pub type WatchCallback<T> = Arc<dyn Fn(Option<&T>, Option<&str>, Option<&FileError>) + Send + Sync>;

type ReadResult<T> = Result<FileContent<T>, FileError>;
type ReadFuture<T> = Shared<BoxFuture<'static, ReadResult<T>>>;

/// A change notification on the watch channel.
#[derive(Debug, Deserialize)]
struct WatchNotice {
    path: Option<String>,
    tag: Option<String>,
    event: Option<String>,
}

struct State<T> {
    reading: Option<ReadFuture<T>>,
    read_channel: Option<Channel>,
    replace_channel: Option<(u64, Channel)>,
    replace_serial: u64,
    watch_channel: Option<Channel>,
    watch_tag: Option<String>,
    watchers: Vec<(u64, WatchCallback<T>)>,
    next_watcher: u64,
}

struct Inner<S: Syntax> {
    transport: Arc<Transport>,
    path: String,
    syntax: S,
    options: FileOptions,
    batch_size: usize,
    retries: u32,
    state: Mutex<State<S::Content>>,
}

// ── FileClient ────────────────────────────────────────────────────────────────

/// Handle to one file on the bridge's host.  Cheap to clone.
pub struct FileClient<S: Syntax = Text> {
    inner: Arc<Inner<S>>,
}

impl<S: Syntax> Clone for FileClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Syntax> std::fmt::Debug for FileClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileClient")
            .field("path", &self.inner.path)
            .field("binary", &self.inner.syntax.binary())
            .finish()
    }
}

impl FileClient<Text> {
    /// A text file with default options.
    pub fn text(transport: &Arc<Transport>, path: impl Into<String>) -> Self {
        Self::new(transport, path, Text, FileOptions::default())
    }
}

impl<S: Syntax> FileClient<S> {
    pub fn new(transport: &Arc<Transport>, path: impl Into<String>, syntax: S, options: FileOptions) -> Self {
        let file = &transport.config().file;
        Self {
            inner: Arc::new(Inner {
                transport: Arc::clone(transport),
                path: path.into(),
                syntax,
                options,
                batch_size: file.batch_size.max(1),
                retries: file.conflict_retries,
                state: Mutex::new(State {
                    reading: None,
                    read_channel: None,
                    replace_channel: None,
                    replace_serial: 0,
                    watch_channel: None,
                    watch_tag: None,
                    watchers: Vec::new(),
                    next_watcher: 0,
                }),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Reads and parses the whole file.  Concurrent calls share one read.
    ///
    /// # Errors
    ///
    /// Fails with the channel's problem (`change-conflict` only once the
    /// retries are used up) or a parse error.
    pub async fn read(&self) -> Result<FileContent<S::Content>, FileError> {
        self.inner.start_read().await
    }

    /// Writes `content`, or deletes the file for `None`.  With
    /// `expected_tag` the write only happens if the file is still at that
    /// version.  A replace still in flight on this handle is aborted.
    ///
    /// Returns the tag of the new version.
    ///
    /// # Errors
    ///
    /// `change-conflict` if the tag is stale, otherwise the channel's
    /// problem or a stringify error.
    pub async fn replace(
        &self,
        content: Option<&S::Content>,
        expected_tag: Option<&str>,
    ) -> Result<Option<String>, FileError> {
        let inner = &self.inner;
        let data = content.map(|c| inner.syntax.stringify(c)).transpose()?;

        let previous = inner.lock().replace_channel.take();
        if let Some((_, previous)) = previous {
            previous.close(Some("abort"));
        }

        let mut options = inner.channel_options("fsreplace1");
        if let Some(tag) = expected_tag {
            options = options.with("tag", tag);
        }
        let (channel, mut events) = Channel::open(&inner.transport, options);
        let serial = {
            let mut state = inner.lock();
            state.replace_serial += 1;
            let serial = state.replace_serial;
            state.replace_channel = Some((serial, channel.clone()));
            serial
        };

        if let Some(data) = data {
            for batch in batches(data, inner.batch_size) {
                channel.send(batch);
            }
        }
        channel.done();

        let close = closed(&mut events).await;
        {
            let mut state = inner.lock();
            if state.replace_channel.as_ref().is_some_and(|(s, _)| *s == serial) {
                state.replace_channel = None;
            }
        }
        if let Some(error) = ChannelError::from_close(&close) {
            return Err(error.into());
        }

        let tag = close.get_str("tag").map(str::to_owned);
        inner.fire_watchers(content, tag.as_deref(), None);
        Ok(tag)
    }

    /// Read, change, replace.  `change` gets the current content and returns
    /// the new one (`None` deletes the file).  On `change-conflict` the file
    /// is read again and `change` re-applied.
    ///
    /// Pass `initial` to skip the first read.
    ///
    /// # Errors
    ///
    /// Any read or replace failure other than a conflict, or the conflict
    /// itself once the retries are used up.
    pub async fn modify<F>(
        &self,
        mut change: F,
        initial: Option<FileContent<S::Content>>,
    ) -> Result<FileContent<S::Content>, FileError>
    where
        F: FnMut(Option<S::Content>) -> Option<S::Content>,
    {
        let mut current = match initial {
            Some(initial) => initial,
            None => self.read().await?,
        };
        let mut conflicts = 0;
        loop {
            let FileContent { content, tag } = current;
            let content = change(content);
            match self.replace(content.as_ref(), tag.as_deref()).await {
                Ok(tag) => return Ok(FileContent { content, tag }),
                Err(error) if error.is_conflict() && conflicts < self.inner.retries => {
                    conflicts += 1;
                    debug!(target: "bridgemux::file", "{}: conflict during modify, re-reading", self.inner.path);
                    current = self.read().await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Calls `callback` with the content after every read or replace on
    /// this handle, and keeps the file watched while any callback is
    /// registered.  A fresh read starts right away.
    pub fn watch(
        &self,
        callback: impl Fn(Option<&S::Content>, Option<&str>, Option<&FileError>) + Send + Sync + 'static,
    ) -> FileWatch<S> {
        let inner = &self.inner;
        let id = {
            let mut state = inner.lock();
            state.next_watcher += 1;
            let id = state.next_watcher;
            state.watchers.push((id, Arc::new(callback)));
            state.watch_tag = None;
            if state.watch_channel.is_none() {
                let (channel, events) = Channel::open(&inner.transport, inner.channel_options("fswatch1"));
                state.watch_channel = Some(channel);
                tokio::spawn(watch_pump(Arc::downgrade(inner), events));
            }
            id
        };
        drop(inner.start_read());

        FileWatch {
            inner: Arc::downgrade(inner),
            id,
        }
    }

    /// Cancels every channel this handle has open.
    pub fn close(&self) {
        let channels = {
            let mut state = self.inner.lock();
            [
                state.read_channel.take(),
                state.replace_channel.take().map(|(_, channel)| channel),
                state.watch_channel.take(),
            ]
        };
        for channel in channels.into_iter().flatten() {
            channel.close(Some("cancelled"));
        }
    }
}

/// Handle returned by [`FileClient::watch`].
pub struct FileWatch<S: Syntax> {
    inner: Weak<Inner<S>>,
    id: u64,
}

impl<S: Syntax> std::fmt::Debug for FileWatch<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatch").field("id", &self.id).finish()
    }
}

impl<S: Syntax> FileWatch<S> {
    /// Stops the callback; the last removal closes the watch channel.
    pub fn remove(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let channel = {
            let mut state = inner.lock();
            state.watchers.retain(|(id, _)| *id != self.id);
            if state.watchers.is_empty() {
                state.watch_channel.take()
            } else {
                None
            }
        };
        if let Some(channel) = channel {
            channel.close(None);
        }
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

impl<S: Syntax> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, State<S::Content>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel_options(&self, payload: &str) -> ChannelOptions {
        let mut options = ChannelOptions::new(payload)
            .binary(self.syntax.binary())
            .merge(&self.options.extra)
            .with("path", self.path.as_str());
        options.host = self.options.host.clone();
        if let Some(superuser) = &self.options.superuser {
            options = options.with("superuser", superuser.as_str());
        }
        options
    }

    /// Joins the read in flight or starts one.  The read is driven by its own
    /// task so that watch-triggered reads complete without an awaiting caller.
    fn start_read(self: &Arc<Self>) -> ReadFuture<S::Content> {
        let mut state = self.lock();
        if let Some(reading) = &state.reading {
            return reading.clone();
        }
        let inner = Arc::clone(self);
        let future: BoxFuture<'static, ReadResult<S::Content>> = inner.read_with_retries().boxed();
        let future = future.shared();
        state.reading = Some(future.clone());
        drop(state);

        tokio::spawn(future.clone());
        future
    }

    async fn read_with_retries(self: Arc<Self>) -> ReadResult<S::Content> {
        let mut conflicts = 0;
        let result = loop {
            match self.read_once().await {
                Err(error) if error.is_conflict() && conflicts < self.retries => {
                    conflicts += 1;
                    debug!(target: "bridgemux::file", "{}: conflict during read, retrying", self.path);
                }
                other => break other,
            }
        };

        self.lock().reading = None;
        match &result {
            Ok(file) => self.fire_watchers(file.content.as_ref(), file.tag.as_deref(), None),
            Err(error) => self.fire_watchers(None, None, Some(error)),
        }
        result
    }

    async fn read_once(&self) -> ReadResult<S::Content> {
        let mut options = self.channel_options("fsread1");
        if let Some(max) = self.options.max_read_size {
            options = options.with("max_read_size", max);
        }
        let (channel, mut events) = Channel::open(&self.transport, options);
        self.lock().read_channel = Some(channel.clone());

        let mut buffer = ChannelBuffer::new(self.syntax.binary());
        let close = loop {
            match events.recv().await {
                Some(ChannelEvent::Message(payload)) => buffer.push(payload),
                Some(ChannelEvent::Close(options)) => break options,
                Some(_) => {}
                None => break Control::close(Some("disconnected")),
            }
        };
        self.lock().read_channel = None;
        drop(channel);

        if let Some(error) = ChannelError::from_close(&close) {
            return Err(error.into());
        }
        let tag = close.get_str("tag").map(str::to_owned);
        if tag.as_deref() == Some(ABSENT_TAG) {
            return Ok(FileContent { content: None, tag });
        }
        let content = self.syntax.parse(buffer.take())?;
        Ok(FileContent {
            content: Some(content),
            tag,
        })
    }

    fn fire_watchers(&self, content: Option<&S::Content>, tag: Option<&str>, error: Option<&FileError>) {
        let callbacks: Vec<WatchCallback<S::Content>> = {
            let mut state = self.lock();
            state.watch_tag = tag.map(str::to_owned);
            state.watchers.iter().map(|(_, callback)| Arc::clone(callback)).collect()
        };
        for callback in callbacks {
            callback(content, tag, error);
        }
    }

    fn on_watch_message(self: &Arc<Self>, payload: &Payload) {
        let notice: WatchNotice = match serde_json::from_slice(payload.as_bytes()) {
            Ok(notice) => notice,
            Err(e) => {
                debug!(target: "bridgemux::file", "{}: ignoring watch message: {e}", self.path);
                return;
            }
        };
        if notice.path.as_deref() != Some(self.path.as_str()) {
            return;
        }
        let Some(tag) = notice.tag else {
            return;
        };
        if self.lock().watch_tag.as_deref() == Some(tag.as_str()) {
            return;
        }
        debug!(
            target: "bridgemux::file",
            "{}: {} (tag {tag})",
            self.path,
            notice.event.as_deref().unwrap_or("changed")
        );
        drop(self.start_read());
    }
}

async fn watch_pump<S: Syntax>(weak: Weak<Inner<S>>, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(payload) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.on_watch_message(&payload);
            }
            ChannelEvent::Close(options) => {
                debug!(target: "bridgemux::file", "watch closed: {}", options.problem().unwrap_or("no problem"));
                return;
            }
            ChannelEvent::Ready(_) | ChannelEvent::Control(_) => {}
        }
    }
}

async fn closed(events: &mut ChannelEvents) -> Control {
    while let Some(event) = events.recv().await {
        if let ChannelEvent::Close(options) = event {
            return options;
        }
    }
    Control::close(Some("disconnected"))
}

/// Splits `data` into messages of at most `size` bytes.  Text is only cut
/// at character boundaries.
fn batches(data: Payload, size: usize) -> Vec<Payload> {
    match data {
        Payload::Binary(bytes) => bytes.chunks(size).map(|chunk| Payload::Binary(chunk.to_vec())).collect(),
        Payload::Text(text) => {
            let mut out = Vec::new();
            let mut rest = text.as_str();
            while !rest.is_empty() {
                let mut at = size.min(rest.len());
                while !rest.is_char_boundary(at) {
                    at -= 1;
                }
                if at == 0 {
                    at = rest.chars().next().map_or(rest.len(), char::len_utf8);
                }
                let (head, tail) = rest.split_at(at);
                out.push(Payload::Text(head.to_owned()));
                rest = tail;
            }
            out
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
