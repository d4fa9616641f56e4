//! Process spawning over the `stream` payload.
//!
//! The bridge runs `argv` on the target host and the channel carries its
//! stdin/stdout.  The process result arrives with the channel's `close`:
//! a `problem`, a non-zero `exit-status` or an `exit-signal` fail the
//! process; anything else completes it with the buffered output.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use bridgemux_core::{Control, Payload};

use crate::application::buffer::{BufferCallback, ChannelBuffer};
use crate::application::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions};
use crate::application::transport::Transport;
use crate::domain::errors::ProcessError;

/// Options for [`spawn`].  Unset fields are left to the bridge's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnOptions {
    pub binary: bool,
    pub host: Option<String>,
    pub directory: Option<String>,
    pub environ: Vec<String>,
    /// What to do with stderr: `out`, `ignore` or `message`.
    pub err: Option<String>,
    pub pty: bool,
    /// `require` or `try` to run with elevated privileges.
    pub superuser: Option<String>,
    pub extra: Map<String, Value>,
}

/// A successfully finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Output not already handed to a [`Process::stream`] callback.
    pub data: Payload,
    /// Captured stderr when spawned with `err: "message"`.
    pub message: Option<String>,
}

pub type ProcessResult = Result<ProcessOutput, ProcessError>;

struct Shared {
    buffer: Mutex<ChannelBuffer>,
    result: watch::Sender<Option<ProcessResult>>,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, ChannelBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A running (or finished) process.
#[derive(Clone)]
pub struct Process {
    channel: Channel,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("channel", &self.channel.to_string()).finish()
    }
}

/// Starts `argv` on the bridge's host.
pub fn spawn(transport: &Arc<Transport>, argv: &[&str], options: SpawnOptions) -> Process {
    let name = argv.first().copied().unwrap_or("process").to_owned();
    let spawn: Vec<Value> = argv.iter().map(|arg| Value::from(*arg)).collect();

    let mut open = ChannelOptions::new("stream")
        .binary(options.binary)
        .merge(&options.extra)
        .with("spawn", spawn);
    open.host = options.host;
    if let Some(directory) = options.directory {
        open = open.with("directory", directory);
    }
    if !options.environ.is_empty() {
        open = open.with("environ", options.environ);
    }
    if let Some(err) = options.err {
        open = open.with("err", err);
    }
    if options.pty {
        open = open.with("pty", true);
    }
    if let Some(superuser) = options.superuser {
        open = open.with("superuser", superuser);
    }

    debug!(target: "bridgemux::spawn", "process spawn: {:?}", argv);
    let (channel, events) = Channel::open(transport, open);
    let (result, _) = watch::channel(None);
    let shared = Arc::new(Shared {
        buffer: Mutex::new(ChannelBuffer::new(options.binary)),
        result,
    });
    tokio::spawn(pump(Arc::clone(&shared), events, name));

    Process { channel, shared }
}

/// Runs `script` through `/bin/sh -c`, passing `args` as positional
/// parameters.
pub fn script(transport: &Arc<Transport>, script: &str, args: &[&str], options: SpawnOptions) -> Process {
    let mut argv = vec!["/bin/sh", "-c", script, "--"];
    argv.extend_from_slice(args);
    spawn(transport, &argv, options)
}

async fn pump(shared: Arc<Shared>, mut events: ChannelEvents, name: String) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(payload) => shared.buffer().push(payload),
            ChannelEvent::Close(options) => {
                let data = shared.buffer().take();
                debug!(target: "bridgemux::spawn", "process closed: {}", options.to_value());
                shared.result.send_replace(Some(outcome(&options, data, &name)));
                return;
            }
            ChannelEvent::Ready(_) | ChannelEvent::Control(_) => {}
        }
    }
}

fn outcome(options: &Control, data: Payload, name: &str) -> ProcessResult {
    let exited_badly = options.get("exit-status").is_some_and(truthy)
        || options.get("exit-signal").is_some_and(truthy);
    if options.problem().is_some() || exited_badly {
        return Err(ProcessError::from_close(options, name));
    }
    Ok(ProcessOutput {
        data,
        message: options.message().map(str::to_owned),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

impl Process {
    /// Hands output to `callback` as it arrives instead of collecting it.
    /// The callback returns how many bytes it consumed; the rest is offered
    /// again with the next chunk.
    pub fn stream(&self, callback: impl FnMut(&Payload) -> usize + Send + 'static) -> &Self {
        let callback: BufferCallback = Box::new(callback);
        self.shared.buffer().set_callback(callback);
        self
    }

    /// Writes to the process's stdin.  Unless `stream` is set, stdin is
    /// closed afterwards.
    pub fn input(&self, data: Option<Payload>, stream: bool) -> &Self {
        if let Some(data) = data {
            self.channel.send(data);
        }
        if !stream {
            self.channel.done();
        }
        self
    }

    /// Kills the process, optionally reporting `problem`.
    pub fn close(&self, problem: Option<&str>) {
        self.channel.close(problem);
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Waits for the process to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the bridge reported a problem or the
    /// process exited non-zero or on a signal.
    pub async fn output(&self) -> ProcessResult {
        let mut rx = self.shared.result.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|result| result.clone())
            .unwrap_or_else(|| Err(disconnected()))
    }
}

fn disconnected() -> ProcessError {
    ProcessError::from_close(&Control::close(Some("disconnected")), "process")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
