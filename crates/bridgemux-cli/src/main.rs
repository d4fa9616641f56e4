//! bridgemux command line entry point.
//!
//! Connects to a bridge over WebSocket and runs one operation through the
//! client library:
//!
//! ```text
//! bridgemux spawn -- uname -a             run a process, stream its output
//! bridgemux cat /etc/hostname             read a file
//! bridgemux replace /etc/motd --tag 42    write stdin to a file
//! bridgemux dbus org.freedesktop.hostname1 /org/freedesktop/hostname1 \
//!     org.freedesktop.DBus.Peer Ping
//! bridgemux metrics cpu.basic.user memory.used
//! ```
//!
//! # Configuration precedence
//!
//! 1. Built-in defaults ([`TransportConfig::default`]).
//! 2. The TOML file named by `--config` (missing file is fine).
//! 3. `BRIDGEMUX_*` environment variables.
//! 4. Command line flags.
//!
//! Logging goes through `tracing`; set `RUST_LOG=bridgemux::dbus=debug` (or
//! any other `bridgemux::*` target) for protocol traces.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use bridgemux_client::application::metrics::{MetricsChannel, MetricsSource};
use bridgemux_client::{
    spawn, websocket_transport, DBusClient, DBusOptions, FileClient, GridWalker, SpawnOptions, Transport,
    TransportConfig,
};
use bridgemux_core::series::{RowId, Timestep};
use bridgemux_core::{Control, Payload, SeriesGrid};

// ── CLI argument definition ───────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "bridgemux",
    about = "Talk to a channel-multiplexing bridge over WebSocket",
    version
)]
struct Cli {
    /// TOML file with transport settings.
    #[arg(long, env = "BRIDGEMUX_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket endpoint of the bridge.
    #[arg(long, env = "BRIDGEMUX_URL")]
    url: Option<String>,

    /// WebSocket subprotocol.
    #[arg(long, env = "BRIDGEMUX_PROTOCOL")]
    protocol: Option<String>,

    /// Seconds between liveness checks; 0 disables them.
    #[arg(long, env = "BRIDGEMUX_HEALTH_CHECK")]
    health_check: Option<u64>,

    /// Host to run channels on.
    #[arg(long, env = "BRIDGEMUX_HOST")]
    host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a process and stream its output.
    Spawn {
        /// Run with administrative privileges ("require" or "try").
        #[arg(long)]
        superuser: Option<String>,

        /// Working directory.
        #[arg(long)]
        directory: Option<String>,

        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },

    /// Print a file.
    Cat {
        path: String,
    },

    /// Replace a file with stdin (or delete it with --delete).
    Replace {
        path: String,

        /// Only write if the file is still at this version.
        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        delete: bool,
    },

    /// Call a D-Bus method.  Arguments are given as one JSON array.
    Dbus {
        name: String,
        path: String,
        interface: String,
        method: String,

        #[arg(default_value = "[]")]
        args: String,

        /// "system", "session", "user" or "none".
        #[arg(long, default_value = "system")]
        bus: String,
    },

    /// Follow metrics and print one line per interval.
    Metrics {
        #[arg(required = true)]
        names: Vec<String>,

        /// Sample interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval: u64,

        /// Sources tried in order until one is supported.
        #[arg(long, value_delimiter = ',', default_value = "direct,internal")]
        source: Vec<String>,
    },
}

// ── Config assembly ───────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> anyhow::Result<TransportConfig> {
    let mut config = match &cli.config {
        Some(path) => TransportConfig::load_or_default(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TransportConfig::default(),
    };
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    if let Some(protocol) = &cli.protocol {
        config.protocol = protocol.clone();
    }
    if let Some(secs) = cli.health_check {
        config.health_check_interval_secs = secs;
    }
    if let Some(host) = &cli.host {
        config.default_host = Some(host.clone());
    }
    Ok(config)
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn run_spawn(
    transport: &Arc<Transport>,
    argv: &[String],
    superuser: Option<String>,
    directory: Option<String>,
) -> anyhow::Result<ExitCode> {
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    let options = SpawnOptions {
        superuser,
        directory,
        err: Some("out".into()),
        ..SpawnOptions::default()
    };
    let process = spawn(transport, &argv, options);
    process.stream(|payload: &Payload| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(payload.as_bytes());
        let _ = stdout.flush();
        payload.len()
    });
    process.input(None, false);

    match process.output().await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(error) => {
            eprintln!("{error}");
            let code = error.exit_status.and_then(|s| u8::try_from(s).ok()).unwrap_or(1);
            Ok(ExitCode::from(code))
        }
    }
}

async fn run_cat(transport: &Arc<Transport>, path: &str) -> anyhow::Result<ExitCode> {
    let file = FileClient::text(transport, path);
    let read = file.read().await.with_context(|| format!("reading {path}"))?;
    match read.content {
        Some(content) => {
            print!("{content}");
            debug!(target: "bridgemux::file", "{path} at tag {:?}", read.tag);
            Ok(ExitCode::SUCCESS)
        }
        None => bail!("{path}: no such file"),
    }
}

async fn run_replace(
    transport: &Arc<Transport>,
    path: &str,
    tag: Option<&str>,
    delete: bool,
) -> anyhow::Result<ExitCode> {
    let content = if delete {
        None
    } else {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("reading stdin")?;
        Some(text)
    };
    let file = FileClient::text(transport, path);
    let tag = file
        .replace(content.as_ref(), tag)
        .await
        .with_context(|| format!("replacing {path}"))?;
    if let Some(tag) = tag {
        println!("{tag}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_dbus(
    transport: &Arc<Transport>,
    name: &str,
    path: &str,
    interface: &str,
    method: &str,
    args: &str,
    bus: &str,
) -> anyhow::Result<ExitCode> {
    let args: Value = serde_json::from_str(args).context("arguments must be a JSON array")?;
    let Value::Array(args) = args else {
        bail!("arguments must be a JSON array");
    };
    let client = DBusClient::open(transport, Some(name), DBusOptions::bus(bus));
    let reply = client
        .call(path, interface, method, args)
        .await
        .with_context(|| format!("{interface}.{method} on {path}"))?;
    println!("{}", serde_json::to_string_pretty(&Value::Array(reply))?);
    client.close(None);
    Ok(ExitCode::SUCCESS)
}

async fn run_metrics(
    transport: &Arc<Transport>,
    names: &[String],
    interval: u64,
    sources: &[String],
) -> anyhow::Result<ExitCode> {
    let wanted: Vec<Value> = names.iter().map(|name| json!({"name": name})).collect();
    let sources = sources
        .iter()
        .map(|source| MetricsSource::new(source.as_str()).with("metrics", wanted.clone()))
        .collect();
    let metrics = MetricsChannel::new(transport, interval, sources, None);

    let grid = SeriesGrid::new(interval, Timestep::FromNow(-2), Some(Timestep::FromNow(0)));
    let rows: Vec<RowId> = names
        .iter()
        .map(|name| grid.add_sink(metrics.series(), vec![name.clone()]))
        .collect::<Result<_, _>>()
        .context("attaching metrics to grid")?;
    grid.add_calculated(false, move |grid_rows, _row, x, n| {
        let Some(last) = (x..x + n).last() else {
            return;
        };
        let line: Vec<String> = rows
            .iter()
            .map(|row| grid_rows.value(*row, last).map_or_else(|| "-".to_owned(), Value::to_string))
            .collect();
        println!("{}", line.join("\t"));
    });

    metrics.follow();
    let _walker = GridWalker::start(&grid).context("interval too large to follow")?;
    info!("following {} metrics every {interval} ms, Ctrl-C to stop", names.len());
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    grid.close();
    metrics.close(None);
    Ok(ExitCode::SUCCESS)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!("connecting to {}", config.url);
    let transport = websocket_transport(config);
    transport
        .ready()
        .await
        .map_err(|close| anyhow::anyhow!("{}", close.problem().unwrap_or("disconnected")))
        .context("connecting to bridge")?;

    let code = match cli.command {
        Command::Spawn {
            superuser,
            directory,
            argv,
        } => run_spawn(&transport, &argv, superuser, directory).await?,
        Command::Cat { path } => run_cat(&transport, &path).await?,
        Command::Replace { path, tag, delete } => run_replace(&transport, &path, tag.as_deref(), delete).await?,
        Command::Dbus {
            name,
            path,
            interface,
            method,
            args,
            bus,
        } => run_dbus(&transport, &name, &path, &interface, &method, &args, &bus).await?,
        Command::Metrics {
            names,
            interval,
            source,
        } => run_metrics(&transport, &names, interval, &source).await?,
    };

    transport.close(Some(Control::close(None)));
    Ok(code)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        // Arrange
        let cli = Cli::parse_from([
            "bridgemux",
            "--url",
            "wss://h/cockpit/socket",
            "--health-check",
            "0",
            "cat",
            "/etc/hostname",
        ]);

        // Act
        let config = load_config(&cli).unwrap();

        // Assert
        assert_eq!(config.url, "wss://h/cockpit/socket");
        assert_eq!(config.health_check_interval_secs, 0);
        assert_eq!(config.protocol, "cockpit1");
    }

    #[test]
    fn test_spawn_keeps_trailing_arguments() {
        let cli = Cli::parse_from(["bridgemux", "spawn", "--", "ls", "-l", "/"]);
        match cli.command {
            Command::Spawn { argv, .. } => assert_eq!(argv, vec!["ls", "-l", "/"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_metrics_sources_split_on_commas() {
        let cli = Cli::parse_from(["bridgemux", "metrics", "--source", "pcp,internal", "cpu.basic.user"]);
        match cli.command {
            Command::Metrics { source, names, .. } => {
                assert_eq!(source, vec!["pcp", "internal"]);
                assert_eq!(names, vec!["cpu.basic.user"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
