use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::*;
use dx_tune::error::{with_retry, RetryPolicy};
use dx_tune::{
    browse, BrowseEvent, ClientDelegate, DiscoveryConfig, Observable, ParamStore,
    ParameterClient, ParameterServer, Value, DEFAULT_PORT,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Parser)]
#[command(name = "tune")]
#[command(
    about = "Live parameter tuning over the local network: share in-process values, observe and edit them remotely",
    version
)]
#[command(after_help = "Tune Features:
- Share any value by key path under a stable wire name
- Multi-observer fan-out with per-observer queues (slow observers only degrade themselves)
- Bidirectional: observers push edits back, every observer sees the result
- Zero-config LAN discovery via UDP beacons
- Length-prefixed CBOR frames carrying self-describing values")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo parameter server that shares and animates a few values
    Serve {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Instance name announced over discovery
        #[arg(short, long, default_value = "tune-demo")]
        name: String,

        /// Milliseconds between demo value updates
        #[arg(long, default_value_t = 500)]
        tick_ms: u64,
    },

    /// Discover a server (or connect directly), then print live values
    Observe {
        /// Connect directly instead of browsing, e.g. 192.168.1.20:47800
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Write a value after connecting, e.g. --set mixer.gain=0.8
        #[arg(long, value_name = "NAME=JSON")]
        set: Vec<String>,
    },

    /// List advertised parameter servers for a few seconds
    Discover {
        #[arg(short, long, default_value_t = 6)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, name, tick_ms } => serve(port, name, tick_ms).await,
        Commands::Observe { addr, set } => observe(addr, set).await,
        Commands::Discover { seconds } => discover(seconds).await,
    }
}

async fn serve(port: u16, name: String, tick_ms: u64) -> Result<()> {
    let store = Arc::new(
        ParamStore::new()
            .with_value("mixer.gain", Value::Float(0.5))
            .with_value("mixer.muted", Value::Bool(false))
            .with_value("mixer.label", Value::Text("main mix".to_string()))
            .with_value("engine.threshold", Value::Integer(64)),
    );

    let server = ParameterServer::bind(port).await?;
    println!(
        "{} Parameter server on {}",
        "✓".green(),
        server.local_addr().to_string().bright_blue()
    );

    server.advertise(&DiscoveryConfig::default(), &name).await;
    println!(
        "{} Advertising as {}",
        "→".bright_blue(),
        name.bright_yellow()
    );

    for key_path in ["mixer.gain", "mixer.muted", "mixer.label", "engine.threshold"] {
        server.share(key_path, store.clone(), key_path);
    }
    println!(
        "{} Sharing {} parameters\n",
        "→".bright_blue(),
        server.shared_names().len()
    );

    // Animate the gain so observers see live traffic; edits pushed from
    // observers land in the same store and broadcast right back.
    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms.max(50)));
    loop {
        ticker.tick().await;
        let phase = Utc::now().timestamp_millis() as f64 / 4000.0;
        let gain = 0.5 + 0.5 * phase.sin();
        store.set_value("mixer.gain", Value::Float((gain * 1000.0).round() / 1000.0))?;
    }
}

async fn observe(addr: Option<SocketAddr>, sets: Vec<String>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => {
            println!("{}", "Browsing for parameter servers...".bright_cyan());
            let policy = RetryPolicy::aggressive();
            with_retry(&policy, || async {
                let mut browser = browse(&DiscoveryConfig::default())
                    .await
                    .map_err(|err| err.to_string())?;
                loop {
                    match timeout(Duration::from_secs(10), browser.recv()).await {
                        Ok(Some(BrowseEvent::Found(info))) => {
                            println!(
                                "{} Found {} at {}",
                                "+".green(),
                                info.name.bright_yellow(),
                                info.addr().to_string().bright_blue()
                            );
                            return Ok(info.addr());
                        }
                        Ok(Some(BrowseEvent::Removed(_))) => continue,
                        Ok(None) => return Err("browse stream ended".to_string()),
                        Err(_) => return Err("no publisher found within 10s".to_string()),
                    }
                }
            })
            .await?
        }
    };

    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let client = ParameterClient::connect(addr, Arc::new(PrintDelegate { disconnect_tx })).await?;
    println!(
        "{} Connected to {}\n",
        "✓".green(),
        addr.to_string().bright_blue()
    );

    for spec in &sets {
        let (name, value) = parse_set(spec)?;
        client.set_value(value, &name);
        println!("{} set {}", "↗".bright_blue(), spec.bright_white());
    }

    disconnect_rx.recv().await;
    println!("{}", "Disconnected.".red());
    Ok(())
}

async fn discover(seconds: u64) -> Result<()> {
    let mut browser = browse(&DiscoveryConfig::default()).await?;
    println!(
        "{}",
        format!("Browsing for {} seconds...", seconds).bright_cyan()
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    loop {
        match tokio::time::timeout_at(deadline, browser.recv()).await {
            Ok(Some(BrowseEvent::Found(info))) => println!(
                "{} {} at {}",
                "+".green(),
                info.name.bright_yellow(),
                info.addr().to_string().bright_blue()
            ),
            Ok(Some(BrowseEvent::Removed(name))) => {
                println!("{} {}", "-".red(), name.bright_yellow())
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    Ok(())
}

struct PrintDelegate {
    disconnect_tx: mpsc::UnboundedSender<()>,
}

impl ClientDelegate for PrintDelegate {
    fn received_value(&self, name: &str, value: Value) {
        let rendered = serde_json::to_string(&value).unwrap_or_else(|_| format!("{:?}", value));
        println!(
            "{} {} {}",
            "VALUE".green().bold(),
            name.bright_white(),
            rendered.bright_black()
        );
    }

    fn lost(&self, name: &str) {
        println!("{} {}", "LOST".red().bold(), name.bright_white());
    }

    fn disconnected(&self) {
        let _ = self.disconnect_tx.send(());
    }
}

/// Parse `name=json`; bare words fall back to a text value.
fn parse_set(spec: &str) -> Result<(String, Value)> {
    let (name, raw) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=JSON, got '{}'", spec))?;

    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => serde_cbor::value::to_value(json)?,
        Err(_) => Value::Text(raw.to_string()),
    };
    Ok((name.to_string(), value))
}
