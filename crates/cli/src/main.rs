//! Bridge demo entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse arguments and configuration**: one optional JSON configuration
//!    file per side, validated by [`BridgeConfig::load`].
//! 2. **Wire logging**: `tracing-subscriber` with an `EnvFilter` (`RUST_LOG`)
//!    and an optional JSON formatter. Every `tracing` event emitted by the
//!    workspace crates flows through it.
//! 3. **Construct infrastructure**: a current-thread tokio runtime, a
//!    `LocalSet`, a [`TokioScheduler`], and two bridges connected through the
//!    loopback primitives selected by `--transport`.
//! 4. **Exercise the protocol**: `call`, `get` (success and fault), `invoke`
//!    of an exposed function, and the `puts`/`error` debug sinks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bridge::{Bridge, BridgeConfig, ErrorEnvelope, Value};
use clap::{Parser, ValueEnum};
use loopback::{direct_pair, throttled_pair};
use runtime::{PromiseExt, TokioScheduler};
use serde_json::json;
use tokio::task::LocalSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How the page side sends to the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportMode {
    /// Unthrottled delivery in both directions.
    Direct,
    /// Rate-limited side band gated by acknowledgements.
    Queued,
}

#[derive(Debug, Parser)]
#[command(name = "bridge-demo", version, about = "Runs two bridges back-to-back and exercises the protocol")]
struct Args {
    /// JSON configuration for the host side.
    #[arg(long, value_name = "PATH")]
    host_config: Option<PathBuf>,

    /// JSON configuration for the page side.
    #[arg(long, value_name = "PATH")]
    page_config: Option<PathBuf>,

    /// Page-to-host transport.
    #[arg(long, value_enum, default_value_t = TransportMode::Direct)]
    transport: TransportMode,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let host_config = load_config(args.host_config.as_deref())?;
    let page_config = load_config(args.page_config.as_deref())?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    let local = LocalSet::new();
    local.block_on(&runtime, run(args.transport, host_config, page_config, timeout))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

async fn run(
    mode: TransportMode,
    host_config: BridgeConfig,
    page_config: BridgeConfig,
    timeout: Duration,
) -> Result<()> {
    let scheduler = TokioScheduler::spawn();
    let pair = match mode {
        TransportMode::Direct => direct_pair(scheduler.clone(), host_config, page_config),
        TransportMode::Queued => throttled_pair(scheduler.clone(), host_config, page_config),
    }
    .context("failed to connect the bridges")?;
    info!(
        mode = ?mode,
        host = pair.host.transport_name(),
        page = pair.page.transport_name(),
        "Bridges connected"
    );

    register_host(&pair.host)?;
    register_page(&pair.page)?;

    pair.page.puts(vec![json!("hello from the page"), json!({"mode": format!("{mode:?}")})])?;
    pair.host.call("notify", vec![json!("hello from the host")])?;

    let sum = pair
        .page
        .get("add", vec![json!(4), json!(2)])?
        .settled_within(timeout)
        .await
        .context("add timed out")??;
    info!(result = ?sum, "add(4, 2) resolved");

    match pair
        .page
        .get("divide", vec![json!(1), json!(0)])?
        .settled_within(timeout)
        .await
        .context("divide timed out")?
    {
        Ok(values) => warn!(result = ?values, "divide(1, 0) unexpectedly resolved"),
        Err(error) => info!(error = %error, "divide(1, 0) rejected"),
    }

    let max = pair
        .host
        .invoke("Math.max", vec![json!(3), json!(9), json!(4)])?
        .settled_within(timeout)
        .await
        .context("Math.max timed out")??;
    info!(result = ?max, "Math.max(3, 9, 4) resolved");

    pair.page
        .error(&ErrorEnvelope::new("DemoError", "reported from the page").with_backtrace(vec!["demo.js:1".to_string()]))?;

    // A last round trip flushes everything sent before it.
    pair.page
        .get("add", vec![])?
        .settled_within(timeout)
        .await
        .context("flush timed out")??;

    info!(
        host_pending = pair.host.pending_responses(),
        page_pending = pair.page.pending_responses(),
        unhandled = scheduler.unhandled_count(),
        "Demo finished"
    );
    Ok(())
}

fn register_host(host: &Bridge) -> Result<()> {
    host.handle("add", |params: Vec<Value>| {
        json!(params.iter().filter_map(Value::as_f64).sum::<f64>())
    })?;
    host.handle("divide", |params: Vec<Value>| -> Result<Value, ErrorEnvelope> {
        let operand = |i: usize| {
            params
                .get(i)
                .and_then(Value::as_f64)
                .ok_or_else(|| ErrorEnvelope::new("TypeError", format!("argument {i} is not a number")))
        };
        let (dividend, divisor) = (operand(0)?, operand(1)?);
        if divisor == 0.0 {
            return Err(ErrorEnvelope::new("ZeroDivisionError", "divided by 0"));
        }
        Ok(json!(dividend / divisor))
    })?;
    Ok(())
}

fn register_page(page: &Bridge) -> Result<()> {
    page.on("notify", |_, params| {
        info!(params = ?params, "Page notified");
        Ok(())
    })?;
    page.expose("Math.max", |params: Vec<Value>| -> Result<Value, ErrorEnvelope> {
        params
            .iter()
            .filter_map(Value::as_f64)
            .reduce(f64::max)
            .map(|max| json!(max))
            .ok_or_else(|| ErrorEnvelope::new("TypeError", "Math.max needs at least one number"))
    })?;
    Ok(())
}
