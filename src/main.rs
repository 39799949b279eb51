//! Strata storage node
//!
//! Opens one node's storage engine against a directory-backed durable tier
//! and serves metrics and health endpoints until Ctrl-C.
//!
//! ```text
//! ┌──────────────────────────── strata ────────────────────────────┐
//! │  config (YAML + flags) ──▶ StorageEngine                       │
//! │                             ├─ BlockCache                      │
//! │                             ├─ LocalStore ── data_dir/         │
//! │                             └─ GlobalStore ── durable_dir/     │
//! │  /metrics (EngineCollector)        /healthz /livez /readyz     │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strata::engine::directory_backends;
use strata::metrics::EngineCollector;
use strata::{EngineConfig, StorageEngine};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Strata - three-tier block storage node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Override this node's id
    #[arg(long, env = "STRATA_NODE_ID")]
    node_id: Option<u32>,

    /// Override the number of nodes
    #[arg(long, env = "STRATA_NODE_COUNT")]
    node_count: Option<u32>,

    /// Override the local data directory
    #[arg(long, env = "STRATA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Root of the directory-backed durable tier (default: <data_dir>/durable)
    #[arg(long, env = "STRATA_DURABLE_DIR")]
    durable_dir: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9100")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:9101")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    let durable_dir = args
        .durable_dir
        .clone()
        .unwrap_or_else(|| config.data_dir.join("durable"));

    info!("Starting strata node {}", config.node_id);
    info!("  Nodes: {}", config.node_count);
    info!("  Data dir: {}", config.data_dir.display());
    info!("  Durable dir: {}", durable_dir.display());
    info!(
        "  Cache: {} blocks of {} bytes",
        config.cache_capacity_blocks(),
        config.segment_size
    );

    let backends = directory_backends(&durable_dir, config.global_backends);
    let engine = Arc::new(
        StorageEngine::open(config, backends, None).context("failed to open storage engine")?,
    );
    let collector = Arc::new(EngineCollector::new()?);

    // The engine runs on its own threads; this runtime only serves HTTP
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("strata-http")
        .enable_all()
        .build()?;
    let served = runtime.block_on(serve(&args, Arc::clone(&engine), collector));
    drop(runtime);

    engine.shutdown();
    info!("Strata node stopped");
    served
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(node_count) = args.node_count {
        config.node_count = node_count;
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn serve(
    args: &Args,
    engine: Arc<StorageEngine>,
    collector: Arc<EngineCollector>,
) -> Result<()> {
    let token = CancellationToken::new();

    let health = tokio::spawn(run_health_server(
        parse_addr(&args.health_addr)?,
        token.clone(),
    ));
    let metrics = tokio::spawn(run_metrics_server(
        parse_addr(&args.metrics_addr)?,
        engine,
        collector,
        token.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, draining");
    token.cancel();

    for (name, task) in [("health", health), ("metrics", metrics)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {:#}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }
    Ok(())
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid listen address {addr}"))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, token: CancellationToken) -> Result<()> {
    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        Ok(match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        })
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health server on {addr}"))?;
    info!("Health server listening on {}", addr);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("health server accept error")?;
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(health_handler))
                        .await
                    {
                        error!("Health server connection error: {}", e);
                    }
                });
            }
        }
    }
    info!("Health server stopped");
    Ok(())
}

async fn run_metrics_server(
    addr: SocketAddr,
    engine: Arc<StorageEngine>,
    collector: Arc<EngineCollector>,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {addr}"))?;
    info!("Metrics server listening on {}", addr);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("metrics server accept error")?;
                let io = TokioIo::new(stream);
                let engine = Arc::clone(&engine);
                let collector = Arc::clone(&collector);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let engine = Arc::clone(&engine);
                    let collector = Arc::clone(&collector);
                    async move {
                        Ok::<_, Infallible>(metrics_response(req.uri().path(), &engine, &collector))
                    }
                });
                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Metrics server connection error: {}", e);
                    }
                });
            }
        }
    }
    info!("Metrics server stopped");
    Ok(())
}

fn metrics_response(
    path: &str,
    engine: &StorageEngine,
    collector: &EngineCollector,
) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }
    collector.update(&engine.stats());
    match collector.encode() {
        Ok(text) => {
            let mut response = text_response(StatusCode::OK, text);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}
