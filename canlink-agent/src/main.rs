// CANLink Agent - Edge agent for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # CANLink Agent
//!
//! Reads bus frames, runs them through the CANLink pipeline, posts records
//! to a collector and exposes a Prometheus status server.
//!
//! ## Usage
//!
//! ```bash
//! # Live bus via candump
//! candump -L can0 | canlink-agent --candump - --endpoint https://collector/telemetry
//!
//! # Recorded candump log
//! canlink-agent --candump trip.log --config agent.json
//!
//! # Historical CSV export, training the fault detector on it first
//! canlink-agent --replay logger.csv --train --port 9300
//! ```

mod config;
mod error;
mod ingest;
mod metrics;
mod replay;
mod source;
mod status;
mod uplink;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use clap::Parser;
use config::AgentConfig;
use error::AgentError;
use ingest::IngestPlan;
use metrics::encode_metrics;
use serde::Serialize;
use source::{CandumpSource, FrameSource};
use status::{AgentStatus, StatusSnapshot};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// CANLink edge agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Status server port
    #[arg(short, long, default_value = "9300")]
    port: u16,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// candump -L log to read frames from ("-" for stdin)
    #[arg(long)]
    candump: Option<String>,

    /// Historical CSV log to replay before live frames
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Train the fault detector on the replayed log first
    #[arg(long, default_value = "false")]
    train: bool,

    /// Collector endpoint (overrides the config file)
    #[arg(long)]
    endpoint: Option<String>,

    /// Device identifier (overrides the config file)
    #[arg(long)]
    device_id: Option<String>,

    /// Durable queue database (overrides the config file)
    #[arg(long)]
    queue: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn agent_config(&self) -> Result<AgentConfig, AgentError> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            config.uplink.endpoint = endpoint.clone();
        }
        if let Some(device_id) = &self.device_id {
            config.pipeline.device_id = device_id.clone();
        }
        if let Some(queue) = &self.queue {
            config.queue_path = queue.clone();
        }
        if self.train {
            config.replay.train_detector = true;
        }
        config.validate()?;
        Ok(config)
    }

    fn frame_source(&self) -> Result<Option<Box<dyn FrameSource + Send>>, AgentError> {
        match self.candump.as_deref() {
            None => Ok(None),
            Some("-") => Ok(Some(Box::new(CandumpSource::new(BufReader::new(
                std::io::stdin(),
            ))))),
            Some(path) => Ok(Some(Box::new(CandumpSource::open(Path::new(path))?))),
        }
    }
}

/// Application state shared across handlers.
struct AppState {
    status: Arc<AgentStatus>,
    start_time: std::time::Instant,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("CANLink Agent v{}", env!("CARGO_PKG_VERSION"));

    let plan = match args.agent_config().and_then(|config| {
        Ok(IngestPlan {
            config,
            replay_log: args.replay.clone(),
            source: args.frame_source()?,
        })
    }) {
        Ok(plan) => plan,
        Err(e) => {
            error!("Failed to start: {}", e);
            std::process::exit(2);
        }
    };

    if plan.replay_log.is_none() && plan.source.is_none() {
        info!("No input specified, serving status only");
    }

    let status = AgentStatus::new();

    // The pipeline and the blocking uplink stay off the async runtime
    let ingest_status = Arc::clone(&status);
    std::thread::spawn(move || {
        if let Err(e) = ingest::run(plan, ingest_status) {
            error!("Ingestion stopped: {}", e);
        }
    });

    let state = Arc::new(AppState {
        status,
        start_time: std::time::Instant::now(),
    });

    // Build router
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
    }
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>CANLink Agent</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>CANLink Agent</h1>
    <p>Edge telemetry agent for vehicle CAN buses.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/health">/health</a> - Liveness check</div>
        <div class="endpoint"><a href="/ready">/ready</a> - Readiness check</div>
        <div class="endpoint"><a href="/status">/status</a> - Pipeline status (JSON)</div>
    </div>

    <h2>Metrics</h2>
    <ul>
        <li><code>canlink_frames_decoded_total</code> - Decoded frames</li>
        <li><code>canlink_records_delivered_total</code> - Records delivered</li>
        <li><code>canlink_records_buffered_total</code> - Records buffered offline</li>
        <li><code>canlink_queue_depth</code> - Durable queue depth</li>
        <li><code>canlink_health_score</code> - Vehicle health score</li>
        <li><code>canlink_alerts_total</code> - Alerts by type and severity</li>
        <li><code>canlink_detector_state</code> - Fault detector state</li>
    </ul>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = encode_metrics();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.status.is_ready() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
    }
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    running: bool,
    finished: bool,
    pipeline: StatusSnapshot,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        running: state.status.running.load(Ordering::SeqCst),
        finished: state.status.finished.load(Ordering::SeqCst),
        pipeline: state.status.snapshot(),
    })
}
