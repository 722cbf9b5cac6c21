//! simlink - Simulator Session Link
//! Mission: Keep a trading-simulator client attached to its live session
//!
//! Usage:
//!   simlink --url wss://host/ws/session --api-url https://host/api --simulator
//!
//! Environment Variables:
//!   SIMLINK_TOKEN - Bearer token of the signed-in user
//!   SIMLINK_CONFIG - Path to TOML config file
//!   SIMLINK_* - Per-field overrides, see `EngineConfig::apply_env`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simlink::auth::TokenAuth;
use simlink::events::{DeviceEvent, HeartbeatEvent, SimulatorEvent, StatusEvent};
use simlink::identity::{DeviceIdentity, FileDeviceIdentity, MemoryDeviceIdentity};
use simlink::notify::TracingNotifier;
use simlink::session::{MemorySessionStore, SessionStore, SqliteSessionStore};
use simlink::simulator::HttpSimulatorApi;
use simlink::transport::WsTransport;
use simlink::{Collaborators, ConnectionManager, DesiredStatePatch, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "simlink")]
#[command(about = "Resilient session link for the trading simulator")]
struct Args {
    /// Real-time session endpoint
    #[arg(long, env = "SIMLINK_URL")]
    url: Option<String>,

    /// Simulator control API base URL
    #[arg(long, env = "SIMLINK_API_URL")]
    api_url: Option<String>,

    /// Bearer token; omit to run signed out
    #[arg(long, env = "SIMLINK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long, env = "SIMLINK_CONFIG")]
    config: Option<String>,

    /// File holding the persistent device id
    #[arg(long, env = "SIMLINK_DEVICE_FILE")]
    device_file: Option<String>,

    /// SQLite database for the resumable session
    #[arg(long, env = "SIMLINK_SESSION_DB")]
    session_db: Option<String>,

    /// Start the simulator once connected
    #[arg(long)]
    simulator: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path, "loading config");
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };
    config.apply_env();
    if let Some(url) = args.url {
        config.transport.url = url;
    }
    if let Some(api_url) = args.api_url {
        config.simulator.base_url = api_url;
    }

    let device: Arc<dyn DeviceIdentity> = match &args.device_file {
        Some(path) => Arc::new(FileDeviceIdentity::new(path)),
        None => Arc::new(MemoryDeviceIdentity::new()),
    };
    let store: Arc<dyn SessionStore> = match &args.session_db {
        Some(path) => Arc::new(SqliteSessionStore::new(path)?),
        None => Arc::new(MemorySessionStore::new()),
    };
    match store.load() {
        Ok(Some(previous)) => info!(
            session_id = ?previous.session_id,
            last_active = %previous.last_active,
            "found resumable session"
        ),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "could not read stored session"),
    }

    let deps = Collaborators {
        transport: Arc::new(WsTransport::new(config.transport.clone())),
        auth: Arc::new(TokenAuth::new(args.token)),
        device,
        notifier: Arc::new(TracingNotifier::default()),
        store,
        simulator_api: Arc::new(HttpSimulatorApi::new(&config.simulator)),
    };

    let manager = ConnectionManager::spawn(config, deps);
    attach_loggers(&manager);

    manager.set_desired_state(DesiredStatePatch {
        connected: Some(true),
        simulator_running: args.simulator.then_some(true),
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let ended = manager.end_session().await;
    info!(stopped = ended.success, metrics = %manager.metrics().summary(), "session ended");
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.dispose().await;
    Ok(())
}

fn attach_loggers(manager: &ConnectionManager) {
    manager.subscribe_status(|event| match event {
        StatusEvent::Changed {
            from,
            to,
            recovering,
            reason,
        } => info!(%from, %to, recovering, reason = ?reason, "status"),
        StatusEvent::Suspended { cooldown } => {
            warn!(cooldown_s = cooldown.as_secs(), "reconnection suspended")
        }
        StatusEvent::Resumed => info!("reconnection resumed"),
        StatusEvent::RecoveryScheduled { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "recovery scheduled")
        }
        StatusEvent::GaveUp { attempts } => warn!(attempts, "gave up reconnecting"),
    });
    manager.subscribe_heartbeat(|event| match event {
        HeartbeatEvent::Response {
            latency_ms, quality, ..
        } => info!(latency_ms, %quality, "heartbeat"),
        HeartbeatEvent::Missed { consecutive_misses } => {
            warn!(consecutive_misses, "heartbeat missed")
        }
        HeartbeatEvent::Timeout { consecutive_misses } => {
            warn!(consecutive_misses, "heartbeat timed out")
        }
    });
    manager.subscribe_simulator(|event| match event {
        SimulatorEvent::StatusChanged { from, to } => info!(%from, %to, "simulator"),
        SimulatorEvent::OperationFailed { operation, error } => {
            warn!(operation, error = %error, "simulator operation failed")
        }
    });
    manager.subscribe_device(|event| match event {
        DeviceEvent::Invalidated { device_id, reason } => {
            warn!(device_id = %device_id, reason = ?reason, "device invalidated")
        }
    });
}

/// Initialize tracing; `RUST_LOG` overrides the default filter
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simlink=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate root
    let _ = dotenv();
    let candidate = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
