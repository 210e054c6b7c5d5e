//! n3n agent: pairs a device with the platform and keeps an encrypted session.
//!
//! ```bash
//! n3n-agent pair --url ws://127.0.0.1:8787/gateway/agent/secure --code 123456
//! n3n-agent run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatestream::dispatcher::unknown_method;
use gatestream::{AgentConnector, ErrorBody, RequestHandler, WsTransport};
use gatetrust::handshake::Registration;
use gatetrust::storage::{DeviceKeys, FileStore};
use gatetrust::IdentityKeyPair;

#[derive(Parser)]
#[command(name = "n3n-agent", version, about = "Device agent for the n3n platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register this device with a pairing code.
    Pair(PairArgs),
    /// Connect with the stored device identity and serve requests.
    Run(RunArgs),
}

#[derive(Args)]
struct PairArgs {
    /// Secure endpoint, e.g. ws://host:8787/gateway/agent/secure
    #[arg(long)]
    url: String,
    /// Six-digit pairing code.
    #[arg(long)]
    code: String,
    #[arg(long, default_value = "n3n-agent-data")]
    store: PathBuf,
    /// Defaults to a random id.
    #[arg(long)]
    device_id: Option<String>,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    /// Overrides the stored platform URL.
    #[arg(long)]
    url: Option<String>,
    #[arg(long, default_value = "n3n-agent-data")]
    store: PathBuf,
}

struct AgentInfo {
    device_id: String,
}

#[async_trait]
impl RequestHandler for AgentInfo {
    async fn handle(&self, _device_id: &str, method: &str, _params: Value) -> Result<Value, ErrorBody> {
        match method {
            "agent.info" => Ok(json!({
                "deviceId": self.device_id,
                "platform": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "version": env!("CARGO_PKG_VERSION"),
            })),
            other => Err(unknown_method(other)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Pair(args) => pair(args).await,
        Command::Run(args) => run(args).await,
    }
}

async fn pair(args: PairArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.code.len() != 6 || !args.code.chars().all(|c| c.is_ascii_digit()) {
        return Err("pairing code must be six digits".into());
    }
    let identity = IdentityKeyPair::generate();
    let device_id = args.device_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let connector = AgentConnector::new(IdentityKeyPair::from_seed(&identity.seed()), device_id.clone()).with_registration(
        Registration {
            token: args.code,
            device_name: args.name,
            platform: Some(std::env::consts::OS.to_string()),
        },
    );

    let (ws, _) = tokio_tungstenite::connect_async(args.url.as_str()).await?;
    let handle = connector.connect(WsTransport::new(ws)).await?;
    let keys = DeviceKeys::new(&device_id, &identity, &args.url, handle.platform_fingerprint());
    keys.save(&FileStore::open(&args.store)?)?;
    handle.close();

    println!("paired as {device_id}");
    println!("platform fingerprint: {}", keys.platform_fingerprint);
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(&args.store)?;
    let Some(mut keys) = DeviceKeys::load(&store)? else {
        return Err(format!("no device keys in {}, run `n3n-agent pair` first", args.store.display()).into());
    };
    let url = args.url.unwrap_or_else(|| keys.platform_url.clone());
    // Counters restart per session; the stored value is for the operator.
    info!(device_id = %keys.device_id, previous_last_sequence = keys.last_sequence, "resuming device");

    let connector = AgentConnector::new(keys.identity(), keys.device_id.clone())
        .with_pinned_platform(keys.platform_fingerprint.clone())
        .with_handler(Arc::new(AgentInfo {
            device_id: keys.device_id.clone(),
        }));

    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let handle = connector.connect(WsTransport::new(ws)).await?;
    info!(connection_id = handle.connection_id(), "session established");

    tokio::select! {
        _ = handle.closed() => warn!("platform closed the session"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            handle.close();
        }
    }

    keys.last_sequence = handle.last_outbound_sequence();
    keys.save(&store)?;
    Ok(())
}
