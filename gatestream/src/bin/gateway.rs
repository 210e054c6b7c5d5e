//! n3n gateway: the platform end of the encrypted agent channel.
//!
//! ```bash
//! # Serve with defaults (127.0.0.1:8787, /gateway/agent/secure)
//! n3n-gateway serve
//!
//! # Keep the platform identity across restarts and print a pairing code
//! n3n-gateway serve --data-dir /var/lib/n3n --issue-code-for alice
//!
//! RUST_LOG=debug n3n-gateway serve --config gateway.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use gatestream::{server, Gateway, GatewayConfig, UnknownMethodHandler};
use gatetrust::storage::{FileStore, SecureStore};
use gatetrust::IdentityKeyPair;

const PLATFORM_IDENTITY_KEY: &str = "platform-identity";

#[derive(Parser)]
#[command(name = "n3n-gateway", version, about = "Encrypted WebSocket gateway for n3n device agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the secure agent endpoint.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Issue a pairing code for this user at startup.
    #[arg(long, value_name = "USER")]
    issue_code_for: Option<String>,
    /// Directory holding the platform identity key.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    let identity = Arc::new(load_platform_identity(args.data_dir.as_deref())?);
    let gateway = Arc::new(Gateway::new(config, identity, Arc::new(UnknownMethodHandler))?);
    println!("platform fingerprint: {}", gateway.platform_fingerprint());

    if let Some(user) = args.issue_code_for {
        let issued = gateway.issue_pairing_code(&user)?;
        println!(
            "pairing code for {user}: {} (valid {}s)",
            issued.token,
            gateway.config().pairing_code_ttl_secs
        );
    }

    let listener = server::bind(gateway.config()).await?;
    tokio::select! {
        outcome = server::run(gateway.clone(), listener) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            gateway.shutdown();
        }
    }
    Ok(())
}

fn load_platform_identity(dir: Option<&Path>) -> Result<IdentityKeyPair, Box<dyn std::error::Error>> {
    let Some(dir) = dir else {
        warn!("no --data-dir given, platform identity will not survive a restart");
        return Ok(IdentityKeyPair::generate());
    };
    let store = FileStore::open(dir)?;
    if let Some(bytes) = store.load(PLATFORM_IDENTITY_KEY)? {
        let bytes = Zeroizing::new(bytes);
        let seed = Zeroizing::new(
            <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| "stored platform identity is corrupt")?,
        );
        return Ok(IdentityKeyPair::from_seed(&seed));
    }
    let identity = IdentityKeyPair::generate();
    store.store(PLATFORM_IDENTITY_KEY, &identity.seed()[..])?;
    info!(dir = %dir.display(), "generated new platform identity");
    Ok(identity)
}
