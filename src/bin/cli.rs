//! Remote signer CLI tool
//!
//! Pairs this machine with a remote signer app over a relay and asks it
//! to sign events on the user's behalf.

use clap::{Parser, Subcommand};
use remote_signer::{
    ConnectConfig, ConnectError, ConnectSession, FileStore, PairingState, UnsignedEvent,
    WebSocketRelay,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Remote signer: delegate event signing to an external signer app
#[derive(Parser)]
#[command(name = "remote-signer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.remote-signer/config.toml)
    #[arg(short, long, env = "REMOTE_SIGNER_CONFIG")]
    config: Option<PathBuf>,

    /// Path to key store (default: ~/.remote-signer/store.json)
    #[arg(short, long, env = "REMOTE_SIGNER_STORE")]
    store: Option<PathBuf>,

    /// Relay URL, overriding the config file
    #[arg(short, long)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display this client's public key
    Identity,

    /// Print the pairing URI to give to a signer app
    Uri,

    /// Wait for a signer app to pair
    Pair {
        /// Seconds to wait for approval
        #[arg(short, long, default_value = "300")]
        wait: u64,
    },

    /// Have the paired signer sign an event
    Sign {
        /// Event content
        content: String,

        /// Event kind
        #[arg(short, long, default_value = "1")]
        kind: u16,

        /// Tag as name=value (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// Check that the paired signer answers
    Ping,

    /// Ask the paired signer for the user's public key
    RemoteKey,

    /// Show pairing status
    Status,

    /// Forget the paired signer
    Disconnect,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("remote_signer=warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = load_config(cli.config, cli.relay);
    let store_path = cli
        .store
        .or_else(FileStore::default_path)
        .unwrap_or_else(|| exit_with("Could not find home directory"));
    let store = FileStore::open(&store_path)
        .unwrap_or_else(|e| exit_with(format!("Could not open {:?}: {}", store_path, e)));

    let relay = WebSocketRelay::new(config.relay_url.clone());
    let session = ConnectSession::new(config, Arc::new(store), Arc::new(relay));

    match cli.command {
        Commands::Identity => cmd_identity(&session),
        Commands::Uri => println!("{}", session.connection_uri()),
        Commands::Pair { wait } => cmd_pair(&session, Duration::from_secs(wait)).await,
        Commands::Sign {
            content,
            kind,
            tags,
        } => cmd_sign(&session, kind, content, &tags).await,
        Commands::Ping => cmd_ping(&session).await,
        Commands::RemoteKey => cmd_remote_key(&session).await,
        Commands::Status => cmd_status(&session),
        Commands::Disconnect => cmd_disconnect(&session).await,
    }

    session.close().await;
}

fn exit_with(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".remote-signer").join("config.toml"))
}

fn load_config(path: Option<PathBuf>, relay: Option<String>) -> ConnectConfig {
    let path = path.or_else(|| default_config_path().filter(|p| p.exists()));
    let mut config = match path {
        Some(path) => ConnectConfig::load(&path)
            .unwrap_or_else(|e| exit_with(format!("{} ({:?})", e, path))),
        None => ConnectConfig::default(),
    };

    if let Some(relay) = relay {
        config.relay_url = relay;
        config.validate().unwrap_or_else(|e| exit_with(e));
    }
    config
}

fn parse_tag(raw: &str) -> Vec<String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => vec![name.to_string(), value.to_string()],
        _ => exit_with(format!("Invalid tag {:?}, expected name=value", raw)),
    }
}

fn report(error: ConnectError) -> ! {
    match error {
        ConnectError::Unpaired => {
            eprintln!("No signer is paired.");
            eprintln!("Run 'remote-signer pair' first.");
            std::process::exit(1);
        }
        ConnectError::Timeout { .. } => exit_with("The signer did not answer in time"),
        other => exit_with(other),
    }
}

fn cmd_identity(session: &ConnectSession) {
    println!("Your public key:");
    println!("{}", session.public_key().to_hex());
}

async fn cmd_pair(session: &ConnectSession, wait: Duration) {
    if let Some(remote) = session.remote_signer() {
        println!("Already paired with {}", remote);
        println!("Run 'remote-signer disconnect' to pair with another signer.");
        return;
    }

    println!("Open this URI in your signer app:");
    println!();
    println!("{}", session.connection_uri());
    println!();

    session
        .begin_pairing()
        .await
        .unwrap_or_else(|e| exit_with(format!("Could not reach relay: {}", e)));
    println!("Waiting for approval...");

    let mut states = session.watch_state();
    match tokio::time::timeout(wait, states.wait_for(PairingState::is_connected)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => exit_with("Session closed while waiting"),
        Err(_) => exit_with("Timed out waiting for the signer"),
    }

    if let Some(remote) = session.remote_signer() {
        println!("Paired with {}", remote);
    }
}

async fn cmd_sign(session: &ConnectSession, kind: u16, content: String, tags: &[String]) {
    let tags = tags.iter().map(|raw| parse_tag(raw)).collect();
    let event = UnsignedEvent::new(kind, tags, content);

    println!("Waiting for the signer to approve...");
    let signed = session.sign_event(event).await.unwrap_or_else(|e| report(e));

    let json = serde_json::to_string_pretty(&signed)
        .unwrap_or_else(|e| exit_with(format!("Could not encode event: {}", e)));
    println!("{}", json);
}

async fn cmd_ping(session: &ConnectSession) {
    session.ping().await.unwrap_or_else(|e| report(e));
    println!("pong");
}

async fn cmd_remote_key(session: &ConnectSession) {
    let key = session.get_public_key().await.unwrap_or_else(|e| report(e));
    println!("{}", key.to_hex());
}

fn cmd_status(session: &ConnectSession) {
    println!("Public key: {}", session.public_key());
    println!("Relay:      {}", session.config().relay_url);
    println!("State:      {}", session.state());
    match session.remote_signer() {
        Some(remote) => println!("Signer:     {}", remote),
        None => println!("Signer:     none"),
    }
}

async fn cmd_disconnect(session: &ConnectSession) {
    let had_signer = session.remote_signer().is_some();
    session.disconnect().await;

    if had_signer {
        println!("Disconnected. Pair again with 'remote-signer pair'.");
    } else {
        println!("No signer was paired.");
    }
}
