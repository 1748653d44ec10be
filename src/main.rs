//! pcast - PCast signaling client

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pcast::network::{EndpointDiscovery, EndpointResolver, Resolution};
use pcast::{ClientConfig, SessionClient, SessionEvent};

#[derive(Parser)]
#[command(name = "pcast")]
#[command(about = "Signaling client for the PCast real-time media platform")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "PCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Discovery service base URI, overrides the configuration file
    #[arg(long, global = true, env = "PCAST_DISCOVERY_URI")]
    discovery_uri: Option<String>,

    /// Signaling endpoint (repeatable), overrides discovery
    #[arg(short, long = "endpoint", global = true)]
    endpoints: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the endpoints offered by the discovery service
    Endpoints,

    /// Probe the candidate endpoints and pick the closest one
    Resolve {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a session and keep it online until Ctrl+C
    Connect {
        /// Authentication token
        #[arg(short, long, env = "PCAST_AUTH_TOKEN")]
        token: Option<String>,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(uri) = &cli.discovery_uri {
        config.discovery_uri = Some(uri.clone());
    }
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn candidate_endpoints(config: &ClientConfig) -> Result<Vec<String>> {
    if !config.endpoints.is_empty() {
        return Ok(config.endpoints.clone());
    }
    let Some(uri) = config.discovery_uri.as_deref() else {
        bail!("No discovery URI or endpoint configured");
    };
    let discovery = EndpointDiscovery::new(uri, config.transport.request_timeout())?;
    Ok(discovery.fetch().await?)
}

async fn list_endpoints(config: &ClientConfig) -> Result<()> {
    let endpoints = candidate_endpoints(config).await?;
    if endpoints.is_empty() {
        println!("No endpoints available");
        return Ok(());
    }

    println!("Endpoints:");
    for endpoint in endpoints {
        println!("  - {}", endpoint);
    }
    Ok(())
}

fn print_resolution(resolution: &Resolution) {
    println!("Selected: {} ({:.1}ms)", resolution.endpoint, ms(resolution.latency));
    println!();
    println!("Candidates:");
    for candidate in &resolution.candidates {
        match candidate.min_latency {
            Some(latency) => println!("  {:<40} {:>8.1}ms", candidate.address, ms(latency)),
            None => println!("  {:<40} {:>10}", candidate.address, "unreachable"),
        }
    }
}

fn ms(duration: std::time::Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

async fn run_resolve(config: &ClientConfig, json: bool) -> Result<()> {
    let endpoints = candidate_endpoints(config).await?;
    info!("Probing {} endpoint(s)", endpoints.len());

    let resolver = EndpointResolver::new(config.resolver.clone());
    let resolution = resolver.resolve(&endpoints).await?;

    if json {
        let candidates: Vec<_> = resolution
            .candidates
            .iter()
            .map(|c| {
                serde_json::json!({
                    "address": c.address,
                    "min_latency_ms": c.min_latency.map(ms),
                })
            })
            .collect();
        let output = serde_json::json!({
            "endpoint": resolution.endpoint,
            "latency_ms": ms(resolution.latency),
            "candidates": candidates,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_resolution(&resolution);
    }
    Ok(())
}

async fn run_connect(config: ClientConfig, token: Option<String>) -> Result<()> {
    let Some(token) = token.or_else(|| config.authentication_token.clone()) else {
        bail!("No authentication token given (use --token or PCAST_AUTH_TOKEN)");
    };

    let client = SessionClient::new(config);
    let mut events = client.events();

    let session_id = client.start(&token).await?;
    println!("Session online: {}", session_id);
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Offline { reason }) => {
                    warn!("Session went offline: {}", reason);
                    break;
                }
                Ok(SessionEvent::Room(event)) => {
                    info!("Room {}: {:?} ({} member(s))", event.room_id, event.event_type, event.members.len());
                }
                Ok(event) => info!("{:?}", event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} session event(s)", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.stop().await;
    println!("Session stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Endpoints => list_endpoints(&config).await?,
        Commands::Resolve { json } => run_resolve(&config, json).await?,
        Commands::Connect { token } => run_connect(config, token).await?,
    }

    Ok(())
}
