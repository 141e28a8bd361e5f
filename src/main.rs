//! Huddle - Matchmaking and Self-Managed Leader Election
//!
//! Runs either the matchmaker or a session client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use huddle::config::HuddleConfig;
use huddle::api::HttpServer;
use huddle::network::{NetworkClient, NetworkServer};
use huddle::peer::{HeartbeatConfig, PeerNode};
use huddle::registry::{FormationPolicy, SessionRegistry};
use huddle::error::Result;

/// Huddle - Matchmaking and Self-Managed Leader Election
#[derive(Parser)]
#[command(name = "huddle")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "huddle.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the matchmaker
    Matchmaker,

    /// Run a session client
    Client {
        /// Client ID (overrides the config file)
        #[arg(long)]
        id: Option<String>,

        /// Address to listen on for session traffic (overrides the config file)
        #[arg(long)]
        bind: Option<String>,

        /// Matchmaker address (overrides the config file)
        #[arg(long)]
        matchmaker: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "huddle.toml")]
        output: PathBuf,

        /// Client ID
        #[arg(long, default_value = "client-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Matchmaker => {
            let config = HuddleConfig::from_file(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level), &config.logging.format);
            run_matchmaker(config).await
        }
        Commands::Client { id, bind, matchmaker } => {
            let mut config = HuddleConfig::from_file(&cli.config)?;
            if id.is_some() {
                config.node.id = id;
            }
            if let Some(bind) = bind {
                config.node.bind_address = bind;
            }
            if let Some(matchmaker) = matchmaker {
                config.matchmaker.address = matchmaker;
            }
            config.validate()?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level), &config.logging.format);
            run_client(config).await
        }
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the matchmaker
async fn run_matchmaker(config: HuddleConfig) -> Result<()> {
    tracing::info!(
        "Starting matchmaker on {} (window {}ms, partition {:?}, late registration {:?})",
        config.matchmaker.bind_address,
        config.matchmaker.formation_window_ms,
        config.matchmaker.partition,
        config.matchmaker.late_registration
    );

    let transport = Arc::new(NetworkClient::new(
        Duration::from_secs(2),   // connect timeout
        Duration::from_secs(5),   // request timeout
    ));
    let registry = Arc::new(SessionRegistry::new(
        FormationPolicy::from(&config.matchmaker),
        transport,
    ));

    // Every registry message is answered in place, nothing reaches this channel
    let (incoming_tx, _incoming_rx) = tokio::sync::mpsc::channel(16);
    let mut network_server = NetworkServer::new(config.matchmaker.bind_address.clone(), incoming_tx);
    network_server.set_handler(registry.handler());
    let listener = network_server.bind().await?;
    let network_server = Arc::new(network_server);

    let server = Arc::clone(&network_server);
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("Network server error: {}", e);
        }
    });

    if config.api.enabled {
        let http_server = HttpServer::for_registry(config.api.clone(), Arc::clone(&registry));
        tokio::spawn(async move {
            if let Err(e) = http_server.start().await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    tokio::select! {
        result = registry.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            registry.stop();
        }
    }

    network_server.stop();
    tracing::info!("Matchmaker stopped");
    Ok(())
}

/// Run a session client
async fn run_client(config: HuddleConfig) -> Result<()> {
    let client_id = config.client_id();
    let address = config.advertise_address().to_string();
    tracing::info!("Starting client {} on {}", client_id, address);

    // Heartbeat sends must give up before the next one is due
    let transport = Arc::new(
        NetworkClient::new(
            Duration::from_secs(2),   // connect timeout
            Duration::from_secs(5),   // request timeout
        )
        .with_send_timeout(config.session.heartbeat_interval()),
    );
    let node = Arc::new(PeerNode::new(
        client_id,
        address,
        HeartbeatConfig::from(&config.session),
        config.session.tick(),
        transport,
    ));

    let (incoming_tx, incoming_rx) = tokio::sync::mpsc::channel(1024);
    let mut network_server = NetworkServer::new(config.node.bind_address.clone(), incoming_tx);
    network_server.set_handler(node.handler());
    let listener = network_server.bind().await?;
    let network_server = Arc::new(network_server);

    let server = Arc::clone(&network_server);
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("Network server error: {}", e);
        }
    });

    if config.api.enabled {
        let http_server = HttpServer::for_peer(config.api.clone(), Arc::clone(&node));
        tokio::spawn(async move {
            if let Err(e) = http_server.start().await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let runner = Arc::clone(&node);
    let mut run_handle = tokio::spawn(async move { runner.run(incoming_rx).await });

    if let Err(e) = node
        .register(&config.matchmaker.address, config.node.register_attempts, config.register_retry())
        .await
    {
        tracing::error!("Registration failed: {}", e);
        node.stop();
        network_server.stop();
        return Err(e);
    }

    tokio::select! {
        result = &mut run_handle => {
            if let Ok(Err(e)) = result {
                tracing::error!("Client error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            node.stop();
        }
    }

    network_server.stop();
    tracing::info!("Client stopped");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# Huddle Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "127.0.0.1:7700"
# advertise_address = "my-public-ip:7700"
register_retry_ms = 1000
register_attempts = 30

[matchmaker]
address = "127.0.0.1:4421"
bind_address = "0.0.0.0:4421"
formation_window_ms = 10000
window_anchor = "startup"          # or "first_registration"
min_session_size = 2
# max_session_size = 8
partition = "all_pending"          # or "fixed_size" (requires max_session_size)
late_registration = "defer"        # or "reject"

[session]
heartbeat_interval_ms = 500
timeout_multiplier = 3
# grace_ms = 3000
# tick_ms = 100

[api]
enabled = true
bind_address = "127.0.0.1:8080"

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart the matchmaker with: huddle --config {} matchmaker", output.display());
    println!("Then start clients with:   huddle --config {} client --id <id> --bind <addr>", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match HuddleConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Client ID: {}", config.node.id.as_deref().unwrap_or("(generated)"));
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Matchmaker: {}", config.matchmaker.address);
            println!("  Formation Window: {}ms", config.matchmaker.formation_window_ms);
            println!("  Partition: {:?}", config.matchmaker.partition);
            println!("  Late Registration: {:?}", config.matchmaker.late_registration);
            println!("  Heartbeat Interval: {}ms", config.session.heartbeat_interval_ms);
            println!("  Leader Timeout: {}ms", config.session.leader_timeout().as_millis());
            println!("  Successor Grace: {}ms", config.session.grace().as_millis());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
