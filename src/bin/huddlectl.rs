//! HuddleCtl - Command line tool for inspecting Huddle clients and matchmakers
//!
//! Usage:
//!   huddlectl status      - Show a client's role and session
//!   huddlectl history     - Replay a client's role transitions
//!   huddlectl pending     - List clients waiting at the matchmaker
//!   huddlectl sessions    - List sessions the matchmaker formed

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use huddle::api::{HistoryResponse, PendingResponse};
use huddle::config::HuddleConfig;
use huddle::peer::PeerStatus;
use huddle::protocol::Role;
use huddle::registry::FormedSession;

/// Huddle Control Tool
#[derive(Parser)]
#[command(name = "huddlectl")]
#[command(about = "Inspect Huddle clients and matchmakers", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "huddle.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a client's role and session
    Status,
    /// Replay a client's role transitions and check for reversion
    History,
    /// List clients waiting for a session
    Pending,
    /// List formed sessions
    Sessions,
    /// Check configuration file for errors
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli.endpoint.clone().unwrap_or_else(|| endpoint_from_config(&cli.config));

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint, cli.json).await,
        Commands::History => show_history(&endpoint, cli.json).await,
        Commands::Pending => show_pending(&endpoint, cli.json).await,
        Commands::Sessions => show_sessions(&endpoint, cli.json).await,
        Commands::CheckConfig => check_config(&cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the config file, falling back to the default port
fn endpoint_from_config(path: &Path) -> String {
    let bind = HuddleConfig::from_file(path)
        .map(|config| config.api.bind_address)
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    // A wildcard bind is reachable on loopback
    match bind.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", bind),
    }
}

async fn fetch<T: serde::de::DeserializeOwned>(endpoint: &str, path: &str) -> Result<T> {
    let url = format!("{}{}", endpoint, path);
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    response
        .json()
        .await
        .with_context(|| format!("unexpected response from {}", url))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn role_label(role: Option<Role>) -> String {
    match role {
        Some(Role::Leader) => format!("\x1b[1;34m{}\x1b[0m", Role::Leader),  // Bold Blue
        Some(Role::Node) => Role::Node.to_string(),
        None => "UNASSIGNED".to_string(),
    }
}

// ============ Commands ============

async fn show_status(endpoint: &str, json: bool) -> Result<()> {
    let status: PeerStatus = fetch(endpoint, "/status").await?;
    if json {
        return print_json(&status);
    }

    println!();
    println!("Client Status");
    println!("=============");
    println!();
    println!("Client ID:  {}", status.client_id);
    println!("Role:       {}", role_label(status.role));

    let Some(session_id) = status.session_id else {
        println!("Session:    (waiting for assignment)");
        println!();
        return Ok(());
    };

    println!("Session:    {}", session_id);
    if let Some(rank) = status.rank {
        println!("Rank:       {}", rank);
    }
    if let Some(leader) = &status.leader_id {
        println!("Leader:     {}", leader);
    }
    if let Some(epoch) = status.epoch {
        println!("Epoch:      {}", epoch);
    }
    let alive: Vec<&str> = status.alive.iter().map(|id| id.as_str()).collect();
    println!("Alive:      {}", alive.join(", "));
    if status.torn_down {
        println!("State:      \x1b[31mTORN DOWN\x1b[0m");
    }
    println!();

    Ok(())
}

async fn show_history(endpoint: &str, json: bool) -> Result<()> {
    let history: HistoryResponse = fetch(endpoint, "/history").await?;
    if json {
        print_json(&history)?;
        if history.reverted {
            bail!("{} reverted from leader to node", history.client_id);
        }
        return Ok(());
    }

    println!();
    println!("Role History for {}", history.client_id);
    println!("{}", "=".repeat(17 + history.client_id.as_str().len()));
    println!();
    println!("{:<5} {:<32} {:<8} {:<20} {}", "SEQ", "TIME", "EPOCH", "LEADER", "EVENT");
    println!("{}", "-".repeat(80));

    for entry in &history.entries {
        println!(
            "{:<5} {:<32} {:<8} {:<20} {}",
            entry.seq,
            entry.at.to_rfc3339(),
            entry.epoch,
            entry.leader_id,
            entry.marker()
        );
    }
    println!();

    match &history.became_leader {
        Some(first) => println!("First became leader at {} (epoch {})", first.at.to_rfc3339(), first.epoch),
        None => println!("Never became leader"),
    }

    if history.reverted {
        bail!("{} reverted from leader to node", history.client_id);
    }
    println!("No reversion");
    println!();

    Ok(())
}

async fn show_pending(endpoint: &str, json: bool) -> Result<()> {
    let pending: PendingResponse = fetch(endpoint, "/pending").await?;
    if json {
        return print_json(&pending);
    }

    println!();
    println!("Pending Clients: {}{}", pending.count, if pending.closed { "  (registry closed)" } else { "" });
    println!();
    println!("{:<5} {:<24} {:<25} {}", "#", "CLIENT ID", "ADDRESS", "REGISTERED");
    println!("{}", "-".repeat(80));
    for (position, client) in pending.clients.iter().enumerate() {
        println!(
            "{:<5} {:<24} {:<25} {}",
            position,
            client.id,
            client.address,
            client.registered_at.to_rfc3339()
        );
    }
    println!();

    Ok(())
}

async fn show_sessions(endpoint: &str, json: bool) -> Result<()> {
    let sessions: Vec<FormedSession> = fetch(endpoint, "/sessions").await?;
    if json {
        return print_json(&sessions);
    }

    println!();
    println!("Formed Sessions: {}", sessions.len());

    for session in &sessions {
        println!();
        println!("Session {} (formed {}, initial leader {})", session.session_id, session.formed_at.to_rfc3339(), session.leader_id);
        println!("{:<6} {:<24} {:<25} {}", "RANK", "CLIENT ID", "ADDRESS", "DELIVERED");
        println!("{}", "-".repeat(66));
        for member in &session.members {
            let delivered = if session.unreachable.contains(&member.id) {
                "\x1b[31mno\x1b[0m"
            } else {
                "yes"
            };
            println!("{:<6} {:<24} {:<25} {}", member.rank, member.id, member.address, delivered);
        }
    }
    println!();

    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = HuddleConfig::from_file(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    println!("✓ Configuration is valid: {}", path.display());
    println!("  Matchmaker: {}", config.matchmaker.address);
    println!(
        "  Leader timeout: {}ms (k = {}, I = {}ms)",
        config.session.leader_timeout().as_millis(),
        config.session.timeout_multiplier,
        config.session.heartbeat_interval_ms
    );
    Ok(())
}
