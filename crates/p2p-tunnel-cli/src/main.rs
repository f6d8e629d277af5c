//! p2ptun: expose and reach TCP services over peer-to-peer streams.
//!
//! The `loopback` command wires two peers on an in-memory network: the
//! serving peer exposes each target under its protocol name, and the client
//! peer binds a local port that tunnels to it.

mod config;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use config::{ConfigFile, LoopbackEntry};
use p2p_tunnel::{Listener, ListenerInfo, SessionInfo, TunnelConfig, TunnelManager};
use p2p_tunnel_core::{parse_multiaddr, MemoryNetwork, TunnelError};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// p2ptun: application-protocol tunnels over peer-to-peer streams
#[derive(Parser, Debug)]
#[command(name = "p2ptun", version, about = "Application-protocol tunnels over peer-to-peer streams")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.p2ptun/config.toml")]
    config: String,

    /// Peer dial timeout in seconds
    #[arg(long, global = true)]
    dial_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run tunnels between two in-memory peers
    Loopback(LoopbackArgs),
    /// Print the resolved configuration
    CheckConfig,
}

#[derive(Args, Debug)]
struct LoopbackArgs {
    /// Protocol name (e.g. /x/ssh)
    #[arg(long, requires_all = ["target", "listen"])]
    protocol: Option<String>,

    /// Local service exposed by the serving peer (e.g. /ip4/127.0.0.1/tcp/22)
    #[arg(long)]
    target: Option<String>,

    /// Local address bound by the client peer (e.g. /ip4/127.0.0.1/tcp/2222)
    #[arg(long)]
    listen: Option<String>,

    /// Print listeners and sessions every N seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    status_interval: u64,

    /// Print status as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ConfigFile::load(Some(&config_path), cli.dial_timeout) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Loopback(args) => run_loopback(config, args).await,
        Command::CheckConfig => check_config(&config),
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "p2ptun failed");
        // Listener construction failures get their own exit code.
        let code = match e.downcast_ref::<TunnelError>() {
            Some(err) if err.is_construction() => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

fn check_config(config: &ConfigFile) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(config).context("rendering config")?;
    print!("{rendered}");
    Ok(())
}

async fn run_loopback(config: ConfigFile, args: LoopbackArgs) -> anyhow::Result<()> {
    let entries = match (&args.protocol, &args.target, &args.listen) {
        (Some(protocol), Some(target), Some(listen)) => vec![LoopbackEntry {
            protocol: protocol.clone(),
            target: target.clone(),
            listen: listen.clone(),
        }],
        _ => config.loopback.clone(),
    };
    if entries.is_empty() {
        bail!("no tunnels configured: pass --protocol/--target/--listen or add [[loopback]] entries");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnels = entries.len(),
        "starting p2ptun loopback"
    );

    let net = MemoryNetwork::new();
    let server = new_node(&net, &config.tunnel)?;
    let client = new_node(&net, &config.tunnel)?;
    info!(server = %server.identity(), client = %client.identity(), "peers ready");

    for entry in &entries {
        if let Err(e) = open_tunnel(&server, &client, entry).await {
            client.shutdown().await;
            server.shutdown().await;
            return Err(e);
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
            _ = ticker.tick(), if args.status_interval > 0 => {
                if let Err(e) = print_status(&server, &client, args.json).await {
                    warn!(error = %e, "failed to print status");
                }
            }
        }
    }

    client.shutdown().await;
    server.shutdown().await;
    info!("p2ptun stopped");
    Ok(())
}

fn new_node(net: &MemoryNetwork, tunnel: &TunnelConfig) -> anyhow::Result<TunnelManager> {
    let host = net.add_peer();
    let manager = TunnelManager::new(host.clone(), host.address_book(), tunnel.clone())?;
    Ok(manager)
}

async fn open_tunnel(
    server: &TunnelManager,
    client: &TunnelManager,
    entry: &LoopbackEntry,
) -> anyhow::Result<()> {
    let target = parse_multiaddr(&entry.target)
        .with_context(|| format!("bad target for {}", entry.protocol))?;
    let listen = parse_multiaddr(&entry.listen)
        .with_context(|| format!("bad listen address for {}", entry.protocol))?;

    server
        .new_inbound_listener(&entry.protocol, target.clone())
        .await
        .with_context(|| format!("exposing {} as {}", entry.target, entry.protocol))?;
    let listener = client
        .new_outbound_listener(&entry.protocol, server.identity(), listen)
        .await
        .with_context(|| format!("binding {} for {}", entry.listen, entry.protocol))?;

    if let Listener::Outbound(outbound) = &listener {
        info!(
            protocol = %entry.protocol,
            listen = %outbound.bound_addr(),
            target = %target,
            "tunnel ready"
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct NodeStatus {
    role: &'static str,
    peer: String,
    listeners: Vec<ListenerInfo>,
    sessions: Vec<SessionInfo>,
}

async fn node_status(role: &'static str, manager: &TunnelManager) -> NodeStatus {
    NodeStatus {
        role,
        peer: manager.identity().to_string(),
        listeners: manager.list_listeners().await,
        sessions: manager.list_sessions().await,
    }
}

async fn print_status(
    server: &TunnelManager,
    client: &TunnelManager,
    json: bool,
) -> anyhow::Result<()> {
    let nodes = [
        node_status("server", server).await,
        node_status("client", client).await,
    ];

    if json {
        println!("{}", serde_json::to_string(&nodes)?);
        return Ok(());
    }

    for node in &nodes {
        println!("{} {}", node.role, node.peer);
        for l in &node.listeners {
            println!("  {:<8} {:<20} {}", l.direction, l.protocol, l.address);
        }
        for s in &node.sessions {
            println!(
                "  session {:<4} {:<20} out={} in={} age={}s",
                s.id, s.protocol, s.bytes_out, s.bytes_in, s.age_secs
            );
        }
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
