//! UDP Tunnel CLI - Carry UDP services across TCP-only hops

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use udp_tunnel_lib::{
    parse_target, start_tcp_fronted_proxy_with_config, start_udp_fronted_proxy_with_config,
    Endpoint, ProxyConfig, ProxyRegistry,
};

/// UDP Tunnel - Forward UDP datagrams over TCP connections
#[derive(Parser, Debug)]
#[command(name = "udp-tunnel")]
#[command(about = "Forward UDP datagrams over TCP connections", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Print the open proxies as JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    proxy: ProxyArgs,
}

#[derive(Args, Debug)]
struct ProxyArgs {
    /// Address listening sockets bind to
    #[arg(long, env = "UDP_TUNNEL_BIND_HOST", default_value = "127.0.0.1", global = true)]
    bind_host: IpAddr,

    /// Seconds without traffic before a peer's connection is closed
    #[arg(long, env = "UDP_TUNNEL_IDLE_TIMEOUT_SECS", default_value = "300", global = true)]
    idle_timeout_secs: u64,

    /// Seconds between idle peer sweeps
    #[arg(long, env = "UDP_TUNNEL_SWEEP_INTERVAL_SECS", default_value = "60", global = true)]
    sweep_interval_secs: u64,

    /// Ports tried upwards from the requested one when it is taken
    #[arg(long, env = "UDP_TUNNEL_PORT_ATTEMPTS", default_value = "20", global = true)]
    port_attempts: u16,

    /// Datagrams that may queue per peer before new ones are dropped
    #[arg(long, env = "UDP_TUNNEL_PEER_QUEUE_DEPTH", default_value = "1024", global = true)]
    peer_queue_depth: usize,
}

impl ProxyArgs {
    fn to_config(&self) -> ProxyConfig {
        ProxyConfig::default()
            .with_bind_host(self.bind_host)
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs.max(1)))
            .with_port_attempts(self.port_attempts)
            .with_peer_queue_depth(self.peer_queue_depth)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen on UDP and forward each sender over its own TCP connection
    Listen {
        /// UDP port to listen on (the next free port is used if taken)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Local TCP port to forward to
        #[arg(short, long)]
        target_tcp_port: u16,
    },

    /// Listen on TCP and deliver framed datagrams to UDP targets
    #[command(long_about = r#"
Start one TCP-fronted proxy per target. Each accepted TCP connection gets its
own UDP socket connected to the target.

TARGETS:
  3000                  port 3000 on 127.0.0.1
  10.0.0.2:53           port 53 on 10.0.0.2
  2001,2002             a list of ports
  2001-2003             an inclusive range
  2001x3                three ports starting at 2001
    "#)]
    Forward {
        /// Target expression ([host:]ports)
        target: String,
    },

    /// Expose UDP targets on local UDP ports through a TCP hop
    Bridge {
        /// Target expression ([host:]ports)
        target: String,

        /// First UDP port to listen on (the next free port is used if taken)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = cli.proxy.to_config();
    let registry = ProxyRegistry::new();

    match cli.command {
        Commands::Listen {
            port,
            target_tcp_port,
        } => {
            let proxy = start_udp_fronted_proxy_with_config(port, target_tcp_port, config)
                .await
                .context("Failed to start UDP proxy")?;
            registry.insert(proxy);
        }
        Commands::Forward { target } => {
            let targets = parse_target(&target).context("Invalid target")?;
            for target in targets {
                let proxy = start_tcp_fronted_proxy_with_config(target.clone(), config.clone())
                    .await
                    .with_context(|| format!("Failed to start TCP proxy for {}", target))?;
                registry.insert(proxy);
            }
        }
        Commands::Bridge { target, port } => {
            let targets = parse_target(&target).context("Invalid target")?;
            let mut next_port = port;
            for target in targets {
                let bound = start_bridge(&registry, target, next_port, &config).await?;
                if port != 0 {
                    next_port = bound.checked_add(1).context("Ran out of UDP ports")?;
                }
            }
        }
    }

    print_summaries(&registry, cli.json)?;

    if registry.is_empty() {
        warn!("No proxies started");
        return Ok(());
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Shutting down {} proxies...", registry.len());

    registry.shutdown().await;
    info!("All proxies stopped");
    Ok(())
}

/// Chain a TCP-fronted proxy to `target` behind a UDP-fronted proxy on `port`.
///
/// Returns the UDP port actually bound.
async fn start_bridge(
    registry: &ProxyRegistry,
    target: Endpoint,
    port: u16,
    config: &ProxyConfig,
) -> Result<u16> {
    let exit = start_tcp_fronted_proxy_with_config(target.clone(), config.clone())
        .await
        .with_context(|| format!("Failed to start TCP proxy for {}", target))?;
    let entry = start_udp_fronted_proxy_with_config(port, exit.listen_port(), config.clone())
        .await
        .with_context(|| format!("Failed to start UDP proxy for {}", target))?;

    let bound = entry.listen_port();
    info!("UDP port {} reaches {} through TCP port {}", bound, target, exit.listen_port());

    registry.insert(exit);
    registry.insert(entry);
    Ok(bound)
}

fn print_summaries(registry: &ProxyRegistry, json: bool) -> Result<()> {
    let summaries = registry.summaries();

    if json {
        let output =
            serde_json::to_string_pretty(&summaries).context("Failed to serialize proxies")?;
        println!("{}", output);
        return Ok(());
    }

    for summary in &summaries {
        println!("{}", summary.label);
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
