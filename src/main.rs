//! tunnel-http
//!
//! Keeps a WireGuard peer reachable under hostile DNS and hands the tunnel to
//! an HTTP/SOCKS5 proxy.
//!
//! Usage:
//!   tunnel-http --client-ip 10.0.0.2 --private-key <KEY> \
//!       --peer-endpoint vpn.example.com:51820 --peer-key <KEY> \
//!       --resolve-dns tls://9.9.9.9
//!   tunnel-http -c ~/.config/tunnel-http/config.toml
//!   tunnel-http stats

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tunnel_http::app;
use tunnel_http::config::{load_settings, parse_interval, ExitMode, Settings};

#[derive(Parser)]
#[command(name = "tunnel-http")]
#[command(version)]
#[command(about = "WireGuard client bridged to an HTTP/SOCKS5 proxy")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Tunnel address(es), comma separated or repeated
    #[arg(long, env = "CLIENT_IP", value_delimiter = ',')]
    client_ip: Vec<IpAddr>,

    /// Local UDP port of the tunnel (random when unset)
    #[arg(long, env = "CLIENT_PORT")]
    client_port: Option<u16>,

    /// Private key (base64)
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Resolver for proxy clients: "", 1.1.1.1, tcp://, tls://, https://
    #[arg(long, env = "DNS")]
    dns: Option<String>,

    /// MTU of the user-space network (576-1500, default 1280)
    #[arg(long, env = "MTU")]
    mtu: Option<u16>,

    /// Peer endpoint (host:port)
    #[arg(long, env = "PEER_ENDPOINT")]
    peer_endpoint: Option<String>,

    /// Peer public key (base64)
    #[arg(long, env = "PEER_KEY")]
    peer_key: Option<String>,

    /// Preshared key (base64)
    #[arg(long, env = "PRESHARED_KEY", hide_env_values = true)]
    preshared_key: Option<String>,

    /// Persistent keepalive, seconds or duration (0 disables)
    #[arg(long, env = "KEEPALIVE_INTERVAL", value_parser = parse_interval)]
    keepalive_interval: Option<Duration>,

    /// Resolver for the peer endpoint: "", 1.1.1.1, tcp://, tls://, https://
    #[arg(long, env = "RESOLVE_DNS")]
    resolve_dns: Option<String>,

    /// Peer endpoint refresh interval (default 1m, 0 disables)
    #[arg(long, env = "RESOLVE_INTERVAL", value_parser = parse_interval)]
    resolve_interval: Option<Duration>,

    /// HTTP and SOCKS5 listen address (default localhost:8080)
    #[arg(long, env = "LISTEN")]
    listen: Option<String>,

    /// Where proxied traffic leaves (default remote)
    #[arg(long, env = "EXIT_MODE", value_enum)]
    exit_mode: Option<ExitMode>,

    /// Reserved header bytes (base64, 3 bytes)
    #[arg(long, env = "CLIENT_ID", hide = true)]
    client_id: Option<String>,

    /// Configure an external device over its UAPI socket instead of the built-in engine
    #[arg(long, env = "UAPI_SOCKET")]
    uapi_socket: Option<PathBuf>,

    /// Path to TOML config file
    #[arg(short, long, conflicts_with = "default_config")]
    config: Option<PathBuf>,

    /// Load config from default location (~/.config/tunnel-http/config.toml)
    #[arg(long)]
    default_config: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print the device stats snapshot as JSON
    Stats,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            client_ip: self.client_ip.clone(),
            client_port: self.client_port,
            private_key: self.private_key.clone(),
            dns: self.dns.clone(),
            mtu: self.mtu,
            peer_endpoint: self.peer_endpoint.clone(),
            peer_key: self.peer_key.clone(),
            preshared_key: self.preshared_key.clone(),
            keepalive_interval: self.keepalive_interval,
            resolve_dns: self.resolve_dns.clone(),
            resolve_interval: self.resolve_interval,
            listen: self.listen.clone(),
            exit_mode: self.exit_mode,
            client_id: self.client_id.clone(),
            uapi_socket: self.uapi_socket.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .filter_module("tunnel_http", level)
        .filter_module("tunnel_dns", level)
        .filter_module("tunnel_wg", level)
        .try_init();

    let file = if args.default_config {
        load_settings(None)?
    } else if let Some(path) = args.config.as_deref() {
        load_settings(Some(path))?
    } else {
        Settings::default()
    };
    let settings = args.settings().merge(file);

    match args.command {
        Some(Command::Stats) => app::print_stats(&settings.uapi_socket_path()).await,
        None => app::run(settings.validate()?).await,
    }
}
