//! socks5-bridge: local SOCKS5 proxy with a WebSocket bridge
//!
//! # Usage
//!
//! ```bash
//! # Listen on the defaults (127.0.0.1:1080), direct path only
//! socks5-bridge
//!
//! # Custom bind address and port with a configuration file
//! socks5-bridge -b 0.0.0.0 -p 1085 -c /etc/socks5-bridge/config.yaml
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use uuid::Uuid;

use socks5_bridge::bridge::transport::HeaderProvider;
use socks5_bridge::bridge::{BridgeReceiver, Transport, WsTransport, WsTransportConfig};
use socks5_bridge::config::{load_config, AppConfig};
use socks5_bridge::logging::init_logging;
use socks5_bridge::socks5::{
    HostAllowlist, SessionRegistry, Socks5Server, Socks5ServerConfig,
};

/// Command-line arguments
struct Args {
    /// Bind address
    bind_addr: IpAddr,
    /// Bind port
    bind_port: u16,
    /// Configuration file path
    config_path: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut bind_addr: IpAddr = "127.0.0.1".parse().expect("literal address");
        let mut bind_port: u16 = 1080;
        let mut config_path = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-b" | "--bind" => {
                    let Some(value) = args.next() else {
                        eprintln!("missing value for {arg}");
                        std::process::exit(1);
                    };
                    bind_addr = value.parse().unwrap_or_else(|_| {
                        eprintln!("invalid bind address: {value}");
                        std::process::exit(1);
                    });
                }
                "-p" | "--port" => {
                    let Some(value) = args.next() else {
                        eprintln!("missing value for {arg}");
                        std::process::exit(1);
                    };
                    bind_port = value.parse().unwrap_or_else(|_| {
                        eprintln!("invalid port: {value}");
                        std::process::exit(1);
                    });
                }
                "-c" | "--config" => {
                    let Some(value) = args.next() else {
                        eprintln!("missing value for {arg}");
                        std::process::exit(1);
                    };
                    config_path = Some(PathBuf::from(value));
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("socks5-bridge v{}", socks5_bridge::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            bind_addr,
            bind_port,
            config_path,
        }
    }
}

fn print_help() {
    println!(
        r"socks5-bridge v{}

Local SOCKS5 proxy with allowlist-based direct dialing and WebSocket
bridge multiplexing.

USAGE:
    socks5-bridge [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>      Bind address [default: 127.0.0.1]
    -p, --port <PORT>      Bind port [default: 1080]
    -c, --config <PATH>    YAML configuration file
    -h, --help             Print help
    -v, --version          Print version
",
        socks5_bridge::VERSION
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config_path {
        Some(path) => {
            load_config(path).with_context(|| format!("loading configuration {path:?}"))?
        }
        None => AppConfig::default(),
    };
    init_logging(&config.log).context("initializing logger")?;

    info!(version = socks5_bridge::VERSION, "socks5-bridge starting");

    let allowlist = Arc::new(HostAllowlist::new());
    allowlist.load(&config.allowlist);
    let registry = Arc::new(SessionRegistry::new());

    let mut server_config = Socks5ServerConfig {
        bind_addr: args.bind_addr,
        bind_port: args.bind_port,
        ..Socks5ServerConfig::default()
    };

    let transport: Option<Arc<dyn Transport>> = match &config.bridge {
        Some(bridge) => {
            let client_id = bridge
                .client_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            server_config.client_id = client_id.clone();
            server_config.server_type = bridge.server_type;

            let receiver = Arc::new(BridgeReceiver::new(client_id, Arc::clone(&registry)));
            let header_provider: Option<HeaderProvider> = if bridge.headers.is_empty() {
                None
            } else {
                let headers = bridge.headers.clone();
                Some(Arc::new(move || {
                    headers
                        .iter()
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect()
                }))
            };

            let transport = WsTransport::connect(
                WsTransportConfig::new(&bridge.url),
                header_provider,
                receiver,
            )
            .await
            .context("connecting bridge transport")?;
            Some(transport as Arc<dyn Transport>)
        }
        None => {
            info!("no bridge configured; only allowlisted destinations are reachable");
            None
        }
    };

    let server = Socks5Server::bind(server_config, allowlist, registry, transport)
        .await
        .context("binding SOCKS5 listener")?;

    tokio::select! {
        () = server.serve() => {}
        result = signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("shutdown signal received");
        }
    }

    server.shutdown().await;
    info!("socks5-bridge stopped");
    Ok(())
}
