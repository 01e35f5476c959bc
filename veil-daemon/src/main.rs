#![forbid(unsafe_code)]

//! Tunnel daemon entry point.
//!
//! Loads the TOML configuration, wires the static key schedule and the
//! device bridge, and runs either the client or the server dataplane until
//! SIGINT. Interface creation, addressing and routing are the platform
//! integration's job; this process only ever exchanges packets with it over
//! the configured device socket.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use veil_core::config::TunnelConfig;

fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "veil.toml".to_string());
    let cfg = TunnelConfig::from_file(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    init_tracing(cfg.log_level.as_deref());
    run(cfg).await
}

#[cfg(unix)]
async fn run(cfg: TunnelConfig) -> Result<()> {
    use std::sync::Arc;

    use anyhow::bail;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    use veil_core::config::{parse_key_hex, ConnectionSettings, Mode, Protocol};
    use veil_tunnel::device::UnixSocketTun;
    use veil_tunnel::{run_client, run_server, PresharedEstablisher};

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let socket_path = cfg
        .device_socket
        .as_deref()
        .context("device_socket must be configured")?;
    let device = UnixSocketTun::connect(std::path::Path::new(socket_path))
        .await
        .with_context(|| format!("connecting device socket {socket_path}"))?;
    let device = Arc::new(device);

    match cfg.mode {
        Mode::Client => {
            let settings = ConnectionSettings::for_client(&cfg.client)?;
            let secret = cfg
                .client
                .preshared_secret
                .as_deref()
                .context("client.preshared_secret must be configured")?;
            let establisher = Arc::new(PresharedEstablisher::new(
                parse_key_hex(secret)?,
                settings.subnet,
                cfg.client.client_counter,
            ));
            info!(protocol = %settings.protocol, server = %settings.server_host, "starting client dataplane");
            run_client(settings, cfg.client.rekey.clone(), device, establisher, cancel).await?;
        }
        Mode::Server => {
            let subnet = if cfg.server.enable_udp {
                ConnectionSettings::for_server(&cfg.server, Protocol::Udp)?.subnet
            } else if cfg.server.enable_tcp {
                ConnectionSettings::for_server(&cfg.server, Protocol::Tcp)?.subnet
            } else {
                bail!("no transport enabled");
            };
            let secret = cfg
                .server
                .preshared_secret
                .as_deref()
                .context("server.preshared_secret must be configured")?;
            let establisher = Arc::new(PresharedEstablisher::new(
                parse_key_hex(secret)?,
                subnet,
                cfg.server.client_counter_start,
            ));
            info!("starting server dataplane");
            run_server(&cfg.server, device, establisher, cancel).await?;
        }
    }
    warn!("dataplane stopped");
    Ok(())
}

#[cfg(not(unix))]
async fn run(_cfg: TunnelConfig) -> Result<()> {
    anyhow::bail!("the daemon's device bridge requires a unix platform")
}
