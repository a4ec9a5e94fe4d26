//! meshtris launcher.
//!
//! Usage: `meshtris [host [port]]` — with no arguments the peer binds the
//! local machine's address and an ephemeral port. The peer then runs until
//! the user opts out of the matchmaking pool (exit 0) or the process is
//! interrupted; startup failures exit non-zero.

use std::net::SocketAddr;

use tracing::info;

use meshtris::config::{DiscoveryConfig, PeerConfig};
use meshtris::console::Console;
use meshtris::discovery::Discovery;
use meshtris::error::Error;
use meshtris::peer::Peer;
use meshtris::rpc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let host = match args.get(1) {
        Some(host) => host.clone(),
        None => default_host().await,
    };
    let port = match args.get(2) {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port '{raw}'")))?,
        None => free_port()?,
    };
    let id = format!("{host}:{port}");

    let discovery = Discovery::spawn(&id, DiscoveryConfig::from_env()).await?;
    let peer = Peer::new(
        id.clone(),
        discovery.view(),
        Console::stdin(),
        PeerConfig::from_env(),
    );
    let server = rpc::publish(peer.clone(), SocketAddr::from(([0, 0, 0, 0], port))).await?;
    peer.clone().run();

    println!("Peer running at {id}");
    println!("Auto-discovery active: the peer pairs up as soon as it finds a free opponent.");
    println!("Start more peers with: meshtris [host] [port]");

    let mut shutdown = peer.shutdown_signal();
    tokio::select! {
        _ = shutdown.changed() => info!("shutting down after opt-out"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    discovery.close();
    server.close();
    Ok(())
}

/// Ephemeral port pick: bind port 0, read the assignment, release.
fn free_port() -> Result<u16, std::io::Error> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

/// The local machine's address: the hostname's first IPv4 address, or
/// loopback when resolution fails.
async fn default_host() -> String {
    if let Ok(name) = hostname::get() {
        let name = name.to_string_lossy().into_owned();
        let resolved = tokio::net::lookup_host((name.as_str(), 0)).await;
        if let Ok(mut addrs) = resolved {
            if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                return addr.ip().to_string();
            }
        }
    }
    "127.0.0.1".into()
}
