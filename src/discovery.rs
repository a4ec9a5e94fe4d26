//! Peer discovery over UDP multicast, with optional epidemic gossip.
//!
//! Every peer multicasts `HELLO <id>` on a fixed group/port and folds the
//! announcements it hears into the membership view. In gossip mode,
//! learning a previously-unknown id triggers a unicast `GOSSIP` digest to
//! one uniformly random known peer — gossip is never periodic. A cleaner
//! evicts ids that stop announcing; last-seen bookkeeping runs in both
//! modes so the cleaner works even with gossip off.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::Error;
use crate::view::{now_ms, MembershipView};
use crate::wire::{Datagram, GossipEntry};

/// Running discovery component. Owns the multicast socket and its loops.
pub struct Discovery {
    view: Arc<MembershipView>,
    socket: Arc<UdpSocket>,
    group: Ipv4Addr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Join the multicast group and start the sender, receiver, and
    /// cleaner loops.
    pub async fn spawn(self_id: &str, config: DiscoveryConfig) -> Result<Self, Error> {
        let socket = Arc::new(bind_multicast(config.group, config.port)?);
        let view = Arc::new(MembershipView::new(self_id));
        let (shutdown, _) = watch::channel(false);

        info!(
            id = %self_id,
            group = %config.group,
            port = config.port,
            gossip = config.gossip,
            "discovery joined multicast group"
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(sender_loop(
            socket.clone(),
            view.clone(),
            config.clone(),
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(receiver_loop(
            socket.clone(),
            view.clone(),
            config.clone(),
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(cleaner_loop(
            view.clone(),
            config.clone(),
            shutdown.subscribe(),
        )));

        Ok(Self {
            view,
            socket,
            group: config.group,
            shutdown,
            tasks,
        })
    }

    /// The live membership view this component maintains.
    pub fn view(&self) -> Arc<MembershipView> {
        self.view.clone()
    }

    /// Stop the loops and leave the multicast group.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
        let _ = self
            .socket
            .leave_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED);
        info!("discovery closed");
    }
}

/// Bind the shared discovery socket.
///
/// Reuse flags let several peers on one machine share the port, which is
/// how multiple local processes all hear the same multicast traffic.
fn bind_multicast(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

async fn sender_loop(
    socket: Arc<UdpSocket>,
    view: Arc<MembershipView>,
    config: DiscoveryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let hello = Datagram::Hello {
        id: view.self_id().to_owned(),
    }
    .encode();
    let target = SocketAddr::from((config.group, config.port));
    let mut ticker = tokio::time::interval(config.hello_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(hello.as_bytes(), target).await {
                    warn!(error = %e, "hello send failed");
                } else {
                    trace!("hello sent");
                }
            }
        }
    }
}

async fn receiver_loop(
    socket: Arc<UdpSocket>,
    view: Arc<MembershipView>,
    config: DiscoveryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 4096];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(error = %e, "discovery receive error");
                    continue;
                }
            },
        };
        let Ok(payload) = std::str::from_utf8(&buf[..len]) else {
            trace!(%from, "dropping non-utf8 datagram");
            continue;
        };
        match Datagram::parse(payload) {
            Some(Datagram::Hello { id }) => {
                let is_new = view.observe_hello(&id, now_ms());
                if is_new {
                    debug!(peer = %id, "discovered via hello");
                    if config.gossip {
                        send_gossip(&socket, &view, &config).await;
                    }
                }
            }
            Some(Datagram::Gossip { entries }) if config.gossip => {
                let added = view.merge_gossip(
                    &entries,
                    now_ms(),
                    config.gossip_staleness.as_millis() as i64,
                );
                if !added.is_empty() {
                    debug!(peers = ?added, "discovered via gossip");
                    send_gossip(&socket, &view, &config).await;
                }
            }
            Some(Datagram::Gossip { .. }) => {} // gossip disabled
            None => trace!(%from, "ignoring unknown datagram"),
        }
    }
}

async fn cleaner_loop(
    view: Arc<MembershipView>,
    config: DiscoveryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.prune_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = view.prune(now_ms(), config.prune_after.as_millis() as i64);
                for id in removed {
                    info!(peer = %id, "peer expired from view");
                }
            }
        }
    }
}

/// Unicast the current view to one uniformly random known peer.
async fn send_gossip(socket: &UdpSocket, view: &MembershipView, config: &DiscoveryConfig) {
    let peers = view.snapshot();
    let Some(target_id) = peers.choose(&mut rand::thread_rng()) else {
        return;
    };
    let Some((host, _)) = target_id.rsplit_once(':') else {
        return;
    };
    let payload = build_digest(view).encode();
    match socket
        .send_to(payload.as_bytes(), (host, config.port))
        .await
    {
        Ok(_) => trace!(target = %target_id, "gossip sent"),
        Err(e) => debug!(target = %target_id, error = %e, "gossip send failed"),
    }
}

/// The digest starts with the sender stamped at its current clock,
/// followed by every known peer at its last sighting.
fn build_digest(view: &MembershipView) -> Datagram {
    let mut entries = vec![GossipEntry {
        id: view.self_id().to_owned(),
        ts: now_ms(),
    }];
    entries.extend(view.entries());
    Datagram::Gossip { entries }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_leads_with_self() {
        let view = MembershipView::new("a:1");
        view.observe_hello("b:2", 1000);
        view.observe_hello("c:3", 2000);

        let Datagram::Gossip { entries } = build_digest(&view) else {
            panic!("digest must be a gossip datagram");
        };
        assert_eq!(entries[0].id, "a:1");
        assert!(entries[0].ts > 0);
        assert_eq!(entries.len(), 3);

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert!(ids.contains(&"b:2"));
        assert!(ids.contains(&"c:3"));
    }

    #[test]
    fn digest_of_empty_view_still_names_self() {
        let view = MembershipView::new("a:1");
        let Datagram::Gossip { entries } = build_digest(&view) else {
            panic!("digest must be a gossip datagram");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a:1");
    }

    #[test]
    fn digest_round_trips_through_the_wire_format() {
        let view = MembershipView::new("a:1");
        view.observe_hello("b:2", 1000);

        let encoded = build_digest(&view).encode();
        let parsed = Datagram::parse(&encoded).expect("digest should parse");
        let Datagram::Gossip { entries } = parsed else {
            panic!("expected gossip");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "a:1");
    }
}
