//! Tunables for discovery and the peer core.
//!
//! Defaults are the protocol constants; every knob can be overridden with
//! a `MESHTRIS_*` environment variable. Invalid values are logged and
//! ignored rather than failing startup.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Discovery (multicast + gossip) configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group the HELLO announcements go to.
    pub group: Ipv4Addr,
    /// Shared UDP port for HELLO multicast and GOSSIP unicast.
    pub port: u16,
    /// Delay between HELLO announcements.
    pub hello_period: Duration,
    /// Gossip mode: on-change unicast digests in addition to HELLO.
    pub gossip: bool,
    /// Incoming digest entries older than this are dropped before merging.
    pub gossip_staleness: Duration,
    /// The cleaner evicts ids not refreshed within this window.
    pub prune_after: Duration,
    /// Cleaner period.
    pub prune_period: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 0, 0, 1),
            port: 50_000,
            hello_period: Duration::from_millis(2000),
            gossip: true,
            gossip_staleness: Duration::from_millis(15_000),
            prune_after: Duration::from_millis(60_000),
            prune_period: Duration::from_millis(5000),
        }
    }
}

impl DiscoveryConfig {
    /// Defaults overridden from the environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(group) = env_parse::<Ipv4Addr>("MESHTRIS_GROUP") {
            cfg.group = group;
        }
        if let Some(port) = env_parse("MESHTRIS_PORT") {
            cfg.port = port;
        }
        if let Some(ms) = env_parse("MESHTRIS_HELLO_PERIOD_MS") {
            cfg.hello_period = Duration::from_millis(ms);
        }
        if let Some(flag) = env_var("MESHTRIS_GOSSIP") {
            cfg.gossip = !(flag == "0" || flag.eq_ignore_ascii_case("false"));
        }
        if let Some(ms) = env_parse("MESHTRIS_STALENESS_MS") {
            cfg.gossip_staleness = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("MESHTRIS_PRUNE_AFTER_MS") {
            cfg.prune_after = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("MESHTRIS_PRUNE_PERIOD_MS") {
            cfg.prune_period = Duration::from_millis(ms);
        }
        cfg
    }
}

/// Peer-core timing configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Delay before the first matchmaking round.
    pub matchmaking_delay: Duration,
    /// Delay between matchmaking rounds.
    pub matchmaking_period: Duration,
    /// Opponent liveness probe period.
    pub liveness_period: Duration,
    /// How long an accepted proposal may sit unconfirmed before the
    /// tentative opponent assignment is reverted.
    pub confirm_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            matchmaking_delay: Duration::from_millis(1000),
            matchmaking_period: Duration::from_millis(1500),
            liveness_period: Duration::from_millis(2000),
            confirm_timeout: Duration::from_millis(5000),
        }
    }
}

impl PeerConfig {
    /// Defaults overridden from the environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = env_parse("MESHTRIS_MATCH_DELAY_MS") {
            cfg.matchmaking_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("MESHTRIS_MATCH_PERIOD_MS") {
            cfg.matchmaking_period = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("MESHTRIS_LIVENESS_PERIOD_MS") {
            cfg.liveness_period = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("MESHTRIS_CONFIRM_TIMEOUT_MS") {
            cfg.confirm_timeout = Duration::from_millis(ms);
        }
        cfg
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_defaults_match_protocol_constants() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.group, Ipv4Addr::new(239, 0, 0, 1));
        assert_eq!(cfg.port, 50_000);
        assert_eq!(cfg.hello_period, Duration::from_millis(2000));
        assert!(cfg.gossip);
        assert_eq!(cfg.gossip_staleness, Duration::from_millis(15_000));
        assert_eq!(cfg.prune_after, Duration::from_millis(60_000));
        assert_eq!(cfg.prune_period, Duration::from_millis(5000));
    }

    #[test]
    fn peer_defaults() {
        let cfg = PeerConfig::default();
        assert_eq!(cfg.matchmaking_delay, Duration::from_millis(1000));
        assert_eq!(cfg.matchmaking_period, Duration::from_millis(1500));
        assert_eq!(cfg.liveness_period, Duration::from_millis(2000));
        assert_eq!(cfg.confirm_timeout, Duration::from_millis(5000));
    }
}
