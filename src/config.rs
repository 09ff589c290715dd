//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.
//!
//! This covers only the dataplane's own runtime parameters (bind addresses,
//! gossip/failure-detector/rebalance timing). The richer YAML-file-plus-flag
//! CLI surface (`--proxy.bind-addr`, `--cluster.join=...`) that a full `piko
//! server` binary would expose is out of scope; `Config::load()` is the
//! substrate such a CLI would sit on top of.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Downstream HTTP/TCP proxy listener.
    pub proxy_addr: SocketAddr,
    /// Upstream tunnel listener (agents dial in here).
    pub upstream_addr: SocketAddr,
    /// Gossip listener (same port for TCP join/leave and UDP digest/delta).
    pub gossip_addr: SocketAddr,
    /// Addresses of existing cluster members to join on startup.
    pub join_addrs: Vec<String>,

    pub gossip: GossipConfig,
    pub rebalance: RebalanceConfig,
    pub tunnel: TunnelConfig,
    pub router: RouterConfig,

    /// How long a node that has announced `left` is kept around before
    /// being forgotten entirely.
    pub node_expiry_secs: u64,
    /// Grace period allowed for in-flight requests to drain during shutdown.
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipConfig {
    pub interval_ms: u64,
    pub max_packet_size: usize,
    /// Number of inter-arrival samples the phi-accrual detector retains.
    pub phi_sample_size: usize,
    /// Phi value above which a peer is considered unreachable.
    pub phi_suspicion_threshold: f64,
    /// Tombstone count above which compaction runs.
    pub compaction_tombstone_threshold: usize,
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Bootstrap interval before the failure detector starts evaluating a
    /// peer: 2x the gossip interval, per spec.
    pub fn bootstrap_interval(&self) -> Duration {
        self.interval() * 2
    }

    /// Compaction/expiry sweep interval: 10x the gossip interval, per spec.
    pub fn maintenance_interval(&self) -> Duration {
        self.interval() * 10
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceConfig {
    pub interval_secs: u64,
    /// Fractional excess above the cluster mean connection count that
    /// triggers shedding (default 0.2 => 20%).
    pub threshold: f64,
    /// Fraction of the excess to shed per rebalance pass.
    pub shed_rate: f64,
    /// Cluster-wide connection-count floor below which rebalancing never
    /// triggers, to avoid shedding on small/noisy clusters.
    pub floor: u64,
}

impl RebalanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// HMAC secret or RSA/ECDSA PEM public key for validating listener
    /// registration tokens. `None` disables token validation.
    pub auth_secret: Option<String>,
    /// JWT algorithm the token is signed with: one of `HS256`, `RS256`,
    /// `RS384`, `RS512`, `ES256`, `ES384`. Defaults to `HS256` when unset.
    pub auth_algorithm: Option<String>,
}

impl TunnelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How long the router waits for an upstream dial + response before
    /// returning a 504, for HTTP and remote-forward requests alike.
    pub request_timeout_ms: u64,
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Loads configuration from `config.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("PIKO_").split("_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        Self {
            proxy_addr: SocketAddr::new(localhost, 8000),
            upstream_addr: SocketAddr::new(localhost, 8001),
            gossip_addr: SocketAddr::new(localhost, 8003),
            join_addrs: Vec::new(),
            gossip: GossipConfig {
                interval_ms: 1000,
                max_packet_size: 1400,
                phi_sample_size: 50,
                phi_suspicion_threshold: 20.0,
                compaction_tombstone_threshold: 100,
            },
            rebalance: RebalanceConfig {
                interval_secs: 5,
                threshold: 0.2,
                shed_rate: 0.005,
                floor: 10,
            },
            tunnel: TunnelConfig {
                heartbeat_interval_ms: 10_000,
                heartbeat_timeout_ms: 30_000,
                auth_secret: None,
                auth_algorithm: None,
            },
            router: RouterConfig { request_timeout_ms: 30_000 },
            node_expiry_secs: 24 * 60 * 60,
            grace_period_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn loads_defaults_with_no_file() {
        Jail::expect_with(|_jail| {
            let config = Config::load()?;
            assert_eq!(config.proxy_addr.port(), 8000);
            assert_eq!(config.gossip.interval_ms, 1000);
            Ok(())
        });
    }

    #[test]
    fn file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                proxy_addr = "0.0.0.0:9000"
                [gossip]
                interval_ms = 250
                "#,
            )?;
            let config = Config::load()?;
            assert_eq!(config.proxy_addr.port(), 9000);
            assert_eq!(config.gossip.interval_ms, 250);
            // Untouched fields keep their defaults.
            assert_eq!(config.rebalance.shed_rate, 0.005);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", r#"proxy_addr = "1.1.1.1:1111""#)?;
            jail.set_env("PIKO_PROXY_ADDR", "127.0.0.1:9999");
            let config = Config::load()?;
            assert_eq!(config.proxy_addr, "127.0.0.1:9999".parse().unwrap());
            Ok(())
        });
    }
}
