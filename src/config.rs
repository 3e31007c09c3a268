//! Agent configuration.
//!
//! Loaded from an optional JSON file (`--config`) and then overridden by command-line flags.
//! Every field has a default so an empty file, or no file at all, is a valid configuration.

use crate::membership::types::NodeId;
use crate::zone::Zone;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6768;
pub const DEFAULT_ZONE: &str = "lan";

/// Protocol timers and bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipTiming {
    pub probe_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub indirect_ping_timeout_ms: u64,
    pub gossip_interval_ms: u64,
    pub sync_interval_secs: u64,
    pub suspicion_multiplier: u64,
    /// Peers per gossip tick, and sends before a broadcast entry is retired.
    pub fanout: usize,
    pub indirect_relays: usize,
    pub packet_budget: usize,
    pub leave_grace_secs: u64,
    pub event_ttl_secs: u64,
    pub retention_interval_secs: u64,
    pub history_max_bytes: u64,
}

impl Default for GossipTiming {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            ping_timeout_ms: 3000,
            indirect_ping_timeout_ms: 6000,
            gossip_interval_ms: 1000,
            sync_interval_secs: 15,
            suspicion_multiplier: 5,
            fanout: 10,
            indirect_relays: 3,
            packet_budget: 1400,
            leave_grace_secs: 10,
            event_ttl_secs: 300,
            retention_interval_secs: 60,
            history_max_bytes: 1024 * 1024,
        }
    }
}

impl GossipTiming {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn indirect_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.indirect_ping_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn leave_grace(&self) -> Duration {
        Duration::from_secs(self.leave_grace_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    /// How long a node may stay `suspect` before we declare it `dead`.
    ///
    /// `multiplier * ceil(log10(node_count + 1)) * probe_interval`: patience grows with the
    /// size of the cluster.
    pub fn suspect_timeout(&self, node_count: usize) -> Duration {
        let scale = ((node_count + 1) as f64).log10().ceil() as u64;
        self.probe_interval() * (self.suspicion_multiplier * scale) as u32
    }

    /// How long a `leave` node is kept before being purged from the registry.
    pub fn leave_timeout(&self, node_count: usize) -> Duration {
        self.suspect_timeout(node_count) * 30
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub display_name: String,
    pub uuid: Option<String>,
    /// UDP gossip and HTTP share this address.
    pub bind_addr: SocketAddr,
    pub public_addr: Option<String>,
    pub zone: String,
    pub is_proxy: bool,
    pub groups: Vec<String>,
    pub seeds: Vec<String>,
    /// First node of a cluster: do not wait for a seed to answer.
    pub bootstrap: bool,
    pub auto_detect: bool,
    pub detect_timeout_secs: u64,
    pub data_dir: Option<PathBuf>,
    pub api_token: Option<String>,
    pub encryption_keys: HashMap<String, String>,
    pub zones: Vec<Zone>,
    pub timing: GossipTiming,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            uuid: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            public_addr: None,
            zone: DEFAULT_ZONE.to_string(),
            is_proxy: false,
            groups: Vec::new(),
            seeds: Vec::new(),
            bootstrap: false,
            auto_detect: false,
            detect_timeout_secs: 3,
            data_dir: None,
            api_token: None,
            encryption_keys: HashMap::new(),
            zones: Vec::new(),
            timing: GossipTiming::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Builds the configuration from the process arguments (`args[0]` is the program name).
    pub fn from_args(args: &[String]) -> Result<Self> {
        // --config is applied first so that the other flags override the file
        let mut config = match args.iter().position(|a| a == "--config") {
            Some(i) => {
                let Some(path) = args.get(i + 1) else {
                    bail!("--config needs a value");
                };
                Self::from_file(Path::new(path))?
            }
            None => Self::default(),
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            match (args[i].as_str(), value) {
                ("--config", Some(_)) => {
                    i += 2;
                }
                ("--bind", Some(v)) => {
                    config.bind_addr = v.parse().with_context(|| format!("bad --bind {}", v))?;
                    i += 2;
                }
                ("--seed", Some(v)) => {
                    config.seeds.push(v.clone());
                    i += 2;
                }
                ("--zone", Some(v)) => {
                    config.zone = v.clone();
                    i += 2;
                }
                ("--name", Some(v)) => {
                    config.name = v.clone();
                    i += 2;
                }
                ("--data-dir", Some(v)) => {
                    config.data_dir = Some(PathBuf::from(v));
                    i += 2;
                }
                ("--proxy", _) => {
                    config.is_proxy = true;
                    i += 1;
                }
                ("--bootstrap", _) => {
                    config.bootstrap = true;
                    i += 1;
                }
                ("--detect", _) => {
                    config.auto_detect = true;
                    i += 1;
                }
                (flag @ ("--bind" | "--seed" | "--zone" | "--name" | "--data-dir"), None) => {
                    bail!("{} needs a value", flag);
                }
                (other, _) => {
                    tracing::warn!("Ignoring unknown argument {}", other);
                    i += 1;
                }
            }
        }

        if config.name.is_empty() {
            config.name = config.bind_addr.to_string();
        }
        Ok(config)
    }

    /// Our stable identity: the configured uuid, else the one saved in the data directory,
    /// else a fresh one (saved for the next run when a data directory is set).
    pub fn resolve_uuid(&self) -> std::io::Result<NodeId> {
        if let Some(uuid) = self.uuid.as_deref().filter(|u| !u.is_empty()) {
            return Ok(NodeId::from(uuid));
        }

        let Some(dir) = &self.data_dir else {
            return Ok(NodeId::new());
        };

        let path = dir.join("uuid");
        if let Ok(saved) = std::fs::read_to_string(&path) {
            let saved = saved.trim();
            if !saved.is_empty() {
                return Ok(NodeId::from(saved));
            }
        }

        let uuid = NodeId::new();
        std::fs::create_dir_all(dir)?;
        std::fs::write(&path, &uuid.0)?;
        Ok(uuid)
    }

    /// Address other nodes should use to reach us.
    ///
    /// An explicit `public_addr` wins. A wildcard bind (`0.0.0.0`, `::`) is never announced:
    /// we use the address of the interface that routes to our seeds, or to the outside world.
    pub fn advertised_addr(&self) -> String {
        if let Some(addr) = self.public_addr.as_deref().filter(|a| !a.is_empty()) {
            return addr.to_string();
        }

        let ip = self.bind_addr.ip();
        if !ip.is_unspecified() {
            return ip.to_string();
        }

        let routes = self
            .seeds
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(ROUTE_PROBE_ADDR));
        for target in routes {
            if let Some(local) = outbound_ip(target, ip) {
                tracing::debug!("Advertising {} (route to {})", local, target);
                return local.to_string();
            }
        }

        tracing::warn!(
            "Cannot find a routable address for wildcard bind {}, advertising loopback; set public_addr",
            self.bind_addr
        );
        match ip {
            IpAddr::V4(_) => Ipv4Addr::LOCALHOST.to_string(),
            IpAddr::V6(_) => Ipv6Addr::LOCALHOST.to_string(),
        }
    }
}

/// Any routable address. Connecting a UDP socket sends nothing, it only selects a route.
const ROUTE_PROBE_ADDR: &str = "192.0.2.1:9";

/// Local address the kernel picks to reach `target`, if any.
fn outbound_ip(target: &str, family: IpAddr) -> Option<IpAddr> {
    let unspecified = SocketAddr::new(family, 0);
    let socket = std::net::UdpSocket::bind(unspecified).ok()?;
    socket.connect(target).ok()?;
    let local = socket.local_addr().ok()?.ip();
    (!local.is_unspecified()).then_some(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("zonal-agent")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_suspect_timeout_scales_with_cluster_size() {
        let timing = GossipTiming::default();

        assert_eq!(timing.suspect_timeout(1), Duration::from_secs(5));
        assert_eq!(timing.suspect_timeout(9), Duration::from_secs(5));
        assert_eq!(timing.suspect_timeout(10), Duration::from_secs(10));
        assert_eq!(timing.suspect_timeout(150), Duration::from_secs(15));
        assert_eq!(timing.leave_timeout(1), Duration::from_secs(150));
    }

    #[test]
    fn test_from_args_parses_flags() {
        let config = AgentConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1:7000",
            "--seed",
            "127.0.0.1:7001",
            "--seed",
            "127.0.0.1:7002",
            "--zone",
            "eu",
            "--proxy",
            "--name",
            "edge-1",
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.seeds, vec!["127.0.0.1:7001", "127.0.0.1:7002"]);
        assert_eq!(config.zone, "eu");
        assert!(config.is_proxy);
        assert_eq!(config.name, "edge-1");
        assert!(!config.bootstrap);
    }

    #[test]
    fn test_missing_flag_value_is_an_error() {
        assert!(AgentConfig::from_args(&args(&["--bind"])).is_err());
        assert!(AgentConfig::from_args(&args(&["--bind", "not-an-addr"])).is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(
            &path,
            r#"{
                "zone": "us",
                "is_proxy": true,
                "zones": [{"name": "us", "sub-zones": ["us-east"]}],
                "timing": {"fanout": 4}
            }"#,
        )
        .unwrap();

        let config = AgentConfig::from_args(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--zone",
            "us-east",
        ]))
        .unwrap();

        assert_eq!(config.zone, "us-east");
        assert!(config.is_proxy);
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.timing.fanout, 4);
        assert_eq!(config.timing.packet_budget, 1400);
    }

    #[test]
    fn test_wildcard_bind_advertises_route_to_seed() {
        let config = AgentConfig {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            seeds: vec!["127.0.0.1:6768".to_string()],
            ..AgentConfig::default()
        };

        assert_eq!(config.advertised_addr(), "127.0.0.1");
    }

    #[test]
    fn test_wildcard_bind_is_never_advertised() {
        let config = AgentConfig {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            ..AgentConfig::default()
        };

        let advertised: IpAddr = config.advertised_addr().parse().unwrap();
        assert!(!advertised.is_unspecified());
    }

    #[test]
    fn test_explicit_addresses_are_advertised_as_is() {
        let config = AgentConfig {
            bind_addr: "10.1.2.3:6768".parse().unwrap(),
            ..AgentConfig::default()
        };
        assert_eq!(config.advertised_addr(), "10.1.2.3");

        let config = AgentConfig {
            public_addr: Some("agent.example.org".to_string()),
            ..config
        };
        assert_eq!(config.advertised_addr(), "agent.example.org");
    }

    #[test]
    fn test_uuid_is_persisted_in_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..AgentConfig::default()
        };

        let first = config.resolve_uuid().unwrap();
        let second = config.resolve_uuid().unwrap();
        assert_eq!(first, second);

        let pinned = AgentConfig {
            uuid: Some("fixed".to_string()),
            ..config
        };
        assert_eq!(pinned.resolve_uuid().unwrap(), NodeId::from("fixed"));
    }
}
