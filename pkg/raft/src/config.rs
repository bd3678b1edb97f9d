//! Process configuration, loaded from a TOML file. Mirrors the shape of the
//! original service's `confuse`-based config (node identity, storage path,
//! peer list, webhooks) using `toml` + `serde`, the same combination the
//! teacher crate already depended on for its own config parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{Result, ResultExt};
use crate::protos::NodeId;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
	pub identifier: NodeId,
	/// `host:port` this node listens on for raft RPCs and client proposals.
	pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub node: NodeConfig,
	/// Directory holding `meta` and `log`.
	pub storage: PathBuf,
	/// Every other member of the cluster, keyed by identifier.
	#[serde(default)]
	pub peers: HashMap<NodeId, String>,
	/// Tick cadence driving the election/heartbeat timers.
	#[serde(default = "default_tick_millis")]
	pub tick_millis: u64,
	/// URLs notified after every locally observed commit, best-effort.
	#[serde(default)]
	pub webhooks: Vec<String>,
}

fn default_tick_millis() -> u64 {
	20
}

impl Config {
	pub fn load(path: impl AsRef<Path>) -> Result<Config> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).chain_err(|| format!("reading config file {}", path.display()))?;
		let config: Config = toml::from_str(&text).chain_err(|| format!("parsing config file {}", path.display()))?;
		Ok(config)
	}

	pub fn peer_ids(&self) -> Vec<NodeId> {
		self.peers.keys().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_config() {
		let toml = r#"
			[node]
			identifier = "node1"
			address = "127.0.0.1:9001"

			storage = "/var/lib/registry-raft/node1"

			[peers]
			node2 = "127.0.0.1:9002"
			node3 = "127.0.0.1:9003"
		"#;
		let config: Config = toml::from_str(toml).unwrap();
		assert_eq!(config.node.identifier, "node1");
		assert_eq!(config.tick_millis, 20);
		assert_eq!(config.peer_ids().len(), 2);
	}
}
