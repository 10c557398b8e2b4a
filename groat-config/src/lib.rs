use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Consensus and peering parameters. Peers must agree on this whole table
/// byte-for-byte: `/status/` serves it verbatim and a mismatch rejects the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub ticker_symbol: String,
    pub version: u32,
    pub full_node_port: u16,
    /// Coinbase reward before the first halving, in whole coins.
    pub initial_coins_per_block: u64,
    pub halving_frequency: u64,
    pub max_transactions_per_block: usize,
    pub minimum_hash_difficulty: usize,
    pub target_time_per_block: u64,
    pub difficulty_adjustment_span: u64,
    pub significant_digits: u32,
    /// Consecutive failures after which a peer is evicted.
    pub downtime_threshold: u32,
    pub min_peers: usize,
    pub max_peers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Address this node advertises to peers.
    pub ip: String,
    /// Reward address for mined blocks (compressed public key, hex).
    pub public_key: String,
    /// Chain database directory.
    pub db: PathBuf,
    /// Bootstrap peers tried at startup. Lives outside `network` so nodes
    /// with different seed lists still status-match.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// Hex AES-GCM blob produced by the wallet; absent means a fresh key is
    /// generated on demand.
    pub encrypted_private_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub user: UserConfig,
}

impl NodeConfig {
    /// Loads from a TOML file, with `GROAT__`-prefixed environment variables
    /// taking precedence (e.g. `GROAT__NETWORK__MIN_PEERS=3`).
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("GROAT").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example() -> Self {
        Self {
            network: NetworkConfig {
                name: "groat".into(),
                ticker_symbol: "GRT".into(),
                version: 1,
                full_node_port: 30013,
                initial_coins_per_block: 50,
                halving_frequency: 111_500,
                max_transactions_per_block: 200,
                minimum_hash_difficulty: 4,
                target_time_per_block: 60,
                difficulty_adjustment_span: 500,
                significant_digits: 6,
                downtime_threshold: 4,
                min_peers: 2,
                max_peers: 16,
            },
            user: UserConfig {
                ip: "127.0.0.1".into(),
                public_key: String::new(),
                db: PathBuf::from("data/chain"),
                seed_nodes: Vec::new(),
                encrypted_private_key: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_roundtrips_through_toml() {
        let cfg = NodeConfig::example();
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        let parsed: NodeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.network, cfg.network);
        assert_eq!(parsed.user.db, cfg.user.db);
    }

    #[test]
    fn network_table_equality_is_field_sensitive() {
        let a = NodeConfig::example().network;
        let mut b = a.clone();
        assert_eq!(a, b);
        b.minimum_hash_difficulty += 1;
        assert_ne!(a, b);
    }
}
