// =============================================================================
// MOONWIRE v1.1 - Node Configuration
// =============================================================================
//
// Everything a node is told at boot: the chains it anchors to (provider URL
// plus factory/registry addresses per chain), the router's rebalance
// profiles and allowed swaps, the signer mnemonic, and transport settings.
//
// Loaded from a JSON file. Token amounts are decimal strings, matching the
// wire encoding.
//
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::types::{serde_amount, Address, EngineError, NetworkContext};

// =============================================================================
// Pieces
// =============================================================================

/// Per-chain contract anchoring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAddresses {
    pub channel_factory_address: Address,
    pub transfer_registry_address: Address,
}

/// Collateral policy for one (chain, asset) pair. The router tops a channel
/// up to `target` when its balance drops below `collateralize_threshold`,
/// and may reclaim above `reclaim_threshold`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceProfile {
    pub chain_id: u64,
    pub asset_id: Address,
    #[serde(with = "serde_amount")]
    pub reclaim_threshold: u128,
    #[serde(with = "serde_amount")]
    pub target: u128,
    #[serde(with = "serde_amount")]
    pub collateralize_threshold: u128,
}

/// One permitted cross-asset/cross-chain conversion, priced as a rational.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedSwap {
    pub from_asset_id: Address,
    pub from_chain_id: u64,
    pub to_asset_id: Address,
    pub to_chain_id: u64,
    pub price_numerator: u64,
    pub price_denominator: u64,
}

// =============================================================================
// Node Config
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// chain id -> provider URL
    pub chain_providers: HashMap<u64, String>,
    /// chain id -> contract addresses
    pub chain_addresses: HashMap<u64, ContractAddresses>,
    #[serde(default)]
    pub rebalance_profiles: Vec<RebalanceProfile>,
    #[serde(default)]
    pub allowed_swaps: Vec<AllowedSwap>,
    /// BIP-39 phrase for the node signer
    pub mnemonic: Option<String>,
    #[serde(default = "default_messaging_url")]
    pub messaging_url: String,
    /// Suppress the startup is-alive broadcast and queued-update drains
    #[serde(default)]
    pub skip_check_in: bool,
    /// `host:port` for the RPC listener; `None` disables it
    #[serde(default)]
    pub rpc_bind: Option<String>,
    /// Sled database directory; `None` keeps state in memory
    #[serde(default)]
    pub store_path: Option<String>,
}

fn default_messaging_url() -> String {
    "memory://local".to_string()
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::external(format!(
                "config {} unreadable: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::validation(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for chain_id in self.chain_addresses.keys() {
            if !self.chain_providers.contains_key(chain_id) {
                return Err(EngineError::validation(format!(
                    "chain {} has contract addresses but no provider",
                    chain_id
                )));
            }
        }
        for swap in &self.allowed_swaps {
            if swap.price_denominator == 0 {
                return Err(EngineError::validation("swap price denominator is zero"));
            }
            if !self.chain_addresses.contains_key(&swap.from_chain_id)
                || !self.chain_addresses.contains_key(&swap.to_chain_id)
            {
                return Err(EngineError::validation(format!(
                    "swap references unconfigured chain {} -> {}",
                    swap.from_chain_id, swap.to_chain_id
                )));
            }
        }
        if let Some(mnemonic) = &self.mnemonic {
            bip39::Mnemonic::parse(mnemonic)
                .map_err(|e| EngineError::validation(format!("invalid mnemonic: {}", e)))?;
        }
        Ok(())
    }

    /// The network contexts the engine anchors channels to.
    pub fn network_contexts(&self) -> Vec<NetworkContext> {
        self.chain_addresses
            .iter()
            .filter_map(|(chain_id, addresses)| {
                self.chain_providers.get(chain_id).map(|url| NetworkContext {
                    chain_id: *chain_id,
                    channel_factory_address: addresses.channel_factory_address,
                    transfer_registry_address: addresses.transfer_registry_address,
                    provider_url: url.clone(),
                })
            })
            .collect()
    }

    pub fn profile_for(&self, chain_id: u64, asset_id: &Address) -> Option<&RebalanceProfile> {
        self.rebalance_profiles
            .iter()
            .find(|p| p.chain_id == chain_id && p.asset_id == *asset_id)
    }
}

impl Default for NodeConfig {
    /// A single-chain in-memory dev configuration.
    fn default() -> Self {
        let mut chain_providers = HashMap::new();
        chain_providers.insert(1, "http://localhost:8545".to_string());
        let mut chain_addresses = HashMap::new();
        chain_addresses.insert(
            1,
            ContractAddresses {
                channel_factory_address: Address::from_bytes([0xFA; 20]),
                transfer_registry_address: Address::from_bytes([0xFB; 20]),
            },
        );
        NodeConfig {
            chain_providers,
            chain_addresses,
            rebalance_profiles: Vec::new(),
            allowed_swaps: Vec::new(),
            mnemonic: None,
            messaging_url: default_messaging_url(),
            skip_check_in: false,
            rpc_bind: None,
            store_path: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json() -> serde_json::Value {
        serde_json::json!({
            "chain_providers": { "1": "http://localhost:8545", "137": "http://localhost:8546" },
            "chain_addresses": {
                "1": {
                    "channel_factory_address": Address::from_bytes([0xFA; 20]),
                    "transfer_registry_address": Address::from_bytes([0xFB; 20]),
                },
                "137": {
                    "channel_factory_address": Address::from_bytes([0xFC; 20]),
                    "transfer_registry_address": Address::from_bytes([0xFD; 20]),
                }
            },
            "rebalance_profiles": [{
                "chain_id": 1,
                "asset_id": Address::zero(),
                "reclaim_threshold": "200",
                "target": "120",
                "collateralize_threshold": "100",
            }],
            "allowed_swaps": [{
                "from_asset_id": Address::zero(),
                "from_chain_id": 1,
                "to_asset_id": Address::from_bytes([5; 20]),
                "to_chain_id": 137,
                "price_numerator": 1005,
                "price_denominator": 1000,
            }],
            "mnemonic": null,
            "skip_check_in": true,
        })
    }

    #[test]
    fn test_parse_and_validate() {
        let config: NodeConfig = serde_json::from_value(config_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.chain_providers.len(), 2);
        assert!(config.skip_check_in);
        assert_eq!(config.rebalance_profiles[0].target, 120);
        assert_eq!(config.allowed_swaps[0].price_numerator, 1005);

        let contexts = config.network_contexts();
        assert_eq!(contexts.len(), 2);
        assert!(contexts.iter().any(|c| c.chain_id == 137));
    }

    #[test]
    fn test_missing_provider_rejected() {
        let mut value = config_json();
        value
            .as_object_mut()
            .unwrap()
            .get_mut("chain_providers")
            .unwrap()
            .as_object_mut()
            .unwrap()
            .remove("137");
        let config: NodeConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_denominator_rejected() {
        let mut value = config_json();
        value["allowed_swaps"][0]["price_denominator"] = serde_json::json!(0);
        let config: NodeConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_profile_lookup() {
        let config: NodeConfig = serde_json::from_value(config_json()).unwrap();
        assert!(config.profile_for(1, &Address::zero()).is_some());
        assert!(config.profile_for(137, &Address::zero()).is_none());
    }

    #[test]
    fn test_bad_mnemonic_rejected() {
        let mut value = config_json();
        value["mnemonic"] = serde_json::json!("definitely not words");
        let config: NodeConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }
}
