//! Per-network configuration
//!
//! Every network-specific behaviour (transaction timeout, fee quirks, whether
//! an unconfirmed transaction is acceptable) lives in a [`NetworkQuirks`]
//! record looked up by chain id. Nothing branches on network names.

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Default seconds to wait for a transaction to be mined
pub const DEFAULT_TX_TIMEOUT_SECS: u64 = 360;

/// Network-specific overrides
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkQuirks {
    /// Seconds to wait for a receipt after sending
    pub tx_timeout_secs: u64,
    /// Treat a sent-but-unmined transaction as done after the timeout
    pub accept_unconfirmed: bool,
    /// Fixed legacy gas price range in gwei, picked at random per transaction
    pub legacy_gas_gwei: Option<(f64, f64)>,
    /// Use `base_fee / divisor` as the priority fee instead of fee history
    pub priority_fee_divisor: Option<u128>,
}

impl Default for NetworkQuirks {
    fn default() -> Self {
        Self {
            tx_timeout_secs: DEFAULT_TX_TIMEOUT_SECS,
            accept_unconfirmed: false,
            legacy_gas_gwei: None,
            priority_fee_divisor: None,
        }
    }
}

/// Configuration for a single EVM network
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Human-readable name (e.g., "Arbitrum", "BNB Chain")
    pub name: String,
    /// Native EVM chain ID
    pub chain_id: u64,
    /// RPC endpoint pool; one is picked at random and rotated on failures
    pub rpc_urls: Vec<String>,
    /// Native token symbol
    pub native_token: String,
    pub native_decimals: u8,
    /// Explorer base URL (ends with '/')
    pub explorer: String,
    pub eip1559: bool,
    /// ERC20 token addresses by symbol
    pub tokens: HashMap<String, Address>,
    pub quirks: NetworkQuirks,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            chain_id: 0,
            rpc_urls: Vec::new(),
            native_token: "ETH".to_string(),
            native_decimals: 18,
            explorer: String::new(),
            eip1559: true,
            tokens: HashMap::new(),
            quirks: NetworkQuirks::default(),
        }
    }
}

impl NetworkConfig {
    pub fn is_native(&self, token: &str) -> bool {
        self.native_token == token
    }

    /// ERC20 address for a token symbol
    pub fn token_address(&self, token: &str) -> Option<Address> {
        self.tokens.get(token).copied()
    }

    pub fn tx_url(&self, hash: &str) -> String {
        format!("{}tx/{}", self.explorer, hash)
    }
}

/// All configured networks
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    networks: Vec<NetworkConfig>,
}

impl NetworkRegistry {
    /// Create a registry, validating the records
    pub fn new(networks: Vec<NetworkConfig>) -> Result<Self> {
        let registry = Self { networks };
        registry.validate()?;
        Ok(registry)
    }

    pub fn get(&self, chain_id: u64) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.networks.iter().map(|n| n.chain_id).collect()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.chain_id) {
                return Err(eyre!("Duplicate chain ID: {}", network.chain_id));
            }
            if network.rpc_urls.is_empty() {
                return Err(eyre!("Network {} has no RPC URLs", network.name));
            }
            if let Some((min, max)) = network.quirks.legacy_gas_gwei {
                if min <= 0.0 || min > max {
                    return Err(eyre!(
                        "Invalid legacy gas range for {}: {}-{}",
                        network.name,
                        min,
                        max
                    ));
                }
            }
            if network.quirks.priority_fee_divisor == Some(0) {
                return Err(eyre!("priority_fee_divisor for {} cannot be 0", network.name));
            }
        }
        Ok(())
    }
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `SYMBOL=0xaddress` pairs separated by commas
pub fn parse_token_map(raw: &str) -> Result<HashMap<String, Address>> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (symbol, address) = pair
            .split_once('=')
            .ok_or_else(|| eyre!("Invalid token entry (expected SYMBOL=0x...): {}", pair))?;
        let address = Address::from_str(address.trim())
            .wrap_err_with(|| format!("Invalid address for token {}", symbol))?;
        tokens.insert(symbol.trim().to_string(), address);
    }
    Ok(tokens)
}

/// Parse a `min-max` gwei range
fn parse_gwei_range(raw: &str) -> Result<(f64, f64)> {
    let (min, max) = raw
        .split_once('-')
        .ok_or_else(|| eyre!("Invalid gwei range (expected min-max): {}", raw))?;
    Ok((
        min.trim().parse().wrap_err("Invalid min gwei")?,
        max.trim().parse().wrap_err("Invalid max gwei")?,
    ))
}

/// Load networks from environment variables (`NETWORKS_COUNT`, `NETWORK_{i}_*`)
pub fn load_from_env() -> Result<NetworkRegistry> {
    let count: usize = std::env::var("NETWORKS_COUNT")
        .map_err(|_| eyre!("NETWORKS_COUNT environment variable is required"))?
        .parse()
        .wrap_err("NETWORKS_COUNT must be a number")?;

    let mut networks = Vec::with_capacity(count);

    for i in 1..=count {
        let prefix = format!("NETWORK_{}", i);
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();

        let name = var("NAME").unwrap_or_else(|| format!("network_{}", i));

        let chain_id: u64 = var("CHAIN_ID")
            .ok_or_else(|| eyre!("Missing {}_CHAIN_ID", prefix))?
            .parse()
            .map_err(|_| eyre!("Invalid {}_CHAIN_ID", prefix))?;

        let rpc_urls = parse_rpc_urls(
            &var("RPC_URLS").ok_or_else(|| eyre!("Missing {}_RPC_URLS", prefix))?,
        );

        let tokens = match var("TOKENS") {
            Some(raw) => parse_token_map(&raw)?,
            None => HashMap::new(),
        };

        let legacy_gas_gwei = match var("LEGACY_GAS_GWEI") {
            Some(raw) => Some(parse_gwei_range(&raw)?),
            None => None,
        };

        let quirks = NetworkQuirks {
            tx_timeout_secs: var("TX_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TX_TIMEOUT_SECS),
            accept_unconfirmed: var("ACCEPT_UNCONFIRMED")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            legacy_gas_gwei,
            priority_fee_divisor: var("PRIORITY_FEE_DIVISOR").and_then(|v| v.parse().ok()),
        };

        networks.push(NetworkConfig {
            name,
            chain_id,
            rpc_urls,
            native_token: var("NATIVE_TOKEN").unwrap_or_else(|| "ETH".to_string()),
            native_decimals: var("NATIVE_DECIMALS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(18),
            explorer: var("EXPLORER").unwrap_or_default(),
            eip1559: var("EIP1559").and_then(|v| v.parse().ok()).unwrap_or(true),
            tokens,
            quirks,
        });
    }

    NetworkRegistry::new(networks)
}
