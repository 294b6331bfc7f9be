use alloy::primitives::{Address, Bytes};
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::confirmation::ConfirmationConfig;
use crate::gas::{GasGateConfig, StreamCooldown};
use crate::network::NetworkRegistry;
use crate::retry::RetryConfig;
use crate::runner::RunnerConfig;

/// Main configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct Config {
    pub retry: RetryConfig,
    pub confirmation: ConfirmationConfig,
    pub gas: GasConfig,
    pub runner: RunnerConfig,
    pub networks: NetworkRegistry,
    pub action: ActionConfig,
    /// File with one `name:0xkey` per line
    pub wallets_file: PathBuf,
    /// Multiplier applied to estimated gas limits
    pub gas_multiplier: f64,
    pub api: ApiConfig,
}

/// Gas gate settings
#[derive(Debug, Clone)]
pub struct GasConfig {
    pub gate: GasGateConfig,
    /// JSON file holding the operator-editable ceiling
    pub ceiling_path: PathBuf,
    /// Ceiling written when the file is missing or malformed
    pub maximum_gwei: f64,
}

/// Health/metrics server settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

/// Action run for every wallet
#[derive(Debug, Clone, PartialEq)]
pub enum ActionConfig {
    ContractCall {
        label: String,
        chain_id: u64,
        to: Address,
        value_wei: u128,
        calldata: Bytes,
    },
    DepositBridge {
        src_chain_id: u64,
        dst_chain_id: u64,
        deposit_address: Address,
        token: String,
        dst_token: String,
        /// Amount picked at random per wallet from this range
        amount: (f64, f64),
        min_amount: f64,
        max_amount: f64,
        fee: f64,
        routing_code: Option<u32>,
    },
}

impl ActionConfig {
    pub fn source_chain_id(&self) -> u64 {
        match self {
            ActionConfig::ContractCall { chain_id, .. } => *chain_id,
            ActionConfig::DepositBridge { src_chain_id, .. } => *src_chain_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ActionConfig::ContractCall { label, .. } => label,
            ActionConfig::DepositBridge { .. } => "DepositBridge",
        }
    }
}

/// Default functions
fn default_maximum_retry() -> u32 {
    3
}

fn default_sleep_time_retry() -> (u64, u64) {
    (5, 10)
}

fn default_receipt_poll_interval() -> u64 {
    60
}

fn default_receipt_timeout() -> u64 {
    1200
}

fn default_maximum_gwei() -> f64 {
    40.0
}

fn default_sleep_time_gas() -> u64 {
    100
}

fn default_gas_ceiling_path() -> &'static str {
    "./data/services/maximum_gwei.json"
}

fn default_wallets_file() -> &'static str {
    "./data/wallets.txt"
}

fn default_gas_multiplier() -> f64 {
    1.3
}

fn default_api_port() -> u16 {
    9090
}

fn var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| eyre!("{} has an invalid value: {}", key, raw)),
        _ => Ok(None),
    }
}

fn required<T: FromStr>(key: &str) -> Result<T> {
    var(key)?.ok_or_else(|| eyre!("{} environment variable is required", key))
}

/// Parse `min-max` (or a single value used for both)
fn parse_range<T: FromStr + Copy>(key: &str, raw: &str) -> Result<(T, T)> {
    let parse = |s: &str| {
        s.trim()
            .parse::<T>()
            .map_err(|_| eyre!("{} has an invalid value: {}", key, raw))
    };
    match raw.split_once('-') {
        Some((min, max)) => Ok((parse(min)?, parse(max)?)),
        None => {
            let v = parse(raw)?;
            Ok((v, v))
        }
    }
}

fn range_var<T: FromStr + Copy>(key: &str, default: (T, T)) -> Result<(T, T)> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_range(key, &raw),
        _ => Ok(default),
    }
}

fn secs((min, max): (u64, u64)) -> (Duration, Duration) {
    (Duration::from_secs(min), Duration::from_secs(max))
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let (backoff_min, backoff_max) =
            secs(range_var("SLEEP_TIME_RETRY", default_sleep_time_retry())?);
        let retry = RetryConfig {
            max_retries: var("MAXIMUM_RETRY")?.unwrap_or(default_maximum_retry()),
            backoff_min,
            backoff_max,
        };

        let confirmation = ConfirmationConfig {
            poll_interval: Duration::from_secs(
                var("RECEIPT_POLL_INTERVAL_SECS")?.unwrap_or(default_receipt_poll_interval()),
            ),
            timeout: Duration::from_secs(
                var("RECEIPT_TIMEOUT_SECS")?.unwrap_or(default_receipt_timeout()),
            ),
        };

        let cooldown = if var("SOFTWARE_MODE")?.unwrap_or(false) {
            let (sleep_min, sleep_max) = secs(range_var("SLEEP_TIME_STREAM", (10, 20))?);
            Some(StreamCooldown {
                control_checks: var("CONTROL_TIMES_FOR_SLEEP")?.unwrap_or(5),
                accounts_in_stream: var("ACCOUNTS_IN_STREAM")?.unwrap_or(1),
                sleep_min,
                sleep_max,
            })
        } else {
            None
        };

        let gas = GasConfig {
            gate: GasGateConfig {
                enabled: var("GAS_CONTROL")?.unwrap_or(false),
                check_interval: Duration::from_secs(
                    var("SLEEP_TIME_GAS")?.unwrap_or(default_sleep_time_gas()),
                ),
                cooldown,
            },
            ceiling_path: env::var("GAS_CEILING_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(default_gas_ceiling_path())),
            maximum_gwei: var("MAXIMUM_GWEI")?.unwrap_or(default_maximum_gwei()),
        };

        let (start_delay_min, start_delay_max) = secs(range_var("SLEEP_TIME_WALLETS", (0, 0))?);
        let runner = RunnerConfig {
            per_wallet_timeout: var::<u64>("WALLET_TIMEOUT_SECS")?.map(Duration::from_secs),
            start_delay_min,
            start_delay_max,
            max_concurrent: var("MAX_CONCURRENT_WALLETS")?.unwrap_or(0),
        };

        let networks = crate::network::load_from_env()?;
        let action = load_action()?;

        let api = ApiConfig {
            enabled: var("API_ENABLED")?.unwrap_or(true),
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: var("API_PORT")?.unwrap_or(default_api_port()),
        };

        let config = Config {
            retry,
            confirmation,
            gas,
            runner,
            networks,
            action,
            wallets_file: env::var("WALLETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(default_wallets_file())),
            gas_multiplier: var("GAS_MULTIPLIER")?.unwrap_or(default_gas_multiplier()),
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.retry.backoff_min > self.retry.backoff_max {
            return Err(eyre!("SLEEP_TIME_RETRY min cannot exceed max"));
        }

        if self.confirmation.poll_interval.is_zero() {
            return Err(eyre!("RECEIPT_POLL_INTERVAL_SECS must be greater than 0"));
        }
        if self.confirmation.timeout < self.confirmation.poll_interval {
            return Err(eyre!(
                "RECEIPT_TIMEOUT_SECS cannot be shorter than RECEIPT_POLL_INTERVAL_SECS"
            ));
        }

        if self.gas.maximum_gwei <= 0.0 {
            return Err(eyre!("MAXIMUM_GWEI must be positive"));
        }
        if self.gas.gate.check_interval.is_zero() {
            return Err(eyre!("SLEEP_TIME_GAS must be greater than 0"));
        }
        if let Some(cooldown) = &self.gas.gate.cooldown {
            if cooldown.sleep_min > cooldown.sleep_max {
                return Err(eyre!("SLEEP_TIME_STREAM min cannot exceed max"));
            }
            if cooldown.accounts_in_stream == 0 {
                return Err(eyre!("ACCOUNTS_IN_STREAM must be at least 1"));
            }
        }

        if self.runner.start_delay_min > self.runner.start_delay_max {
            return Err(eyre!("SLEEP_TIME_WALLETS min cannot exceed max"));
        }

        if self.gas_multiplier <= 0.0 {
            return Err(eyre!("GAS_MULTIPLIER must be positive"));
        }

        match &self.action {
            ActionConfig::ContractCall { chain_id, .. } => {
                if self.networks.get(*chain_id).is_none() {
                    return Err(eyre!("CALL_CHAIN_ID {} is not a configured network", chain_id));
                }
            }
            ActionConfig::DepositBridge {
                src_chain_id,
                dst_chain_id,
                amount,
                min_amount,
                max_amount,
                fee,
                ..
            } => {
                for id in [src_chain_id, dst_chain_id] {
                    if self.networks.get(*id).is_none() {
                        return Err(eyre!("Bridge chain {} is not a configured network", id));
                    }
                }
                if src_chain_id == dst_chain_id {
                    return Err(eyre!("Bridge source and destination must differ"));
                }
                if amount.0 > amount.1 || amount.0 <= 0.0 {
                    return Err(eyre!("BRIDGE_AMOUNT must be a positive min-max range"));
                }
                if min_amount > max_amount {
                    return Err(eyre!("BRIDGE_MIN_AMOUNT cannot exceed BRIDGE_MAX_AMOUNT"));
                }
                if *fee < 0.0 {
                    return Err(eyre!("BRIDGE_FEE cannot be negative"));
                }
            }
        }

        Ok(())
    }
}

fn load_action() -> Result<ActionConfig> {
    let kind = env::var("ACTION").unwrap_or_else(|_| "contract_call".to_string());

    match kind.as_str() {
        "contract_call" => Ok(ActionConfig::ContractCall {
            label: env::var("CALL_LABEL").unwrap_or_else(|_| "ContractCall".to_string()),
            chain_id: required("CALL_CHAIN_ID")?,
            to: required("CALL_TO")?,
            value_wei: var("CALL_VALUE_WEI")?.unwrap_or(0),
            calldata: var("CALL_DATA")?.unwrap_or_default(),
        }),
        "deposit_bridge" => {
            let token: String = required("BRIDGE_TOKEN")?;
            let amount_raw: String = required("BRIDGE_AMOUNT")?;
            Ok(ActionConfig::DepositBridge {
                src_chain_id: required("BRIDGE_SRC_CHAIN_ID")?,
                dst_chain_id: required("BRIDGE_DST_CHAIN_ID")?,
                deposit_address: required("BRIDGE_DEPOSIT_ADDRESS")?,
                dst_token: var("BRIDGE_DST_TOKEN")?.unwrap_or_else(|| token.clone()),
                token,
                amount: parse_range("BRIDGE_AMOUNT", &amount_raw)?,
                min_amount: var("BRIDGE_MIN_AMOUNT")?.unwrap_or(0.0),
                max_amount: var("BRIDGE_MAX_AMOUNT")?.unwrap_or(f64::MAX),
                fee: var("BRIDGE_FEE")?.unwrap_or(0.0),
                routing_code: var("BRIDGE_ROUTING_CODE")?,
            })
        }
        other => Err(eyre!(
            "Unknown ACTION {} (expected contract_call or deposit_bridge)",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;
    use serial_test::serial;

    const ENV_KEYS: &[&str] = &[
        "MAXIMUM_RETRY",
        "SLEEP_TIME_RETRY",
        "RECEIPT_POLL_INTERVAL_SECS",
        "RECEIPT_TIMEOUT_SECS",
        "GAS_CONTROL",
        "SOFTWARE_MODE",
        "CONTROL_TIMES_FOR_SLEEP",
        "ACCOUNTS_IN_STREAM",
        "SLEEP_TIME_STREAM",
        "NETWORKS_COUNT",
        "NETWORK_1_CHAIN_ID",
        "NETWORK_1_RPC_URLS",
        "NETWORK_2_CHAIN_ID",
        "NETWORK_2_RPC_URLS",
        "ACTION",
        "CALL_CHAIN_ID",
        "CALL_TO",
        "CALL_DATA",
        "BRIDGE_SRC_CHAIN_ID",
        "BRIDGE_DST_CHAIN_ID",
        "BRIDGE_DEPOSIT_ADDRESS",
        "BRIDGE_TOKEN",
        "BRIDGE_AMOUNT",
        "BRIDGE_ROUTING_CODE",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    fn set_networks() {
        env::set_var("NETWORKS_COUNT", "2");
        env::set_var("NETWORK_1_CHAIN_ID", "42161");
        env::set_var("NETWORK_1_RPC_URLS", "https://arb1.arbitrum.io/rpc");
        env::set_var("NETWORK_2_CHAIN_ID", "10");
        env::set_var("NETWORK_2_RPC_URLS", "https://mainnet.optimism.io");
    }

    fn test_config() -> Config {
        Config {
            retry: RetryConfig::default(),
            confirmation: ConfirmationConfig::default(),
            gas: GasConfig {
                gate: GasGateConfig::default(),
                ceiling_path: PathBuf::from(default_gas_ceiling_path()),
                maximum_gwei: default_maximum_gwei(),
            },
            runner: RunnerConfig::default(),
            networks: NetworkRegistry::new(vec![NetworkConfig {
                chain_id: 1,
                rpc_urls: vec!["http://localhost:8545".to_string()],
                ..Default::default()
            }])
            .unwrap(),
            action: ActionConfig::ContractCall {
                label: "Dmail".to_string(),
                chain_id: 1,
                to: Address::repeat_byte(1),
                value_wei: 0,
                calldata: Bytes::new(),
            },
            wallets_file: PathBuf::from(default_wallets_file()),
            gas_multiplier: default_gas_multiplier(),
            api: ApiConfig {
                enabled: false,
                bind_address: "127.0.0.1".to_string(),
                port: default_api_port(),
            },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_maximum_retry(), 3);
        assert_eq!(default_receipt_poll_interval(), 60);
        assert_eq!(default_receipt_timeout(), 1200);
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range::<u64>("K", "5-10").unwrap(), (5, 10));
        assert_eq!(parse_range::<u64>("K", "7").unwrap(), (7, 7));
        assert_eq!(parse_range::<f64>("K", "0.01 - 0.02").unwrap(), (0.01, 0.02));
        assert!(parse_range::<u64>("K", "a-b").is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.confirmation.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.retry.backoff_min = Duration::from_secs(20);
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.action = ActionConfig::ContractCall {
            label: "x".into(),
            chain_id: 999,
            to: Address::ZERO,
            value_wei: 0,
            calldata: Bytes::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_contract_call_from_env() {
        clear_env();
        set_networks();
        env::set_var("MAXIMUM_RETRY", "5");
        env::set_var("SLEEP_TIME_RETRY", "1-2");
        env::set_var("GAS_CONTROL", "true");
        env::set_var("SOFTWARE_MODE", "true");
        env::set_var("ACCOUNTS_IN_STREAM", "4");
        env::set_var("ACTION", "contract_call");
        env::set_var("CALL_CHAIN_ID", "42161");
        env::set_var("CALL_TO", "0x0000000000000000000000000000000000000042");
        env::set_var("CALL_DATA", "0x5b882e5a");

        let config = Config::load_from_env().unwrap();
        clear_env();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_max, Duration::from_secs(2));
        assert!(config.gas.gate.enabled);
        assert_eq!(config.gas.gate.cooldown.as_ref().unwrap().accounts_in_stream, 4);
        assert_eq!(config.confirmation, ConfirmationConfig::default());
        match config.action {
            ActionConfig::ContractCall { chain_id, calldata, .. } => {
                assert_eq!(chain_id, 42161);
                assert_eq!(calldata.len(), 4);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_load_bridge_from_env() {
        clear_env();
        set_networks();
        env::set_var("ACTION", "deposit_bridge");
        env::set_var("BRIDGE_SRC_CHAIN_ID", "42161");
        env::set_var("BRIDGE_DST_CHAIN_ID", "10");
        env::set_var("BRIDGE_DEPOSIT_ADDRESS", "0x80c67432656d59144ceff962e8faf8926599bcf8");
        env::set_var("BRIDGE_TOKEN", "ETH");
        env::set_var("BRIDGE_AMOUNT", "0.01-0.02");
        env::set_var("BRIDGE_ROUTING_CODE", "9007");

        let config = Config::load_from_env().unwrap();
        clear_env();

        assert_eq!(config.action.source_chain_id(), 42161);
        match config.action {
            ActionConfig::DepositBridge {
                dst_token,
                amount,
                routing_code,
                ..
            } => {
                assert_eq!(dst_token, "ETH");
                assert_eq!(amount, (0.01, 0.02));
                assert_eq!(routing_code, Some(9007));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        clear_env();
        set_networks();
        env::set_var("ACTION", "swap");
        assert!(Config::load_from_env().is_err());

        env::set_var("ACTION", "contract_call");
        env::set_var("CALL_CHAIN_ID", "42161");
        env::set_var("CALL_TO", "0x0000000000000000000000000000000000000042");
        env::set_var("MAXIMUM_RETRY", "many");
        assert!(Config::load_from_env().is_err());
        clear_env();
    }
}
