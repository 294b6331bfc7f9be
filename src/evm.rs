//! EVM chain client over alloy
//!
//! One [`EvmChainClient`] is one wallet connected to one network through an
//! HTTP provider with a local signer. Endpoints are picked at random from the
//! network's pool and rotated by the retry engine.

use alloy::{
    eips::BlockNumberOrTag,
    network::{Ethereum, EthereumWallet, TransactionBuilder},
    primitives::{Address, TxHash, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    sol,
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use eyre::{eyre, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain::{BalanceSnapshot, ChainClient, ChainConnector, TxOutcome, TxRequest, TxStatus};
use crate::error::{classify_rpc_error, normalize_error, ActionError};
use crate::network::{NetworkConfig, NetworkRegistry};

sol! {
    /// Minimal ERC20 interface
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// Seconds between receipt polls after sending
const RECEIPT_POLL_SECS: u64 = 10;
/// Blocks of fee history averaged for the priority fee
const FEE_HISTORY_BLOCKS: u64 = 25;
const FEE_HISTORY_PERCENTILE: f64 = 20.0;

type EvmProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    RootProvider<Http<Client>>,
    Http<Client>,
    Ethereum,
>;

fn build_provider(wallet: &EthereumWallet, rpc_url: &str) -> Result<EvmProvider> {
    Ok(ProviderBuilder::new().wallet(wallet.clone()).on_http(
        rpc_url
            .parse()
            .map_err(|e| eyre!("Invalid RPC URL {}: {}", rpc_url, e))?,
    ))
}

fn rpc_error(e: impl std::fmt::Display) -> ActionError {
    classify_rpc_error(&e.to_string())
}

fn wei_to_gwei(wei: u128) -> f64 {
    wei as f64 / 1e9
}

fn gwei_to_wei(gwei: f64) -> u128 {
    (gwei * 1e9) as u128
}

/// Average of the non-zero first-percentile rewards over the history window
pub fn priority_fee_from_rewards(rewards: &[Vec<u128>]) -> u128 {
    let non_empty: Vec<u128> = rewards
        .iter()
        .filter_map(|block| block.first().copied())
        .filter(|fee| *fee != 0)
        .collect();
    let divisor = non_empty.len().max(1) as f64;
    (non_empty.iter().sum::<u128>() as f64 / divisor).round() as u128
}

/// Random gas price in a fixed gwei range, rounded to 0.1 gwei
pub fn legacy_gas_price_wei((min, max): (f64, f64)) -> u128 {
    let gwei = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    gwei_to_wei((gwei * 10.0).round() / 10.0)
}

/// Wallet client for one EVM network
pub struct EvmChainClient {
    network: NetworkConfig,
    wallet: EthereumWallet,
    address: Address,
    rpc_url: String,
    provider: Option<Arc<EvmProvider>>,
    gas_multiplier: f64,
}

impl EvmChainClient {
    /// Connect `private_key` to a random endpoint of `network`
    pub fn new(network: NetworkConfig, private_key: &str, gas_multiplier: f64) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| eyre!("Invalid private key: {}", e))?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let rpc_url = network
            .rpc_urls
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| eyre!("Network {} has no RPC URLs", network.name))?;
        let provider = build_provider(&wallet, &rpc_url)?;

        debug!(
            address = %address,
            chain = %network.name,
            rpc = %rpc_url,
            "EVM client initialized"
        );

        Ok(Self {
            network,
            wallet,
            address,
            rpc_url,
            provider: Some(Arc::new(provider)),
            gas_multiplier,
        })
    }

    fn provider(&self) -> Result<Arc<EvmProvider>, ActionError> {
        self.provider
            .clone()
            .ok_or_else(|| ActionError::transient(format!("Session to {} is closed", self.network.name)))
    }

    fn token_address(&self, token: &str) -> Result<Address, ActionError> {
        self.network.token_address(token).ok_or_else(|| {
            ActionError::no_retry(format!("{} is not configured on {}", token, self.network.name))
        })
    }

    /// Fill fee fields according to the network's fee model
    async fn apply_fees(
        &self,
        provider: &EvmProvider,
        mut tx: TransactionRequest,
    ) -> Result<TransactionRequest, ActionError> {
        if let Some(range) = self.network.quirks.legacy_gas_gwei {
            tx.set_gas_price(legacy_gas_price_wei(range));
            return Ok(tx);
        }

        let gas_price = provider.get_gas_price().await.map_err(rpc_error)?;
        if !self.network.eip1559 {
            tx.set_gas_price(gas_price);
            return Ok(tx);
        }

        let priority_fee = match self.network.quirks.priority_fee_divisor {
            Some(divisor) => gas_price / divisor,
            None => {
                let history = provider
                    .get_fee_history(
                        FEE_HISTORY_BLOCKS,
                        BlockNumberOrTag::Latest,
                        &[FEE_HISTORY_PERCENTILE],
                    )
                    .await
                    .map_err(rpc_error)?;
                priority_fee_from_rewards(history.reward.as_deref().unwrap_or_default())
            }
        };

        tx.set_max_priority_fee_per_gas(priority_fee);
        tx.set_max_fee_per_gas(gas_price + priority_fee);
        Ok(tx)
    }

    async fn wait_for_receipt(
        &self,
        provider: &EvmProvider,
        hash: TxHash,
    ) -> Result<TxOutcome, ActionError> {
        let timeout = self.network.quirks.tx_timeout_secs;
        let mut waited = 0;
        let hash_str = hash.to_string();

        loop {
            match provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status() {
                        info!(
                            chain = %self.network.name,
                            "Transaction was successful: {}",
                            self.network.tx_url(&hash_str)
                        );
                        return Ok(TxOutcome {
                            hash: hash_str,
                            status: TxStatus::Confirmed,
                        });
                    }
                    warn!(
                        chain = %self.network.name,
                        "Transaction failed: {}",
                        self.network.tx_url(&hash_str)
                    );
                    return Ok(TxOutcome {
                        hash: hash_str,
                        status: TxStatus::Reverted,
                    });
                }
                Ok(None) => {
                    if waited > timeout {
                        if self.network.quirks.accept_unconfirmed {
                            warn!(
                                chain = %self.network.name,
                                tx = %hash_str,
                                "Transaction was sent and tried to be confirmed, but not finished yet"
                            );
                            return Ok(TxOutcome {
                                hash: hash_str,
                                status: TxStatus::Unconfirmed,
                            });
                        }
                        return Err(ActionError::transient(format!(
                            "Transaction is not in the chain after {} seconds",
                            timeout
                        )));
                    }
                }
                Err(e) => {
                    warn!(chain = %self.network.name, error = %e, "RPC got bad receipt response");
                }
            }
            waited += RECEIPT_POLL_SECS;
            tokio::time::sleep(Duration::from_secs(RECEIPT_POLL_SECS)).await;
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn network(&self) -> &NetworkConfig {
        &self.network
    }

    fn address(&self) -> Address {
        self.address
    }

    fn current_rpc(&self) -> &str {
        &self.rpc_url
    }

    async fn token_balance(&self, token: &str) -> Result<BalanceSnapshot, ActionError> {
        let provider = self.provider()?;

        if self.network.is_native(token) {
            let balance = provider.get_balance(self.address).await.map_err(rpc_error)?;
            let wei = u128::try_from(balance)
                .map_err(|_| ActionError::software(format!("{} balance does not fit u128", token)))?;
            return Ok(BalanceSnapshot::new(wei, self.network.native_decimals, token));
        }

        let contract = IERC20::new(self.token_address(token)?, provider);
        let balance = contract
            .balanceOf(self.address)
            .call()
            .await
            .map_err(rpc_error)?
            ._0;
        let decimals = contract.decimals().call().await.map_err(rpc_error)?._0;
        let symbol = contract.symbol().call().await.map_err(rpc_error)?._0;
        let wei = u128::try_from(balance)
            .map_err(|_| ActionError::software(format!("{} balance does not fit u128", token)))?;
        Ok(BalanceSnapshot::new(wei, decimals, symbol))
    }

    async fn decimals(&self, token: &str) -> Result<u8, ActionError> {
        if self.network.is_native(token) {
            return Ok(self.network.native_decimals);
        }
        let contract = IERC20::new(self.token_address(token)?, self.provider()?);
        Ok(contract.decimals().call().await.map_err(rpc_error)?._0)
    }

    async fn gas_price_gwei(&self) -> Result<f64, ActionError> {
        let provider = self.provider()?;
        let wei = provider.get_gas_price().await.map_err(rpc_error)?;
        Ok(wei_to_gwei(wei))
    }

    async fn send_transaction(&self, request: TxRequest) -> Result<TxOutcome, ActionError> {
        let provider = self.provider()?;

        let nonce = provider
            .get_transaction_count(self.address)
            .await
            .map_err(rpc_error)?;

        let tx = TransactionRequest::default()
            .with_from(self.address)
            .with_to(request.to)
            .with_value(U256::from(request.value))
            .with_input(request.data)
            .with_chain_id(self.network.chain_id)
            .with_nonce(nonce);
        let mut tx = self.apply_fees(&provider, tx).await?;

        let gas = provider
            .estimate_gas(&tx)
            .await
            .map_err(rpc_error)?;
        tx.set_gas_limit((gas as f64 * self.gas_multiplier) as u64);

        let hash = match provider.send_transaction(tx).await {
            Ok(pending) => *pending.tx_hash(),
            Err(e) => {
                let message = normalize_error(&e.to_string());
                if message == "already known" {
                    warn!(chain = %self.network.name, "RPC got error, but tx was send");
                    return Ok(TxOutcome {
                        hash: String::new(),
                        status: TxStatus::AlreadyKnown,
                    });
                }
                return Err(rpc_error(e));
            }
        };

        debug!(chain = %self.network.name, tx = %hash, nonce, "Transaction sent");
        self.wait_for_receipt(&provider, hash).await
    }

    async fn change_rpc(&mut self) {
        let candidates: Vec<&String> = self
            .network
            .rpc_urls
            .iter()
            .filter(|url| **url != self.rpc_url)
            .collect();
        let Some(next) = candidates.choose(&mut rand::thread_rng()).map(|u| u.to_string()) else {
            // single endpoint pool: reconnect to the same one
            if self.provider.is_none() {
                self.provider = build_provider(&self.wallet, &self.rpc_url).ok().map(Arc::new);
            }
            return;
        };

        match build_provider(&self.wallet, &next) {
            Ok(provider) => {
                info!(
                    chain = %self.network.name,
                    from = %self.rpc_url,
                    to = %next,
                    "Switched RPC endpoint"
                );
                self.rpc_url = next;
                self.provider = Some(Arc::new(provider));
            }
            Err(e) => warn!(chain = %self.network.name, error = %e, "Failed to switch RPC endpoint"),
        }
    }

    async fn close_session(&mut self) {
        if self.provider.take().is_some() {
            debug!(chain = %self.network.name, "Session closed");
        }
    }
}

/// Opens [`EvmChainClient`]s for one wallet
pub struct EvmConnector {
    registry: Arc<NetworkRegistry>,
    private_key: String,
    gas_multiplier: f64,
}

impl EvmConnector {
    pub fn new(registry: Arc<NetworkRegistry>, private_key: impl Into<String>, gas_multiplier: f64) -> Self {
        Self {
            registry,
            private_key: private_key.into(),
            gas_multiplier,
        }
    }
}

#[async_trait]
impl ChainConnector for EvmConnector {
    async fn connect(&self, chain_id: u64) -> Result<Box<dyn ChainClient>, ActionError> {
        let network = self
            .registry
            .get(chain_id)
            .cloned()
            .ok_or_else(|| ActionError::no_retry(format!("Chain {} is not configured", chain_id)))?;
        let client = EvmChainClient::new(network, &self.private_key, self.gas_multiplier)
            .map_err(|e| ActionError::software(e.to_string()))?;
        Ok(Box::new(client))
    }
}
