//! Chain client abstraction
//!
//! The retry engine, the receipt watcher and the gas gate only talk to chains
//! through [`ChainClient`]. One client is one wallet connected to one network;
//! it is owned by a single in-flight action at a time, so implementations do
//! not lock internally.

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;

use crate::error::ActionError;
use crate::network::NetworkConfig;

/// Balance of one token at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    pub amount_wei: u128,
    pub amount: f64,
    pub symbol: String,
}

impl BalanceSnapshot {
    pub fn new(amount_wei: u128, decimals: u8, symbol: impl Into<String>) -> Self {
        Self {
            amount_wei,
            amount: from_wei(amount_wei, decimals),
            symbol: symbol.into(),
        }
    }
}

/// Convert a raw amount into token units
pub fn from_wei(amount_wei: u128, decimals: u8) -> f64 {
    amount_wei as f64 / 10f64.powi(decimals as i32)
}

/// Convert token units into a raw amount, truncating extra precision
pub fn to_wei(amount: f64, decimals: u8) -> u128 {
    (amount * 10f64.powi(decimals as i32)) as u128
}

/// Round to 6 decimal places, the precision amounts are reported with
pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// A transaction to submit from the wallet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxRequest {
    pub to: Address,
    pub value: u128,
    pub data: Bytes,
}

/// Result of a submitted transaction
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutcome {
    pub hash: String,
    pub status: TxStatus,
}

impl TxOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            TxStatus::Confirmed | TxStatus::Unconfirmed | TxStatus::AlreadyKnown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Mined with status 1
    Confirmed,
    /// Mined with status 0
    Reverted,
    /// Sent, but not mined before the network's timeout (accepted by quirk)
    Unconfirmed,
    /// The node already had this transaction
    AlreadyKnown,
}

/// One wallet connected to one network
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Network this client is connected to
    fn network(&self) -> &NetworkConfig;

    /// Wallet address
    fn address(&self) -> Address;

    /// RPC endpoint currently in use
    fn current_rpc(&self) -> &str;

    /// Balance of `token` (symbol as configured for the network)
    async fn token_balance(&self, token: &str) -> Result<BalanceSnapshot, ActionError>;

    /// Decimals of `token`; the native token uses the network's native decimals
    async fn decimals(&self, token: &str) -> Result<u8, ActionError>;

    /// Current gas price in gwei
    async fn gas_price_gwei(&self) -> Result<f64, ActionError>;

    /// Sign, send and wait for the transaction
    async fn send_transaction(&self, tx: TxRequest) -> Result<TxOutcome, ActionError>;

    /// Switch to another endpoint from the network's pool
    async fn change_rpc(&mut self);

    /// Release the network session. Calling it twice is a no-op.
    async fn close_session(&mut self);
}

/// Opens fresh clients for the same wallet on other chains
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self, chain_id: u64) -> Result<Box<dyn ChainClient>, ActionError>;
}
