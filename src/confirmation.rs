//! Cross-chain receipt confirmation
//!
//! A bridge or withdrawal is only done once the funds show up on the
//! destination chain. The watcher opens its own client for that chain, takes a
//! balance snapshot before the funding transaction and later polls until the
//! balance grows past it or the time budget runs out.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain::{from_wei, round6, BalanceSnapshot, ChainClient, ChainConnector};
use crate::error::ActionError;
use crate::metrics;
use crate::wallet::WalletContext;

/// Shortest poll interval; a zero interval would never reach the timeout
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll settings for the destination chain
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(1200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Waiting,
    Received { amount_wei: u128 },
    TimedOut,
}

impl ConfirmationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConfirmationStatus::Waiting)
    }
}

/// State of one wait on a destination chain
#[derive(Debug, Clone)]
pub struct ConfirmationState {
    pub target_chain_id: u64,
    pub token: String,
    pub baseline: BalanceSnapshot,
    pub elapsed: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
    status: ConfirmationStatus,
}

impl ConfirmationState {
    pub fn new(
        target_chain_id: u64,
        token: impl Into<String>,
        baseline: BalanceSnapshot,
        config: &ConfirmationConfig,
    ) -> Self {
        Self {
            target_chain_id,
            token: token.into(),
            baseline,
            elapsed: Duration::ZERO,
            timeout: config.timeout,
            poll_interval: config.poll_interval.max(MIN_POLL_INTERVAL),
            status: ConfirmationStatus::Waiting,
        }
    }

    pub fn status(&self) -> ConfirmationStatus {
        self.status
    }

    /// Feed one balance reading. `None` is a failed read and counts as
    /// unchanged.
    pub fn observe(&mut self, balance_wei: Option<u128>) -> ConfirmationStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        if let Some(balance) = balance_wei {
            if balance > self.baseline.amount_wei {
                self.status = ConfirmationStatus::Received {
                    amount_wei: balance - self.baseline.amount_wei,
                };
            }
        }
        self.status
    }

    /// Account for one poll interval spent sleeping
    pub fn tick(&mut self) -> ConfirmationStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.elapsed += self.poll_interval;
        if self.elapsed >= self.timeout {
            self.status = ConfirmationStatus::TimedOut;
        }
        self.status
    }
}

/// Funds observed on the destination chain
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub amount_wei: u128,
    /// Token units, rounded to 6 decimals
    pub amount: f64,
    pub elapsed: Duration,
}

/// Watches destination-chain balances through freshly opened clients
pub struct ReceiptWatcher {
    connector: Arc<dyn ChainConnector>,
    config: ConfirmationConfig,
}

impl ReceiptWatcher {
    pub fn new(connector: Arc<dyn ChainConnector>, config: ConfirmationConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &ConfirmationConfig {
        &self.config
    }

    async fn open(&self, chain_id: u64) -> Result<Box<dyn ChainClient>, ActionError> {
        self.connector.connect(chain_id).await.map_err(|e| {
            ActionError::software(format!("Cannot connect to chain {}: {}", chain_id, e))
        })
    }

    /// Read the current balance on `chain_id` without waiting
    pub async fn snapshot(
        &self,
        wallet: &WalletContext,
        chain_id: u64,
        token: &str,
    ) -> Result<BalanceSnapshot, ActionError> {
        let mut client = self.open(chain_id).await?;
        let result = client.token_balance(token).await;
        client.close_session().await;

        let snapshot = result.map_err(|e| {
            ActionError::software(format!("Cannot read {} balance on chain {}: {}", token, chain_id, e))
        })?;
        debug!(
            wallet = %wallet,
            chain = %chain_id,
            token = %token,
            balance = snapshot.amount,
            "Destination balance snapshot"
        );
        Ok(snapshot)
    }

    /// Poll `chain_id` until the `token` balance exceeds `baseline`
    pub async fn await_receipt(
        &self,
        wallet: &WalletContext,
        chain_id: u64,
        token: &str,
        baseline: &BalanceSnapshot,
    ) -> Result<Received, ActionError> {
        let mut client = self.open(chain_id).await?;
        let result = self.poll(wallet, client.as_ref(), chain_id, token, baseline).await;
        client.close_session().await;

        metrics::record_receipt(&chain_id.to_string(), result.is_ok());
        result
    }

    async fn poll(
        &self,
        wallet: &WalletContext,
        client: &dyn ChainClient,
        chain_id: u64,
        token: &str,
        baseline: &BalanceSnapshot,
    ) -> Result<Received, ActionError> {
        let network = client.network().name.clone();
        let decimals = if client.network().is_native(token) {
            client.network().native_decimals
        } else {
            client.decimals(token).await.map_err(|e| {
                ActionError::software(format!("Cannot read {} decimals on {}: {}", token, network, e))
            })?
        };

        let mut state = ConfirmationState::new(chain_id, token, baseline.clone(), &self.config);
        info!(
            wallet = %wallet,
            chain = %network,
            token = %token,
            timeout_secs = state.timeout.as_secs(),
            "Waiting for {} on {}",
            token,
            network
        );

        loop {
            let reading = match client.token_balance(token).await {
                Ok(snapshot) => Some(snapshot.amount_wei),
                Err(e) => {
                    debug!(wallet = %wallet, chain = %network, error = %e, "Balance read failed, treating as unchanged");
                    None
                }
            };

            if let ConfirmationStatus::Received { amount_wei } = state.observe(reading) {
                let amount = round6(from_wei(amount_wei, decimals));
                info!(
                    wallet = %wallet,
                    chain = %network,
                    token = %token,
                    amount,
                    elapsed_secs = state.elapsed.as_secs(),
                    "{} was received on {}: {}",
                    token,
                    network,
                    amount
                );
                return Ok(Received {
                    amount_wei,
                    amount,
                    elapsed: state.elapsed,
                });
            }

            debug!(
                wallet = %wallet,
                chain = %network,
                elapsed_secs = state.elapsed.as_secs(),
                "Still waiting for {}",
                token
            );
            tokio::time::sleep(state.poll_interval).await;

            if state.tick() == ConfirmationStatus::TimedOut {
                warn!(wallet = %wallet, chain = %network, token = %token, "Receipt timed out");
                return Err(ActionError::software(format!(
                    "{} has not been received within {} seconds",
                    token,
                    state.timeout.as_secs()
                )));
            }
        }
    }
}
