//! Deposit-address bridge
//!
//! Funds are sent straight to a maker address on the source chain and show up
//! on the destination chain some minutes later. The last four digits of the
//! sent amount carry the routing code the maker uses to pick the destination,
//! so the amount is rounded before the code is added.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::Action;
use crate::chain::{from_wei, round6, to_wei, ChainClient, TxOutcome, TxRequest};
use crate::confirmation::{ReceiptWatcher, Received};
use crate::error::ActionError;
use crate::evm::IERC20;
use crate::wallet::WalletContext;

const ROUTING_MODULUS: u128 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeReceipt {
    pub tx: TxOutcome,
    /// Raw amount sent, fee and routing code included
    pub sent_wei: u128,
    pub received: Received,
}

pub struct DepositBridge {
    /// Maker address funds are sent to
    pub deposit_address: Address,
    pub dst_chain_id: u64,
    /// Token symbol on the source chain
    pub token: String,
    /// Token symbol watched on the destination chain
    pub dst_token: String,
    /// Amount to bridge, in token units
    pub amount: f64,
    pub min_amount: f64,
    pub max_amount: f64,
    /// Maker fee, in token units
    pub fee: f64,
    /// Routing code encoded in the last four digits of the amount
    pub routing_code: Option<u32>,
    pub watcher: Arc<ReceiptWatcher>,
}

impl DepositBridge {
    /// Raw amount to send: amount plus fee, rounded to 10^4 with the routing
    /// code in the low digits
    pub fn full_amount(&self, decimals: u8) -> Result<u128, ActionError> {
        let fee_wei = to_wei(self.fee, decimals);
        let total = to_wei(self.amount, decimals) + fee_wei;

        let Some(code) = self.routing_code else {
            return Ok(total);
        };
        let code = code as u128;
        if code >= ROUTING_MODULUS {
            return Err(ActionError::no_retry(format!("Invalid routing code {}", code)));
        }

        let full = round_half_even(total, ROUTING_MODULUS) + code;
        if full % ROUTING_MODULUS != code {
            return Err(ActionError::no_retry(
                "Amount does not carry the routing code, refusing to send",
            ));
        }
        Ok(full)
    }
}

/// Round to a multiple of `step`, ties to even
fn round_half_even(value: u128, step: u128) -> u128 {
    let rem = value % step;
    let base = value - rem;
    let half = step / 2;
    if rem > half || (rem == half && (base / step) % 2 == 1) {
        base + step
    } else {
        base
    }
}

#[async_trait]
impl Action for DepositBridge {
    type Output = BridgeReceipt;

    fn name(&self) -> &str {
        "DepositBridge"
    }

    async fn run(
        &self,
        wallet: &WalletContext,
        client: &mut dyn ChainClient,
    ) -> Result<BridgeReceipt, ActionError> {
        let network = client.network().clone();
        info!(
            wallet = %wallet,
            chain = %network.name,
            "Bridge: {} {} from {} to chain {}",
            self.amount,
            self.token,
            network.name,
            self.dst_chain_id
        );

        if self.amount < self.min_amount || self.amount > self.max_amount {
            return Err(ActionError::no_retry(format!(
                "Limit range for bridge: {} - {} {}",
                self.min_amount, self.max_amount, self.token
            )));
        }

        let decimals = if network.is_native(&self.token) {
            network.native_decimals
        } else {
            client.decimals(&self.token).await?
        };
        let full_amount = self.full_amount(decimals)?;

        let balance = client.token_balance(&self.token).await?;
        if balance.amount_wei <= full_amount {
            return Err(ActionError::no_retry("Insufficient balance!"));
        }

        let tx = if network.is_native(&self.token) {
            TxRequest {
                to: self.deposit_address,
                value: full_amount,
                data: Bytes::new(),
            }
        } else {
            let token_address = network.token_address(&self.token).ok_or_else(|| {
                ActionError::no_retry(format!("{} is not configured on {}", self.token, network.name))
            })?;
            let call = IERC20::transferCall {
                to: self.deposit_address,
                amount: U256::from(full_amount),
            };
            TxRequest {
                to: token_address,
                value: 0,
                data: call.abi_encode().into(),
            }
        };

        let baseline = self
            .watcher
            .snapshot(wallet, self.dst_chain_id, &self.dst_token)
            .await?;

        let outcome = client.send_transaction(tx).await?;
        if !outcome.succeeded() {
            return Err(ActionError::blockchain_no_retry(format!(
                "Transaction failed: {}",
                network.tx_url(&outcome.hash)
            )));
        }

        info!(
            wallet = %wallet,
            chain = %network.name,
            sent = round6(from_wei(full_amount, decimals)),
            "Bridge complete. Note: wait a little for receiving funds"
        );

        // funds are already on their way; a resend would pay twice
        let received = self
            .watcher
            .await_receipt(wallet, self.dst_chain_id, &self.dst_token, &baseline)
            .await
            .map_err(|e| {
                ActionError::no_retry(format!(
                    "Bridge sent ({}) but not confirmed on chain {}: {}",
                    network.tx_url(&outcome.hash),
                    self.dst_chain_id,
                    e
                ))
            })?;

        Ok(BridgeReceipt {
            tx: outcome,
            sent_wei: full_amount,
            received,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::ConfirmationConfig;
    use crate::error::FailureKind;
    use crate::testing::{test_wallet, MockChainClient, MockConnector};
    use std::time::Duration;

    const ETH: u128 = 1_000_000_000_000_000_000;

    fn bridge(connector: Arc<MockConnector>, amount: f64) -> DepositBridge {
        DepositBridge {
            deposit_address: Address::repeat_byte(0xe4),
            dst_chain_id: 10,
            token: "ETH".into(),
            dst_token: "ETH".into(),
            amount,
            min_amount: 0.005,
            max_amount: 3.0,
            fee: 0.0012,
            routing_code: Some(9007),
            watcher: Arc::new(ReceiptWatcher::new(
                connector,
                ConfirmationConfig {
                    poll_interval: Duration::from_secs(30),
                    timeout: Duration::from_secs(600),
                },
            )),
        }
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(12_345_678, 10_000), 12_350_000);
        assert_eq!(round_half_even(12_344_999, 10_000), 12_340_000);
        assert_eq!(round_half_even(15_000, 10_000), 20_000);
        assert_eq!(round_half_even(25_000, 10_000), 20_000);
    }

    #[test]
    fn test_full_amount_carries_routing_code() {
        let b = bridge(Arc::new(MockConnector::new()), 0.1);
        let full = b.full_amount(18).unwrap();
        assert_eq!(full % 10_000, 9007);
        assert!(full > 101_190_000_000_000_000 && full < 101_210_000_000_000_000);

        let mut plain = bridge(Arc::new(MockConnector::new()), 0.25);
        plain.fee = 0.5;
        plain.routing_code = None;
        assert_eq!(plain.full_amount(6).unwrap(), 750_000);

        plain.routing_code = Some(10_000);
        assert!(plain.full_amount(6).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_amount_out_of_range_is_no_retry() {
        let b = bridge(Arc::new(MockConnector::new()), 10.0);
        let mut client = MockChainClient::new(1);

        let err = b.run(&test_wallet(), &mut client).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::RecoverableNoRetry);
        assert!(err.to_string().starts_with("Limit range for bridge"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_balance_is_no_retry() {
        let b = bridge(Arc::new(MockConnector::new()), 0.5);
        let mut client = MockChainClient::new(1).with_balances("ETH", vec![Ok(ETH / 10)]);
        let stats = client.stats();

        let err = b.run(&test_wallet(), &mut client).await.unwrap_err();

        assert_eq!(err.to_string(), "Insufficient balance!");
        assert_eq!(stats.sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_sends_and_waits_for_receipt() {
        let connector = Arc::new(MockConnector::new());
        // snapshot client, then polling client
        connector.push(MockChainClient::new(10).with_balances("ETH", vec![Ok(ETH)]));
        let dst = MockChainClient::new(10)
            .with_balances("ETH", vec![Ok(ETH), Ok(ETH + ETH / 10)]);
        let dst_stats = dst.stats();
        connector.push(dst);

        let b = bridge(connector.clone(), 0.1);
        let mut client = MockChainClient::new(1).with_balances("ETH", vec![Ok(2 * ETH)]);
        let sent = client.sent();

        let receipt = b.run(&test_wallet(), &mut client).await.unwrap();

        assert_eq!(receipt.sent_wei % 10_000, 9007);
        assert_eq!(receipt.received.amount, 0.1);
        assert_eq!(receipt.received.elapsed, Duration::from_secs(30));
        assert_eq!(connector.connects(), 2);
        assert_eq!(dst_stats.closes(), 1);

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].to, Address::repeat_byte(0xe4));
        assert_eq!(sent[0].value, receipt.sent_wei);
        assert!(sent[0].data.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_timeout_after_send_is_no_retry() {
        let connector = Arc::new(MockConnector::new());
        connector.push(MockChainClient::new(10).with_balances("ETH", vec![Ok(ETH)]));
        connector.push(MockChainClient::new(10).with_balances("ETH", vec![Ok(ETH)]));

        let b = bridge(connector, 0.1);
        let mut client = MockChainClient::new(1).with_balances("ETH", vec![Ok(2 * ETH)]);

        let started = tokio::time::Instant::now();
        let err = b.run(&test_wallet(), &mut client).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::RecoverableNoRetry);
        assert!(err
            .to_string()
            .ends_with("ETH has not been received within 600 seconds"));
        assert_eq!(started.elapsed(), Duration::from_secs(600));
        assert_eq!(client.stats().sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_erc20_bridge_encodes_transfer() {
        let usdc = Address::repeat_byte(0xaf);
        let connector = Arc::new(MockConnector::new());
        connector.push(MockChainClient::new(10).with_balances("USDC", vec![Ok(0)]));
        connector.push(
            MockChainClient::new(10)
                .with_decimals("USDC", 6)
                .with_balances("USDC", vec![Ok(4_990_000)]),
        );

        let mut b = bridge(connector, 5.0);
        b.token = "USDC".into();
        b.dst_token = "USDC".into();
        b.max_amount = 100.0;
        b.fee = 0.0;
        b.routing_code = None;

        let mut client = MockChainClient::new(1)
            .with_token("USDC", usdc)
            .with_decimals("USDC", 6)
            .with_balances("USDC", vec![Ok(50_000_000)]);
        let sent = client.sent();

        let receipt = b.run(&test_wallet(), &mut client).await.unwrap();
        assert_eq!(receipt.received.amount, 4.99);

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].to, usdc);
        assert_eq!(sent[0].value, 0);
        let call = IERC20::transferCall::abi_decode(&sent[0].data, true).unwrap();
        assert_eq!(call.to, Address::repeat_byte(0xe4));
        assert_eq!(call.amount, U256::from(5_000_000u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_token_is_no_retry() {
        let mut b = bridge(Arc::new(MockConnector::new()), 5.0);
        b.token = "USDT".into();
        b.max_amount = 100.0;
        b.routing_code = None;
        let mut client = MockChainClient::new(1)
            .with_decimals("USDT", 6)
            .with_balances("USDT", vec![Ok(50_000_000)]);

        let err = b.run(&test_wallet(), &mut client).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::RecoverableNoRetry);
        assert_eq!(client.stats().sends(), 0);
    }
}
