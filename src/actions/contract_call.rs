//! Arbitrary contract call (messaging, minting, check-ins)

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use tracing::info;

use super::Action;
use crate::chain::{ChainClient, TxOutcome, TxRequest};
use crate::error::ActionError;
use crate::wallet::WalletContext;

/// Sends one transaction with fixed calldata from the wallet
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub label: String,
    pub to: Address,
    pub value: u128,
    pub data: Bytes,
}

impl ContractCall {
    pub fn new(label: impl Into<String>, to: Address, value: u128, data: Bytes) -> Self {
        Self {
            label: label.into(),
            to,
            value,
            data,
        }
    }
}

#[async_trait]
impl Action for ContractCall {
    type Output = TxOutcome;

    fn name(&self) -> &str {
        &self.label
    }

    async fn run(
        &self,
        wallet: &WalletContext,
        client: &mut dyn ChainClient,
    ) -> Result<TxOutcome, ActionError> {
        let network = client.network().clone();
        info!(
            wallet = %wallet,
            chain = %network.name,
            to = %self.to,
            "{} on {}",
            self.label,
            network.name
        );

        let outcome = client
            .send_transaction(TxRequest {
                to: self.to,
                value: self.value,
                data: self.data.clone(),
            })
            .await?;

        if !outcome.succeeded() {
            return Err(ActionError::blockchain_no_retry(format!(
                "Transaction failed: {}",
                network.tx_url(&outcome.hash)
            )));
        }

        info!(
            wallet = %wallet,
            chain = %network.name,
            "Transaction was successful: {}",
            network.tx_url(&outcome.hash)
        );
        Ok(outcome)
    }
}
