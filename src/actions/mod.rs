//! Wallet actions
//!
//! An action is one financial operation for one wallet. It raises classified
//! [`ActionError`]s and leaves retrying, RPC rotation and session cleanup to
//! the retry engine.

use async_trait::async_trait;

use crate::chain::ChainClient;
use crate::error::ActionError;
use crate::wallet::WalletContext;

pub mod contract_call;
pub mod deposit_bridge;

pub use contract_call::ContractCall;
pub use deposit_bridge::{BridgeReceipt, DepositBridge};

#[async_trait]
pub trait Action: Send + Sync {
    type Output: Send;

    /// Component name used in logs and metrics
    fn name(&self) -> &str;

    async fn run(
        &self,
        wallet: &WalletContext,
        client: &mut dyn ChainClient,
    ) -> Result<Self::Output, ActionError>;
}
