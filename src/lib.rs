//! Wallet Orchestrator: retrying multi-chain wallet action runner
//!
//! Runs one on-chain action per wallet across a batch, with:
//!
//! - **Retry Policy Engine** - classifies failures, rotates RPC endpoints and
//!   backs off between attempts
//! - **Receipt Confirmation** - watches a destination-chain balance until a
//!   bridged amount lands or the timeout passes
//! - **Gas Gate** - holds actions while the chain's gas price is above an
//!   operator-editable ceiling
//!
//! Chain access goes through the [`chain::ChainClient`] trait; [`evm`] holds
//! the alloy-backed implementation; the `testing` feature adds a scripted
//! in-memory one.

pub mod actions;
pub mod api;
pub mod chain;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod evm;
pub mod gas;
pub mod metrics;
pub mod network;
pub mod retry;
pub mod runner;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wallet;

pub use actions::{Action, BridgeReceipt, ContractCall, DepositBridge};
pub use chain::{BalanceSnapshot, ChainClient, ChainConnector, TxOutcome, TxRequest, TxStatus};
pub use confirmation::{ConfirmationConfig, ReceiptWatcher, Received};
pub use error::{ActionError, FailureKind};
pub use gas::{GasCeilingStore, GasGate, GasGateConfig, GasGated};
pub use network::{NetworkConfig, NetworkRegistry};
pub use retry::{Execution, Outcome, RetryConfig, RetryEngine};
pub use runner::{BatchRunner, JobFactory, RunnerConfig, WalletReport};
pub use wallet::{Wallet, WalletContext};
