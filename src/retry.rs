//! Retry policy engine
//!
//! Wraps a single [`Action`] invocation: classifies each failure, rotates the
//! RPC endpoint when the node is suspected, sleeps a jittered backoff between
//! attempts and always releases the client's session before returning. The
//! caller gets an [`Execution`] back, never an error, so a batch can carry on
//! with the next wallet.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::actions::Action;
use crate::chain::ChainClient;
use crate::error::{ActionError, FailureKind};
use crate::metrics;
use crate::wallet::WalletContext;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; the engine makes at most
    /// `max_retries + 1` invocations
    pub max_retries: u32,
    /// Lower bound of the sleep between attempts
    pub backoff_min: Duration,
    /// Upper bound of the sleep between attempts
    pub backoff_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Random delay within the backoff range
    pub fn backoff_delay(&self) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        if max <= min {
            return self.backoff_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Check if another attempt is allowed after `failures` failures
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// Decision taken after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Switch RPC endpoint, sleep, try again
    RotateAndRetry(Duration),
    /// Sleep, try again on the same endpoint
    RetryAfter(Duration),
    /// The domain asked not to retry, or funds are missing
    Stop,
    /// Unclassified failure, terminal without retry
    Abort,
    /// Retry budget spent
    Exhausted,
}

/// Per-call attempt bookkeeping
#[derive(Debug, Default)]
pub struct AttemptState {
    /// Failures so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub stop: bool,
}

impl AttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: &ActionError) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
    }

    /// Decide what to do after the failure just recorded
    pub fn next_action(
        &mut self,
        config: &RetryConfig,
        kind: FailureKind,
        suspects_node: bool,
    ) -> RetryAction {
        match kind {
            FailureKind::RecoverableNoRetry | FailureKind::FatalFunds => {
                self.stop = true;
                RetryAction::Stop
            }
            FailureKind::Unknown => {
                self.stop = true;
                RetryAction::Abort
            }
            _ if !config.should_retry(self.attempts) => RetryAction::Exhausted,
            FailureKind::Transient => RetryAction::RotateAndRetry(config.backoff_delay()),
            FailureKind::Recoverable if suspects_node => {
                RetryAction::RotateAndRetry(config.backoff_delay())
            }
            FailureKind::Recoverable => RetryAction::RetryAfter(config.backoff_delay()),
        }
    }
}

/// Final result of an engine call
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    /// Terminated by a no-retry or insufficient-funds failure
    Stopped(String),
    /// Every allowed attempt failed
    Exhausted(String),
    /// Unclassified failure
    Aborted(String),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Stopped(_) => "stopped",
            Outcome::Exhausted(_) => "exhausted",
            Outcome::Aborted(_) => "aborted",
        }
    }

    /// The terminal message for failed outcomes
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Stopped(r) | Outcome::Exhausted(r) | Outcome::Aborted(r) => Some(r),
        }
    }
}

/// What happened during one engine call
#[derive(Debug)]
pub struct Execution<T> {
    pub outcome: Outcome<T>,
    /// Action invocations made
    pub attempts: u32,
    pub rotations: u32,
    pub backoff_sleeps: u32,
}

impl<T> Execution<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Runs actions under a [`RetryConfig`]
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `action` against `client` until it succeeds, stops or runs out of
    /// attempts. The client's session is closed before returning.
    pub async fn execute<A>(
        &self,
        wallet: &WalletContext,
        client: &mut dyn ChainClient,
        action: &A,
    ) -> Execution<A::Output>
    where
        A: Action + ?Sized,
    {
        let chain = client.network().name.clone();
        let component = action.name().to_string();
        let max_attempts = self.config.max_retries + 1;

        let mut state = AttemptState::new();
        let mut invocations = 0;
        let mut rotations = 0;
        let mut backoff_sleeps = 0;

        let outcome = loop {
            invocations += 1;
            metrics::record_attempt(&component, &chain);

            let err = match action.run(wallet, &mut *client).await {
                Ok(output) => break Outcome::Success(output),
                Err(err) => err,
            };

            state.record_failure(&err);
            let kind = err.kind();
            metrics::record_failure(&chain, kind.as_str());
            let attempt = format!("{}/{}", state.attempts, max_attempts);

            match state.next_action(&self.config, kind, err.suspects_node()) {
                RetryAction::RotateAndRetry(delay) => {
                    if kind == FailureKind::Transient {
                        warn!(
                            wallet = %wallet,
                            chain = %chain,
                            component = %component,
                            attempt = %attempt,
                            error = %err,
                            "Connection to RPC is not stable, switching endpoint"
                        );
                    } else {
                        warn!(
                            wallet = %wallet,
                            chain = %chain,
                            component = %component,
                            attempt = %attempt,
                            error = %err,
                            "Maybe problem with node, switching endpoint"
                        );
                    }
                    client.change_rpc().await;
                    rotations += 1;
                    metrics::record_rotation(&chain);
                    debug!(wallet = %wallet, rpc = %client.current_rpc(), ?delay, "Retrying after backoff");
                    tokio::time::sleep(delay).await;
                    backoff_sleeps += 1;
                }
                RetryAction::RetryAfter(delay) => {
                    warn!(
                        wallet = %wallet,
                        chain = %chain,
                        component = %component,
                        attempt = %attempt,
                        error = %err,
                        ?delay,
                        "Action failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    backoff_sleeps += 1;
                }
                RetryAction::Stop => {
                    if kind == FailureKind::FatalFunds {
                        error!(
                            wallet = %wallet,
                            chain = %chain,
                            component = %component,
                            attempt = %attempt,
                            reason = ?err.reason(),
                            "Insufficient funds on {}, software will stop this action",
                            chain
                        );
                    } else {
                        error!(
                            wallet = %wallet,
                            chain = %chain,
                            component = %component,
                            attempt = %attempt,
                            "{}",
                            err
                        );
                    }
                    break Outcome::Stopped(err.to_string());
                }
                RetryAction::Abort => {
                    error!(
                        wallet = %wallet,
                        chain = %chain,
                        component = %component,
                        attempt = %attempt,
                        error = ?err,
                        "Unknown error, action aborted without retry"
                    );
                    break Outcome::Aborted(err.to_string());
                }
                RetryAction::Exhausted => {
                    error!(
                        wallet = %wallet,
                        chain = %chain,
                        component = %component,
                        attempt = %attempt,
                        last_error = %err,
                        "Tries are over, software will stop this action"
                    );
                    break Outcome::Exhausted(err.to_string());
                }
            }
        };

        client.close_session().await;
        metrics::record_outcome(&component, outcome.as_str());

        if outcome.is_success() {
            info!(
                wallet = %wallet,
                chain = %chain,
                component = %component,
                attempts = invocations,
                "Action completed"
            );
        }

        Execution {
            outcome,
            attempts: invocations,
            rotations,
            backoff_sleeps,
        }
    }
}
