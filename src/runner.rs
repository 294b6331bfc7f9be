//! Batch execution over many wallets
//!
//! Every wallet runs as its own tokio task with its own chain client, so a
//! slow or failing wallet never holds up the others. Each task can be bounded
//! by a timeout and the whole batch stops on the shutdown channel.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::actions::Action;
use crate::api::SharedStats;
use crate::chain::ChainConnector;
use crate::metrics;
use crate::retry::RetryEngine;
use crate::wallet::{Wallet, WalletContext};

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Upper bound for one wallet's whole engine call
    pub per_wallet_timeout: Option<Duration>,
    /// Random gap between consecutive wallet starts
    pub start_delay_min: Duration,
    pub start_delay_max: Duration,
    /// Wallets running at once; 0 means no limit
    pub max_concurrent: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            per_wallet_timeout: None,
            start_delay_min: Duration::ZERO,
            start_delay_max: Duration::ZERO,
            max_concurrent: 0,
        }
    }
}

impl RunnerConfig {
    fn start_delay(&self) -> Duration {
        let min = self.start_delay_min.as_millis() as u64;
        let max = self.start_delay_max.as_millis() as u64;
        if max <= min {
            return self.start_delay_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Builds the per-wallet pieces of a batch
pub trait JobFactory: Send + Sync + 'static {
    type Action: Action + 'static;

    /// Chain the action starts on
    fn source_chain_id(&self) -> u64;

    fn connector(&self, wallet: &Wallet) -> Arc<dyn ChainConnector>;

    fn action(&self, wallet: &Wallet, connector: Arc<dyn ChainConnector>) -> Self::Action;
}

/// Result for one wallet
#[derive(Debug, Clone)]
pub struct WalletReport {
    pub wallet: String,
    pub index: usize,
    pub success: bool,
    /// "success", "stopped", "exhausted", "aborted", "timed_out" or
    /// "connect_failed"
    pub outcome: String,
    pub reason: Option<String>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl WalletReport {
    fn failed(ctx: &WalletContext, outcome: &str, reason: String, attempts: u32) -> Self {
        Self {
            wallet: ctx.name.clone(),
            index: ctx.index,
            success: false,
            outcome: outcome.to_string(),
            reason: Some(reason),
            attempts,
            finished_at: Utc::now(),
        }
    }
}

/// Decrements the in-flight gauge even when the task is aborted
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::WALLETS_IN_FLIGHT.inc();
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::WALLETS_IN_FLIGHT.dec();
    }
}

pub struct BatchRunner {
    engine: Arc<RetryEngine>,
    config: RunnerConfig,
    stats: Option<SharedStats>,
}

impl BatchRunner {
    pub fn new(engine: Arc<RetryEngine>, config: RunnerConfig) -> Self {
        Self {
            engine,
            config,
            stats: None,
        }
    }

    /// Publish progress to the health endpoint
    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Run the factory's action for every wallet. Returns the reports of the
    /// wallets that finished before the batch ended, in completion order.
    pub async fn run<F: JobFactory>(
        &self,
        wallets: Vec<Wallet>,
        factory: Arc<F>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Vec<WalletReport> {
        let total = wallets.len();
        let limit = if self.config.max_concurrent == 0 {
            total.max(1)
        } else {
            self.config.max_concurrent
        };
        let semaphore = Arc::new(Semaphore::new(limit));

        if let Some(stats) = &self.stats {
            let mut stats = stats.write().await;
            stats.wallets_total = total;
            stats.started_at = Some(Utc::now());
        }
        info!(wallets = total, max_concurrent = limit, "Starting batch");

        let mut set = JoinSet::new();
        let mut offset = Duration::ZERO;

        for (i, wallet) in wallets.into_iter().enumerate() {
            let ctx = WalletContext::new(wallet.name.clone(), i + 1, total);
            let start_after = offset;
            offset += self.config.start_delay();

            let engine = self.engine.clone();
            let factory = factory.clone();
            let semaphore = semaphore.clone();
            let timeout = self.config.per_wallet_timeout;

            set.spawn(async move {
                tokio::time::sleep(start_after).await;
                let _permit = semaphore.acquire_owned().await;
                run_wallet(engine, factory, wallet, ctx, timeout).await
            });
        }

        let mut reports = Vec::with_capacity(total);
        let mut shutdown_open = true;

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok(report)) => {
                        if let Some(stats) = &self.stats {
                            stats.write().await.record(report.success);
                        }
                        reports.push(report);
                    }
                    Some(Err(e)) => error!(error = %e, "Wallet task failed"),
                    None => break,
                },
                signal = shutdown.recv(), if shutdown_open => match signal {
                    Some(()) => {
                        warn!(
                            finished = reports.len(),
                            remaining = set.len(),
                            "Shutdown requested, aborting remaining wallets"
                        );
                        set.abort_all();
                        while set.join_next().await.is_some() {}
                        break;
                    }
                    None => shutdown_open = false,
                },
            }
        }

        if let Some(stats) = &self.stats {
            stats.write().await.finished_at = Some(Utc::now());
        }

        let succeeded = reports.iter().filter(|r| r.success).count();
        info!(
            total,
            finished = reports.len(),
            succeeded,
            failed = reports.len() - succeeded,
            "Batch finished"
        );
        reports
    }
}

async fn run_wallet<F: JobFactory>(
    engine: Arc<RetryEngine>,
    factory: Arc<F>,
    wallet: Wallet,
    ctx: WalletContext,
    timeout: Option<Duration>,
) -> WalletReport {
    let _in_flight = InFlight::enter();

    let connector = factory.connector(&wallet);
    let mut client = match connector.connect(factory.source_chain_id()).await {
        Ok(client) => client,
        Err(e) => {
            error!(wallet = %ctx, error = %e, "Cannot connect to source chain");
            return WalletReport::failed(&ctx, "connect_failed", e.to_string(), 0);
        }
    };
    let action = factory.action(&wallet, connector);

    let execution = match timeout {
        Some(limit) => {
            match tokio::time::timeout(limit, engine.execute(&ctx, client.as_mut(), &action)).await {
                Ok(execution) => execution,
                Err(_) => {
                    client.close_session().await;
                    warn!(wallet = %ctx, ?limit, "Wallet timed out");
                    return WalletReport::failed(
                        &ctx,
                        "timed_out",
                        format!("Wallet did not finish within {} seconds", limit.as_secs()),
                        0,
                    );
                }
            }
        }
        None => engine.execute(&ctx, client.as_mut(), &action).await,
    };

    WalletReport {
        wallet: ctx.name.clone(),
        index: ctx.index,
        success: execution.is_success(),
        outcome: execution.outcome.as_str().to_string(),
        reason: execution.outcome.reason().map(str::to_string),
        attempts: execution.attempts,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RunStats;
    use crate::chain::ChainClient;
    use crate::error::ActionError;
    use crate::retry::RetryConfig;
    use crate::testing::{MockChainClient, MockConnector, ScriptedAction};
    use async_trait::async_trait;
    use tokio::sync::RwLock;

    const KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    struct SleepyAction(Duration);

    #[async_trait]
    impl Action for SleepyAction {
        type Output = ();

        fn name(&self) -> &str {
            "Sleepy"
        }

        async fn run(
            &self,
            _wallet: &WalletContext,
            _client: &mut dyn ChainClient,
        ) -> Result<(), ActionError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    enum Job {
        Scripted(ScriptedAction),
        Sleepy(SleepyAction),
    }

    #[async_trait]
    impl Action for Job {
        type Output = ();

        fn name(&self) -> &str {
            match self {
                Job::Scripted(a) => a.name(),
                Job::Sleepy(a) => a.name(),
            }
        }

        async fn run(
            &self,
            wallet: &WalletContext,
            client: &mut dyn ChainClient,
        ) -> Result<(), ActionError> {
            match self {
                Job::Scripted(a) => a.run(wallet, client).await.map(|_| ()),
                Job::Sleepy(a) => a.run(wallet, client).await,
            }
        }
    }

    /// "ok*" wallets succeed, "bad*" stop immediately, "slow*" sleep an hour
    struct TestFactory {
        connector: Arc<MockConnector>,
    }

    impl TestFactory {
        fn new(wallets: usize) -> Self {
            let connector = Arc::new(MockConnector::new());
            for _ in 0..wallets {
                connector.push(MockChainClient::new(1));
            }
            Self { connector }
        }
    }

    impl JobFactory for TestFactory {
        type Action = Job;

        fn source_chain_id(&self) -> u64 {
            1
        }

        fn connector(&self, _wallet: &Wallet) -> Arc<dyn ChainConnector> {
            self.connector.clone()
        }

        fn action(&self, wallet: &Wallet, _connector: Arc<dyn ChainConnector>) -> Job {
            if wallet.name.starts_with("bad") {
                Job::Scripted(ScriptedAction::always(|| ActionError::no_retry("route closed"), 3))
            } else if wallet.name.starts_with("slow") {
                Job::Sleepy(SleepyAction(Duration::from_secs(3600)))
            } else {
                Job::Scripted(ScriptedAction::new(vec![]))
            }
        }
    }

    fn wallets(names: &[&str]) -> Vec<Wallet> {
        names.iter().map(|n| Wallet::new(*n, KEY).unwrap()).collect()
    }

    fn runner(config: RunnerConfig) -> BatchRunner {
        BatchRunner::new(
            Arc::new(RetryEngine::new(RetryConfig {
                max_retries: 1,
                backoff_min: Duration::from_secs(1),
                backoff_max: Duration::from_secs(1),
            })),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_wallet_independently() {
        let (_tx, rx) = mpsc::channel(1);
        let stats: SharedStats = Arc::new(RwLock::new(RunStats::default()));
        let runner = runner(RunnerConfig::default()).with_stats(stats.clone());

        let reports = runner
            .run(wallets(&["ok1", "bad1", "ok2"]), Arc::new(TestFactory::new(3)), rx)
            .await;

        assert_eq!(reports.len(), 3);
        let bad = reports.iter().find(|r| r.wallet == "bad1").unwrap();
        assert!(!bad.success);
        assert_eq!(bad.outcome, "stopped");
        assert_eq!(bad.reason.as_deref(), Some("route closed"));
        assert_eq!(reports.iter().filter(|r| r.success).count(), 2);

        let stats = stats.read().await;
        assert_eq!(stats.wallets_total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert!(stats.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_wallet_timeout() {
        let (_tx, rx) = mpsc::channel(1);
        let runner = runner(RunnerConfig {
            per_wallet_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let factory = Arc::new(TestFactory::new(2));

        let started = tokio::time::Instant::now();
        let reports = runner.run(wallets(&["slow1", "ok1"]), factory, rx).await;

        assert_eq!(reports.len(), 2);
        let slow = reports.iter().find(|r| r.wallet == "slow1").unwrap();
        assert_eq!(slow.outcome, "timed_out");
        assert!(reports.iter().find(|r| r.wallet == "ok1").unwrap().success);
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_reported() {
        let (_tx, rx) = mpsc::channel(1);
        let runner = runner(RunnerConfig::default());

        // one client for two wallets
        let reports = runner
            .run(wallets(&["ok1", "ok2"]), Arc::new(TestFactory::new(1)), rx)
            .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(
            reports.iter().filter(|r| r.outcome == "connect_failed").count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_delay_staggers_wallets() {
        let (_tx, rx) = mpsc::channel(1);
        let runner = runner(RunnerConfig {
            start_delay_min: Duration::from_secs(10),
            start_delay_max: Duration::from_secs(10),
            max_concurrent: 1,
            ..Default::default()
        });

        let started = tokio::time::Instant::now();
        let reports = runner
            .run(wallets(&["ok1", "ok2", "ok3"]), Arc::new(TestFactory::new(3)), rx)
            .await;

        assert_eq!(reports.len(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(reports[0].wallet, "ok1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_batch() {
        let (tx, rx) = mpsc::channel(1);
        let runner = runner(RunnerConfig::default());
        tx.send(()).await.unwrap();

        let reports = runner
            .run(wallets(&["slow1", "slow2"]), Arc::new(TestFactory::new(2)), rx)
            .await;

        assert!(reports.is_empty());
    }
}
