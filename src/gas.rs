//! Gas gate
//!
//! Holds an action back until the source chain's gas price drops under the
//! operator's ceiling. The ceiling lives in a small JSON file so it can be
//! changed while batches are running.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::actions::Action;
use crate::chain::ChainClient;
use crate::error::ActionError;
use crate::metrics;
use crate::wallet::WalletContext;

#[derive(Debug, Serialize, Deserialize)]
struct GasCeilingRecord {
    maximum_gwei: f64,
}

/// Persisted gas ceiling in gwei
///
/// Clones share one lock, so wallets gated in parallel never observe each
/// other's writes half done.
#[derive(Debug, Clone)]
pub struct GasCeilingStore {
    path: PathBuf,
    default_gwei: f64,
    lock: Arc<Mutex<()>>,
}

impl GasCeilingStore {
    pub fn new(path: impl Into<PathBuf>, default_gwei: f64) -> Self {
        Self {
            path: path.into(),
            default_gwei,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Current ceiling. A missing or malformed file is replaced by the
    /// default; a valid record is left untouched.
    pub async fn load(&self) -> f64 {
        let _guard = self.lock.lock().await;

        let parsed = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str::<GasCeilingRecord>(&raw).ok(),
            Err(_) => None,
        };

        match parsed {
            Some(record) if record.maximum_gwei.is_finite() && record.maximum_gwei > 0.0 => {
                record.maximum_gwei
            }
            _ => {
                warn!(
                    path = %self.path.display(),
                    default = self.default_gwei,
                    "Gas ceiling missing or malformed, restoring default"
                );
                if let Err(e) = self.write(self.default_gwei).await {
                    warn!(path = %self.path.display(), error = %e, "Failed to write gas ceiling");
                }
                self.default_gwei
            }
        }
    }

    /// Replace the ceiling
    pub async fn store(&self, maximum_gwei: f64) -> eyre::Result<()> {
        let _guard = self.lock.lock().await;
        self.write(maximum_gwei).await
    }

    /// Write to a sibling temp file and rename it over the record, so readers
    /// in other processes see either the old or the new ceiling
    async fn write(&self, maximum_gwei: f64) -> eyre::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_string_pretty(&GasCeilingRecord { maximum_gwei })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Staggered sleep applied once gas turns good after a high streak, so that
/// wallets held back together do not all fire at once
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCooldown {
    /// High checks needed before the cooldown applies
    pub control_checks: u32,
    /// Upper bound of the random stream position multiplier
    pub accounts_in_stream: u32,
    pub sleep_min: Duration,
    pub sleep_max: Duration,
}

impl StreamCooldown {
    pub fn delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let position = rng.gen_range(1..=self.accounts_in_stream.max(1));
        let min = self.sleep_min.as_millis() as u64 * position as u64;
        let max = self.sleep_max.as_millis() as u64 * position as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GasGateConfig {
    pub enabled: bool,
    /// Sleep between checks while gas is too high
    pub check_interval: Duration,
    pub cooldown: Option<StreamCooldown>,
}

impl Default for GasGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(60),
            cooldown: None,
        }
    }
}

/// What the gate did before letting an action through
#[derive(Debug, Clone, PartialEq)]
pub struct GasGateReport {
    pub checks: u32,
    pub last_gwei: Option<f64>,
    pub cooldown: Option<Duration>,
}

pub struct GasGate {
    config: GasGateConfig,
    store: GasCeilingStore,
}

impl GasGate {
    pub fn new(config: GasGateConfig, store: GasCeilingStore) -> Self {
        Self { config, store }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Block until gas on the client's chain is under the ceiling. Never
    /// times out; a failed gas price read is returned to the caller.
    pub async fn wait_for_acceptable_gas(
        &self,
        wallet: &WalletContext,
        client: &dyn ChainClient,
    ) -> Result<GasGateReport, ActionError> {
        if !self.config.enabled {
            return Ok(GasGateReport {
                checks: 0,
                last_gwei: None,
                cooldown: None,
            });
        }

        let chain = client.network().name.clone();
        let mut checks = 0;
        let mut high_checks = 0;

        info!(wallet = %wallet, chain = %chain, "Checking for gas price");

        loop {
            let ceiling = self.store.load().await;
            let gwei = round2(client.gas_price_gwei().await?);
            checks += 1;

            let acceptable = gwei < ceiling;
            metrics::record_gas_check(&chain, gwei, acceptable);

            if acceptable {
                info!(wallet = %wallet, chain = %chain, gwei, ceiling, "{} Gwei | Gas price is good", gwei);

                let cooldown = match &self.config.cooldown {
                    Some(c) if high_checks >= c.control_checks => {
                        let delay = c.delay();
                        info!(wallet = %wallet, ?delay, high_checks, "Staggering start after high gas period");
                        tokio::time::sleep(delay).await;
                        Some(delay)
                    }
                    _ => None,
                };

                return Ok(GasGateReport {
                    checks,
                    last_gwei: Some(gwei),
                    cooldown,
                });
            }

            high_checks += 1;
            warn!(
                wallet = %wallet,
                chain = %chain,
                gwei,
                ceiling,
                "{} Gwei | Gas is too high. Next check in {} second",
                gwei,
                self.config.check_interval.as_secs()
            );
            tokio::time::sleep(self.config.check_interval).await;
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Runs the gas gate before every attempt of the wrapped action
pub struct GasGated<A> {
    gate: Arc<GasGate>,
    inner: A,
}

impl<A> GasGated<A> {
    pub fn new(gate: Arc<GasGate>, inner: A) -> Self {
        Self { gate, inner }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: Action> Action for GasGated<A> {
    type Output = A::Output;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(
        &self,
        wallet: &WalletContext,
        client: &mut dyn ChainClient,
    ) -> Result<Self::Output, ActionError> {
        self.gate.wait_for_acceptable_gas(wallet, &*client).await?;
        self.inner.run(wallet, client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_wallet, MockChainClient, ScriptedAction};

    fn gate(dir: &tempfile::TempDir, enabled: bool, cooldown: Option<StreamCooldown>) -> GasGate {
        GasGate::new(
            GasGateConfig {
                enabled,
                check_interval: Duration::from_secs(10),
                cooldown,
            },
            GasCeilingStore::new(dir.path().join("services/maximum_gwei.json"), 30.0),
        )
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(29.996), 30.0);
        assert_eq!(round2(25.123), 25.12);
    }

    #[test]
    fn test_cooldown_delay_scaled_by_position() {
        let cooldown = StreamCooldown {
            control_checks: 1,
            accounts_in_stream: 3,
            sleep_min: Duration::from_secs(10),
            sleep_max: Duration::from_secs(20),
        };
        for _ in 0..50 {
            let delay = cooldown.delay();
            assert!(delay >= Duration::from_secs(10) && delay <= Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn test_store_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        let store = GasCeilingStore::new(dir.path().join("services/maximum_gwei.json"), 30.0);

        // missing file
        assert_eq!(store.load().await, 30.0);
        assert!(store.path().exists());

        std::fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load().await, 30.0);
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"maximum_gwei\": 30.0"));

        store.store(12.5).await.unwrap();
        assert_eq!(store.load().await, 12.5);
    }

    #[tokio::test]
    async fn test_valid_record_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = GasCeilingStore::new(dir.path().join("maximum_gwei.json"), 30.0);
        std::fs::write(store.path(), r#"{"maximum_gwei":7.5}"#).unwrap();

        assert_eq!(store.load().await, 7.5);
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw, r#"{"maximum_gwei":7.5}"#);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_loads_keep_operator_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let store = GasCeilingStore::new(dir.path().join("maximum_gwei.json"), 30.0);
        store.store(12.5).await.unwrap();

        for _ in 0..20 {
            let mut set = tokio::task::JoinSet::new();
            for _ in 0..16 {
                let store = store.clone();
                set.spawn(async move { store.load().await });
            }
            while let Some(ceiling) = set.join_next().await {
                assert_eq!(ceiling.unwrap(), 12.5);
            }
        }

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let record: GasCeilingRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.maximum_gwei, 12.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_waits_for_price_under_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, true, None);
        let client = MockChainClient::new(1).with_gas_prices(vec![45.0, 38.0, 32.0, 25.0]);
        let stats = client.stats();

        let started = tokio::time::Instant::now();
        let report = gate.wait_for_acceptable_gas(&test_wallet(), &client).await.unwrap();

        assert_eq!(report.checks, 4);
        assert_eq!(report.last_gwei, Some(25.0));
        assert_eq!(report.cooldown, None);
        assert_eq!(stats.gas_reads(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_equal_to_ceiling_is_too_high() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, true, None);
        let client = MockChainClient::new(1).with_gas_prices(vec![30.0, 29.99]);

        let report = gate.wait_for_acceptable_gas(&test_wallet(), &client).await.unwrap();
        assert_eq!(report.checks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_high_streak() {
        let dir = tempfile::tempdir().unwrap();
        let cooldown = StreamCooldown {
            control_checks: 2,
            accounts_in_stream: 1,
            sleep_min: Duration::from_secs(100),
            sleep_max: Duration::from_secs(100),
        };
        let gate = gate(&dir, true, Some(cooldown.clone()));

        let client = MockChainClient::new(1).with_gas_prices(vec![40.0, 40.0, 20.0]);
        let report = gate.wait_for_acceptable_gas(&test_wallet(), &client).await.unwrap();
        assert_eq!(report.cooldown, Some(Duration::from_secs(100)));

        // a single high check is not a sustained streak
        let client = MockChainClient::new(1).with_gas_prices(vec![40.0, 20.0]);
        let report = gate.wait_for_acceptable_gas(&test_wallet(), &client).await.unwrap();
        assert_eq!(report.cooldown, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_gate_is_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, false, None);
        let client = MockChainClient::new(1).with_gas_prices(vec![500.0]);
        let stats = client.stats();

        let report = gate.wait_for_acceptable_gas(&test_wallet(), &client).await.unwrap();

        assert_eq!(report.checks, 0);
        assert_eq!(stats.gas_reads(), 0);
        assert!(!dir.path().join("services/maximum_gwei.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gated_action_runs_after_gate() {
        let dir = tempfile::tempdir().unwrap();
        let gated = GasGated::new(Arc::new(gate(&dir, true, None)), ScriptedAction::new(vec![]));
        let mut client = MockChainClient::new(1).with_gas_prices(vec![50.0, 10.0]);
        let stats = client.stats();

        let output = gated.run(&test_wallet(), &mut client).await.unwrap();

        assert_eq!(output, 1);
        assert_eq!(stats.gas_reads(), 2);
        assert_eq!(gated.inner().calls(), 1);
        assert_eq!(gated.name(), "Scripted");
    }
}
