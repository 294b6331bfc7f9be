//! Prometheus metrics for the wallet orchestrator
//!
//! Exposed on /metrics by the API server.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec};

lazy_static! {
    pub static ref ACTION_ATTEMPTS: CounterVec = register_counter_vec!(
        "orchestrator_action_attempts_total",
        "Total number of action invocations (including retries)",
        &["action", "chain"]
    ).unwrap();

    pub static ref ACTION_OUTCOMES: CounterVec = register_counter_vec!(
        "orchestrator_action_outcomes_total",
        "Final outcome of each engine call",
        &["action", "outcome"]
    ).unwrap();

    pub static ref FAILURES: CounterVec = register_counter_vec!(
        "orchestrator_failures_total",
        "Classified action failures",
        &["chain", "kind"]
    ).unwrap();

    pub static ref RPC_ROTATIONS: CounterVec = register_counter_vec!(
        "orchestrator_rpc_rotations_total",
        "Number of RPC endpoint rotations",
        &["chain"]
    ).unwrap();

    pub static ref GAS_CHECKS: CounterVec = register_counter_vec!(
        "orchestrator_gas_checks_total",
        "Gas price checks performed by the gas gate",
        &["chain", "result"]
    ).unwrap();

    pub static ref LAST_GAS_PRICE: GaugeVec = register_gauge_vec!(
        "orchestrator_last_gas_price_gwei",
        "Last gas price observed by the gas gate",
        &["chain"]
    ).unwrap();

    pub static ref RECEIPTS: CounterVec = register_counter_vec!(
        "orchestrator_receipts_total",
        "Cross-chain receipt confirmations",
        &["chain", "status"]
    ).unwrap();

    pub static ref WALLETS_IN_FLIGHT: Gauge = register_gauge!(
        "orchestrator_wallets_in_flight",
        "Wallet tasks currently running"
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "orchestrator_up",
        "Whether the orchestrator is up and running"
    ).unwrap();
}

/// Record one action invocation
pub fn record_attempt(action: &str, chain: &str) {
    ACTION_ATTEMPTS.with_label_values(&[action, chain]).inc();
}

/// Record the final outcome of an engine call
pub fn record_outcome(action: &str, outcome: &str) {
    ACTION_OUTCOMES.with_label_values(&[action, outcome]).inc();
}

/// Record a classified failure
pub fn record_failure(chain: &str, kind: &str) {
    FAILURES.with_label_values(&[chain, kind]).inc();
}

/// Record an RPC rotation
pub fn record_rotation(chain: &str) {
    RPC_ROTATIONS.with_label_values(&[chain]).inc();
}

/// Record a gas check
pub fn record_gas_check(chain: &str, gwei: f64, acceptable: bool) {
    let result = if acceptable { "good" } else { "high" };
    GAS_CHECKS.with_label_values(&[chain, result]).inc();
    LAST_GAS_PRICE.with_label_values(&[chain]).set(gwei);
}

/// Record a receipt confirmation result
pub fn record_receipt(chain: &str, received: bool) {
    let status = if received { "received" } else { "timed_out" };
    RECEIPTS.with_label_values(&[chain, status]).inc();
}
