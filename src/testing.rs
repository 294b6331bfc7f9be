//! Test doubles for chain clients, connectors and actions
//!
//! Used by unit tests and by the integration tests under `tests/`.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::actions::Action;
use crate::chain::{BalanceSnapshot, ChainClient, ChainConnector, TxOutcome, TxRequest, TxStatus};
use crate::error::ActionError;
use crate::network::NetworkConfig;
use crate::wallet::WalletContext;

/// Counters shared between a mock client and the test holding it
#[derive(Debug, Default)]
pub struct MockStats {
    pub rotations: AtomicU32,
    pub closes: AtomicU32,
    pub balance_reads: AtomicU32,
    pub gas_reads: AtomicU32,
    pub sends: AtomicU32,
}

impl MockStats {
    pub fn rotations(&self) -> u32 {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn balance_reads(&self) -> u32 {
        self.balance_reads.load(Ordering::SeqCst)
    }

    pub fn gas_reads(&self) -> u32 {
        self.gas_reads.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }
}

/// Pops scripted values; the last one repeats forever
fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Scripted in-memory chain client
pub struct MockChainClient {
    network: NetworkConfig,
    address: Address,
    rpc_index: usize,
    balances: Mutex<HashMap<String, VecDeque<Result<u128, String>>>>,
    decimals: HashMap<String, u8>,
    gas_prices: Mutex<VecDeque<f64>>,
    send_results: Mutex<VecDeque<Result<TxOutcome, ActionError>>>,
    sent: Arc<Mutex<Vec<TxRequest>>>,
    stats: Arc<MockStats>,
}

impl MockChainClient {
    pub fn new(chain_id: u64) -> Self {
        let network = NetworkConfig {
            name: format!("mock-{}", chain_id),
            chain_id,
            rpc_urls: vec![
                "http://rpc-a.invalid".to_string(),
                "http://rpc-b.invalid".to_string(),
            ],
            explorer: "https://explorer.invalid/".to_string(),
            ..Default::default()
        };
        Self {
            network,
            address: Address::repeat_byte(0x11),
            rpc_index: 0,
            balances: Mutex::new(HashMap::new()),
            decimals: HashMap::new(),
            gas_prices: Mutex::new(VecDeque::from(vec![1.0])),
            send_results: Mutex::new(VecDeque::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Balance reads for `token`, in order; `Err` simulates a failed read
    pub fn with_balances(self, token: &str, readings: Vec<Result<u128, String>>) -> Self {
        self.balances
            .lock()
            .unwrap()
            .insert(token.to_string(), VecDeque::from(readings));
        self
    }

    /// Register an ERC20 address for `symbol` on the mock network
    pub fn with_token(mut self, symbol: &str, address: Address) -> Self {
        self.network.tokens.insert(symbol.to_string(), address);
        self
    }

    pub fn with_decimals(mut self, token: &str, decimals: u8) -> Self {
        self.decimals.insert(token.to_string(), decimals);
        self
    }

    /// Gas price readings in gwei, in order
    pub fn with_gas_prices(self, prices: Vec<f64>) -> Self {
        *self.gas_prices.lock().unwrap() = VecDeque::from(prices);
        self
    }

    pub fn with_send_results(self, results: Vec<Result<TxOutcome, ActionError>>) -> Self {
        *self.send_results.lock().unwrap() = VecDeque::from(results);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    pub fn sent(&self) -> Arc<Mutex<Vec<TxRequest>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn network(&self) -> &NetworkConfig {
        &self.network
    }

    fn address(&self) -> Address {
        self.address
    }

    fn current_rpc(&self) -> &str {
        &self.network.rpc_urls[self.rpc_index % self.network.rpc_urls.len()]
    }

    async fn token_balance(&self, token: &str) -> Result<BalanceSnapshot, ActionError> {
        self.stats.balance_reads.fetch_add(1, Ordering::SeqCst);
        let reading = {
            let mut balances = self.balances.lock().unwrap();
            balances.get_mut(token).and_then(next_scripted)
        };
        let decimals = self.decimals(token).await?;
        match reading {
            Some(Ok(wei)) => Ok(BalanceSnapshot::new(wei, decimals, token)),
            Some(Err(message)) => Err(ActionError::transient(message)),
            None => Ok(BalanceSnapshot::new(0, decimals, token)),
        }
    }

    async fn decimals(&self, token: &str) -> Result<u8, ActionError> {
        Ok(self
            .decimals
            .get(token)
            .copied()
            .unwrap_or(self.network.native_decimals))
    }

    async fn gas_price_gwei(&self) -> Result<f64, ActionError> {
        self.stats.gas_reads.fetch_add(1, Ordering::SeqCst);
        let mut prices = self.gas_prices.lock().unwrap();
        next_scripted(&mut prices).ok_or_else(|| ActionError::transient("no gas price"))
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxOutcome, ActionError> {
        let n = self.stats.sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push(tx);
        match self.send_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(TxOutcome {
                hash: format!("0x{:064x}", n),
                status: TxStatus::Confirmed,
            }),
        }
    }

    async fn change_rpc(&mut self) {
        self.rpc_index += 1;
        self.stats.rotations.fetch_add(1, Ordering::SeqCst);
    }

    async fn close_session(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out prepared mock clients per chain
#[derive(Default)]
pub struct MockConnector {
    clients: Mutex<HashMap<u64, VecDeque<MockChainClient>>>,
    connects: AtomicU32,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a client returned by the next `connect(chain_id)`
    pub fn push(&self, client: MockChainClient) {
        let chain_id = client.network.chain_id;
        self.clients
            .lock()
            .unwrap()
            .entry(chain_id)
            .or_default()
            .push_back(client);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainConnector for MockConnector {
    async fn connect(&self, chain_id: u64) -> Result<Box<dyn ChainClient>, ActionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let client = self
            .clients
            .lock()
            .unwrap()
            .get_mut(&chain_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ActionError::transient(format!("no RPC available for chain {}", chain_id)))?;
        Ok(Box::new(client))
    }
}

/// Action replaying a script of results; returns the call number once the
/// script runs out
pub struct ScriptedAction {
    script: Mutex<VecDeque<Result<u32, ActionError>>>,
    calls: AtomicU32,
}

impl ScriptedAction {
    pub fn new(script: Vec<Result<u32, ActionError>>) -> Self {
        Self {
            script: Mutex::new(VecDeque::from(script)),
            calls: AtomicU32::new(0),
        }
    }

    /// Fails with `make_error()` on every call
    pub fn always(make_error: fn() -> ActionError, times: usize) -> Self {
        Self::new((0..times).map(|_| Err(make_error())).collect())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for ScriptedAction {
    type Output = u32;

    fn name(&self) -> &str {
        "Scripted"
    }

    async fn run(
        &self,
        _wallet: &WalletContext,
        _client: &mut dyn ChainClient,
    ) -> Result<u32, ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(call),
        }
    }
}

pub fn test_wallet() -> WalletContext {
    WalletContext::new("test", 1, 1)
}
