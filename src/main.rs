use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;

use wallet_orchestrator::api::{self, RunStats, SharedStats};
use wallet_orchestrator::chain::{round6, ChainConnector};
use wallet_orchestrator::config::{ActionConfig, Config};
use wallet_orchestrator::evm::EvmConnector;
use wallet_orchestrator::gas::{GasCeilingStore, GasGate, GasGated};
use wallet_orchestrator::metrics;
use wallet_orchestrator::network::NetworkRegistry;
use wallet_orchestrator::runner::{BatchRunner, JobFactory};
use wallet_orchestrator::wallet::{self, Wallet};
use wallet_orchestrator::{ConfirmationConfig, ContractCall, DepositBridge, ReceiptWatcher, RetryEngine};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting wallet orchestrator");

    let config = Config::load()?;
    tracing::info!(
        action = config.action.name(),
        source_chain = config.action.source_chain_id(),
        networks = config.networks.len(),
        max_retries = config.retry.max_retries,
        gas_control = config.gas.gate.enabled,
        "Configuration loaded"
    );

    let wallets = wallet::load(&config.wallets_file)?;
    tracing::info!(count = wallets.len(), "Wallets loaded");

    let stats: SharedStats = Arc::new(RwLock::new(RunStats {
        action: config.action.name().to_string(),
        ..Default::default()
    }));

    metrics::UP.set(1.0);
    if config.api.enabled {
        let bind_address = config.api.bind_address.clone();
        let port = config.api.port;
        let api_stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = api::start_server(&bind_address, port, api_stats).await {
                tracing::error!(error = %e, "API server error");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    let gate = Arc::new(GasGate::new(
        config.gas.gate.clone(),
        GasCeilingStore::new(config.gas.ceiling_path.clone(), config.gas.maximum_gwei),
    ));
    let engine = Arc::new(RetryEngine::new(config.retry.clone()));
    let runner = BatchRunner::new(engine, config.runner.clone()).with_stats(stats);
    let networks = Arc::new(config.networks.clone());

    let reports = match config.action.clone() {
        ActionConfig::ContractCall {
            label,
            chain_id,
            to,
            value_wei,
            calldata,
        } => {
            let jobs = ContractCallJobs {
                networks,
                gate,
                gas_multiplier: config.gas_multiplier,
                chain_id,
                call: ContractCall::new(label, to, value_wei, calldata),
            };
            runner.run(wallets, Arc::new(jobs), shutdown_rx).await
        }
        ActionConfig::DepositBridge {
            src_chain_id,
            dst_chain_id,
            deposit_address,
            token,
            dst_token,
            amount,
            min_amount,
            max_amount,
            fee,
            routing_code,
        } => {
            let jobs = DepositBridgeJobs {
                networks,
                gate,
                gas_multiplier: config.gas_multiplier,
                confirmation: config.confirmation.clone(),
                template: BridgeTemplate {
                    src_chain_id,
                    dst_chain_id,
                    deposit_address,
                    token,
                    dst_token,
                    amount,
                    min_amount,
                    max_amount,
                    fee,
                    routing_code,
                },
            };
            runner.run(wallets, Arc::new(jobs), shutdown_rx).await
        }
    };

    for report in reports.iter().filter(|r| !r.success) {
        tracing::warn!(
            wallet = %report.wallet,
            outcome = %report.outcome,
            attempts = report.attempts,
            reason = report.reason.as_deref().unwrap_or("-"),
            "Wallet did not complete"
        );
    }

    metrics::UP.set(0.0);
    tracing::info!("Wallet orchestrator stopped");
    Ok(())
}

/// Same contract call for every wallet
struct ContractCallJobs {
    networks: Arc<NetworkRegistry>,
    gate: Arc<GasGate>,
    gas_multiplier: f64,
    chain_id: u64,
    call: ContractCall,
}

impl JobFactory for ContractCallJobs {
    type Action = GasGated<ContractCall>;

    fn source_chain_id(&self) -> u64 {
        self.chain_id
    }

    fn connector(&self, wallet: &Wallet) -> Arc<dyn ChainConnector> {
        Arc::new(EvmConnector::new(
            self.networks.clone(),
            wallet.private_key.clone(),
            self.gas_multiplier,
        ))
    }

    fn action(&self, _wallet: &Wallet, _connector: Arc<dyn ChainConnector>) -> Self::Action {
        GasGated::new(self.gate.clone(), self.call.clone())
    }
}

struct BridgeTemplate {
    src_chain_id: u64,
    dst_chain_id: u64,
    deposit_address: alloy::primitives::Address,
    token: String,
    dst_token: String,
    amount: (f64, f64),
    min_amount: f64,
    max_amount: f64,
    fee: f64,
    routing_code: Option<u32>,
}

/// Deposit bridge with a random amount per wallet
struct DepositBridgeJobs {
    networks: Arc<NetworkRegistry>,
    gate: Arc<GasGate>,
    gas_multiplier: f64,
    confirmation: ConfirmationConfig,
    template: BridgeTemplate,
}

impl JobFactory for DepositBridgeJobs {
    type Action = GasGated<DepositBridge>;

    fn source_chain_id(&self) -> u64 {
        self.template.src_chain_id
    }

    fn connector(&self, wallet: &Wallet) -> Arc<dyn ChainConnector> {
        Arc::new(EvmConnector::new(
            self.networks.clone(),
            wallet.private_key.clone(),
            self.gas_multiplier,
        ))
    }

    fn action(&self, _wallet: &Wallet, connector: Arc<dyn ChainConnector>) -> Self::Action {
        let t = &self.template;
        let (min, max) = t.amount;
        let amount = if max > min {
            round6(rand::thread_rng().gen_range(min..=max))
        } else {
            min
        };

        GasGated::new(
            self.gate.clone(),
            DepositBridge {
                deposit_address: t.deposit_address,
                dst_chain_id: t.dst_chain_id,
                token: t.token.clone(),
                dst_token: t.dst_token.clone(),
                amount,
                min_amount: t.min_amount,
                max_amount: t.max_amount,
                fee: t.fee,
                routing_code: t.routing_code,
                watcher: Arc::new(ReceiptWatcher::new(connector, self.confirmation.clone())),
            },
        )
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wallet_orchestrator=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
