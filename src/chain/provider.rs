//! Ethereum chain client with multi-RPC support and automatic failover
//!
//! Reads (transaction counts, block numbers) fail over across all configured
//! endpoints. Sends go to the active endpoint only; retrying a send on another
//! node could broadcast the same nonce twice.

use super::{BlockTag, CallRequest, ChainClient, ReceiptWatcher, TxReceipt};
use crate::config::{AccountConfig, ChainConfig, GasConfig};
use crate::error::{SubmitError, SubmitResult};
use crate::tx::GasPolicy;

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, TransactionRequest, TxHash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Multi-endpoint signing client for one account
pub struct EthereumClient {
    /// Chain configuration
    config: ChainConfig,
    /// Signing clients, one per RPC endpoint
    clients: Vec<Arc<SignerClient>>,
    /// Current active endpoint index
    current_client: AtomicUsize,
    /// Account the wallet signs for
    address: Address,
    gas_policy: GasPolicy,
    receipts: ReceiptWatcher,
}

impl EthereumClient {
    /// Create a new client signing with `wallet`
    pub fn new(config: ChainConfig, gas: &GasConfig, wallet: LocalWallet) -> SubmitResult<Self> {
        let wallet = wallet.with_chain_id(config.chain_id);
        let address = wallet.address();
        let mut clients = Vec::new();

        for url in config.rpc_urls.iter().filter(|u| !u.trim().is_empty()) {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(config.poll_interval_ms));
                    clients.push(Arc::new(SignerMiddleware::new(provider, wallet.clone())));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if clients.is_empty() {
            return Err(SubmitError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        info!(
            "Chain client for {:?} on {} ({} endpoints)",
            address,
            config.name,
            clients.len()
        );

        Ok(Self {
            receipts: ReceiptWatcher::from_config(&config),
            gas_policy: GasPolicy::from_config(gas),
            config,
            clients,
            current_client: AtomicUsize::new(0),
            address,
        })
    }

    /// Create a client for a configured account, reading its key from the
    /// environment
    pub fn from_account(
        config: ChainConfig,
        gas: &GasConfig,
        account: &AccountConfig,
    ) -> SubmitResult<Self> {
        let wallet = load_wallet(&account.private_key_env)?;
        Self::new(config, gas, wallet)
    }

    /// Address of the signing account
    pub fn address(&self) -> Address {
        self.address
    }

    /// Get the active client
    fn client(&self) -> &SignerClient {
        let idx = self.current_client.load(Ordering::Relaxed);
        &self.clients[idx % self.clients.len()]
    }

    /// Switch to next available endpoint
    pub fn failover(&self) {
        if self.clients.len() < 2 {
            return;
        }
        let current = self.current_client.load(Ordering::Relaxed);
        let next = (current + 1) % self.clients.len();
        self.current_client.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SubmitResult<u64> {
        for _ in 0..self.clients.len() {
            match self.client().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(SubmitError::ChainRead {
            chain_id: self.config.chain_id,
            address: format!("{:?}", self.address),
            message: "All providers failed to report a block number".to_string(),
        })
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    fn build_request(&self, call: &CallRequest, nonce: Option<u64>) -> TransactionRequest {
        let mut tx = TransactionRequest::new()
            .from(self.address)
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .chain_id(self.config.chain_id);

        if let Some(nonce) = nonce {
            tx = tx.nonce(nonce);
        }
        tx
    }
}

#[async_trait]
impl ChainClient for EthereumClient {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> SubmitResult<u64> {
        let block = Some(BlockId::Number(BlockNumber::from(tag)));
        let mut last_error = String::new();

        for _ in 0..self.clients.len() {
            match self.client().get_transaction_count(address, block).await {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get {} transaction count from chain {}: {}",
                        tag, self.config.chain_id, e
                    );
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(SubmitError::ChainRead {
            chain_id: self.config.chain_id,
            address: format!("{:?}", address),
            message: last_error,
        })
    }

    async fn send_transaction(
        &self,
        call: CallRequest,
        nonce: Option<u64>,
    ) -> SubmitResult<TxHash> {
        let client = self.client();
        let mut tx = self.build_request(&call, nonce);

        let gas = match call.gas_limit {
            Some(gas) => gas,
            None => {
                let typed: TypedTransaction = tx.clone().into();
                let estimate = client
                    .estimate_gas(&typed, None)
                    .await
                    .map_err(|e| SubmitError::from_send_failure(e.to_string()))?;
                self.gas_policy.with_buffer(estimate)
            }
        };
        tx = tx.gas(gas);

        let send_timeout = Duration::from_secs(self.config.send_timeout_secs);
        let pending = timeout(send_timeout, client.send_transaction(tx, None))
            .await
            .map_err(|_| SubmitError::Timeout {
                operation: "send transaction".to_string(),
            })?
            .map_err(|e| SubmitError::from_send_failure(e.to_string()))?;

        let tx_hash = pending.tx_hash();
        info!(
            "Transaction sent: {:?} to {:?} (nonce {:?}, gas {})",
            tx_hash, call.to, nonce, gas
        );
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> SubmitResult<TxReceipt> {
        self.receipts.wait(self.client(), tx_hash).await
    }
}

/// Load a wallet from the environment variable `env_name`
fn load_wallet(env_name: &str) -> SubmitResult<LocalWallet> {
    let key = std::env::var(env_name)
        .map_err(|_| SubmitError::Wallet(format!("{} is not set", env_name)))?;

    key.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| SubmitError::Wallet(format!("Invalid private key in {}: {}", env_name, e)))
}
