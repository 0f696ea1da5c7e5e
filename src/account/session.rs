//! Connected account session

use crate::chain::ChainClient;
use crate::error::{SubmitError, SubmitResult};
use crate::tx::{NonceAllocator, TransactionSubmitter};

use ethers::types::Address;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// The account currently driving submissions
pub struct ConnectedAccount {
    pub address: Address,
    pub chain: Arc<dyn ChainClient>,
    pub allocator: Arc<NonceAllocator>,
}

impl ConnectedAccount {
    fn new(address: Address, chain: Arc<dyn ChainClient>) -> Self {
        let allocator = Arc::new(NonceAllocator::new(address, Arc::clone(&chain)));
        Self {
            address,
            chain,
            allocator,
        }
    }

    /// Nonce-managed submitter signing for this account
    pub fn submitter(&self, label: impl Into<String>) -> Arc<TransactionSubmitter> {
        Arc::new(TransactionSubmitter::new(
            label,
            Arc::clone(&self.chain),
            Arc::clone(&self.allocator),
        ))
    }
}

/// Wallet/account provider
#[derive(Default)]
pub struct AccountSession {
    current: RwLock<Option<Arc<ConnectedAccount>>>,
}

impl AccountSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `address`, replacing any other account.
    ///
    /// Reconnecting the account that is already active keeps its allocator.
    /// Returns whether the active account changed.
    pub fn connect(&self, address: Address, chain: Arc<dyn ChainClient>) -> bool {
        let mut current = self.current.write();
        if current.as_ref().map_or(false, |a| a.address == address) {
            return false;
        }

        if let Some(previous) = current.as_ref() {
            info!(
                "Switching account {:?} -> {:?}, discarding {} pending nonces",
                previous.address,
                address,
                previous.allocator.snapshot().pending_count
            );
        } else {
            info!("Connected account {:?}", address);
        }

        *current = Some(Arc::new(ConnectedAccount::new(address, chain)));
        true
    }

    /// Drop the connected account, if any
    pub fn disconnect(&self) -> Option<Address> {
        let previous = self.current.write().take();
        if let Some(account) = &previous {
            info!("Disconnected account {:?}", account.address);
        }
        previous.map(|a| a.address)
    }

    pub fn current(&self) -> SubmitResult<Arc<ConnectedAccount>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| SubmitError::NotReady("connect a wallet first".to_string()))
    }

    pub fn address(&self) -> Option<Address> {
        self.current.read().as_ref().map(|a| a.address)
    }

    /// Allocate a nonce for the connected account
    pub async fn get_nonce(&self) -> SubmitResult<u64> {
        let account = self.current()?;
        account.allocator.get_nonce().await
    }

    /// Build a nonce-managed submitter bound to the connected account
    pub fn submitter(&self, label: impl Into<String>) -> SubmitResult<Arc<TransactionSubmitter>> {
        Ok(self.current()?.submitter(label))
    }
}
