//! Chain module - the collaborator the coordination layer talks to
//!
//! This module provides:
//! - The `ChainClient` trait: transaction counts, submission, receipts
//! - An ethers-backed implementation with multi-RPC read failover
//! - Receipt watching with confirmation depth and timeout

pub mod provider;
pub mod receipt;

#[cfg(test)]
pub(crate) mod testing;

pub use provider::EthereumClient;
pub use receipt::ReceiptWatcher;

use crate::error::SubmitResult;

use async_trait::async_trait;
use ethers::types::{Address, BlockNumber, Bytes, TxHash, U256};
use serde::Serialize;
use std::fmt;

/// Which view of the account's transaction count to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockTag {
    /// Includes transactions still sitting in the mempool
    Pending,
    /// Mined transactions only
    Latest,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Pending => "pending",
            BlockTag::Latest => "latest",
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BlockTag> for BlockNumber {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Pending => BlockNumber::Pending,
            BlockTag::Latest => BlockNumber::Latest,
        }
    }
}

/// A contract call to be signed and submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Explicit gas limit; estimated with a buffer when absent
    pub gas_limit: Option<U256>,
}

impl CallRequest {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            value: U256::zero(),
            gas_limit: None,
        }
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn gas_limit(mut self, gas_limit: U256) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }
}

/// Settled transaction as reported by the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub gas_used: Option<U256>,
    /// `false` when the transaction was mined but reverted
    pub success: bool,
}

/// Read/write access to one account on one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain ID, used for log and metric labels
    fn chain_id(&self) -> u64;

    /// Transaction count of `address` under the given tag
    async fn transaction_count(&self, address: Address, tag: BlockTag) -> SubmitResult<u64>;

    /// Sign and send a call. With `nonce` unset the client fills it in.
    async fn send_transaction(&self, call: CallRequest, nonce: Option<u64>)
        -> SubmitResult<TxHash>;

    /// Wait until the transaction is mined and return its receipt
    async fn wait_for_receipt(&self, tx_hash: TxHash) -> SubmitResult<TxReceipt>;
}
