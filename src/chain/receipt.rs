//! Receipt watching for submitted transactions
//!
//! Polls the node until the receipt exists and is buried under the configured
//! number of blocks. The block containing the transaction counts as the first
//! confirmation, so `confirmation_blocks = 1` settles as soon as it is mined.
//!
//! A failed poll is retried on the next tick. Only a run of consecutive
//! failures, or the overall timeout, ends the wait with `ReceiptError`.

use super::TxReceipt;
use crate::config::ChainConfig;
use crate::error::{SubmitError, SubmitResult};

use ethers::providers::Middleware;
use ethers::types::{TransactionReceipt, TxHash};
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

/// Where a watched transaction currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Node has no receipt yet
    NotFound,
    /// Mined, but not deep enough
    Waiting { confirmations: u64 },
    Settled(TxReceipt),
}

/// Waits for receipts on a single chain
#[derive(Debug, Clone)]
pub struct ReceiptWatcher {
    chain_id: u64,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    poll_interval: Duration,
    timeout: Duration,
    /// Consecutive RPC failures tolerated while polling
    max_poll_failures: u32,
}

impl ReceiptWatcher {
    pub fn new(
        chain_id: u64,
        confirmation_blocks: u64,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            chain_id,
            confirmation_blocks: confirmation_blocks.max(1),
            poll_interval,
            timeout,
            max_poll_failures: 5,
        }
    }

    pub fn with_max_poll_failures(mut self, max_poll_failures: u32) -> Self {
        self.max_poll_failures = max_poll_failures.max(1);
        self
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        Self::new(
            config.chain_id,
            config.confirmation_blocks,
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_secs(config.receipt_timeout_secs),
        )
        .with_max_poll_failures(config.receipt_poll_failures)
    }

    /// Poll `client` until the transaction settles or the timeout elapses
    pub async fn wait<M: Middleware>(&self, client: &M, tx_hash: TxHash) -> SubmitResult<TxReceipt> {
        let watch = async {
            let mut ticker = interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failures = 0u32;

            loop {
                ticker.tick().await;

                let polled = match client.get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => client
                        .get_block_number()
                        .await
                        .map(|block| (Some(receipt), block.as_u64())),
                    Ok(None) => Ok((None, 0)),
                    Err(e) => Err(e),
                };

                let (receipt, current_block) = match polled {
                    Ok(polled) => {
                        failures = 0;
                        polled
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "Receipt poll for {:?} on chain {} failed ({}/{}): {}",
                            tx_hash, self.chain_id, failures, self.max_poll_failures, e
                        );
                        if failures >= self.max_poll_failures {
                            return Err(SubmitError::ReceiptError {
                                tx_hash: format!("{:?}", tx_hash),
                                message: format!("{} consecutive poll failures: {}", failures, e),
                            });
                        }
                        continue;
                    }
                };

                match self.evaluate(receipt.as_ref(), current_block) {
                    ReceiptStatus::Settled(receipt) => return Ok(receipt),
                    ReceiptStatus::Waiting { confirmations } => debug!(
                        "Transaction {:?} has {} / {} confirmations on chain {}",
                        tx_hash, confirmations, self.confirmation_blocks, self.chain_id
                    ),
                    ReceiptStatus::NotFound => {
                        debug!("No receipt yet for {:?} on chain {}", tx_hash, self.chain_id)
                    }
                }
            }
        };

        timeout(self.timeout, watch)
            .await
            .map_err(|_| SubmitError::ReceiptError {
                tx_hash: format!("{:?}", tx_hash),
                message: format!("not settled after {}s", self.timeout.as_secs()),
            })?
    }

    /// Decide whether a receipt is final given the current head
    pub fn evaluate(&self, receipt: Option<&TransactionReceipt>, current_block: u64) -> ReceiptStatus {
        let Some(receipt) = receipt else {
            return ReceiptStatus::NotFound;
        };
        // Receipts without a block number belong to pending blocks
        let Some(block_number) = receipt.block_number.map(|b| b.as_u64()) else {
            return ReceiptStatus::NotFound;
        };

        let confirmations = current_block.saturating_sub(block_number) + 1;
        if confirmations < self.confirmation_blocks {
            return ReceiptStatus::Waiting { confirmations };
        }

        ReceiptStatus::Settled(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number,
            gas_used: receipt.gas_used,
            success: receipt.status.map_or(false, |s| s.as_u64() == 1),
        })
    }
}
