//! Scripted in-memory chain for tests that need to control timing

use super::{BlockTag, CallRequest, ChainClient, TxReceipt};
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use ethers::types::{Address, TxHash, U256};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Semaphore;

enum ReceiptScript {
    Success,
    Revert,
    Error(String),
}

pub(crate) struct FakeChain {
    chain_id: u64,
    counts: Mutex<HashMap<BlockTag, u64>>,
    reads: Mutex<Vec<BlockTag>>,
    read_failures: Mutex<VecDeque<String>>,
    hold_reads: bool,
    read_gate: Semaphore,
    sends: Mutex<Vec<(CallRequest, Option<u64>)>>,
    send_failures: Mutex<VecDeque<String>>,
    receipts: Mutex<VecDeque<ReceiptScript>>,
    hold_receipts: bool,
    receipt_gate: Semaphore,
}

impl FakeChain {
    /// Both tags report `base` until told otherwise
    pub fn new(base: u64) -> Self {
        let counts = HashMap::from([(BlockTag::Pending, base), (BlockTag::Latest, base)]);
        Self {
            chain_id: 31337,
            counts: Mutex::new(counts),
            reads: Mutex::new(Vec::new()),
            read_failures: Mutex::new(VecDeque::new()),
            hold_reads: false,
            read_gate: Semaphore::new(0),
            sends: Mutex::new(Vec::new()),
            send_failures: Mutex::new(VecDeque::new()),
            receipts: Mutex::new(VecDeque::new()),
            hold_receipts: false,
            receipt_gate: Semaphore::new(0),
        }
    }

    /// Transaction count reads block until `release_reads`
    pub fn hold_reads(mut self) -> Self {
        self.hold_reads = true;
        self
    }

    /// Receipt waits block until `release_receipts`
    pub fn hold_receipts(mut self) -> Self {
        self.hold_receipts = true;
        self
    }

    pub fn set_count(&self, tag: BlockTag, count: u64) {
        self.counts.lock().insert(tag, count);
    }

    pub fn fail_next_read(&self, message: &str) {
        self.read_failures.lock().push_back(message.to_string());
    }

    pub fn fail_next_send(&self, message: &str) {
        self.send_failures.lock().push_back(message.to_string());
    }

    pub fn revert_next(&self) {
        self.receipts.lock().push_back(ReceiptScript::Revert);
    }

    pub fn fail_next_receipt(&self, message: &str) {
        self.receipts
            .lock()
            .push_back(ReceiptScript::Error(message.to_string()));
    }

    pub fn release_reads(&self) {
        self.read_gate.add_permits(1);
    }

    pub fn release_receipts(&self) {
        self.receipt_gate.add_permits(1);
    }

    pub fn reads(&self) -> Vec<BlockTag> {
        self.reads.lock().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }

    /// Nonces passed to `send_transaction`, in order
    pub fn sent_nonces(&self) -> Vec<Option<u64>> {
        self.sends.lock().iter().map(|(_, nonce)| *nonce).collect()
    }

    pub fn sent_calls(&self) -> Vec<CallRequest> {
        self.sends.lock().iter().map(|(call, _)| call.clone()).collect()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> SubmitResult<u64> {
        self.reads.lock().push(tag);
        if self.hold_reads {
            self.read_gate.acquire().await.unwrap().forget();
        }

        if let Some(message) = self.read_failures.lock().pop_front() {
            return Err(SubmitError::ChainRead {
                chain_id: self.chain_id,
                address: format!("{:?}", address),
                message,
            });
        }
        Ok(self.counts.lock().get(&tag).copied().unwrap_or_default())
    }

    async fn send_transaction(
        &self,
        call: CallRequest,
        nonce: Option<u64>,
    ) -> SubmitResult<TxHash> {
        if let Some(message) = self.send_failures.lock().pop_front() {
            return Err(SubmitError::from_send_failure(message));
        }
        let mut sends = self.sends.lock();
        sends.push((call, nonce));
        Ok(TxHash::from_low_u64_be(sends.len() as u64))
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> SubmitResult<TxReceipt> {
        if self.hold_receipts {
            self.receipt_gate.acquire().await.unwrap().forget();
        }

        let script = self
            .receipts
            .lock()
            .pop_front()
            .unwrap_or(ReceiptScript::Success);
        let success = match script {
            ReceiptScript::Success => true,
            ReceiptScript::Revert => false,
            ReceiptScript::Error(message) => {
                return Err(SubmitError::ReceiptError {
                    tx_hash: format!("{:?}", tx_hash),
                    message,
                })
            }
        };

        Ok(TxReceipt {
            tx_hash,
            block_number: 100 + tx_hash.to_low_u64_be(),
            gas_used: Some(U256::from(21_000)),
            success,
        })
    }
}
