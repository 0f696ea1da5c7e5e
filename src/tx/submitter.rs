//! Transaction submitter with lifecycle tracking and nonce feedback
//!
//! One submitter wraps one kind of contract write. It allows a single
//! outstanding submission at a time; a second `submit` while one is running
//! is rejected with `Busy` before anything touches the chain.

use super::nonce::NonceAllocator;
use crate::chain::{CallRequest, ChainClient, TxReceipt};
use crate::error::{SubmitError, SubmitResult};
use crate::metrics;

use ethers::types::TxHash;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of the submitter's current submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "tx_hash", rename_all = "snake_case")]
pub enum SubmissionState {
    Idle,
    Submitting,
    Pending(TxHash),
    Confirmed(TxHash),
    Failed(TxHash),
    RejectedBeforeSend,
}

/// Observer callbacks, run before the allocator hears about the outcome
pub trait SubmitHooks: Send + Sync {
    /// The chain accepted the transaction
    fn on_pending(&self, _tx_hash: TxHash) {}

    fn on_success(&self, _receipt: &TxReceipt) {}

    fn on_error(&self, _error: &SubmitError) {}
}

/// Hooks that do nothing
pub struct NoopHooks;

impl SubmitHooks for NoopHooks {}

/// How a submission ended
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Confirmed {
        nonce: Option<u64>,
        receipt: TxReceipt,
    },
    /// Accepted by the chain, then reverted or lost
    Failed {
        nonce: Option<u64>,
        tx_hash: TxHash,
        error: SubmitError,
    },
    /// No transaction hash was ever produced
    RejectedBeforeSend {
        nonce: Option<u64>,
        error: SubmitError,
    },
}

impl SubmitOutcome {
    pub fn nonce(&self) -> Option<u64> {
        match self {
            SubmitOutcome::Confirmed { nonce, .. }
            | SubmitOutcome::Failed { nonce, .. }
            | SubmitOutcome::RejectedBeforeSend { nonce, .. } => *nonce,
        }
    }

    pub fn tx_hash(&self) -> Option<TxHash> {
        match self {
            SubmitOutcome::Confirmed { receipt, .. } => Some(receipt.tx_hash),
            SubmitOutcome::Failed { tx_hash, .. } => Some(*tx_hash),
            SubmitOutcome::RejectedBeforeSend { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&SubmitError> {
        match self {
            SubmitOutcome::Confirmed { .. } => None,
            SubmitOutcome::Failed { error, .. } | SubmitOutcome::RejectedBeforeSend { error, .. } => {
                Some(error)
            }
        }
    }

    pub fn into_result(self) -> SubmitResult<TxReceipt> {
        match self {
            SubmitOutcome::Confirmed { receipt, .. } => Ok(receipt),
            SubmitOutcome::Failed { error, .. } | SubmitOutcome::RejectedBeforeSend { error, .. } => {
                Err(error)
            }
        }
    }
}

/// A submission running on its own task.
///
/// Dropping the handle does not stop the submission; the chain transaction
/// and the nonce feedback still complete.
pub struct SubmissionHandle {
    id: Uuid,
    task: JoinHandle<SubmitOutcome>,
}

impl SubmissionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the submission to finish
    pub async fn outcome(self) -> SubmitResult<SubmitOutcome> {
        self.task
            .await
            .map_err(|e| SubmitError::Internal(format!("Submission {} aborted: {}", self.id, e)))
    }
}

/// Puts the submitter back to `Idle` however the submission ends
struct IdleOnDrop(Arc<Mutex<SubmissionState>>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        *self.0.lock() = SubmissionState::Idle;
    }
}

/// Submits one contract call at a time
pub struct TransactionSubmitter {
    /// Name used in logs, e.g. the game action
    label: String,
    chain: Arc<dyn ChainClient>,
    /// Present when this submitter manages nonces itself
    allocator: Option<Arc<NonceAllocator>>,
    state: Arc<Mutex<SubmissionState>>,
}

impl TransactionSubmitter {
    /// Submitter that allocates nonces from `allocator` and reports outcomes
    /// back to it
    pub fn new(
        label: impl Into<String>,
        chain: Arc<dyn ChainClient>,
        allocator: Arc<NonceAllocator>,
    ) -> Self {
        Self::build(label.into(), chain, Some(allocator))
    }

    /// Submitter that leaves the nonce to the chain client
    pub fn without_nonce_management(label: impl Into<String>, chain: Arc<dyn ChainClient>) -> Self {
        Self::build(label.into(), chain, None)
    }

    fn build(
        label: String,
        chain: Arc<dyn ChainClient>,
        allocator: Option<Arc<NonceAllocator>>,
    ) -> Self {
        Self {
            label,
            chain,
            allocator,
            state: Arc::new(Mutex::new(SubmissionState::Idle)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SubmissionState {
        self.state.lock().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state() != SubmissionState::Idle
    }

    /// Start a submission.
    ///
    /// Fails immediately with `Busy` if one is already outstanding. Must be
    /// called from within a tokio runtime.
    pub fn submit(
        self: &Arc<Self>,
        call: CallRequest,
        hooks: Arc<dyn SubmitHooks>,
    ) -> SubmitResult<SubmissionHandle> {
        {
            let mut state = self.state.lock();
            if *state != SubmissionState::Idle {
                debug!("Submitter {} busy ({:?})", self.label, *state);
                return Err(SubmitError::Busy);
            }
            *state = SubmissionState::Submitting;
        }

        let id = Uuid::new_v4();
        let idle = IdleOnDrop(Arc::clone(&self.state));
        let this = Arc::clone(self);

        let task = tokio::spawn(async move {
            let _idle = idle;
            this.run(id, call, hooks.as_ref()).await
        });

        Ok(SubmissionHandle { id, task })
    }

    /// Submit and wait for the outcome
    pub async fn submit_and_wait(
        self: &Arc<Self>,
        call: CallRequest,
        hooks: Arc<dyn SubmitHooks>,
    ) -> SubmitResult<SubmitOutcome> {
        self.submit(call, hooks)?.outcome().await
    }

    async fn run(&self, id: Uuid, call: CallRequest, hooks: &dyn SubmitHooks) -> SubmitOutcome {
        let started = Instant::now();
        let chain_id = self.chain.chain_id();

        let nonce = match &self.allocator {
            Some(allocator) => match allocator.get_nonce().await {
                Ok(nonce) => Some(nonce),
                Err(error) => return self.rejected(id, None, error, hooks),
            },
            None => None,
        };

        let tx_hash = match self.chain.send_transaction(call, nonce).await {
            Ok(tx_hash) => tx_hash,
            Err(error) => return self.rejected(id, nonce, error, hooks),
        };

        self.set_state(SubmissionState::Pending(tx_hash));
        info!(
            "Submission {} ({}) pending as {:?} with nonce {:?}",
            id, self.label, tx_hash, nonce
        );
        metrics::record_tx_submitted(chain_id);
        hooks.on_pending(tx_hash);

        let error = match self.chain.wait_for_receipt(tx_hash).await {
            Ok(receipt) if receipt.success => {
                self.set_state(SubmissionState::Confirmed(tx_hash));
                info!(
                    "Submission {} ({}) confirmed in block {}",
                    id, self.label, receipt.block_number
                );
                metrics::record_tx_confirmed(chain_id, started.elapsed().as_secs_f64());

                hooks.on_success(&receipt);
                if let Some(allocator) = &self.allocator {
                    allocator.transaction_confirmed();
                }
                return SubmitOutcome::Confirmed { nonce, receipt };
            }
            Ok(_) => SubmitError::TransactionReverted {
                tx_hash: format!("{:?}", tx_hash),
            },
            Err(error) => error,
        };

        self.set_state(SubmissionState::Failed(tx_hash));
        warn!("Submission {} ({}) failed: {}", id, self.label, error);
        metrics::record_tx_failed(chain_id, error.failure_kind());

        hooks.on_error(&error);
        self.feed_failure(nonce, &error);
        SubmitOutcome::Failed {
            nonce,
            tx_hash,
            error,
        }
    }

    fn rejected(
        &self,
        id: Uuid,
        nonce: Option<u64>,
        error: SubmitError,
        hooks: &dyn SubmitHooks,
    ) -> SubmitOutcome {
        self.set_state(SubmissionState::RejectedBeforeSend);
        if error.is_user_visible() {
            warn!("Submission {} ({}) rejected: {}", id, self.label, error);
        } else {
            info!("Submission {} ({}) not sent: {}", id, self.label, error);
        }
        metrics::record_tx_failed(self.chain.chain_id(), error.failure_kind());

        hooks.on_error(&error);
        self.feed_failure(nonce, &error);
        SubmitOutcome::RejectedBeforeSend { nonce, error }
    }

    fn feed_failure(&self, nonce: Option<u64>, error: &SubmitError) {
        if let (Some(allocator), Some(_)) = (&self.allocator, nonce) {
            allocator.transaction_failed(error);
        }
    }

    fn set_state(&self, state: SubmissionState) {
        *self.state.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::chain::{BlockTag, MockChainClient};
    use ethers::types::{Address, Bytes, U256};
    use tokio_test::assert_ok;

    fn call() -> CallRequest {
        CallRequest::new(Address::repeat_byte(0x42), Bytes::from(vec![0x01, 0x02]))
    }

    fn managed(chain: &Arc<FakeChain>) -> (Arc<TransactionSubmitter>, Arc<NonceAllocator>) {
        let allocator = Arc::new(NonceAllocator::new(Address::repeat_byte(0x11), chain.clone()));
        let submitter = Arc::new(TransactionSubmitter::new("bet", chain.clone(), allocator.clone()));
        (submitter, allocator)
    }

    async fn wait_for_pending(submitter: &TransactionSubmitter) -> TxHash {
        for _ in 0..100 {
            if let SubmissionState::Pending(tx_hash) = submitter.state() {
                return tx_hash;
            }
            tokio::task::yield_now().await;
        }
        panic!("submission never reached pending, state {:?}", submitter.state());
    }

    /// Records what each hook saw of the allocator at the time it ran
    struct Recorder {
        allocator: Option<Arc<NonceAllocator>>,
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn watching(allocator: &Arc<NonceAllocator>) -> Arc<Self> {
            Arc::new(Self {
                allocator: Some(allocator.clone()),
                events: Mutex::new(Vec::new()),
            })
        }

        fn pending_count(&self) -> u64 {
            self.allocator
                .as_ref()
                .map_or(0, |a| a.snapshot().pending_count)
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl SubmitHooks for Recorder {
        fn on_pending(&self, _tx_hash: TxHash) {
            let event = format!("pending:{}", self.pending_count());
            self.events.lock().push(event);
        }

        fn on_success(&self, _receipt: &TxReceipt) {
            let event = format!("success:{}", self.pending_count());
            self.events.lock().push(event);
        }

        fn on_error(&self, _error: &SubmitError) {
            let event = format!("error:{}", self.pending_count());
            self.events.lock().push(event);
        }
    }

    #[tokio::test]
    async fn test_confirmed_submission() {
        let chain = Arc::new(FakeChain::new(3));
        let (submitter, allocator) = managed(&chain);
        let hooks = Recorder::watching(&allocator);

        let outcome = assert_ok!(submitter.submit_and_wait(call(), hooks.clone()).await);

        assert_eq!(outcome.nonce(), Some(3));
        let receipt = assert_ok!(outcome.into_result());
        assert!(receipt.success);
        assert_eq!(chain.sent_nonces(), vec![Some(3)]);
        assert_eq!(chain.sent_calls(), vec![call()]);

        // Hooks ran while the nonce was still counted as pending
        assert_eq!(hooks.events(), vec!["pending:1", "success:1"]);
        assert_eq!(allocator.snapshot().pending_count, 0);
        assert_eq!(allocator.snapshot().base_nonce, None);
        assert_eq!(submitter.state(), SubmissionState::Idle);
    }

    #[tokio::test]
    async fn test_second_submit_is_busy() {
        let chain = Arc::new(FakeChain::new(0).hold_receipts());
        let (submitter, _allocator) = managed(&chain);

        let first = assert_ok!(submitter.submit(call(), Arc::new(NoopHooks)));
        wait_for_pending(&submitter).await;

        let second = submitter.submit(call(), Arc::new(NoopHooks));
        assert!(matches!(second, Err(SubmitError::Busy)));
        assert_eq!(chain.sent_nonces().len(), 1);

        chain.release_receipts();
        let outcome = assert_ok!(first.outcome().await);
        assert!(matches!(outcome, SubmitOutcome::Confirmed { .. }));

        // Free again once settled
        assert!(!submitter.is_busy());
        let third = assert_ok!(submitter.submit(call(), Arc::new(NoopHooks)));
        chain.release_receipts();
        assert_ok!(third.outcome().await);
    }

    #[tokio::test]
    async fn test_pending_state_is_observable() {
        let chain = Arc::new(FakeChain::new(8).hold_receipts());
        let (submitter, allocator) = managed(&chain);

        let handle = assert_ok!(submitter.submit(call(), Arc::new(NoopHooks)));
        let tx_hash = wait_for_pending(&submitter).await;
        assert_eq!(allocator.snapshot().pending_count, 1);

        chain.release_receipts();
        let outcome = assert_ok!(handle.outcome().await);
        assert_eq!(outcome.tx_hash(), Some(tx_hash));
    }

    #[tokio::test]
    async fn test_user_rejection_frees_slot_without_refetch() {
        let chain = Arc::new(FakeChain::new(5));
        let (submitter, allocator) = managed(&chain);
        let hooks = Recorder::watching(&allocator);

        // Another nonce is in flight elsewhere, so the baseline stays cached
        allocator.get_nonce().await.unwrap();
        chain.fail_next_send("User rejected the request.");

        let outcome = assert_ok!(submitter.submit_and_wait(call(), hooks.clone()).await);
        match &outcome {
            SubmitOutcome::RejectedBeforeSend { nonce, error } => {
                assert_eq!(*nonce, Some(6));
                assert!(matches!(error, SubmitError::UserRejected(_)));
                assert!(!error.is_user_visible());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(hooks.events(), vec!["error:2"]);
        assert_eq!(allocator.snapshot().pending_count, 1);
        assert_eq!(chain.read_count(), 1);
        assert_eq!(submitter.state(), SubmissionState::Idle);
    }

    #[tokio::test]
    async fn test_nonce_conflict_on_send_resets_allocator() {
        let chain = Arc::new(FakeChain::new(10));
        let (submitter, allocator) = managed(&chain);
        chain.fail_next_send("nonce too low");

        let outcome = assert_ok!(submitter.submit_and_wait(call(), Arc::new(NoopHooks)).await);
        assert!(matches!(
            outcome.error(),
            Some(SubmitError::NonceConflict(_))
        ));
        assert_eq!(allocator.snapshot().next_fetch_tag, BlockTag::Latest);

        // Resubmission resyncs from the latest view
        chain.set_count(BlockTag::Latest, 12);
        let outcome = assert_ok!(submitter.submit_and_wait(call(), Arc::new(NoopHooks)).await);
        assert_eq!(outcome.nonce(), Some(12));
        assert_eq!(
            chain.reads(),
            vec![BlockTag::Pending, BlockTag::Latest]
        );
    }

    #[tokio::test]
    async fn test_revert_frees_slot_without_refetch() {
        let chain = Arc::new(FakeChain::new(2));
        let (submitter, allocator) = managed(&chain);
        let hooks = Recorder::watching(&allocator);

        allocator.get_nonce().await.unwrap();
        chain.revert_next();

        let outcome = assert_ok!(submitter.submit_and_wait(call(), hooks.clone()).await);
        match outcome {
            SubmitOutcome::Failed { nonce, tx_hash, error } => {
                assert_eq!(nonce, Some(3));
                assert_eq!(
                    error,
                    SubmitError::TransactionReverted {
                        tx_hash: format!("{:?}", tx_hash)
                    }
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(hooks.events(), vec!["pending:2", "error:2"]);
        assert_eq!(allocator.snapshot().pending_count, 1);
        assert_eq!(allocator.snapshot().base_nonce, Some(2));
        assert_eq!(chain.read_count(), 1);
    }

    #[tokio::test]
    async fn test_receipt_error_is_reported() {
        let chain = Arc::new(FakeChain::new(0));
        let (submitter, allocator) = managed(&chain);
        chain.fail_next_receipt("not settled after 180s");

        let outcome = assert_ok!(submitter.submit_and_wait(call(), Arc::new(NoopHooks)).await);
        assert!(matches!(
            outcome.error(),
            Some(SubmitError::ReceiptError { .. })
        ));
        assert_eq!(allocator.snapshot().pending_count, 0);
    }

    #[tokio::test]
    async fn test_failed_nonce_read_reports_without_feedback() {
        let chain = Arc::new(FakeChain::new(0));
        chain.fail_next_read("connection refused");
        let (submitter, allocator) = managed(&chain);
        let hooks = Recorder::watching(&allocator);

        let outcome = assert_ok!(submitter.submit_and_wait(call(), hooks.clone()).await);
        match outcome {
            SubmitOutcome::RejectedBeforeSend { nonce, error } => {
                assert_eq!(nonce, None);
                assert!(matches!(error, SubmitError::ChainRead { .. }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(hooks.events(), vec!["error:0"]);
        assert!(chain.sent_nonces().is_empty());
        assert_eq!(allocator.snapshot().next_fetch_tag, BlockTag::Pending);
    }

    #[tokio::test]
    async fn test_simple_write_leaves_nonce_to_client() {
        let mut chain = MockChainClient::new();
        chain.expect_chain_id().return_const(1u64);
        chain.expect_transaction_count().never();
        chain
            .expect_send_transaction()
            .withf(|_, nonce| nonce.is_none())
            .times(1)
            .returning(|_, _| Ok(TxHash::repeat_byte(0x07)));
        chain
            .expect_wait_for_receipt()
            .times(1)
            .returning(|tx_hash| {
                Ok(TxReceipt {
                    tx_hash,
                    block_number: 19,
                    gas_used: Some(U256::from(30_000)),
                    success: true,
                })
            });

        let submitter = Arc::new(TransactionSubmitter::without_nonce_management(
            "approve",
            Arc::new(chain),
        ));
        let receipt = assert_ok!(assert_ok!(
            submitter.submit_and_wait(call(), Arc::new(NoopHooks)).await
        )
        .into_result());

        assert_eq!(receipt.tx_hash, TxHash::repeat_byte(0x07));
        assert_eq!(receipt.block_number, 19);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_completes() {
        let chain = Arc::new(FakeChain::new(1).hold_receipts());
        let (submitter, allocator) = managed(&chain);

        let handle = assert_ok!(submitter.submit(call(), Arc::new(NoopHooks)));
        wait_for_pending(&submitter).await;
        drop(handle);

        chain.release_receipts();
        for _ in 0..100 {
            if !submitter.is_busy() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!submitter.is_busy());
        assert_eq!(allocator.snapshot().pending_count, 0);
    }
}
