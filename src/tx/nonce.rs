//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce allocation on top of a one-time chain baseline
//! - Coalescing concurrent baseline reads into a single chain request
//! - Resync from the `latest` view when the chain reports a nonce conflict
//!
//! The chain's pending count is read once and a local offset is layered on
//! top, so transactions submitted in quick succession get distinct nonces even
//! though the node has not seen the earlier ones yet. The baseline is dropped
//! whenever the account goes quiet (no in-flight transactions), which bounds
//! how far the local view can drift.

use super::classify::FailureKind;
use crate::chain::{BlockTag, ChainClient};
use crate::error::{SubmitError, SubmitResult};
use crate::metrics;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

type SharedFetch = Shared<BoxFuture<'static, SubmitResult<u64>>>;

/// A baseline read that callers can join
#[derive(Clone)]
struct InFlightFetch {
    id: u64,
    epoch: u64,
    fetch: SharedFetch,
}

/// Per-account nonce state
struct AccountNonceState {
    /// Last nonce read from the chain
    base_nonce: Option<u64>,
    /// Allocated since `base_nonce` was read, not yet confirmed or failed
    pending_count: u64,
    /// Baseline read currently running, if any
    in_flight: Option<InFlightFetch>,
    /// View used by the next baseline read
    next_fetch_tag: BlockTag,
    /// Bumped on every hard reset; reads from an older epoch are discarded
    epoch: u64,
    /// Id handed to the next baseline read
    next_fetch_id: u64,
    fetched_at: Option<DateTime<Utc>>,
}

impl AccountNonceState {
    fn new() -> Self {
        Self {
            base_nonce: None,
            pending_count: 0,
            in_flight: None,
            next_fetch_tag: BlockTag::Pending,
            epoch: 0,
            next_fetch_id: 0,
            fetched_at: None,
        }
    }
}

/// Read-only view of an allocator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceSnapshot {
    pub address: Address,
    pub base_nonce: Option<u64>,
    pub pending_count: u64,
    pub fetch_in_flight: bool,
    pub next_fetch_tag: BlockTag,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Nonce the next allocation will return, if the baseline is cached
    pub next_nonce: Option<u64>,
}

/// Hands out nonces for a single account.
///
/// One instance per address; a wallet switch builds a new allocator instead
/// of mutating this one.
pub struct NonceAllocator {
    /// Account address
    address: Address,
    /// Chain the baseline is read from
    chain: Arc<dyn ChainClient>,
    state: Mutex<AccountNonceState>,
}

impl NonceAllocator {
    /// Create a new allocator. Nothing is read from the chain until the first
    /// `get_nonce` call.
    pub fn new(address: Address, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            address,
            chain,
            state: Mutex::new(AccountNonceState::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    /// Allocate the next nonce.
    ///
    /// Concurrent callers that arrive while the baseline is unknown all await
    /// the same chain read; a failed read is returned to every one of them.
    pub async fn get_nonce(&self) -> SubmitResult<u64> {
        loop {
            let in_flight = {
                let mut state = self.state.lock();
                if let Some(nonce) = self.allocate(&mut state) {
                    return Ok(nonce);
                }
                match state.in_flight.clone() {
                    Some(in_flight) => in_flight,
                    None => {
                        let in_flight = self.start_fetch(&mut state);
                        state.in_flight = Some(in_flight.clone());
                        in_flight
                    }
                }
            };

            let result = in_flight.fetch.clone().await;
            self.settle_fetch(&in_flight, result)?;
        }
    }

    /// A transaction using an allocated nonce was mined
    pub fn transaction_confirmed(&self) {
        let mut state = self.state.lock();
        state.pending_count = state.pending_count.saturating_sub(1);
        if state.pending_count == 0 && state.base_nonce.take().is_some() {
            debug!(
                "All nonces for {:?} settled, baseline will be re-read",
                self.address
            );
        }
        metrics::record_pending_nonces(self.chain.chain_id(), state.pending_count);
    }

    /// A transaction using an allocated nonce failed.
    ///
    /// Nonce conflicts trigger a hard reset; any other failure just frees the
    /// slot. Returns how the error was classified.
    pub fn transaction_failed(&self, error: &SubmitError) -> FailureKind {
        let kind = error.failure_kind();
        match kind {
            FailureKind::NonceConflict => {
                warn!(
                    "Nonce conflict for {:?} on chain {}: {}",
                    self.address,
                    self.chain.chain_id(),
                    error
                );
                self.reset();
            }
            FailureKind::UserRejected | FailureKind::Other => {
                let mut state = self.state.lock();
                state.pending_count = state.pending_count.saturating_sub(1);
                debug!(
                    "Released nonce slot for {:?} ({} pending): {}",
                    self.address, state.pending_count, error
                );
                metrics::record_pending_nonces(self.chain.chain_id(), state.pending_count);
            }
        }
        kind
    }

    /// Forget all local bookkeeping; the next allocation re-reads the
    /// baseline from the `latest` view
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.base_nonce = None;
        state.pending_count = 0;
        state.in_flight = None;
        state.next_fetch_tag = BlockTag::Latest;
        state.epoch += 1;

        info!(
            "Reset nonce allocator for {:?} on chain {}",
            self.address,
            self.chain.chain_id()
        );
        metrics::record_nonce_reset(self.chain.chain_id());
    }

    pub fn snapshot(&self) -> NonceSnapshot {
        let state = self.state.lock();
        NonceSnapshot {
            address: self.address,
            base_nonce: state.base_nonce,
            pending_count: state.pending_count,
            fetch_in_flight: state.in_flight.is_some(),
            next_fetch_tag: state.next_fetch_tag,
            fetched_at: state.fetched_at,
            next_nonce: state.base_nonce.map(|base| base + state.pending_count),
        }
    }

    fn allocate(&self, state: &mut AccountNonceState) -> Option<u64> {
        let base = state.base_nonce?;
        let nonce = base + state.pending_count;
        state.pending_count += 1;

        debug!(
            "Allocated nonce {} for {:?} on chain {}",
            nonce,
            self.address,
            self.chain.chain_id()
        );
        metrics::record_nonce_allocated(self.chain.chain_id(), state.pending_count);
        Some(nonce)
    }

    fn start_fetch(&self, state: &mut AccountNonceState) -> InFlightFetch {
        let chain = Arc::clone(&self.chain);
        let address = self.address;
        let tag = state.next_fetch_tag;
        let id = state.next_fetch_id;
        state.next_fetch_id += 1;

        debug!(
            "Fetching {} transaction count for {:?} on chain {}",
            tag,
            address,
            chain.chain_id()
        );
        metrics::record_nonce_fetch(chain.chain_id(), tag);

        let fetch = async move { chain.transaction_count(address, tag).await }
            .boxed()
            .shared();

        InFlightFetch {
            id,
            epoch: state.epoch,
            fetch,
        }
    }

    /// Install the result of a baseline read.
    ///
    /// Only the first waiter to resume while the read still occupies the
    /// in-flight slot writes anything. Late waiters of an older read loop
    /// around and allocate from whatever state is current, or see the error.
    fn settle_fetch(&self, fetch: &InFlightFetch, result: SubmitResult<u64>) -> SubmitResult<()> {
        let mut state = self.state.lock();

        // A reset happened while the read was running; go around again
        if state.epoch != fetch.epoch {
            return Ok(());
        }

        let owns_fetch = state
            .in_flight
            .as_ref()
            .map_or(false, |in_flight| in_flight.id == fetch.id);

        match result {
            Ok(base) if owns_fetch => {
                state.in_flight = None;
                state.base_nonce = Some(base);
                state.next_fetch_tag = BlockTag::Pending;
                state.fetched_at = Some(Utc::now());
                debug!(
                    "Base nonce for {:?} on chain {} is {}",
                    self.address,
                    self.chain.chain_id(),
                    base
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                if owns_fetch {
                    state.in_flight = None;
                    warn!("Base nonce read failed for {:?}: {}", self.address, e);
                }
                Err(e)
            }
        }
    }
}
