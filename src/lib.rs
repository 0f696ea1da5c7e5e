//! NiuNiu transaction coordinator
//!
//! Client-side nonce allocation and transaction submission for the NiuNiu
//! on-chain poker contracts. Many game actions are sent from one account in
//! quick succession; this crate hands each one a distinct nonce without
//! asking the chain every time, and keeps that bookkeeping in step with what
//! the chain eventually confirms or rejects.

pub mod account;
pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tx;

pub use account::{AccountSession, ConnectedAccount};
pub use chain::{BlockTag, CallRequest, ChainClient, EthereumClient, TxReceipt};
pub use error::{SubmitError, SubmitResult};
pub use tx::{
    classify_failure, FailureKind, NonceAllocator, SubmissionState, SubmitHooks, SubmitOutcome,
    TransactionSubmitter,
};
