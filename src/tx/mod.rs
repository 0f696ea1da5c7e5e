//! Transaction submission module with nonce management and gas policy

pub mod classify;
mod gas;
mod nonce;
mod submitter;

pub use classify::{classify_failure, FailureKind};
pub use gas::GasPolicy;
pub use nonce::{NonceAllocator, NonceSnapshot};
pub use submitter::{
    NoopHooks, SubmissionHandle, SubmissionState, SubmitHooks, SubmitOutcome,
    TransactionSubmitter,
};
