//! Account module - the wallet/account provider side of the coordinator
//!
//! A session holds at most one connected account. Every address gets its own
//! nonce allocator; switching wallets replaces it rather than mutating it.

mod session;

pub use session::{AccountSession, ConnectedAccount};
