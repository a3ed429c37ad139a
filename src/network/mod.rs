//! Ledger access and the per-party game loop.
//!
//! - [`indexer`]: the `ChainIndexer` trait and a retrying wrapper
//! - [`local_chain`]: an in-process ledger
//! - [`remote`]: serving a ledger over TCP
//! - [`scheduler`]: the dispute client

pub mod indexer;
pub mod local_chain;
pub mod remote;
pub mod scheduler;
