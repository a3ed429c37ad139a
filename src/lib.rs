//! An optimistic, interactively verified computation dispute engine.
//!
//! Provides the dispute VM, the commitment and script layers, the compiled
//! transaction graph, and the client that plays a game on a ledger.

pub mod crypto;
pub mod network;
pub mod protocol;
pub mod types;
pub mod utils;
pub mod virtual_machine;
