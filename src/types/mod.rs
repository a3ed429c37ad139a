//! Primitive types shared by the VM, the protocol and the ledger plumbing.
//!
//! - [`encoding`]: deterministic binary codec
//! - [`bytes`]: shared byte buffer
//! - [`hash`]: SHA3-256 digests
//! - [`merkle_tree`]: the memory commitment tree and the script tree

pub mod bytes;
pub mod encoding;
pub mod hash;
pub mod merkle_tree;
