//! Party keys: Schnorr signing and encrypted key files.

pub mod key_pair;
