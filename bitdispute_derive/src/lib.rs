//! Derive macros for the bitdispute crate.
//!
//! - `#[derive(BinaryCodec)]` implements `Encode`/`Decode` from `crate::types::encoding`
//! - `#[derive(Error)]` implements `Display` and `std::error::Error`

mod binary_codec;
mod error;

use proc_macro::TokenStream;

/// Implements `Encode` and `Decode` by visiting fields in declaration order.
#[proc_macro_derive(BinaryCodec)]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::derive_binary_codec(input)
}

/// Implements `Display` from `#[error("...")]` attributes, plus `std::error::Error`.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
