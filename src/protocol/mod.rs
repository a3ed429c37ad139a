//! The dispute protocol.
//!
//! A prover claims the result of running a program; a verifier who
//! disagrees narrows the claim down by bisection, first over the execution
//! trace and then over one memory path, until a single script can check it.
//!
//! - [`params`]: game parameters
//! - [`setup`]: the agreement both parties sign up to
//! - [`commitment`]: hashlock commitments to symbols
//! - [`script`]: the spending-predicate language and its interpreter
//! - [`bisection`]: index arithmetic of the bisection games
//! - [`disprove`]: checks of a committed instruction against the program
//! - [`graph`]: node types and adjacency
//! - [`leaf`]: spending conditions and how to satisfy them
//! - [`model`]: what a party knows and claims
//! - [`transaction`]: the compiled transaction graph

pub mod bisection;
pub mod commitment;
pub mod disprove;
pub mod graph;
pub mod leaf;
pub mod model;
pub mod params;
pub mod script;
pub mod setup;
pub mod transaction;
