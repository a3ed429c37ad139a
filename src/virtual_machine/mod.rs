//! The instruction VM whose traces the dispute game argues about.
//!
//! # Machine model
//!
//! - **Memory**: `2^address_bits` cells of `u32`, zero-initialised, committed
//!   to by a sparse Merkle tree of the same depth
//! - **Instructions**: `(opcode, a, b, c)`; the opcode table in [`isa`] says
//!   which fields are addresses, immediates or pointers
//! - **Execution**: one instruction per step, wrapping arithmetic, no
//!   runtime errors; unknown opcodes are no-ops
//! - **Trace**: every snapshot from step 0 until `pc` leaves the program or
//!   the step bound is reached
//!
//! # Modules
//!
//! - [`errors`]: program loading errors
//! - [`isa`]: opcode table
//! - [`program`]: instructions, programs and their text form
//! - [`vm`]: execution, snapshots, traces and step records

pub mod errors;
pub mod isa;
pub mod program;
pub mod vm;
