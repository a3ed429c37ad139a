//! Protocol parameters.
//!
//! Both parties must agree on every value here: they shape the transaction
//! graph, so a single differing field yields different txids.

use crate::virtual_machine::vm::VmConfig;
use bitdispute_derive::{BinaryCodec, Error};

pub use crate::virtual_machine::vm::{AddressingMode, BranchTarget};

/// Largest supported `log_path_len`; addresses are `u32`.
pub const MAX_LOG_PATH_LEN: u8 = 5;
/// Largest supported `log_trace_len`; trace indices travel as `u32` and the
/// trace-challenge bits of one script stay bounded.
pub const MAX_LOG_TRACE_LEN: u8 = 16;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("log_trace_len must be between 1 and {max}, got {got}")]
    TraceLength { got: u8, max: u8 },
    #[error("log_path_len must be between 1 and {max}, got {got}")]
    PathLength { got: u8, max: u8 },
    #[error("timeout must be at least one block")]
    ZeroTimeout,
    #[error("dust limit must be positive")]
    ZeroDust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub struct Params {
    /// `TRACE_LEN = 2^log_trace_len` steps are bisected.
    pub log_trace_len: u8,
    /// `PATH_LEN = 2^log_path_len` is the memory tree depth and address width.
    pub log_path_len: u8,
    /// Relative timelock, in blocks, of every timeout leaf.
    pub timeout: u32,
    /// Value deducted by every transaction of the graph.
    pub min_fees: u64,
    /// Smallest output value a compiled node may carry.
    pub dust_limit: u64,
    pub addressing: AddressingMode,
    pub branch_target: BranchTarget,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            log_trace_len: 5,
            log_path_len: 5,
            timeout: 1,
            min_fees: 5000,
            dust_limit: 500,
            addressing: AddressingMode::default(),
            branch_target: BranchTarget::default(),
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.log_trace_len == 0 || self.log_trace_len > MAX_LOG_TRACE_LEN {
            return Err(ParamsError::TraceLength {
                got: self.log_trace_len,
                max: MAX_LOG_TRACE_LEN,
            });
        }
        if self.log_path_len == 0 || self.log_path_len > MAX_LOG_PATH_LEN {
            return Err(ParamsError::PathLength {
                got: self.log_path_len,
                max: MAX_LOG_PATH_LEN,
            });
        }
        if self.timeout == 0 {
            return Err(ParamsError::ZeroTimeout);
        }
        if self.dust_limit == 0 {
            return Err(ParamsError::ZeroDust);
        }
        Ok(())
    }

    /// Rounds of trace bisection.
    pub fn trace_rounds(&self) -> usize {
        usize::from(self.log_trace_len)
    }

    pub fn trace_len(&self) -> u32 {
        1u32 << self.log_trace_len
    }

    /// Rounds of memory bisection per channel.
    pub fn path_rounds(&self) -> usize {
        usize::from(self.log_path_len)
    }

    pub fn path_len(&self) -> usize {
        1usize << self.log_path_len
    }

    /// Snapshots a run keeps: one per trace index plus the state after the last step.
    pub fn max_steps(&self) -> usize {
        self.trace_len() as usize + 1
    }

    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            address_bits: self.path_len() as u32,
            addressing: self.addressing,
            branch_target: self.branch_target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::{Decode, Encode};

    #[test]
    fn defaults() {
        let params = Params::default();
        params.validate().unwrap();
        assert_eq!(params.trace_len(), 32);
        assert_eq!(params.path_len(), 32);
        assert_eq!(params.max_steps(), 33);
        assert_eq!(params.vm_config().address_bits, 32);
        assert_eq!(params.vm_config().addressing, AddressingMode::Indirect);
    }

    #[test]
    fn rejects_out_of_range() {
        let params = Params {
            log_path_len: 6,
            ..Params::default()
        };
        assert!(matches!(params.validate(), Err(ParamsError::PathLength { .. })));

        let params = Params {
            log_trace_len: 0,
            ..Params::default()
        };
        assert!(matches!(params.validate(), Err(ParamsError::TraceLength { .. })));

        let params = Params {
            timeout: 0,
            ..Params::default()
        };
        assert!(matches!(params.validate(), Err(ParamsError::ZeroTimeout)));
    }

    #[test]
    fn encoding_is_stable() {
        let params = Params {
            branch_target: BranchTarget::Relative,
            ..Params::default()
        };
        let bytes = params.to_bytes();
        assert_eq!(bytes.len(), 1 + 1 + 4 + 8 + 8 + 1 + 1);
        assert_eq!(Params::from_bytes(&bytes).unwrap(), params);
    }
}
