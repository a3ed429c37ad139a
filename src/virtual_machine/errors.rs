use bitdispute_derive::Error;

/// Errors raised while parsing or loading a program. Execution itself never fails.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("line {line}: unknown mnemonic {mnemonic}")]
    UnknownMnemonic { line: usize, mnemonic: String },
    #[error("line {line}: expected 3 operands, got {got}")]
    OperandCount { line: usize, got: usize },
    #[error("line {line}: invalid operand {text}")]
    InvalidOperand { line: usize, text: String },
    #[error("instruction {pc}: address {address} is outside the {bits}-bit address space")]
    AddressOutOfRange { pc: usize, address: u32, bits: u32 },
    #[error("initial memory holds {len} cells, more than the {bits}-bit address space")]
    MemoryTooLarge { len: usize, bits: u32 },
    #[error("invalid memory cell {0}")]
    InvalidCell(String),
}
