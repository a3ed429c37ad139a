//! Programs: an immutable list of `(opcode, a, b, c)` instructions.
//!
//! Programs are written as text, one instruction per line:
//!
//! ```text
//! # count mem[0] up to mem[2]
//! ADD 0 1 0
//! BNE 0 2 0
//! ```
//!
//! Operands are decimal (negative values wrap to two's complement) or
//! `0x`-prefixed hex.

use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::isa::{Opcode, Operand};
use bitdispute_derive::BinaryCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinaryCodec)]
pub struct Instruction {
    /// Raw opcode. Codes outside the table execute as no-ops.
    pub kind: u32,
    pub address_a: u32,
    pub address_b: u32,
    pub address_c: u32,
}

impl Instruction {
    pub const fn new(op: Opcode, address_a: u32, address_b: u32, address_c: u32) -> Self {
        Self {
            kind: op.code(),
            address_a,
            address_b,
            address_c,
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.kind).ok()
    }

    pub fn fields(&self) -> [u32; 3] {
        [self.address_a, self.address_b, self.address_c]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BinaryCodec)]
pub struct Program {
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, pc: u32) -> Option<&Instruction> {
        self.instructions.get(pc as usize)
    }

    pub fn parse(text: &str) -> Result<Program, VmError> {
        let mut instructions = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let body = raw.split('#').next().unwrap_or("").trim();
            if body.is_empty() {
                continue;
            }

            let mut parts = body.split_whitespace();
            let mnemonic = parts.next().unwrap_or("");
            let op = Opcode::from_mnemonic(&mnemonic.to_ascii_uppercase()).ok_or_else(|| {
                VmError::UnknownMnemonic {
                    line,
                    mnemonic: mnemonic.to_string(),
                }
            })?;

            let operands = parts
                .map(|text| {
                    parse_word(text).ok_or_else(|| VmError::InvalidOperand {
                        line,
                        text: text.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let padded: [u32; 3] = match operands.len() {
                0..=3 => {
                    let mut fields = [0u32; 3];
                    fields[..operands.len()].copy_from_slice(&operands);
                    fields
                }
                got => return Err(VmError::OperandCount { line, got }),
            };
            if operands.len() != 3 && op != Opcode::Syscall {
                return Err(VmError::OperandCount {
                    line,
                    got: operands.len(),
                });
            }

            instructions.push(Instruction::new(op, padded[0], padded[1], padded[2]));
        }
        Ok(Program { instructions })
    }

    /// Checks that every static address fits in `address_bits` bits.
    pub fn validate(&self, address_bits: u32) -> Result<(), VmError> {
        if address_bits >= 32 {
            return Ok(());
        }
        for (pc, instruction) in self.instructions.iter().enumerate() {
            let Some(op) = instruction.opcode() else {
                continue;
            };
            for (usage, address) in op.operands().iter().zip(instruction.fields()) {
                let addressed = matches!(usage, Operand::Addr | Operand::Ptr);
                if addressed && u64::from(address) >> address_bits != 0 {
                    return Err(VmError::AddressOutOfRange {
                        pc,
                        address,
                        bits: address_bits,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parses a decimal (possibly negative) or `0x` hex literal into a word.
pub fn parse_word(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if text.starts_with('-') {
        return text.parse::<i32>().ok().map(|v| v as u32);
    }
    text.parse::<u32>().ok()
}

/// Parses whitespace- or comma-separated memory cells.
pub fn parse_memory(text: &str) -> Result<Vec<u32>, VmError> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|cell| !cell.is_empty())
        .map(|cell| parse_word(cell).ok_or_else(|| VmError::InvalidCell(cell.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_counting_program() {
        let program = Program::parse(
            "# count up\n\
             ADD 0 1 0\n\
             bne 0 2 -1   # back one\n",
        )
        .unwrap();
        assert_eq!(
            program.instructions,
            vec![
                Instruction::new(Opcode::Add, 0, 1, 0),
                Instruction::new(Opcode::Bne, 0, 2, u32::MAX),
            ]
        );
    }

    #[test]
    fn parse_reports_line_numbers() {
        let err = Program::parse("ADD 0 1 0\nFOO 1 2 3").unwrap_err();
        assert!(matches!(err, VmError::UnknownMnemonic { line: 2, .. }));

        let err = Program::parse("ADD 0 1").unwrap_err();
        assert!(matches!(err, VmError::OperandCount { line: 1, got: 2 }));

        let err = Program::parse("ADD 0 x 1").unwrap_err();
        assert!(matches!(err, VmError::InvalidOperand { line: 1, .. }));
    }

    #[test]
    fn syscall_takes_no_operands() {
        let program = Program::parse("SYSCALL").unwrap();
        assert_eq!(program.instructions[0], Instruction::new(Opcode::Syscall, 0, 0, 0));
    }

    #[test]
    fn validate_rejects_wide_static_addresses() {
        let program = Program::new(vec![
            Instruction::new(Opcode::AddI, 1, 1000, 2),
            Instruction::new(Opcode::Add, 0, 16, 1),
        ]);
        let err = program.validate(4).unwrap_err();
        assert!(matches!(err, VmError::AddressOutOfRange { pc: 1, address: 16, bits: 4 }));
        assert!(program.validate(32).is_ok());
    }

    #[test]
    fn memory_cells() {
        assert_eq!(parse_memory("0 1, 10\n0x10 -1").unwrap(), vec![0, 1, 10, 16, u32::MAX]);
        assert!(parse_memory("1 two").is_err());
    }
}
