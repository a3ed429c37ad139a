//! Instruction set.
//!
//! [`for_each_instruction!`](crate::for_each_instruction) holds the canonical
//! opcode table and hands it to a callback macro, so the VM, the text
//! parser and the disprove-leaf generator all read the same definitions.
//!
//! Every instruction has three 32-bit operand fields `a`, `b`, `c`. The table
//! records how each field is used:
//!
//! - `Addr`: a memory address fixed by the program text
//! - `Imm`: a literal, never dereferenced
//! - `Ptr`: an address that [`AddressingMode::Indirect`](super::vm::AddressingMode)
//!   reads from memory at run time (static under `Literal`)
//! - `Unused`: ignored by the opcode

use crate::virtual_machine::errors::VmError;

/// How an instruction uses one operand field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Addr,
    Imm,
    Ptr,
    Unused,
}

#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Arithmetic and logic
            // =========================
            /// ADD a b c ; mem[c] = mem[a] + mem[b]
            Add = 1, "ADD" => [Addr, Addr, Addr], writes,
            /// SUB a b c ; mem[c] = mem[a] - mem[b]
            Sub = 2, "SUB" => [Addr, Addr, Addr], writes,
            /// MUL a b c ; mem[c] = mem[a] * mem[b]
            Mul = 3, "MUL" => [Addr, Addr, Addr], writes,
            /// AND a b c ; mem[c] = mem[a] & mem[b]
            And = 4, "AND" => [Addr, Addr, Addr], writes,
            /// OR a b c ; mem[c] = mem[a] | mem[b]
            Or = 5, "OR" => [Addr, Addr, Addr], writes,
            /// XOR a b c ; mem[c] = mem[a] ^ mem[b]
            Xor = 6, "XOR" => [Addr, Addr, Addr], writes,
            // =========================
            // Immediates
            // =========================
            /// ADDI a imm c ; mem[c] = mem[a] + imm
            AddI = 7, "ADDI" => [Addr, Imm, Addr], writes,
            /// SUBI a imm c ; mem[c] = mem[a] - imm
            SubI = 8, "SUBI" => [Addr, Imm, Addr], writes,
            /// ANDI a imm c ; mem[c] = mem[a] & imm
            AndI = 9, "ANDI" => [Addr, Imm, Addr], writes,
            /// ORI a imm c ; mem[c] = mem[a] | imm
            OrI = 10, "ORI" => [Addr, Imm, Addr], writes,
            /// XORI a imm c ; mem[c] = mem[a] ^ imm
            XorI = 11, "XORI" => [Addr, Imm, Addr], writes,
            // =========================
            // Control flow
            // =========================
            /// JMP a ; pc = mem[a]
            Jmp = 12, "JMP" => [Addr, Unused, Unused], keeps,
            /// BEQ a b target ; if mem[a] == mem[b] then branch to target
            Beq = 13, "BEQ" => [Addr, Addr, Imm], keeps,
            /// BNE a b target ; if mem[a] != mem[b] then branch to target
            Bne = 14, "BNE" => [Addr, Addr, Imm], keeps,
            // =========================
            // Shifts and comparisons
            // =========================
            /// RSHIFT1 a c ; mem[c] = mem[a] >> 1
            Rshift1 = 15, "RSHIFT1" => [Addr, Unused, Addr], writes,
            /// SLTU a b c ; mem[c] = mem[a] < mem[b] (unsigned)
            Sltu = 16, "SLTU" => [Addr, Addr, Addr], writes,
            /// SLT a b c ; mem[c] = mem[a] < mem[b] (signed)
            Slt = 17, "SLT" => [Addr, Addr, Addr], writes,
            /// SYSCALL ; no effect
            Syscall = 18, "SYSCALL" => [Unused, Unused, Unused], keeps,
            // =========================
            // Memory
            // =========================
            /// LOAD a b c ; mem[c] = mem[a], a = mem[b] when indirect
            Load = 19, "LOAD" => [Ptr, Addr, Addr], writes,
            /// STORE a b c ; mem[c] = mem[a], c = mem[b] when indirect
            Store = 20, "STORE" => [Addr, Addr, Ptr], writes,
            /// RSHIFT8 a c ; mem[c] = mem[a] >> 8
            Rshift8 = 21, "RSHIFT8" => [Addr, Unused, Addr], writes,
            /// LSHIFT8 a c ; mem[c] = mem[a] << 8
            Lshift8 = 22, "LSHIFT8" => [Addr, Unused, Addr], writes,
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal => [$a:ident, $b:ident, $c:ident], $effect:ident
        ),* $(,)?
    ) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u32> for Opcode {
            type Error = VmError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Opcode::$name), )*
                    _ => Err(VmError::UnknownOpcode(value)),
                }
            }
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$( Opcode::$name, )*];

            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            pub fn from_mnemonic(text: &str) -> Option<Opcode> {
                match text {
                    $( $mnemonic => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Usage of the `a`, `b` and `c` fields.
            pub const fn operands(&self) -> [Operand; 3] {
                match self {
                    $( Opcode::$name => [Operand::$a, Operand::$b, Operand::$c], )*
                }
            }

            /// True if the instruction stores a result at its `c` address.
            pub const fn writes_memory(&self) -> bool {
                match self {
                    $( Opcode::$name => define_instructions!(@effect $effect), )*
                }
            }

            pub const fn code(&self) -> u32 {
                *self as u32
            }
        }
    };

    (@effect writes) => { true };
    (@effect keeps) => { false };
}

for_each_instruction!(define_instructions);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_decode_from_their_codes() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(op.code()).unwrap(), *op);
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(*op));
        }
        assert!(matches!(Opcode::try_from(0), Err(VmError::UnknownOpcode(0))));
        assert!(matches!(Opcode::try_from(23), Err(VmError::UnknownOpcode(23))));
    }

    #[test]
    fn table_codes_are_stable() {
        assert_eq!(Opcode::Add.code(), 1);
        assert_eq!(Opcode::XorI.code(), 11);
        assert_eq!(Opcode::Load.code(), 19);
        assert_eq!(Opcode::Lshift8.code(), 22);
    }

    #[test]
    fn pointer_fields_belong_to_memory_ops() {
        assert_eq!(Opcode::Load.operands()[0], Operand::Ptr);
        assert_eq!(Opcode::Store.operands()[2], Operand::Ptr);
        assert_eq!(Opcode::Beq.operands()[2], Operand::Imm);
        assert!(!Opcode::Jmp.writes_memory());
        assert!(Opcode::Store.writes_memory());
    }
}
