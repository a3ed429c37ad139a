//! Single-step disprove leaves.
//!
//! Once the prover has committed the instruction fields of the disputed
//! step, the verifier wins outright if those fields contradict the program
//! or the semantics of the claimed opcode. Every way to contradict them is
//! one leaf of the `DisproveProgram` node:
//!
//! - [`Disprove::Instruction`]: `pc` holds a different instruction kind
//! - [`Disprove::Operand`]: a static operand differs from the program text
//! - [`Disprove::Halted`]: a step outside the program is not the halted pseudo-step
//! - [`Disprove::NoOp`]: an instruction kind outside the opcode table did not just advance `pc`
//! - [`Disprove::Semantics`]: the values break the opcode's semantics
//!
//! The conditions below are the only encoding of instruction semantics
//! used on-chain; [`violation`] evaluates the same conditions natively.

use crate::protocol::commitment::{Field, Symbol, Value};
use crate::protocol::params::Params;
use crate::protocol::script::{BinOp, Condition, Expr, Slot, Symbols};
use crate::virtual_machine::isa::{Opcode, Operand};
use crate::virtual_machine::program::Program;
use crate::virtual_machine::vm::{AddressingMode, BranchTarget, StepRecord};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disprove {
    Instruction { pc: u32, kind: u32 },
    Operand { pc: u32, slot: u8, value: u32 },
    Halted { program_len: u32 },
    /// A kind the program uses that has no opcode.
    NoOp { kind: u32, program_len: u32 },
    Semantics(Opcode),
}

impl fmt::Display for Disprove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disprove::Instruction { pc, kind } => write!(f, "instruction {pc} is kind {kind}"),
            Disprove::Operand { pc, slot, value } => {
                write!(f, "instruction {pc} operand {slot} is {value}")
            }
            Disprove::Halted { .. } => f.write_str("steps outside the program halt"),
            Disprove::NoOp { kind, .. } => write!(f, "kind {kind} only advances pc"),
            Disprove::Semantics(op) => write!(f, "{} semantics", op.mnemonic()),
        }
    }
}

fn field(field: Field) -> Expr {
    Expr::sym(Symbol::single(field))
}

fn word(value: u32) -> Expr {
    Expr::Word(value)
}

fn bin(op: BinOp, a: Expr, b: Expr) -> Expr {
    Expr::binary(op, a, b)
}

fn address_field(slot: usize) -> Field {
    [Field::AddressA, Field::AddressB, Field::AddressC][slot]
}

/// True if `slot` of `op` is fixed by the program text under `params`.
fn is_static(usage: Operand, params: &Params) -> bool {
    match usage {
        Operand::Addr | Operand::Imm => true,
        Operand::Ptr => params.addressing == AddressingMode::Literal,
        Operand::Unused => false,
    }
}

impl Disprove {
    pub fn condition(&self, params: &Params) -> Condition {
        match *self {
            Disprove::Instruction { pc, kind } => Condition::All(vec![
                Condition::Eq(field(Field::PcCurr), word(pc)),
                Condition::Ne(field(Field::InstructionType), word(kind)),
            ]),
            Disprove::Operand { pc, slot, value } => Condition::All(vec![
                Condition::Eq(field(Field::PcCurr), word(pc)),
                Condition::Ne(field(address_field(usize::from(slot))), word(value)),
            ]),
            Disprove::Halted { program_len } => Condition::All(vec![
                Condition::Eq(bin(BinOp::Ltu, field(Field::PcCurr), word(program_len)), word(0)),
                Condition::Any(vec![
                    Condition::Ne(field(Field::InstructionType), word(0)),
                    Condition::Ne(field(Field::PcNext), field(Field::PcCurr)),
                ]),
            ]),
            Disprove::NoOp { kind, program_len } => Condition::All(vec![
                Condition::Eq(field(Field::InstructionType), word(kind)),
                Condition::Eq(bin(BinOp::Ltu, field(Field::PcCurr), word(program_len)), word(1)),
                Condition::Ne(
                    field(Field::PcNext),
                    bin(BinOp::Add, field(Field::PcCurr), word(1)),
                ),
            ]),
            Disprove::Semantics(op) => Condition::All(vec![
                Condition::Eq(field(Field::InstructionType), word(op.code())),
                Condition::Any(semantic_violations(op, params)),
            ]),
        }
    }

    /// Native evaluation of [`Self::condition`] over a committed step.
    pub fn holds(&self, record: &StepRecord, params: &Params) -> bool {
        self.condition(params).holds(&bind(record)).unwrap_or(false)
    }
}

/// Ways the committed values of an `op` step can be wrong.
fn semantic_violations(op: Opcode, params: &Params) -> Vec<Condition> {
    let a = || field(Field::ValueA);
    let b = || field(Field::ValueB);
    let immediate = || field(Field::AddressB);
    let pc = || field(Field::PcCurr);
    let step = || bin(BinOp::Add, pc(), word(1));
    let mask = word(params.vm_config().mask(u32::MAX));

    let result = match op {
        Opcode::Add => Some(bin(BinOp::Add, a(), b())),
        Opcode::Sub => Some(bin(BinOp::Sub, a(), b())),
        Opcode::Mul => Some(bin(BinOp::Mul, a(), b())),
        Opcode::And => Some(bin(BinOp::And, a(), b())),
        Opcode::Or => Some(bin(BinOp::Or, a(), b())),
        Opcode::Xor => Some(bin(BinOp::Xor, a(), b())),
        Opcode::AddI => Some(bin(BinOp::Add, a(), immediate())),
        Opcode::SubI => Some(bin(BinOp::Sub, a(), immediate())),
        Opcode::AndI => Some(bin(BinOp::And, a(), immediate())),
        Opcode::OrI => Some(bin(BinOp::Or, a(), immediate())),
        Opcode::XorI => Some(bin(BinOp::Xor, a(), immediate())),
        Opcode::Rshift1 => Some(bin(BinOp::Shr, a(), word(1))),
        Opcode::Rshift8 => Some(bin(BinOp::Shr, a(), word(8))),
        Opcode::Lshift8 => Some(bin(BinOp::Shl, a(), word(8))),
        Opcode::Sltu => Some(bin(BinOp::Ltu, a(), b())),
        Opcode::Slt => Some(bin(BinOp::Lt, a(), b())),
        Opcode::Load | Opcode::Store => Some(a()),
        Opcode::Jmp | Opcode::Beq | Opcode::Bne | Opcode::Syscall => None,
    };

    let pc_next = match op {
        Opcode::Jmp => a(),
        Opcode::Beq | Opcode::Bne => {
            let target = match params.branch_target {
                BranchTarget::Absolute => field(Field::AddressC),
                BranchTarget::Relative => bin(BinOp::Add, pc(), field(Field::AddressC)),
            };
            // 1 iff the operands differ.
            let differ = bin(BinOp::Ltu, word(0), bin(BinOp::Xor, a(), b()));
            if op == Opcode::Beq {
                Expr::select(differ, target, step())
            } else {
                Expr::select(differ, step(), target)
            }
        }
        _ => step(),
    };

    let mut violations = Vec::new();
    if let Some(result) = result {
        violations.push(Condition::Ne(field(Field::ValueC), result));
    }
    violations.push(Condition::Ne(field(Field::PcNext), pc_next));
    if params.addressing == AddressingMode::Indirect {
        let pointer = bin(BinOp::And, b(), mask);
        match op {
            Opcode::Load => violations.push(Condition::Ne(field(Field::AddressA), pointer)),
            Opcode::Store => violations.push(Condition::Ne(field(Field::AddressC), pointer)),
            _ => {}
        }
    }
    violations
}

/// Every disprove leaf of `program`, in the order they are compiled.
pub fn leaves(program: &Program, params: &Params) -> Vec<Disprove> {
    let mut leaves = Vec::new();
    for (pc, instruction) in program.instructions.iter().enumerate() {
        let pc = pc as u32;
        leaves.push(Disprove::Instruction {
            pc,
            kind: instruction.kind,
        });
        let Some(op) = instruction.opcode() else {
            continue;
        };
        for (slot, (usage, value)) in op.operands().into_iter().zip(instruction.fields()).enumerate() {
            if is_static(usage, params) {
                leaves.push(Disprove::Operand {
                    pc,
                    slot: slot as u8,
                    value,
                });
            }
        }
    }
    let program_len = program.len() as u32;
    leaves.push(Disprove::Halted { program_len });
    let mut unknown: Vec<u32> = program
        .instructions
        .iter()
        .filter(|instruction| instruction.opcode().is_none())
        .map(|instruction| instruction.kind)
        .collect();
    unknown.sort_unstable();
    unknown.dedup();
    leaves.extend(unknown.into_iter().map(|kind| Disprove::NoOp { kind, program_len }));
    leaves.extend(Opcode::ALL.iter().map(|op| Disprove::Semantics(*op)));
    leaves
}

/// The committed instruction fields of `record` as script symbols.
pub fn bind(record: &StepRecord) -> Symbols {
    [
        (Field::InstructionType, record.kind),
        (Field::AddressA, record.address_a),
        (Field::AddressB, record.address_b),
        (Field::AddressC, record.address_c),
        (Field::ValueA, record.value_a),
        (Field::ValueB, record.value_b),
        (Field::ValueC, record.value_c),
        (Field::PrevValueC, record.prev_value_c),
        (Field::PcCurr, record.pc_curr),
        (Field::PcNext, record.pc_next),
    ]
    .into_iter()
    .map(|(field, value)| (Slot::new(Symbol::single(field)), Value::Word(value)))
    .collect()
}

/// The first disprove leaf that `record` satisfies.
pub fn violation(record: &StepRecord, program: &Program, params: &Params) -> Option<Disprove> {
    leaves(program, params)
        .into_iter()
        .find(|leaf| leaf.holds(record, params))
}
