//! Execution of a [`Program`] into a [`Trace`].
//!
//! Memory is `2^address_bits` cells of `u32`, all zero unless written. Every
//! address the VM touches is reduced to `address_bits` bits, so with the
//! default 32-bit space no reduction happens at all. Arithmetic wraps.
//!
//! A trace holds the snapshot before the first step and one per executed
//! step. It ends when `pc` leaves the program or after `max_steps`
//! snapshots. Past its end the last snapshot repeats.

use crate::types::merkle_tree::{MemoryTree, Node};
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::isa::{Opcode, Operand};
use crate::virtual_machine::program::{Instruction, Program};
use bitdispute_derive::BinaryCodec;
use std::collections::BTreeMap;

/// How LOAD and STORE find their memory cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinaryCodec)]
pub enum AddressingMode {
    /// `LOAD`: `mem[c] = mem[mem[b]]`. `STORE`: `mem[mem[b]] = mem[a]`.
    #[default]
    Indirect = 0,
    /// Both copy `mem[a]` into `mem[c]`.
    Literal = 1,
}

/// Where a taken BEQ/BNE branch lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinaryCodec)]
pub enum BranchTarget {
    /// `pc = c`
    #[default]
    Absolute = 0,
    /// `pc = pc + c`, wrapping
    Relative = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub address_bits: u32,
    pub addressing: AddressingMode,
    pub branch_target: BranchTarget,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            address_bits: 32,
            addressing: AddressingMode::default(),
            branch_target: BranchTarget::default(),
        }
    }
}

impl VmConfig {
    /// Reduces `address` to the configured width.
    pub fn mask(&self, address: u32) -> u32 {
        if self.address_bits >= 32 {
            address
        } else {
            address & ((1u32 << self.address_bits) - 1)
        }
    }

    pub fn tree_depth(&self) -> usize {
        self.address_bits as usize
    }

    fn branch(&self, pc: u32, target: u32) -> u32 {
        match self.branch_target {
            BranchTarget::Absolute => target,
            BranchTarget::Relative => pc.wrapping_add(target),
        }
    }
}

/// Sparse memory: only non-zero cells are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    cells: BTreeMap<u32, u32>,
}

impl Memory {
    pub fn from_words(words: &[u32]) -> Memory {
        let mut memory = Memory::default();
        for (address, value) in words.iter().enumerate() {
            memory.set(address as u32, *value);
        }
        memory
    }

    pub fn get(&self, address: u32) -> u32 {
        self.cells.get(&address).copied().unwrap_or(0)
    }

    pub fn set(&mut self, address: u32, value: u32) {
        if value == 0 {
            self.cells.remove(&address);
        } else {
            self.cells.insert(address, value);
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.cells.iter().map(|(a, v)| (*a, *v))
    }

    pub fn tree(&self, depth: usize) -> MemoryTree {
        MemoryTree::from_cells(self.cells(), depth)
    }

    pub fn root(&self, depth: usize) -> Node {
        self.tree(depth).root()
    }
}

/// Machine state after `step` executed instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub pc: u32,
    pub step: u32,
    pub memory: Memory,
}

/// What one instruction does, given the values it read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    /// New value of the `c` cell, if the instruction writes one.
    pub write: Option<u32>,
    pub pc_next: u32,
}

/// The semantics of `op` over already-read operand values.
///
/// `immediate` and `target` are the raw `b` and `c` fields of the
/// instruction. LOAD and STORE always move `value_a`; the addressing mode
/// only decides where `a` and `c` point.
pub fn evaluate(
    op: Opcode,
    value_a: u32,
    value_b: u32,
    immediate: u32,
    target: u32,
    pc: u32,
    config: &VmConfig,
) -> Effect {
    let next = pc.wrapping_add(1);
    let write = |value: u32| Effect {
        write: Some(value),
        pc_next: next,
    };

    match op {
        Opcode::Add => write(value_a.wrapping_add(value_b)),
        Opcode::Sub => write(value_a.wrapping_sub(value_b)),
        Opcode::Mul => write(value_a.wrapping_mul(value_b)),
        Opcode::And => write(value_a & value_b),
        Opcode::Or => write(value_a | value_b),
        Opcode::Xor => write(value_a ^ value_b),
        Opcode::AddI => write(value_a.wrapping_add(immediate)),
        Opcode::SubI => write(value_a.wrapping_sub(immediate)),
        Opcode::AndI => write(value_a & immediate),
        Opcode::OrI => write(value_a | immediate),
        Opcode::XorI => write(value_a ^ immediate),
        Opcode::Rshift1 => write(value_a >> 1),
        Opcode::Rshift8 => write(value_a >> 8),
        Opcode::Lshift8 => write(value_a << 8),
        Opcode::Sltu => write(u32::from(value_a < value_b)),
        Opcode::Slt => write(u32::from((value_a as i32) < (value_b as i32))),
        Opcode::Load | Opcode::Store => write(value_a),
        Opcode::Jmp => Effect {
            write: None,
            pc_next: value_a,
        },
        Opcode::Beq | Opcode::Bne => {
            let taken = (value_a == value_b) == (op == Opcode::Beq);
            Effect {
                write: None,
                pc_next: if taken { config.branch(pc, target) } else { next },
            }
        }
        Opcode::Syscall => Effect {
            write: None,
            pc_next: next,
        },
    }
}

/// The `a`, `b`, `c` addresses an instruction uses against `memory`.
///
/// Static fields are returned as written; under [`AddressingMode::Indirect`]
/// the pointer field of LOAD/STORE is replaced by the cell it points to.
pub fn resolve_addresses(instruction: &Instruction, memory: &Memory, config: &VmConfig) -> [u32; 3] {
    let mut addresses = instruction.fields();
    if config.addressing == AddressingMode::Literal {
        return addresses;
    }
    if let Some(op) = instruction.opcode() {
        let pointer = config.mask(memory.get(config.mask(instruction.address_b)));
        for (slot, usage) in op.operands().iter().enumerate() {
            if *usage == Operand::Ptr {
                addresses[slot] = pointer;
            }
        }
    }
    addresses
}

/// Everything the prover reveals about one step of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinaryCodec)]
pub struct StepRecord {
    /// Raw opcode; 0 for the halted pseudo-step.
    pub kind: u32,
    pub address_a: u32,
    pub address_b: u32,
    pub address_c: u32,
    pub value_a: u32,
    pub value_b: u32,
    /// `c` after the step.
    pub value_c: u32,
    /// `c` before the step.
    pub prev_value_c: u32,
    pub pc_curr: u32,
    pub pc_next: u32,
}

impl StepRecord {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.kind).ok()
    }

    pub fn address(&self, slot: usize) -> u32 {
        [self.address_a, self.address_b, self.address_c][slot]
    }

    pub fn is_halted(&self) -> bool {
        self.kind == 0
    }
}

pub struct Vm<'a> {
    program: &'a Program,
    config: VmConfig,
    pc: u32,
    step: u32,
    memory: Memory,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a Program, memory: Memory, config: VmConfig) -> Self {
        Self {
            program,
            config,
            pc: 0,
            step: 0,
            memory,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.program.get(self.pc).is_none()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            pc: self.pc,
            step: self.step,
            memory: self.memory.clone(),
        }
    }

    /// Executes one instruction. Returns false if the machine had already halted.
    pub fn step(&mut self) -> bool {
        let Some(instruction) = self.program.get(self.pc).copied() else {
            return false;
        };

        match instruction.opcode() {
            Some(op) => {
                let [a, b, c] = resolve_addresses(&instruction, &self.memory, &self.config);
                let value_a = self.memory.get(self.config.mask(a));
                let value_b = self.memory.get(self.config.mask(b));
                let effect = evaluate(
                    op,
                    value_a,
                    value_b,
                    instruction.address_b,
                    instruction.address_c,
                    self.pc,
                    &self.config,
                );
                if let Some(value) = effect.write {
                    self.memory.set(self.config.mask(c), value);
                }
                self.pc = effect.pc_next;
            }
            // Unknown opcodes fall through.
            None => self.pc = self.pc.wrapping_add(1),
        }

        self.step += 1;
        true
    }
}

/// Runs `program` from `pc = 0` over `initial` memory.
pub fn run(
    program: &Program,
    initial: &[u32],
    max_steps: usize,
    config: VmConfig,
) -> Result<Trace, VmError> {
    program.validate(config.address_bits)?;
    if config.address_bits < 32 && (initial.len() as u64) > (1u64 << config.address_bits) {
        return Err(VmError::MemoryTooLarge {
            len: initial.len(),
            bits: config.address_bits,
        });
    }

    let mut vm = Vm::new(program, Memory::from_words(initial), config);
    let mut snapshots = vec![vm.snapshot()];
    while snapshots.len() < max_steps && vm.step() {
        snapshots.push(vm.snapshot());
    }
    Ok(Trace::from_snapshots(snapshots, config))
}

#[derive(Debug, Clone)]
pub struct Trace {
    snapshots: Vec<Snapshot>,
    roots: Vec<Node>,
    config: VmConfig,
}

impl Trace {
    /// Wraps snapshots that did not necessarily come from [`run`].
    pub fn from_snapshots(snapshots: Vec<Snapshot>, config: VmConfig) -> Trace {
        let roots = snapshots
            .iter()
            .map(|s| s.memory.root(config.tree_depth()))
            .collect();
        Trace {
            snapshots,
            roots,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    fn clamp(&self, index: usize) -> usize {
        index.min(self.snapshots.len().saturating_sub(1))
    }

    /// Snapshot at `index`; the last one for indices past the end.
    pub fn get(&self, index: usize) -> &Snapshot {
        &self.snapshots[self.clamp(index)]
    }

    pub fn last(&self) -> &Snapshot {
        self.get(self.snapshots.len())
    }

    /// Memory root of the snapshot at `index`.
    pub fn root(&self, index: usize) -> Node {
        self.roots[self.clamp(index)]
    }

    pub fn tree(&self, index: usize) -> MemoryTree {
        self.get(index).memory.tree(self.config.tree_depth())
    }

    /// The step from snapshot `index` to `index + 1`.
    ///
    /// A snapshot whose `pc` is outside the program yields the halted
    /// pseudo-step: kind 0, zero addresses and an unchanged `pc`.
    pub fn step_record(&self, index: usize, program: &Program) -> StepRecord {
        let curr = self.get(index);
        let next = self.get(index + 1);
        let mask = |address: u32| self.config.mask(address);

        let Some(instruction) = program.get(curr.pc) else {
            return StepRecord {
                kind: 0,
                address_a: 0,
                address_b: 0,
                address_c: 0,
                value_a: curr.memory.get(0),
                value_b: curr.memory.get(0),
                value_c: next.memory.get(0),
                prev_value_c: curr.memory.get(0),
                pc_curr: curr.pc,
                pc_next: curr.pc,
            };
        };

        let [a, b, c] = resolve_addresses(instruction, &curr.memory, &self.config);
        StepRecord {
            kind: instruction.kind,
            address_a: a,
            address_b: b,
            address_c: c,
            value_a: curr.memory.get(mask(a)),
            value_b: curr.memory.get(mask(b)),
            value_c: next.memory.get(mask(c)),
            prev_value_c: curr.memory.get(mask(c)),
            pc_curr: curr.pc,
            pc_next: next.pc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::merkle_tree::build_tree;

    fn program(rows: &[(Opcode, u32, u32, u32)]) -> Program {
        Program::new(
            rows.iter()
                .map(|(op, a, b, c)| Instruction::new(*op, *a, *b, *c))
                .collect(),
        )
    }

    fn relative() -> VmConfig {
        VmConfig {
            branch_target: BranchTarget::Relative,
            ..VmConfig::default()
        }
    }

    #[test]
    fn counting_loop_with_relative_branch() {
        let program = program(&[
            (Opcode::Add, 0, 1, 0),
            (Opcode::Bne, 0, 2, (-1i32) as u32),
        ]);
        let trace = run(&program, &[0, 1, 10, 0, 0], 32, relative()).unwrap();

        assert_eq!(trace.last().memory.get(0), 10);
        assert_eq!(trace.last().pc, 2);
        assert_eq!(trace.len(), 21);
        assert_eq!(trace.last().step, 20);
    }

    #[test]
    fn counting_loop_with_absolute_branch() {
        let program = program(&[(Opcode::Add, 0, 1, 0), (Opcode::Bne, 0, 2, 0)]);
        let trace = run(&program, &[0, 1, 10], 32, VmConfig::default()).unwrap();
        assert_eq!(trace.last().memory.get(0), 10);

        // -1 as an absolute target leaves the program after one pass.
        let program = self::program(&[
            (Opcode::Add, 0, 1, 0),
            (Opcode::Bne, 0, 2, (-1i32) as u32),
        ]);
        let trace = run(&program, &[0, 1, 10], 32, VmConfig::default()).unwrap();
        assert_eq!(trace.last().memory.get(0), 1);
        assert_eq!(trace.last().pc, u32::MAX);
    }

    #[test]
    fn sub_wraps() {
        let program = program(&[(Opcode::Sub, 0, 1, 2)]);
        let trace = run(&program, &[42, 120], 8, VmConfig::default()).unwrap();
        assert_eq!(trace.last().memory.get(2), 42u32.wrapping_sub(120));
        assert_eq!(trace.last().memory.get(2), 4_294_967_218);
    }

    #[test]
    fn shifts_and_comparisons() {
        let program = program(&[
            (Opcode::Rshift8, 0, 0, 1),
            (Opcode::Lshift8, 0, 0, 2),
            (Opcode::Rshift1, 0, 0, 3),
            (Opcode::Slt, 0, 4, 5),
            (Opcode::Sltu, 0, 4, 6),
        ]);
        let trace = run(&program, &[0xFEED_4321, 0, 0, 0, 1], 16, VmConfig::default()).unwrap();
        let memory = &trace.last().memory;

        assert_eq!(memory.get(1), 0x00FE_ED43);
        assert_eq!(memory.get(2), 0xED43_2100);
        assert_eq!(memory.get(3), 0x7F76_A190);
        // 0xFEED4321 is negative as i32.
        assert_eq!(memory.get(5), 1);
        assert_eq!(memory.get(6), 0);
    }

    #[test]
    fn immediates_use_the_literal_b_field() {
        let program = program(&[
            (Opcode::AddI, 0, 5, 1),
            (Opcode::XorI, 0, 0xFF, 2),
            (Opcode::SubI, 0, 8, 3),
        ]);
        let trace = run(&program, &[7], 8, VmConfig::default()).unwrap();
        let memory = &trace.last().memory;
        assert_eq!(memory.get(1), 12);
        assert_eq!(memory.get(2), 7 ^ 0xFF);
        assert_eq!(memory.get(3), u32::MAX);
    }

    #[test]
    fn jmp_reads_its_target_from_memory() {
        let program = program(&[
            (Opcode::Jmp, 0, 0, 0),
            (Opcode::AddI, 1, 1, 1),
            (Opcode::AddI, 1, 100, 1),
        ]);
        let trace = run(&program, &[2], 8, VmConfig::default()).unwrap();
        assert_eq!(trace.last().memory.get(1), 100);
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn load_and_store_follow_the_addressing_mode() {
        let program = program(&[(Opcode::Load, 0, 1, 2), (Opcode::Store, 3, 4, 0)]);
        let memory = [50, 6, 0, 77, 7, 0, 123, 0];

        let trace = run(&program, &memory, 8, VmConfig::default()).unwrap();
        let last = &trace.last().memory;
        // LOAD: mem[2] = mem[mem[1]] = mem[6]
        assert_eq!(last.get(2), 123);
        // STORE: mem[mem[4]] = mem[3]
        assert_eq!(last.get(7), 77);

        let literal = VmConfig {
            addressing: AddressingMode::Literal,
            ..VmConfig::default()
        };
        let trace = run(&program, &memory, 8, literal).unwrap();
        let last = &trace.last().memory;
        assert_eq!(last.get(2), 50);
        assert_eq!(last.get(0), 77);
        assert_eq!(last.get(7), 0);
    }

    #[test]
    fn pointers_wrap_to_the_address_width() {
        let program = program(&[(Opcode::Store, 0, 1, 0)]);
        let config = VmConfig {
            address_bits: 4,
            ..VmConfig::default()
        };
        let trace = run(&program, &[9, 0x13], 4, config).unwrap();
        assert_eq!(trace.last().memory.get(3), 9);
        assert_eq!(trace.step_record(0, &program).address_c, 3);
    }

    #[test]
    fn max_steps_bounds_the_trace() {
        let program = program(&[(Opcode::Jmp, 0, 0, 0)]);
        let trace = run(&program, &[0], 5, VmConfig::default()).unwrap();
        assert_eq!(trace.len(), 5);
        assert_eq!(trace.last().step, 4);
        assert_eq!(trace.last().pc, 0);
    }

    #[test]
    fn unknown_opcodes_are_no_ops() {
        let program = Program::new(vec![Instruction {
            kind: 99,
            address_a: 0,
            address_b: 1,
            address_c: 2,
        }]);
        let trace = run(&program, &[1, 2, 3], 8, VmConfig::default()).unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.last().memory, trace.get(0).memory);
    }

    #[test]
    fn run_rejects_out_of_range_programs_and_memory() {
        let config = VmConfig {
            address_bits: 3,
            ..VmConfig::default()
        };
        let wide = program(&[(Opcode::Add, 0, 8, 1)]);
        assert!(matches!(
            run(&wide, &[], 4, config),
            Err(VmError::AddressOutOfRange { address: 8, .. })
        ));

        let ok = program(&[(Opcode::Add, 0, 1, 2)]);
        assert!(matches!(
            run(&ok, &[0; 9], 4, config),
            Err(VmError::MemoryTooLarge { len: 9, bits: 3 })
        ));
    }

    #[test]
    fn roots_match_the_dense_tree_and_repeat_past_the_end() {
        let program = program(&[(Opcode::Add, 0, 1, 2)]);
        let config = VmConfig {
            address_bits: 3,
            ..VmConfig::default()
        };
        let trace = run(&program, &[4, 5], 8, config).unwrap();

        assert_eq!(trace.root(0), build_tree(&[4, 5, 0, 0, 0, 0, 0, 0], 3));
        assert_eq!(trace.root(1), build_tree(&[4, 5, 9, 0, 0, 0, 0, 0], 3));
        assert_eq!(trace.root(7), trace.root(1));
    }

    #[test]
    fn step_records_read_before_and_after() {
        let program = program(&[(Opcode::Add, 0, 1, 2), (Opcode::Sub, 2, 0, 2)]);
        let trace = run(&program, &[4, 5, 1], 8, VmConfig::default()).unwrap();

        let first = trace.step_record(0, &program);
        assert_eq!(first.kind, Opcode::Add.code());
        assert_eq!((first.value_a, first.value_b), (4, 5));
        assert_eq!((first.prev_value_c, first.value_c), (1, 9));
        assert_eq!((first.pc_curr, first.pc_next), (0, 1));

        let second = trace.step_record(1, &program);
        assert_eq!((second.value_a, second.value_b, second.value_c), (9, 4, 5));

        let halted = trace.step_record(2, &program);
        assert!(halted.is_halted());
        assert_eq!((halted.pc_curr, halted.pc_next), (2, 2));
        assert_eq!(halted.value_c, halted.prev_value_c);
        assert_eq!(trace.step_record(30, &program), halted);
    }

    #[test]
    fn step_records_expose_dynamic_pointers() {
        let program = program(&[(Opcode::Load, 0, 1, 2)]);
        let trace = run(&program, &[0, 3, 0, 11], 4, VmConfig::default()).unwrap();
        let record = trace.step_record(0, &program);
        assert_eq!(record.address_a, 3);
        assert_eq!(record.value_b, 3);
        assert_eq!(record.value_a, 11);
        assert_eq!(record.value_c, 11);
    }
}
