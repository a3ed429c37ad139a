//! Leaves: the individual spending conditions of a node.
//!
//! [`Leaf`] is a closed sum type. [`Leaf::lock`] compiles a leaf into the
//! [`Script`] its parent output commits to; [`Leaf::unlock`] builds the
//! witness the local party would use to take it, or says why it cannot.

use crate::protocol::commitment::{Channel, CommitmentError, Field, HashlockTable, Role, Symbol};
use crate::protocol::disprove::Disprove;
use crate::protocol::graph::{GraphError, NodeKind};
use crate::protocol::model::Model;
use crate::protocol::params::Params;
use crate::protocol::script::{BinOp, Condition, Expr, Reveal, Script, Slot, WitnessItem};
use crate::protocol::setup::Setup;
use crate::types::hash::Hash;
use crate::types::merkle_tree::Node;
use crate::virtual_machine::isa::Opcode;
use bitdispute_derive::Error;

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("{0} is a placeholder and cannot be taken")]
    NotSpecified(NodeKind),
    #[error("the strategy does not take this leaf")]
    Declined,
    #[error("value of {0} is not known yet")]
    Unknown(Symbol),
    #[error("no equivocation seen for {0}")]
    NoEquivocation(Symbol),
    #[error("{0}")]
    Commitment(CommitmentError),
}

impl From<CommitmentError> for UnlockError {
    fn from(err: CommitmentError) -> Self {
        UnlockError::Commitment(err)
    }
}

/// Where the root step of a memory game finds the root of the state before
/// the disputed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RootSource {
    /// The step is the first one: the initial memory root.
    Initial,
    /// The root the prover committed in this trace round.
    Round(u8),
}

/// The hash step a `MerkleHash` leaf checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HashStep {
    /// From path node `m + 1` to node `m`, for `m >= 1`.
    Inner(u8),
    /// From node 1 to the root, channels A and B.
    Root(RootSource),
    /// From node 1 to both roots, channel C; `next` is the trace round that
    /// committed the root after the step.
    WriteRoot { prev: RootSource, next: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaf {
    KickOff,
    /// Taken by the actor once the opponent let the output sit for the timeout.
    Timeout,
    TraceResponse { round: u8 },
    TraceChallenge { round: u8 },
    CommitInstruction,
    ChallengeValue(Channel),
    MerkleResponse { channel: Channel, round: u8 },
    MerkleChallenge { channel: Channel, round: u8 },
    MerkleHash { channel: Channel, step: HashStep },
    /// The prover opened `symbol` with two different values.
    MerkleEquivocation(Symbol),
    Disprove(Disprove),
    Unspecified(NodeKind),
}

/// Everything a lock needs: the agreement and both hashlock tables.
pub struct LockContext<'a> {
    pub setup: &'a Setup,
    pub prover: &'a HashlockTable,
    pub verifier: &'a HashlockTable,
    initial_root: Node,
}

impl<'a> LockContext<'a> {
    pub fn new(setup: &'a Setup, prover: &'a HashlockTable, verifier: &'a HashlockTable) -> Self {
        Self {
            setup,
            prover,
            verifier,
            initial_root: setup.initial_root(),
        }
    }

    fn hashlocks(&self, symbol: Symbol) -> Result<Vec<Vec<Hash>>, CommitmentError> {
        match symbol.committer() {
            Role::Prover => self.prover.hashlocks(symbol),
            Role::Verifier => self.verifier.hashlocks(symbol),
        }
    }
}

fn sym(field: Field, index: usize) -> Expr {
    Expr::sym(Symbol::new(field, index as u8))
}

fn single(field: Field) -> Expr {
    Expr::sym(Symbol::single(field))
}

fn slots(field: Field, count: usize) -> Vec<Slot> {
    (0..count)
        .map(|i| Slot::new(Symbol::new(field, i as u8)))
        .collect()
}

/// Round of a `width`-round bisection in which index `k` (0 < k < 2^width) is probed.
fn round_of(k: usize, width: usize) -> usize {
    debug_assert!(k > 0 && k < 1 << width);
    width - 1 - k.trailing_zeros() as usize
}

/// The committed path node at depth `k` (0 < k < PATH_LEN).
fn path_node(field: Field, k: usize, params: &Params) -> Expr {
    sym(field, round_of(k, params.path_rounds()))
}

fn hash_equation(bit: &Expr, child: Expr, sibling: Expr, parent: Expr) -> Condition {
    Condition::Eq(
        Expr::hash(
            Expr::select(bit.clone(), child.clone(), sibling.clone()),
            Expr::select(bit.clone(), sibling, child),
        ),
        parent,
    )
}

impl Leaf {
    pub fn lock(&self, ctx: &LockContext, actor: Role) -> Result<Script, GraphError> {
        let params = &ctx.setup.params;
        let mut timelock = None;
        let mut reveals = Vec::new();
        let condition = match *self {
            Leaf::KickOff => Condition::True,
            Leaf::Timeout => {
                timelock = Some(params.timeout);
                Condition::True
            }
            Leaf::TraceResponse { round } => {
                reveals.push(Slot::new(Symbol::new(Field::TraceResponse, round)));
                Condition::True
            }
            Leaf::TraceChallenge { round } => {
                reveals.push(Slot::new(Symbol::new(Field::TraceChallenge, round)));
                Condition::True
            }
            Leaf::CommitInstruction => {
                reveals.extend(Field::INSTRUCTION.iter().map(|f| Slot::new(Symbol::single(*f))));
                Condition::True
            }
            Leaf::ChallengeValue(Channel::C) => Condition::Ne(
                Expr::IndexFromBits(slots(Field::TraceChallenge, params.trace_rounds())),
                Expr::Word(params.trace_len() - 1),
            ),
            Leaf::ChallengeValue(_) => Condition::True,
            Leaf::MerkleResponse { channel, round } => {
                reveals.push(Slot::new(Symbol::new(Field::MerkleResponse(channel), round)));
                if channel == Channel::C {
                    reveals.push(Slot::new(Symbol::new(Field::MerkleResponsePrev, round)));
                }
                reveals.push(Slot::new(Symbol::new(Field::MerkleResponseSibling(channel), round)));
                Condition::True
            }
            Leaf::MerkleChallenge { channel, round } => {
                reveals.push(Slot::new(Symbol::new(Field::MerkleChallenge(channel), round)));
                Condition::True
            }
            Leaf::MerkleHash { channel, step } => hash_condition(channel, step, ctx),
            Leaf::MerkleEquivocation(symbol) => Condition::Ne(
                Expr::Sym(Slot::new(symbol)),
                Expr::Sym(Slot::second(symbol)),
            ),
            Leaf::Disprove(disprove) => disprove.condition(params),
            Leaf::Unspecified(kind) => Condition::Unspecified(format!("{kind:?}")),
        };

        for slot in condition.slots() {
            if !reveals.contains(&slot) {
                reveals.push(slot);
            }
        }
        let reveals = reveals
            .into_iter()
            .map(|slot| {
                Ok(Reveal {
                    slot,
                    hashlocks: ctx.hashlocks(slot.symbol)?,
                })
            })
            .collect::<Result<Vec<_>, CommitmentError>>()?;

        Ok(Script {
            signer: Some(ctx.setup.key(actor)),
            timelock,
            reveals,
            condition,
        })
    }

    /// Builds the witness for `script` (this leaf's lock) from the local
    /// party's knowledge, signature first.
    pub fn unlock(
        &self,
        script: &Script,
        model: &Model,
        sighash: &Hash,
    ) -> Result<Vec<WitnessItem>, UnlockError> {
        match self {
            Leaf::Unspecified(kind) => return Err(UnlockError::NotSpecified(*kind)),
            Leaf::ChallengeValue(channel) if model.challenge() != Some(*channel) => {
                return Err(UnlockError::Declined);
            }
            _ => {}
        }

        let mut items = Vec::with_capacity(script.witness_len());
        if script.signer.is_some() {
            items.push(WitnessItem::Signature(model.sign(sighash)));
        }
        for reveal in &script.reveals {
            items.extend(model.open(reveal.slot)?.into_iter().map(WitnessItem::Preimage));
        }
        Ok(items)
    }
}

/// The condition of one `MerkleHash` leaf.
///
/// Node `k` of the pinned path (0 = root, `PATH_LEN` = leaf) was committed
/// in the memory round that probed `k`; the leaf value and its sibling are
/// revealed here for the first time or taken from the instruction commit.
fn hash_condition(channel: Channel, step: HashStep, ctx: &LockContext) -> Condition {
    let params = &ctx.setup.params;
    let path_len = params.path_len();
    let width = params.path_rounds();
    let node = Field::MerkleResponse(channel);
    let sibling = Field::MerkleResponseSibling(channel);
    let merkle_index = Expr::IndexFromBits(slots(Field::MerkleChallenge(channel), width));
    let address = single(channel.address_field());

    let m = match step {
        HashStep::Inner(m) => usize::from(m),
        _ => 0,
    };
    let bit = Expr::bit(address, (path_len - 1 - m) as u8);
    let mut parts = vec![Condition::Eq(merkle_index, Expr::Word(m as u32))];

    let leaf_level = m + 1 == path_len;
    let (child, prev_child, sibling) = if leaf_level {
        (
            Expr::leaf(single(channel.value_field())),
            Expr::leaf(single(Field::PrevValueC)),
            sym(sibling, width),
        )
    } else {
        (
            path_node(node, m + 1, params),
            path_node(Field::MerkleResponsePrev, m + 1, params),
            path_node(sibling, m + 1, params),
        )
    };

    match step {
        HashStep::Inner(_) => {
            parts.push(hash_equation(
                &bit,
                child,
                sibling.clone(),
                path_node(node, m, params),
            ));
            if channel == Channel::C {
                parts.push(hash_equation(
                    &bit,
                    prev_child,
                    sibling,
                    path_node(Field::MerkleResponsePrev, m, params),
                ));
                if leaf_level {
                    parts.push(unchanged_unless_written());
                }
            }
        }
        HashStep::Root(source) => {
            let root = trace_root(source, ctx, &mut parts);
            parts.push(hash_equation(&bit, child, sibling, root));
        }
        HashStep::WriteRoot { prev, next } => {
            let prev_root = trace_root(prev, ctx, &mut parts);
            parts.push(hash_equation(&bit, prev_child, sibling.clone(), prev_root));

            let rounds = params.trace_rounds();
            let bits = slots(Field::TraceChallenge, rounds);
            parts.push(Condition::Eq(
                Expr::NextIndex(bits[..usize::from(next)].to_vec(), rounds as u8),
                Expr::binary(
                    BinOp::Add,
                    Expr::IndexFromBits(bits),
                    Expr::Word(1),
                ),
            ));
            parts.push(hash_equation(
                &bit,
                child,
                sibling,
                sym(Field::TraceResponse, usize::from(next)),
            ));
        }
    }
    Condition::All(parts)
}

/// The trace root before the pinned step, adding the condition that
/// `source` really is where it was committed.
fn trace_root(source: RootSource, ctx: &LockContext, parts: &mut Vec<Condition>) -> Expr {
    let rounds = ctx.setup.params.trace_rounds();
    let bits = slots(Field::TraceChallenge, rounds);
    match source {
        RootSource::Initial => {
            parts.push(Condition::Eq(Expr::IndexFromBits(bits), Expr::Word(0)));
            Expr::Node(ctx.initial_root)
        }
        RootSource::Round(r) => {
            parts.push(Condition::Eq(
                Expr::NextIndex(bits[..usize::from(r)].to_vec(), rounds as u8),
                Expr::IndexFromBits(bits),
            ));
            sym(Field::TraceResponse, usize::from(r))
        }
    }
}

/// Steps that write nothing leave the `c` cell as it was.
fn unchanged_unless_written() -> Condition {
    let mut any: Vec<Condition> = Opcode::ALL
        .iter()
        .filter(|op| op.writes_memory())
        .map(|op| Condition::Eq(single(Field::InstructionType), Expr::Word(op.code())))
        .collect();
    any.push(Condition::Eq(single(Field::PrevValueC), single(Field::ValueC)));
    Condition::Any(any)
}
