//! The spending-predicate language.
//!
//! A [`Script`] locks one leaf of an output. Its witness is, in order, a
//! signature (if the script names a signer) and then one preimage per limb
//! of every [`Reveal`]. Each preimage must open one of the limb's
//! hashlocks; the opened candidates spell out the revealed value, which the
//! [`Condition`] can then compute with.
//!
//! Evaluation is pure: [`Interpreter::evaluate`] never panics and reports
//! failure through [`Evaluation`].

use crate::crypto::key_pair::{PublicKey, Signature};
use crate::protocol::bisection;
use crate::protocol::commitment::{Symbol, Value};
use crate::types::hash::Hash;
use crate::types::merkle_tree::Node;
use bitdispute_derive::{BinaryCodec, Error};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("missing signature")]
    MissingSignature,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("sequence {sequence} is below the timelock {required}")]
    Timelock { required: u32, sequence: u32 },
    #[error("witness has {got} items, expected {expected}")]
    WitnessLength { expected: usize, got: usize },
    #[error("item {0} is not a preimage")]
    NotAPreimage(usize),
    #[error("preimage for {slot} limb {limb} opens no hashlock")]
    UnknownPreimage { slot: Slot, limb: usize },
    #[error("malformed reveal of {0}")]
    MalformedReveal(Slot),
    #[error("{0} is not revealed by the script")]
    Unbound(Slot),
    #[error("type mismatch in {0}")]
    TypeMismatch(&'static str),
    #[error("condition does not hold")]
    ConditionFailed,
}

/// One revealed copy of a symbol. Copy 1 exists only in equivocation
/// scripts, where the same symbol is opened twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub struct Slot {
    pub symbol: Symbol,
    pub copy: u8,
}

impl Slot {
    pub const fn new(symbol: Symbol) -> Slot {
        Slot { symbol, copy: 0 }
    }

    pub const fn second(symbol: Symbol) -> Slot {
        Slot { symbol, copy: 1 }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.copy == 0 {
            write!(f, "{}", self.symbol)
        } else {
            write!(f, "{}#{}", self.symbol, self.copy)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Reveal {
    pub slot: Slot,
    /// `hashlocks[limb][candidate]`
    pub hashlocks: Vec<Vec<Hash>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    /// Unsigned `<`, as 0 or 1.
    Ltu,
    /// Signed `<`, as 0 or 1.
    Lt,
    Shr,
    Shl,
}

impl BinOp {
    fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Ltu => u32::from(a < b),
            BinOp::Lt => u32::from((a as i32) < (b as i32)),
            BinOp::Shr => a.checked_shr(b).unwrap_or(0),
            BinOp::Shl => a.checked_shl(b).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum Expr {
    Word(u32),
    Node(Node),
    Sym(Slot),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Bit `n` of a word.
    Bit(Box<Expr>, u8),
    /// Answer bits read MSB first as an index.
    IndexFromBits(Vec<Slot>),
    /// Index probed after the given answer bits in a bisection of `width` rounds.
    NextIndex(Vec<Slot>, u8),
    /// Memory tree leaf of a word.
    Leaf(Box<Expr>),
    /// Parent of two nodes.
    Hash(Box<Expr>, Box<Expr>),
    /// `if bit == 0 { first } else { second }`
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn sym(symbol: Symbol) -> Expr {
        Expr::Sym(Slot::new(symbol))
    }

    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Expr {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn bit(word: Expr, n: u8) -> Expr {
        Expr::Bit(Box::new(word), n)
    }

    pub fn leaf(word: Expr) -> Expr {
        Expr::Leaf(Box::new(word))
    }

    pub fn hash(left: Expr, right: Expr) -> Expr {
        Expr::Hash(Box::new(left), Box::new(right))
    }

    pub fn select(bit: Expr, first: Expr, second: Expr) -> Expr {
        Expr::Select(Box::new(bit), Box::new(first), Box::new(second))
    }

    /// Appends every slot the expression reads, in first-use order.
    pub fn collect_slots(&self, out: &mut Vec<Slot>) {
        match self {
            Expr::Word(_) | Expr::Node(_) => {}
            Expr::Sym(slot) => push_slot(out, *slot),
            Expr::IndexFromBits(slots) | Expr::NextIndex(slots, _) => {
                for slot in slots {
                    push_slot(out, *slot);
                }
            }
            Expr::Bit(x, _) | Expr::Leaf(x) => x.collect_slots(out),
            Expr::Binary(_, a, b) | Expr::Hash(a, b) => {
                a.collect_slots(out);
                b.collect_slots(out);
            }
            Expr::Select(bit, first, second) => {
                bit.collect_slots(out);
                first.collect_slots(out);
                second.collect_slots(out);
            }
        }
    }

    pub fn eval(&self, symbols: &Symbols) -> Result<Value, ScriptError> {
        match self {
            Expr::Word(word) => Ok(Value::Word(*word)),
            Expr::Node(node) => Ok(Value::Node(*node)),
            Expr::Sym(slot) => symbols.get(slot).copied().ok_or(ScriptError::Unbound(*slot)),
            Expr::Binary(op, a, b) => {
                let a = word(a.eval(symbols)?, "binary operand")?;
                let b = word(b.eval(symbols)?, "binary operand")?;
                Ok(Value::Word(op.apply(a, b)))
            }
            Expr::Bit(x, n) => {
                let x = word(x.eval(symbols)?, "bit")?;
                Ok(Value::Word(x.checked_shr(u32::from(*n)).unwrap_or(0) & 1))
            }
            Expr::IndexFromBits(slots) => {
                let bits = bits(slots, symbols)?;
                Ok(Value::Word(bisection::final_index(&bits, bits.len())))
            }
            Expr::NextIndex(slots, width) => {
                let bits = bits(slots, symbols)?;
                let width = usize::from(*width);
                if bits.len() >= width {
                    return Err(ScriptError::TypeMismatch("next index"));
                }
                Ok(Value::Word(bisection::next_index(&bits, width)))
            }
            Expr::Leaf(x) => Ok(Value::Node(Node::leaf(word(x.eval(symbols)?, "leaf")?))),
            Expr::Hash(left, right) => {
                let left = node(left.eval(symbols)?, "hash")?;
                let right = node(right.eval(symbols)?, "hash")?;
                Ok(Value::Node(Node::hash_pair(&left, &right)))
            }
            Expr::Select(bit, first, second) => {
                match word(bit.eval(symbols)?, "select")? {
                    0 => first.eval(symbols),
                    1 => second.eval(symbols),
                    _ => Err(ScriptError::TypeMismatch("select")),
                }
            }
        }
    }
}

fn push_slot(out: &mut Vec<Slot>, slot: Slot) {
    if !out.contains(&slot) {
        out.push(slot);
    }
}

fn word(value: Value, context: &'static str) -> Result<u32, ScriptError> {
    value.as_word().ok_or(ScriptError::TypeMismatch(context))
}

fn node(value: Value, context: &'static str) -> Result<Node, ScriptError> {
    value.as_node().ok_or(ScriptError::TypeMismatch(context))
}

fn bits(slots: &[Slot], symbols: &Symbols) -> Result<Vec<bool>, ScriptError> {
    slots
        .iter()
        .map(|slot| match symbols.get(slot) {
            Some(Value::Word(0)) => Ok(false),
            Some(Value::Word(1)) => Ok(true),
            Some(_) => Err(ScriptError::TypeMismatch("answer bit")),
            None => Err(ScriptError::Unbound(*slot)),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum Condition {
    True,
    /// Never holds. The label names the step it stands in for, so distinct
    /// placeholders lock distinct scripts.
    Unspecified(String),
    Eq(Expr, Expr),
    Ne(Expr, Expr),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    /// Every slot the condition reads, in first-use order.
    pub fn slots(&self) -> Vec<Slot> {
        let mut out = Vec::new();
        self.collect_slots(&mut out);
        out
    }

    fn collect_slots(&self, out: &mut Vec<Slot>) {
        match self {
            Condition::True | Condition::Unspecified(_) => {}
            Condition::Eq(a, b) | Condition::Ne(a, b) => {
                a.collect_slots(out);
                b.collect_slots(out);
            }
            Condition::All(parts) | Condition::Any(parts) => {
                for part in parts {
                    part.collect_slots(out);
                }
            }
        }
    }

    pub fn holds(&self, symbols: &Symbols) -> Result<bool, ScriptError> {
        match self {
            Condition::True => Ok(true),
            Condition::Unspecified(_) => Ok(false),
            Condition::Eq(a, b) | Condition::Ne(a, b) => {
                let a = a.eval(symbols)?;
                let b = b.eval(symbols)?;
                if std::mem::discriminant(&a) != std::mem::discriminant(&b) {
                    return Err(ScriptError::TypeMismatch("comparison"));
                }
                Ok((a == b) == matches!(self, Condition::Eq(..)))
            }
            Condition::All(parts) => {
                for part in parts {
                    if !part.holds(symbols)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any(parts) => {
                for part in parts {
                    // A branch over values the witness does not bind is just false.
                    if part.holds(symbols).unwrap_or(false) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Script {
    pub signer: Option<PublicKey>,
    /// Relative timelock in blocks.
    pub timelock: Option<u32>,
    pub reveals: Vec<Reveal>,
    pub condition: Condition,
}

impl Script {
    /// Leaf digest the output commitment is built over.
    pub fn leaf_hash(&self) -> Hash {
        Hash::tagged(b"TAPLEAF", self)
    }

    /// Items a satisfying witness carries.
    pub fn witness_len(&self) -> usize {
        usize::from(self.signer.is_some())
            + self.reveals.iter().map(|r| r.hashlocks.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum WitnessItem {
    Signature(Signature),
    Preimage(Hash),
}

/// What a script is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    /// Message the signature must cover: the spending txid.
    pub sighash: Hash,
    /// Relative lock of the spending input.
    pub sequence: u32,
}

pub type Symbols = BTreeMap<Slot, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub success: bool,
    pub failure: Option<ScriptError>,
    /// Values opened by the witness, even when the condition failed.
    pub symbols: Symbols,
}

pub trait ScriptEngine: Send + Sync {
    fn evaluate(&self, script: &Script, witness: &[WitnessItem], ctx: &EvalContext) -> Evaluation;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    fn open(
        &self,
        script: &Script,
        witness: &[WitnessItem],
        ctx: &EvalContext,
        symbols: &mut Symbols,
    ) -> Result<(), ScriptError> {
        if witness.len() != script.witness_len() {
            return Err(ScriptError::WitnessLength {
                expected: script.witness_len(),
                got: witness.len(),
            });
        }

        let mut items = witness.iter().enumerate();
        if let Some(signer) = &script.signer {
            match items.next() {
                Some((_, WitnessItem::Signature(signature))) => {
                    if !signer.verify(ctx.sighash.as_slice(), signature) {
                        return Err(ScriptError::InvalidSignature);
                    }
                }
                _ => return Err(ScriptError::MissingSignature),
            }
        }
        if let Some(required) = script.timelock {
            if ctx.sequence < required {
                return Err(ScriptError::Timelock {
                    required,
                    sequence: ctx.sequence,
                });
            }
        }

        for reveal in &script.reveals {
            let width = reveal.slot.symbol.width();
            if reveal.hashlocks.len() != width.limbs() {
                return Err(ScriptError::MalformedReveal(reveal.slot));
            }
            let mut limbs = Vec::with_capacity(width.limbs());
            for (limb, candidates) in reveal.hashlocks.iter().enumerate() {
                let preimage = match items.next() {
                    Some((_, WitnessItem::Preimage(preimage))) => preimage,
                    Some((i, _)) => return Err(ScriptError::NotAPreimage(i)),
                    None => {
                        return Err(ScriptError::WitnessLength {
                            expected: script.witness_len(),
                            got: witness.len(),
                        });
                    }
                };
                let lock = Hash::digest(preimage.as_slice());
                let value = candidates
                    .iter()
                    .position(|candidate| *candidate == lock)
                    .ok_or(ScriptError::UnknownPreimage {
                        slot: reveal.slot,
                        limb,
                    })?;
                limbs.push(value as u8);
            }
            let value = width
                .join(&limbs)
                .ok_or(ScriptError::MalformedReveal(reveal.slot))?;
            symbols.insert(reveal.slot, value);
        }
        Ok(())
    }
}

impl ScriptEngine for Interpreter {
    fn evaluate(&self, script: &Script, witness: &[WitnessItem], ctx: &EvalContext) -> Evaluation {
        let mut symbols = Symbols::new();
        let outcome = self
            .open(script, witness, ctx, &mut symbols)
            .and_then(|()| match script.condition.holds(&symbols)? {
                true => Ok(()),
                false => Err(ScriptError::ConditionFailed),
            });
        Evaluation {
            success: outcome.is_ok(),
            failure: outcome.err(),
            symbols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::PrivateKey;
    use crate::protocol::commitment::{Field, Player, Role};
    use crate::protocol::params::Params;

    fn params() -> Params {
        Params {
            log_trace_len: 2,
            log_path_len: 2,
            ..Params::default()
        }
    }

    struct Fixture {
        key: PrivateKey,
        paul: Player,
        vicky: Player,
    }

    impl Fixture {
        fn new() -> Self {
            let key = PrivateKey::new();
            Self {
                paul: Player::new(Role::Prover, &key, params()),
                vicky: Player::new(Role::Verifier, &PrivateKey::new(), params()),
                key,
            }
        }

        fn reveal(&self, symbol: Symbol) -> Reveal {
            let table = match symbol.committer() {
                Role::Prover => self.paul.export(),
                Role::Verifier => self.vicky.export(),
            };
            Reveal {
                slot: Slot::new(symbol),
                hashlocks: table.hashlocks(symbol).unwrap(),
            }
        }

        fn open(&self, symbol: Symbol, value: Value) -> Vec<WitnessItem> {
            let player = match symbol.committer() {
                Role::Prover => &self.paul,
                Role::Verifier => &self.vicky,
            };
            player
                .reveal(symbol, &value)
                .unwrap()
                .into_iter()
                .map(WitnessItem::Preimage)
                .collect()
        }
    }

    fn ctx() -> EvalContext {
        EvalContext {
            sighash: Hash::digest(b"spend"),
            sequence: 0,
        }
    }

    #[test]
    fn checksig_and_timelock() {
        let f = Fixture::new();
        let script = Script {
            signer: Some(f.key.public_key()),
            timelock: Some(1),
            reveals: vec![],
            condition: Condition::True,
        };
        let signature = WitnessItem::Signature(f.key.sign(ctx().sighash.as_slice()));

        let early = Interpreter.evaluate(&script, &[signature.clone()], &ctx());
        assert_eq!(
            early.failure,
            Some(ScriptError::Timelock {
                required: 1,
                sequence: 0
            })
        );

        let late = EvalContext {
            sequence: 1,
            ..ctx()
        };
        assert!(Interpreter.evaluate(&script, &[signature], &late).success);

        let forged = WitnessItem::Signature(PrivateKey::new().sign(ctx().sighash.as_slice()));
        let result = Interpreter.evaluate(&script, &[forged], &late);
        assert_eq!(result.failure, Some(ScriptError::InvalidSignature));
        assert!(!Interpreter.evaluate(&script, &[], &late).success);
    }

    #[test]
    fn reveals_bind_values() {
        let f = Fixture::new();
        let a = Symbol::single(Field::ValueA);
        let b = Symbol::single(Field::ValueB);
        let c = Symbol::single(Field::ValueC);
        let script = Script {
            signer: None,
            timelock: None,
            reveals: vec![f.reveal(a), f.reveal(b), f.reveal(c)],
            condition: Condition::Ne(
                Expr::sym(c),
                Expr::binary(BinOp::Add, Expr::sym(a), Expr::sym(b)),
            ),
        };

        let mut witness = f.open(a, Value::Word(5));
        witness.extend(f.open(b, Value::Word(7)));
        witness.extend(f.open(c, Value::Word(12)));
        let honest = Interpreter.evaluate(&script, &witness, &ctx());
        assert!(!honest.success);
        assert_eq!(honest.failure, Some(ScriptError::ConditionFailed));
        assert_eq!(honest.symbols.get(&Slot::new(c)), Some(&Value::Word(12)));

        let mut witness = f.open(a, Value::Word(5));
        witness.extend(f.open(b, Value::Word(7)));
        witness.extend(f.open(c, Value::Word(13)));
        assert!(Interpreter.evaluate(&script, &witness, &ctx()).success);
    }

    #[test]
    fn wrong_preimage_is_rejected() {
        let f = Fixture::new();
        let a = Symbol::single(Field::ValueA);
        let script = Script {
            signer: None,
            timelock: None,
            reveals: vec![f.reveal(a)],
            condition: Condition::True,
        };
        let mut witness = f.open(a, Value::Word(5));
        witness[3] = WitnessItem::Preimage(Hash::digest(b"guess"));
        let result = Interpreter.evaluate(&script, &witness, &ctx());
        assert_eq!(
            result.failure,
            Some(ScriptError::UnknownPreimage {
                slot: Slot::new(a),
                limb: 3
            })
        );
    }

    #[test]
    fn bisection_expressions() {
        let f = Fixture::new();
        let bits: Vec<Symbol> = (0..2).map(|i| Symbol::new(Field::TraceChallenge, i)).collect();
        let slots: Vec<Slot> = bits.iter().map(|s| Slot::new(*s)).collect();
        let script = Script {
            signer: None,
            timelock: None,
            reveals: bits.iter().map(|s| f.reveal(*s)).collect(),
            condition: Condition::All(vec![
                Condition::Eq(Expr::IndexFromBits(slots.clone()), Expr::Word(2)),
                Condition::Eq(Expr::NextIndex(slots[..1].to_vec(), 2), Expr::Word(3)),
                Condition::Eq(Expr::NextIndex(vec![], 2), Expr::Word(2)),
            ]),
        };
        let mut witness = f.open(bits[0], Value::Word(1));
        witness.extend(f.open(bits[1], Value::Word(0)));
        let result = Interpreter.evaluate(&script, &witness, &ctx());
        assert!(result.success, "{:?}", result.failure);
    }

    #[test]
    fn hash_and_select() {
        let left = Node::leaf(3);
        let right = Node::leaf(9);
        let parent = Node::hash_pair(&left, &right);
        let symbols = Symbols::new();
        for bit in [0u32, 1] {
            let (child, sibling) = if bit == 0 { (left, right) } else { (right, left) };
            let expr = Expr::hash(
                Expr::select(Expr::Word(bit), Expr::Node(child), Expr::Node(sibling)),
                Expr::select(Expr::Word(bit), Expr::Node(sibling), Expr::Node(child)),
            );
            assert_eq!(expr.eval(&symbols), Ok(Value::Node(parent)));
        }
        assert_eq!(
            Expr::leaf(Expr::Word(3)).eval(&symbols),
            Ok(Value::Node(left))
        );
        assert_eq!(
            Expr::bit(Expr::Word(0b100), 2).eval(&symbols),
            Ok(Value::Word(1))
        );
        assert!(Condition::Eq(Expr::Word(1), Expr::Node(left)).holds(&symbols).is_err());
    }
}
