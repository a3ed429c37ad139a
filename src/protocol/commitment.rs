//! Hash-based bit commitments.
//!
//! Every value a party may reveal during the game is a [`Symbol`]. Before
//! the game each party publishes, for every symbol, one hashlock per limb
//! per candidate limb value. Revealing a value means publishing the
//! preimages of the hashlocks that spell it out, limb by limb. Revealing
//! two different preimages for the same limb is an equivocation, which the
//! opponent can prove on-chain.
//!
//! Preimages are derived from the party's [`PrivateKey::commitment_secret`]
//! and the [`CommitmentId`], so they never need to be stored.

use crate::crypto::key_pair::PrivateKey;
use crate::protocol::params::Params;
use crate::types::encoding::{Decode, DecodeError, Encode};
use crate::types::hash::Hash;
use crate::types::merkle_tree::{NODE_LEN, Node};
use bitdispute_derive::{BinaryCodec, Error};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use zeroize::Zeroizing;

/// Bits carried by one limb.
pub const LIMB_BITS: usize = 2;

const TABLE_MAGIC: &[u8; 4] = b"BDHL";
const TABLE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CommitmentError {
    #[error("value {value} does not fit symbol {symbol}")]
    ValueOutOfRange { symbol: Symbol, value: Value },
    #[error("symbol {symbol} is outside the {count} committed indices")]
    IndexOutOfRange { symbol: Symbol, count: usize },
    #[error("{symbol} is committed by the {expected}")]
    WrongCommitter { symbol: Symbol, expected: Role },
    #[error("no hashlock for {0}")]
    MissingHashlock(CommitmentId),
    #[error("hashlock table belongs to the {got}, expected the {expected}")]
    WrongTable { got: Role, expected: Role },
    #[error("hashlock table i/o failed: {0}")]
    Io(io::Error),
    #[error("malformed hashlock table: {0}")]
    Decode(DecodeError),
}

impl From<io::Error> for CommitmentError {
    fn from(err: io::Error) -> Self {
        CommitmentError::Io(err)
    }
}

impl From<DecodeError> for CommitmentError {
    fn from(err: DecodeError) -> Self {
        CommitmentError::Decode(err)
    }
}

/// The two parties of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub enum Role {
    /// Paul: claims the trace and defends it.
    Prover = 0,
    /// Vicky: disputes the trace.
    Verifier = 1,
}

impl Role {
    pub fn opponent(self) -> Role {
        match self {
            Role::Prover => Role::Verifier,
            Role::Verifier => Role::Prover,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Prover => "prover",
            Role::Verifier => "verifier",
        })
    }
}

/// Memory access channel of an instruction: the two reads and the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub enum Channel {
    A = 0,
    B = 1,
    C = 2,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::A, Channel::B, Channel::C];

    /// Operand slot of the instruction this channel reads or writes.
    pub fn slot(self) -> usize {
        self as usize
    }

    pub fn address_field(self) -> Field {
        match self {
            Channel::A => Field::AddressA,
            Channel::B => Field::AddressB,
            Channel::C => Field::AddressC,
        }
    }

    pub fn value_field(self) -> Field {
        match self {
            Channel::A => Field::ValueA,
            Channel::B => Field::ValueB,
            Channel::C => Field::ValueC,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::A => "A",
            Channel::B => "B",
            Channel::C => "C",
        })
    }
}

/// Size class of a committed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// A single 0/1 answer.
    Bit,
    /// A `u32`.
    Word,
    /// A 160-bit memory tree node.
    Node,
}

impl Width {
    pub fn limbs(self) -> usize {
        match self {
            Width::Bit => 1,
            Width::Word => 32 / LIMB_BITS,
            Width::Node => NODE_LEN * 8 / LIMB_BITS,
        }
    }

    /// Candidate values per limb, hence hashlocks per limb.
    pub fn candidates(self) -> usize {
        match self {
            Width::Bit => 2,
            Width::Word | Width::Node => 1 << LIMB_BITS,
        }
    }

    /// Limb decomposition, least significant limb first.
    pub fn split(self, value: &Value) -> Option<Vec<u8>> {
        match (self, value) {
            (Width::Bit, Value::Word(bit)) if *bit <= 1 => Some(vec![*bit as u8]),
            (Width::Word, Value::Word(word)) => Some(
                (0..self.limbs())
                    .map(|i| ((word >> (i * LIMB_BITS)) & 0b11) as u8)
                    .collect(),
            ),
            (Width::Node, Value::Node(node)) => Some(
                (0..self.limbs())
                    .map(|i| (node.0[i / 4] >> ((i % 4) * LIMB_BITS)) & 0b11)
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn join(self, limbs: &[u8]) -> Option<Value> {
        if limbs.len() != self.limbs() || limbs.iter().any(|l| usize::from(*l) >= self.candidates()) {
            return None;
        }
        Some(match self {
            Width::Bit => Value::Word(u32::from(limbs[0])),
            Width::Word => Value::Word(
                limbs
                    .iter()
                    .enumerate()
                    .fold(0, |acc, (i, l)| acc | (u32::from(*l) << (i * LIMB_BITS))),
            ),
            Width::Node => {
                let mut bytes = [0u8; NODE_LEN];
                for (i, l) in limbs.iter().enumerate() {
                    bytes[i / 4] |= l << ((i % 4) * LIMB_BITS);
                }
                Value::Node(Node(bytes))
            }
        })
    }
}

/// A value a script can reveal and compute with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub enum Value {
    Word(u32),
    Node(Node),
}

impl Value {
    pub fn bit(bit: bool) -> Value {
        Value::Word(u32::from(bit))
    }

    pub fn as_word(&self) -> Option<u32> {
        match self {
            Value::Word(word) => Some(*word),
            Value::Node(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<Node> {
        match self {
            Value::Node(node) => Some(*node),
            Value::Word(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Word(word) => write!(f, "{word}"),
            Value::Node(node) => write!(f, "{node:?}"),
        }
    }
}

/// What a committed symbol stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub enum Field {
    /// Prover's trace root at the index probed in a trace round.
    TraceResponse,
    /// Verifier's answer bit for a trace round.
    TraceChallenge,
    /// Prover's path node at the probed depth. For channel C this is the
    /// node of the tree after the step.
    MerkleResponse(Channel),
    /// Channel C only: the probed node of the tree before the step.
    MerkleResponsePrev,
    /// Sibling of the probed node; index `path_rounds` holds the leaf's sibling.
    MerkleResponseSibling(Channel),
    /// Verifier's answer bit for a memory round.
    MerkleChallenge(Channel),
    InstructionType,
    AddressA,
    AddressB,
    AddressC,
    ValueA,
    ValueB,
    ValueC,
    /// Value of the `c` cell before the step.
    PrevValueC,
    PcCurr,
    PcNext,
}

impl Field {
    /// The instruction fields committed at `CommitInstruction`.
    pub const INSTRUCTION: [Field; 9] = [
        Field::InstructionType,
        Field::AddressA,
        Field::AddressB,
        Field::AddressC,
        Field::ValueA,
        Field::ValueB,
        Field::ValueC,
        Field::PcCurr,
        Field::PcNext,
    ];

    pub fn width(self) -> Width {
        match self {
            Field::TraceChallenge | Field::MerkleChallenge(_) => Width::Bit,
            Field::TraceResponse
            | Field::MerkleResponse(_)
            | Field::MerkleResponsePrev
            | Field::MerkleResponseSibling(_) => Width::Node,
            _ => Width::Word,
        }
    }

    pub fn committer(self) -> Role {
        match self {
            Field::TraceChallenge | Field::MerkleChallenge(_) => Role::Verifier,
            _ => Role::Prover,
        }
    }

    /// Number of indices this field is committed under.
    pub fn count(self, params: &Params) -> usize {
        match self {
            Field::TraceResponse | Field::TraceChallenge => params.trace_rounds(),
            Field::MerkleResponse(_) | Field::MerkleResponsePrev | Field::MerkleChallenge(_) => {
                params.path_rounds()
            }
            Field::MerkleResponseSibling(_) => params.path_rounds() + 1,
            _ => 1,
        }
    }

    /// Every field, channel fields expanded.
    pub fn all() -> Vec<Field> {
        let mut fields = vec![Field::TraceResponse, Field::TraceChallenge];
        for channel in Channel::ALL {
            fields.push(Field::MerkleResponse(channel));
            fields.push(Field::MerkleResponseSibling(channel));
            fields.push(Field::MerkleChallenge(channel));
        }
        fields.push(Field::MerkleResponsePrev);
        fields.extend(Field::INSTRUCTION);
        fields.push(Field::PrevValueC);
        fields
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::TraceResponse => f.write_str("TRACE_RESPONSE"),
            Field::TraceChallenge => f.write_str("TRACE_CHALLENGE"),
            Field::MerkleResponse(ch) => write!(f, "MERKLE_RESPONSE_{ch}"),
            Field::MerkleResponsePrev => f.write_str("MERKLE_RESPONSE_C_PREV"),
            Field::MerkleResponseSibling(ch) => write!(f, "MERKLE_RESPONSE_{ch}_SIBLING"),
            Field::MerkleChallenge(ch) => write!(f, "MERKLE_CHALLENGE_{ch}"),
            Field::InstructionType => f.write_str("INSTRUCTION_TYPE"),
            Field::AddressA => f.write_str("ADDRESS_A"),
            Field::AddressB => f.write_str("ADDRESS_B"),
            Field::AddressC => f.write_str("ADDRESS_C"),
            Field::ValueA => f.write_str("VALUE_A"),
            Field::ValueB => f.write_str("VALUE_B"),
            Field::ValueC => f.write_str("VALUE_C"),
            Field::PrevValueC => f.write_str("PREV_VALUE_C"),
            Field::PcCurr => f.write_str("PC_CURR"),
            Field::PcNext => f.write_str("PC_NEXT"),
        }
    }
}

/// A committed variable: a field at a round index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub struct Symbol {
    pub field: Field,
    pub index: u8,
}

impl Symbol {
    pub const fn new(field: Field, index: u8) -> Symbol {
        Symbol { field, index }
    }

    /// A field committed once.
    pub const fn single(field: Field) -> Symbol {
        Symbol { field, index: 0 }
    }

    pub fn width(&self) -> Width {
        self.field.width()
    }

    pub fn committer(&self) -> Role {
        self.field.committer()
    }

    pub fn check(&self, params: &Params) -> Result<(), CommitmentError> {
        let count = self.field.count(params);
        if usize::from(self.index) >= count {
            return Err(CommitmentError::IndexOutOfRange {
                symbol: *self,
                count,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.field, self.index)
    }
}

/// Every symbol `role` commits to under `params`.
pub fn symbols(role: Role, params: &Params) -> Vec<Symbol> {
    Field::all()
        .into_iter()
        .filter(|field| field.committer() == role)
        .flat_map(|field| (0..field.count(params)).map(move |i| Symbol::new(field, i as u8)))
        .collect()
}

/// One hashlock: a limb of a symbol taking one candidate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub struct CommitmentId {
    pub symbol: Symbol,
    pub limb: u8,
    pub value: u8,
}

impl fmt::Display for CommitmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]={}", self.symbol, self.limb, self.value)
    }
}

/// The local party's side of the commitments: derives preimages and hashlocks.
pub struct Player {
    role: Role,
    params: Params,
    secret: Zeroizing<[u8; 32]>,
}

impl Player {
    pub fn new(role: Role, key: &PrivateKey, params: Params) -> Self {
        Self {
            role,
            params,
            secret: key.commitment_secret(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn preimage(&self, id: &CommitmentId) -> Hash {
        let mut h = Hash::sha3();
        h.update(b"PREIMAGE");
        h.update(&self.secret[..]);
        id.encode(&mut h);
        h.finalize()
    }

    pub fn hashlock(&self, id: CommitmentId) -> Hash {
        Hash::digest(self.preimage(&id).as_slice())
    }

    fn check(&self, symbol: &Symbol) -> Result<(), CommitmentError> {
        if symbol.committer() != self.role {
            return Err(CommitmentError::WrongCommitter {
                symbol: *symbol,
                expected: symbol.committer(),
            });
        }
        symbol.check(&self.params)
    }

    /// Preimages spelling out `value` for `symbol`, one per limb.
    pub fn reveal(&self, symbol: Symbol, value: &Value) -> Result<Vec<Hash>, CommitmentError> {
        self.check(&symbol)?;
        let limbs = symbol
            .width()
            .split(value)
            .ok_or(CommitmentError::ValueOutOfRange {
                symbol,
                value: *value,
            })?;
        Ok(limbs
            .into_iter()
            .enumerate()
            .map(|(limb, value)| {
                self.preimage(&CommitmentId {
                    symbol,
                    limb: limb as u8,
                    value,
                })
            })
            .collect())
    }

    /// The full table the opponent needs before compiling the graph.
    pub fn export(&self) -> HashlockTable {
        let mut entries = BTreeMap::new();
        for symbol in symbols(self.role, &self.params) {
            let width = symbol.width();
            for limb in 0..width.limbs() {
                for value in 0..width.candidates() {
                    let id = CommitmentId {
                        symbol,
                        limb: limb as u8,
                        value: value as u8,
                    };
                    entries.insert(id, self.hashlock(id));
                }
            }
        }
        HashlockTable {
            role: self.role,
            entries,
        }
    }
}

/// All hashlocks one party published.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct HashlockTable {
    pub role: Role,
    pub entries: BTreeMap<CommitmentId, Hash>,
}

impl HashlockTable {
    pub fn get(&self, id: &CommitmentId) -> Option<Hash> {
        self.entries.get(id).copied()
    }

    /// Hashlocks of `symbol`, indexed by limb then candidate value.
    pub fn hashlocks(&self, symbol: Symbol) -> Result<Vec<Vec<Hash>>, CommitmentError> {
        let width = symbol.width();
        (0..width.limbs())
            .map(|limb| {
                (0..width.candidates())
                    .map(|value| {
                        let id = CommitmentId {
                            symbol,
                            limb: limb as u8,
                            value: value as u8,
                        };
                        self.get(&id).ok_or(CommitmentError::MissingHashlock(id))
                    })
                    .collect()
            })
            .collect()
    }

    /// Checks the table covers every symbol its owner commits to.
    pub fn validate(&self, role: Role, params: &Params) -> Result<(), CommitmentError> {
        if self.role != role {
            return Err(CommitmentError::WrongTable {
                got: self.role,
                expected: role,
            });
        }
        for symbol in symbols(role, params) {
            self.hashlocks(symbol)?;
        }
        Ok(())
    }

    pub fn to_file_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.encoded_len());
        out.extend_from_slice(TABLE_MAGIC);
        out.push(TABLE_VERSION);
        self.encode(&mut out);
        out
    }

    pub fn from_file_bytes(data: &[u8]) -> Result<HashlockTable, DecodeError> {
        if data.len() < 5 || &data[..4] != TABLE_MAGIC || data[4] != TABLE_VERSION {
            return Err(DecodeError::InvalidValue);
        }
        HashlockTable::from_bytes(&data[5..])
    }

    pub fn save(&self, path: &Path) -> Result<(), CommitmentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_file_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<HashlockTable, CommitmentError> {
        let data = fs::read(path)?;
        Ok(HashlockTable::from_file_bytes(&data)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Learned {
    value: u8,
    preimage: Hash,
}

/// What the local party knows about the opponent's commitments.
///
/// Fed with every preimage seen on-chain; preimages that match none of the
/// opponent's hashlocks are ignored.
pub struct Opponent {
    table: HashlockTable,
    index: HashMap<Hash, CommitmentId>,
    learned: BTreeMap<(Symbol, u8), Learned>,
    equivocations: BTreeMap<(Symbol, u8), Learned>,
}

impl Opponent {
    pub fn new(table: HashlockTable) -> Self {
        let index = table.entries.iter().map(|(id, hash)| (*hash, *id)).collect();
        Self {
            table,
            index,
            learned: BTreeMap::new(),
            equivocations: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.table.role
    }

    pub fn table(&self) -> &HashlockTable {
        &self.table
    }

    /// Records `preimage` if it opens one of the opponent's hashlocks.
    pub fn learn(&mut self, preimage: &Hash) -> Option<CommitmentId> {
        let id = *self.index.get(&Hash::digest(preimage.as_slice()))?;
        let key = (id.symbol, id.limb);
        let seen = Learned {
            value: id.value,
            preimage: *preimage,
        };
        match self.learned.get(&key) {
            None => {
                self.learned.insert(key, seen);
            }
            Some(first) if first.value != seen.value => {
                self.equivocations.entry(key).or_insert(seen);
            }
            Some(_) => {}
        }
        Some(id)
    }

    fn limbs(&self, symbol: Symbol) -> Option<Vec<Learned>> {
        (0..symbol.width().limbs())
            .map(|limb| self.learned.get(&(symbol, limb as u8)).copied())
            .collect()
    }

    /// The value revealed for `symbol`, once every limb has been seen.
    pub fn value(&self, symbol: Symbol) -> Option<Value> {
        let limbs: Vec<u8> = self.limbs(symbol)?.iter().map(|l| l.value).collect();
        symbol.width().join(&limbs)
    }

    /// The first preimage seen for every limb of `symbol`.
    pub fn preimages(&self, symbol: Symbol) -> Option<Vec<Hash>> {
        Some(self.limbs(symbol)?.iter().map(|l| l.preimage).collect())
    }

    /// A second full opening of `symbol` that differs from [`Self::preimages`]
    /// on every equivocated limb.
    pub fn equivocation(&self, symbol: Symbol) -> Option<Vec<Hash>> {
        let mut preimages = self.preimages(symbol)?;
        let mut differs = false;
        for (limb, preimage) in preimages.iter_mut().enumerate() {
            if let Some(second) = self.equivocations.get(&(symbol, limb as u8)) {
                *preimage = second.preimage;
                differs = true;
            }
        }
        differs.then_some(preimages)
    }
}
