//! What one party knows and claims during a dispute.
//!
//! A [`Model`] pairs the party's own execution trace with everything the
//! opponent has revealed so far. From the two it derives every value the
//! party commits to: the prover answers from its trace, the verifier
//! answers by comparing the prover's claims against its own.

use crate::crypto::key_pair::{PrivateKey, Signature};
use crate::protocol::bisection;
use crate::protocol::commitment::{
    Channel, CommitmentId, Field, HashlockTable, Opponent, Player, Role, Symbol, Value,
};
use crate::protocol::disprove;
use crate::protocol::leaf::UnlockError;
use crate::protocol::script::{Slot, WitnessItem};
use crate::protocol::setup::Setup;
use crate::types::hash::Hash;
use crate::types::merkle_tree::Node;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::vm::{StepRecord, Trace};

pub struct Model {
    role: Role,
    setup: Setup,
    key: PrivateKey,
    player: Player,
    opponent: Opponent,
    trace: Trace,
}

impl Model {
    /// A party that claims `trace`, honest or not.
    pub fn new(role: Role, setup: Setup, key: PrivateKey, opponent: HashlockTable, trace: Trace) -> Self {
        let player = Player::new(role, &key, setup.params);
        Self {
            role,
            setup,
            key,
            player,
            opponent: Opponent::new(opponent),
            trace,
        }
    }

    /// A party that claims the execution the program really has.
    pub fn honest(
        role: Role,
        setup: Setup,
        key: PrivateKey,
        opponent: HashlockTable,
    ) -> Result<Self, VmError> {
        let trace = setup.run()?;
        Ok(Self::new(role, setup, key, opponent, trace))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn sign(&self, sighash: &Hash) -> Signature {
        self.key.sign(sighash.as_slice())
    }

    /// Feeds every preimage of an on-chain witness to the opponent view.
    pub fn learn(&mut self, items: &[WitnessItem]) -> Vec<CommitmentId> {
        items
            .iter()
            .filter_map(|item| match item {
                WitnessItem::Preimage(preimage) => self.opponent.learn(preimage),
                WitnessItem::Signature(_) => None,
            })
            .collect()
    }

    /// Preimages opening `slot`, from the own secret or from what the
    /// opponent revealed.
    pub fn open(&self, slot: Slot) -> Result<Vec<Hash>, UnlockError> {
        let symbol = slot.symbol;
        if symbol.committer() == self.role {
            if slot.copy != 0 {
                return Err(UnlockError::Unknown(symbol));
            }
            let value = self.value(symbol).ok_or(UnlockError::Unknown(symbol))?;
            return Ok(self.player.reveal(symbol, &value)?);
        }
        match slot.copy {
            0 => self.opponent.preimages(symbol).ok_or(UnlockError::Unknown(symbol)),
            _ => self
                .opponent
                .equivocation(symbol)
                .ok_or(UnlockError::NoEquivocation(symbol)),
        }
    }

    /// The value the party commits to `symbol`, once it is determined.
    pub fn value(&self, symbol: Symbol) -> Option<Value> {
        if symbol.committer() != self.role {
            return self.opponent.value(symbol);
        }
        let index = usize::from(symbol.index);
        match symbol.field {
            Field::TraceResponse => {
                let bits = self.trace_bits();
                let probe = bisection::next_index(bits.get(..index)?, self.setup.params.trace_rounds());
                Some(Value::Node(self.trace.root(probe as usize)))
            }
            Field::TraceChallenge => Some(Value::bit(self.trace_bit(index)?)),
            Field::MerkleResponse(channel) => {
                let depth = self.probe(channel, index)?;
                let lo = self.trace_index()? as usize;
                let after = usize::from(channel == Channel::C);
                let node = self.trace.tree(lo + after).node(self.address(channel)?, depth);
                Some(Value::Node(node))
            }
            Field::MerkleResponsePrev => {
                let depth = self.probe(Channel::C, index)?;
                let lo = self.trace_index()? as usize;
                let node = self.trace.tree(lo).node(self.address(Channel::C)?, depth);
                Some(Value::Node(node))
            }
            Field::MerkleResponseSibling(channel) => {
                let depth = if index == self.setup.params.path_rounds() {
                    self.setup.params.path_len()
                } else {
                    self.probe(channel, index)?
                };
                let lo = self.trace_index()? as usize;
                let node = self.trace.tree(lo).sibling(self.address(channel)?, depth);
                Some(Value::Node(node))
            }
            Field::MerkleChallenge(channel) => Some(Value::bit(self.merkle_bit(channel, index)?)),
            field => disprove::bind(&self.committed_step()?)
                .get(&Slot::new(Symbol::single(field)))
                .copied(),
        }
    }

    /// Trace answers known so far, MSB first.
    pub fn trace_bits(&self) -> Vec<bool> {
        let rounds = self.setup.params.trace_rounds();
        let mut bits = Vec::with_capacity(rounds);
        while bits.len() < rounds {
            match self.next_trace_bit(&bits) {
                Some(bit) => bits.push(bit),
                None => break,
            }
        }
        bits
    }

    fn trace_bit(&self, round: usize) -> Option<bool> {
        self.trace_bits().get(round).copied()
    }

    fn next_trace_bit(&self, bits: &[bool]) -> Option<bool> {
        let round = bits.len();
        let symbol = Symbol::new(Field::TraceChallenge, round as u8);
        match self.role {
            Role::Prover => self.opponent.value(symbol)?.as_word().map(|w| w == 1),
            Role::Verifier => {
                let claim = self
                    .opponent
                    .value(Symbol::new(Field::TraceResponse, round as u8))?
                    .as_node()?;
                let probe = bisection::next_index(bits, self.setup.params.trace_rounds());
                Some(claim == self.trace.root(probe as usize))
            }
        }
    }

    /// The pinned step: the last trace index both parties agree on.
    pub fn trace_index(&self) -> Option<u32> {
        let rounds = self.setup.params.trace_rounds();
        let bits = self.trace_bits();
        (bits.len() == rounds).then(|| bisection::final_index(&bits, rounds))
    }

    /// The step the prover commits to, from the own trace.
    pub fn committed_step(&self) -> Option<StepRecord> {
        let lo = self.trace_index()?;
        Some(self.trace.step_record(lo as usize, &self.setup.program))
    }

    /// The step as the prover revealed it on-chain.
    fn revealed(&self, field: Field) -> Option<u32> {
        self.value(Symbol::single(field))?.as_word()
    }

    /// Masked address of `channel` in the committed instruction.
    fn address(&self, channel: Channel) -> Option<u32> {
        let address = self.revealed(channel.address_field())?;
        Some(self.trace.config().mask(address))
    }

    /// Memory answers known so far for `channel`.
    pub fn merkle_bits(&self, channel: Channel) -> Vec<bool> {
        let rounds = self.setup.params.path_rounds();
        let mut bits = Vec::with_capacity(rounds);
        while bits.len() < rounds {
            match self.next_merkle_bit(channel, &bits) {
                Some(bit) => bits.push(bit),
                None => break,
            }
        }
        bits
    }

    fn merkle_bit(&self, channel: Channel, round: usize) -> Option<bool> {
        self.merkle_bits(channel).get(round).copied()
    }

    /// Path depth probed in memory round `round` of `channel`.
    fn probe(&self, channel: Channel, round: usize) -> Option<usize> {
        let bits = self.merkle_bits(channel);
        let depth = bisection::next_index(bits.get(..round)?, self.setup.params.path_rounds());
        Some(depth as usize)
    }

    fn next_merkle_bit(&self, channel: Channel, bits: &[bool]) -> Option<bool> {
        let round = bits.len() as u8;
        match self.role {
            Role::Prover => self
                .opponent
                .value(Symbol::new(Field::MerkleChallenge(channel), round))?
                .as_word()
                .map(|w| w == 1),
            Role::Verifier => {
                let depth = bisection::next_index(bits, self.setup.params.path_rounds()) as usize;
                let lo = self.trace_index()? as usize;
                let address = self.address(channel)?;
                let claim = |field: Field| -> Option<Node> {
                    self.opponent.value(Symbol::new(field, round))?.as_node()
                };
                let before = self.trace.tree(lo).node(address, depth);
                match channel {
                    Channel::A | Channel::B => {
                        Some(claim(Field::MerkleResponse(channel))? == before)
                    }
                    Channel::C => {
                        let after = self.trace.tree(lo + 1).node(address, depth);
                        let prev = claim(Field::MerkleResponsePrev)?;
                        let next = claim(Field::MerkleResponse(Channel::C))?;
                        Some(prev == before && next != after)
                    }
                }
            }
        }
    }

    /// The memory channel the verifier disputes, if any.
    ///
    /// Only meaningful once the instruction is committed and no disprove
    /// leaf applies: a wrong read of `a` or `b` is disputed first, then the
    /// write to `c` unless the pinned step is the last one.
    pub fn challenge(&self) -> Option<Channel> {
        if self.role != Role::Verifier {
            return None;
        }
        let lo = self.trace_index()?;
        let memory = &self.trace.get(lo as usize).memory;
        for channel in [Channel::A, Channel::B] {
            let claimed = self.revealed(channel.value_field())?;
            if claimed != memory.get(self.address(channel)?) {
                return Some(channel);
            }
        }
        (lo + 1 < self.setup.params.trace_len()).then_some(Channel::C)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::isa::Opcode;
    use crate::virtual_machine::program::{Instruction, Program};
    use crate::virtual_machine::vm::Snapshot;
    use crate::protocol::params::Params;

    struct Pair {
        paul: Model,
        vicky: Model,
    }

    fn pair(cheat: bool) -> Pair {
        let paul_key = PrivateKey::new();
        let vicky_key = PrivateKey::new();
        let setup = Setup {
            params: Params {
                log_trace_len: 2,
                log_path_len: 2,
                ..Params::default()
            },
            program: Program::new(vec![Instruction::new(Opcode::Add, 0, 1, 2)]),
            memory: vec![5, 7],
            prover: paul_key.public_key(),
            verifier: vicky_key.public_key(),
            amount: 1_000_000,
        };
        let paul_table = Player::new(Role::Prover, &paul_key, setup.params).export();
        let vicky_table = Player::new(Role::Verifier, &vicky_key, setup.params).export();

        let honest = setup.run().unwrap();
        let trace = if cheat {
            let mut snapshots: Vec<Snapshot> = honest.snapshots().to_vec();
            snapshots[1].memory.set(2, 13);
            Trace::from_snapshots(snapshots, *honest.config())
        } else {
            honest
        };
        Pair {
            paul: Model::new(Role::Prover, setup.clone(), paul_key, vicky_table, trace),
            vicky: Model::honest(Role::Verifier, setup, vicky_key, paul_table).unwrap(),
        }
    }

    /// Opens `symbol` on one side and teaches it to the other.
    fn relay(from: &Model, to: &mut Model, symbol: Symbol) {
        let items: Vec<WitnessItem> = from
            .open(Slot::new(symbol))
            .unwrap()
            .into_iter()
            .map(WitnessItem::Preimage)
            .collect();
        to.learn(&items);
    }

    fn play_trace(p: &mut Pair) {
        for r in 0..2u8 {
            relay(&p.paul, &mut p.vicky, Symbol::new(Field::TraceResponse, r));
            relay(&p.vicky, &mut p.paul, Symbol::new(Field::TraceChallenge, r));
        }
    }

    #[test]
    fn honest_trace_pins_the_last_index() {
        let mut p = pair(false);
        play_trace(&mut p);
        assert_eq!(p.vicky.trace_index(), Some(3));
        assert_eq!(p.paul.trace_index(), Some(3));

        for field in Field::INSTRUCTION {
            relay(&p.paul, &mut p.vicky, Symbol::single(field));
        }
        let step = p.paul.committed_step().unwrap();
        assert!(step.is_halted());
        assert_eq!(p.vicky.challenge(), None);
    }

    #[test]
    fn cheat_pins_the_first_step() {
        let mut p = pair(true);
        play_trace(&mut p);
        assert_eq!(p.vicky.trace_bits(), vec![false, false]);
        assert_eq!(p.paul.trace_index(), Some(0));

        for field in Field::INSTRUCTION {
            relay(&p.paul, &mut p.vicky, Symbol::single(field));
        }
        assert_eq!(p.vicky.value(Symbol::single(Field::ValueC)), Some(Value::Word(13)));
        // Reads are right, so the write is what she disputes.
        assert_eq!(p.vicky.challenge(), Some(Channel::C));
    }

    #[test]
    fn write_dispute_descends_to_the_cell() {
        let mut p = pair(true);
        play_trace(&mut p);
        for field in Field::INSTRUCTION {
            relay(&p.paul, &mut p.vicky, Symbol::single(field));
        }
        for r in 0..2u8 {
            relay(&p.paul, &mut p.vicky, Symbol::new(Field::MerkleResponse(Channel::C), r));
            relay(&p.paul, &mut p.vicky, Symbol::new(Field::MerkleResponsePrev, r));
            relay(&p.vicky, &mut p.paul, Symbol::new(Field::MerkleChallenge(Channel::C), r));
        }
        // Only cell 2 differs, so every node on its path disagrees.
        assert_eq!(p.vicky.merkle_bits(Channel::C), vec![true, true]);
        assert_eq!(p.paul.merkle_bits(Channel::C), vec![true, true]);
    }

    #[test]
    fn opening_the_opponent_needs_their_reveal() {
        let p = pair(false);
        let symbol = Symbol::new(Field::TraceResponse, 0);
        assert!(matches!(
            p.vicky.open(Slot::new(symbol)),
            Err(UnlockError::Unknown(_))
        ));
        assert!(matches!(
            p.paul.open(Slot::second(symbol)),
            Err(UnlockError::Unknown(_))
        ));
        assert!(p.paul.open(Slot::new(symbol)).is_ok());
    }
}
