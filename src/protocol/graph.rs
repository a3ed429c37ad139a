//! Shape of the dispute: node types, who moves at each, what follows what,
//! and which leaves each node offers.
//!
//! A node is a parametric [`NodeType`]: a [`NodeKind`], an optional memory
//! [`Channel`] and a round. The adjacency is a static table keyed by kind;
//! rounds advance or reset according to the edge, so one table describes
//! the graph for any trace and path length.

use crate::protocol::commitment::{Channel, CommitmentError, Field, Role, Symbol};
use crate::protocol::disprove;
use crate::protocol::leaf::{HashStep, Leaf, RootSource};
use crate::protocol::params::Params;
use crate::protocol::setup::{Setup, SetupError};
use bitdispute_derive::Error;
use std::fmt;

use self::NodeKind as K;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid setup: {0}")]
    Setup(SetupError),
    #[error("{0} needs a memory channel")]
    MissingChannel(NodeType),
    #[error("{node} would carry {value}, below the dust limit {dust_limit}")]
    Dust {
        node: NodeType,
        value: u64,
        dust_limit: u64,
    },
    #[error("commitment failure: {0}")]
    Commitment(CommitmentError),
    #[error("{0} and {1} compile to the same txid")]
    DuplicateTxid(NodeType, NodeType),
}

impl From<SetupError> for GraphError {
    fn from(err: SetupError) -> Self {
        GraphError::Setup(err)
    }
}

impl From<CommitmentError> for GraphError {
    fn from(err: CommitmentError) -> Self {
        GraphError::Commitment(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    KickOff,
    TraceResponse,
    TraceResponseTimeout,
    TraceChallenge,
    TraceChallengeTimeout,
    CommitInstruction,
    CommitInstructionTimeout,
    DisproveProgram,
    ChallengePcCurr,
    ChallengePcNext,
    EquivocatedPcCurr,
    EquivocatedPcCurrTimeout,
    EquivocatedPcNext,
    EquivocatedPcNextTimeout,
    ChallengeValue,
    ChallengeInstructionTimeout,
    MerkleResponse,
    MerkleResponseTimeout,
    MerkleChallenge,
    MerkleChallengeTimeout,
    MerkleHash,
    MerkleHashTimeout,
    MerkleEquivocation,
    MerkleEquivocationTimeout,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl NodeKind {
    /// The party that spends into a node of this kind.
    pub fn actor(self) -> Role {
        use NodeKind::*;
        match self {
            TraceResponse
            | TraceChallengeTimeout
            | CommitInstruction
            | ChallengeInstructionTimeout
            | EquivocatedPcCurr
            | EquivocatedPcNext
            | MerkleResponse
            | MerkleChallengeTimeout
            | MerkleHash
            | MerkleEquivocationTimeout => Role::Prover,
            KickOff
            | TraceResponseTimeout
            | TraceChallenge
            | CommitInstructionTimeout
            | DisproveProgram
            | ChallengePcCurr
            | ChallengePcNext
            | EquivocatedPcCurrTimeout
            | EquivocatedPcNextTimeout
            | ChallengeValue
            | MerkleResponseTimeout
            | MerkleChallenge
            | MerkleHashTimeout
            | MerkleEquivocation => Role::Verifier,
        }
    }

    pub fn is_timeout(self) -> bool {
        use NodeKind::*;
        matches!(
            self,
            TraceResponseTimeout
                | TraceChallengeTimeout
                | CommitInstructionTimeout
                | ChallengeInstructionTimeout
                | EquivocatedPcCurrTimeout
                | EquivocatedPcNextTimeout
                | MerkleResponseTimeout
                | MerkleChallengeTimeout
                | MerkleHashTimeout
                | MerkleEquivocationTimeout
        )
    }

    pub fn is_terminal(self) -> bool {
        edges(self).is_empty()
    }

    /// Rounds a node of this kind repeats over.
    pub fn rounds(self, params: &Params) -> usize {
        match self {
            NodeKind::TraceResponse | NodeKind::TraceChallenge => params.trace_rounds(),
            NodeKind::MerkleResponse | NodeKind::MerkleChallenge => params.path_rounds(),
            _ => 1,
        }
    }

    fn has_channel(self) -> bool {
        use NodeKind::*;
        matches!(
            self,
            ChallengeValue
                | MerkleResponse
                | MerkleResponseTimeout
                | MerkleChallenge
                | MerkleChallengeTimeout
                | MerkleHash
                | MerkleHashTimeout
                | MerkleEquivocation
                | MerkleEquivocationTimeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeType {
    pub kind: NodeKind,
    pub channel: Option<Channel>,
    pub round: u8,
}

impl NodeType {
    pub const ROOT: NodeType = NodeType {
        kind: NodeKind::KickOff,
        channel: None,
        round: 0,
    };

    pub fn actor(&self) -> Role {
        self.kind.actor()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    fn channel(&self) -> Result<Channel, GraphError> {
        self.channel.ok_or(GraphError::MissingChannel(*self))
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(channel) => write!(f, "{}({channel}, {})", self.kind, self.round),
            None if matches!(
                self.kind,
                NodeKind::TraceResponse
                    | NodeKind::TraceResponseTimeout
                    | NodeKind::TraceChallenge
                    | NodeKind::TraceChallengeTimeout
            ) =>
            {
                write!(f, "{}({})", self.kind, self.round)
            }
            None => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Clone, Copy)]
enum Round {
    Zero,
    Same,
    Next,
}

#[derive(Clone, Copy)]
enum When {
    Always,
    /// The parent is not in its last round.
    MoreRounds,
    /// The parent is in its last round.
    LastRound,
}

#[derive(Clone, Copy)]
struct Edge {
    to: NodeKind,
    round: Round,
    when: When,
    /// One child per channel instead of inheriting the parent's.
    fan_out: bool,
}

const fn edge(to: NodeKind, round: Round, when: When) -> Edge {
    Edge {
        to,
        round,
        when,
        fan_out: false,
    }
}

const fn leaf(to: NodeKind) -> Edge {
    edge(to, Round::Zero, When::Always)
}

/// Children of each non-terminal kind, in the order a party tries them.
const ADJACENCY: &[(NodeKind, &[Edge])] = &[
    (K::KickOff, &[leaf(K::TraceResponse), leaf(K::TraceResponseTimeout)]),
    (
        K::TraceResponse,
        &[
            edge(K::TraceChallenge, Round::Same, When::Always),
            edge(K::TraceChallengeTimeout, Round::Same, When::Always),
        ],
    ),
    (
        K::TraceChallenge,
        &[
            edge(K::TraceResponse, Round::Next, When::MoreRounds),
            edge(K::TraceResponseTimeout, Round::Next, When::MoreRounds),
            edge(K::CommitInstruction, Round::Zero, When::LastRound),
            edge(K::CommitInstructionTimeout, Round::Zero, When::LastRound),
        ],
    ),
    (
        K::CommitInstruction,
        &[
            leaf(K::DisproveProgram),
            leaf(K::ChallengePcCurr),
            leaf(K::ChallengePcNext),
            Edge {
                to: K::ChallengeValue,
                round: Round::Zero,
                when: When::Always,
                fan_out: true,
            },
            leaf(K::ChallengeInstructionTimeout),
        ],
    ),
    (K::ChallengePcCurr, &[leaf(K::EquivocatedPcCurr), leaf(K::EquivocatedPcCurrTimeout)]),
    (K::ChallengePcNext, &[leaf(K::EquivocatedPcNext), leaf(K::EquivocatedPcNextTimeout)]),
    (K::ChallengeValue, &[leaf(K::MerkleResponse), leaf(K::MerkleResponseTimeout)]),
    (
        K::MerkleResponse,
        &[
            edge(K::MerkleChallenge, Round::Same, When::Always),
            edge(K::MerkleChallengeTimeout, Round::Same, When::Always),
        ],
    ),
    (
        K::MerkleChallenge,
        &[
            edge(K::MerkleResponse, Round::Next, When::MoreRounds),
            edge(K::MerkleResponseTimeout, Round::Next, When::MoreRounds),
            edge(K::MerkleHash, Round::Zero, When::LastRound),
            edge(K::MerkleHashTimeout, Round::Zero, When::LastRound),
        ],
    ),
    (K::MerkleHash, &[leaf(K::MerkleEquivocation), leaf(K::MerkleEquivocationTimeout)]),
];

fn edges(kind: NodeKind) -> &'static [Edge] {
    ADJACENCY
        .iter()
        .find(|(from, _)| *from == kind)
        .map(|(_, edges)| *edges)
        .unwrap_or(&[])
}

/// Nodes that may spend `node`'s output, in the order a party tries them.
pub fn children(node: &NodeType, params: &Params) -> Vec<NodeType> {
    let last_round = usize::from(node.round) + 1 >= node.kind.rounds(params);
    let mut out = Vec::new();
    for edge in edges(node.kind) {
        let applies = match edge.when {
            When::Always => true,
            When::MoreRounds => !last_round,
            When::LastRound => last_round,
        };
        if !applies {
            continue;
        }
        let round = match edge.round {
            Round::Zero => 0,
            Round::Same => node.round,
            Round::Next => node.round + 1,
        };
        if edge.fan_out {
            out.extend(Channel::ALL.iter().map(|channel| NodeType {
                kind: edge.to,
                channel: Some(*channel),
                round,
            }));
        } else {
            out.push(NodeType {
                kind: edge.to,
                channel: if edge.to.has_channel() { node.channel } else { None },
                round,
            });
        }
    }
    out
}

/// The leaves of `node`: the ways its actor may spend into it.
pub fn leaves(node: &NodeType, setup: &Setup) -> Result<Vec<Leaf>, GraphError> {
    use NodeKind::*;
    let params = &setup.params;
    let round = node.round;
    Ok(match node.kind {
        KickOff => vec![Leaf::KickOff],
        TraceResponse => vec![Leaf::TraceResponse { round }],
        TraceChallenge => vec![Leaf::TraceChallenge { round }],
        CommitInstruction => vec![Leaf::CommitInstruction],
        DisproveProgram => disprove::leaves(&setup.program, params)
            .into_iter()
            .map(Leaf::Disprove)
            .collect(),
        ChallengePcCurr | ChallengePcNext | EquivocatedPcCurr | EquivocatedPcNext => {
            vec![Leaf::Unspecified(node.kind)]
        }
        ChallengeValue => vec![Leaf::ChallengeValue(node.channel()?)],
        MerkleResponse => vec![Leaf::MerkleResponse {
            channel: node.channel()?,
            round,
        }],
        MerkleChallenge => vec![Leaf::MerkleChallenge {
            channel: node.channel()?,
            round,
        }],
        MerkleHash => {
            let channel = node.channel()?;
            hash_steps(channel, params)
                .into_iter()
                .map(|step| Leaf::MerkleHash { channel, step })
                .collect()
        }
        MerkleEquivocation => equivocation_symbols(node.channel()?, params)
            .into_iter()
            .map(Leaf::MerkleEquivocation)
            .collect(),
        _ => vec![Leaf::Timeout],
    })
}

/// One leaf per hash step of the pinned path, plus one per way the root
/// step can locate its trace root(s).
fn hash_steps(channel: Channel, params: &Params) -> Vec<HashStep> {
    let mut steps: Vec<HashStep> = (1..params.path_len())
        .map(|m| HashStep::Inner(m as u8))
        .collect();
    let rounds = params.trace_rounds() as u8;
    match channel {
        Channel::A | Channel::B => {
            steps.push(HashStep::Root(RootSource::Initial));
            steps.extend((0..rounds).map(|r| HashStep::Root(RootSource::Round(r))));
        }
        Channel::C => {
            // The state after the step is probed last exactly when the
            // state before it is the initial one or was probed earlier.
            let last = rounds - 1;
            steps.push(HashStep::WriteRoot {
                prev: RootSource::Initial,
                next: last,
            });
            for r in 0..last {
                steps.push(HashStep::WriteRoot {
                    prev: RootSource::Round(r),
                    next: last,
                });
                steps.push(HashStep::WriteRoot {
                    prev: RootSource::Round(last),
                    next: r,
                });
            }
        }
    }
    steps
}

/// Prover symbols a channel's memory game reveals more than once.
fn equivocation_symbols(channel: Channel, params: &Params) -> Vec<Symbol> {
    let rounds = params.path_rounds() as u8;
    let mut symbols: Vec<Symbol> = (0..rounds)
        .map(|r| Symbol::new(Field::MerkleResponse(channel), r))
        .collect();
    symbols.extend((0..=rounds).map(|r| Symbol::new(Field::MerkleResponseSibling(channel), r)));
    if channel == Channel::C {
        symbols.extend((0..rounds).map(|r| Symbol::new(Field::MerkleResponsePrev, r)));
        symbols.push(Symbol::single(Field::PrevValueC));
    }
    symbols.push(Symbol::single(channel.address_field()));
    symbols.push(Symbol::single(channel.value_field()));
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::bisection;
    use std::collections::BTreeSet;

    fn params(t: u8, l: u8) -> Params {
        Params {
            log_trace_len: t,
            log_path_len: l,
            ..Params::default()
        }
    }

    fn walk(params: &Params) -> Vec<NodeType> {
        let mut out = Vec::new();
        let mut stack = vec![NodeType::ROOT];
        while let Some(node) = stack.pop() {
            stack.extend(children(&node, params));
            out.push(node);
        }
        out
    }

    #[test]
    fn trace_rounds_chain_into_commit() {
        let params = params(2, 2);
        let root = children(&NodeType::ROOT, &params);
        assert_eq!(root[0].kind, NodeKind::TraceResponse);
        assert_eq!(root[1].kind, NodeKind::TraceResponseTimeout);

        let challenge = NodeType {
            kind: NodeKind::TraceChallenge,
            channel: None,
            round: 0,
        };
        let next = children(&challenge, &params);
        assert_eq!(next[0].kind, NodeKind::TraceResponse);
        assert_eq!(next[0].round, 1);

        let last = NodeType { round: 1, ..challenge };
        let kinds: Vec<NodeKind> = children(&last, &params).iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NodeKind::CommitInstruction, NodeKind::CommitInstructionTimeout]
        );
    }

    #[test]
    fn commit_fans_out_per_channel() {
        let params = params(2, 2);
        let commit = NodeType {
            kind: NodeKind::CommitInstruction,
            channel: None,
            round: 0,
        };
        let challenges: Vec<Option<Channel>> = children(&commit, &params)
            .iter()
            .filter(|n| n.kind == NodeKind::ChallengeValue)
            .map(|n| n.channel)
            .collect();
        assert_eq!(challenges, vec![Some(Channel::A), Some(Channel::B), Some(Channel::C)]);
    }

    #[test]
    fn every_path_ends_in_a_terminal() {
        let params = params(3, 2);
        let nodes = walk(&params);
        let unique: BTreeSet<NodeType> = nodes.iter().copied().collect();
        assert_eq!(unique.len(), nodes.len());
        for node in &nodes {
            if node.is_terminal() {
                assert!(children(node, &params).is_empty());
            }
            if node.kind.has_channel() {
                assert!(node.channel.is_some(), "{node}");
            }
            // Moves alternate; a timeout goes to whoever moved last.
            for child in children(node, &params) {
                if child.kind.is_timeout() {
                    assert_eq!(child.actor(), node.actor(), "{node} -> {child}");
                } else {
                    assert_ne!(child.actor(), node.actor(), "{node} -> {child}");
                }
            }
        }
        let merkle_hashes = nodes.iter().filter(|n| n.kind == NodeKind::MerkleHash).count();
        assert_eq!(merkle_hashes, 3);
    }

    #[test]
    fn write_roots_cover_every_pinned_step() {
        for t in 1..=4u8 {
            let params = params(t, 2);
            let width = params.trace_rounds();
            let pairs: BTreeSet<(Option<usize>, usize)> = hash_steps(Channel::C, &params)
                .into_iter()
                .filter_map(|step| match step {
                    HashStep::WriteRoot { prev, next } => Some((
                        match prev {
                            RootSource::Initial => None,
                            RootSource::Round(r) => Some(usize::from(r)),
                        },
                        usize::from(next),
                    )),
                    _ => None,
                })
                .collect();
            assert_eq!(pairs.len(), 2 * width - 1);
            for lo in 0..params.trace_len() - 1 {
                let prev = bisection::prev_round(lo, width);
                let next = bisection::next_round(lo, width).unwrap();
                assert!(pairs.contains(&(prev, next)), "t {t} lo {lo}");
            }
        }
    }

    #[test]
    fn hash_leaves() {
        let params = params(2, 2);
        // 3 inner steps + initial + 2 rounds.
        assert_eq!(hash_steps(Channel::A, &params).len(), 3 + 1 + 2);
        assert_eq!(hash_steps(Channel::C, &params).len(), 3 + 3);
        assert_eq!(equivocation_symbols(Channel::A, &params).len(), 2 + 3 + 2);
        assert_eq!(equivocation_symbols(Channel::C, &params).len(), 2 + 3 + 2 + 1 + 2);
    }
}
