//! The pre-signed transaction graph.
//!
//! Compiling a [`Setup`] expands the node graph breadth-first into one
//! transaction per node. Each transaction spends its parent's single output
//! through one of the leaves that output commits to, and carries a single
//! output of its own committing to the leaves of all its children. Terminal
//! nodes pay their actor.
//!
//! Transaction ids cover the input, sequence and output but not the
//! witness, so every id is known before anyone signs anything.

use crate::crypto::key_pair::PublicKey;
use crate::info;
use crate::protocol::commitment::{HashlockTable, Role};
use crate::protocol::graph::{self, GraphError, NodeType};
use crate::protocol::leaf::{Leaf, LockContext};
use crate::protocol::script::{Script, WitnessItem};
use crate::protocol::setup::Setup;
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use bitdispute_derive::BinaryCodec;
use std::collections::{HashMap, VecDeque};

/// x-only key with no known discrete log; outputs can only be spent
/// through their script tree.
const INTERNAL_KEY: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a, 0x5e,
    0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a, 0xc0,
];

/// Output index the funding transaction spends from the agreement itself.
pub const FUNDING_VOUT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub struct Outpoint {
    pub txid: Hash,
    pub vout: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub struct TxOut {
    pub value: u64,
    pub commitment: Hash,
}

/// How an input proves it may spend the output it names.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Witness {
    pub script: Script,
    /// Position of the script in the output's leaf list.
    pub leaf_index: u32,
    /// Script tree proof from the leaf up to the root.
    pub proof: Vec<Hash>,
    pub items: Vec<WitnessItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Transaction {
    pub input: Outpoint,
    /// Relative timelock the input claims, in blocks.
    pub sequence: u32,
    pub output: TxOut,
    pub witness: Option<Witness>,
}

impl Transaction {
    pub fn txid(&self) -> Hash {
        Hash::tagged(b"TXID", &(self.input, (self.sequence, self.output)))
    }
}

/// Commitment of an output spendable through the scripts hashed into `leaves`.
pub fn output_commitment(leaves: &[Hash]) -> Hash {
    commitment_from_root(MerkleTree::from_raw(leaves.to_vec()))
}

pub fn commitment_from_root(root: Hash) -> Hash {
    Hash::tagged(b"TAPTWEAK", &(INTERNAL_KEY, root))
}

/// Commitment of a terminal output: plain payment to `key`.
pub fn payout_commitment(key: &PublicKey) -> Hash {
    Hash::tagged(b"PAYOUT", key)
}

/// One node of the compiled graph and the transaction that realises it.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub node: NodeType,
    pub actor: Role,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Leaves through which this node's transaction may spend its parent.
    pub leaves: Vec<Leaf>,
    pub scripts: Vec<Script>,
    /// Position of `scripts[0]` in the parent output's leaf list.
    pub leaf_offset: usize,
    pub sequence: u32,
    pub output: TxOut,
    /// Script leaf hashes `output` commits to: the children's scripts in order.
    pub output_leaves: Vec<Hash>,
    pub txid: Hash,
}

pub struct CompiledGraph {
    setup: Setup,
    nodes: Vec<GraphNode>,
    funding: Transaction,
    by_txid: HashMap<Hash, usize>,
}

impl CompiledGraph {
    pub fn compile(
        setup: &Setup,
        prover: &HashlockTable,
        verifier: &HashlockTable,
    ) -> Result<Self, GraphError> {
        setup.validate()?;
        prover.validate(Role::Prover, &setup.params)?;
        verifier.validate(Role::Verifier, &setup.params)?;
        let ctx = LockContext::new(setup, prover, verifier);
        let params = &setup.params;

        // Expand breadth-first, locking each node's leaves as it is reached.
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut queue = VecDeque::from([(NodeType::ROOT, None::<usize>)]);
        while let Some((node, parent)) = queue.pop_front() {
            let parent_value = match parent {
                Some(p) => nodes[p].output.value,
                None => setup.amount,
            };
            let value = parent_value.saturating_sub(params.min_fees);
            if value < params.dust_limit {
                return Err(GraphError::Dust {
                    node,
                    value,
                    dust_limit: params.dust_limit,
                });
            }

            let actor = node.actor();
            let leaves = graph::leaves(&node, setup)?;
            let scripts = leaves
                .iter()
                .map(|leaf| leaf.lock(&ctx, actor))
                .collect::<Result<Vec<_>, _>>()?;
            let leaf_offset = match parent {
                Some(p) => nodes[p]
                    .children
                    .iter()
                    .map(|c| nodes[*c].scripts.len())
                    .sum(),
                None => 0,
            };
            let sequence = if node.kind.is_timeout() { params.timeout } else { 0 };

            let index = nodes.len();
            if let Some(p) = parent {
                nodes[p].children.push(index);
            }
            nodes.push(GraphNode {
                node,
                actor,
                parent,
                children: Vec::new(),
                leaves,
                scripts,
                leaf_offset,
                sequence,
                output: TxOut {
                    value,
                    commitment: Hash::zero(),
                },
                output_leaves: Vec::new(),
                txid: Hash::zero(),
            });
            for child in graph::children(&node, params) {
                queue.push_back((child, Some(index)));
            }
        }

        // Output commitments only depend on the children's scripts.
        for i in 0..nodes.len() {
            let output_leaves: Vec<Hash> = nodes[i]
                .children
                .iter()
                .flat_map(|c| nodes[*c].scripts.iter().map(Script::leaf_hash))
                .collect();
            nodes[i].output.commitment = if nodes[i].children.is_empty() {
                payout_commitment(&setup.key(nodes[i].actor))
            } else {
                output_commitment(&output_leaves)
            };
            nodes[i].output_leaves = output_leaves;
        }

        let root_leaves: Vec<Hash> = nodes[0].scripts.iter().map(Script::leaf_hash).collect();
        let funding = Transaction {
            input: Outpoint {
                txid: setup.id(),
                vout: FUNDING_VOUT,
            },
            sequence: 0,
            output: TxOut {
                value: setup.amount,
                commitment: output_commitment(&root_leaves),
            },
            witness: None,
        };

        // Ids flow parent to child; the queue order already is a topological one.
        let mut by_txid = HashMap::with_capacity(nodes.len());
        for i in 0..nodes.len() {
            let input = Outpoint {
                txid: match nodes[i].parent {
                    Some(p) => nodes[p].txid,
                    None => funding.txid(),
                },
                vout: 0,
            };
            let tx = Transaction {
                input,
                sequence: nodes[i].sequence,
                output: nodes[i].output,
                witness: None,
            };
            nodes[i].txid = tx.txid();
            if let Some(other) = by_txid.insert(nodes[i].txid, i) {
                return Err(GraphError::DuplicateTxid(nodes[other].node, nodes[i].node));
            }
        }

        info!(
            "Compiled dispute graph: {} transactions, funding commitment {}",
            nodes.len(),
            funding.output.commitment
        );

        Ok(Self {
            setup: setup.clone(),
            nodes,
            funding,
            by_txid,
        })
    }

    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    pub fn children_of(&self, index: usize) -> &[usize] {
        &self.nodes[index].children
    }

    pub fn find(&self, txid: &Hash) -> Option<usize> {
        self.by_txid.get(txid).copied()
    }

    pub fn txid(&self, index: usize) -> Hash {
        self.nodes[index].txid
    }

    pub fn funding_transaction(&self) -> &Transaction {
        &self.funding
    }

    /// The output `index`'s transaction spends.
    pub fn input(&self, index: usize) -> Outpoint {
        let txid = match self.nodes[index].parent {
            Some(p) => self.nodes[p].txid,
            None => self.funding.txid(),
        };
        Outpoint { txid, vout: 0 }
    }

    fn parent_leaves(&self, index: usize) -> Vec<Hash> {
        match self.nodes[index].parent {
            Some(p) => self.nodes[p].output_leaves.clone(),
            None => self.nodes[0].scripts.iter().map(Script::leaf_hash).collect(),
        }
    }

    pub fn unsigned(&self, index: usize) -> Transaction {
        let node = &self.nodes[index];
        Transaction {
            input: self.input(index),
            sequence: node.sequence,
            output: node.output,
            witness: None,
        }
    }

    /// The transaction of `index` spending through its `leaf`-th leaf.
    pub fn spend(&self, index: usize, leaf: usize, items: Vec<WitnessItem>) -> Transaction {
        let node = &self.nodes[index];
        let leaf_index = node.leaf_offset + leaf;
        let witness = Witness {
            script: node.scripts[leaf].clone(),
            leaf_index: leaf_index as u32,
            proof: MerkleTree::proof(&self.parent_leaves(index), leaf_index),
            items,
        };
        Transaction {
            witness: Some(witness),
            ..self.unsigned(index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::PrivateKey;
    use crate::protocol::commitment::Player;
    use crate::protocol::graph::NodeKind;
    use crate::protocol::params::Params;
    use crate::virtual_machine::isa::Opcode;
    use crate::virtual_machine::program::{Instruction, Program};
    use std::collections::HashSet;

    fn setup(amount: u64) -> (Setup, HashlockTable, HashlockTable) {
        let paul = PrivateKey::new();
        let vicky = PrivateKey::new();
        let setup = Setup {
            params: Params {
                log_trace_len: 2,
                log_path_len: 2,
                ..Params::default()
            },
            program: Program::new(vec![Instruction::new(Opcode::Add, 0, 1, 2)]),
            memory: vec![5, 7],
            prover: paul.public_key(),
            verifier: vicky.public_key(),
            amount,
        };
        let prover = Player::new(Role::Prover, &paul, setup.params).export();
        let verifier = Player::new(Role::Verifier, &vicky, setup.params).export();
        (setup, prover, verifier)
    }

    #[test]
    fn graph_is_consistent() {
        let (setup, prover, verifier) = setup(10_000_000);
        let graph = CompiledGraph::compile(&setup, &prover, &verifier).unwrap();
        assert_eq!(graph.node(0).node, NodeType::ROOT);
        assert_eq!(graph.input(0).txid, graph.funding_transaction().txid());

        for (i, node) in graph.nodes().iter().enumerate() {
            assert_eq!(graph.find(&node.txid), Some(i));
            assert_eq!(graph.unsigned(i).txid(), node.txid);
            assert_eq!(node.leaves.len(), node.scripts.len());
            if let Some(p) = node.parent {
                assert_eq!(node.output.value + setup.params.min_fees, graph.node(p).output.value);
                assert!(graph.children_of(p).contains(&i));
            }
            if node.node.kind.is_timeout() {
                assert_eq!(node.sequence, setup.params.timeout);
            }
            if node.children.is_empty() {
                assert_eq!(node.output.commitment, payout_commitment(&setup.key(node.actor)));
            }
        }
    }

    #[test]
    fn placeholder_branches_get_distinct_txids() {
        let (setup, prover, verifier) = setup(10_000_000);
        let graph = CompiledGraph::compile(&setup, &prover, &verifier).unwrap();
        let txids: HashSet<Hash> = graph.nodes().iter().map(|n| n.txid).collect();
        assert_eq!(txids.len(), graph.len());

        let txid_of = |kind: NodeKind| {
            graph
                .nodes()
                .iter()
                .find(|n| n.node.kind == kind)
                .map(|n| n.txid)
                .unwrap()
        };
        assert_ne!(txid_of(NodeKind::ChallengePcCurr), txid_of(NodeKind::ChallengePcNext));
        assert_ne!(txid_of(NodeKind::EquivocatedPcCurr), txid_of(NodeKind::EquivocatedPcNext));
        assert_ne!(
            txid_of(NodeKind::EquivocatedPcCurrTimeout),
            txid_of(NodeKind::EquivocatedPcNextTimeout)
        );
    }

    #[test]
    fn compilation_is_deterministic() {
        let (setup, prover, verifier) = setup(10_000_000);
        let a = CompiledGraph::compile(&setup, &prover, &verifier).unwrap();
        let b = CompiledGraph::compile(&setup, &prover, &verifier).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a.funding_transaction(), b.funding_transaction());
        for (x, y) in a.nodes().iter().zip(b.nodes()) {
            assert_eq!(x.output, y.output);
            assert_eq!(x.txid, y.txid);
        }
    }

    #[test]
    fn spend_proves_the_leaf() {
        let (setup, prover, verifier) = setup(10_000_000);
        let graph = CompiledGraph::compile(&setup, &prover, &verifier).unwrap();
        let commit = graph
            .nodes()
            .iter()
            .position(|n| n.node.kind == NodeKind::DisproveProgram)
            .unwrap();
        let parent = graph.node(commit).parent.unwrap();

        for leaf in 0..graph.node(commit).scripts.len() {
            let tx = graph.spend(commit, leaf, vec![]);
            let witness = tx.witness.as_ref().unwrap();
            let root = MerkleTree::root_from_proof(
                witness.script.leaf_hash(),
                witness.leaf_index as usize,
                &witness.proof,
            );
            assert_eq!(commitment_from_root(root), graph.node(parent).output.commitment);
            // The witness does not move the id.
            assert_eq!(tx.txid(), graph.txid(commit));
        }
    }

    #[test]
    fn small_amounts_hit_the_dust_limit() {
        let (setup, prover, verifier) = setup(20_000);
        assert!(matches!(
            CompiledGraph::compile(&setup, &prover, &verifier),
            Err(GraphError::Dust { .. })
        ));
    }

    #[test]
    fn tables_must_match_their_roles() {
        let (setup, prover, verifier) = setup(10_000_000);
        assert!(matches!(
            CompiledGraph::compile(&setup, &verifier, &prover),
            Err(GraphError::Commitment(_))
        ));
    }
}
