//! An in-process ledger.
//!
//! Keeps blocks, a mempool and the UTXO set, and validates every spend the
//! way the dispute graph expects: the input must be unspent and old enough
//! for its sequence, the witness must prove its script against the spent
//! output's commitment, and the script must evaluate.

use crate::network::indexer::{ChainIndexer, IndexerError};
use crate::protocol::script::{EvalContext, Interpreter, ScriptEngine};
use crate::protocol::transaction::{Outpoint, Transaction, TxOut, commitment_from_root};
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use crate::{debug, info};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

struct Block {
    hash: Hash,
    txids: Vec<Hash>,
}

#[derive(Clone, Copy)]
struct Utxo {
    output: TxOut,
    height: u64,
}

struct ChainState {
    blocks: Vec<Block>,
    transactions: HashMap<Hash, Transaction>,
    utxos: HashMap<Outpoint, Utxo>,
    mempool: Vec<Transaction>,
    /// Outpoints already spent by a mempool transaction.
    claimed: HashSet<Outpoint>,
}

impl ChainState {
    fn tip(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    fn is_known(&self, txid: &Hash) -> bool {
        self.transactions.contains_key(txid) || self.mempool.iter().any(|tx| tx.txid() == *txid)
    }
}

pub struct LocalChain {
    state: Mutex<ChainState>,
    engine: Interpreter,
}

impl Default for LocalChain {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChain {
    /// A chain holding only an empty genesis block.
    pub fn new() -> Self {
        let genesis = Block {
            hash: Hash::tagged(b"BLOCK", &(0u64, Vec::<Hash>::new())),
            txids: Vec::new(),
        };
        Self {
            state: Mutex::new(ChainState {
                blocks: vec![genesis],
                transactions: HashMap::new(),
                utxos: HashMap::new(),
                mempool: Vec::new(),
                claimed: HashSet::new(),
            }),
            engine: Interpreter,
        }
    }

    /// Queues a transaction that creates coins from nothing. Funding the
    /// same transaction twice is a no-op.
    pub async fn fund(&self, tx: &Transaction) -> Hash {
        let txid = tx.txid();
        let mut state = self.state.lock().await;
        if !state.is_known(&txid) {
            info!("Funding {} with {}", txid, tx.output.value);
            state.mempool.push(tx.clone());
        }
        txid
    }

    /// Confirms the mempool into a new block and returns its height.
    pub async fn mine(&self) -> u64 {
        let mut state = self.state.lock().await;
        let height = state.blocks.len() as u64;
        let parent = state.blocks[state.blocks.len() - 1].hash;
        let mempool = std::mem::take(&mut state.mempool);
        state.claimed.clear();

        let mut txids = Vec::with_capacity(mempool.len());
        for tx in mempool {
            let txid = tx.txid();
            state.utxos.remove(&tx.input);
            state.utxos.insert(
                Outpoint { txid, vout: 0 },
                Utxo {
                    output: tx.output,
                    height,
                },
            );
            state.transactions.insert(txid, tx);
            txids.push(txid);
        }
        let hash = Hash::tagged(b"BLOCK", &(height, (parent, txids.clone())));
        debug!("Mined block {} at height {} with {} transactions", hash, height, txids.len());
        state.blocks.push(Block { hash, txids });
        height
    }

    fn validate(&self, state: &ChainState, tx: &Transaction) -> Result<(), String> {
        let witness = tx.witness.as_ref().ok_or("missing witness")?;
        if state.claimed.contains(&tx.input) {
            return Err("input already spent in the mempool".into());
        }
        let utxo = state
            .utxos
            .get(&tx.input)
            .ok_or_else(|| format!("unknown or spent input {}:{}", tx.input.txid, tx.input.vout))?;

        let age = state.tip() - utxo.height;
        if age < u64::from(tx.sequence) {
            return Err(format!("input is {age} blocks deep, sequence needs {}", tx.sequence));
        }
        if tx.output.value > utxo.output.value {
            return Err("output exceeds input value".into());
        }

        let root = MerkleTree::root_from_proof(
            witness.script.leaf_hash(),
            witness.leaf_index as usize,
            &witness.proof,
        );
        if commitment_from_root(root) != utxo.output.commitment {
            return Err("script is not committed to by the spent output".into());
        }

        let ctx = EvalContext {
            sighash: tx.txid(),
            sequence: tx.sequence,
        };
        let evaluation = self.engine.evaluate(&witness.script, &witness.items, &ctx);
        match evaluation.failure {
            None => Ok(()),
            Some(err) => Err(format!("script failed: {err}")),
        }
    }
}

#[async_trait]
impl ChainIndexer for LocalChain {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        Ok(self.state.lock().await.tip())
    }

    async fn block_at(&self, height: u64) -> Result<Hash, IndexerError> {
        let state = self.state.lock().await;
        usize::try_from(height)
            .ok()
            .and_then(|h| state.blocks.get(h))
            .map(|block| block.hash)
            .ok_or_else(|| IndexerError::NotFound(format!("block at height {height}")))
    }

    async fn block_txids(&self, block: &Hash) -> Result<Vec<Hash>, IndexerError> {
        let state = self.state.lock().await;
        state
            .blocks
            .iter()
            .rev()
            .find(|b| b.hash == *block)
            .map(|b| b.txids.clone())
            .ok_or_else(|| IndexerError::NotFound(format!("block {block}")))
    }

    async fn transaction(&self, txid: &Hash) -> Result<Transaction, IndexerError> {
        let state = self.state.lock().await;
        state
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| IndexerError::NotFound(format!("transaction {txid}")))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Hash, IndexerError> {
        let txid = tx.txid();
        let mut state = self.state.lock().await;
        if state.is_known(&txid) {
            return Ok(txid);
        }
        self.validate(&state, tx).map_err(IndexerError::Rejected)?;
        state.claimed.insert(tx.input);
        state.mempool.push(tx.clone());
        debug!("Accepted {} into the mempool", txid);
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::PrivateKey;
    use crate::protocol::commitment::{HashlockTable, Player, Role};
    use crate::protocol::params::Params;
    use crate::protocol::script::WitnessItem;
    use crate::protocol::setup::Setup;
    use crate::protocol::transaction::CompiledGraph;
    use crate::virtual_machine::isa::Opcode;
    use crate::virtual_machine::program::{Instruction, Program};

    struct Fixture {
        vicky: PrivateKey,
        graph: CompiledGraph,
    }

    fn fixture() -> Fixture {
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
            amount: 10_000_000,
        };
        let prover: HashlockTable = Player::new(Role::Prover, &paul, setup.params).export();
        let verifier = Player::new(Role::Verifier, &vicky, setup.params).export();
        let graph = CompiledGraph::compile(&setup, &prover, &verifier).unwrap();
        Fixture { vicky, graph }
    }

    fn kick_off(f: &Fixture, key: &PrivateKey) -> Transaction {
        let signature = key.sign(f.graph.txid(0).as_slice());
        f.graph.spend(0, 0, vec![WitnessItem::Signature(signature)])
    }

    #[tokio::test]
    async fn funding_then_kick_off() {
        let f = fixture();
        let chain = LocalChain::new();
        let funding = chain.fund(f.graph.funding_transaction()).await;
        assert_eq!(chain.mine().await, 1);
        assert_eq!(chain.block_txids(&chain.block_at(1).await.unwrap()).await.unwrap(), vec![funding]);

        let txid = chain.broadcast(&kick_off(&f, &f.vicky)).await.unwrap();
        assert_eq!(txid, f.graph.txid(0));
        chain.mine().await;
        assert_eq!(chain.transaction(&txid).await.unwrap().input.txid, funding);
    }

    #[tokio::test]
    async fn rejects_bad_spends() {
        let f = fixture();
        let chain = LocalChain::new();

        // Nothing to spend yet.
        let err = chain.broadcast(&kick_off(&f, &f.vicky)).await.unwrap_err();
        assert!(matches!(err, IndexerError::Rejected(_)));

        chain.fund(f.graph.funding_transaction()).await;
        chain.mine().await;

        let forged = kick_off(&f, &PrivateKey::new());
        assert!(matches!(chain.broadcast(&forged).await, Err(IndexerError::Rejected(_))));

        let mut unproven = kick_off(&f, &f.vicky);
        if let Some(witness) = unproven.witness.as_mut() {
            witness.script.timelock = Some(0);
        }
        assert!(matches!(chain.broadcast(&unproven).await, Err(IndexerError::Rejected(_))));

        chain.broadcast(&kick_off(&f, &f.vicky)).await.unwrap();
        assert!(chain.block_at(9).await.is_err());
    }

    #[tokio::test]
    async fn timeouts_wait_for_depth() {
        let f = fixture();
        let chain = LocalChain::new();
        chain.fund(f.graph.funding_transaction()).await;
        chain.mine().await;
        chain.broadcast(&kick_off(&f, &f.vicky)).await.unwrap();
        chain.mine().await;

        // The verifier's timeout on the first trace response.
        let timeout = f
            .graph
            .children_of(0)
            .iter()
            .copied()
            .find(|c| f.graph.node(*c).node.kind.is_timeout())
            .unwrap();
        let signature = f.vicky.sign(f.graph.txid(timeout).as_slice());
        let tx = f.graph.spend(timeout, 0, vec![WitnessItem::Signature(signature)]);

        assert!(matches!(chain.broadcast(&tx).await, Err(IndexerError::Rejected(_))));
        chain.mine().await;
        assert_eq!(chain.broadcast(&tx).await.unwrap(), f.graph.txid(timeout));
    }
}
