//! The per-party dispute loop.
//!
//! On every tick a [`Client`] scans the blocks confirmed since its last
//! tick, follows the game along the graph (learning whatever the opponent
//! revealed), and then executes at most one move: the first leaf, among
//! the children of a live output whose actor is the local party, that its
//! [`Model`] can satisfy right now.

use crate::network::indexer::{ChainIndexer, IndexerError};
use crate::protocol::commitment::Role;
use crate::protocol::model::Model;
use crate::protocol::script::{EvalContext, Interpreter, ScriptEngine};
use crate::protocol::transaction::{CompiledGraph, Outpoint};
use crate::types::hash::Hash;
use crate::{debug, error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// An unspent output of the game: who created it and when.
#[derive(Debug, Clone, Copy)]
struct Live {
    /// Graph node that created the output; `None` for the funding output.
    node: Option<usize>,
    height: u64,
}

pub struct Client {
    indexer: Arc<dyn ChainIndexer>,
    graph: Arc<CompiledGraph>,
    model: Model,
    engine: Interpreter,
    /// Next block height to scan.
    scanned: u64,
    live: BTreeMap<Outpoint, Live>,
    /// Outputs this party already broadcast a spend for.
    pending: HashSet<Outpoint>,
    winner: Option<Role>,
}

impl Client {
    pub fn new(indexer: Arc<dyn ChainIndexer>, graph: Arc<CompiledGraph>, model: Model) -> Self {
        Self {
            indexer,
            graph,
            model,
            engine: Interpreter,
            scanned: 0,
            live: BTreeMap::new(),
            pending: HashSet::new(),
            winner: None,
        }
    }

    pub fn role(&self) -> Role {
        self.model.role()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The party whose terminal transaction confirmed, once the game is over.
    pub fn winner(&self) -> Option<Role> {
        self.winner
    }

    /// Scans new blocks, then executes at most one move. Returns the txid
    /// of the broadcast spend, if any.
    pub async fn tick(&mut self) -> Result<Option<Hash>, IndexerError> {
        let tip = self.indexer.latest_height().await?;
        while self.scanned <= tip {
            self.scan(self.scanned).await?;
            self.scanned += 1;
        }
        if self.winner.is_some() {
            return Ok(None);
        }
        self.act(tip).await
    }

    async fn scan(&mut self, height: u64) -> Result<(), IndexerError> {
        let block = self.indexer.block_at(height).await?;
        let funding = self.graph.funding_transaction().txid();
        for txid in self.indexer.block_txids(&block).await? {
            if txid == funding {
                debug!("{}: funding {} confirmed at {}", self.role(), txid, height);
                self.live.insert(Outpoint { txid, vout: 0 }, Live { node: None, height });
                continue;
            }
            let Some(index) = self.graph.find(&txid) else {
                continue;
            };
            let tx = self.indexer.transaction(&txid).await?;
            if let Some(witness) = &tx.witness {
                self.model.learn(&witness.items);
            }
            self.live.remove(&tx.input);
            self.pending.remove(&tx.input);
            self.live.insert(
                Outpoint { txid, vout: 0 },
                Live {
                    node: Some(index),
                    height,
                },
            );

            let node = self.graph.node(index);
            info!("{}: {} confirmed at height {}", self.role(), node.node, height);
            if node.children.is_empty() {
                self.winner = Some(node.actor);
                info!("{}: dispute settled, {} wins", self.role(), node.actor);
            }
        }
        Ok(())
    }

    async fn act(&mut self, tip: u64) -> Result<Option<Hash>, IndexerError> {
        let role = self.role();
        let live: Vec<(Outpoint, Live)> = self
            .live
            .iter()
            .filter(|(outpoint, _)| !self.pending.contains(outpoint))
            .map(|(outpoint, live)| (*outpoint, *live))
            .collect();

        for (outpoint, live) in live {
            let age = tip.saturating_sub(live.height);
            let children = match live.node {
                Some(index) => self.graph.children_of(index).to_vec(),
                None => vec![0],
            };
            for child in children {
                let node = self.graph.node(child);
                if node.actor != role || age < u64::from(node.sequence) {
                    continue;
                }
                let sighash = self.graph.txid(child);
                let ctx = EvalContext {
                    sighash,
                    sequence: node.sequence,
                };
                for (i, leaf) in node.leaves.iter().enumerate() {
                    let script = &node.scripts[i];
                    let Ok(items) = leaf.unlock(script, &self.model, &sighash) else {
                        continue;
                    };
                    // Dry run: only broadcast what the ledger will accept.
                    if !self.engine.evaluate(script, &items, &ctx).success {
                        continue;
                    }

                    let tx = self.graph.spend(child, i, items);
                    match self.indexer.broadcast(&tx).await {
                        Ok(txid) => {
                            info!("{}: executed {} via {:?}", role, node.node, leaf);
                            self.pending.insert(outpoint);
                            return Ok(Some(txid));
                        }
                        Err(err) if err.is_transient() => return Err(err),
                        Err(err) => {
                            error!("{}: broadcast of {} rejected: {}", role, node.node, err);
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Ticks every `period` until the game is settled or `shutdown` fires.
    pub async fn listen(
        &mut self,
        period: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> Option<Role> {
        let mut ticker = interval(period);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!("{}: tick failed, retrying next block: {}", self.role(), err);
                    }
                    if self.winner.is_some() {
                        break;
                    }
                }
                _ = &mut shutdown => {
                    info!("{}: shutting down", self.role());
                    break;
                }
            }
        }
        self.winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::PrivateKey;
    use crate::network::local_chain::LocalChain;
    use crate::protocol::commitment::{Channel, Player};
    use crate::protocol::params::Params;
    use crate::protocol::setup::Setup;
    use crate::virtual_machine::isa::Opcode;
    use crate::virtual_machine::program::{Instruction, Program};
    use crate::virtual_machine::vm::{self, Snapshot, Trace};

    struct Game {
        chain: Arc<LocalChain>,
        paul: Client,
        vicky: Client,
    }

    fn game(cheat: bool) -> Game {
        let program = Program::new(vec![Instruction::new(Opcode::Add, 0, 1, 2)]);
        game_with(program, vec![5, 7], |_, honest| {
            if cheat {
                let wrong = honest.last().memory.get(2).wrapping_add(1);
                rewrite_last(honest, 2, wrong)
            } else {
                honest
            }
        })
    }

    /// A game in which the prover claims `claim(setup, honest)`.
    fn game_with(
        program: Program,
        memory: Vec<u32>,
        claim: impl FnOnce(&Setup, Trace) -> Trace,
    ) -> Game {
        let paul_key = PrivateKey::new();
        let vicky_key = PrivateKey::new();
        let setup = Setup {
            params: Params {
                log_trace_len: 2,
                log_path_len: 2,
                ..Params::default()
            },
            program,
            memory,
            prover: paul_key.public_key(),
            verifier: vicky_key.public_key(),
            amount: 10_000_000,
        };
        let paul_table = Player::new(Role::Prover, &paul_key, setup.params).export();
        let vicky_table = Player::new(Role::Verifier, &vicky_key, setup.params).export();
        let graph = Arc::new(CompiledGraph::compile(&setup, &paul_table, &vicky_table).unwrap());

        let trace = claim(&setup, setup.run().unwrap());
        let paul = Model::new(Role::Prover, setup.clone(), paul_key, vicky_table, trace);
        let vicky = Model::honest(Role::Verifier, setup, vicky_key, paul_table).unwrap();

        let chain = Arc::new(LocalChain::new());
        let indexer: Arc<dyn ChainIndexer> = chain.clone();
        Game {
            paul: Client::new(indexer.clone(), graph.clone(), paul),
            vicky: Client::new(indexer, graph, vicky),
            chain,
        }
    }

    /// `trace` with `address` of the final state set to `value`.
    fn rewrite_last(trace: Trace, address: u32, value: u32) -> Trace {
        let mut snapshots: Vec<Snapshot> = trace.snapshots().to_vec();
        let last = snapshots.len() - 1;
        snapshots[last].memory.set(address, value);
        Trace::from_snapshots(snapshots, *trace.config())
    }

    /// Plays block by block until both parties agree on a winner.
    async fn play(g: &mut Game) -> Role {
        g.chain.fund(g.paul.graph.funding_transaction()).await;
        g.chain.mine().await;
        for _ in 0..64 {
            g.paul.tick().await.unwrap();
            g.vicky.tick().await.unwrap();
            g.chain.mine().await;
            if let (Some(a), Some(b)) = (g.paul.winner(), g.vicky.winner()) {
                assert_eq!(a, b);
                return a;
            }
        }
        panic!("dispute did not settle");
    }

    #[tokio::test]
    async fn honest_prover_wins_by_timeout() {
        let mut g = game(false);
        assert_eq!(play(&mut g).await, Role::Prover);
        assert_eq!(g.vicky.model().trace_index(), Some(3));
    }

    #[tokio::test]
    async fn wrong_add_result_is_disproved() {
        let mut g = game(true);
        assert_eq!(play(&mut g).await, Role::Verifier);
        assert_eq!(g.paul.model().trace_index(), Some(0));
    }

    #[tokio::test]
    async fn one_move_per_tick() {
        let mut g = game(false);
        g.chain.fund(g.vicky.graph.funding_transaction()).await;
        g.chain.mine().await;

        let kick_off = g.vicky.tick().await.unwrap();
        assert_eq!(kick_off, Some(g.vicky.graph.txid(0)));
        // Already spending the funding output; nothing else to do until it confirms.
        assert_eq!(g.vicky.tick().await.unwrap(), None);
        assert_eq!(g.paul.tick().await.unwrap(), None);

        g.chain.mine().await;
        assert!(g.paul.tick().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wrong_read_is_disputed_down_to_the_initial_root() {
        // The prover runs the program over a different input cell, so every
        // claim it makes is self-consistent except the operand it read.
        for (channel, address) in [(Channel::A, 0u32), (Channel::B, 1)] {
            let program = Program::new(vec![Instruction::new(Opcode::Add, 0, 1, 2)]);
            let mut g = game_with(program, vec![5, 7], |setup, _| {
                let mut memory = setup.memory.clone();
                memory[address as usize] += 1;
                vm::run(
                    &setup.program,
                    &memory,
                    setup.params.max_steps(),
                    setup.params.vm_config(),
                )
                .unwrap()
            });
            assert_eq!(play(&mut g).await, Role::Verifier, "{channel:?}");
            assert_eq!(g.vicky.model().trace_index(), Some(0));
            assert_eq!(g.vicky.model().challenge(), Some(channel));
        }
    }

    #[tokio::test]
    async fn wrong_writes_at_the_address_bounds_are_disproved() {
        // The result lands where it should, but a neighbouring cell of the
        // final state is corrupted, so only the memory bisection can tell.
        let top = (1u32 << 4) - 1;
        for (target, neighbour) in [(0, 1), (top, top - 1), (0, top), (top, 0)] {
            let program = Program::new(vec![Instruction::new(Opcode::Add, 0, 1, target)]);
            let mut g = game_with(program, vec![5, 7], |_, honest| {
                let wrong = honest.last().memory.get(neighbour).wrapping_add(1);
                rewrite_last(honest, neighbour, wrong)
            });
            assert_eq!(play(&mut g).await, Role::Verifier, "{target} {neighbour}");
            assert_eq!(g.vicky.model().trace_index(), Some(0));
            assert_eq!(g.vicky.model().challenge(), Some(Channel::C));
        }
    }

    #[tokio::test]
    async fn mid_trace_write_is_pinned() {
        let program = Program::new(vec![
            Instruction::new(Opcode::Add, 0, 1, 2),
            Instruction::new(Opcode::Add, 2, 2, 3),
            Instruction::new(Opcode::Xor, 3, 0, 4),
        ]);
        let mut g = game_with(program, vec![5, 7], |_, honest| {
            let mut snapshots: Vec<Snapshot> = honest.snapshots().to_vec();
            for snapshot in &mut snapshots[2..] {
                snapshot.memory.set(9, 1);
            }
            Trace::from_snapshots(snapshots, *honest.config())
        });
        assert_eq!(play(&mut g).await, Role::Verifier);
        assert_eq!(g.paul.model().trace_index(), Some(1));
        assert_eq!(g.vicky.model().trace_index(), Some(1));
    }
}
