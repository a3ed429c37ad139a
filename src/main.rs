//! Command-line front end of the dispute engine.
//!
//! # Usage
//! ```text
//! bitdispute <command> [ARGS] [OPTIONS]
//! ```
//!
//! A typical game between two machines:
//!
//! 1. both parties run `keygen` and swap public keys;
//! 2. one of them runs `setup` and shares the setup file;
//! 3. each party runs `export` and sends its hashlock table to the other;
//! 4. someone hosts a ledger with `chain`;
//! 5. both parties `run` against it.
//!
//! # Identity
//! Party keys are stored encrypted at `~/.bitdispute/{name}/party.key`.
//! The passphrase is read from the `BITDISPUTE_PASSPHRASE` env var, or
//! prompted if not set.

use bitdispute::crypto::key_pair::{
    PrivateKey, PublicKey, load_key, load_or_generate_key, party_key_path,
};
use bitdispute::network::indexer::{ChainIndexer, RetryingIndexer};
use bitdispute::network::local_chain::LocalChain;
use bitdispute::network::remote::{ChainServer, RemoteIndexer};
use bitdispute::network::scheduler::Client;
use bitdispute::protocol::commitment::{HashlockTable, Player, Role};
use bitdispute::protocol::model::Model;
use bitdispute::protocol::params::Params;
use bitdispute::protocol::setup::Setup;
use bitdispute::protocol::transaction::CompiledGraph;
use bitdispute::utils::log::{Level, set_min_level};
use bitdispute::virtual_machine::program::{Program, parse_memory};
use bitdispute::{error, info, warn};
use rpassword::prompt_password;
use std::env;
use std::fmt::Display;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use zeroize::Zeroizing;

const DEFAULT_AMOUNT: u64 = 10_000_000;
const DEFAULT_BLOCK_TIME_MS: u64 = 1000;
/// Upper bound on simulated blocks; a game needs far fewer.
const SIMULATION_BLOCKS: usize = 4096;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let mut options = Options::parse(&args[0], &args[2..]);
    if options.flag("--verbose") {
        set_min_level(Level::Debug);
    }

    match args[1].as_str() {
        "keygen" => keygen(&mut options),
        "setup" => setup(&mut options),
        "export" => export(&mut options),
        "trace" => trace(&mut options),
        "chain" => chain(&mut options).await,
        "run" => run(&mut options).await,
        "simulate" => simulate(&mut options).await,
        other => {
            eprintln!("Unknown command: {}\n", other);
            print_usage(&args[0]);
            process::exit(1);
        }
    }
}

/// Prints `message` and exits with a failure status.
fn fail(message: impl Display) -> ! {
    eprintln!("{message}");
    process::exit(1);
}

/// Options that never take a value.
const FLAGS: &[&str] = &["--memory", "--verbose"];

/// Positional arguments plus `--name value` options and bare flags.
struct Options {
    program: String,
    positional: Vec<String>,
    named: Vec<(String, Option<String>)>,
}

impl Options {
    fn parse(program: &str, args: &[String]) -> Self {
        let mut positional = Vec::new();
        let mut named = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if FLAGS.contains(&arg.as_str()) {
                named.push((arg.clone(), None));
            } else if arg.starts_with("--") {
                let value = args.get(i + 1).filter(|next| !next.starts_with("--")).cloned();
                if value.is_some() {
                    i += 1;
                }
                named.push((arg.clone(), value));
            } else {
                positional.push(arg.clone());
            }
            i += 1;
        }
        Self {
            program: program.to_string(),
            positional,
            named,
        }
    }

    fn positional(&self, index: usize, name: &str) -> &str {
        match self.positional.get(index) {
            Some(value) => value,
            None => {
                eprintln!("Missing argument <{name}>\n");
                print_usage(&self.program);
                process::exit(1);
            }
        }
    }

    fn flag(&mut self, name: &str) -> bool {
        let before = self.named.len();
        self.named.retain(|(option, value)| option != name || value.is_some());
        self.named.len() != before
    }

    fn value<T: FromStr>(&mut self, name: &str) -> Option<T> {
        let index = self.named.iter().position(|(option, _)| option == name)?;
        let (_, value) = self.named.remove(index);
        let Some(text) = value else {
            fail(format!("{name} requires an argument"));
        };
        match text.parse() {
            Ok(value) => Some(value),
            Err(_) => fail(format!("Invalid value for {name}: {text}")),
        }
    }
}

fn passphrase(name: &str) -> Zeroizing<String> {
    let passphrase = Zeroizing::new(env::var("BITDISPUTE_PASSPHRASE").unwrap_or_else(|_| {
        prompt_password(format!("Enter passphrase for party '{name}': ")).unwrap_or_else(|e| {
            error!("{e}");
            process::exit(1);
        })
    }));
    if passphrase.is_empty() {
        fail("Passphrase cannot be empty");
    }
    passphrase
}

fn key_path(name: &str) -> PathBuf {
    party_key_path(name).unwrap_or_else(|e| fail(format!("Failed to locate key file: {e}")))
}

fn read_text(path: &str) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| fail(format!("Failed to read {path}: {e}")))
}

fn load_setup(path: &str) -> Setup {
    Setup::load(Path::new(path)).unwrap_or_else(|e| fail(format!("Failed to load setup: {e}")))
}

fn load_table(path: &str) -> HashlockTable {
    HashlockTable::load(Path::new(path))
        .unwrap_or_else(|e| fail(format!("Failed to load hashlock table: {e}")))
}

fn load_party(name: &str) -> PrivateKey {
    let passphrase = passphrase(name);
    load_key(&key_path(name), passphrase.as_bytes())
        .unwrap_or_else(|e| fail(format!("Failed to load key for '{name}': {e}")))
}

/// Which side of `setup` the key belongs to.
fn role_of(setup: &Setup, key: &PrivateKey) -> Role {
    let public = key.public_key();
    if public == setup.prover {
        Role::Prover
    } else if public == setup.verifier {
        Role::Verifier
    } else {
        fail("Key is neither the prover's nor the verifier's in this setup")
    }
}

fn params(options: &mut Options) -> Params {
    let mut params = Params::default();
    if let Some(value) = options.value("--log-trace-len") {
        params.log_trace_len = value;
    }
    if let Some(value) = options.value("--log-path-len") {
        params.log_path_len = value;
    }
    if let Some(value) = options.value("--timeout") {
        params.timeout = value;
    }
    if let Some(value) = options.value("--min-fees") {
        params.min_fees = value;
    }
    params
}

fn keygen(options: &mut Options) {
    let name = options.positional(0, "name").to_string();
    let passphrase = passphrase(&name);
    let path = key_path(&name);
    let key = load_or_generate_key(&path, passphrase.as_bytes())
        .unwrap_or_else(|e| fail(format!("Failed to load or generate key: {e}")));
    println!("{}", key.public_key());
}

fn setup(options: &mut Options) {
    let program_path = options.positional(0, "program").to_string();
    let memory_path = options.positional(1, "memory").to_string();
    let prover = options.positional(2, "prover").to_string();
    let verifier = options.positional(3, "verifier").to_string();
    let out = options.positional(4, "out").to_string();

    let program = Program::parse(&read_text(&program_path))
        .unwrap_or_else(|e| fail(format!("Failed to parse {program_path}: {e}")));
    let memory = parse_memory(&read_text(&memory_path))
        .unwrap_or_else(|e| fail(format!("Failed to parse {memory_path}: {e}")));
    let public = |text: &str| {
        PublicKey::from_hex(text).unwrap_or_else(|| fail(format!("Invalid public key: {text}")))
    };

    let setup = Setup {
        params: params(options),
        program,
        memory,
        prover: public(&prover),
        verifier: public(&verifier),
        amount: options.value("--amount").unwrap_or(DEFAULT_AMOUNT),
    };
    if let Err(e) = setup.validate() {
        fail(format!("Invalid setup: {e}"));
    }
    if let Err(e) = setup.save(Path::new(&out)) {
        fail(format!("Failed to write {out}: {e}"));
    }
    info!("Setup {} written to {}", setup.id(), out);
    println!("{}", setup.id());
}

fn export(options: &mut Options) {
    let name = options.positional(0, "name").to_string();
    let setup = load_setup(options.positional(1, "setup"));
    let out = options.positional(2, "out").to_string();

    let key = load_party(&name);
    let role = role_of(&setup, &key);
    let table = Player::new(role, &key, setup.params).export();
    if let Err(e) = table.save(Path::new(&out)) {
        fail(format!("Failed to write {out}: {e}"));
    }
    info!("Exported the {} hashlock table to {}", role, out);
}

fn trace(options: &mut Options) {
    let setup = load_setup(options.positional(0, "setup"));
    let show_memory = options.flag("--memory");
    let trace = setup
        .run()
        .unwrap_or_else(|e| fail(format!("Failed to run the program: {e}")));
    for (index, snapshot) in trace.snapshots().iter().enumerate() {
        println!(
            "step {:>4}  pc {:>4}  root {:?}",
            snapshot.step,
            snapshot.pc,
            trace.root(index)
        );
        if show_memory {
            for (address, value) in snapshot.memory.cells() {
                println!("           [{address}] = {value}");
            }
        }
    }
}

async fn chain(options: &mut Options) {
    let listen: SocketAddr = options
        .positional(0, "listen_addr")
        .parse()
        .unwrap_or_else(|_| fail("Invalid listen address"));
    let block_time = options.value("--block-time").unwrap_or(DEFAULT_BLOCK_TIME_MS);

    let ledger = Arc::new(LocalChain::new());
    let server = ChainServer::bind(listen, ledger.clone())
        .await
        .unwrap_or_else(|e| fail(format!("Failed to bind {listen}: {e}")));
    info!("Ledger listening on {}", listen);
    let server_handle = tokio::spawn(server.serve());

    let miner = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(block_time));
        loop {
            ticker.tick().await;
            ledger.mine().await;
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to setup Ctrl+C handler: {}", e);
        return;
    }
    info!("Ctrl+C received, shutting down...");
    miner.abort();
    server_handle.abort();
}

async fn run(options: &mut Options) {
    let name = options.positional(0, "name").to_string();
    let setup = load_setup(options.positional(1, "setup"));
    let opponent = load_table(options.positional(2, "opponent_table"));
    let chain: SocketAddr = options
        .value("--chain")
        .unwrap_or_else(|| fail("--chain <addr> is required"));
    let period = Duration::from_millis(options.value("--poll").unwrap_or(DEFAULT_BLOCK_TIME_MS));

    let key = load_party(&name);
    let role = role_of(&setup, &key);
    let own = Player::new(role, &key, setup.params).export();
    let (prover, verifier) = match role {
        Role::Prover => (&own, &opponent),
        Role::Verifier => (&opponent, &own),
    };
    let graph = CompiledGraph::compile(&setup, prover, verifier)
        .unwrap_or_else(|e| fail(format!("Failed to compile the graph: {e}")));
    let graph = Arc::new(graph);
    let model = Model::honest(role, setup, key, opponent)
        .unwrap_or_else(|e| fail(format!("Failed to run the program: {e}")));

    let indexer = Arc::new(RetryingIndexer::new(RemoteIndexer::new(chain)));
    match indexer.inner().fund(graph.funding_transaction()).await {
        Ok(txid) => info!("Funding transaction {}", txid),
        Err(e) => fail(format!("Failed to fund the game: {e}")),
    }

    let shared: Arc<dyn ChainIndexer> = indexer;
    let mut client = Client::new(shared, graph, model);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to setup Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };
    match client.listen(period, shutdown).await {
        Some(winner) => println!("{winner} wins"),
        None => println!("game interrupted"),
    }
}

async fn simulate(options: &mut Options) {
    let program_path = options.positional(0, "program").to_string();
    let memory_path = options.positional(1, "memory").to_string();
    let program = Program::parse(&read_text(&program_path))
        .unwrap_or_else(|e| fail(format!("Failed to parse {program_path}: {e}")));
    let memory = parse_memory(&read_text(&memory_path))
        .unwrap_or_else(|e| fail(format!("Failed to parse {memory_path}: {e}")));

    let paul = PrivateKey::new();
    let vicky = PrivateKey::new();
    let setup = Setup {
        params: params(options),
        program,
        memory,
        prover: paul.public_key(),
        verifier: vicky.public_key(),
        amount: options.value("--amount").unwrap_or(DEFAULT_AMOUNT),
    };
    let paul_table = Player::new(Role::Prover, &paul, setup.params).export();
    let vicky_table = Player::new(Role::Verifier, &vicky, setup.params).export();
    let graph = CompiledGraph::compile(&setup, &paul_table, &vicky_table)
        .unwrap_or_else(|e| fail(format!("Failed to compile the graph: {e}")));
    info!("Compiled {} transactions", graph.len());
    let graph = Arc::new(graph);

    let honest = |role: Role, key: PrivateKey, table: HashlockTable| {
        Model::honest(role, setup.clone(), key, table)
            .unwrap_or_else(|e| fail(format!("Failed to run the program: {e}")))
    };
    let ledger = Arc::new(LocalChain::new());
    let indexer: Arc<dyn ChainIndexer> = ledger.clone();
    let mut clients = [
        Client::new(indexer.clone(), graph.clone(), honest(Role::Prover, paul, vicky_table)),
        Client::new(indexer, graph.clone(), honest(Role::Verifier, vicky, paul_table)),
    ];

    ledger.fund(graph.funding_transaction()).await;
    ledger.mine().await;
    for _ in 0..SIMULATION_BLOCKS {
        for client in clients.iter_mut() {
            if let Err(e) = client.tick().await {
                fail(format!("{} failed: {e}", client.role()));
            }
        }
        ledger.mine().await;
        if let Some(winner) = clients[0].winner() {
            println!("{winner} wins");
            return;
        }
    }
    fail("Game did not settle");
}

const USAGE: &str = "\
Bisection dispute engine

USAGE:
    {program} <command> [ARGS] [OPTIONS]

COMMANDS:
    keygen <name>
        Generate (or load) the party key <name> and print its public key
    setup <program> <memory> <prover> <verifier> <out>
        Write a setup file for a program, its initial memory and both public keys
    export <name> <setup> <out>
        Write the hashlock table of party <name> for <setup>
    trace <setup>
        Print every snapshot of the program's execution
    chain <listen_addr>
        Host an in-process ledger over TCP
    run <name> <setup> <opponent_table> --chain <addr>
        Play the game as party <name>
    simulate <program> <memory>
        Play an honest game between two fresh parties in-process

OPTIONS:
    --log-trace-len <n>    Trace bisection rounds (setup, simulate; default 5)
    --log-path-len <n>     Memory path bisection rounds (setup, simulate; default 5)
    --timeout <blocks>     Relative timelock of timeout leaves (setup, simulate; default 1)
    --min-fees <n>         Fee deducted by every transaction (setup, simulate; default 5000)
    --amount <n>           Value locked by the funding output (setup, simulate)
    --memory               Also print memory cells (trace)
    --block-time <ms>      Mining period (chain; default 1000)
    --chain <addr>         Ledger address (run)
    --poll <ms>            Polling period (run; default 1000)
    --verbose              Log debug messages
    -h, --help             Print this help message

ENVIRONMENT:
    BITDISPUTE_PASSPHRASE    Passphrase for party key encryption (prompted interactively if not set)

EXAMPLES:
    # Alice proves, Bob verifies
    {program} keygen alice
    {program} keygen bob
    {program} setup add.prog add.mem <alice_pubkey> <bob_pubkey> game.setup
    {program} export alice game.setup alice.locks
    {program} export bob game.setup bob.locks

    {program} chain 127.0.0.1:4000
    {program} run alice game.setup bob.locks --chain 127.0.0.1:4000
    {program} run bob game.setup alice.locks --chain 127.0.0.1:4000

FILES:
    ~/.bitdispute/<name>/party.key
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
