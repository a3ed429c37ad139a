//! The agreement both parties sign up to before a dispute: parameters,
//! program, initial memory, keys and the amount at stake.

use crate::crypto::key_pair::PublicKey;
use crate::protocol::commitment::Role;
use crate::protocol::params::{Params, ParamsError};
use crate::types::encoding::{Decode, DecodeError, Encode};
use crate::types::hash::Hash;
use crate::types::merkle_tree::Node;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::program::Program;
use crate::virtual_machine::vm::{self, Memory, Trace};
use bitdispute_derive::{BinaryCodec, Error};
use std::fs;
use std::io;
use std::path::Path;

const SETUP_MAGIC: &[u8; 4] = b"BDST";
const SETUP_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid parameters: {0}")]
    Params(ParamsError),
    #[error("invalid program: {0}")]
    Vm(VmError),
    #[error("prover and verifier must use different keys")]
    SameKeys,
    #[error("setup file i/o failed: {0}")]
    Io(io::Error),
    #[error("malformed setup file: {0}")]
    Decode(DecodeError),
}

impl From<ParamsError> for SetupError {
    fn from(err: ParamsError) -> Self {
        SetupError::Params(err)
    }
}

impl From<VmError> for SetupError {
    fn from(err: VmError) -> Self {
        SetupError::Vm(err)
    }
}

impl From<io::Error> for SetupError {
    fn from(err: io::Error) -> Self {
        SetupError::Io(err)
    }
}

impl From<DecodeError> for SetupError {
    fn from(err: DecodeError) -> Self {
        SetupError::Decode(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Setup {
    pub params: Params,
    pub program: Program,
    /// Initial memory, from address 0; the rest is zero.
    pub memory: Vec<u32>,
    pub prover: PublicKey,
    pub verifier: PublicKey,
    /// Value locked by the funding output.
    pub amount: u64,
}

impl Setup {
    pub fn validate(&self) -> Result<(), SetupError> {
        self.params.validate()?;
        let config = self.params.vm_config();
        self.program.validate(config.address_bits)?;
        if config.address_bits < 32 && (self.memory.len() as u64) > (1u64 << config.address_bits) {
            return Err(VmError::MemoryTooLarge {
                len: self.memory.len(),
                bits: config.address_bits,
            }
            .into());
        }
        if self.prover == self.verifier {
            return Err(SetupError::SameKeys);
        }
        Ok(())
    }

    pub fn id(&self) -> Hash {
        Hash::tagged(b"SETUP", self)
    }

    pub fn key(&self, role: Role) -> PublicKey {
        match role {
            Role::Prover => self.prover,
            Role::Verifier => self.verifier,
        }
    }

    pub fn initial_root(&self) -> Node {
        Memory::from_words(&self.memory).root(self.params.path_len())
    }

    /// The honest execution both parties derive their claims from.
    pub fn run(&self) -> Result<Trace, VmError> {
        vm::run(
            &self.program,
            &self.memory,
            self.params.max_steps(),
            self.params.vm_config(),
        )
    }

    pub fn to_file_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.encoded_len());
        out.extend_from_slice(SETUP_MAGIC);
        out.push(SETUP_VERSION);
        self.encode(&mut out);
        out
    }

    pub fn from_file_bytes(data: &[u8]) -> Result<Setup, DecodeError> {
        if data.len() < 5 || &data[..4] != SETUP_MAGIC || data[4] != SETUP_VERSION {
            return Err(DecodeError::InvalidValue);
        }
        Setup::from_bytes(&data[5..])
    }

    pub fn save(&self, path: &Path) -> Result<(), SetupError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_file_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Setup, SetupError> {
        let setup = Setup::from_file_bytes(&fs::read(path)?)?;
        setup.validate()?;
        Ok(setup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::PrivateKey;
    use crate::types::merkle_tree::build_tree;
    use crate::virtual_machine::isa::Opcode;
    use crate::virtual_machine::program::Instruction;

    fn setup() -> Setup {
        Setup {
            params: Params {
                log_trace_len: 2,
                log_path_len: 2,
                ..Params::default()
            },
            program: Program::new(vec![Instruction::new(Opcode::Add, 0, 1, 2)]),
            memory: vec![5, 7],
            prover: PrivateKey::new().public_key(),
            verifier: PrivateKey::new().public_key(),
            amount: 100_000,
        }
    }

    #[test]
    fn validates() {
        let good = setup();
        good.validate().unwrap();
        assert_eq!(good.initial_root(), build_tree(&[5, 7], 4));

        let mut same = setup();
        same.verifier = same.prover;
        assert!(matches!(same.validate(), Err(SetupError::SameKeys)));

        let mut big = setup();
        big.memory = vec![1; 17];
        assert!(matches!(big.validate(), Err(SetupError::Vm(VmError::MemoryTooLarge { .. }))));

        let mut wide = setup();
        wide.program = Program::new(vec![Instruction::new(Opcode::Add, 0, 1, 16)]);
        assert!(matches!(wide.validate(), Err(SetupError::Vm(_))));
    }

    #[test]
    fn honest_run() {
        let trace = setup().run().unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.last().memory.get(2), 12);
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.setup");
        let original = setup();
        original.save(&path).unwrap();
        let loaded = Setup::load(&path).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.id(), original.id());
    }
}
