//! Schnorr key pairs on secp256k1.
//!
//! Each party holds one [`PrivateKey`]. It signs every spend the party makes
//! and, through [`PrivateKey::commitment_secret`], seeds the party's
//! commitment preimages. Keys are persisted encrypted under
//! `~/.bitdispute/<name>/party.key`.

use crate::info;
use crate::types::bytes::hex_decode;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::types::hash::Hash;
use argon2::Argon2;
use bitdispute_derive::Error;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

/// x-only public key.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature(k256::schnorr::Signature);

impl PrivateKey {
    pub fn new() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// `None` if `bytes` is not a valid secp256k1 scalar.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes).ok().map(|key| Self { key })
    }

    fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes().into())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: *self.key.verifying_key(),
        }
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.key.sign(data))
    }

    /// Secret that seeds this party's commitment preimages.
    pub fn commitment_secret(&self) -> Zeroizing<[u8; 32]> {
        let mut h = Hash::sha3();
        h.update(b"BITDISPUTE_COMMITMENT_SECRET");
        h.update(self.to_bytes().as_ref());
        Zeroizing::new(h.finalize().0)
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicKey {
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        self.key.verify(data, &signature.0).is_ok()
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.to_bytes().into()
    }

    pub fn from_hex(text: &str) -> Option<PublicKey> {
        let raw = hex_decode(text)?;
        PublicKey::from_bytes(&raw).ok()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey, DecodeError> {
        VerifyingKey::from_bytes(bytes)
            .map(|key| PublicKey { key })
            .map_err(|_| DecodeError::InvalidValue)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(..)")
    }
}

impl Encode for PublicKey {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.to_bytes());
    }
}

impl Decode for PublicKey {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let raw = <[u8; PUBLIC_KEY_LEN]>::decode(input)?;
        PublicKey::from_bytes(&raw)
    }
}

impl Encode for Signature {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.0.to_bytes());
    }
}

impl Decode for Signature {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let raw = <[u8; SIGNATURE_LEN]>::decode(input)?;
        k256::schnorr::Signature::try_from(raw.as_slice())
            .map(Signature)
            .map_err(|_| DecodeError::InvalidValue)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encrypted key files
// ─────────────────────────────────────────────────────────────────────────────

const KEY_FILE_MAGIC: &[u8; 4] = b"BDPK";
const KEY_FILE_VERSION: u8 = 1;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file i/o failed: {0}")]
    Io(io::Error),
    #[error("cannot determine home directory")]
    NoHomeDir,
    #[error("malformed key file: {0}")]
    Malformed(&'static str),
    #[error("decryption failed: wrong passphrase or corrupt file")]
    Decrypt,
    #[error("key derivation failed")]
    Kdf,
}

impl From<io::Error> for KeyError {
    fn from(err: io::Error) -> Self {
        KeyError::Io(err)
    }
}

/// `~/.bitdispute/<name>/party.key`
pub fn party_key_path(name: &str) -> Result<PathBuf, KeyError> {
    let home = dirs::home_dir().ok_or(KeyError::NoHomeDir)?;
    Ok(home.join(".bitdispute").join(name).join("party.key"))
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase, salt, key.as_mut())
        .map_err(|_| KeyError::Kdf)?;
    Ok(key)
}

/// Writes `[magic][version][salt][nonce][ciphertext+tag]`.
pub fn save_key(key: &PrivateKey, path: &Path, passphrase: &[u8]) -> Result<(), KeyError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let derived = derive_key(passphrase, &salt)?;
    let cipher = XChaCha20Poly1305::new(derived.as_ref().into());
    let plaintext = key.to_bytes();
    let ciphertext = cipher
        .encrypt(nonce.as_ref().into(), plaintext.as_ref())
        .map_err(|_| KeyError::Malformed("encryption failed"))?;

    let mut data = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    data.extend_from_slice(KEY_FILE_MAGIC);
    data.push(KEY_FILE_VERSION);
    data.extend_from_slice(&salt);
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&ciphertext);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &data)?;
    info!("party key saved to {}", path.display());
    Ok(())
}

pub fn load_key(path: &Path, passphrase: &[u8]) -> Result<PrivateKey, KeyError> {
    let data = fs::read(path)?;
    if data.len() < HEADER_LEN + TAG_LEN {
        return Err(KeyError::Malformed("file too short"));
    }
    if &data[0..4] != KEY_FILE_MAGIC {
        return Err(KeyError::Malformed("bad magic"));
    }
    if data[4] != KEY_FILE_VERSION {
        return Err(KeyError::Malformed("unsupported version"));
    }

    let salt = &data[5..5 + SALT_LEN];
    let nonce = &data[5 + SALT_LEN..HEADER_LEN];
    let derived = derive_key(passphrase, salt)?;
    let cipher = XChaCha20Poly1305::new(derived.as_ref().into());
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(nonce.into(), &data[HEADER_LEN..])
            .map_err(|_| KeyError::Decrypt)?,
    );

    let bytes: &[u8; 32] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::Malformed("bad key length"))?;
    PrivateKey::from_bytes(bytes).ok_or(KeyError::Malformed("invalid scalar"))
}

/// Loads the key at `path`, or generates and saves a fresh one.
pub fn load_or_generate_key(path: &Path, passphrase: &[u8]) -> Result<PrivateKey, KeyError> {
    if path.exists() {
        info!("loading party key from {}", path.display());
        load_key(path, passphrase)
    } else {
        info!("generating new party key");
        let key = PrivateKey::new();
        save_key(&key, path, passphrase)?;
        Ok(key)
    }
}
