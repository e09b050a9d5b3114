use std::fs;
use std::path::Path;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ChainError, ChainResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

/// SHA256 applied twice. All chain identities (block hashes, transaction
/// hashes) are double hashes of their canonical bytes.
pub fn double_hash(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

pub fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(stored.public_key)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> ChainResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

/// Derives the numeric key id used across the chain tables. The id is the
/// first eight bytes of SHA256(public key), big-endian, with the sign bit
/// cleared so ids stay positive in the 64-bit signed columns.
pub fn address_from_public_key(public_key: &PublicKey) -> i64 {
    address_from_key_bytes(public_key.as_bytes())
}

pub fn address_from_key_bytes(public_key: &[u8]) -> i64 {
    let digest = hash(public_key);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (i64::from_be_bytes(raw)) & i64::MAX
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))
}

pub fn public_key_from_bytes(data: &[u8]) -> ChainResult<PublicKey> {
    PublicKey::from_bytes(data)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

pub fn signature_from_bytes(data: &[u8]) -> ChainResult<Signature> {
    Signature::from_bytes(data)
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_hash_is_sha256_twice() {
        let data = b"palisade";
        let expected: [u8; 32] = Sha256::digest(Sha256::digest(data)).into();
        assert_eq!(double_hash(data), expected);
    }

    #[test]
    fn address_is_stable_and_positive() {
        let keypair = generate_keypair();
        let first = address_from_public_key(&keypair.public);
        let second = address_from_public_key(&keypair.public);
        assert_eq!(first, second);
        assert!(first >= 0);
    }

    #[test]
    fn keypair_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        let keypair = generate_keypair();
        save_keypair(&path, &keypair).expect("save");
        let loaded = load_keypair(&path).expect("load");
        assert_eq!(loaded.public.to_bytes(), keypair.public.to_bytes());
        let sig = sign_message(&loaded, b"message");
        verify_signature(&keypair.public, b"message", &sig).expect("verify");
    }
}
