use ed25519_dalek::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{double_hash, sign_message, signature_from_bytes, verify_signature};
use crate::errors::{ChainError, ChainResult};

use super::transaction::tx_hash_from_envelope;

pub const BLOCK_VERSION: u16 = 1;
pub const GENESIS_BLOCK_ID: u64 = 1;

const MAX_BLOCK_BYTES: u64 = 64 << 20;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_id: u64,
    pub time: i64,
    pub ecosystem_id: i64,
    pub key_id: i64,
    pub node_position: u16,
    pub version: u16,
    pub sign: Vec<u8>,
}

/// A full block: signed header plus the ordered raw transaction envelopes.
/// `prev_hash` chains to the parent's block hash; `rollbacks_hash` commits to
/// the rollback-log entries written while applying this block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub prev_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub rollbacks_hash: [u8; 32],
    pub transactions: Vec<Vec<u8>>,
    pub bin_data: Vec<u8>,
}

#[derive(Serialize)]
struct ForSign<'a> {
    block_id: u64,
    time: i64,
    ecosystem_id: i64,
    key_id: i64,
    node_position: u16,
    version: u16,
    prev_hash: &'a [u8; 32],
    merkle_root: &'a [u8; 32],
    rollbacks_hash: &'a [u8; 32],
}

impl Block {
    /// Canonical bytes covered by the header signature and the block hash.
    /// Everything except the signature itself.
    pub fn for_sign_bytes(&self) -> Vec<u8> {
        let payload = ForSign {
            block_id: self.header.block_id,
            time: self.header.time,
            ecosystem_id: self.header.ecosystem_id,
            key_id: self.header.key_id,
            node_position: self.header.node_position,
            version: self.header.version,
            prev_hash: &self.prev_hash,
            merkle_root: &self.merkle_root,
            rollbacks_hash: &self.rollbacks_hash,
        };
        bincode::serialize(&payload).expect("serializing block for-sign payload")
    }

    pub fn hash(&self) -> [u8; 32] {
        double_hash(&self.for_sign_bytes())
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        let signature = sign_message(keypair, &self.for_sign_bytes());
        self.header.sign = signature.to_bytes().to_vec();
    }

    pub fn verify_signature(&self, public_key: &PublicKey) -> ChainResult<()> {
        let signature = signature_from_bytes(&self.header.sign)?;
        verify_signature(public_key, &self.for_sign_bytes(), &signature)
    }

    pub fn to_bytes(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> ChainResult<Self> {
        if raw.len() as u64 > MAX_BLOCK_BYTES {
            return Err(ChainError::Block("block exceeds wire size cap".into()));
        }
        Ok(bincode::deserialize(raw)?)
    }

    pub fn tx_hashes(&self) -> ChainResult<Vec<[u8; 32]>> {
        self.transactions
            .iter()
            .map(|raw| tx_hash_from_envelope(raw))
            .collect()
    }

    pub fn size(&self) -> u64 {
        self.transactions.iter().map(|tx| tx.len() as u64).sum()
    }
}

/// Binary Merkle root over transaction hashes. Odd levels duplicate their
/// last leaf; a single leaf therefore hashes against itself.
pub fn merkle_root(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.is_empty() {
        return double_hash(&[]);
    }
    let mut level: Vec<[u8; 32]> = hashes.to_vec();
    loop {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&left);
            combined[32..].copy_from_slice(&right);
            next.push(double_hash(&combined));
        }
        level = next;
        if level.len() == 1 {
            return level[0];
        }
    }
}

/// Row of the `block_chain` table: the serialized block plus the indexed
/// header columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredBlock {
    pub id: u64,
    pub hash: [u8; 32],
    pub rollbacks_hash: [u8; 32],
    pub data: Vec<u8>,
    pub ecosystem_id: i64,
    pub key_id: i64,
    pub node_position: u16,
    pub time: i64,
    pub tx_count: u32,
}

impl StoredBlock {
    pub fn from_block(block: &Block) -> ChainResult<Self> {
        Ok(Self {
            id: block.header.block_id,
            hash: block.hash(),
            rollbacks_hash: block.rollbacks_hash,
            data: block.to_bytes()?,
            ecosystem_id: block.header.ecosystem_id,
            key_id: block.header.key_id,
            node_position: block.header.node_position,
            time: block.header.time,
            tx_count: block.transactions.len() as u32,
        })
    }
}

/// Singleton summary of the last applied block, updated atomically with each
/// commit and each rollback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InfoBlock {
    pub block_id: u64,
    pub hash: [u8; 32],
    pub rollbacks_hash: [u8; 32],
    pub key_id: i64,
    pub node_position: u16,
    pub time: i64,
    pub version: u16,
}

impl InfoBlock {
    pub fn from_block(block: &Block) -> Self {
        Self {
            block_id: block.header.block_id,
            hash: block.hash(),
            rollbacks_hash: block.rollbacks_hash,
            key_id: block.header.key_id,
            node_position: block.header.node_position,
            time: block.header.time,
            version: block.header.version,
        }
    }

    pub fn from_stored(record: &StoredBlock, version: u16) -> Self {
        Self {
            block_id: record.id,
            hash: record.hash,
            rollbacks_hash: record.rollbacks_hash,
            key_id: record.key_id,
            node_position: record.node_position,
            time: record.time,
            version,
        }
    }
}
