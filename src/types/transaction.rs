use std::collections::BTreeMap;

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    address_from_key_bytes, double_hash, public_key_from_bytes, sign_message,
    signature_from_bytes, verify_signature,
};
use crate::errors::{ChainError, ChainResult};

/// First byte of every transaction envelope on the wire.
pub const TX_MARKER: u8 = 0x80;

/// Admission horizons: how far in the past or future a transaction's declared
/// time may sit relative to the node clock.
pub const MAX_TX_BACK_SECONDS: i64 = 86_400;
pub const MAX_TX_FORWARD_SECONDS: i64 = 600;

const MAX_ENVELOPE_SECTION: u32 = 16 << 20;

pub const TX_TYPE_SMART_CONTRACT: u8 = 1;
pub const TX_TYPE_STOP_NETWORK: u8 = 2;
pub const TX_TYPE_SYSTEM_SERVER: u8 = 3;
pub const TX_TYPE_ECOSYSTEM_MINER: u8 = 4;
pub const TX_TYPE_SYSTEM_MINER: u8 = 5;

/// Pool priority classes, lowest first. Ordering is significant: selection
/// sorts on this enum before expedite and time.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TxRate {
    OnBlock,
    ApiContract,
    SystemServer,
    EcosystemMiner,
    SystemMiner,
    StopNetwork,
}

impl TxRate {
    pub fn from_tx_type(tx_type: u8) -> Self {
        match tx_type {
            TX_TYPE_STOP_NETWORK => TxRate::StopNetwork,
            TX_TYPE_SYSTEM_SERVER => TxRate::SystemServer,
            TX_TYPE_ECOSYSTEM_MINER => TxRate::EcosystemMiner,
            TX_TYPE_SYSTEM_MINER => TxRate::SystemMiner,
            _ => TxRate::ApiContract,
        }
    }
}

/// Scalar parameter passed to a contract entrypoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TxParam {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Money(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxHeader {
    pub tx_type: u8,
    pub time: i64,
    pub ecosystem_id: i64,
    pub key_id: i64,
    pub network_id: i64,
}

/// Signed body of a smart-contract transaction. The wire identity of the
/// transaction is the double hash of these canonical bytes; the signature is
/// computed over that hash and carried outside the body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmartTransaction {
    pub header: TxHeader,
    pub contract: String,
    pub signed_by: i64,
    pub public_key: Vec<u8>,
    pub expedite: String,
    pub params: BTreeMap<String, TxParam>,
}

impl SmartTransaction {
    pub fn body_bytes(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn hash(&self) -> ChainResult<[u8; 32]> {
        Ok(double_hash(&self.body_bytes()?))
    }

    /// The key id the signature must belong to.
    pub fn signer_id(&self) -> i64 {
        if self.signed_by != 0 {
            self.signed_by
        } else {
            self.header.key_id
        }
    }

    /// Serializes and signs the transaction, producing the full envelope and
    /// its hash.
    pub fn seal(&self, keypair: &Keypair) -> ChainResult<(Vec<u8>, [u8; 32])> {
        let body = self.body_bytes()?;
        let hash = double_hash(&body);
        let signature = sign_message(keypair, &hash);
        let sig_bytes = signature.to_bytes().to_vec();
        let mut raw = Vec::with_capacity(1 + 8 + body.len() + sig_bytes.len());
        raw.push(TX_MARKER);
        raw.extend_from_slice(&(body.len() as u32).to_le_bytes());
        raw.extend_from_slice(&body);
        raw.extend_from_slice(&(sig_bytes.len() as u32).to_le_bytes());
        raw.extend_from_slice(&sig_bytes);
        Ok((raw, hash))
    }
}

#[derive(Clone, Debug)]
pub struct ParsedTransaction {
    pub hash: [u8; 32],
    pub raw: Vec<u8>,
    pub body: SmartTransaction,
    pub signature: Vec<u8>,
}

impl ParsedTransaction {
    pub fn rate(&self) -> TxRate {
        TxRate::from_tx_type(self.body.header.tx_type)
    }

    pub fn is_stop_network(&self) -> bool {
        self.rate() == TxRate::StopNetwork
    }

    /// Checks the envelope signature against the embedded public key and the
    /// declared signer id.
    pub fn verify_signature(&self) -> ChainResult<()> {
        let public_key = public_key_from_bytes(&self.body.public_key)?;
        let derived = address_from_key_bytes(&self.body.public_key);
        if derived != self.body.signer_id() {
            return Err(ChainError::Crypto(
                "transaction signer does not match embedded public key".into(),
            ));
        }
        let signature = signature_from_bytes(&self.signature)?;
        verify_signature(&public_key, &self.hash, &signature)
    }
}

fn read_section<'a>(raw: &'a [u8], pos: &mut usize) -> ChainResult<&'a [u8]> {
    if raw.len() < *pos + 4 {
        return Err(ChainError::Transaction("truncated envelope".into()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&raw[*pos..*pos + 4]);
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 || len > MAX_ENVELOPE_SECTION {
        return Err(ChainError::Transaction(format!(
            "invalid envelope section length {len}"
        )));
    }
    let start = *pos + 4;
    let end = start + len as usize;
    if raw.len() < end {
        return Err(ChainError::Transaction("truncated envelope".into()));
    }
    *pos = end;
    Ok(&raw[start..end])
}

/// Parses a wire envelope into its body and signature, recomputing the hash.
/// Signature verification is a separate step so the pool can reject malformed
/// bytes before paying for curve operations.
pub fn parse_transaction(raw: &[u8]) -> ChainResult<ParsedTransaction> {
    if raw.first() != Some(&TX_MARKER) {
        return Err(ChainError::Transaction("missing envelope marker".into()));
    }
    let mut pos = 1usize;
    let body_bytes = read_section(raw, &mut pos)?;
    let hash = double_hash(body_bytes);
    let body: SmartTransaction = bincode::deserialize(body_bytes)?;
    let signature = read_section(raw, &mut pos)?.to_vec();
    if pos != raw.len() {
        return Err(ChainError::Transaction("trailing envelope bytes".into()));
    }
    Ok(ParsedTransaction {
        hash,
        raw: raw.to_vec(),
        body,
        signature,
    })
}

/// Recomputes a transaction hash from its envelope without decoding the body.
pub fn tx_hash_from_envelope(raw: &[u8]) -> ChainResult<[u8; 32]> {
    if raw.first() != Some(&TX_MARKER) {
        return Err(ChainError::Transaction("missing envelope marker".into()));
    }
    let mut pos = 1usize;
    let body = read_section(raw, &mut pos)?;
    Ok(double_hash(body))
}

/// Parses a decimal expedite string into micro-units (six fractional digits).
/// An empty string is zero.
pub fn parse_expedite(value: &str) -> ChainResult<i64> {
    if value.is_empty() {
        return Ok(0);
    }
    let invalid =
        || ChainError::Transaction(format!("invalid expedite value: {value}"));
    let (whole, frac) = match value.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (value, ""),
    };
    if frac.len() > 6 || whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    let whole_part: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut frac_part: i64 = 0;
    if !frac.is_empty() {
        frac_part = frac.parse().map_err(|_| invalid())?;
        for _ in frac.len()..6 {
            frac_part *= 10;
        }
    }
    whole_part
        .checked_mul(1_000_000)
        .and_then(|v| v.checked_add(frac_part))
        .ok_or_else(invalid)
}

/// Row of the `transactions` pool table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedTransaction {
    pub hash: [u8; 32],
    pub data: Vec<u8>,
    pub used: bool,
    pub high_rate: TxRate,
    pub expedite: i64,
    pub tx_type: u8,
    pub key_id: i64,
    pub sent: bool,
    pub verified: bool,
    pub time: i64,
}

impl QueuedTransaction {
    pub fn from_parsed(tx: &ParsedTransaction) -> ChainResult<Self> {
        Ok(Self {
            hash: tx.hash,
            data: tx.raw.clone(),
            used: false,
            high_rate: tx.rate(),
            expedite: parse_expedite(&tx.body.expedite)?,
            tx_type: tx.body.header.tx_type,
            key_id: tx.body.header.key_id,
            sent: false,
            verified: true,
            time: tx.body.header.time,
        })
    }

    pub fn is_stop_network(&self) -> bool {
        self.high_rate == TxRate::StopNetwork
    }
}

/// Row of the `transactions_status` side table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxStatus {
    pub time: i64,
    pub key_id: i64,
    pub block_id: u64,
    pub error: String,
}

/// Builds and signs a node-originated transaction (delayed-contract runs,
/// bad-block reports). The node key both authors and signs it.
pub fn new_internal_transaction(
    contract: &str,
    params: BTreeMap<String, TxParam>,
    keypair: &Keypair,
    key_id: i64,
    time: i64,
    ecosystem_id: i64,
    network_id: i64,
) -> ChainResult<(Vec<u8>, [u8; 32])> {
    let tx = SmartTransaction {
        header: TxHeader {
            tx_type: TX_TYPE_SMART_CONTRACT,
            time,
            ecosystem_id,
            key_id,
            network_id,
        },
        contract: contract.to_string(),
        signed_by: 0,
        public_key: keypair.public.to_bytes().to_vec(),
        expedite: String::new(),
        params,
    };
    tx.seal(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_from_public_key, generate_keypair};

    pub(crate) fn sample_transaction(
        keypair: &Keypair,
        contract: &str,
        time: i64,
    ) -> SmartTransaction {
        let mut params = BTreeMap::new();
        params.insert("Amount".to_string(), TxParam::Int(25));
        params.insert("Recipient".to_string(), TxParam::Str("dora".into()));
        SmartTransaction {
            header: TxHeader {
                tx_type: TX_TYPE_SMART_CONTRACT,
                time,
                ecosystem_id: 1,
                key_id: address_from_public_key(&keypair.public),
                network_id: 1,
            },
            contract: contract.to_string(),
            signed_by: 0,
            public_key: keypair.public.to_bytes().to_vec(),
            expedite: "1.25".to_string(),
            params,
        }
    }

    #[test]
    fn envelope_round_trip_preserves_hash() {
        let keypair = generate_keypair();
        let tx = sample_transaction(&keypair, "TokenTransfer", 1_700_000_000);
        let (raw, hash) = tx.seal(&keypair).expect("seal");
        assert_eq!(raw[0], TX_MARKER);
        let parsed = parse_transaction(&raw).expect("parse");
        assert_eq!(parsed.hash, hash);
        assert_eq!(parsed.body.contract, "TokenTransfer");
        parsed.verify_signature().expect("signature");
        assert_eq!(tx_hash_from_envelope(&raw).expect("fast hash"), hash);
    }

    #[test]
    fn tampered_body_fails_verification() {
        let keypair = generate_keypair();
        let tx = sample_transaction(&keypair, "TokenTransfer", 1_700_000_000);
        let (mut raw, _) = tx.seal(&keypair).expect("seal");
        let body_start = 5;
        raw[body_start + 12] ^= 0xff;
        match parse_transaction(&raw) {
            Ok(parsed) => assert!(parsed.verify_signature().is_err()),
            Err(_) => {}
        }
    }

    #[test]
    fn foreign_signer_is_rejected() {
        let author = generate_keypair();
        let forger = generate_keypair();
        let mut tx = sample_transaction(&author, "TokenTransfer", 1_700_000_000);
        tx.public_key = forger.public.to_bytes().to_vec();
        let (raw, _) = tx.seal(&forger).expect("seal");
        let parsed = parse_transaction(&raw).expect("parse");
        assert!(parsed.verify_signature().is_err());
    }

    #[test]
    fn expedite_parses_as_micro_units() {
        assert_eq!(parse_expedite("").unwrap(), 0);
        assert_eq!(parse_expedite("1").unwrap(), 1_000_000);
        assert_eq!(parse_expedite("1.25").unwrap(), 1_250_000);
        assert_eq!(parse_expedite("0.000001").unwrap(), 1);
        assert!(parse_expedite("1.2.3").is_err());
        assert!(parse_expedite("abc").is_err());
    }

    #[test]
    fn rate_ordering_puts_stop_network_first() {
        let mut rates = vec![
            TxRate::ApiContract,
            TxRate::StopNetwork,
            TxRate::OnBlock,
            TxRate::SystemMiner,
        ];
        rates.sort();
        assert_eq!(rates.last(), Some(&TxRate::StopNetwork));
    }
}
