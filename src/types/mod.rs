mod block;
mod transaction;

pub use block::{
    merkle_root, Block, BlockHeader, InfoBlock, StoredBlock, BLOCK_VERSION, GENESIS_BLOCK_ID,
};
pub use transaction::{
    new_internal_transaction, parse_expedite, parse_transaction, tx_hash_from_envelope,
    ParsedTransaction, QueuedTransaction, SmartTransaction, TxHeader, TxParam, TxRate, TxStatus,
    MAX_TX_BACK_SECONDS, MAX_TX_FORWARD_SECONDS, TX_MARKER,
};
