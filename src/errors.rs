use std::io;

use thiserror::Error;

use crate::vm::VmError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("duplicated transaction")]
    DuplicatedTransaction,
    #[error("early transaction time")]
    EarlyTransactionTime,
    #[error("expired transaction time")]
    ExpiredTransactionTime,
    #[error("transaction key id is empty")]
    EmptyKey,
    #[error("key {key_id} is banned until {until}")]
    KeyBanned { key_id: i64, until: i64 },
    #[error("block rejected: {0}")]
    Block(String),
    #[error("incorrect rollback hash")]
    IncorrectRollbackHash,
    #[error("block is not the last")]
    NotLastBlock,
    #[error("vm error: {0}")]
    Vm(#[from] VmError),
    #[error("network error: {0}")]
    Net(String),
    #[error("no honor nodes available")]
    NodesUnavailable,
    #[error("{0}")]
    Banned(Box<ChainError>),
}

pub type ChainResult<T> = Result<T, ChainError>;

impl ChainError {
    /// Tags an error as ban-worthy for the peer or key that produced it.
    pub fn with_ban(err: ChainError) -> ChainError {
        match err {
            ChainError::Banned(_) => err,
            other => ChainError::Banned(Box::new(other)),
        }
    }

    pub fn is_ban_error(&self) -> bool {
        matches!(
            self,
            ChainError::Banned(_)
                | ChainError::EmptyKey
                | ChainError::EarlyTransactionTime
                | ChainError::KeyBanned { .. }
        )
    }
}
