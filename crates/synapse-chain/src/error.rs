use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ChainError>;
