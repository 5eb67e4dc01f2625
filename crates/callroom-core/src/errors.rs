use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    MediaAccess(String),
    #[error("token minting failed: {0}")]
    Token(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("room error: {0}")]
    Room(String),
}
