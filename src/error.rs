use thiserror::Error;

/// Result type for stagecast operations
pub type Result<T> = std::result::Result<T, StagecastError>;

/// Errors that can occur in the stagecast core
#[derive(Error, Debug)]
pub enum StagecastError {
    #[error("ring storage: {0}")]
    Storage(String),

    #[error("position {pos} + {count} outside [{begin}, {end})")]
    OutOfRange {
        pos: u64,
        count: usize,
        begin: u64,
        end: u64,
    },

    #[error("push exceeded writable region")]
    Overflow,

    #[error("pop exceeded readable region")]
    Underflow,

    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("aead rejected datagram")]
    Decryption,

    #[error("codec: {0}")]
    Codec(String),

    #[error("key file {path}: {reason}")]
    KeyFile { path: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
