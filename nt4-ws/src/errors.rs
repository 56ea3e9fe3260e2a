use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("connection closed")]
    Closed,

    #[error("server at capacity")]
    AtCapacity,
}

pub type Result<T> = std::result::Result<T, Error>;
