use thiserror::Error;

/// Errors raised by a [`Connection`](crate::connection::Connection) and its throttler.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connect error: failed to reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Socket option error: {0}")]
    SocketOption(#[source] std::io::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Read error: {0}")]
    Read(#[source] std::io::Error),
    #[error("Write error: {0}")]
    Write(#[source] std::io::Error),
    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("Response error: {0}")]
    Response(#[from] hyper::http::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Connection error: {0}")]
    Connection(#[from] Error),
}

pub type Result<T> = std::result::Result<T, Error>;
