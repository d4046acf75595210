use std::io;
use thiserror::Error;

/// Errors produced while obtaining, writing to, or reading from a pooled
/// connection. These never escape a single fetch attempt; the orchestrator
/// in [`crate::fetch`] turns them into a [`crate::report::FetchResult`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("dial error: {0}")]
    Connect(#[source] io::Error),

    #[error("connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("write error: {0}")]
    Write(#[source] io::Error),

    #[error("WriteRequest timeout")]
    WriteTimeout,

    #[error("read header error: {0}")]
    ReadHeader(#[source] io::Error),

    #[error("ReadResponse timeout")]
    ReadHeaderTimeout,

    #[error("read body error: {0}")]
    ReadBody(#[source] io::Error),

    #[error("response exceeded read limit of {0} bytes")]
    ReadLimitExceeded(u64),
}

/// Errors from the per-URL fetch orchestrator ([`crate::fetch`]).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("fetch timed out after {0:?}")]
    Timeout(std::time::Duration),
}
