use std::io;

/// Errors surfaced across the public API.
///
/// Transient conditions (would-block, TLS want-read/want-write) are never
/// represented here — they are handled locally by re-arming the event loop.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve { host: String, port: u16, #[source] source: io::Error },

    #[error("connect timed out after {elapsed_ms}ms")]
    ConnectTimeout { elapsed_ms: u64 },

    #[error("connection refused by {addr}")]
    ConnectRefused { addr: std::net::SocketAddr },

    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    #[error("framing parse error: {0}")]
    FramingParse(String),

    #[error("framing overflow: {0}")]
    FramingOverflow(String),

    #[error("short write: wrote {wrote} of {expected} bytes with no would-block")]
    WriteShort { wrote: usize, expected: usize },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("resource io error: {0}")]
    ResourceIo(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
