//! Protocol-level error types

use thiserror::Error;

/// ProtocolError covers every way a client can violate the SOCKS5
/// handshake or request framing
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("no acceptable authentication method offered")]
    NoAcceptableAuth,

    #[error("unsupported username/password sub-negotiation version: {0}")]
    UnsupportedAuthVersion(u8),

    #[error("authentication failed")]
    AuthFailed,

    #[error("unrecognized address type: {0}")]
    UnrecognizedAddrType(u8),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
