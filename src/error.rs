use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PrudpError>;

/// The failure classes the session layer distinguishes. How the dispatcher
///  reacts depends on the class: decode and protocol faults drop the packet
///  and keep the peer, auth faults leave the handshake incomplete, resource
///  faults terminate the listener, and an unreachable peer is torn down.
#[derive(Error, Debug)]
pub enum PrudpError {
    #[error("malformed packet or stream: {0}")]
    Decode(String),

    #[error("kerberos validation failed: {0}")]
    Auth(String),

    #[error("packet not valid for session state: {0}")]
    Protocol(String),

    #[error("socket error: {0}")]
    Resource(#[from] std::io::Error),

    #[error("peer {0} stopped acknowledging, giving up")]
    Unreachable(SocketAddr),
}

impl PrudpError {
    pub(crate) fn decode(msg: impl Into<String>) -> PrudpError {
        PrudpError::Decode(msg.into())
    }

    pub(crate) fn auth(msg: impl Into<String>) -> PrudpError {
        PrudpError::Auth(msg.into())
    }
}
