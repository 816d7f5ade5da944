//! A PRUDP server core: the reliability and session layer of the
//!  Quazal/NEX game-networking stack, spoken over a single UDP socket.
//!
//! The protocol multiplexes many peers over one socket. Each peer runs a
//!  three-step handshake (SYN, CONNECT, then data), negotiates connection
//!  signatures both sides use to authenticate packets, and carries reliable
//!  traffic over numbered *substreams* - ordered channels with their own
//!  sequence spaces, retransmission and RC4 keystreams. Application messages
//!  (RMC) may span several DATA fragments; the final fragment carries id 0.
//!
//! Two wire formats share these semantics:
//! * **v0** - the legacy framing: nibble-packed endpoints, a 4-byte MAC in
//!   the header and a trailing checksum byte derived from the access key
//! * **v1** - magic `EA D0`, a fixed 12-byte header, a 16-byte HMAC-MD5
//!   signature and a TLV options block for the handshake extensions
//!
//! On secure servers the CONNECT payload carries a Kerberos-style ticket;
//!  validating it yields the session key that keys both the substream
//!  ciphers and the v1 packet signatures.
//!
//! The [server::PrudpServer] owns the socket and all per-peer state.
//!  Applications subscribe to the session events (`syn`, `connect`,
//!  `reliable-data`, `disconnect`) and push replies through
//!  [server::PrudpServer::send], which handles fragmentation, sequencing,
//!  encryption, signing and retransmission.

pub mod byte_stream;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod packet;
pub mod peer;
pub mod rmc;
pub mod server;

mod resend;
mod substream;

#[cfg(test)]
mod test_util;

pub use config::{LibraryVersion, LibraryVersions, PrudpConfig};
pub use error::{PrudpError, Result};
pub use events::Event;
pub use packet::{PacketFlags, PacketType, PrudpPacket, WireVersion};
pub use rmc::RmcMessage;
pub use server::PrudpServer;
