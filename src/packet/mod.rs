//! The decoded packet model shared by both wire formats, and the dispatch
//!  into the version-specific codecs. The two formats are a tagged variant -
//!  everything the rest of the crate touches goes through [PrudpPacket],
//!  which carries the superset of both formats' fields.

pub mod v0;
pub mod v1;

use crate::error::Result;
use crate::rmc::RmcMessage;
use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use std::net::SocketAddr;

pub const V1_MAGIC: [u8; 2] = [0xEA, 0xD0];

#[derive(TryFromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum PacketType {
    Syn = 0,
    Connect = 1,
    Data = 2,
    Disconnect = 3,
    Ping = 4,
}

bitflags! {
    /// The 12-bit flag field of the type-and-flags word. Unknown bits are
    ///  preserved so re-serialization stays bit-exact.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PacketFlags: u16 {
        const ACK       = 0x001;
        const RELIABLE  = 0x002;
        const NEEDS_ACK = 0x004;
        const HAS_SIZE  = 0x008;
        const MULTI_ACK = 0x200;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WireVersion {
    V0,
    V1,
}

/// A decoded PRUDP frame. Produced by the codecs for every inbound datagram
///  and by the handlers / send path for outbound traffic; packets are
///  transient and carry no references into session state.
#[derive(Clone, Debug)]
pub struct PrudpPacket {
    pub version: WireVersion,
    /// The remote this packet came from, or is addressed to
    pub sender: SocketAddr,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub source_stream_type: u8,
    pub source_port: u8,
    pub destination_stream_type: u8,
    pub destination_port: u8,
    pub session_id: u8,
    pub substream_id: u8,
    pub sequence_id: u16,
    pub fragment_id: u8,
    /// Only meaningful on SYN and CONNECT
    pub connection_signature: Vec<u8>,
    pub signature: Vec<u8>,
    pub payload: Vec<u8>,

    // v1 handshake options; zero for v0 packets
    pub minor_version: u32,
    pub supported_functions: u32,
    pub maximum_substream_id: u8,
    pub initial_sequence_id: u16,

    /// Set on `reliable-data` emissions once a complete message is reassembled
    pub rmc: Option<RmcMessage>,
}

impl PrudpPacket {
    pub fn new(version: WireVersion, sender: SocketAddr) -> PrudpPacket {
        PrudpPacket {
            version,
            sender,
            packet_type: PacketType::Syn,
            flags: PacketFlags::empty(),
            source_stream_type: 0,
            source_port: 0,
            destination_stream_type: 0,
            destination_port: 0,
            session_id: 0,
            substream_id: 0,
            sequence_id: 0,
            fragment_id: 0,
            connection_signature: Vec::new(),
            signature: Vec::new(),
            payload: Vec::new(),
            minor_version: 0,
            supported_functions: 0,
            maximum_substream_id: 0,
            initial_sequence_id: 0,
            rmc: None,
        }
    }

    pub fn has_flag(&self, flag: PacketFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_any_ack(&self) -> bool {
        self.flags
            .intersects(PacketFlags::ACK | PacketFlags::MULTI_ACK)
    }

    pub fn serialize(&self, access_key: &str) -> Vec<u8> {
        match self.version {
            WireVersion::V0 => v0::serialize(self, access_key),
            WireVersion::V1 => v1::serialize(self),
        }
    }

    /// Computes the per-packet signature. `connection_signature` is the
    ///  signature the peer chose for this session (empty during SYN).
    pub fn calculate_signature(
        &self,
        access_key: &str,
        session_key: &[u8],
        connection_signature: &[u8],
    ) -> Vec<u8> {
        match self.version {
            WireVersion::V0 => v0::calculate_signature(self, access_key, connection_signature),
            WireVersion::V1 => {
                v1::calculate_signature(self, access_key, session_key, connection_signature)
            }
        }
    }

    pub fn verify_signature(
        &self,
        access_key: &str,
        session_key: &[u8],
        connection_signature: &[u8],
    ) -> bool {
        self.signature == self.calculate_signature(access_key, session_key, connection_signature)
    }

    /// Computes the connection signature this server advertises for a peer.
    ///  Opaque to the peer, deterministic per address for the lifetime of the
    ///  server (`server_signature_key` is fixed at startup).
    pub fn calculate_connection_signature(
        &self,
        addr: SocketAddr,
        server_signature_key: &[u8],
    ) -> Result<Vec<u8>> {
        match self.version {
            WireVersion::V0 => v0::calculate_connection_signature(addr),
            WireVersion::V1 => Ok(v1::calculate_connection_signature(addr, server_signature_key)),
        }
    }
}

pub(crate) fn packed_endpoint(stream_type: u8, port: u8) -> u8 {
    (stream_type << 4) | (port & 0xF)
}

pub(crate) fn access_key_sum(access_key: &str) -> u32 {
    access_key.bytes().map(u32::from).sum()
}

pub(crate) fn address_bytes(addr: SocketAddr) -> Vec<u8> {
    let mut data = match addr {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    };
    data.extend_from_slice(&addr.port().to_be_bytes());
    data
}
