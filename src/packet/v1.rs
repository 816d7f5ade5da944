//! The v1 wire format: magic prefix, fixed 12-byte header, 16-byte HMAC
//!  signature, then a TLV options block carrying the v1-only extensions
//!  (supported functions, connection signature, fragment id, initial
//!  sequence id, maximum substream id).

use crate::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::crypto::hmac_md5;
use crate::error::{PrudpError, Result};
use crate::packet::{
    access_key_sum, address_bytes, packed_endpoint, PacketFlags, PacketType, PrudpPacket,
    WireVersion, V1_MAGIC,
};
use md5::{Digest, Md5};
use std::net::SocketAddr;
use tracing::debug;

const HEADER_SIZE: usize = 12;
const SIGNATURE_SIZE: usize = 16;
const CONNECTION_SIGNATURE_SIZE: usize = 16;

const OPTION_SUPPORTED_FUNCTIONS: u8 = 0;
const OPTION_CONNECTION_SIGNATURE: u8 = 1;
const OPTION_FRAGMENT_ID: u8 = 2;
const OPTION_INITIAL_SEQUENCE_ID: u8 = 3;
const OPTION_MAX_SUBSTREAM_ID: u8 = 4;

/// Parses every v1 packet in the datagram, in order. A malformed packet ends
///  the walk; whatever parsed before it is still returned.
pub fn parse_packets(data: &[u8], sender: SocketAddr) -> Vec<PrudpPacket> {
    let mut stream = ByteStreamIn::new(data.to_vec(), ByteStreamSettings::default());
    let mut packets = Vec::new();

    while stream.remaining() > 0 {
        match decode_packet(&mut stream, sender) {
            Ok(packet) => packets.push(packet),
            Err(e) => {
                debug!("dropping remainder of v1 datagram from {:?}: {}", sender, e);
                break;
            }
        }
    }

    packets
}

fn decode_packet(stream: &mut ByteStreamIn, sender: SocketAddr) -> Result<PrudpPacket> {
    let magic = stream.read_bytes(2)?;
    if magic.as_ref() != V1_MAGIC {
        return Err(PrudpError::decode(format!(
            "bad v1 magic {:02x} {:02x}",
            magic[0], magic[1]
        )));
    }

    let mut packet = PrudpPacket::new(WireVersion::V1, sender);

    let version = stream.read_u8()?;
    if version != 1 {
        return Err(PrudpError::decode(format!("bad v1 header version {version}")));
    }

    let options_length = stream.read_u8()? as usize;
    let payload_length = stream.read_u16_le()? as usize;

    let source = stream.read_u8()?;
    packet.source_stream_type = source >> 4;
    packet.source_port = source & 0xF;

    let destination = stream.read_u8()?;
    packet.destination_stream_type = destination >> 4;
    packet.destination_port = destination & 0xF;

    let type_and_flags = stream.read_u16_le()?;
    packet.flags = PacketFlags::from_bits_retain(type_and_flags >> 4);
    packet.packet_type = PacketType::try_from(type_and_flags & 0xF)
        .map_err(|_| PrudpError::decode(format!("invalid packet type {}", type_and_flags & 0xF)))?;

    packet.session_id = stream.read_u8()?;
    packet.substream_id = stream.read_u8()?;
    packet.sequence_id = stream.read_u16_le()?;

    packet.signature = stream.read_bytes(SIGNATURE_SIZE)?.to_vec();

    let options = stream.read_bytes(options_length)?;
    decode_options(&mut packet, &options)?;

    packet.payload = stream.read_bytes(payload_length)?.to_vec();

    Ok(packet)
}

fn decode_options(packet: &mut PrudpPacket, options: &[u8]) -> Result<()> {
    let mut stream = ByteStreamIn::new(options.to_vec(), ByteStreamSettings::default());

    while stream.remaining() > 0 {
        let option_id = stream.read_u8()?;
        let option_size = stream.read_u8()? as usize;

        match option_id {
            OPTION_SUPPORTED_FUNCTIONS => {
                let value = stream.read_u32_le()?;
                packet.minor_version = value & 0xFF;
                packet.supported_functions = value >> 8;
            }
            OPTION_CONNECTION_SIGNATURE => {
                packet.connection_signature = stream.read_bytes(option_size)?.to_vec();
            }
            OPTION_FRAGMENT_ID => packet.fragment_id = stream.read_u8()?,
            OPTION_INITIAL_SEQUENCE_ID => packet.initial_sequence_id = stream.read_u16_le()?,
            OPTION_MAX_SUBSTREAM_ID => packet.maximum_substream_id = stream.read_u8()?,
            _ => {
                // tolerate options from newer minor versions
                stream.read_bytes(option_size)?;
            }
        }
    }

    Ok(())
}

fn encode_options(packet: &PrudpPacket) -> Vec<u8> {
    let mut out = ByteStreamOut::new(ByteStreamSettings::default());

    if matches!(packet.packet_type, PacketType::Syn | PacketType::Connect) {
        out.write_u8(OPTION_SUPPORTED_FUNCTIONS);
        out.write_u8(4);
        out.write_u32_le(packet.minor_version | (packet.supported_functions << 8));

        out.write_u8(OPTION_CONNECTION_SIGNATURE);
        out.write_u8(CONNECTION_SIGNATURE_SIZE as u8);
        let mut connection_signature = packet.connection_signature.clone();
        connection_signature.resize(CONNECTION_SIGNATURE_SIZE, 0);
        out.write_bytes(&connection_signature);

        if packet.packet_type == PacketType::Connect {
            out.write_u8(OPTION_INITIAL_SEQUENCE_ID);
            out.write_u8(2);
            out.write_u16_le(packet.initial_sequence_id);
        }

        out.write_u8(OPTION_MAX_SUBSTREAM_ID);
        out.write_u8(1);
        out.write_u8(packet.maximum_substream_id);
    }

    if packet.packet_type == PacketType::Data {
        out.write_u8(OPTION_FRAGMENT_ID);
        out.write_u8(1);
        out.write_u8(packet.fragment_id);
    }

    out.into_bytes()
}

fn encode_header(packet: &PrudpPacket, options_length: usize) -> [u8; HEADER_SIZE] {
    let mut out = ByteStreamOut::new(ByteStreamSettings::default());
    out.write_u8(1);
    out.write_u8(options_length as u8);
    out.write_u16_le(packet.payload.len() as u16);
    out.write_u8(packed_endpoint(
        packet.source_stream_type,
        packet.source_port,
    ));
    out.write_u8(packed_endpoint(
        packet.destination_stream_type,
        packet.destination_port,
    ));
    out.write_u16_le((packet.flags.bits() << 4) | packet.packet_type as u16);
    out.write_u8(packet.session_id);
    out.write_u8(packet.substream_id);
    out.write_u16_le(packet.sequence_id);

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&out.into_bytes());
    header
}

pub(super) fn serialize(packet: &PrudpPacket) -> Vec<u8> {
    let options = encode_options(packet);
    let header = encode_header(packet, options.len());

    let mut out = Vec::with_capacity(
        V1_MAGIC.len() + HEADER_SIZE + SIGNATURE_SIZE + options.len() + packet.payload.len(),
    );
    out.extend_from_slice(&V1_MAGIC);
    out.extend_from_slice(&header);

    let mut signature = packet.signature.clone();
    signature.resize(SIGNATURE_SIZE, 0);
    out.extend_from_slice(&signature);

    out.extend_from_slice(&options);
    out.extend_from_slice(&packet.payload);
    out
}

/// HMAC-MD5 keyed with `MD5(access_key)` over the packet-specific header
///  bytes, the session key, the byte sum of the access key, the peer's
///  connection signature, the options block and the payload, in that order
pub(super) fn calculate_signature(
    packet: &PrudpPacket,
    access_key: &str,
    session_key: &[u8],
    connection_signature: &[u8],
) -> Vec<u8> {
    let options = encode_options(packet);
    let header = encode_header(packet, options.len());
    let key = Md5::digest(access_key.as_bytes());

    let mut data = Vec::new();
    data.extend_from_slice(&header[4..]);
    data.extend_from_slice(session_key);
    data.extend_from_slice(&access_key_sum(access_key).to_le_bytes());
    data.extend_from_slice(connection_signature);
    data.extend_from_slice(&options);
    data.extend_from_slice(&packet.payload);

    hmac_md5(&key, &data)
}

pub(super) fn calculate_connection_signature(
    addr: SocketAddr,
    server_signature_key: &[u8],
) -> Vec<u8> {
    hmac_md5(server_signature_key, &address_bytes(addr))
}
