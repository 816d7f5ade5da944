//! The legacy v0 wire format: variable-length header, a 4-byte MAC embedded
//!  before the payload, and a trailing one-byte checksum derived from the
//!  access key. Only HAS_SIZE packets can be concatenated in one datagram,
//!  since without an explicit size the payload runs to the checksum byte.

use crate::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::crypto::hmac_md5;
use crate::error::{PrudpError, Result};
use crate::packet::{
    access_key_sum, packed_endpoint, PacketFlags, PacketType, PrudpPacket, WireVersion,
};
use md5::{Digest, Md5};
use std::net::SocketAddr;
use tracing::debug;

const SIGNATURE_SIZE: usize = 4;
const CONNECTION_SIGNATURE_SIZE: usize = 4;

/// Signature of a DATA packet with no payload
const EMPTY_PAYLOAD_SIGNATURE: [u8; 4] = [0x78, 0x56, 0x34, 0x12];

/// Parses every v0 packet in the datagram, in order. A malformed packet ends
///  the walk; whatever parsed before it is still returned.
pub fn parse_packets(data: &[u8], sender: SocketAddr, access_key: &str) -> Vec<PrudpPacket> {
    let mut stream = ByteStreamIn::new(data.to_vec(), ByteStreamSettings::default());
    let mut packets = Vec::new();

    while stream.remaining() > 0 {
        match decode_packet(&mut stream, sender, access_key) {
            Ok(packet) => packets.push(packet),
            Err(e) => {
                debug!("dropping remainder of v0 datagram from {:?}: {}", sender, e);
                break;
            }
        }
    }

    packets
}

fn decode_packet(
    stream: &mut ByteStreamIn,
    sender: SocketAddr,
    access_key: &str,
) -> Result<PrudpPacket> {
    let start = stream.position();

    let mut packet = PrudpPacket::new(WireVersion::V0, sender);

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
    packet.signature = stream.read_bytes(SIGNATURE_SIZE)?.to_vec();
    packet.sequence_id = stream.read_u16_le()?;

    if matches!(packet.packet_type, PacketType::Syn | PacketType::Connect) {
        packet.connection_signature = stream.read_bytes(CONNECTION_SIGNATURE_SIZE)?.to_vec();
    }

    if packet.packet_type == PacketType::Data {
        packet.fragment_id = stream.read_u8()?;
    }

    let payload_size = if packet.has_flag(PacketFlags::HAS_SIZE) {
        stream.read_u16_le()? as usize
    } else {
        stream
            .remaining()
            .checked_sub(1)
            .ok_or_else(|| PrudpError::decode("v0 packet too short for checksum"))?
    };

    packet.payload = stream.read_bytes(payload_size)?.to_vec();

    let checksum_position = stream.position();
    let checksum = stream.read_u8()?;

    let signed_region = stream.slice(start, checksum_position);
    let calculated = calculate_checksum(access_key, &signed_region);
    if checksum != calculated {
        return Err(PrudpError::decode(format!(
            "checksum mismatch: got {checksum:#04x}, calculated {calculated:#04x}"
        )));
    }

    Ok(packet)
}

pub(super) fn serialize(packet: &PrudpPacket, access_key: &str) -> Vec<u8> {
    let mut out = ByteStreamOut::new(ByteStreamSettings::default());

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

    let mut signature = packet.signature.clone();
    signature.resize(SIGNATURE_SIZE, 0);
    out.write_bytes(&signature);

    out.write_u16_le(packet.sequence_id);

    if matches!(packet.packet_type, PacketType::Syn | PacketType::Connect) {
        let mut connection_signature = packet.connection_signature.clone();
        connection_signature.resize(CONNECTION_SIGNATURE_SIZE, 0);
        out.write_bytes(&connection_signature);
    }

    if packet.packet_type == PacketType::Data {
        out.write_u8(packet.fragment_id);
    }

    if packet.has_flag(PacketFlags::HAS_SIZE) {
        out.write_u16_le(packet.payload.len() as u16);
    }

    out.write_bytes(&packet.payload);

    let mut data = out.into_bytes();
    let checksum = calculate_checksum(access_key, &data);
    data.push(checksum);
    data
}

/// The trailing checksum byte: the byte sum of the access key, plus the
///  wrapping u32 sum of the signed region taken as LE words, plus the bytes
///  that do not fill a word, folded down to 8 bits
fn calculate_checksum(access_key: &str, data: &[u8]) -> u8 {
    let mut checksum = access_key_sum(access_key);

    let words = data.len() / 4;
    let mut word_sum: u32 = 0;
    for i in 0..words {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[i * 4..i * 4 + 4]);
        word_sum = word_sum.wrapping_add(u32::from_le_bytes(raw));
    }

    for &b in &data[words * 4..] {
        checksum = checksum.wrapping_add(b as u32);
    }
    for b in word_sum.to_le_bytes() {
        checksum = checksum.wrapping_add(b as u32);
    }

    checksum as u8
}

pub(super) fn calculate_signature(
    packet: &PrudpPacket,
    access_key: &str,
    connection_signature: &[u8],
) -> Vec<u8> {
    if packet.packet_type == PacketType::Data {
        if packet.payload.is_empty() {
            return EMPTY_PAYLOAD_SIGNATURE.to_vec();
        }
        let key = Md5::digest(access_key.as_bytes());
        return hmac_md5(&key, &packet.payload)[..SIGNATURE_SIZE].to_vec();
    }

    if !connection_signature.is_empty() {
        return connection_signature.to_vec();
    }

    vec![0; SIGNATURE_SIZE]
}

pub(super) fn calculate_connection_signature(addr: SocketAddr) -> Result<Vec<u8>> {
    let SocketAddr::V4(v4) = addr else {
        return Err(PrudpError::Protocol(
            "v0 connection signatures require an IPv4 peer".to_string(),
        ));
    };

    let mut data = v4.ip().octets().to_vec();
    data.extend_from_slice(&addr.port().to_be_bytes());

    let mut signature = Md5::digest(&data)[..CONNECTION_SIGNATURE_SIZE].to_vec();
    signature.reverse();
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    const ACCESS_KEY: &str = "ridfebb9";

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 0, 20], 60123))
    }

    fn sample_packet(packet_type: PacketType, flags: PacketFlags) -> PrudpPacket {
        let mut packet = PrudpPacket::new(WireVersion::V0, peer());
        packet.packet_type = packet_type;
        packet.flags = flags;
        packet.source_stream_type = 0xA;
        packet.source_port = 0xF;
        packet.destination_stream_type = 0xA;
        packet.destination_port = 0x1;
        packet.session_id = 3;
        packet.sequence_id = 77;
        packet
    }

    #[rstest]
    #[case::syn(PacketType::Syn, PacketFlags::NEEDS_ACK)]
    #[case::connect(PacketType::Connect, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK)]
    #[case::data(PacketType::Data, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK | PacketFlags::HAS_SIZE)]
    #[case::disconnect(PacketType::Disconnect, PacketFlags::NEEDS_ACK)]
    #[case::ping(PacketType::Ping, PacketFlags::NEEDS_ACK)]
    fn test_round_trip(#[case] packet_type: PacketType, #[case] flags: PacketFlags) {
        let mut original = sample_packet(packet_type, flags);
        if matches!(packet_type, PacketType::Syn | PacketType::Connect) {
            original.connection_signature = vec![9, 8, 7, 6];
        }
        if packet_type == PacketType::Data {
            original.fragment_id = 2;
            original.payload = vec![1, 2, 3, 4, 5];
        }
        original.signature = calculate_signature(&original, ACCESS_KEY, &[1, 2, 3, 4]);

        let encoded = serialize(&original, ACCESS_KEY);
        let decoded = parse_packets(&encoded, peer(), ACCESS_KEY);
        assert_eq!(decoded.len(), 1);

        let decoded = &decoded[0];
        assert_eq!(decoded.packet_type, original.packet_type);
        assert_eq!(decoded.flags, original.flags);
        assert_eq!(decoded.source_stream_type, original.source_stream_type);
        assert_eq!(decoded.source_port, original.source_port);
        assert_eq!(decoded.destination_stream_type, original.destination_stream_type);
        assert_eq!(decoded.destination_port, original.destination_port);
        assert_eq!(decoded.session_id, original.session_id);
        assert_eq!(decoded.sequence_id, original.sequence_id);
        assert_eq!(decoded.fragment_id, original.fragment_id);
        assert_eq!(decoded.connection_signature, original.connection_signature);
        assert_eq!(decoded.signature, original.signature);
        assert_eq!(decoded.payload, original.payload);

        // decode followed by encode reproduces the wire bytes exactly
        assert_eq!(serialize(decoded, ACCESS_KEY), encoded);
    }

    #[test]
    fn test_checksum_rejects_corruption() {
        let mut packet = sample_packet(PacketType::Data, PacketFlags::RELIABLE);
        packet.payload = vec![1, 2, 3];
        let mut encoded = serialize(&packet, ACCESS_KEY);

        encoded[7] ^= 0x40;
        assert!(parse_packets(&encoded, peer(), ACCESS_KEY).is_empty());
    }

    #[test]
    fn test_checksum_depends_on_access_key() {
        let packet = sample_packet(PacketType::Ping, PacketFlags::NEEDS_ACK);
        let encoded = serialize(&packet, ACCESS_KEY);

        assert_eq!(parse_packets(&encoded, peer(), ACCESS_KEY).len(), 1);
        assert!(parse_packets(&encoded, peer(), "otherkey").is_empty());
    }

    #[test]
    fn test_multiple_packets_in_one_datagram() {
        let mut first = sample_packet(
            PacketType::Data,
            PacketFlags::RELIABLE | PacketFlags::HAS_SIZE,
        );
        first.payload = vec![1, 2, 3];
        let mut second = sample_packet(
            PacketType::Data,
            PacketFlags::RELIABLE | PacketFlags::HAS_SIZE,
        );
        second.sequence_id = 78;
        second.payload = vec![4, 5];

        let mut datagram = serialize(&first, ACCESS_KEY);
        datagram.extend(serialize(&second, ACCESS_KEY));

        let decoded = parse_packets(&datagram, peer(), ACCESS_KEY);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].sequence_id, 77);
        assert_eq!(decoded[1].sequence_id, 78);
        assert_eq!(decoded[1].payload, vec![4, 5]);
    }

    #[test]
    fn test_payload_without_size_flag_runs_to_checksum() {
        let mut packet = sample_packet(PacketType::Data, PacketFlags::RELIABLE);
        packet.payload = vec![0xAA; 10];
        let encoded = serialize(&packet, ACCESS_KEY);

        let decoded = parse_packets(&encoded, peer(), ACCESS_KEY);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].payload, vec![0xAA; 10]);
    }

    #[rstest]
    #[case::with_payload(vec![1, 2, 3], false)]
    #[case::empty_payload(vec![], true)]
    fn test_data_signature(#[case] payload: Vec<u8>, #[case] expect_constant: bool) {
        let mut packet = sample_packet(PacketType::Data, PacketFlags::RELIABLE);
        packet.payload = payload;

        let signature = calculate_signature(&packet, ACCESS_KEY, &[]);
        assert_eq!(signature.len(), 4);
        assert_eq!(signature == EMPTY_PAYLOAD_SIGNATURE.to_vec(), expect_constant);
    }

    #[test]
    fn test_handshake_signature_echoes_connection_signature() {
        let packet = sample_packet(PacketType::Connect, PacketFlags::NEEDS_ACK);
        assert_eq!(
            calculate_signature(&packet, ACCESS_KEY, &[4, 3, 2, 1]),
            vec![4, 3, 2, 1]
        );
        assert_eq!(calculate_signature(&packet, ACCESS_KEY, &[]), vec![0; 4]);
    }

    #[test]
    fn test_connection_signature_is_deterministic_per_address() {
        let a = calculate_connection_signature(peer()).unwrap();
        let b = calculate_connection_signature(peer()).unwrap();
        let c = calculate_connection_signature(SocketAddr::from(([192, 168, 0, 21], 60123))).unwrap();

        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
