//! Per-remote session state. A peer is created on first contact, reset on
//!  SYN, completed on CONNECT and destroyed on DISCONNECT or heartbeat
//!  expiry. All packet processing for a peer runs under its state lock.

use crate::packet::WireVersion;
use crate::substream::ReliableSubstream;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandshakeState {
    /// Created on first datagram; only SYN is meaningful
    Fresh,
    /// SYN answered, waiting for CONNECT
    Syned,
    /// Session established; DATA / PING / DISCONNECT flow
    Connected,
}

pub struct Peer {
    pub address: SocketAddr,
    pub(crate) state: Mutex<PeerState>,
}

impl Peer {
    /// `default_version` is the configured wire version, used until the
    ///  peer's own SYN tells us what it actually speaks
    pub(crate) fn new(address: SocketAddr, default_version: WireVersion) -> Peer {
        Peer {
            address,
            state: Mutex::new(PeerState::new(default_version)),
        }
    }
}

pub(crate) struct PeerState {
    pub handshake: HandshakeState,
    /// Wire version the peer spoke on its SYN
    pub version: WireVersion,
    pub pid: u32,
    pub minor_version: u32,
    pub supported_functions: u32,

    /// The connection signature this server computed for the peer and
    ///  advertised on SYN-ACK
    pub local_signature: Vec<u8>,
    /// The connection signature the peer supplied on CONNECT; outgoing
    ///  packets are signed against it
    pub remote_signature: Vec<u8>,

    /// Empty until a secure CONNECT completes
    pub session_key: Vec<u8>,

    pub source_stream_type: u8,
    pub source_port: u8,
    pub destination_stream_type: u8,
    pub destination_port: u8,

    substreams: Vec<ReliableSubstream>,
    unreliable_sequence_id: u16,
    ping_sequence_id: u16,

    pub heartbeat: Option<AbortHandle>,
}

impl PeerState {
    fn new(version: WireVersion) -> PeerState {
        PeerState {
            handshake: HandshakeState::Fresh,
            version,
            pid: 0,
            minor_version: 0,
            supported_functions: 0,
            local_signature: Vec::new(),
            remote_signature: Vec::new(),
            session_key: Vec::new(),
            source_stream_type: 0,
            source_port: 0,
            destination_stream_type: 0,
            destination_port: 0,
            substreams: vec![ReliableSubstream::new()],
            unreliable_sequence_id: 0,
            ping_sequence_id: 0,
            heartbeat: None,
        }
    }

    /// Back to a clean slate, as on SYN: signatures and keys cleared, a
    ///  single fresh substream, counters rewound. The heartbeat is left
    ///  running - the peer is alive, just starting over.
    pub fn reset(&mut self) {
        self.handshake = HandshakeState::Fresh;
        self.pid = 0;
        self.minor_version = 0;
        self.supported_functions = 0;
        self.local_signature.clear();
        self.remote_signature.clear();
        self.session_key.clear();
        self.create_substreams(0);
        self.unreliable_sequence_id = 0;
        self.ping_sequence_id = 0;
    }

    /// Substreams 0..=max, replacing whatever existed
    pub fn create_substreams(&mut self, maximum_substream_id: u8) {
        self.substreams = (0..=maximum_substream_id)
            .map(|_| ReliableSubstream::new())
            .collect();
    }

    /// Fail-safe accessor: a packet may carry a substream id the session
    ///  never negotiated, in which case substream 0 is assumed. A torn-down
    ///  peer that still sees traffic in the same datagram gets a throwaway
    ///  substream rather than an index fault.
    pub fn substream_mut(&mut self, substream_id: u8) -> &mut ReliableSubstream {
        if self.substreams.is_empty() {
            self.substreams.push(ReliableSubstream::new());
        }
        let index = if (substream_id as usize) < self.substreams.len() {
            substream_id as usize
        } else {
            0
        };
        &mut self.substreams[index]
    }

    pub fn set_session_key(&mut self, key: Vec<u8>) {
        for substream in &mut self.substreams {
            substream.set_cipher_key(&key);
        }
        self.session_key = key;
    }

    pub fn next_unreliable_sequence_id(&mut self) -> u16 {
        self.unreliable_sequence_id = self.unreliable_sequence_id.wrapping_add(1);
        self.unreliable_sequence_id
    }

    pub fn next_ping_sequence_id(&mut self) -> u16 {
        self.ping_sequence_id = self.ping_sequence_id.wrapping_add(1);
        self.ping_sequence_id
    }

    /// Stops all timers and releases the substream buffers. Must run on
    ///  every teardown path.
    pub fn cleanup(&mut self) {
        self.handshake = HandshakeState::Fresh;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        for substream in &self.substreams {
            substream.resend.clear();
        }
        self.substreams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substream_accessor_clamps_to_zero() {
        let mut state = PeerState::new(WireVersion::V1);
        state.create_substreams(2);

        state.substream_mut(1).next_outgoing_sequence_id();
        state.substream_mut(1).next_outgoing_sequence_id();

        // id 7 was never negotiated, so substream 0 is used
        assert_eq!(state.substream_mut(7).next_outgoing_sequence_id(), 1);
        assert_eq!(state.substream_mut(1).next_outgoing_sequence_id(), 3);
    }

    #[test]
    fn test_reset_clears_session_material() {
        let mut state = PeerState::new(WireVersion::V1);
        state.handshake = HandshakeState::Connected;
        state.local_signature = vec![1; 16];
        state.remote_signature = vec![2; 16];
        state.set_session_key(vec![3; 32]);
        state.next_unreliable_sequence_id();
        state.next_ping_sequence_id();

        state.reset();

        assert_eq!(state.handshake, HandshakeState::Fresh);
        assert!(state.local_signature.is_empty());
        assert!(state.remote_signature.is_empty());
        assert!(state.session_key.is_empty());
        assert_eq!(state.next_unreliable_sequence_id(), 1);
        assert_eq!(state.next_ping_sequence_id(), 1);
    }

    #[test]
    fn test_counters_are_separate() {
        let mut state = PeerState::new(WireVersion::V1);
        assert_eq!(state.next_unreliable_sequence_id(), 1);
        assert_eq!(state.next_unreliable_sequence_id(), 2);
        assert_eq!(state.next_ping_sequence_id(), 1);
    }
}
