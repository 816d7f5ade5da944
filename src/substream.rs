//! A reliable substream: one ordered channel within a peer session. Inbound
//!  packets are buffered until the sequence is gap-free, fragments accumulate
//!  until a fragment id of 0 completes the message, and each direction runs
//!  its own RC4 keystream derived from the session key.

use crate::crypto::rc4::Rc4;
use crate::packet::PrudpPacket;
use crate::resend::ResendScheduler;
use rustc_hash::FxHashMap;

pub(crate) struct ReliableSubstream {
    /// Sequence id the next in-order delivery must carry. Never regresses;
    ///  wraps with the u16 id space.
    expected_incoming_sequence_id: u16,
    pending: FxHashMap<u16, PrudpPacket>,
    fragmented_payload: Vec<u8>,
    outgoing_sequence_id: u16,
    cipher_in: Rc4,
    cipher_out: Rc4,
    pub resend: ResendScheduler,
}

impl ReliableSubstream {
    pub fn new() -> ReliableSubstream {
        ReliableSubstream {
            expected_incoming_sequence_id: 1,
            pending: FxHashMap::default(),
            fragmented_payload: Vec::new(),
            outgoing_sequence_id: 0,
            cipher_in: Rc4::new(&[]),
            cipher_out: Rc4::new(&[]),
            resend: ResendScheduler::new(),
        }
    }

    /// Re-keys both keystreams. The directions get independent instances so
    ///  inbound and outbound progress separately.
    pub fn set_cipher_key(&mut self, key: &[u8]) {
        self.cipher_in = Rc4::new(key);
        self.cipher_out = Rc4::new(key);
    }

    /// Buffers an inbound reliable packet and returns every packet that is
    ///  now deliverable in order. Duplicates (already buffered or already
    ///  delivered) produce nothing.
    pub fn update(&mut self, packet: PrudpPacket) -> Vec<PrudpPacket> {
        let sequence_id = packet.sequence_id;
        let mut ready = Vec::new();

        let already_delivered =
            sequence_id.wrapping_sub(self.expected_incoming_sequence_id) >= 0x8000;
        if already_delivered || self.pending.contains_key(&sequence_id) {
            return ready;
        }

        self.pending.insert(sequence_id, packet);

        while let Some(next) = self.pending.remove(&self.expected_incoming_sequence_id) {
            ready.push(next);
            self.expected_incoming_sequence_id = self.expected_incoming_sequence_id.wrapping_add(1);
        }

        ready
    }

    pub fn next_outgoing_sequence_id(&mut self) -> u16 {
        self.outgoing_sequence_id = self.outgoing_sequence_id.wrapping_add(1);
        self.outgoing_sequence_id
    }

    pub fn decrypt(&mut self, payload: &[u8]) -> Vec<u8> {
        self.cipher_in.process(payload)
    }

    pub fn encrypt(&mut self, payload: &[u8]) -> Vec<u8> {
        self.cipher_out.process(payload)
    }

    /// Appends a decrypted fragment and returns the payload accumulated so
    ///  far. The caller surfaces it (and calls [Self::reset_fragmented_payload])
    ///  once the fragment with id 0 arrives.
    pub fn add_fragment(&mut self, fragment: &[u8]) -> Vec<u8> {
        self.fragmented_payload.extend_from_slice(fragment);
        self.fragmented_payload.clone()
    }

    pub fn reset_fragmented_payload(&mut self) {
        self.fragmented_payload.clear();
    }
}
