//! RC4 keystream as used by the protocol: substream payloads and Kerberos
//!  blobs. Key lengths vary at runtime (16-byte derived keys, configurable
//!  session key sizes), which rules out the type-level key sizes of the
//!  RustCrypto `rc4` crate, so the keystream is written out here and pinned
//!  by the RFC 6229 vectors in the tests.

/// A single direction of an RC4 stream. Encryption and decryption are the
///  same operation; what matters is that each direction of a substream gets
///  its own instance so the two keystreams advance independently.
///
/// An empty key produces the identity transform: sessions without a
///  negotiated key run their substreams unencrypted.
#[derive(Clone)]
pub struct Rc4 {
    state: Option<Rc4State>,
}

#[derive(Clone)]
struct Rc4State {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Rc4 {
        if key.is_empty() {
            return Rc4 { state: None };
        }

        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }

        Rc4 {
            state: Some(Rc4State { s, i: 0, j: 0 }),
        }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        let Some(state) = &mut self.state else {
            return;
        };

        for byte in data {
            state.i = state.i.wrapping_add(1);
            state.j = state.j.wrapping_add(state.s[state.i as usize]);
            state.s.swap(state.i as usize, state.j as usize);
            let k = state.s
                [(state.s[state.i as usize].wrapping_add(state.s[state.j as usize])) as usize];
            *byte ^= k;
        }
    }

    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}
