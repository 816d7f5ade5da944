//! The Kerberos-style ticket exchange that authenticates peers on secure
//!  servers: key derivation from password + PID, MAC'd RC4 encryption, the
//!  ticket internal data carried inside CONNECT, and the validation path that
//!  turns a CONNECT payload into a session key, user PID and check value.

use crate::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings, DateTime};
use crate::crypto::rc4::Rc4;
use crate::crypto::hmac_md5;
use crate::error::{PrudpError, Result};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use std::time::{Duration, SystemTime};

/// The well-known PID of the secure server, the target principal of every
///  ticket a client presents on CONNECT
pub const SECURE_SERVER_PID: u32 = 2;

/// Tickets are only honored for this long after their issue timestamp
pub const TICKET_VALIDITY: Duration = Duration::from_secs(120);

const MAC_SIZE: usize = 16;

/// Derives a principal's encryption key from its password: MD5 iterated
///  `65000 + pid % 1024` times
pub fn derive_kerberos_key(pid: u32, password: &[u8]) -> Vec<u8> {
    let mut key = password.to_vec();
    for _ in 0..(65_000 + pid % 1024) {
        key = Md5::digest(&key).to_vec();
    }
    key
}

/// RC4 with an appended integrity MAC: the ciphertext is followed by 16 bytes
///  of HMAC-MD5 over the ciphertext, keyed with the same key
pub struct KerberosEncryption {
    key: Vec<u8>,
}

impl KerberosEncryption {
    pub fn new(key: impl Into<Vec<u8>>) -> KerberosEncryption {
        KerberosEncryption { key: key.into() }
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Rc4::new(&self.key).process(data);
        let mac = hmac_md5(&self.key, &out);
        out.extend_from_slice(&mac);
        out
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < MAC_SIZE {
            return Err(PrudpError::auth("encrypted blob shorter than its MAC"));
        }

        let (ciphertext, tag) = data.split_at(data.len() - MAC_SIZE);

        let mut mac =
            Hmac::<Md5>::new_from_slice(&self.key).expect("HMAC-MD5 accepts keys of any length");
        mac.update(ciphertext);
        mac.verify_slice(tag)
            .map_err(|_| PrudpError::auth("integrity check failed"))?;

        Ok(Rc4::new(&self.key).process(ciphertext))
    }
}

/// The server-readable part of a ticket: who it was issued to, when, and the
///  session key both sides will share
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KerberosTicketInternalData {
    pub issued: DateTime,
    pub source_pid: u32,
    pub session_key: Vec<u8>,
}

impl KerberosTicketInternalData {
    /// Encrypts the internal data for the secure server. Ticket version 1
    ///  wraps the payload with a fresh per-ticket key; any other version
    ///  encrypts directly with the server key.
    pub fn encrypt(&self, key: &[u8], ticket_version: u32) -> Vec<u8> {
        let mut data = ByteStreamOut::new(ByteStreamSettings::default());
        data.write_datetime(self.issued);
        data.write_u32_le(self.source_pid);
        data.write_bytes(&self.session_key);
        let data = data.into_bytes();

        if ticket_version == 1 {
            let mut ticket_key = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut ticket_key);

            let mut final_key = key.to_vec();
            final_key.extend_from_slice(&ticket_key);
            let final_key = Md5::digest(&final_key);

            let encrypted = KerberosEncryption::new(final_key.to_vec()).encrypt(&data);

            let mut out = ByteStreamOut::new(ByteStreamSettings::default());
            out.write_buffer(&ticket_key);
            out.write_buffer(&encrypted);
            out.into_bytes()
        } else {
            KerberosEncryption::new(key).encrypt(&data)
        }
    }

    pub fn decrypt(
        stream: &mut ByteStreamIn,
        key: &[u8],
        ticket_version: u32,
        key_size: usize,
    ) -> Result<KerberosTicketInternalData> {
        let decrypted = if ticket_version == 1 {
            let ticket_key = stream.read_buffer()?;
            let data = stream.read_buffer()?;

            let mut final_key = key.to_vec();
            final_key.extend_from_slice(&ticket_key);
            let final_key = Md5::digest(&final_key);

            KerberosEncryption::new(final_key.to_vec()).decrypt(&data)?
        } else {
            KerberosEncryption::new(key).decrypt(&stream.read_remaining())?
        };

        let mut inner = ByteStreamIn::new(decrypted, stream.settings);
        Ok(KerberosTicketInternalData {
            issued: inner.read_datetime()?,
            source_pid: inner.read_u32_le()?,
            session_key: inner.read_bytes(key_size)?.to_vec(),
        })
    }
}

/// What a successfully validated CONNECT payload yields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedTicket {
    pub session_key: Vec<u8>,
    pub user_pid: u32,
    pub check_value: u32,
}

/// Validates the CONNECT payload of a secure handshake: two length-prefixed
///  buffers (the ticket, then a request block encrypted with the session
///  key). `now` is injected so the validity window is testable.
pub fn validate_connect_payload(
    payload: &[u8],
    kerberos_password: &[u8],
    ticket_version: u32,
    key_size: usize,
    settings: ByteStreamSettings,
    now: SystemTime,
) -> Result<ValidatedTicket> {
    let mut stream = ByteStreamIn::new(payload.to_vec(), settings);

    let ticket_data = stream.read_buffer()?;
    let request_data = stream.read_buffer()?;

    let server_key = derive_kerberos_key(SECURE_SERVER_PID, kerberos_password);

    let mut ticket_stream = ByteStreamIn::new(ticket_data, settings);
    let ticket = KerberosTicketInternalData::decrypt(
        &mut ticket_stream,
        &server_key,
        ticket_version,
        key_size,
    )?;

    let expiry = ticket.issued.to_system_time() + TICKET_VALIDITY;
    if now > expiry {
        return Err(PrudpError::auth("ticket expired"));
    }

    let decrypted_request =
        KerberosEncryption::new(ticket.session_key.clone()).decrypt(&request_data)?;

    let mut request = ByteStreamIn::new(decrypted_request, settings);
    let user_pid = request.read_u32_le()?;
    let _cid = request.read_u32_le()?;
    let check_value = request.read_u32_le()?;

    Ok(ValidatedTicket {
        session_key: ticket.session_key,
        user_pid,
        check_value,
    })
}
