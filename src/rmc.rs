//! Minimal decode of the RMC frames carried inside reliable DATA payloads.
//!  The session layer only reassembles and decodes the envelope; method
//!  dispatch belongs to the protocol layer above.

use crate::byte_stream::{ByteStreamIn, ByteStreamSettings};
use crate::error::{PrudpError, Result};
use bytes::Bytes;

const REQUEST_BIT: u8 = 0x80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RmcMessage {
    pub is_request: bool,
    pub protocol_id: u8,
    pub call_id: u32,
    pub method_id: u32,
    /// Response-only: 0 on success, the error code otherwise
    pub error_code: u32,
    pub parameters: Bytes,
}

impl RmcMessage {
    pub fn from_bytes(data: &[u8], settings: ByteStreamSettings) -> Result<RmcMessage> {
        let mut stream = ByteStreamIn::new(data.to_vec(), settings);

        let size = stream.read_u32_le()? as usize;
        if size != stream.remaining() {
            return Err(PrudpError::decode(format!(
                "RMC message length {} does not match remaining data {}",
                size,
                stream.remaining()
            )));
        }

        let protocol_id = stream.read_u8()?;

        if protocol_id & REQUEST_BIT != 0 {
            Ok(RmcMessage {
                is_request: true,
                protocol_id: protocol_id & !REQUEST_BIT,
                call_id: stream.read_u32_le()?,
                method_id: stream.read_u32_le()?,
                error_code: 0,
                parameters: stream.read_remaining(),
            })
        } else {
            let success = stream.read_u8()?;
            if success == 1 {
                Ok(RmcMessage {
                    is_request: false,
                    protocol_id,
                    call_id: stream.read_u32_le()?,
                    method_id: stream.read_u32_le()? & !0x8000,
                    error_code: 0,
                    parameters: stream.read_remaining(),
                })
            } else {
                let error_code = stream.read_u32_le()?;
                Ok(RmcMessage {
                    is_request: false,
                    protocol_id,
                    call_id: stream.read_u32_le()?,
                    method_id: 0,
                    error_code,
                    parameters: Bytes::new(),
                })
            }
        }
    }
}
