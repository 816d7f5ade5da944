pub mod kerberos;
pub mod rc4;

use hmac::{Hmac, Mac};
use md5::Md5;

/// HMAC-MD5, the MAC every signature in this protocol family is built on
pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC-MD5 accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
