//! Test doubles shared across the crate's test modules.

use crate::server::DatagramSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;

/// A [DatagramSink] that records every datagram instead of hitting the
///  network, for tests that need to parse what went out
#[derive(Default)]
pub struct CapturingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl CapturingSink {
    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl DatagramSink for CapturingSink {
    async fn deliver(&self, to: SocketAddr, data: &[u8]) {
        self.sent.lock().push((to, data.to_vec()));
    }
}
