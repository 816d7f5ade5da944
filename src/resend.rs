//! Retransmission for reliable packets that demand an acknowledgment. Every
//!  pending packet keeps its fully serialized bytes and a timer task that
//!  re-sends them verbatim on a fixed interval until an ACK removes the
//!  entry or the attempt limit declares the peer unreachable.

use crate::server::DatagramSink;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time;
use tracing::{debug, trace};

pub(crate) struct PendingPacket {
    /// The exact bytes that went on the wire; re-sends repeat them unchanged
    pub bytes: Arc<Vec<u8>>,
    pub attempts: Arc<AtomicU32>,
    abort: AbortHandle,
}

impl Drop for PendingPacket {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

pub(crate) struct ResendScheduler {
    // NB: its own lock, nested strictly inside the peer lock. `each` holds it
    //  for the whole iteration - callers that want to mutate must collect ids
    //  first and apply afterwards (the multi-ack path relies on this).
    pending: Mutex<FxHashMap<u16, PendingPacket>>,
}

impl ResendScheduler {
    pub fn new() -> ResendScheduler {
        ResendScheduler {
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_packet(
        &self,
        sequence_id: u16,
        bytes: Vec<u8>,
        to: SocketAddr,
        sink: Arc<dyn DatagramSink>,
        interval: Duration,
        max_attempts: u32,
        on_give_up: impl FnOnce() + Send + 'static,
    ) {
        let bytes = Arc::new(bytes);
        let attempts = Arc::new(AtomicU32::new(0));

        let task_bytes = bytes.clone();
        let task_attempts = attempts.clone();
        let mut on_give_up = Some(on_give_up);

        let abort = tokio::spawn(async move {
            loop {
                time::sleep(interval).await;

                if task_attempts.load(Ordering::Relaxed) >= max_attempts {
                    debug!(
                        "packet {} to {:?} not acknowledged after {} re-sends, giving up",
                        sequence_id, to, max_attempts
                    );
                    if let Some(give_up) = on_give_up.take() {
                        give_up();
                    }
                    break;
                }

                task_attempts.fetch_add(1, Ordering::Relaxed);
                trace!("re-sending packet {} to {:?}", sequence_id, to);
                sink.deliver(to, &task_bytes).await;
            }
        })
        .abort_handle();

        self.pending.lock().insert(
            sequence_id,
            PendingPacket {
                bytes,
                attempts,
                abort,
            },
        );
    }

    /// Removes the entry and stops its timer. Unknown ids are ignored - ACKs
    ///  may arrive after a packet was already acknowledged or given up on.
    pub fn acknowledge(&self, sequence_id: u16) {
        if let Some(pending) = self.pending.lock().remove(&sequence_id) {
            trace!(
                "packet {} ({} bytes) acknowledged after {} re-sends",
                sequence_id,
                pending.bytes.len(),
                pending.attempts.load(Ordering::Relaxed)
            );
        }
    }

    /// Iterates all in-flight packets while holding the scheduler lock.
    ///  Do not call back into the scheduler from `f`.
    pub fn each(&self, mut f: impl FnMut(u16, &PendingPacket)) {
        for (&sequence_id, pending) in self.pending.lock().iter() {
            f(sequence_id, pending);
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drops every entry, stopping all timers. Used on peer teardown.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}
