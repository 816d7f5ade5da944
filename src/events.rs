//! The event surface: named multi-subscriber hooks the dispatcher fires at
//!  the session-layer milestones. Handlers run as their own tasks so a slow
//!  subscriber cannot stall the read path, and a panicking subscriber is
//!  contained to its task.

use crate::packet::PrudpPacket;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Event {
    /// A SYN-ACK is about to be sent
    Syn,
    /// A CONNECT-ACK is about to be sent
    Connect,
    /// A complete RMC message has been reassembled
    ReliableData,
    /// A peer left, by DISCONNECT or heartbeat expiry
    Disconnect,
}

pub type PacketHandler = Arc<dyn Fn(Arc<PrudpPacket>) + Send + Sync + 'static>;

pub(crate) struct EventHandlers {
    handlers: RwLock<FxHashMap<Event, Vec<PacketHandler>>>,
}

impl EventHandlers {
    pub fn new() -> EventHandlers {
        EventHandlers {
            handlers: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn on(&self, event: Event, handler: PacketHandler) {
        self.handlers.write().entry(event).or_default().push(handler);
    }

    pub fn emit(&self, event: Event, packet: Arc<PrudpPacket>) {
        for handler in self.handlers.read().get(&event).into_iter().flatten() {
            let handler = handler.clone();
            let packet = packet.clone();
            tokio::spawn(async move { handler(packet) });
        }
    }
}
