//! The dispatcher: owns the UDP socket and the peer registry, demultiplexes
//!  datagrams to per-peer session state, drives the handshake and reliable
//!  delivery, and surfaces session events to subscribers. This is where all
//!  other parts of the protocol come together.

use crate::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::config::PrudpConfig;
use crate::crypto::kerberos;
use crate::error::{PrudpError, Result};
use crate::events::{Event, EventHandlers, PacketHandler};
use crate::packet::{v0, v1, PacketFlags, PacketType, PrudpPacket, WireVersion, V1_MAGIC};
use crate::peer::{HandshakeState, Peer, PeerState};
use crate::rmc::RmcMessage;
use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

const RECEIVE_BUFFER_SIZE: usize = 64_000;

/// A PRUDP server. Configure it, subscribe to its events, then [listen](Self::listen).
///
/// ```no_run
/// # use prudp::{PrudpConfig, PrudpServer};
/// # async fn run() -> prudp::Result<()> {
/// let server = PrudpServer::new(PrudpConfig {
///     access_key: "ridfebb9".to_string(),
///     ..Default::default()
/// })?;
///
/// server.on_reliable_data(|packet| {
///     if let Some(message) = &packet.rmc {
///         println!("protocol {} method {}", message.protocol_id, message.method_id);
///     }
/// });
///
/// server.listen(60000).await
/// # }
/// ```
pub struct PrudpServer {
    core: Arc<ServerCore>,
}

impl PrudpServer {
    pub fn new(config: PrudpConfig) -> Result<PrudpServer> {
        config.validate()?;
        Ok(PrudpServer {
            core: Arc::new(ServerCore::new(config)),
        })
    }

    pub fn on(&self, event: Event, handler: impl Fn(Arc<PrudpPacket>) + Send + Sync + 'static) {
        self.core.events.on(event, Arc::new(handler) as PacketHandler);
    }

    pub fn on_syn(&self, handler: impl Fn(Arc<PrudpPacket>) + Send + Sync + 'static) {
        self.on(Event::Syn, handler);
    }

    pub fn on_connect(&self, handler: impl Fn(Arc<PrudpPacket>) + Send + Sync + 'static) {
        self.on(Event::Connect, handler);
    }

    pub fn on_reliable_data(&self, handler: impl Fn(Arc<PrudpPacket>) + Send + Sync + 'static) {
        self.on(Event::ReliableData, handler);
    }

    pub fn on_disconnect(&self, handler: impl Fn(Arc<PrudpPacket>) + Send + Sync + 'static) {
        self.on(Event::Disconnect, handler);
    }

    /// Binds the UDP socket and processes datagrams until a fatal socket
    ///  error. One receive worker per CPU shares the socket; the OS fans
    ///  datagrams out among them.
    pub async fn listen(&self, port: u16) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        info!("listening for PRUDP traffic on {:?}", socket.local_addr()?);
        self.core.install_sink(Arc::new(socket.clone()));

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let core = self.core.clone();
            let socket = socket.clone();
            tasks.spawn(async move { listen_worker(core, socket).await });
        }

        // the first worker to die takes the server down with it
        let result = match tasks.join_next().await {
            Some(Ok(e)) => Err(PrudpError::Resource(e)),
            Some(Err(join_error)) => Err(PrudpError::Resource(std::io::Error::other(join_error))),
            None => Ok(()),
        };
        tasks.abort_all();
        result
    }

    /// Sends an application payload to the peer the packet template names.
    ///  Fragmentation, sequencing, encryption, signing and retransmission
    ///  all happen here.
    pub async fn send(&self, packet: PrudpPacket) {
        self.core.send(packet).await;
    }

    /// Allocates a connection id for the upstream secure-connection flow
    pub fn next_connection_id(&self) -> u32 {
        self.core.next_connection_id()
    }

    pub fn config(&self) -> &PrudpConfig {
        &self.core.config
    }
}

async fn listen_worker(core: Arc<ServerCore>, socket: Arc<UdpSocket>) -> std::io::Error {
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((read, from)) => core.handle_datagram(from, &buffer[..read]).await,
            Err(e) => {
                error!("fatal socket error: {}", e);
                return e;
            }
        }
    }
}

/// Where finished wire bytes leave the dispatcher. [PrudpServer::listen]
///  points this at the shared UDP socket; tests substitute doubles so
///  handshakes, acks and retransmission can be observed without a network.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait DatagramSink: Send + Sync + 'static {
    async fn deliver(&self, peer: SocketAddr, wire_bytes: &[u8]);
}

#[async_trait]
impl DatagramSink for Arc<UdpSocket> {
    async fn deliver(&self, peer: SocketAddr, wire_bytes: &[u8]) {
        if let Err(e) = self.send_to(wire_bytes, peer).await {
            // a lost datagram is not fatal here: reliable traffic is covered
            // by the scheduler, everything else tolerates loss anyway
            warn!("could not deliver {} bytes to {:?}: {}", wire_bytes.len(), peer, e);
        }
    }
}

pub(crate) struct ServerCore {
    pub(crate) config: PrudpConfig,
    /// Random per-instance key for v1 connection signatures
    signature_key: [u8; 16],
    sink: OnceLock<Arc<dyn DatagramSink>>,
    pub(crate) peers: DashMap<SocketAddr, Arc<Peer>>,
    events: EventHandlers,
    connection_id_counter: AtomicU32,
}

impl ServerCore {
    fn new(config: PrudpConfig) -> ServerCore {
        let mut signature_key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut signature_key);

        ServerCore {
            config,
            signature_key,
            sink: OnceLock::new(),
            peers: DashMap::new(),
            events: EventHandlers::new(),
            connection_id_counter: AtomicU32::new(10),
        }
    }

    pub(crate) fn install_sink(&self, sink: Arc<dyn DatagramSink>) {
        if self.sink.set(sink).is_err() {
            warn!("outbound sink already installed - keeping the first one");
        }
    }

    fn sink(&self) -> Option<Arc<dyn DatagramSink>> {
        self.sink.get().cloned()
    }

    pub(crate) fn next_connection_id(&self) -> u32 {
        self.connection_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Entry point for one inbound datagram: find or create the peer, parse
    ///  the packet chain, route each packet
    pub(crate) async fn handle_datagram(self: &Arc<Self>, from: SocketAddr, data: &[u8]) {
        if data.len() < 2 {
            debug!("runt datagram from {:?} - dropping", from);
            return;
        }

        let peer = self
            .peers
            .entry(from)
            .or_insert_with(|| {
                debug!("first contact from {:?}", from);
                Arc::new(Peer::new(from, self.config.version))
            })
            .clone();

        let packets = if data[..2] == V1_MAGIC {
            v1::parse_packets(data, from)
        } else {
            v0::parse_packets(data, from, &self.config.access_key)
        };

        if packets.is_empty() {
            debug!("datagram from {:?} contained no valid packets", from);
            return;
        }

        for packet in packets {
            self.process_packet(&peer, packet).await;
        }
    }

    async fn process_packet(self: &Arc<Self>, peer: &Arc<Peer>, packet: PrudpPacket) {
        let mut state = peer.state.lock().await;
        self.reset_heartbeat(peer, &mut state);

        if packet.is_any_ack() {
            self.handle_acknowledgment(&mut state, &packet);
            return;
        }

        match packet.packet_type {
            PacketType::Syn => self.handle_syn(peer, &mut state, packet).await,
            PacketType::Connect => self.handle_connect(peer, &mut state, packet).await,
            PacketType::Data => self.handle_data(peer, &mut state, packet).await,
            PacketType::Disconnect => {
                if packet.has_flag(PacketFlags::NEEDS_ACK) {
                    self.acknowledge_packet(peer, &mut state, &packet).await;
                }
                drop(state);
                self.tear_down_peer(peer, Some(Arc::new(packet))).await;
            }
            PacketType::Ping => self.handle_ping(peer, &mut state, packet).await,
        }
    }

    async fn handle_syn(self: &Arc<Self>, peer: &Arc<Peer>, state: &mut PeerState, packet: PrudpPacket) {
        let connection_signature =
            match packet.calculate_connection_signature(peer.address, &self.signature_key) {
                Ok(signature) => signature,
                Err(e) => {
                    debug!("cannot compute connection signature for {:?}: {}", peer.address, e);
                    return;
                }
            };

        state.reset();
        state.version = packet.version;
        state.handshake = HandshakeState::Syned;
        state.source_stream_type = packet.source_stream_type;
        state.source_port = packet.source_port;
        state.destination_stream_type = packet.destination_stream_type;
        state.destination_port = packet.destination_port;
        state.local_signature = connection_signature.clone();

        let mut ack = PrudpPacket::new(packet.version, peer.address);
        ack.packet_type = PacketType::Syn;
        ack.flags = PacketFlags::ACK | PacketFlags::HAS_SIZE;
        ack.source_stream_type = packet.destination_stream_type;
        ack.source_port = packet.destination_port;
        ack.destination_stream_type = packet.source_stream_type;
        ack.destination_port = packet.source_port;
        ack.connection_signature = connection_signature;
        ack.signature = ack.calculate_signature(&self.config.access_key, &[], &[]);

        self.events.emit(Event::Syn, Arc::new(ack.clone()));
        self.send_raw(peer.address, &ack.serialize(&self.config.access_key)).await;
    }

    async fn handle_connect(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        state: &mut PeerState,
        packet: PrudpPacket,
    ) {
        if state.handshake != HandshakeState::Syned {
            debug!("CONNECT from {:?} without preceding SYN - dropping", peer.address);
            return;
        }

        state.remote_signature = packet.connection_signature.clone();

        let mut ack = PrudpPacket::new(packet.version, peer.address);
        ack.packet_type = PacketType::Connect;
        ack.flags = PacketFlags::ACK | PacketFlags::HAS_SIZE;
        ack.source_stream_type = packet.destination_stream_type;
        ack.source_port = packet.destination_port;
        ack.destination_stream_type = packet.source_stream_type;
        ack.destination_port = packet.source_port;
        ack.session_id = 0;
        ack.sequence_id = 1;
        ack.connection_signature = vec![0; state.local_signature.len()];

        if packet.version == WireVersion::V1 {
            // tell the peer we support exactly what it asked for
            ack.minor_version = packet.minor_version;
            ack.supported_functions = packet.supported_functions;
            ack.maximum_substream_id = packet.maximum_substream_id;

            state.minor_version = packet.minor_version;
            state.supported_functions = packet.supported_functions;
            state.create_substreams(packet.maximum_substream_id);
        } else {
            state.create_substreams(0);
        }

        if self.config.is_secure_server {
            let settings = self.config.stream_settings_for(state.minor_version);
            let validated = kerberos::validate_connect_payload(
                &packet.payload,
                &self.config.kerberos_password,
                self.config.kerberos_ticket_version,
                self.config.kerberos_key_size,
                settings,
                SystemTime::now(),
            );

            match validated {
                Ok(ticket) => {
                    state.pid = ticket.user_pid;
                    state.set_session_key(ticket.session_key);

                    // the response is a Buffer whose content is checkValue+1
                    let mut response = ByteStreamOut::new(settings);
                    response.write_u32_le(4);
                    response.write_u32_le(ticket.check_value.wrapping_add(1));
                    ack.payload = response.into_bytes();
                }
                Err(e) => {
                    warn!("rejecting CONNECT from {:?}: {}", peer.address, e);
                    return;
                }
            }
        }

        ack.signature =
            ack.calculate_signature(&self.config.access_key, &[], &packet.connection_signature);

        state.handshake = HandshakeState::Connected;

        self.events.emit(Event::Connect, Arc::new(ack.clone()));
        self.send_raw(peer.address, &ack.serialize(&self.config.access_key)).await;
    }

    async fn handle_data(self: &Arc<Self>, peer: &Arc<Peer>, state: &mut PeerState, packet: PrudpPacket) {
        if state.handshake != HandshakeState::Connected {
            debug!("DATA from {:?} before CONNECT completed - dropping", peer.address);
            return;
        }

        if packet.has_flag(PacketFlags::RELIABLE) {
            self.handle_reliable(peer, state, packet).await;
        } else {
            self.handle_unreliable(&packet);
        }
    }

    async fn handle_reliable(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        state: &mut PeerState,
        packet: PrudpPacket,
    ) {
        if packet.has_flag(PacketFlags::NEEDS_ACK) {
            self.acknowledge_packet(peer, &mut *state, &packet).await;
        }

        let substream_id = packet.substream_id;
        let ready = state.substream_mut(substream_id).update(packet);

        for ready_packet in ready {
            if ready_packet.packet_type != PacketType::Data {
                continue;
            }

            let cleartext = state.substream_mut(substream_id).decrypt(&ready_packet.payload);
            let assembled = state.substream_mut(substream_id).add_fragment(&cleartext);

            if ready_packet.fragment_id == 0 {
                state.substream_mut(substream_id).reset_fragmented_payload();

                let mut event_packet = ready_packet;
                let settings = self.config.stream_settings_for(state.minor_version);
                event_packet.rmc =
                    match RmcMessage::from_bytes(&assembled, settings) {
                        Ok(message) => Some(message),
                        Err(e) => {
                            debug!("reassembled payload from {:?} is not a parsable RMC message: {}", peer.address, e);
                            None
                        }
                    };
                event_packet.payload = assembled;

                self.events.emit(Event::ReliableData, Arc::new(event_packet));
            }
        }
    }

    fn handle_unreliable(&self, _packet: &PrudpPacket) {
        // unreliable DATA carries nothing the session layer acts on
    }

    async fn handle_ping(self: &Arc<Self>, peer: &Arc<Peer>, state: &mut PeerState, packet: PrudpPacket) {
        if state.handshake != HandshakeState::Connected {
            debug!("PING from {:?} before CONNECT completed - dropping", peer.address);
            return;
        }

        if packet.has_flag(PacketFlags::NEEDS_ACK) {
            self.acknowledge_packet(peer, state, &packet).await;
        }
    }

    fn handle_acknowledgment(&self, state: &mut PeerState, packet: &PrudpPacket) {
        if packet.has_flag(PacketFlags::MULTI_ACK) {
            self.handle_multi_acknowledgment(state, packet);
            return;
        }

        state
            .substream_mut(packet.substream_id)
            .resend
            .acknowledge(packet.sequence_id);
    }

    fn handle_multi_acknowledgment(&self, state: &mut PeerState, packet: &PrudpPacket) {
        let settings = self.config.stream_settings_for(state.minor_version);
        let (substream_id, base_sequence_id, mut sequence_ids) =
            match self.parse_multi_ack(packet, settings) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("malformed aggregate acknowledgment from {:?}: {}", packet.sender, e);
                    return;
                }
            };

        let substream = state.substream_mut(substream_id);

        // the scheduler lock is held during iteration, so removals are
        // collected first and applied afterwards
        substream.resend.each(|sequence_id, _| {
            if sequence_id <= base_sequence_id && !sequence_ids.contains(&sequence_id) {
                sequence_ids.push(sequence_id);
            }
        });

        for sequence_id in sequence_ids {
            substream.resend.acknowledge(sequence_id);
        }
    }

    fn parse_multi_ack(
        &self,
        packet: &PrudpPacket,
        settings: ByteStreamSettings,
    ) -> Result<(u8, u16, Vec<u16>)> {
        let mut stream = ByteStreamIn::new(packet.payload.clone(), settings);
        let mut sequence_ids = Vec::new();

        if packet.substream_id == 1 {
            // new aggregate format: the real substream id and the base are in
            // the payload
            let substream_id = stream.read_u8()?;
            let additional_count = stream.read_u8()?;
            let base_sequence_id = stream.read_u16_le()?;
            for _ in 0..additional_count {
                sequence_ids.push(stream.read_u16_le()?);
            }
            Ok((substream_id, base_sequence_id, sequence_ids))
        } else {
            // old aggregate format: the outer sequence id is the base.
            // TODO the substream is pinned to 0 here, mirroring deployed
            //  peers - it is questionable for sessions with more than one
            //  substream, but changing it would break the installed base
            let base_sequence_id = packet.sequence_id;
            while stream.remaining() > 0 {
                sequence_ids.push(stream.read_u16_le()?);
            }
            Ok((0, base_sequence_id, sequence_ids))
        }
    }

    /// Replies to a NEEDS_ACK packet: same type, endpoints swapped, same
    ///  sequence id. DISCONNECT acks go out three times because peers are
    ///  known to drop some.
    async fn acknowledge_packet(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        state: &mut PeerState,
        packet: &PrudpPacket,
    ) {
        let mut ack = PrudpPacket::new(packet.version, peer.address);
        ack.packet_type = packet.packet_type;
        ack.flags = PacketFlags::ACK;
        ack.source_stream_type = packet.destination_stream_type;
        ack.source_port = packet.destination_port;
        ack.destination_stream_type = packet.source_stream_type;
        ack.destination_port = packet.source_port;
        ack.sequence_id = packet.sequence_id;
        ack.fragment_id = packet.fragment_id;
        ack.substream_id = packet.substream_id;

        self.send_packet(peer, state, ack.clone()).await;

        if packet.packet_type == PacketType::Disconnect {
            self.send_packet(peer, state, ack.clone()).await;
            self.send_packet(peer, state, ack).await;
        }
    }

    /// The outbound path for application payloads: splits into fragments of
    ///  at most `fragment_size` bytes, with ids 1, 2, ... and the final
    ///  fragment carrying id 0
    pub(crate) async fn send(self: &Arc<Self>, packet: PrudpPacket) {
        let Some(peer) = self.peers.get(&packet.sender).map(|entry| entry.value().clone()) else {
            debug!("send for unknown peer {:?} - dropping", packet.sender);
            return;
        };
        let mut state = peer.state.lock().await;

        let mut template = packet;
        let data = std::mem::take(&mut template.payload);
        let fragment_size = self.config.fragment_size;
        let fragment_count = data.len() / fragment_size;

        let mut remaining = data.as_slice();
        let mut fragment_id: u8 = 1;
        for _ in 0..=fragment_count {
            let mut fragment_packet = template.clone();
            if remaining.len() < fragment_size {
                fragment_packet.payload = remaining.to_vec();
                fragment_packet.fragment_id = 0;
                remaining = &[];
            } else {
                fragment_packet.payload = remaining[..fragment_size].to_vec();
                fragment_packet.fragment_id = fragment_id;
                remaining = &remaining[fragment_size..];
                fragment_id = fragment_id.wrapping_add(1);
            }
            self.send_packet(&peer, &mut state, fragment_packet).await;
        }
    }

    /// Sequences, encrypts, signs and transmits one packet, registering it
    ///  with the retransmission scheduler when it demands an acknowledgment
    async fn send_packet(self: &Arc<Self>, peer: &Arc<Peer>, state: &mut PeerState, mut packet: PrudpPacket) {
        let is_ack = packet.is_any_ack();
        let reliable = packet.has_flag(PacketFlags::RELIABLE);

        if !is_ack {
            packet.sequence_id = if reliable {
                state.substream_mut(packet.substream_id).next_outgoing_sequence_id()
            } else if packet.packet_type == PacketType::Data {
                state.next_unreliable_sequence_id()
            } else if packet.packet_type == PacketType::Ping {
                state.next_ping_sequence_id()
            } else {
                0
            };
        }

        if packet.packet_type == PacketType::Data && !is_ack && reliable {
            let encrypted = state.substream_mut(packet.substream_id).encrypt(&packet.payload);
            packet.payload = encrypted;
        }
        // TODO decide whether unreliable DATA should be encrypted as well -
        //  deployed peers currently send it in the clear

        packet.signature = packet.calculate_signature(
            &self.config.access_key,
            &state.session_key,
            &state.remote_signature,
        );

        let bytes = packet.serialize(&self.config.access_key);

        if reliable && packet.has_flag(PacketFlags::NEEDS_ACK) {
            if let Some(sink) = self.sink() {
                let core = Arc::downgrade(self);
                let peer = peer.clone();
                state.substream_mut(packet.substream_id).resend.add_packet(
                    packet.sequence_id,
                    bytes.clone(),
                    peer.address,
                    sink,
                    self.config.resend_interval,
                    self.config.max_resend_attempts,
                    move || {
                        if let Some(core) = core.upgrade() {
                            tokio::spawn(async move {
                                core.tear_down_peer(&peer, None).await;
                            });
                        }
                    },
                );
            }
        }

        self.send_raw(packet.sender, &bytes).await;
    }

    async fn send_raw(&self, to: SocketAddr, data: &[u8]) {
        match self.sink() {
            Some(sink) => sink.deliver(to, data).await,
            None => warn!("no outbound sink installed yet - dropping datagram to {:?}", to),
        }
    }

    async fn send_ping(self: &Arc<Self>, peer: &Arc<Peer>) {
        let mut state = peer.state.lock().await;

        let mut ping = PrudpPacket::new(state.version, peer.address);
        ping.packet_type = PacketType::Ping;
        ping.flags = PacketFlags::NEEDS_ACK;
        ping.source_stream_type = state.destination_stream_type;
        ping.source_port = state.destination_port;
        ping.destination_stream_type = state.source_stream_type;
        ping.destination_port = state.source_port;
        ping.substream_id = 0;

        self.send_packet(peer, &mut state, ping).await;
    }

    /// Re-arms the peer's silence watchdog: after `ping_timeout` a PING goes
    ///  out, and after a second `ping_timeout` of silence the peer is
    ///  considered dead
    fn reset_heartbeat(self: &Arc<Self>, peer: &Arc<Peer>, state: &mut PeerState) {
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.abort();
        }

        let core = Arc::downgrade(self);
        let peer = peer.clone();
        let timeout = self.config.ping_timeout;

        state.heartbeat = Some(
            tokio::spawn(async move {
                time::sleep(timeout).await;
                let Some(core) = core.upgrade() else { return };

                debug!("peer {:?} silent for {:?}, sending ping", peer.address, timeout);
                core.send_ping(&peer).await;

                time::sleep(timeout).await;
                debug!("peer {:?} did not react to ping, assuming it is dead", peer.address);
                core.tear_down_peer(&peer, None).await;
            })
            .abort_handle(),
        );
    }

    /// Removes the peer, stops every timer it owns and announces the
    ///  departure. All teardown paths (DISCONNECT, heartbeat expiry,
    ///  retransmission give-up) end up here. The registry entry is only
    ///  removed if it still holds this very peer - a stale timer must not
    ///  evict a successor session on the same address.
    pub(crate) async fn tear_down_peer(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        packet: Option<Arc<PrudpPacket>>,
    ) {
        let removed = self
            .peers
            .remove_if(&peer.address, |_, current| Arc::ptr_eq(current, peer));
        if removed.is_none() {
            return;
        }
        debug!("removing peer {:?}", peer.address);

        let mut state = peer.state.lock().await;
        let version = state.version;
        state.cleanup();
        drop(state);

        let event_packet = packet.unwrap_or_else(|| {
            // heartbeat expiry and scheduler give-up have no inbound packet
            // to hand to subscribers, so the event carries a synthesized one
            let mut synthesized = PrudpPacket::new(version, peer.address);
            synthesized.packet_type = PacketType::Disconnect;
            Arc::new(synthesized)
        });
        self.events.emit(Event::Disconnect, event_packet);
    }
}
