//! The place where all other parts of the protocol come together: the endpoint owns the UDP
//!  socket, the peer map (indexed by address and, secondarily, by GUID), the ban and block
//!  lists, and the tasks that drive everything - a socket receive loop, a tick loop that
//!  advances every peer's reliability engine, and an event dispatch task that runs the
//!  application callbacks off the protocol path.
//!
//! The same endpoint type serves both roles; the `Role` parameter decides which side of the
//!  handshake it plays.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::RakNetConfig;
use crate::connected::{is_system_message, ConnectedMessage};
use crate::datagram::Datagram;
use crate::error::{DisconnectReason, RakNetError};
use crate::events::{Event, EventSink, PeerHandle, Receipt};
use crate::offline::OfflineMessage;
use crate::peer::{Peer, PeerState};
use crate::reliability::Reliability;
use crate::send_pipeline::SendPipeline;
use crate::{MINIMUM_MTU, PROTOCOL_VERSION};

/// Which side of the handshake this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// The ways a message destination can be named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Address(SocketAddr),
    Guid(u64),
    Peer(PeerHandle),
}

struct RunningState {
    pipeline: SendPipeline,
    event_tx: mpsc::UnboundedSender<Event>,
    recv_task: JoinHandle<()>,
    tick_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

struct PendingConnect {
    result_tx: Option<oneshot::Sender<Result<PeerHandle, RakNetError>>>,
}

/// The handle applications hold. Cheap to clone; all clones drive the same endpoint.
#[derive(Clone)]
pub struct EndPoint {
    shared: Arc<Shared>,
}

struct Shared {
    role: Role,
    config: Arc<RakNetConfig>,
    guid: u64,
    start_time: Instant,
    event_sink: Arc<dyn EventSink>,

    peers: RwLock<FxHashMap<SocketAddr, Arc<RwLock<Peer>>>>,
    /// secondary index so peers can be addressed by GUID without a linear scan
    guid_index: RwLock<FxHashMap<u64, SocketAddr>>,

    banned: RwLock<FxHashSet<IpAddr>>,
    /// blocked IPs with their expiry time
    blocked: RwLock<FxHashMap<IpAddr, Instant>>,

    pending_connects: RwLock<FxHashMap<SocketAddr, PendingConnect>>,

    running: RwLock<Option<RunningState>>,
}

impl EndPoint {
    pub fn new(
        role: Role,
        config: RakNetConfig,
        event_sink: Arc<dyn EventSink>,
    ) -> Result<EndPoint, RakNetError> {
        config.validate()?;
        Ok(EndPoint {
            shared: Arc::new(Shared {
                role,
                config: Arc::new(config),
                guid: rand::random(),
                start_time: Instant::now(),
                event_sink,
                peers: RwLock::new(FxHashMap::default()),
                guid_index: RwLock::new(FxHashMap::default()),
                banned: RwLock::new(FxHashSet::default()),
                blocked: RwLock::new(FxHashMap::default()),
                pending_connects: RwLock::new(FxHashMap::default()),
                running: RwLock::new(None),
            }),
        })
    }

    pub fn guid(&self) -> u64 {
        self.shared.guid
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Bind the socket and spawn the protocol tasks. Bind failures surface here.
    pub async fn start(&self) -> Result<(), RakNetError> {
        let mut running = self.shared.running.write().await;
        if running.is_some() {
            return Err(RakNetError::AlreadyRunning);
        }

        let socket = Arc::new(UdpSocket::bind(self.shared.config.bind_address).await?);
        info!("bound receive socket to {:?}", socket.local_addr()?);
        let pipeline = SendPipeline::new(Arc::new(socket.clone()));

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let recv_task = tokio::spawn(self.shared.clone().recv_loop(
            socket,
            pipeline.clone(),
            event_tx.clone(),
        ));
        let tick_task = tokio::spawn(
            self.shared
                .clone()
                .tick_loop(pipeline.clone(), event_tx.clone()),
        );
        let event_task = tokio::spawn(event_loop(self.shared.event_sink.clone(), event_rx));

        *running = Some(RunningState {
            pipeline,
            event_tx,
            recv_task,
            tick_task,
            event_task,
        });
        Ok(())
    }

    /// Stop the protocol tasks, notify all connected peers and release the socket
    pub async fn shutdown(&self) -> Result<(), RakNetError> {
        let running = self
            .shared
            .running
            .write()
            .await
            .take()
            .ok_or(RakNetError::NotRunning)?;

        running.recv_task.abort();
        running.tick_task.abort();

        let peers: Vec<(SocketAddr, Arc<RwLock<Peer>>)> =
            self.shared.peers.write().await.drain().collect();
        self.shared.guid_index.write().await.clear();
        for (address, peer_arc) in peers {
            let (handle, datagrams) = {
                let mut peer = peer_arc.write().await;
                peer.state = PeerState::Disconnected;
                let _ = peer.submit_system(
                    Reliability::Unreliable,
                    &ConnectedMessage::DisconnectionNotification,
                );
                (peer.handle, peer.flush(Instant::now()))
            };
            running.pipeline.send_datagrams(address, &datagrams).await;
            let _ = running
                .event_tx
                .send(Event::Disconnect(handle, DisconnectReason::Shutdown));
        }

        // dropping the sender lets the dispatch task drain the queue and finish
        drop(running.event_tx);
        let _ = running.event_task.await;
        info!("endpoint shut down");
        Ok(())
    }

    pub async fn local_addr(&self) -> Result<SocketAddr, RakNetError> {
        let running = self.shared.running.read().await;
        let running = running.as_ref().ok_or(RakNetError::NotRunning)?;
        Ok(running.pipeline.local_addr())
    }

    /// Submit a message towards a peer. Returns a receipt handle iff the reliability asks
    ///  for an ack receipt; the wire traffic happens on the next tick.
    pub async fn send_message(
        &self,
        to: Recipient,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
    ) -> Result<Option<Receipt>, RakNetError> {
        let address = self.shared.resolve(to).await?;
        let peer_arc = self
            .shared
            .peers
            .read()
            .await
            .get(&address)
            .cloned()
            .ok_or_else(|| RakNetError::NotConnected(address.to_string()))?;
        let result = peer_arc.write().await.submit(reliability, channel, payload);
        result
    }

    /// Gracefully disconnect a peer: the disconnection notification is drained to the
    ///  socket synchronously, then the peer state is torn down.
    pub async fn disconnect(&self, from: Recipient) -> Result<(), RakNetError> {
        let address = self.shared.resolve(from).await?;
        let (pipeline, event_tx) = self.shared.running_handles().await?;
        if !self
            .shared
            .remove_peer(
                address,
                DisconnectReason::Disconnected,
                true,
                &pipeline,
                &event_tx,
            )
            .await
        {
            return Err(RakNetError::NotConnected(address.to_string()));
        }
        Ok(())
    }

    /// Client role: perform the offline handshake and the connected login rounds against a
    ///  server, returning once the session is fully established.
    pub async fn connect(&self, server: SocketAddr) -> Result<PeerHandle, RakNetError> {
        if self.shared.role != Role::Client {
            return Err(RakNetError::ProtocolViolation(
                "connect is only available on client endpoints",
            ));
        }
        let (pipeline, _) = self.shared.running_handles().await?;

        let (result_tx, result_rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending_connects.write().await;
            if pending.contains_key(&server) {
                return Err(RakNetError::ProtocolViolation(
                    "a connection attempt to this address is already in progress",
                ));
            }
            pending.insert(
                server,
                PendingConnect {
                    result_tx: Some(result_tx),
                },
            );
        }

        // probe with descending transfer units; once the handshake moves past round one the
        //  probing stops
        let shared = self.shared.clone();
        let probe_task = tokio::spawn(async move {
            let mut candidates =
                vec![shared.config.maximum_transfer_unit, 1200, 576, MINIMUM_MTU];
            candidates
                .retain(|&mtu| mtu >= MINIMUM_MTU && mtu <= shared.config.maximum_transfer_unit);
            candidates.dedup();

            'probing: for mtu in candidates {
                for _ in 0..2 {
                    if !shared.pending_connects.read().await.contains_key(&server)
                        || shared.peers.read().await.contains_key(&server)
                    {
                        break 'probing;
                    }
                    debug!(
                        "sending open connection request 1 to {:?} probing mtu {}",
                        server, mtu
                    );
                    pipeline
                        .send_offline(
                            server,
                            &OfflineMessage::OpenConnectionRequest1 {
                                protocol_version: PROTOCOL_VERSION,
                                mtu,
                            },
                        )
                        .await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        });

        let result =
            tokio::time::timeout(self.shared.config.connection_timeout, result_rx).await;
        probe_task.abort();
        self.shared.pending_connects.write().await.remove(&server);

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => Err(RakNetError::ConnectTimeout(server)),
        }
    }

    pub async fn ban(&self, ip: IpAddr) {
        self.shared.banned.write().await.insert(ip);
    }

    pub async fn unban(&self, ip: IpAddr) {
        self.shared.banned.write().await.remove(&ip);
    }

    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        self.shared.banned.read().await.contains(&ip)
    }

    pub async fn block(&self, ip: IpAddr, duration: Duration) {
        self.shared
            .blocked
            .write()
            .await
            .insert(ip, Instant::now() + duration);
    }

    pub async fn unblock(&self, ip: IpAddr) {
        self.shared.blocked.write().await.remove(&ip);
    }

    pub async fn is_blocked(&self, ip: IpAddr) -> bool {
        match self.shared.blocked.read().await.get(&ip) {
            Some(&expiry) => Instant::now() < expiry,
            None => false,
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerHandle> {
        let peers = self.shared.peers.read().await;
        let mut handles = Vec::with_capacity(peers.len());
        for peer in peers.values() {
            handles.push(peer.read().await.handle);
        }
        handles
    }

    pub async fn peer_state(&self, of: Recipient) -> Option<PeerState> {
        let address = self.shared.resolve(of).await.ok()?;
        let peer_arc = self.shared.peers.read().await.get(&address).cloned()?;
        let state = peer_arc.read().await.state;
        Some(state)
    }
}

impl Shared {
    /// milliseconds since this endpoint came up; the timestamp unit used on the wire
    fn timestamp(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    async fn resolve(&self, recipient: Recipient) -> Result<SocketAddr, RakNetError> {
        match recipient {
            Recipient::Address(address) => Ok(address),
            Recipient::Peer(handle) => Ok(handle.address),
            Recipient::Guid(guid) => self
                .guid_index
                .read()
                .await
                .get(&guid)
                .copied()
                .ok_or_else(|| RakNetError::NotConnected(format!("guid {:x}", guid))),
        }
    }

    async fn running_handles(
        &self,
    ) -> Result<(SendPipeline, mpsc::UnboundedSender<Event>), RakNetError> {
        let running = self.running.read().await;
        let running = running.as_ref().ok_or(RakNetError::NotRunning)?;
        Ok((running.pipeline.clone(), running.event_tx.clone()))
    }

    async fn recv_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        pipeline: SendPipeline,
        event_tx: mpsc::UnboundedSender<Event>,
    ) {
        info!("starting receive loop");
        let mut buf = vec![0u8; (self.config.maximum_transfer_unit as usize).max(2048)];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            let data = &buf[..num_read];
            if data.is_empty() {
                continue;
            }

            if self.check_blocked(from.ip()).await {
                trace!("dropping datagram from blocked address {:?}", from);
                continue;
            }
            let banned = self.banned.read().await.contains(&from.ip());

            // the high bit of the first byte separates connected datagrams from offline messages
            if data[0] & 0x80 != 0 {
                if banned {
                    continue;
                }
                self.handle_connected_datagram(from, data, &pipeline, &event_tx)
                    .await;
            } else {
                self.handle_offline_message(from, data, banned, &pipeline, &event_tx)
                    .await;
            }
        }
    }

    /// true = drop traffic from this address. Expired entries are cleaned up on the way.
    async fn check_blocked(&self, ip: IpAddr) -> bool {
        let expiry = match self.blocked.read().await.get(&ip) {
            Some(&expiry) => expiry,
            None => return false,
        };
        if Instant::now() < expiry {
            return true;
        }
        self.blocked.write().await.remove(&ip);
        debug!("block of {:?} expired", ip);
        false
    }

    async fn handle_connected_datagram(
        &self,
        from: SocketAddr,
        data: &[u8],
        pipeline: &SendPipeline,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        let Some(peer_arc) = self.peers.read().await.get(&from).cloned() else {
            debug!("connected datagram from unknown address {:?} - dropping", from);
            return;
        };

        let datagram = match Datagram::deser(&mut &data[..]) {
            Ok(datagram) => datagram,
            Err(e) => {
                // never fatal to the peer
                warn!("undecodable datagram from {:?} - dropping: {}", from, e);
                return;
            }
        };

        let now = Instant::now();
        let mut peer = peer_arc.write().await;
        if !peer.register_inbound(now, self.config.max_packets_per_second) {
            let handle = peer.handle;
            drop(peer);
            warn!(
                "peer {:?} exceeded {} packets per second - blocking for {:?}",
                from, self.config.max_packets_per_second, self.config.flood_block_duration
            );
            self.blocked
                .write()
                .await
                .insert(from.ip(), Instant::now() + self.config.flood_block_duration);
            let _ = event_tx.send(Event::PeerError(handle, RakNetError::Flood));
            self.remove_peer(from, DisconnectReason::Flood, false, pipeline, event_tx)
                .await;
            return;
        }

        match datagram {
            Datagram::Ack { records } => {
                let handle = peer.handle;
                for receipt in peer.on_ack(&records) {
                    let _ = event_tx.send(Event::Acknowledge(handle, receipt));
                }
            }
            Datagram::Nack { records } => {
                let handle = peer.handle;
                for receipt in peer.on_nack(&records) {
                    let _ = event_tx.send(Event::NotAcknowledge(handle, receipt));
                }
            }
            Datagram::Data {
                sequence_number,
                messages,
            } => {
                let handle = peer.handle;
                let delivered = peer.on_data(sequence_number, messages);
                drop(peer);
                for (channel, payload) in delivered {
                    if is_system_message(&payload) {
                        self.handle_system_message(&peer_arc, handle, payload, pipeline, event_tx)
                            .await;
                    } else {
                        let _ = event_tx.send(Event::Message(handle, channel, payload));
                    }
                }
            }
        }
    }

    /// A protocol-internal message delivered by the reliability engine - this is where the
    ///  connected half of the state machine advances
    async fn handle_system_message(
        &self,
        peer_arc: &Arc<RwLock<Peer>>,
        handle: PeerHandle,
        payload: Bytes,
        pipeline: &SendPipeline,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        let message = match ConnectedMessage::deser(&mut &payload[..]) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "undecodable system message from {:?} - dropping: {}",
                    handle.address, e
                );
                return;
            }
        };
        trace!("system message from {:?}: {:?}", handle.address, message);

        match message {
            ConnectedMessage::Ping { timestamp } => {
                let _ = peer_arc.write().await.submit_system(
                    Reliability::Unreliable,
                    &ConnectedMessage::Pong {
                        ping_timestamp: timestamp,
                        pong_timestamp: self.timestamp(),
                    },
                );
            }
            ConnectedMessage::Pong { .. } => {
                // liveness was already refreshed when the datagram arrived
            }
            ConnectedMessage::ConnectionRequest {
                client_guid: _,
                timestamp,
            } => {
                if self.role != Role::Server {
                    self.on_illegal_system_message(
                        handle,
                        "connection request sent to a client",
                        pipeline,
                        event_tx,
                    )
                    .await;
                    return;
                }
                let mut peer = peer_arc.write().await;
                if peer.state != PeerState::Connected {
                    drop(peer);
                    self.on_illegal_system_message(
                        handle,
                        "connection request outside the connected state",
                        pipeline,
                        event_tx,
                    )
                    .await;
                    return;
                }
                peer.state = PeerState::Handshaking;
                let _ = peer.submit_system(
                    Reliability::Reliable,
                    &ConnectedMessage::ConnectionRequestAccepted {
                        client_address: handle.address,
                        request_timestamp: timestamp,
                        timestamp: self.timestamp(),
                    },
                );
            }
            ConnectedMessage::ConnectionRequestAccepted {
                request_timestamp, ..
            } => {
                if self.role != Role::Client {
                    self.on_illegal_system_message(
                        handle,
                        "connection accept sent to a server",
                        pipeline,
                        event_tx,
                    )
                    .await;
                    return;
                }
                let mut peer = peer_arc.write().await;
                if peer.state != PeerState::Connected {
                    // the accept is reliable but the server may repeat it if our final round
                    //  got delayed; not worth tearing the session down
                    debug!("repeated connection accept from {:?} - ignoring", handle.address);
                    return;
                }
                let _ = peer.submit_system(
                    Reliability::Reliable,
                    &ConnectedMessage::NewIncomingConnection {
                        server_address: handle.address,
                        request_timestamp,
                        timestamp: self.timestamp(),
                    },
                );
                peer.state = PeerState::LoggedIn;
                drop(peer);
                info!("logged in at {:?}", handle.address);
                let _ = event_tx.send(Event::Login(handle));
                if let Some(pending) =
                    self.pending_connects.write().await.get_mut(&handle.address)
                {
                    if let Some(result_tx) = pending.result_tx.take() {
                        let _ = result_tx.send(Ok(handle));
                    }
                }
            }
            ConnectedMessage::NewIncomingConnection { .. } => {
                if self.role != Role::Server {
                    self.on_illegal_system_message(
                        handle,
                        "new incoming connection sent to a client",
                        pipeline,
                        event_tx,
                    )
                    .await;
                    return;
                }
                let mut peer = peer_arc.write().await;
                if peer.state != PeerState::Handshaking {
                    debug!(
                        "unexpected new-incoming-connection from {:?} in state {:?} - ignoring",
                        handle.address, peer.state
                    );
                    return;
                }
                peer.state = PeerState::LoggedIn;
                drop(peer);
                info!("peer {:?} logged in", handle.address);
                let _ = event_tx.send(Event::Login(handle));
            }
            ConnectedMessage::DisconnectionNotification => {
                debug!("peer {:?} sent a disconnection notification", handle.address);
                self.remove_peer(
                    handle.address,
                    DisconnectReason::PeerDisconnected,
                    false,
                    pipeline,
                    event_tx,
                )
                .await;
            }
        }
    }

    /// per-peer runtime error: surface it and disconnect that peer, leaving others alone
    async fn on_illegal_system_message(
        &self,
        handle: PeerHandle,
        what: &'static str,
        pipeline: &SendPipeline,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        warn!("{} from {:?} - disconnecting", what, handle.address);
        let _ = event_tx.send(Event::PeerError(
            handle,
            RakNetError::ProtocolViolation(what),
        ));
        self.remove_peer(
            handle.address,
            DisconnectReason::Disconnected,
            true,
            pipeline,
            event_tx,
        )
        .await;
    }

    async fn handle_offline_message(
        &self,
        from: SocketAddr,
        data: &[u8],
        banned: bool,
        pipeline: &SendPipeline,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        let message = match OfflineMessage::deser(&mut &data[..]) {
            Ok(message) => message,
            Err(e) => {
                debug!("undecodable offline message from {:?} - dropping: {}", from, e);
                return;
            }
        };
        trace!("offline message from {:?}: {:?}", from, message);

        match (self.role, message) {
            (
                Role::Server,
                OfflineMessage::UnconnectedPing {
                    open_connections_only,
                    timestamp,
                    ..
                },
            ) => {
                if !self.config.broadcasting_enabled || banned {
                    return;
                }
                if open_connections_only
                    && !self.config.has_room_for(self.peers.read().await.len())
                {
                    return;
                }
                // consulted inline by necessity: the pong must carry this ping's identifier
                let identifier = self
                    .event_sink
                    .handle_ping(from)
                    .await
                    .unwrap_or_else(|| self.config.identifier.clone());
                pipeline
                    .send_offline(
                        from,
                        &OfflineMessage::UnconnectedPong {
                            timestamp,
                            server_guid: self.guid,
                            identifier,
                        },
                    )
                    .await;
            }
            (
                Role::Server,
                OfflineMessage::OpenConnectionRequest1 {
                    protocol_version,
                    mtu,
                },
            ) => {
                // a logged-in client restarting its handshake reinstantiated the connection
                let logged_in = match self.peers.read().await.get(&from) {
                    Some(peer) => peer.read().await.state == PeerState::LoggedIn,
                    None => false,
                };
                if logged_in {
                    info!("{:?} reinstantiated its connection - dropping the old peer", from);
                    self.remove_peer(
                        from,
                        DisconnectReason::Disconnected,
                        true,
                        pipeline,
                        event_tx,
                    )
                    .await;
                }

                if let Some(rejection) = self.validate_sender(from, banned).await {
                    pipeline.send_offline(from, &rejection).await;
                    return;
                }
                if protocol_version != PROTOCOL_VERSION {
                    debug!(
                        "{:?} speaks protocol version {}, we speak {} - rejecting",
                        from, protocol_version, PROTOCOL_VERSION
                    );
                    pipeline
                        .send_offline(
                            from,
                            &OfflineMessage::IncompatibleProtocolVersion {
                                protocol_version: PROTOCOL_VERSION,
                                server_guid: self.guid,
                            },
                        )
                        .await;
                    return;
                }
                let negotiated = self.negotiate_mtu(mtu);
                pipeline
                    .send_offline(
                        from,
                        &OfflineMessage::OpenConnectionReply1 {
                            server_guid: self.guid,
                            mtu: negotiated,
                        },
                    )
                    .await;
            }
            (
                Role::Server,
                OfflineMessage::OpenConnectionRequest2 {
                    mtu, client_guid, ..
                },
            ) => {
                if let Some(rejection) = self.validate_sender(from, banned).await {
                    pipeline.send_offline(from, &rejection).await;
                    return;
                }
                let negotiated = self.negotiate_mtu(mtu);
                let handle = self
                    .create_peer(from, client_guid, negotiated, event_tx)
                    .await;
                debug!("created peer {:?} with mtu {}", handle, negotiated);
                pipeline
                    .send_offline(
                        from,
                        &OfflineMessage::OpenConnectionReply2 {
                            server_guid: self.guid,
                            client_address: from,
                            mtu: negotiated,
                        },
                    )
                    .await;
            }
            (Role::Client, OfflineMessage::OpenConnectionReply1 { mtu, .. }) => {
                if !self.pending_connects.read().await.contains_key(&from) {
                    debug!("unsolicited open connection reply 1 from {:?} - dropping", from);
                    return;
                }
                if self.peers.read().await.contains_key(&from) {
                    return; // round two already completed, this is a duplicate
                }
                let negotiated = self.negotiate_mtu(mtu);
                pipeline
                    .send_offline(
                        from,
                        &OfflineMessage::OpenConnectionRequest2 {
                            server_address: from,
                            mtu: negotiated,
                            client_guid: self.guid,
                        },
                    )
                    .await;
            }
            (
                Role::Client,
                OfflineMessage::OpenConnectionReply2 {
                    server_guid, mtu, ..
                },
            ) => {
                if !self.pending_connects.read().await.contains_key(&from) {
                    debug!("unsolicited open connection reply 2 from {:?} - dropping", from);
                    return;
                }
                if self.peers.read().await.contains_key(&from) {
                    return;
                }
                let negotiated = self.negotiate_mtu(mtu);
                let handle = self
                    .create_peer(from, server_guid, negotiated, event_tx)
                    .await;
                debug!("offline handshake with {:?} complete, requesting connection", handle);

                // first connected-mode round
                if let Some(peer_arc) = self.peers.read().await.get(&from).cloned() {
                    let _ = peer_arc.write().await.submit_system(
                        Reliability::Reliable,
                        &ConnectedMessage::ConnectionRequest {
                            client_guid: self.guid,
                            timestamp: self.timestamp(),
                        },
                    );
                }
            }
            (Role::Client, OfflineMessage::IncompatibleProtocolVersion { .. }) => {
                self.fail_pending_connect(from, "incompatible protocol version")
                    .await;
            }
            (Role::Client, OfflineMessage::AlreadyConnected { .. }) => {
                self.fail_pending_connect(from, "already connected").await;
            }
            (Role::Client, OfflineMessage::NoFreeIncomingConnections { .. }) => {
                self.fail_pending_connect(from, "server is full").await;
            }
            (Role::Client, OfflineMessage::ConnectionBanned { .. }) => {
                self.fail_pending_connect(from, "banned").await;
            }
            (Role::Client, OfflineMessage::UnconnectedPong { .. }) => {
                trace!("unconnected pong from {:?}", from);
            }
            (_, other) => {
                debug!(
                    "offline message {:#04x} has no meaning for this endpoint's role - dropping",
                    other.message_id()
                );
            }
        }
    }

    /// The checks every incoming handshake round must pass, in the order existing
    ///  deployments expect them: double connect, capacity, ban.
    async fn validate_sender(&self, from: SocketAddr, banned: bool) -> Option<OfflineMessage> {
        if self.peers.read().await.contains_key(&from) {
            return Some(OfflineMessage::AlreadyConnected {
                server_guid: self.guid,
            });
        }
        if !self.config.has_room_for(self.peers.read().await.len()) {
            return Some(OfflineMessage::NoFreeIncomingConnections {
                server_guid: self.guid,
            });
        }
        if banned {
            return Some(OfflineMessage::ConnectionBanned {
                server_guid: self.guid,
            });
        }
        None
    }

    fn negotiate_mtu(&self, requested: u16) -> u16 {
        requested
            .min(self.config.maximum_transfer_unit)
            .max(MINIMUM_MTU)
    }

    async fn create_peer(
        &self,
        address: SocketAddr,
        guid: u64,
        mtu: u16,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) -> PeerHandle {
        let peer = Peer::new(address, guid, mtu, &self.config, Instant::now());
        let handle = peer.handle;
        self.peers
            .write()
            .await
            .insert(address, Arc::new(RwLock::new(peer)));
        self.guid_index.write().await.insert(guid, address);
        let _ = event_tx.send(Event::Connect(handle));
        handle
    }

    /// Tear down a peer: out of the maps, optionally notify the remote end, surface the
    ///  disconnect event. Returns false if there was no such peer.
    async fn remove_peer(
        &self,
        address: SocketAddr,
        reason: DisconnectReason,
        notify: bool,
        pipeline: &SendPipeline,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) -> bool {
        let Some(peer_arc) = self.peers.write().await.remove(&address) else {
            return false;
        };
        let (handle, datagrams) = {
            let mut peer = peer_arc.write().await;
            peer.state = PeerState::Disconnected;
            let datagrams = if notify {
                let _ = peer.submit_system(
                    Reliability::Unreliable,
                    &ConnectedMessage::DisconnectionNotification,
                );
                peer.flush(Instant::now())
            } else {
                Vec::new()
            };
            (peer.handle, datagrams)
        };
        self.guid_index.write().await.remove(&handle.guid);
        pipeline.send_datagrams(address, &datagrams).await;
        info!("peer {:?} disconnected: {}", address, reason);
        let _ = event_tx.send(Event::Disconnect(handle, reason));
        true
    }

    async fn fail_pending_connect(&self, from: SocketAddr, reason: &'static str) {
        if let Some(pending) = self.pending_connects.write().await.get_mut(&from) {
            if let Some(result_tx) = pending.result_tx.take() {
                let _ = result_tx.send(Err(RakNetError::ConnectRefused { addr: from, reason }));
            }
        }
    }

    /// Drives every peer's reliability engine, ACK/NACK emission, keep-alive and timeout
    ///  checking. Each peer's state is locked only while it is advanced; the socket writes
    ///  happen after the lock is released.
    async fn tick_loop(
        self: Arc<Self>,
        pipeline: SendPipeline,
        event_tx: mpsc::UnboundedSender<Event>,
    ) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let timestamp = self.timestamp();

            let snapshot: Vec<(SocketAddr, Arc<RwLock<Peer>>)> = self
                .peers
                .read()
                .await
                .iter()
                .map(|(&address, peer)| (address, peer.clone()))
                .collect();

            for (address, peer_arc) in snapshot {
                let (handle, timed_out, datagrams, written_off) = {
                    let mut peer = peer_arc.write().await;
                    if peer.is_timed_out(now, self.config.timeout) {
                        (peer.handle, true, Vec::new(), Vec::new())
                    } else {
                        let (datagrams, written_off) =
                            peer.tick(now, timestamp, self.config.keep_alive_interval);
                        (peer.handle, false, datagrams, written_off)
                    }
                };

                if timed_out {
                    warn!("peer {:?} timed out", address);
                    let _ = event_tx.send(Event::PeerError(handle, RakNetError::Timeout));
                    self.remove_peer(
                        address,
                        DisconnectReason::Timeout,
                        false,
                        &pipeline,
                        &event_tx,
                    )
                    .await;
                    continue;
                }
                for receipt in written_off {
                    let _ = event_tx.send(Event::NotAcknowledge(handle, receipt));
                }
                pipeline.send_datagrams(address, &datagrams).await;
            }
        }
    }
}

/// Runs the application callbacks, decoupled from the protocol loops. Per peer, events are
///  queued in the wire order of the messages that caused them, and this loop preserves it.
async fn event_loop(sink: Arc<dyn EventSink>, mut event_rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = event_rx.recv().await {
        let (address, result) = match event {
            Event::Connect(handle) => (handle.address, sink.on_connect(handle).await),
            Event::Login(handle) => (handle.address, sink.on_login(handle).await),
            Event::Disconnect(handle, reason) => {
                (handle.address, sink.on_disconnect(handle, reason).await)
            }
            Event::Message(handle, channel, payload) => (
                handle.address,
                sink.on_message(handle, channel, payload).await,
            ),
            Event::Acknowledge(handle, receipt) => {
                (handle.address, sink.on_acknowledge(handle, receipt).await)
            }
            Event::NotAcknowledge(handle, receipt) => (
                handle.address,
                sink.on_not_acknowledge(handle, receipt).await,
            ),
            Event::PeerError(handle, cause) => {
                sink.on_peer_error(handle, cause).await;
                continue;
            }
        };
        if let Err(cause) = result {
            warn!("event handler failed: {}", cause);
            sink.on_handler_error(address, cause).await;
        }
    }
}
