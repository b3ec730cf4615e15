//! The tunnel community: one node's view of the overlay.
//!
//! All mutable state lives in [`TunnelCommunity`], which runs as a
//! single reactor task: a loop over incoming frames, control requests
//! from [`TunnelHandle`]s, internally generated events, and a 1 Hz
//! maintenance tick. Handlers never block; anything slow (exit-side
//! HTTP fetches, exit UDP pumps) runs in a spawned task that reports
//! back through the internal event channel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use tracing::{debug, info, warn};
use tunnel_cell::cell::{reframe, split_raw};
use tunnel_cell::frame::{Frame, FrameMsg};
use tunnel_cell::msg::{self, AnyTunnelMsg, Body};
use tunnel_cell::{CircId, InfoHash, PeerId, TunnelCmd};
use tunnel_eva::{EvaProtocol, EvaSettings};

use crate::cache::RequestCache;
use crate::circuit::{Circuit, CircuitState, CircuitType};
use crate::config::TunnelSettings;
use crate::dispatcher::{circuit_id_to_ip, TunnelDispatcher};
use crate::download::{DownloadManager, DownloadStatus};
use crate::endpoint::Endpoint;
use crate::events::{Notification, Notifier};
use crate::exitcache;
use crate::registry::{CircuitRegistry, ExitSocket};
use crate::rendezvous::{IntroService, PendingE2e, Swarm};
use crate::socks::Socks5Server;
use crate::{Error, Result};

/// The port we report for hidden-swarm peers, which have no real one.
pub(crate) const E2E_PORT: u16 = 1024;

/// Teardown reason carried in DESTROY cells we originate.
const DESTROY_REASON_SHUTDOWN: u16 = 0;

/// A control request from a [`TunnelHandle`].
pub(crate) enum CtrlMsg {
    /// Build a circuit; reply with its ID and a readiness receiver.
    CreateCircuit {
        /// Requested hop count.
        hops: u8,
        /// What the circuit is for.
        ctype: CircuitType,
        /// Flags the terminal hop must advertise.
        exit_flags: tunnel_cell::PeerFlags,
        /// The hidden swarm the circuit serves, if any.
        info_hash: Option<InfoHash>,
        /// Where to send the outcome.
        reply: oneshot::Sender<Result<(CircId, oneshot::Receiver<bool>)>>,
    },
    /// Find (or start building) a circuit with HTTP exit capability.
    GetOrCreateHttpCircuit {
        /// Requested hop count for a fresh build.
        hops: u8,
        /// Where to send the outcome.
        reply: oneshot::Sender<Result<(CircId, oneshot::Receiver<bool>)>>,
    },
    /// Send an HTTP request down a ready circuit.
    SendHttpRequest {
        /// The circuit to use.
        circuit_id: CircId,
        /// The server the exit should contact.
        target: SocketAddr,
        /// The raw HTTP request.
        request: Vec<u8>,
        /// Where to send the response receiver.
        reply: oneshot::Sender<Result<oneshot::Receiver<Result<Vec<u8>>>>>,
    },
    /// Start an EVA transfer to a peer.
    SendEva {
        /// The peer's identity.
        peer: PeerId,
        /// The peer's address.
        addr: SocketAddr,
        /// Transfer tag.
        info: Vec<u8>,
        /// Transfer payload.
        data: Vec<u8>,
        /// Where to send the completion handle.
        reply: oneshot::Sender<Result<tunnel_eva::TransferHandle>>,
    },
    /// A datagram from a local SOCKS5 session.
    SocksDatagram {
        /// Index of the server the session belongs to.
        server_index: usize,
        /// The destination the client asked for.
        dest: SocketAddr,
        /// The datagram payload.
        payload: Vec<u8>,
    },
    /// Stop the reactor.
    Shutdown {
        /// Acknowledged when the reactor has unloaded.
        reply: oneshot::Sender<()>,
    },
}

/// An event generated by one of our own spawned tasks.
pub(crate) enum ReactorEvent {
    /// An exit-side HTTP fetch finished.
    HttpFetchDone {
        /// The circuit the request came in on.
        circuit_id: CircId,
        /// The initiator's request identifier.
        identifier: u32,
        /// The fetched response, if the fetch succeeded.
        result: Result<Vec<u8>>,
    },
    /// A datagram arrived on an exit socket's internet-facing socket.
    ExitDatagram {
        /// The circuit the exit serves.
        circuit_id: CircId,
        /// Where the datagram came from.
        from: SocketAddr,
        /// The datagram payload.
        payload: Vec<u8>,
    },
    /// An incoming EVA transfer completed.
    EvaReceived {
        /// The sending peer.
        peer: PeerId,
        /// The transfer tag.
        info: Vec<u8>,
        /// The transferred bytes.
        data: Vec<u8>,
    },
}

/// A cloneable handle for talking to a running community.
#[derive(Clone)]
pub struct TunnelHandle {
    /// The control channel into the reactor.
    tx: mpsc::UnboundedSender<CtrlMsg>,
}

impl TunnelHandle {
    /// Send a control message, mapping a dead reactor to `Shutdown`.
    fn send(&self, msg: CtrlMsg) -> Result<()> {
        self.tx.unbounded_send(msg).map_err(|_| Error::Shutdown)
    }

    /// Build a circuit and wait for it to become ready.
    pub async fn create_circuit(
        &self,
        hops: u8,
        ctype: CircuitType,
        exit_flags: tunnel_cell::PeerFlags,
        info_hash: Option<InfoHash>,
    ) -> Result<CircId> {
        let (reply, rx) = oneshot::channel();
        self.send(CtrlMsg::CreateCircuit {
            hops,
            ctype,
            exit_flags,
            info_hash,
            reply,
        })?;
        let (circuit_id, ready) = rx.await.map_err(|_| Error::Shutdown)??;
        match ready.await {
            Ok(true) => Ok(circuit_id),
            _ => Err(Error::NoCircuit),
        }
    }

    /// Ask an exit node to perform an HTTP request on our behalf.
    ///
    /// Requires a circuit with HTTP exit capability; up to three
    /// builds are attempted if none exists.
    pub async fn perform_http_request(
        &self,
        target: SocketAddr,
        request: Vec<u8>,
        hops: u8,
    ) -> Result<Vec<u8>> {
        let mut circuit = None;
        for _ in 0..3 {
            let (reply, rx) = oneshot::channel();
            self.send(CtrlMsg::GetOrCreateHttpCircuit { hops, reply })?;
            let (circuit_id, ready) = rx.await.map_err(|_| Error::Shutdown)??;
            if let Ok(true) = ready.await {
                circuit = Some(circuit_id);
                break;
            }
        }
        let circuit_id = circuit.ok_or(Error::NoCircuit)?;

        let (reply, rx) = oneshot::channel();
        self.send(CtrlMsg::SendHttpRequest {
            circuit_id,
            target,
            request,
            reply,
        })?;
        let response = rx.await.map_err(|_| Error::Shutdown)??;
        response.await.map_err(|_| Error::Shutdown)?
    }

    /// Transfer `data` to a peer with EVA and wait for completion.
    pub async fn send_binary(
        &self,
        peer: PeerId,
        addr: SocketAddr,
        info: Vec<u8>,
        data: Vec<u8>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(CtrlMsg::SendEva {
            peer,
            addr,
            info,
            data,
            reply,
        })?;
        let handle = rx.await.map_err(|_| Error::Shutdown)??;
        handle.done().await.map_err(Error::from)
    }

    /// Feed a datagram from a local SOCKS5 session into the overlay.
    pub fn socks_datagram(&self, server_index: usize, dest: SocketAddr, payload: Vec<u8>) {
        let _ = self.send(CtrlMsg::SocksDatagram {
            server_index,
            dest,
            payload,
        });
    }

    /// Stop the community and wait for it to unload.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(CtrlMsg::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// One node's tunnel community.
pub struct TunnelCommunity {
    /// Configuration.
    pub(crate) settings: TunnelSettings,
    /// The UDP endpoint.
    pub(crate) endpoint: Endpoint,
    /// Circuits, relays, exits, and candidates.
    pub(crate) registry: CircuitRegistry,
    /// Outstanding request correlation.
    pub(crate) cache: RequestCache,
    /// The EVA transfer protocol instance.
    pub(crate) eva: EvaProtocol,
    /// Last known address for each EVA peer.
    pub(crate) eva_addresses: HashMap<PeerId, SocketAddr>,
    /// SOCKS5-to-circuit routing.
    pub(crate) dispatcher: TunnelDispatcher,
    /// Outbound event bus.
    pub(crate) notifier: Notifier,
    /// The download manager, if one is wired up.
    pub(crate) download_manager: Option<Arc<dyn DownloadManager>>,
    /// SOCKS5 servers, indexed by `hops - 1`.
    pub(crate) socks_servers: Vec<Socks5Server>,
    /// Hidden swarms we participate in, by lookup infohash.
    pub(crate) swarms: HashMap<InfoHash, Swarm>,
    /// Swarms we serve as an introduction point, by lookup infohash.
    pub(crate) intro_services: HashMap<InfoHash, IntroService>,
    /// Pending CreatedE2e routing at an introduction point: the
    /// seeder's circuit to us, mapped to the downloader's.
    pub(crate) pending_intro_relays: HashMap<CircId, CircId>,
    /// Rendezvous cookies we hold as a rendezvous point.
    pub(crate) rendezvous_points: HashMap<[u8; 20], CircId>,
    /// Downloader-side e2e state, by lookup infohash.
    pub(crate) pending_e2e: HashMap<InfoHash, PendingE2e>,
    /// Extensions we are carrying out on behalf of initiators: the
    /// new circuit ID, mapped to the incoming circuit and deadline.
    pub(crate) pending_extensions: HashMap<CircId, PendingExtension>,
    /// Last observed status per lookup infohash.
    pub(crate) download_states: HashMap<InfoHash, DownloadStatus>,
    /// Data circuits wanted per hop count.
    pub(crate) circuits_needed: HashMap<u8, usize>,
    /// When we last forced a DHT announce, per real infohash.
    pub(crate) last_forced_announce: HashMap<InfoHash, Instant>,
    /// Peers to re-add to downloads once circuits exist, per real
    /// infohash.
    pub(crate) bittorrent_peers: HashMap<InfoHash, HashSet<SocketAddr>>,
    /// Invoked when join admission rejects a circuit.
    pub(crate) reject_callback: Option<Box<dyn FnMut(Instant) + Send>>,
    /// Set while `unload` runs; suppresses build retries.
    shutting_down: bool,
    /// Sender for internally generated events.
    pub(crate) internal_tx: mpsc::UnboundedSender<ReactorEvent>,
    /// Receiver side, consumed by `run`.
    internal_rx: Option<mpsc::UnboundedReceiver<ReactorEvent>>,
    /// Control receiver, consumed by `run`.
    ctrl_rx: Option<mpsc::UnboundedReceiver<CtrlMsg>>,
}

/// State for an extension we are carrying out for an initiator.
pub(crate) struct PendingExtension {
    /// The circuit the EXTEND arrived on.
    pub(crate) in_circuit: CircId,
    /// The peer we sent CREATE to.
    pub(crate) node_addr: SocketAddr,
    /// When the extension started, for the timeout sweep.
    pub(crate) started: Instant,
}

impl TunnelCommunity {
    /// Construct a community and the handle for talking to it.
    pub fn new(
        settings: TunnelSettings,
        endpoint: Endpoint,
        notifier: Notifier,
        download_manager: Option<Arc<dyn DownloadManager>>,
        socks_servers: Vec<Socks5Server>,
        eva_settings: EvaSettings,
    ) -> (TunnelCommunity, TunnelHandle) {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded();
        let (internal_tx, internal_rx) = mpsc::unbounded();

        let mut eva = EvaProtocol::new(eva_settings);
        let eva_events = internal_tx.clone();
        eva.register_receive_callback(move |peer, info, data| {
            let _ = eva_events.unbounded_send(ReactorEvent::EvaReceived { peer, info, data });
        });

        info!(
            "starting tunnel community with flags {:04x}",
            settings.advertised_flags().bits()
        );

        let community = TunnelCommunity {
            settings,
            endpoint,
            registry: CircuitRegistry::new(),
            cache: RequestCache::new(),
            eva,
            eva_addresses: HashMap::new(),
            dispatcher: TunnelDispatcher::new(),
            notifier,
            download_manager,
            socks_servers,
            swarms: HashMap::new(),
            intro_services: HashMap::new(),
            pending_intro_relays: HashMap::new(),
            rendezvous_points: HashMap::new(),
            pending_e2e: HashMap::new(),
            pending_extensions: HashMap::new(),
            download_states: HashMap::new(),
            circuits_needed: HashMap::new(),
            last_forced_announce: HashMap::new(),
            bittorrent_peers: HashMap::new(),
            reject_callback: None,
            shutting_down: false,
            internal_tx,
            internal_rx: Some(internal_rx),
            ctrl_rx: Some(ctrl_rx),
        };
        (community, TunnelHandle { tx: ctrl_tx })
    }

    /// Install a callback invoked whenever join admission rejects a
    /// circuit.
    pub fn set_reject_callback<F>(&mut self, f: F)
    where
        F: FnMut(Instant) + Send + 'static,
    {
        self.reject_callback = Some(Box::new(f));
    }

    /// Run the reactor until shutdown.
    ///
    /// `frames` is the receiver returned by [`Endpoint::bind`].
    pub async fn run(mut self, mut frames: mpsc::UnboundedReceiver<(SocketAddr, Frame)>) {
        let mut ctrl_rx = match self.ctrl_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut internal_rx = match self.internal_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        self.restore_exitnodes_from_disk();

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = frames.next() => match received {
                    Some((addr, frame)) => self.on_frame(addr, frame, Instant::now()),
                    None => break,
                },
                msg = ctrl_rx.next() => match msg {
                    Some(CtrlMsg::Shutdown { reply }) => {
                        self.unload();
                        let _ = reply.send(());
                        return;
                    }
                    Some(msg) => self.on_ctrl(msg, Instant::now()),
                    None => break,
                },
                event = internal_rx.next() => {
                    if let Some(event) = event {
                        self.on_internal(event, Instant::now());
                    }
                },
                _ = tick.tick() => self.on_tick(Instant::now()),
            }
        }
        self.unload();
    }

    /// Handle one control request.
    pub(crate) fn on_ctrl(&mut self, msg: CtrlMsg, now: Instant) {
        match msg {
            CtrlMsg::CreateCircuit {
                hops,
                ctype,
                exit_flags,
                info_hash,
                reply,
            } => {
                let result = self
                    .create_circuit(hops, ctype, exit_flags, info_hash, 0, now)
                    .map(|circuit_id| {
                        let ready = self
                            .registry
                            .circuit_mut(circuit_id)
                            .map(Circuit::wait_ready)
                            .unwrap_or_else(|| {
                                let (tx, rx) = oneshot::channel();
                                let _ = tx.send(false);
                                rx
                            });
                        (circuit_id, ready)
                    });
                let _ = reply.send(result);
            }
            CtrlMsg::GetOrCreateHttpCircuit { hops, reply } => {
                let result = self.get_or_create_http_circuit(hops, now);
                let _ = reply.send(result);
            }
            CtrlMsg::SendHttpRequest {
                circuit_id,
                target,
                request,
                reply,
            } => {
                let result = self.send_http_request(circuit_id, target, request, now);
                let _ = reply.send(result);
            }
            CtrlMsg::SendEva {
                peer,
                addr,
                info,
                data,
                reply,
            } => {
                self.eva_addresses.insert(peer, addr);
                let result = self
                    .eva
                    .send_binary(peer, info, data, now)
                    .map(|(handle, frame)| {
                        self.endpoint.send_msg(addr, FrameMsg::Eva(frame));
                        handle
                    })
                    .map_err(Error::from);
                let _ = reply.send(result);
            }
            CtrlMsg::SocksDatagram {
                server_index,
                dest,
                payload,
            } => self.on_socks5_udp(server_index, dest, &payload),
            CtrlMsg::Shutdown { reply } => {
                // Reached only when called outside `run`.
                self.unload();
                let _ = reply.send(());
            }
        }
    }

    /// Handle one internally generated event.
    pub(crate) fn on_internal(&mut self, event: ReactorEvent, now: Instant) {
        match event {
            ReactorEvent::HttpFetchDone {
                circuit_id,
                identifier,
                result,
            } => self.on_http_fetch_done(circuit_id, identifier, result),
            ReactorEvent::ExitDatagram {
                circuit_id,
                from,
                payload,
            } => self.on_exit_datagram(circuit_id, from, &payload),
            ReactorEvent::EvaReceived { peer, info: _, data } => {
                debug!("EVA transfer from {} complete ({} bytes)", peer, data.len());
                self.notifier.notify(&Notification::TorrentMetadataAdded { metadata: data });
            }
        }
        let _ = now;
    }

    /// Handle one frame from the endpoint.
    pub(crate) fn on_frame(&mut self, addr: SocketAddr, frame: Frame, now: Instant) {
        let (sender, frame_msg) = frame.into_sender_and_msg();
        match frame_msg {
            FrameMsg::IntroRequest { flags } => {
                self.registry.add_candidate(sender, addr, flags, now);
                self.endpoint.send_msg(
                    addr,
                    FrameMsg::IntroResponse {
                        flags: self.settings.advertised_flags(),
                    },
                );
            }
            FrameMsg::IntroResponse { flags } => {
                self.registry.add_candidate(sender, addr, flags, now);
            }
            FrameMsg::Eva(eva_frame) => {
                self.eva_addresses.insert(sender, addr);
                for reply in self.eva.on_frame(sender, eva_frame, now) {
                    self.endpoint.send_msg(addr, FrameMsg::Eva(reply));
                }
            }
            FrameMsg::Cell(bytes) => self.on_cell(addr, sender, &bytes, now),
            _ => debug!("dropping unknown frame from {}", addr),
        }
    }

    /// Handle one tunnel cell.
    fn on_cell(&mut self, addr: SocketAddr, sender: PeerId, bytes: &[u8], now: Instant) {
        let (circuit_id, cmd, body) = match split_raw(bytes) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("dropping malformed cell from {}: {}", addr, e);
                return;
            }
        };
        match cmd {
            TunnelCmd::CREATE => self.on_create(addr, sender, circuit_id, body, now),
            TunnelCmd::CREATED => self.on_created(addr, circuit_id, body, now),
            TunnelCmd::DESTROY => self.on_destroy(addr, circuit_id, body),
            TunnelCmd::RELAY => self.on_relay_cell(addr, circuit_id, body, now),
            _ => {
                warn!(
                    "dropping out-of-place {} cell from {} on circuit {}",
                    cmd, addr, circuit_id
                );
            }
        }
    }

    /// Handle a CREATE cell: someone asks us to join their circuit.
    ///
    /// Admission is purely budget-based: we accept any circuit while
    /// we carry fewer than `max_joined_circuits`.
    fn on_create(
        &mut self,
        addr: SocketAddr,
        sender: PeerId,
        circuit_id: CircId,
        body: &[u8],
        now: Instant,
    ) {
        let joined = self.registry.joined_count();
        if joined >= self.settings.max_joined_circuits {
            warn!("too many relays ({}); refusing circuit {}", joined, circuit_id);
            if let Some(callback) = self.reject_callback.as_mut() {
                callback(now);
            }
            return;
        }
        if self.registry.knows_circuit(circuit_id) {
            warn!("circuit id {} already in use; dropping CREATE", circuit_id);
            return;
        }
        let create = match decode_body::<msg::Create>(body) {
            Ok(create) => create,
            Err(e) => {
                warn!("bad CREATE from {}: {}", addr, e);
                return;
            }
        };
        let (our_half, keys) = match crate::crypto::respond(create.handshake()) {
            Ok(done) => done,
            Err(e) => {
                warn!("CREATE handshake with {} failed: {}", addr, e);
                return;
            }
        };
        let exit = ExitSocket::new(circuit_id, addr, sender, keys, now);
        if self.registry.insert_exit(exit).is_err() {
            return;
        }
        let cell = encode_plain_cell(circuit_id, msg::Created::new(our_half).into());
        self.send_raw(addr, cell);
    }

    /// Handle a DESTROY cell: tear down whatever we hold for the
    /// circuit, propagating along relays.
    fn on_destroy(&mut self, addr: SocketAddr, circuit_id: CircId, body: &[u8]) {
        let reason = decode_body::<msg::Destroy>(body)
            .map(|d| d.reason())
            .unwrap_or(0);
        debug!(
            "got DESTROY for circuit {} from {} (reason {})",
            circuit_id, addr, reason
        );
        if self.registry.circuit(circuit_id).is_some() {
            self.remove_circuit(circuit_id, "got destroyed", false);
        } else if self.registry.relay(circuit_id).is_some() {
            self.remove_relay_pair(circuit_id, "got destroyed", true);
        } else if self.registry.exit(circuit_id).is_some() {
            self.remove_exit_socket(circuit_id, "got destroyed");
        }
    }

    /// Handle a RELAY cell: route by our role on the circuit.
    fn on_relay_cell(&mut self, addr: SocketAddr, circuit_id: CircId, body: &[u8], now: Instant) {
        if self.registry.relay(circuit_id).is_some() {
            self.forward_relay_cell(circuit_id, body);
        } else if self.registry.circuit(circuit_id).is_some() {
            self.on_circuit_cell(circuit_id, body, now);
        } else if self.registry.exit(circuit_id).is_some() {
            self.on_exit_cell(circuit_id, body, now);
        } else {
            debug!("dropping RELAY cell from {} for unknown circuit {}", addr, circuit_id);
        }
    }

    /// Forward a RELAY cell along a relay entry: peel or add one
    /// layer, re-frame under the outgoing circuit ID, and pass it on.
    fn forward_relay_cell(&mut self, circuit_id: CircId, body: &[u8]) {
        let Some(entry) = self.registry.relay_mut(circuit_id) else {
            return;
        };
        let mut body = body.to_vec();
        if let Some(keys) = &entry.peel_keys {
            body = match keys.decrypt_forward(&body) {
                Ok(body) => body,
                Err(e) => {
                    warn!("relay peel failed on {}: {}; tearing down", circuit_id, e);
                    self.remove_relay_pair(circuit_id, "crypto failure", true);
                    return;
                }
            };
        }
        if let Some(keys) = &entry.add_keys {
            body = keys.encrypt_backward(&body);
        }
        entry.bytes_relayed += body.len() as u64;
        let out_circuit = entry.out_circuit;
        let out_peer = entry.out_peer;
        let cell = reframe(out_circuit, TunnelCmd::RELAY, &body);
        self.send_raw(out_peer, cell);
    }

    /// Handle a RELAY cell arriving on a circuit we initiated: peel
    /// every layer and dispatch the inner message.
    fn on_circuit_cell(&mut self, circuit_id: CircId, body: &[u8], now: Instant) {
        let Some(circuit) = self.registry.circuit_mut(circuit_id) else {
            return;
        };
        // Cells are accepted while the circuit is still being built
        // (EXTENDED arrives then) and when it is ready; in the
        // teardown states they are dropped.
        if matches!(circuit.state(), CircuitState::Closing | CircuitState::Closed) {
            debug!("dropping cell on closing circuit {}", circuit_id);
            return;
        }
        circuit.record_down(body.len());
        let inner = match circuit.decrypt_incoming(body) {
            Ok(inner) => inner,
            Err(e) => {
                warn!("cannot peel cell on circuit {}: {}; tearing down", circuit_id, e);
                self.remove_circuit(circuit_id, "crypto failure", true);
                return;
            }
        };
        let message = match decode_inner(&inner) {
            Ok(message) => message,
            Err(e) => {
                warn!("bad cell on circuit {}: {}; tearing down", circuit_id, e);
                self.remove_circuit(circuit_id, "protocol violation", true);
                return;
            }
        };
        self.on_circuit_message(circuit_id, message, now);
    }

    /// Dispatch a decrypted message on a circuit we initiated.
    fn on_circuit_message(&mut self, circuit_id: CircId, message: AnyTunnelMsg, now: Instant) {
        match message {
            AnyTunnelMsg::Extended(extended) => self.on_extended(circuit_id, &extended, now),
            AnyTunnelMsg::Data(data) => {
                // Data flows only on fully built circuits.
                if self
                    .registry
                    .circuit(circuit_id)
                    .map_or(true, |c| c.state() != CircuitState::Ready)
                {
                    warn!("dropping data cell on non-ready circuit {}", circuit_id);
                    return;
                }
                let origin = if data.target().is_unspecified() {
                    // Traffic from the hidden peer at the end of an
                    // e2e circuit: surface it under the pseudo
                    // address.
                    SocketAddr::new(circuit_id_to_ip(circuit_id).into(), E2E_PORT)
                } else {
                    data.target().into()
                };
                let hops = self
                    .registry
                    .circuit(circuit_id)
                    .map(|c| c.goal_hops())
                    .unwrap_or(1);
                self.dispatcher.on_incoming_from_tunnel(
                    &self.socks_servers,
                    circuit_id,
                    hops,
                    origin,
                    data.payload(),
                );
            }
            AnyTunnelMsg::HttpResponse(response) => self.on_http_response(circuit_id, response),
            AnyTunnelMsg::IntroEstablished(established) => {
                self.on_intro_established(circuit_id, &established);
            }
            AnyTunnelMsg::RendezvousEstablished(established) => {
                self.on_rendezvous_established(circuit_id, &established);
            }
            AnyTunnelMsg::PeersResponse(response) => self.on_peers_response(circuit_id, &response),
            AnyTunnelMsg::CreateE2e(create) => self.on_create_e2e(circuit_id, &create, now),
            AnyTunnelMsg::CreatedE2e(created) => self.on_created_e2e(circuit_id, &created),
            AnyTunnelMsg::LinkedE2e(_) => self.on_linked_e2e(circuit_id),
            other => {
                warn!(
                    "dropping unexpected {} on circuit {}",
                    other.cmd(),
                    circuit_id
                );
            }
        }
    }

    /// Handle a RELAY cell arriving at an exit socket: peel the one
    /// layer we hold and dispatch the inner message.
    fn on_exit_cell(&mut self, circuit_id: CircId, body: &[u8], now: Instant) {
        let Some(exit) = self.registry.exit_mut(circuit_id) else {
            return;
        };
        exit.record_down(body.len());
        let inner = match exit.keys.decrypt_forward(body) {
            Ok(inner) => inner,
            Err(e) => {
                warn!("cannot peel cell at exit {}: {}; tearing down", circuit_id, e);
                self.remove_exit_socket(circuit_id, "crypto failure");
                return;
            }
        };
        let message = match decode_inner(&inner) {
            Ok(message) => message,
            Err(e) => {
                warn!("bad cell at exit {}: {}; tearing down", circuit_id, e);
                self.remove_exit_socket(circuit_id, "protocol violation");
                return;
            }
        };
        self.on_exit_message(circuit_id, message, now);
    }

    /// Dispatch a decrypted message arriving at an exit socket.
    fn on_exit_message(&mut self, circuit_id: CircId, message: AnyTunnelMsg, now: Instant) {
        match message {
            AnyTunnelMsg::Extend(extend) => self.on_extend(circuit_id, &extend, now),
            AnyTunnelMsg::Data(data) => self.on_exit_data(circuit_id, &data),
            AnyTunnelMsg::HttpRequest(request) => self.on_http_request(circuit_id, &request),
            AnyTunnelMsg::EstablishIntro(establish) => {
                self.on_establish_intro(circuit_id, &establish);
            }
            AnyTunnelMsg::EstablishRendezvous(establish) => {
                self.on_establish_rendezvous(circuit_id, &establish);
            }
            AnyTunnelMsg::PeersRequest(request) => self.on_peers_request(circuit_id, &request),
            AnyTunnelMsg::CreateE2e(create) => self.on_intro_forward_create(circuit_id, &create),
            AnyTunnelMsg::CreatedE2e(created) => self.on_intro_forward_created(circuit_id, &created),
            AnyTunnelMsg::LinkE2e(link) => self.on_link_e2e(circuit_id, &link),
            other => {
                warn!("dropping unexpected {} at exit {}", other.cmd(), circuit_id);
            }
        }
    }

    /// Forward a cleartext datagram from an exit socket to the
    /// internet, opening the internet-facing socket on first use.
    fn on_exit_data(&mut self, circuit_id: CircId, data: &msg::Data) {
        if !self.settings.advertised_flags().contains(tunnel_cell::PeerFlags::EXIT_BT) {
            warn!("dropping exit data on {}: we are not an exit node", circuit_id);
            return;
        }
        if data.target().is_unspecified() {
            debug!("dropping exit data on {} with no destination", circuit_id);
            return;
        }
        let internal_tx = self.internal_tx.clone();
        let Some(exit) = self.registry.exit_mut(circuit_id) else {
            return;
        };
        if exit.socket().is_none() {
            match open_exit_socket(circuit_id, internal_tx) {
                Ok((socket, task)) => exit.set_socket(socket, task),
                Err(e) => {
                    warn!("cannot open exit socket for {}: {}", circuit_id, e);
                    return;
                }
            }
        }
        if let Some(socket) = exit.socket() {
            let target: SocketAddr = data.target().into();
            if let Err(e) = socket.try_send_to(data.payload(), target) {
                debug!("exit send to {} failed: {}", target, e);
            }
        }
    }

    /// A datagram came back from the internet for an exit circuit:
    /// wrap it and send it toward the initiator.
    fn on_exit_datagram(&mut self, circuit_id: CircId, from: SocketAddr, payload: &[u8]) {
        let message = msg::Data::new(from.into(), payload.to_vec());
        self.send_from_exit(circuit_id, message.into());
    }

    /// Handle a datagram from a local SOCKS5 session: pick a circuit
    /// and tunnel the datagram into it.
    pub(crate) fn on_socks5_udp(&mut self, server_index: usize, dest: SocketAddr, payload: &[u8]) {
        let hops = (server_index as u8).saturating_add(1);
        let Some(circuit_id) =
            self.dispatcher
                .select_circuit(&self.registry, server_index, hops, dest)
        else {
            // No circuit: UDP semantics, drop silently.
            return;
        };
        let target = if self
            .registry
            .circuit(circuit_id)
            .map_or(false, Circuit::has_e2e_keys)
        {
            // The e2e far end is the destination itself.
            tunnel_cell::AddressPort::unspecified()
        } else {
            dest.into()
        };
        self.send_on_circuit(circuit_id, msg::Data::new(target, payload.to_vec()).into());
    }

    // ------------------------------------------------------------------
    // Sending helpers.

    /// Send raw cell bytes to a peer.
    pub(crate) fn send_raw(&self, addr: SocketAddr, cell: Vec<u8>) {
        self.endpoint.send_cell_bytes(addr, cell);
    }

    /// Onion-wrap `message` and send it into a circuit we initiated.
    pub(crate) fn send_on_circuit(&mut self, circuit_id: CircId, message: AnyTunnelMsg) {
        let Some(circuit) = self.registry.circuit_mut(circuit_id) else {
            warn!("cannot send on unknown circuit {}", circuit_id);
            return;
        };
        let Some(first_hop) = circuit.first_hop().map(|h| h.address) else {
            warn!("cannot send on hopless circuit {}", circuit_id);
            return;
        };
        let inner = match encode_inner(message) {
            Ok(inner) => inner,
            Err(e) => {
                warn!("cannot encode message for circuit {}: {}", circuit_id, e);
                return;
            }
        };
        let body = circuit.encrypt_outgoing(&inner);
        circuit.record_up(body.len());
        let cell = reframe(circuit_id, TunnelCmd::RELAY, &body);
        self.send_raw(first_hop, cell);
    }

    /// Wrap `message` in our single backward layer and send it from an
    /// exit socket toward the circuit initiator.
    pub(crate) fn send_from_exit(&mut self, circuit_id: CircId, message: AnyTunnelMsg) {
        let Some(exit) = self.registry.exit_mut(circuit_id) else {
            warn!("cannot send from unknown exit {}", circuit_id);
            return;
        };
        let inner = match encode_inner(message) {
            Ok(inner) => inner,
            Err(e) => {
                warn!("cannot encode message for exit {}: {}", circuit_id, e);
                return;
            }
        };
        let body = exit.keys.encrypt_backward(&inner);
        exit.record_up(body.len());
        let peer = exit.peer_addr;
        let cell = reframe(circuit_id, TunnelCmd::RELAY, &body);
        self.send_raw(peer, cell);
    }

    // ------------------------------------------------------------------
    // Teardown.

    /// Tear down a circuit we initiated.
    ///
    /// The fan-out runs in a fixed order: notify observers, reap the
    /// dispatcher's peers, mark the circuit closing, remember the
    /// affected BitTorrent peers, optionally send DESTROY, and drop
    /// the registry entry. Teardown is idempotent.
    pub(crate) fn remove_circuit(&mut self, circuit_id: CircId, additional_info: &str, destroy: bool) {
        let Some(circuit) = self.registry.circuit_mut(circuit_id) else {
            warn!("circuit {} not found when trying to remove it", circuit_id);
            return;
        };
        if !circuit.mark_destroyed() {
            return;
        }
        let uptime = circuit.created_at().elapsed().as_secs_f64();
        let bytes_up = circuit.bytes_up();
        let bytes_down = circuit.bytes_down();
        let first_hop = circuit.first_hop().map(|h| h.address);
        let unbuilt = circuit.state() != CircuitState::Ready
            && circuit.hops().len() < usize::from(circuit.goal_hops());
        let retry = if unbuilt
            && !self.shutting_down
            && circuit.attempt() + 1 < self.settings.max_build_attempts
        {
            Some((
                circuit.goal_hops(),
                circuit.ctype(),
                circuit.required_exit_flags(),
                circuit.info_hash(),
                circuit.attempt() + 1,
            ))
        } else {
            None
        };
        // Mark closing before anything else may observe the circuit,
        // so it cannot be handed out again.
        circuit.close();

        self.notifier.notify(&Notification::CircuitRemoved {
            circuit_id,
            additional_info: additional_info.into(),
        });
        self.notifier.notify(&Notification::TunnelRemoved {
            circuit_id,
            bytes_up,
            bytes_down,
            uptime,
            additional_info: additional_info.into(),
        });

        let affected = self.dispatcher.circuit_dead(circuit_id);

        if destroy {
            if let Some(addr) = first_hop {
                let cell =
                    encode_plain_cell(circuit_id, msg::Destroy::new(DESTROY_REASON_SHUTDOWN).into());
                self.send_raw(addr, cell);
            }
        }

        self.remember_affected_peers(affected);
        self.registry.remove_circuit(circuit_id);

        if let Some((hops, ctype, exit_flags, info_hash, attempt)) = retry {
            debug!("scheduling build retry {} for {:?} circuit", attempt, ctype);
            let _ = self.create_circuit(hops, ctype, exit_flags, info_hash, attempt, Instant::now());
        }
    }

    /// Tear down a relay pair, optionally propagating DESTROY to the
    /// other side.
    pub(crate) fn remove_relay_pair(&mut self, circuit_id: CircId, additional_info: &str, destroy: bool) {
        let removed = self.registry.remove_relay_pair(circuit_id);
        for (id, entry) in removed {
            self.notifier.notify(&Notification::CircuitRemoved {
                circuit_id: id,
                additional_info: additional_info.into(),
            });
            // Propagate only away from the side the teardown came
            // from: the entry keyed by the incoming circuit names the
            // far side.
            if destroy && id == circuit_id {
                let cell = encode_plain_cell(
                    entry.out_circuit,
                    msg::Destroy::new(DESTROY_REASON_SHUTDOWN).into(),
                );
                self.send_raw(entry.out_peer, cell);
            }
        }
    }

    /// Tear down an exit socket.
    pub(crate) fn remove_exit_socket(&mut self, circuit_id: CircId, additional_info: &str) {
        if let Some(exit) = self.registry.remove_exit(circuit_id) {
            self.notifier.notify(&Notification::CircuitRemoved {
                circuit_id,
                additional_info: additional_info.into(),
            });
            // Intro/rendezvous services carried by this circuit die
            // with it.
            self.intro_services
                .retain(|_, service| service.seeder_circuit != circuit_id);
            self.pending_intro_relays
                .retain(|seeder, downloader| *seeder != circuit_id && *downloader != circuit_id);
            self.rendezvous_points.retain(|_, circ| *circ != circuit_id);
            drop(exit);
        }
    }

    // ------------------------------------------------------------------
    // BitTorrent peer bookkeeping.

    /// Remember peers that lost their circuit, keyed by the download
    /// they belong to.
    fn remember_affected_peers(&mut self, affected: HashSet<SocketAddr>) {
        if affected.is_empty() {
            return;
        }
        let Some(dm) = self.download_manager.clone() else {
            return;
        };
        for download in dm.get_downloads() {
            if download.hidden() {
                continue;
            }
            // We cannot know which peers belong to which download at
            // this layer, so every non-hidden download gets the set;
            // re-adding a peer the engine does not know is harmless.
            let entry = self
                .bittorrent_peers
                .entry(download.info_hash())
                .or_default();
            entry.extend(affected.iter().copied());
        }
    }

    /// Re-add postponed BitTorrent peers now that a circuit is ready.
    pub(crate) fn readd_bittorrent_peers(&mut self) {
        let Some(dm) = self.download_manager.clone() else {
            return;
        };
        if self.bittorrent_peers.is_empty() {
            return;
        }
        let peers = std::mem::take(&mut self.bittorrent_peers);
        for (info_hash, addresses) in peers {
            let Some(download) = dm
                .get_downloads()
                .into_iter()
                .find(|d| d.info_hash() == info_hash)
            else {
                continue;
            };
            for addr in addresses {
                info!("re-adding peer {} to torrent {}", addr, info_hash);
                download.add_peer(addr);
            }
        }
    }

    /// Find the download whose *lookup* infohash is `lookup`.
    pub(crate) fn get_download(&self, lookup: InfoHash) -> Option<Arc<dyn crate::download::Download>> {
        let dm = self.download_manager.as_ref()?;
        dm.get_downloads()
            .into_iter()
            .find(|d| crate::rendezvous::lookup_info_hash(d.info_hash()) == lookup)
    }

    // ------------------------------------------------------------------
    // Exit-node cache.

    /// Snapshot the verified BitTorrent-exit candidates to disk.
    pub(crate) fn cache_exitnodes_to_disk(&self) {
        let Some(path) = self.settings.exitnode_cache.as_ref() else {
            return;
        };
        let peers: Vec<exitcache::SnapshotPeer> = self
            .registry
            .candidates_with_flags(tunnel_cell::PeerFlags::EXIT_BT)
            .map(|(key, c)| (c.address, *key, c.flags))
            .collect();
        exitcache::save_snapshot(path, &peers);
    }

    /// Load the exit-node snapshot and introduce ourselves to every
    /// peer in it.
    pub(crate) fn restore_exitnodes_from_disk(&mut self) {
        let Some(path) = self.settings.exitnode_cache.clone() else {
            return;
        };
        let peers = exitcache::load_snapshot(&path);
        debug!("loaded {} exit nodes from cache", peers.len());
        let flags = self.settings.advertised_flags();
        for (addr, key, peer_flags) in peers {
            self.registry
                .add_candidate(key, addr, peer_flags, Instant::now());
            self.endpoint.send_msg(addr, FrameMsg::IntroRequest { flags });
        }
    }

    // ------------------------------------------------------------------
    // Maintenance.

    /// The 1 Hz maintenance tick.
    pub(crate) fn on_tick(&mut self, now: Instant) {
        // Poll the download manager; its failures must not kill the
        // tick loop.
        if let Some(dm) = self.download_manager.clone() {
            let states = dm.get_last_download_states();
            self.monitor_downloads(&states, now);
        }

        // EVA retransmissions.
        for (peer, frame) in self.eva.tick(now) {
            if let Some(addr) = self.eva_addresses.get(&peer).copied() {
                self.endpoint.send_msg(addr, FrameMsg::Eva(frame));
            }
        }

        // Build-step timeouts on circuits we initiated.
        let stuck: Vec<CircId> = self
            .registry
            .circuits()
            .filter(|c| {
                matches!(c.state(), CircuitState::Building | CircuitState::Extending)
                    && now.duration_since(c.last_activity()) >= self.settings.extend_timeout
            })
            .map(Circuit::circuit_id)
            .collect();
        for circuit_id in stuck {
            warn!("circuit {} timed out while building", circuit_id);
            self.remove_circuit(circuit_id, "build timeout", true);
        }

        // Extensions we were carrying out that never completed.
        let expired: Vec<CircId> = self
            .pending_extensions
            .iter()
            .filter(|(_, p)| now.duration_since(p.started) >= self.settings.extend_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!("pending extension {} expired", id);
            self.pending_extensions.remove(&id);
        }

        // Request-cache expiry.
        for (kind, id, _pending) in self.cache.expire(now) {
            debug!("request {:?}/{} expired", kind, id);
        }

        // Re-walk candidates we have not heard from in a while, and
        // forget those that stopped answering.
        let keepalive_after = self.settings.candidate_timeout / 2;
        let stale: Vec<SocketAddr> = self
            .registry
            .candidates_with_flags(tunnel_cell::PeerFlags::empty())
            .filter(|(_, c)| now.duration_since(c.last_seen) >= keepalive_after)
            .map(|(_, c)| c.address)
            .take(2)
            .collect();
        let flags = self.settings.advertised_flags();
        for addr in stale {
            self.endpoint.send_msg(addr, FrameMsg::IntroRequest { flags });
        }
        for peer_id in self
            .registry
            .prune_candidates(self.settings.candidate_timeout, now)
        {
            self.notifier
                .notify(&Notification::PeerDisconnected { peer_id });
        }

        // Keep the data-circuit pool sized to the downloads.
        self.do_circuit_maintenance(now);
    }

    /// Shut the community down: cancel transfers, tear down circuits,
    /// and snapshot the exit nodes.
    pub(crate) fn unload(&mut self) {
        info!("unloading tunnel community");
        self.shutting_down = true;
        let circuits: Vec<CircId> = self.registry.circuits().map(Circuit::circuit_id).collect();
        for circuit_id in circuits {
            self.remove_circuit(circuit_id, "unload", true);
        }
        self.eva.shutdown();
        self.cache_exitnodes_to_disk();
    }
}

/// Decode a message body of a known type from plain cell bytes.
pub(crate) fn decode_body<B: Body>(body: &[u8]) -> Result<B> {
    let mut r = tunnel_bytes::Reader::from_slice(body);
    let message = B::decode_from_reader(&mut r).map_err(Error::BytesErr)?;
    Ok(message)
}

/// Encode `message` as inner bytes: command byte followed by body.
pub(crate) fn encode_inner(message: AnyTunnelMsg) -> Result<Vec<u8>> {
    let mut inner = vec![message.cmd().get()];
    message.encode_onto(&mut inner)?;
    Ok(inner)
}

/// Decode inner bytes produced by [`encode_inner`].
pub(crate) fn decode_inner(inner: &[u8]) -> Result<AnyTunnelMsg> {
    let mut r = tunnel_bytes::Reader::from_slice(inner);
    let cmd = TunnelCmd::from_u8(r.take_u8().map_err(Error::BytesErr)?);
    let message = AnyTunnelMsg::decode_from_reader(cmd, &mut r)?;
    Ok(message)
}

/// Encode a link-local (unencrypted) cell.
pub(crate) fn encode_plain_cell(circuit_id: CircId, message: AnyTunnelMsg) -> Vec<u8> {
    let cmd = message.cmd();
    let mut body = Vec::new();
    // The known link-local bodies encode infallibly.
    if message.encode_onto(&mut body).is_err() {
        warn!("could not encode {} cell", cmd);
    }
    reframe(circuit_id, cmd, &body)
}

/// Open the internet-facing UDP socket for an exit circuit and spawn
/// the task pumping replies back into the reactor.
#[allow(clippy::type_complexity)]
fn open_exit_socket(
    circuit_id: CircId,
    events: mpsc::UnboundedSender<ReactorEvent>,
) -> std::io::Result<(Arc<tokio::net::UdpSocket>, tokio::task::JoinHandle<()>)> {
    let std_socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    std_socket.set_nonblocking(true)?;
    let socket = Arc::new(tokio::net::UdpSocket::from_std(std_socket)?);
    let pump_socket = Arc::clone(&socket);
    let task = tokio::spawn(async move {
        let mut buf = vec![0_u8; 65_535];
        loop {
            match pump_socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let event = ReactorEvent::ExitDatagram {
                        circuit_id,
                        from,
                        payload: buf[..n].to_vec(),
                    };
                    if events.unbounded_send(event).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("exit socket read failed: {}", e);
                    return;
                }
            }
        }
    });
    Ok((socket, task))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::circuit::CircuitType;
    use crate::events::Notifier;
    use tunnel_cell::PeerFlags;

    /// A community bound to localhost, with its frame receiver.
    async fn node(
        settings: TunnelSettings,
        seed: u8,
    ) -> (
        TunnelCommunity,
        TunnelHandle,
        mpsc::UnboundedReceiver<(SocketAddr, Frame)>,
        SocketAddr,
        PeerId,
    ) {
        let identity = PeerId::new([seed; 32]);
        let (endpoint, frames) = Endpoint::bind("127.0.0.1:0".parse().unwrap(), identity)
            .await
            .unwrap();
        let addr = endpoint.local_addr().unwrap();
        let (community, handle) = TunnelCommunity::new(
            settings,
            endpoint,
            Notifier::new(),
            None,
            Vec::new(),
            EvaSettings::default(),
        );
        (community, handle, frames, addr, identity)
    }

    /// Feed every frame already in flight to its community, until the
    /// wire goes quiet.
    async fn settle(
        nodes: &mut [(&mut TunnelCommunity, &mut mpsc::UnboundedReceiver<(SocketAddr, Frame)>)],
    ) {
        for _ in 0..32 {
            let mut quiet = true;
            for (community, frames) in nodes.iter_mut() {
                while let Ok(Some((addr, frame))) =
                    tokio::time::timeout(Duration::from_millis(20), frames.next()).await
                {
                    community.on_frame(addr, frame, Instant::now());
                    quiet = false;
                }
            }
            if quiet {
                return;
            }
        }
    }

    #[tokio::test]
    async fn one_hop_circuit_builds() {
        let (mut a, _ha, mut a_frames, _a_addr, _) = node(TunnelSettings::default(), 1).await;
        let mut exit_settings = TunnelSettings::default();
        exit_settings.exitnode_enabled = true;
        let (mut b, _hb, mut b_frames, b_addr, b_id) = node(exit_settings, 2).await;

        a.registry.add_candidate(
            b_id,
            b_addr,
            PeerFlags::RELAY.union(PeerFlags::EXIT_BT),
            Instant::now(),
        );
        let circuit_id = a
            .create_circuit(1, CircuitType::Data, PeerFlags::EXIT_BT, None, 0, Instant::now())
            .unwrap();

        settle(&mut [(&mut b, &mut b_frames), (&mut a, &mut a_frames)]).await;

        let circuit = a.registry.circuit(circuit_id).unwrap();
        assert_eq!(circuit.state(), CircuitState::Ready);
        assert_eq!(circuit.hops().len(), 1);
        assert_eq!(b.registry.n_exits(), 1);
        assert!(b.registry.exit(circuit_id).is_some());
    }

    #[tokio::test]
    async fn join_admission_is_budgeted() {
        let (mut a, _ha, mut a_frames, _a_addr, _) = node(TunnelSettings::default(), 1).await;
        let mut small = TunnelSettings::default();
        small.max_joined_circuits = 1;
        let (mut b, _hb, mut b_frames, b_addr, b_id) = node(small, 2).await;

        let rejections = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&rejections);
        b.set_reject_callback(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        a.registry
            .add_candidate(b_id, b_addr, PeerFlags::RELAY, Instant::now());
        let first = a
            .create_circuit(1, CircuitType::Data, PeerFlags::empty(), None, 0, Instant::now())
            .unwrap();
        settle(&mut [(&mut b, &mut b_frames), (&mut a, &mut a_frames)]).await;
        assert_eq!(b.registry.joined_count(), 1);

        // The budget is spent: the next join is refused, and the
        // existing circuit stays intact.
        let second = a
            .create_circuit(1, CircuitType::Data, PeerFlags::empty(), None, 0, Instant::now())
            .unwrap();
        settle(&mut [(&mut b, &mut b_frames), (&mut a, &mut a_frames)]).await;

        assert_eq!(b.registry.joined_count(), 1);
        assert!(b.registry.exit(first).is_some());
        assert!(b.registry.exit(second).is_none());
        assert_eq!(rejections.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            a.registry.circuit(second).unwrap().state(),
            CircuitState::Building
        );
    }

    #[tokio::test]
    async fn destroy_tears_down_both_sides() {
        let (mut a, _ha, mut a_frames, _a_addr, _) = node(TunnelSettings::default(), 1).await;
        let (mut b, _hb, mut b_frames, b_addr, b_id) = node(TunnelSettings::default(), 2).await;

        a.registry
            .add_candidate(b_id, b_addr, PeerFlags::RELAY, Instant::now());
        let circuit_id = a
            .create_circuit(1, CircuitType::Data, PeerFlags::empty(), None, 0, Instant::now())
            .unwrap();
        settle(&mut [(&mut b, &mut b_frames), (&mut a, &mut a_frames)]).await;
        assert_eq!(b.registry.n_exits(), 1);

        a.remove_circuit(circuit_id, "test teardown", true);
        assert!(a.registry.circuit(circuit_id).is_none());
        settle(&mut [(&mut b, &mut b_frames), (&mut a, &mut a_frames)]).await;
        assert_eq!(b.registry.n_exits(), 0);

        // Teardown is idempotent: a second removal is a logged no-op.
        a.remove_circuit(circuit_id, "again", true);
    }

    #[tokio::test]
    async fn eva_transfer_between_communities() {
        let (mut a, _ha, mut a_frames, _a_addr, _a_id) = node(TunnelSettings::default(), 1).await;
        let (mut b, _hb, mut b_frames, b_addr, b_id) = node(TunnelSettings::default(), 2).await;

        let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&received);
        b.notifier.add_observer(move |notification| {
            if let Notification::TorrentMetadataAdded { metadata } = notification {
                sink.lock().unwrap().push(metadata.clone());
            }
        });

        let payload: Vec<u8> = (0..2500_u32).map(|i| i as u8).collect();
        a.eva_addresses.insert(b_id, b_addr);
        let (_handle, frame) = a
            .eva
            .send_binary(b_id, b"metadata".to_vec(), payload.clone(), Instant::now())
            .unwrap();
        a.endpoint.send_msg(b_addr, FrameMsg::Eva(frame));

        settle(&mut [(&mut b, &mut b_frames), (&mut a, &mut a_frames)]).await;

        // The receive callback queued an internal event; drain it.
        let mut internal = b.internal_rx.take().unwrap();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(20), internal.next()).await
        {
            b.on_internal(event, Instant::now());
        }
        assert_eq!(received.lock().unwrap().as_slice(), &[payload]);
    }

    #[tokio::test]
    async fn http_over_tunnel_end_to_end() {
        // A tracker-ish origin that answers with a bencoded body.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0_u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let body = vec![b'x'; 2000];
                    let mut response = Vec::new();
                    response.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\n");
                    response.extend_from_slice(format!("{}:", body.len()).as_bytes());
                    response.extend_from_slice(&body);
                    let _ = stream.write_all(&response).await;
                });
            }
        });

        let (a, ha, a_frames, _a_addr, _) = node(TunnelSettings::default(), 1).await;
        let mut exit_settings = TunnelSettings::default();
        exit_settings.exitnode_enabled = true;
        let (b, hb, b_frames, b_addr, b_id) = node(exit_settings, 2).await;

        let mut a = a;
        a.registry.add_candidate(
            b_id,
            b_addr,
            PeerFlags::RELAY
                .union(PeerFlags::EXIT_BT)
                .union(PeerFlags::EXIT_HTTP),
            Instant::now(),
        );

        tokio::spawn(a.run(a_frames));
        tokio::spawn(b.run(b_frames));

        let response = ha
            .perform_http_request(origin, b"GET /announce HTTP/1.1\r\n\r\n".to_vec(), 1)
            .await
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));
        // Bencoded string body: "2000:xxx...".
        assert!(response.ends_with(&vec![b'x'; 2000]));

        ha.shutdown().await;
        hb.shutdown().await;
    }
}
