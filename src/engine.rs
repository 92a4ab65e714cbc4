//! The engine: the single-threaded loop that owns every endpoint and routes
//! readiness, timers and notifications to whoever is behind each token.
//!
//! Endpoints live in one arena keyed by token. What a token stands for (a
//! tunnel, one logical flow, a fallback backend, a shared frontend) is kept
//! in a separate route table, so that tunnels and flows refer to each other
//! by id only.
//!
//! A handler that fails tears down the descriptor it was handling and
//! nothing else.
use std::{
    collections::HashMap,
    fs::File,
    io::{self, ErrorKind},
    net::SocketAddr,
    os::fd::AsRawFd,
    time::Duration,
};

use mio::{
    Token,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    adapter::{Adapters, DeviceOpener},
    config::{Config, Role},
    endpoint::{Endpoint, EndpointEvent, EndpointKind, EndpointSettings, Inbound},
    error::{Error, Rejected},
    frame::{ConnectionId, DeviceTarget, Frame, FrameKind},
    reactor::{Interest, Reactor, Ready},
    registry::Registry,
    timer::TimerId,
    tunnel::{FrameHandlers, HEARTBEAT, Tunnel, TunnelId},
};

/// Reads handled per readable endpoint before yielding to the others.
const READS_PER_TURN: usize = 32;

/// What a token stands for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Route {
    /// The physical endpoint of a tunnel.
    Tunnel(TunnelId),
    /// The endpoint of exactly one flow.
    Logical(ConnectionId),
    /// The backend a probing connection is relayed to.
    Fallback(TunnelId),
    /// A datagram socket shared by one flow per source address.
    UdpFrontend,
    /// A device whose packets go through one flow.
    ClientDevice,
    /// A device shared by the flows of every peer on its network.
    ServerDevice,
}

#[derive(Copy, Clone, Debug)]
enum Accept {
    Tunnels,
    Forward { via: SocketAddr, to: SocketAddr },
}

#[derive(Debug)]
struct Listener {
    inner: TcpListener,
    accept: Accept,
}

/// The tunnel engine.
///
/// ```no_run
/// use obfstunnel::{Config, Engine, Role};
///
/// # fn main() -> Result<(), obfstunnel::Error> {
/// let mut engine = Engine::new(Config::builder_with_role(Role::connect()).with_defaults())?;
/// engine.forward_tcp(
///     "127.0.0.1:1080".parse().unwrap(),
///     "203.0.113.7:443".parse().unwrap(),
///     "127.0.0.1:22".parse().unwrap(),
/// )?;
/// engine.run()
/// # }
/// ```
#[derive(Debug)]
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) reactor: Reactor,
    pub(crate) endpoints: HashMap<Token, Endpoint>,
    pub(crate) routes: HashMap<Token, Route>,
    pub(crate) registry: Registry,
    pub(crate) adapters: Adapters,
    listeners: HashMap<Token, Listener>,
    handlers: FrameHandlers,
}

impl Engine {
    /// Creates an engine with its own reactor.
    pub fn new(config: Config) -> Result<Self, Error> {
        let accepting = !config.role().is_connect();
        Ok(Self {
            registry: Registry::new(config.role()),
            handlers: FrameHandlers::for_role(accepting),
            reactor: Reactor::new()?,
            endpoints: HashMap::new(),
            routes: HashMap::new(),
            adapters: Adapters::default(),
            listeners: HashMap::new(),
            config,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The routing table.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of open endpoints, tunnels included.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn settings(&self) -> EndpointSettings {
        EndpointSettings::from(&self.config)
    }

    /// Accepts tunnels on `addr`. Returns the bound address.
    ///
    /// Only an engine with [`Role::Accept`] opens flows for its peers.
    pub fn listen_tunnels(&mut self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        if self.config.role().is_connect() {
            warn!(%addr, "accepting tunnels on a connecting engine");
        }
        self.listen(addr, Accept::Tunnels)
    }

    /// Forwards TCP connections accepted on `from` through a tunnel to `via`,
    /// where they are connected to `to`. Returns the bound address.
    pub fn forward_tcp(
        &mut self,
        from: SocketAddr,
        via: SocketAddr,
        to: SocketAddr,
    ) -> Result<SocketAddr, Error> {
        self.listen(from, Accept::Forward { via, to })
    }

    /// Forwards datagrams received on `from` through a tunnel to `via`,
    /// where they are sent to `to`. Returns the bound address.
    pub fn forward_udp(
        &mut self,
        from: SocketAddr,
        via: SocketAddr,
        to: SocketAddr,
    ) -> Result<SocketAddr, Error> {
        self.open_udp_frontend(from, via, to)
    }

    /// Carries the packets of a device through a tunnel to `via`, where they
    /// join the network `target`. `device` must be in non-blocking mode.
    pub fn attach_device(
        &mut self,
        device: File,
        via: SocketAddr,
        target: DeviceTarget,
    ) -> Result<(), Error> {
        self.open_client_device(device, via, target)
    }

    /// Sets how devices requested by peers are opened.
    pub fn set_device_opener<F>(&mut self, opener: F)
    where
        F: FnMut(&DeviceTarget) -> io::Result<File> + 'static,
    {
        self.adapters.opener = Some(DeviceOpener::new(opener));
    }

    fn listen(&mut self, addr: SocketAddr, accept: Accept) -> Result<SocketAddr, Error> {
        let inner = TcpListener::bind(addr)?;
        let local = inner.local_addr()?;
        let token = self.reactor.allocate_token();
        self.reactor
            .register(Interest::read(token, inner.as_raw_fd()))?;
        info!(addr = %local, ?accept, "listening");
        self.listeners.insert(token, Listener { inner, accept });
        Ok(local)
    }

    /// Runs the loop forever.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            self.turn(None)?;
        }
    }

    /// Runs one pass of the loop: waits for readiness for at most `timeout`
    /// or until the next timer, dispatches every ready endpoint once, then
    /// fires every due timer.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let ready = self.reactor.poll(timeout)?;
        self.drain_notifications();
        for ready in ready {
            self.dispatch(ready);
            self.drain_notifications();
        }
        for id in self.reactor.expire_timers() {
            if let Some(token) = self.reactor.take_timer(id) {
                self.on_timer(token, id);
                self.drain_notifications();
            }
        }
        Ok(())
    }

    pub(crate) fn with_endpoint<R>(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut Endpoint, &mut Reactor) -> R,
    ) -> Option<R> {
        let endpoint = self.endpoints.get_mut(&token)?;
        Some(f(endpoint, &mut self.reactor))
    }

    /// Adds an endpoint to the arena under `route`.
    pub(crate) fn insert(&mut self, endpoint: Endpoint, route: Route) -> Token {
        let token = endpoint.token();
        self.routes.insert(token, route);
        self.endpoints.insert(token, endpoint);
        token
    }

    fn dispatch(&mut self, ready: Ready) {
        let token = ready.token;
        if self.listeners.contains_key(&token) {
            self.on_acceptable(token);
            return;
        }
        if ready.writable {
            self.with_endpoint(token, |endpoint, reactor| endpoint.on_writable(reactor));
        }
        if ready.readable {
            self.on_readable(token);
        }
    }

    fn on_readable(&mut self, token: Token) {
        for _ in 0..READS_PER_TURN {
            let Some(inbound) =
                self.with_endpoint(token, |endpoint, reactor| endpoint.receive_once(reactor))
            else {
                return;
            };
            let outcome = match inbound {
                Inbound::Units { units, from } => self.deliver(token, units, from),
                Inbound::Raw {
                    decoded,
                    bytes,
                    first,
                } => self
                    .deliver(token, decoded, None)
                    .and_then(|()| self.on_raw(token, bytes, first)),
                Inbound::Drained | Inbound::Stopped => return,
            };
            if let Err(err) = outcome {
                self.teardown(token, err);
                return;
            }
        }
        if let Err(err) = self.reactor.rearm(token) {
            self.teardown(token, err.into());
        }
    }

    /// Hands decoded units to their consumer, pausing the endpoint when the
    /// consumer cannot take more.
    fn deliver(
        &mut self,
        token: Token,
        units: Vec<Vec<u8>>,
        from: Option<SocketAddr>,
    ) -> Result<(), Error> {
        let mut resume = true;
        for unit in units {
            resume &= self.on_received(token, unit, from)?;
        }
        if !resume {
            trace!(token = token.0, "pausing receive");
            self.with_endpoint(token, |endpoint, reactor| endpoint.stop_receiving(reactor));
        }
        Ok(())
    }

    /// Closes `token` at once after a handler failed on it.
    pub(crate) fn teardown(&mut self, token: Token, err: Error) {
        error!(token = token.0, route = ?self.routes.get(&token), %err, "tearing down");
        self.with_endpoint(token, |endpoint, reactor| endpoint.abort(reactor));
    }

    fn on_acceptable(&mut self, token: Token) {
        loop {
            let Some(listener) = self.listeners.get(&token) else {
                return;
            };
            let (result, accept) = (listener.inner.accept(), listener.accept);
            match result {
                Ok((stream, peer)) => {
                    let result = match accept {
                        Accept::Tunnels => self.on_tunnel_accepted(stream, peer),
                        Accept::Forward { via, to } => {
                            self.on_forward_accepted(stream, peer, via, to)
                        }
                    };
                    if let Err(err) = result {
                        error!(%peer, %err, "failed to set up accepted connection");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err)
                    if err.kind() == ErrorKind::ConnectionAborted
                        || err.kind() == ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(err) => {
                    error!(token = token.0, %err, "accept failed, closing listener");
                    self.reactor.forget(token);
                    self.listeners.remove(&token);
                    return;
                }
            }
        }
    }

    fn on_tunnel_accepted(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), Error> {
        let token = self.reactor.allocate_token();
        let mut endpoint = Endpoint::accepted(token, stream, self.settings());
        let mut tunnel = Tunnel::accepted(TunnelId(token));
        tunnel.initialize(
            &mut endpoint,
            &mut self.reactor,
            self.config.timeouts.heartbeat,
        )?;
        info!(tunnel = %tunnel.id(), %peer, "tunnel accepted");
        self.registry.add_tunnel(tunnel);
        self.insert(endpoint, Route::Tunnel(TunnelId(token)));
        Ok(())
    }

    /// The pooled tunnel for `id` towards `relay`, opened if needed.
    pub(crate) fn tunnel_towards(
        &mut self,
        id: ConnectionId,
        relay: SocketAddr,
    ) -> Result<TunnelId, Error> {
        if let Some(tunnel) = self.registry.tunnel_for(id, Some(relay)) {
            return Ok(tunnel);
        }
        let token = self.reactor.allocate_token();
        let tunnel_id = TunnelId(token);
        let mut endpoint = Endpoint::new(token, self.settings());
        let mut tunnel = Tunnel::connecting(tunnel_id, relay);
        tunnel.initialize(
            &mut endpoint,
            &mut self.reactor,
            self.config.timeouts.heartbeat,
        )?;
        self.registry.add_tunnel(tunnel);
        self.insert(endpoint, Route::Tunnel(tunnel_id));
        Ok(tunnel_id)
    }

    /// Sends one frame on a tunnel. Returns whether the tunnel can take more.
    pub(crate) fn send_frame(&mut self, tunnel: TunnelId, frame: &Frame) -> Result<bool, Error> {
        self.with_endpoint(tunnel.token(), |endpoint, reactor| {
            Tunnel::send(endpoint, reactor, frame)
        })
        .unwrap_or(Err(Rejected::UnknownEndpoint.into()))
    }

    /// Sends the bytes of flow `id` on a tunnel. Returns whether the tunnel
    /// can take more.
    pub(crate) fn send_payload(
        &mut self,
        tunnel: TunnelId,
        id: ConnectionId,
        data: &[u8],
    ) -> Result<bool, Error> {
        self.with_endpoint(tunnel.token(), |endpoint, reactor| {
            Tunnel::send_payload(endpoint, reactor, id, data)
        })
        .unwrap_or(Err(Rejected::UnknownEndpoint.into()))
    }

    /// Handles one decoded unit. Returns whether the endpoint should keep
    /// receiving.
    fn on_received(
        &mut self,
        token: Token,
        unit: Vec<u8>,
        from: Option<SocketAddr>,
    ) -> Result<bool, Error> {
        let Some(route) = self.routes.get(&token).copied() else {
            return Ok(false);
        };
        match route {
            Route::Tunnel(tunnel) => self.on_frame(tunnel, &unit),
            Route::Logical(id) => {
                let Some(tunnel) = self.registry.query_endpoint(id).map(|e| e.tunnel) else {
                    debug!(%id, "flow has no tunnel, dropping input");
                    return Ok(false);
                };
                self.send_payload(tunnel, id, &unit)
            }
            Route::Fallback(tunnel) => self
                .with_endpoint(tunnel.token(), |endpoint, reactor| {
                    endpoint.send(reactor, unit, None)?;
                    Ok::<_, Error>(endpoint.is_ready_to_send())
                })
                .unwrap_or(Err(Rejected::UnknownEndpoint.into())),
            Route::UdpFrontend => match from {
                Some(from) => self.on_udp_frontend_datagram(token, unit, from),
                None => Ok(true),
            },
            Route::ClientDevice => self.on_client_device_packet(token, unit),
            Route::ServerDevice => self.on_server_device_packet(token, unit),
        }
    }

    fn on_frame(&mut self, tunnel_id: TunnelId, unit: &[u8]) -> Result<bool, Error> {
        let Some(tunnel) = self.registry.tunnel_mut(tunnel_id) else {
            return Ok(false);
        };
        let Frame { kind, id, payload } = tunnel.parse(unit)?;
        match kind {
            FrameKind::Payload => self.on_payload(tunnel_id, id, payload)?,
            kind => match self.handlers.get(kind) {
                Some(handler) => handler(self, tunnel_id, id, payload)?,
                None => warn!(tunnel = %tunnel_id, ?kind, %id, "frame cannot be handled"),
            },
        }
        Ok(true)
    }

    /// Hands the bytes of a `PAYLOAD` frame to the endpoint bound to `id`.
    /// Unresolved ids are dropped; the peer already tore the flow down.
    pub(crate) fn on_payload(
        &mut self,
        tunnel: TunnelId,
        id: ConnectionId,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let Some(endpoint) = self.registry.query_endpoint(id) else {
            warn!(%tunnel, %id, len = data.len(), "no endpoint for payload, dropping");
            return Ok(());
        };
        if endpoint.tunnel != tunnel {
            warn!(%tunnel, %id, bound = %endpoint.tunnel, "payload on the wrong tunnel, dropping");
            return Ok(());
        }
        let (token, reply_to) = (endpoint.token, endpoint.reply_to);
        if self.routes.get(&token) == Some(&Route::ServerDevice) {
            self.learn_device_route(token, id, &data);
        }
        match self.with_endpoint(token, |endpoint, reactor| endpoint.send(reactor, data, reply_to)) {
            Some(Ok(_)) => {}
            Some(Err(err)) => debug!(%id, %err, "endpoint refused payload"),
            None => warn!(%id, token = token.0, "bound endpoint is gone"),
        }
        Ok(())
    }

    fn on_raw(&mut self, token: Token, bytes: Vec<u8>, first: bool) -> Result<(), Error> {
        let Some(Route::Tunnel(tunnel_id)) = self.routes.get(&token).copied() else {
            warn!(token = token.0, len = bytes.len(), "unexpected raw input, dropping");
            return Ok(());
        };
        let Some(tunnel) = self.registry.tunnel(tunnel_id) else {
            return Ok(());
        };
        let pristine = tunnel.is_empty() && !tunnel.has_decoded();
        if let Some(backend) = tunnel.fallback {
            let ready = self
                .with_endpoint(backend, |endpoint, reactor| {
                    endpoint.send(reactor, bytes, None)?;
                    Ok::<_, Error>(endpoint.is_ready_to_send())
                })
                .unwrap_or(Err(Rejected::UnknownEndpoint.into()))?;
            if !ready {
                self.with_endpoint(token, |endpoint, reactor| endpoint.stop_receiving(reactor));
            }
            return Ok(());
        }

        let fallback = match self.config.role() {
            Role::Accept { fallback } => *fallback,
            Role::Connect { .. } => None,
        };
        match fallback {
            Some(addr) if first && pristine => {
                self.start_fallback(tunnel_id, addr, bytes)
            }
            _ => {
                warn!(tunnel = %tunnel_id, len = bytes.len(), "unrecognized tunnel input, closing");
                self.with_endpoint(token, |endpoint, reactor| endpoint.close(reactor));
                Ok(())
            }
        }
    }

    /// Relays a connection that does not speak the tunnel protocol to
    /// `addr`, starting with everything it sent so far.
    fn start_fallback(
        &mut self,
        tunnel_id: TunnelId,
        addr: SocketAddr,
        received: Vec<u8>,
    ) -> Result<(), Error> {
        info!(tunnel = %tunnel_id, %addr, len = received.len(), "relaying unrecognized connection");
        let token = self.reactor.allocate_token();
        let mut backend = Endpoint::new(token, self.settings());
        backend.set_start_on_connect(true);
        backend.send(&mut self.reactor, received, None)?;
        backend.connect(&mut self.reactor, addr)?;

        if let (Some(tunnel), Some(endpoint)) = (
            self.registry.tunnel_mut(tunnel_id),
            self.endpoints.get_mut(&tunnel_id.token()),
        ) {
            tunnel.fallback = Some(token);
            tunnel.disable_heartbeat(endpoint, &mut self.reactor);
            endpoint.pipeline_mut().clear_encoders();
        }
        self.insert(backend, Route::Fallback(tunnel_id));
        Ok(())
    }

    fn on_timer(&mut self, token: Token, id: TimerId) {
        self.with_endpoint(token, |endpoint, reactor| endpoint.on_timer(reactor, id));
    }

    fn drain_notifications(&mut self) {
        while let Some((token, event)) = self.reactor.next_notification() {
            let Some(route) = self.routes.get(&token).copied() else {
                trace!(token = token.0, ?event, "notification for a gone endpoint");
                continue;
            };
            let result = match route {
                Route::Tunnel(tunnel) => self.on_tunnel_event(tunnel, event),
                Route::Logical(id) => self.on_logical_event(token, id, event),
                Route::Fallback(tunnel) => self.on_fallback_event(token, tunnel, event),
                Route::UdpFrontend | Route::ClientDevice | Route::ServerDevice => {
                    self.on_shared_event(token, route, event)
                }
            };
            if let Err(err) = result {
                self.teardown(token, err);
            }
        }
    }

    fn on_tunnel_event(&mut self, tunnel_id: TunnelId, event: EndpointEvent) -> Result<(), Error> {
        let token = tunnel_id.token();
        match event {
            EndpointEvent::Connected => info!(tunnel = %tunnel_id, "tunnel connected"),
            EndpointEvent::FinReceived => {
                debug!(tunnel = %tunnel_id, "tunnel peer finished");
                let target = match self.registry.tunnel_mut(tunnel_id) {
                    Some(tunnel) => {
                        if let Some(endpoint) = self.endpoints.get_mut(&token) {
                            tunnel.disable_heartbeat(endpoint, &mut self.reactor);
                        }
                        tunnel.fallback.unwrap_or(token)
                    }
                    None => token,
                };
                self.with_endpoint(target, |endpoint, reactor| endpoint.shutdown(reactor))
                    .transpose()?;
            }
            EndpointEvent::Closed => self.on_tunnel_closed(tunnel_id),
            EndpointEvent::BufferHigh => self.fan_out(tunnel_id, false),
            EndpointEvent::BufferLow => self.fan_out(tunnel_id, true),
            EndpointEvent::Timer(HEARTBEAT) => {
                let interval = self.config.timeouts.heartbeat;
                if let (Some(tunnel), Some(endpoint)) = (
                    self.registry.tunnel(tunnel_id),
                    self.endpoints.get_mut(&token),
                ) {
                    tunnel.on_heartbeat(endpoint, &mut self.reactor, interval)?;
                }
            }
            EndpointEvent::Sent { .. } | EndpointEvent::Timer(_) | EndpointEvent::Probe { .. } => {}
        }
        Ok(())
    }

    /// Pauses or resumes every endpoint fed by this tunnel.
    fn fan_out(&mut self, tunnel_id: TunnelId, resume: bool) {
        let tokens = match self.registry.tunnel(tunnel_id).and_then(|t| t.fallback) {
            Some(backend) => vec![backend],
            None => self.registry.connections_of(tunnel_id),
        };
        debug!(tunnel = %tunnel_id, resume, count = tokens.len(), "propagating backpressure");
        for token in tokens {
            if resume && self.feeds_busy_tunnel(token) {
                trace!(token = token.0, "another tunnel is still busy, staying paused");
                continue;
            }
            self.with_endpoint(token, |endpoint, reactor| {
                if resume {
                    endpoint.start_receiving(reactor)
                } else {
                    endpoint.stop_receiving(reactor)
                }
            });
        }
    }

    /// Whether any tunnel carrying a flow of `token` is over its high
    /// watermark. Shared frontends and devices feed several tunnels.
    fn feeds_busy_tunnel(&self, token: Token) -> bool {
        self.registry
            .served_by(token)
            .into_iter()
            .filter_map(|id| self.registry.query_endpoint(id))
            .any(|flow| {
                self.endpoints
                    .get(&flow.tunnel.token())
                    .is_some_and(Endpoint::is_buffer_high)
            })
    }

    fn on_tunnel_closed(&mut self, tunnel_id: TunnelId) {
        info!(tunnel = %tunnel_id, "tunnel closed");
        let token = tunnel_id.token();
        self.endpoints.remove(&token);
        self.routes.remove(&token);
        if let Some(backend) = self.registry.tunnel(tunnel_id).and_then(|t| t.fallback) {
            self.with_endpoint(backend, |endpoint, reactor| endpoint.close(reactor));
        }
        for orphan in self.registry.on_tunnel_closed(tunnel_id) {
            match self.routes.get(&orphan.token).copied() {
                Some(Route::Logical(_)) => {
                    self.with_endpoint(orphan.token, |endpoint, reactor| endpoint.close(reactor));
                }
                Some(route) => self.forget_shared_flow(orphan.token, route, orphan.id),
                None => {}
            }
        }
    }

    fn on_logical_event(
        &mut self,
        token: Token,
        id: ConnectionId,
        event: EndpointEvent,
    ) -> Result<(), Error> {
        match event {
            EndpointEvent::Connected => {
                let peer = self.endpoints.get(&token).and_then(Endpoint::peer_addr);
                info!(%id, ?peer, "flow connected");
            }
            EndpointEvent::FinReceived => {
                if let Some(tunnel) = self.bound_tunnel(id, token) {
                    self.send_frame(tunnel, &Frame::new(FrameKind::TcpFin, id, Vec::new()))?;
                }
            }
            EndpointEvent::Closed => {
                self.endpoints.remove(&token);
                self.routes.remove(&token);
                if self.bound_tunnel(id, token).is_none() {
                    return Ok(());
                }
                let Some(flow) = self.registry.deregister(id) else {
                    return Ok(());
                };
                info!(%id, by_peer = flow.closed_by_peer, "flow closed");
                let kind = match flow.kind {
                    EndpointKind::Stream => FrameKind::TcpClosed,
                    EndpointKind::Datagram => FrameKind::UdpClosed,
                    EndpointKind::Device => return Ok(()),
                };
                if !flow.closed_by_peer {
                    if let Err(err) = self.send_frame(flow.tunnel, &Frame::new(kind, id, Vec::new())) {
                        debug!(%id, %err, "could not announce close");
                    }
                }
            }
            EndpointEvent::BufferHigh | EndpointEvent::BufferLow => {
                trace!(%id, ?event, "flow buffer");
            }
            EndpointEvent::Sent { .. } | EndpointEvent::Timer(_) | EndpointEvent::Probe { .. } => {}
        }
        Ok(())
    }

    /// The tunnel carrying `id`, if `token` still serves it.
    pub(crate) fn bound_tunnel(&self, id: ConnectionId, token: Token) -> Option<TunnelId> {
        self.registry
            .query_endpoint(id)
            .filter(|endpoint| endpoint.token == token)
            .map(|endpoint| endpoint.tunnel)
    }

    fn on_fallback_event(
        &mut self,
        token: Token,
        tunnel_id: TunnelId,
        event: EndpointEvent,
    ) -> Result<(), Error> {
        let tunnel = tunnel_id.token();
        match event {
            EndpointEvent::Connected => debug!(tunnel = %tunnel_id, "fallback connected"),
            EndpointEvent::Closed => {
                self.endpoints.remove(&token);
                self.routes.remove(&token);
                self.with_endpoint(tunnel, |endpoint, reactor| endpoint.close(reactor));
            }
            EndpointEvent::FinReceived => {
                self.with_endpoint(tunnel, |endpoint, reactor| endpoint.shutdown(reactor))
                    .transpose()?;
            }
            EndpointEvent::BufferHigh => {
                self.with_endpoint(tunnel, |endpoint, reactor| endpoint.stop_receiving(reactor));
            }
            EndpointEvent::BufferLow => {
                self.with_endpoint(tunnel, |endpoint, reactor| endpoint.start_receiving(reactor));
            }
            EndpointEvent::Sent { .. } | EndpointEvent::Timer(_) | EndpointEvent::Probe { .. } => {}
        }
        Ok(())
    }
}
