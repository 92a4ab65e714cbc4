//! Protocol adapters: what the ends of a tunnel do with TCP streams, UDP
//! flows and device packets.
//!
//! The connecting side opens a flow per accepted stream, per datagram
//! source address, or per attached device, and announces it with an
//! `*_INITIAL` frame. The accepting side answers those frames by opening
//! the matching backend.
use core::fmt::{Debug, Formatter};
use std::{
    collections::HashMap,
    fs::File,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use mio::{
    Token,
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, info, trace, warn};

use crate::{
    endpoint::{Endpoint, EndpointEvent, EndpointKind},
    engine::{Engine, Route},
    error::Error,
    frame::{ConnectionId, DeviceTarget, Frame, FrameKind, Target},
    packet::{self, Ipv4Framing},
    registry::LogicalEndpoint,
    tunnel::TunnelId,
};

/// Name of the probe checking that the relay is reachable.
const RELAY_PROBE: &str = "relay";
/// Name of the timer retrying a device flow.
const RECONNECT: &str = "reconnect";

/// Opens the device for a network a peer asked to join.
pub(crate) struct DeviceOpener(Box<dyn FnMut(&DeviceTarget) -> io::Result<File>>);

impl DeviceOpener {
    pub(crate) fn new<F>(opener: F) -> Self
    where
        F: FnMut(&DeviceTarget) -> io::Result<File> + 'static,
    {
        Self(Box::new(opener))
    }

    fn open(&mut self, target: &DeviceTarget) -> io::Result<File> {
        (self.0)(target)
    }
}

impl Debug for DeviceOpener {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("DeviceOpener")
    }
}

#[derive(Debug)]
struct UdpFrontend {
    via: SocketAddr,
    to: SocketAddr,
    flows: HashMap<SocketAddr, ConnectionId>,
}

#[derive(Debug)]
struct ClientDevice {
    via: SocketAddr,
    target: DeviceTarget,
    flow: Option<ConnectionId>,
}

#[derive(Debug)]
struct ServerDevice {
    target: DeviceTarget,
    routes: HashMap<Ipv4Addr, ConnectionId>,
}

/// State of the endpoints shared by several flows, or outliving them.
#[derive(Debug, Default)]
pub(crate) struct Adapters {
    pub(crate) opener: Option<DeviceOpener>,
    udp_frontends: HashMap<Token, UdpFrontend>,
    client_devices: HashMap<Token, ClientDevice>,
    server_devices: HashMap<Token, ServerDevice>,
    devices_by_target: HashMap<DeviceTarget, Token>,
}

fn unspecified_like(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// `TCP_INITIAL`: connects a backend stream for the flow.
pub(crate) fn on_tcp_initial(
    engine: &mut Engine,
    tunnel: TunnelId,
    id: ConnectionId,
    payload: Vec<u8>,
) -> Result<(), Error> {
    let target: Target = serde_json::from_slice(&payload)?;
    let addr = SocketAddr::from(target);
    let token = engine.reactor.allocate_token();
    engine.bind(LogicalEndpoint::new(id, token, EndpointKind::Stream, tunnel))?;

    let mut backend = Endpoint::new(token, engine.settings());
    backend.set_start_on_connect(true);
    backend.connect(&mut engine.reactor, addr)?;
    engine.insert(backend, Route::Logical(id));
    info!(%tunnel, %id, %addr, "connecting flow");
    Ok(())
}

/// `UDP_INITIAL`: opens a datagram socket aimed at the target.
pub(crate) fn on_udp_initial(
    engine: &mut Engine,
    tunnel: TunnelId,
    id: ConnectionId,
    payload: Vec<u8>,
) -> Result<(), Error> {
    let target: Target = serde_json::from_slice(&payload)?;
    let addr = SocketAddr::from(target);
    let socket = UdpSocket::bind(unspecified_like(addr))?;
    let token = engine.reactor.allocate_token();
    engine.bind(LogicalEndpoint::new(id, token, EndpointKind::Datagram, tunnel))?;

    let mut backend = Endpoint::datagram(token, socket, Some(addr), engine.settings());
    backend.start_receiving(&mut engine.reactor);
    backend.set_timeout(&mut engine.reactor, Some(engine.config.timeouts.udp_idle));
    engine.insert(backend, Route::Logical(id));
    info!(%tunnel, %id, %addr, "new datagram flow");
    Ok(())
}

/// `TUN_INITIAL`: joins the flow to the device of the requested network,
/// opening the device on first use.
pub(crate) fn on_tun_initial(
    engine: &mut Engine,
    tunnel: TunnelId,
    id: ConnectionId,
    payload: Vec<u8>,
) -> Result<(), Error> {
    let target: DeviceTarget = serde_json::from_slice(&payload)?;
    let token = match engine.adapters.devices_by_target.get(&target) {
        Some(token) => *token,
        None => engine.open_server_device(target)?,
    };
    engine.bind(LogicalEndpoint::new(id, token, EndpointKind::Device, tunnel))?;
    info!(%tunnel, %id, addr = %target.addr, prefix = target.prefix, "device flow joined");
    Ok(())
}

/// `TCP_FIN`: the peer finished sending on the flow.
pub(crate) fn on_tcp_fin(
    engine: &mut Engine,
    tunnel: TunnelId,
    id: ConnectionId,
    _payload: Vec<u8>,
) -> Result<(), Error> {
    let Some(token) = engine.flow_token(tunnel, id) else {
        debug!(%tunnel, %id, "fin for unknown flow");
        return Ok(());
    };
    if let Some(Err(err)) =
        engine.with_endpoint(token, |endpoint, reactor| endpoint.shutdown(reactor))
    {
        debug!(%id, %err, "cannot half-close flow");
    }
    Ok(())
}

/// `TCP_CLOSED` and `UDP_CLOSED`: the peer closed the flow.
pub(crate) fn on_flow_closed(
    engine: &mut Engine,
    tunnel: TunnelId,
    id: ConnectionId,
    _payload: Vec<u8>,
) -> Result<(), Error> {
    let Some(token) = engine.flow_token(tunnel, id) else {
        debug!(%tunnel, %id, "close for unknown flow");
        return Ok(());
    };
    if let Some(flow) = engine.registry.query_endpoint_mut(id) {
        flow.closed_by_peer = true;
    }
    debug!(%tunnel, %id, "flow closed by peer");
    match engine.routes.get(&token).copied() {
        Some(Route::Logical(_)) => {
            engine.with_endpoint(token, |endpoint, reactor| endpoint.close(reactor));
        }
        Some(route) => {
            engine.registry.deregister(id);
            engine.forget_shared_flow(token, route, id);
        }
        None => {
            engine.registry.deregister(id);
        }
    }
    Ok(())
}

impl Engine {
    /// Binds a flow in the registry, closing the endpoint it evicts.
    pub(crate) fn bind(&mut self, flow: LogicalEndpoint) -> Result<(), Error> {
        let Some(evicted) = self.registry.register(flow)? else {
            return Ok(());
        };
        match self.routes.get(&evicted.token).copied() {
            Some(Route::Logical(_)) => {
                self.with_endpoint(evicted.token, |endpoint, reactor| endpoint.close(reactor));
            }
            Some(route) => self.forget_shared_flow(evicted.token, route, evicted.id),
            None => {}
        }
        Ok(())
    }

    /// The endpoint serving `id`, if `tunnel` carries it.
    fn flow_token(&self, tunnel: TunnelId, id: ConnectionId) -> Option<Token> {
        self.registry
            .query_endpoint(id)
            .filter(|flow| flow.tunnel == tunnel)
            .map(|flow| flow.token)
    }

    /// Drops what a shared endpoint remembers about a flow that ended.
    pub(crate) fn forget_shared_flow(&mut self, token: Token, route: Route, id: ConnectionId) {
        match route {
            Route::UdpFrontend => {
                if let Some(frontend) = self.adapters.udp_frontends.get_mut(&token) {
                    frontend.flows.retain(|_, flow| *flow != id);
                }
            }
            Route::ServerDevice => {
                if let Some(device) = self.adapters.server_devices.get_mut(&token) {
                    device.routes.retain(|_, flow| *flow != id);
                }
            }
            Route::ClientDevice => {
                let Some(device) = self.adapters.client_devices.get_mut(&token) else {
                    return;
                };
                if device.flow != Some(id) {
                    return;
                }
                device.flow = None;
                let delay = self.config.timeouts.device_reconnect;
                info!(%id, ?delay, "device flow lost, reconnecting");
                self.with_endpoint(token, |endpoint, reactor| {
                    endpoint.add_timer(reactor, RECONNECT, delay)
                });
            }
            Route::Tunnel(_) | Route::Logical(_) | Route::Fallback(_) => {}
        }
    }

    pub(crate) fn on_forward_accepted(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        via: SocketAddr,
        to: SocketAddr,
    ) -> Result<(), Error> {
        let token = self.reactor.allocate_token();
        let id = ConnectionId::generate();
        let endpoint = Endpoint::accepted(token, stream, self.settings());
        self.insert(endpoint, Route::Logical(id));
        if let Err(err) = self.open_stream_flow(token, id, via, to) {
            self.teardown(token, err);
            return Ok(());
        }
        info!(%peer, %id, %via, %to, "forwarding connection");
        Ok(())
    }

    fn open_stream_flow(
        &mut self,
        token: Token,
        id: ConnectionId,
        via: SocketAddr,
        to: SocketAddr,
    ) -> Result<(), Error> {
        let tunnel = self.tunnel_towards(id, via)?;
        self.bind(LogicalEndpoint::new(id, token, EndpointKind::Stream, tunnel))?;
        let initial = serde_json::to_vec(&Target::from(to))?;
        self.send_frame(tunnel, &Frame::new(FrameKind::TcpInitial, id, initial))?;
        self.with_endpoint(token, |endpoint, reactor| endpoint.start_receiving(reactor));
        Ok(())
    }

    pub(crate) fn open_udp_frontend(
        &mut self,
        from: SocketAddr,
        via: SocketAddr,
        to: SocketAddr,
    ) -> Result<SocketAddr, Error> {
        let socket = UdpSocket::bind(from)?;
        let local = socket.local_addr()?;
        let token = self.reactor.allocate_token();
        let mut endpoint = Endpoint::datagram(token, socket, None, self.settings());
        endpoint.start_receiving(&mut self.reactor);
        self.insert(endpoint, Route::UdpFrontend);
        self.adapters.udp_frontends.insert(
            token,
            UdpFrontend {
                via,
                to,
                flows: HashMap::new(),
            },
        );
        info!(addr = %local, %via, %to, "forwarding datagrams");
        Ok(local)
    }

    /// A datagram from `from` on a frontend: goes through the flow of its
    /// source address, opened on first sight.
    pub(crate) fn on_udp_frontend_datagram(
        &mut self,
        token: Token,
        datagram: Vec<u8>,
        from: SocketAddr,
    ) -> Result<bool, Error> {
        match self.udp_flow(token, from) {
            Ok(Some((tunnel, id))) => {
                trace!(%from, %id, len = datagram.len(), "datagram");
                match self.send_payload(tunnel, id, &datagram) {
                    Ok(ready) => Ok(ready),
                    Err(err) => {
                        warn!(%from, %id, %err, "dropping datagram");
                        Ok(true)
                    }
                }
            }
            Ok(None) => Ok(true),
            Err(err) => {
                warn!(%from, %err, "cannot open datagram flow");
                Ok(true)
            }
        }
    }

    fn udp_flow(
        &mut self,
        token: Token,
        from: SocketAddr,
    ) -> Result<Option<(TunnelId, ConnectionId)>, Error> {
        let Some(frontend) = self.adapters.udp_frontends.get(&token) else {
            return Ok(None);
        };
        let (via, to) = (frontend.via, frontend.to);
        if let Some(id) = frontend.flows.get(&from).copied() {
            if let Some(tunnel) = self.bound_tunnel(id, token) {
                return Ok(Some((tunnel, id)));
            }
        }

        let id = ConnectionId::generate();
        let tunnel = self.tunnel_towards(id, via)?;
        self.bind(
            LogicalEndpoint::new(id, token, EndpointKind::Datagram, tunnel).with_reply_to(from),
        )?;
        let initial = serde_json::to_vec(&Target::from(to))?;
        self.send_frame(tunnel, &Frame::new(FrameKind::UdpInitial, id, initial))?;
        if let Some(frontend) = self.adapters.udp_frontends.get_mut(&token) {
            frontend.flows.insert(from, id);
        }
        info!(%from, %id, %to, "new datagram flow");
        Ok(Some((tunnel, id)))
    }

    pub(crate) fn open_client_device(
        &mut self,
        device: File,
        via: SocketAddr,
        target: DeviceTarget,
    ) -> Result<(), Error> {
        let token = self.reactor.allocate_token();
        let mut endpoint = Endpoint::device(token, device, self.settings());
        endpoint.pipeline_mut().push_decoder(Ipv4Framing);
        endpoint.start_receiving(&mut self.reactor);
        self.insert(endpoint, Route::ClientDevice);
        self.adapters.client_devices.insert(
            token,
            ClientDevice {
                via,
                target,
                flow: None,
            },
        );
        info!(%via, addr = %target.addr, prefix = target.prefix, "device attached");
        self.probe_relay(token)
    }

    /// Checks on a helper thread that the relay of a device accepts
    /// connections.
    fn probe_relay(&mut self, token: Token) -> Result<(), Error> {
        let Some(device) = self.adapters.client_devices.get(&token) else {
            return Ok(());
        };
        let via = device.via;
        let timeout = self.config.timeouts.probe;
        debug!(%via, "probing relay");
        self.reactor.spawn_probe(token, RELAY_PROBE, move || {
            std::net::TcpStream::connect_timeout(&via, timeout).is_ok()
        })?;
        Ok(())
    }

    fn open_device_flow(&mut self, token: Token) -> Result<(), Error> {
        let Some(device) = self.adapters.client_devices.get(&token) else {
            return Ok(());
        };
        if device.flow.is_some() {
            return Ok(());
        }
        let (via, target) = (device.via, device.target);
        let id = ConnectionId::generate();
        let tunnel = self.tunnel_towards(id, via)?;
        self.bind(LogicalEndpoint::new(id, token, EndpointKind::Device, tunnel))?;
        let initial = serde_json::to_vec(&target)?;
        self.send_frame(tunnel, &Frame::new(FrameKind::TunInitial, id, initial))?;
        if let Some(device) = self.adapters.client_devices.get_mut(&token) {
            device.flow = Some(id);
        }
        info!(%id, %tunnel, "device flow opened");
        Ok(())
    }

    pub(crate) fn on_client_device_packet(
        &mut self,
        token: Token,
        packet: Vec<u8>,
    ) -> Result<bool, Error> {
        let flow = self
            .adapters
            .client_devices
            .get(&token)
            .and_then(|device| device.flow)
            .and_then(|id| self.bound_tunnel(id, token).map(|tunnel| (tunnel, id)));
        let Some((tunnel, id)) = flow else {
            trace!(len = packet.len(), "no device flow yet, dropping packet");
            return Ok(true);
        };
        match self.send_payload(tunnel, id, &packet) {
            Ok(ready) => Ok(ready),
            Err(err) => {
                debug!(%id, %err, "dropping packet");
                Ok(true)
            }
        }
    }

    fn open_server_device(&mut self, target: DeviceTarget) -> Result<Token, Error> {
        let Some(opener) = self.adapters.opener.as_mut() else {
            return Err(Error::Handler("no device opener configured".to_string()));
        };
        let device = opener.open(&target)?;
        let token = self.reactor.allocate_token();
        let mut endpoint = Endpoint::device(token, device, self.settings());
        endpoint.pipeline_mut().push_decoder(Ipv4Framing);
        endpoint.start_receiving(&mut self.reactor);
        self.insert(endpoint, Route::ServerDevice);
        self.adapters.server_devices.insert(
            token,
            ServerDevice {
                target,
                routes: HashMap::new(),
            },
        );
        self.adapters.devices_by_target.insert(target, token);
        info!(addr = %target.addr, prefix = target.prefix, "device opened");
        Ok(token)
    }

    /// A packet arriving from flow `id` teaches the device that its source
    /// address is reached through that flow.
    pub(crate) fn learn_device_route(&mut self, token: Token, id: ConnectionId, packet: &[u8]) {
        let Some(source) = packet::source(packet) else {
            return;
        };
        let Some(device) = self.adapters.server_devices.get_mut(&token) else {
            return;
        };
        if device.routes.insert(source, id) != Some(id) {
            debug!(%source, %id, "device route learned");
        }
    }

    /// A packet read from a shared device goes to the flow its destination
    /// was learned from.
    pub(crate) fn on_server_device_packet(
        &mut self,
        token: Token,
        packet: Vec<u8>,
    ) -> Result<bool, Error> {
        let Some(destination) = packet::destination(&packet) else {
            return Ok(true);
        };
        let id = self
            .adapters
            .server_devices
            .get(&token)
            .and_then(|device| device.routes.get(&destination).copied());
        let Some((tunnel, id)) =
            id.and_then(|id| self.bound_tunnel(id, token).map(|tunnel| (tunnel, id)))
        else {
            trace!(%destination, "no route for packet, dropping");
            return Ok(true);
        };
        match self.send_payload(tunnel, id, &packet) {
            Ok(ready) => Ok(ready),
            Err(err) => {
                debug!(%id, %err, "dropping packet");
                Ok(true)
            }
        }
    }

    /// Events of frontends and devices, which outlive the flows through
    /// them.
    pub(crate) fn on_shared_event(
        &mut self,
        token: Token,
        route: Route,
        event: EndpointEvent,
    ) -> Result<(), Error> {
        match event {
            EndpointEvent::Closed => self.on_shared_closed(token, route),
            EndpointEvent::Probe {
                name: RELAY_PROBE,
                reachable,
            } => {
                if reachable {
                    if let Err(err) = self.open_device_flow(token) {
                        warn!(%err, "cannot open device flow");
                        self.schedule_reconnect(token);
                    }
                } else {
                    warn!("relay unreachable");
                    self.schedule_reconnect(token);
                }
            }
            EndpointEvent::Timer(RECONNECT) => self.probe_relay(token)?,
            EndpointEvent::Connected
            | EndpointEvent::Sent { .. }
            | EndpointEvent::FinReceived
            | EndpointEvent::BufferHigh
            | EndpointEvent::BufferLow
            | EndpointEvent::Timer(_)
            | EndpointEvent::Probe { .. } => {}
        }
        Ok(())
    }

    fn schedule_reconnect(&mut self, token: Token) {
        let delay = self.config.timeouts.device_reconnect;
        self.with_endpoint(token, |endpoint, reactor| {
            endpoint.add_timer(reactor, RECONNECT, delay)
        });
    }

    fn on_shared_closed(&mut self, token: Token, route: Route) {
        self.endpoints.remove(&token);
        self.routes.remove(&token);
        match route {
            Route::UdpFrontend => {
                self.adapters.udp_frontends.remove(&token);
            }
            Route::ClientDevice => {
                self.adapters.client_devices.remove(&token);
            }
            Route::ServerDevice => {
                if let Some(device) = self.adapters.server_devices.remove(&token) {
                    self.adapters.devices_by_target.remove(&device.target);
                }
            }
            Route::Tunnel(_) | Route::Logical(_) | Route::Fallback(_) => {}
        }
        let flows = self.registry.served_by(token);
        info!(token = token.0, ?route, flows = flows.len(), "shared endpoint closed");
        for id in flows {
            let Some(flow) = self.registry.deregister(id) else {
                continue;
            };
            if flow.kind == EndpointKind::Datagram && !flow.closed_by_peer {
                let frame = Frame::new(FrameKind::UdpClosed, id, Vec::new());
                if let Err(err) = self.send_frame(flow.tunnel, &frame) {
                    debug!(%id, %err, "could not announce close");
                }
            }
        }
    }
}
