//! The Tunnel: many logical connections multiplexed over one physical
//! stream endpoint.
//!
//! A tunnel is identified by the token of its physical endpoint. It keeps
//! the ids of the connections it carries, sends a heartbeat frame on a
//! fixed interval while it is open, and turns every decoded unit of its
//! physical endpoint into one [`Frame`].
//!
//! ```text
//!  logical endpoints          tunnel                physical endpoint
//! +-----------------+     +------------+     +-------------------------+
//! | id A  (tcp)     | <-> |            |     | framing, padding,       |
//! | id B  (udp)     | <-> | frames     | <-> | keystream, base64, HTTP | <-> relay
//! | id C  (device)  | <-> |            |     |                         |
//! +-----------------+     +------------+     +-------------------------+
//! ```
use core::fmt::{Display, Formatter};
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Duration,
};

use mio::Token;
use tracing::{debug, trace};

use crate::{
    adapter,
    endpoint::Endpoint,
    engine::Engine,
    error::{Corrupted, Error, RegistryError},
    frame::{ConnectionId, Frame, FrameKind},
    mimicry::physical_chain,
    reactor::Reactor,
};

/// Name of the heartbeat timer on a physical endpoint.
pub(crate) const HEARTBEAT: &str = "heartbeat";

/// Identifies a tunnel by the token of its physical endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TunnelId(pub(crate) Token);

impl TunnelId {
    /// The token of the physical endpoint.
    pub fn token(&self) -> Token {
        self.0
    }
}

impl Display for TunnelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "tunnel#{}", self.0.0)
    }
}

/// One physical link and the connections it carries.
#[derive(Debug)]
pub struct Tunnel {
    id: TunnelId,
    relay: Option<SocketAddr>,
    connections: HashMap<ConnectionId, Token>,
    heartbeat: bool,
    decoded: bool,
    pub(crate) fallback: Option<Token>,
}

impl Tunnel {
    /// A tunnel that connects out to `relay`.
    pub fn connecting(id: TunnelId, relay: SocketAddr) -> Self {
        Self::new(id, Some(relay))
    }

    /// A tunnel over an accepted stream.
    pub fn accepted(id: TunnelId) -> Self {
        Self::new(id, None)
    }

    fn new(id: TunnelId, relay: Option<SocketAddr>) -> Self {
        Self {
            id,
            relay,
            connections: HashMap::new(),
            heartbeat: false,
            decoded: false,
            fallback: None,
        }
    }

    /// The id of the tunnel.
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// The relay this tunnel connects to, if it originated the link.
    pub fn relay(&self) -> Option<SocketAddr> {
        self.relay
    }

    /// Whether this side originated the link.
    pub fn is_connecting(&self) -> bool {
        self.relay.is_some()
    }

    /// Whether at least one frame was decoded from the link.
    pub fn has_decoded(&self) -> bool {
        self.decoded
    }

    /// Whether unrecognized input is being relayed to a fallback backend.
    pub fn is_relaying(&self) -> bool {
        self.fallback.is_some()
    }

    /// Attaches the physical codec chain to `endpoint` and starts it:
    /// connecting out to the relay, or receiving on an accepted stream.
    /// The heartbeat timer is armed either way.
    pub fn initialize(
        &mut self,
        endpoint: &mut Endpoint,
        reactor: &mut Reactor,
        heartbeat: Duration,
    ) -> Result<(), Error> {
        endpoint.set_pipeline(physical_chain(self.is_connecting()));
        match self.relay {
            Some(relay) => {
                endpoint.set_start_on_connect(true);
                endpoint.connect(reactor, relay)?;
            }
            None => endpoint.start_receiving(reactor),
        }
        self.heartbeat = true;
        endpoint.add_timer(reactor, HEARTBEAT, heartbeat);
        debug!(tunnel = %self.id, relay = ?self.relay, "tunnel initialized");
        Ok(())
    }

    /// Binds `id` to the logical endpoint `token` within this tunnel.
    pub fn register(&mut self, id: ConnectionId, token: Token) -> Result<(), RegistryError> {
        if self.connections.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered);
        }
        debug!(tunnel = %self.id, %id, token = token.0, "register");
        self.connections.insert(id, token);
        Ok(())
    }

    pub(crate) fn rebind(&mut self, id: ConnectionId, token: Token) -> Option<Token> {
        self.connections.insert(id, token)
    }

    /// Unbinds `id`.
    pub fn deregister(&mut self, id: ConnectionId) -> Option<Token> {
        debug!(tunnel = %self.id, %id, "deregister");
        self.connections.remove(&id)
    }

    /// The logical endpoint bound to `id`.
    pub fn get_connection(&self, id: ConnectionId) -> Option<Token> {
        self.connections.get(&id).copied()
    }

    /// Unbinds every connection and returns them.
    pub fn clear_connections(&mut self) -> Vec<(ConnectionId, Token)> {
        debug!(tunnel = %self.id, count = self.connections.len(), "clear connections");
        self.connections.drain().collect()
    }

    /// The connections carried.
    pub fn connections(&self) -> impl Iterator<Item = (ConnectionId, Token)> + '_ {
        self.connections.iter().map(|(id, token)| (*id, *token))
    }

    /// Number of connections carried.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the tunnel carries no connection.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Parses one decoded unit of the physical endpoint.
    ///
    /// A unit that is not exactly one frame is corruption of the whole
    /// tunnel.
    pub fn parse(&mut self, unit: &[u8]) -> Result<Frame, Corrupted> {
        let frame = Frame::parse(unit)?;
        self.decoded = true;
        trace!(tunnel = %self.id, kind = ?frame.kind, id = %frame.id, len = frame.payload.len(), "frame");
        Ok(frame)
    }

    /// Sends one frame. Returns whether the physical endpoint can take more.
    pub fn send(
        endpoint: &mut Endpoint,
        reactor: &mut Reactor,
        frame: &Frame,
    ) -> Result<bool, Error> {
        endpoint.send(reactor, frame.encode()?, None)?;
        Ok(endpoint.is_ready_to_send())
    }

    /// Sends `data` as `PAYLOAD` frames of `id`. Returns whether the physical
    /// endpoint can take more.
    pub fn send_payload(
        endpoint: &mut Endpoint,
        reactor: &mut Reactor,
        id: ConnectionId,
        data: &[u8],
    ) -> Result<bool, Error> {
        for frame in Frame::payloads(id, data) {
            Tunnel::send(endpoint, reactor, &frame)?;
        }
        Ok(endpoint.is_ready_to_send())
    }

    /// Sends a heartbeat and re-arms the timer, unless heartbeats were
    /// disabled.
    pub fn on_heartbeat(
        &self,
        endpoint: &mut Endpoint,
        reactor: &mut Reactor,
        interval: Duration,
    ) -> Result<(), Error> {
        if !self.heartbeat {
            return Ok(());
        }
        trace!(tunnel = %self.id, "heartbeat");
        Tunnel::send(endpoint, reactor, &Frame::heartbeat())?;
        endpoint.add_timer(reactor, HEARTBEAT, interval);
        Ok(())
    }

    /// Stops sending heartbeats.
    pub fn disable_heartbeat(&mut self, endpoint: &mut Endpoint, reactor: &mut Reactor) {
        if self.heartbeat {
            debug!(tunnel = %self.id, "heartbeat disabled");
        }
        self.heartbeat = false;
        endpoint.del_timer(reactor, HEARTBEAT);
    }
}

/// Handles one non-`PAYLOAD` frame arriving on a tunnel.
pub(crate) type FrameHandler =
    fn(&mut Engine, TunnelId, ConnectionId, Vec<u8>) -> Result<(), Error>;

/// The frame-type to handler table, fixed per role.
///
/// Both roles handle the end of flows. Only the accepting role opens flows
/// when asked to by the peer.
#[derive(Debug)]
pub(crate) struct FrameHandlers {
    table: HashMap<FrameKind, FrameHandler>,
}

impl FrameHandlers {
    pub(crate) fn for_role(accepting: bool) -> Self {
        let mut table: HashMap<FrameKind, FrameHandler> = HashMap::new();
        table.insert(FrameKind::Heartbeat, |_, _, _, _| Ok(()));
        table.insert(FrameKind::TcpFin, adapter::on_tcp_fin);
        table.insert(FrameKind::TcpClosed, adapter::on_flow_closed);
        table.insert(FrameKind::UdpClosed, adapter::on_flow_closed);
        if accepting {
            table.insert(FrameKind::TcpInitial, adapter::on_tcp_initial);
            table.insert(FrameKind::UdpInitial, adapter::on_udp_initial);
            table.insert(FrameKind::TunInitial, adapter::on_tun_initial);
        }
        Self { table }
    }

    pub(crate) fn get(&self, kind: FrameKind) -> Option<FrameHandler> {
        self.table.get(&kind).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::specification::FRAME_PAYLOAD_MAX_LEN;

    fn tunnel() -> Tunnel {
        Tunnel::accepted(TunnelId(Token(7)))
    }

    #[test]
    fn test_register_asserts_unbound() {
        let mut tunnel = tunnel();
        let id = ConnectionId::generate();
        tunnel.register(id, Token(1)).unwrap();
        assert_eq!(
            tunnel.register(id, Token(2)),
            Err(RegistryError::AlreadyRegistered)
        );
        assert_eq!(tunnel.get_connection(id), Some(Token(1)));
        assert_eq!(tunnel.deregister(id), Some(Token(1)));
        assert_eq!(tunnel.get_connection(id), None);
        tunnel.register(id, Token(2)).unwrap();
        assert_eq!(tunnel.clear_connections(), vec![(id, Token(2))]);
        assert!(tunnel.is_empty());
    }

    #[test]
    fn test_parse_marks_decoded() {
        let mut tunnel = tunnel();
        assert!(!tunnel.has_decoded());
        let wire = Frame::heartbeat().encode().unwrap();
        assert!(tunnel.parse(&wire[..10]).is_err());
        assert!(!tunnel.has_decoded());
        assert_eq!(tunnel.parse(&wire).unwrap().kind, FrameKind::Heartbeat);
        assert!(tunnel.has_decoded());
    }

    #[test]
    fn test_initial_handlers_only_when_accepting() {
        let connecting = FrameHandlers::for_role(false);
        let accepting = FrameHandlers::for_role(true);
        for kind in [FrameKind::TcpInitial, FrameKind::UdpInitial, FrameKind::TunInitial] {
            assert!(connecting.get(kind).is_none());
            assert!(accepting.get(kind).is_some());
        }
        for kind in [FrameKind::TcpFin, FrameKind::TcpClosed, FrameKind::UdpClosed] {
            assert!(connecting.get(kind).is_some());
        }
        assert!(accepting.get(FrameKind::Payload).is_none());
        assert!(accepting.get(FrameKind::Unknown(42)).is_none());
    }

    #[test]
    fn test_payload_frames_fit_physical_frames() {
        let mut reactor = Reactor::new().unwrap();
        let (stream, _peer) = crate::test::tcp_pair();
        let token = reactor.allocate_token();
        let mut endpoint = Endpoint::accepted(
            token,
            stream,
            crate::endpoint::EndpointSettings::default(),
        );
        let id = ConnectionId::generate();
        let data = vec![5u8; FRAME_PAYLOAD_MAX_LEN + 10];
        assert!(Tunnel::send_payload(&mut endpoint, &mut reactor, id, &data).unwrap());
        assert_eq!(
            endpoint.queued_bytes(),
            data.len() + 2 * crate::specification::FRAME_HDR_LEN
        );
    }
}
