//! Tunnel frames and the ids of the connections they carry.
use core::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Corrupted,
    specification::{
        FRAME_HDR_LEN, FRAME_PAYLOAD_MAX_LEN, KIND_HEARTBEAT, KIND_PAYLOAD, KIND_TCP_CLOSED,
        KIND_TCP_FIN, KIND_TCP_INITIAL, KIND_TUN_INITIAL, KIND_UDP_CLOSED, KIND_UDP_INITIAL,
    },
};

/// Identifies one logical flow across the whole system for its lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// The id carried by frames that belong to no connection.
    pub const NIL: ConnectionId = ConnectionId(Uuid::nil());

    /// A fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id with these raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The id as an integer, for sharding.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// What a frame means.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FrameKind {
    /// Opens a TCP flow; the payload is a JSON [`Target`].
    TcpInitial,
    /// The sender's side of a TCP flow reached EOF.
    TcpFin,
    /// The sender closed a TCP flow.
    TcpClosed,
    /// Opens a UDP flow; the payload is a JSON [`Target`].
    UdpInitial,
    /// The sender closed a UDP flow.
    UdpClosed,
    /// Opens a device flow; the payload is a JSON [`DeviceTarget`].
    TunInitial,
    /// Bytes of a flow.
    Payload,
    /// Keeps an idle tunnel alive.
    Heartbeat,
    /// A type this implementation does not know.
    Unknown(u16),
}

impl From<u16> for FrameKind {
    fn from(value: u16) -> Self {
        match value {
            KIND_TCP_INITIAL => FrameKind::TcpInitial,
            KIND_TCP_FIN => FrameKind::TcpFin,
            KIND_TCP_CLOSED => FrameKind::TcpClosed,
            KIND_UDP_INITIAL => FrameKind::UdpInitial,
            KIND_UDP_CLOSED => FrameKind::UdpClosed,
            KIND_TUN_INITIAL => FrameKind::TunInitial,
            KIND_PAYLOAD => FrameKind::Payload,
            KIND_HEARTBEAT => FrameKind::Heartbeat,
            other => FrameKind::Unknown(other),
        }
    }
}

impl From<FrameKind> for u16 {
    fn from(kind: FrameKind) -> Self {
        match kind {
            FrameKind::TcpInitial => KIND_TCP_INITIAL,
            FrameKind::TcpFin => KIND_TCP_FIN,
            FrameKind::TcpClosed => KIND_TCP_CLOSED,
            FrameKind::UdpInitial => KIND_UDP_INITIAL,
            FrameKind::UdpClosed => KIND_UDP_CLOSED,
            FrameKind::TunInitial => KIND_TUN_INITIAL,
            FrameKind::Payload => KIND_PAYLOAD,
            FrameKind::Heartbeat => KIND_HEARTBEAT,
            FrameKind::Unknown(other) => other,
        }
    }
}

/// One tunnel message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// What the frame means.
    pub kind: FrameKind,
    /// The flow it belongs to.
    pub id: ConnectionId,
    /// Its content.
    pub payload: Vec<u8>,
}

impl Frame {
    /// A frame of `kind` for `id`.
    pub fn new(kind: FrameKind, id: ConnectionId, payload: Vec<u8>) -> Self {
        Self { kind, id, payload }
    }

    /// An empty heartbeat frame.
    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, ConnectionId::NIL, Vec::new())
    }

    /// `PAYLOAD` frames carrying `data`, split so that each fits in one
    /// physical frame.
    pub fn payloads(id: ConnectionId, data: &[u8]) -> impl Iterator<Item = Frame> + '_ {
        data.chunks(FRAME_PAYLOAD_MAX_LEN)
            .map(move |chunk| Frame::new(FrameKind::Payload, id, chunk.to_vec()))
    }

    /// Serializes the frame.
    pub fn encode(&self) -> Result<Vec<u8>, Corrupted> {
        if self.payload.len() > FRAME_PAYLOAD_MAX_LEN {
            return Err(Corrupted::PayloadTooLarge {
                len: self.payload.len(),
            });
        }
        let mut out = Vec::with_capacity(FRAME_HDR_LEN + self.payload.len());
        out.extend_from_slice(&u16::from(self.kind).to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parses one frame. The unit must hold exactly one frame.
    pub fn parse(unit: &[u8]) -> Result<Frame, Corrupted> {
        if unit.len() < FRAME_HDR_LEN {
            return Err(Corrupted::FrameTooShort {
                received: unit.len(),
            });
        }
        let kind = FrameKind::from(u16::from_be_bytes([unit[0], unit[1]]));
        let declared = u32::from_be_bytes([unit[2], unit[3], unit[4], unit[5]]);
        let actual = unit.len() - FRAME_HDR_LEN;
        if declared as usize != actual {
            return Err(Corrupted::LengthMismatch { declared, actual });
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&unit[6..FRAME_HDR_LEN]);
        Ok(Frame {
            kind,
            id: ConnectionId::from_bytes(id),
            payload: unit[FRAME_HDR_LEN..].to_vec(),
        })
    }
}

/// Where a TCP or UDP flow should go, carried by `TCP_INITIAL` and
/// `UDP_INITIAL`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Address of the destination.
    pub addr: IpAddr,
    /// Port of the destination.
    pub port: u16,
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Target> for SocketAddr {
    fn from(target: Target) -> Self {
        SocketAddr::new(target.addr, target.port)
    }
}

/// The network a device flow joins, carried by `TUN_INITIAL`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// Address of the accepting side's device.
    pub addr: Ipv4Addr,
    /// Prefix length of the network.
    pub prefix: u8,
}
