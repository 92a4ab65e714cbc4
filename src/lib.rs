//! Obfstunnel forwards TCP streams, UDP flows and raw IP packets through a
//! small pool of long-lived physical links, disguised as ordinary HTTP
//! image uploads and downloads.
//!
//! ## Overview
//!
//! Everything runs on one thread, driven by a readiness [`Reactor`] with a
//! timer queue. Each descriptor is wrapped in a non-blocking [`Endpoint`]
//! that owns a send queue, a codec [`Pipeline`] and a half-close state
//! machine. A [`Tunnel`] multiplexes many logical connections, each named by
//! a [`ConnectionId`], over one physical stream endpoint. The [`Registry`]
//! tracks which tunnel and which endpoint currently serve every id.
//!
//! The [`Engine`] ties these together and runs the loop:
//!
//! ```no_run
//! use obfstunnel::{Config, Engine, Role};
//!
//! # fn main() -> Result<(), obfstunnel::Error> {
//! // The relay side: accepts tunnels, relays anything else to a local web
//! // server so that probes see an ordinary site.
//! let config = Config::builder_with_role(Role::Accept {
//!     fallback: Some("127.0.0.1:8080".parse().unwrap()),
//! })
//! .with_defaults();
//! let mut engine = Engine::new(config)?;
//! engine.listen_tunnels("0.0.0.0:443".parse().unwrap())?;
//! engine.run()
//! # }
//! ```
//!
//! ## Wire format
//!
//! Tunnel frames are `type (u16) | length (u32) | connection id (16 bytes) |
//! payload`, all big endian. Each frame travels through the mimicry chain:
//! length framing, random padding, a keystream cipher keyed in-band, base64,
//! and finally HTTP messages whose bodies start with a bitmap header. The
//! cipher shapes traffic; it is not a confidentiality boundary.
//!
//! A connection to the accepting side that does not decode as this chain is
//! not closed. Everything it sent, from its first byte, is relayed to the
//! configured fallback address instead.
//!
//! ## Configuration
//!
//! See [`Config`]. Timeouts, watermarks and the tunnel pool size are all
//! tunable; the defaults suit long-lived links through middleboxes.
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod mimicry;
pub mod packet;
pub mod reactor;
pub mod registry;
pub mod timer;
pub mod tunnel;

mod adapter;
mod engine;
mod specification;

pub use codec::{Decode, Decoded, Encode, Pipeline};
pub use config::{Config, Role, Timeouts, Watermarks};
pub use endpoint::{ConnectionState, Endpoint, EndpointEvent, EndpointKind, Inbound};
pub use engine::Engine;
pub use error::Error;
pub use frame::{ConnectionId, DeviceTarget, Frame, FrameKind, Target};
pub use reactor::Reactor;
pub use registry::{LogicalEndpoint, Registry};
pub use tunnel::{Tunnel, TunnelId};
