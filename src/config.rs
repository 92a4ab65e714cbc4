//! Configuration structures for setting up an [`Engine`].
//!
//! To build a config, you should make three decisions in order:
//!
//! 1. Choose the [`Role`] of the process. A connecting process originates
//!    tunnels and shards its connections over a bounded pool of them. An
//!    accepting process terminates tunnels and may relay unrecognized
//!    connections to a fallback address.
//! 2. Choose the [`Timeouts`]. Heartbeats, FIN waits, close grace periods,
//!    UDP idle timeouts and device reconnect delays are all tunable.
//! 3. Choose the send buffer watermarks. Once a tunnel's pending bytes cross
//!    the high watermark, every connection it carries stops reading until
//!    the tunnel drains below the low watermark.
//!
//! # Example
//!
//! Create a basic connecting and accepting configuration:
//! ```
//! use obfstunnel::{Config, Role};
//!
//! let client_config = Config::builder_with_role(Role::connect()).with_defaults();
//!
//! let server_config = Config::builder_with_role(Role::accept()).with_defaults();
//! ```
//!
//! Create an accepting configuration without a fallback relay, with a
//! shorter heartbeat and small watermarks:
//! ```
//! use std::time::Duration;
//! use obfstunnel::{Config, Role, Timeouts};
//!
//! let server_config = Config::builder_with_role(Role::Accept { fallback: None })
//!     .with_timeouts(Timeouts {
//!         heartbeat: Duration::from_secs(20),
//!         ..Timeouts::default()
//!     })
//!     .with_watermarks(16 * 1024, 64 * 1024);
//! ```
//!
//! [`Engine`]: crate::Engine
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

/// Configuration structure for setting up an [`Engine`].
///
/// For details on constructing and configuring `config`, refer to
/// the [`config`] module.
///
/// [`config`]: crate::config
/// [`Engine`]: crate::Engine
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Config {
    pub(crate) role: Role,
    pub(crate) timeouts: Timeouts,
    pub(crate) watermarks: Watermarks,
}

/// A builder for creating a [`Config`] instance.
///
/// To get a [`ConfigBuilder`], use [`Config::builder_with_role`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConfigBuilder<State> {
    state: State,
}

/// Which end of the tunnels this process is.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// Originates tunnels. Connection ids are sharded over at most
    /// `pool_size` physical tunnels per relay.
    Connect {
        /// Number of physical tunnels per relay.
        pool_size: u32,
    },

    /// Terminates tunnels. Each inbound tunnel owns the ids it announces.
    Accept {
        /// Where to relay connections that do not speak the tunnel protocol.
        /// `None` closes them instead.
        fallback: Option<SocketAddr>,
    },
}

impl Role {
    /// A connecting role with the default pool of 32 tunnels per relay.
    pub fn connect() -> Self {
        Role::Connect { pool_size: 32 }
    }

    /// An accepting role relaying unrecognized connections to
    /// `127.0.0.1:8000`.
    pub fn accept() -> Self {
        Role::Accept {
            fallback: Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8000))),
        }
    }

    /// Whether this process originates tunnels.
    pub fn is_connect(&self) -> bool {
        matches!(self, Role::Connect { .. })
    }
}

/// All the timing knobs of the engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Timeouts {
    /// Interval between heartbeat frames on an open tunnel.
    pub heartbeat: Duration,
    /// How long a half-closed stream waits for the peer's FIN.
    pub fin_wait: Duration,
    /// How long a closing endpoint keeps flushing pending data.
    pub close_grace: Duration,
    /// Idle timeout of the datagram flows opened by the accepting side.
    pub udp_idle: Duration,
    /// Delay before a device flow whose tunnel died is re-established.
    pub device_reconnect: Duration,
    /// Upper bound of the background reachability probe.
    pub probe: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(60),
            fin_wait: Duration::from_secs(30),
            close_grace: Duration::from_secs(60),
            udp_idle: Duration::from_secs(10 * 60),
            device_reconnect: Duration::from_millis(500),
            probe: Duration::from_secs(3),
        }
    }
}

/// Pending-byte thresholds of an endpoint's send queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Watermarks {
    pub(crate) low: usize,
    pub(crate) high: usize,
}

impl Watermarks {
    /// ## Panic
    /// Panics if `low` is not less than `high`.
    pub fn new(low: usize, high: usize) -> Self {
        assert!(low < high);
        Self { low, high }
    }

    /// The low watermark in bytes.
    pub fn low(&self) -> usize {
        self.low
    }

    /// The high watermark in bytes.
    pub fn high(&self) -> usize {
        self.high
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            low: 256 * 1024,
            high: 1024 * 1024,
        }
    }
}

impl Config {
    /// Sets up the role.
    pub fn builder_with_role(role: Role) -> ConfigBuilder<WantsTimeouts> {
        ConfigBuilder {
            state: WantsTimeouts { role },
        }
    }

    /// The role of this process.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// The timing knobs.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// The send buffer watermarks.
    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }
}

impl ConfigBuilder<WantsTimeouts> {
    /// Sets up the timeouts.
    pub fn with_timeouts(self, timeouts: Timeouts) -> ConfigBuilder<WantsWatermarks> {
        ConfigBuilder {
            state: WantsWatermarks {
                role: self.state.role,
                timeouts,
            },
        }
    }

    /// Use the default timeouts.
    pub fn with_default_timeouts(self) -> ConfigBuilder<WantsWatermarks> {
        self.with_timeouts(Timeouts::default())
    }

    /// Use the default timeouts and watermarks.
    pub fn with_defaults(self) -> Config {
        Config {
            role: self.state.role,
            timeouts: Timeouts::default(),
            watermarks: Watermarks::default(),
        }
    }
}

impl ConfigBuilder<WantsWatermarks> {
    /// Sets up the send buffer watermarks.
    ///
    /// ## Panic
    /// Panics if `low` is not less than `high`.
    pub fn with_watermarks(self, low: usize, high: usize) -> Config {
        Config {
            role: self.state.role,
            timeouts: self.state.timeouts,
            watermarks: Watermarks::new(low, high),
        }
    }

    /// Use the default watermarks (256 KiB low, 1 MiB high).
    pub fn with_default_watermarks(self) -> Config {
        Config {
            role: self.state.role,
            timeouts: self.state.timeouts,
            watermarks: Watermarks::default(),
        }
    }
}

/// Config builder state where the caller must supply timeouts.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsTimeouts {
    role: Role,
}

/// Config builder state where the caller must supply watermarks.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsWatermarks {
    role: Role,
    timeouts: Timeouts,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::builder_with_role(Role::connect()).with_defaults();
        assert_eq!(config.role, Role::Connect { pool_size: 32 });
        assert_eq!(config.timeouts.heartbeat, Duration::from_secs(60));
        assert_eq!(config.watermarks.high, 1024 * 1024);
        assert_eq!(config.watermarks.low, 256 * 1024);
    }

    #[test]
    #[should_panic]
    fn test_inverted_watermarks() {
        let _ = Config::builder_with_role(Role::accept())
            .with_default_timeouts()
            .with_watermarks(10, 10);
    }
}
