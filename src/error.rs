//! All errors produced by the tunnel engine.
//!
//! Would-block conditions are never reported through these types: they are
//! absorbed by re-arming the relevant interest. Everything else lands in one
//! of the categories below, and each category has a fixed blast radius.
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible errors.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An OS-level I/O error other than would-block.
    ///
    /// # Suggested error handling strategy
    ///
    /// Fatal for the endpoint that produced it, never for the process.
    Io(io::Error),

    /// The peer sent a tunnel frame that cannot be trusted.
    ///
    /// # Suggested error handling strategy
    ///
    /// Fatal for the tunnel carrying the frame. The tunnel and every logical
    /// connection it carries are torn down.
    Corrupted(Corrupted),

    /// A decode stage rejected its input.
    ///
    /// # Suggested error handling strategy
    ///
    /// Not fatal. The endpoint switches to raw mode and hands the bytes to
    /// its owner, which may relay them to a fallback address so that an
    /// active prober sees an ordinary service instead of a closed socket.
    Codec(CodecError),

    /// An operation was refused because of the state of its target.
    Rejected(Rejected),

    /// The delegation registry refused a binding.
    Registry(RegistryError),

    /// A frame handler could not act on the frame it was given.
    ///
    /// # Suggested error handling strategy
    ///
    /// Fatal for the descriptor whose event triggered the handler.
    Handler(String),
}

/// The tunnel frame could not be parsed.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Corrupted {
    /// Fewer bytes than a frame header.
    FrameTooShort {
        /// Number of bytes received.
        received: usize,
    },

    /// The `content_length` field disagrees with the bytes that followed it.
    LengthMismatch {
        /// The declared `content_length`.
        declared: u32,
        /// The number of payload bytes actually present.
        actual: usize,
    },

    /// A payload too large to fit in one physical frame.
    PayloadTooLarge {
        /// Length of the payload.
        len: usize,
    },
}

/// A decode stage rejected its input.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CodecError {
    /// The input does not follow the stage's format.
    Malformed {
        /// Name of the stage.
        stage: &'static str,
        /// What was wrong.
        reason: &'static str,
    },

    /// A stage claimed to consume more bytes than it was offered.
    OverConsumed {
        /// Name of the stage.
        stage: &'static str,
    },

    /// No unit could be decoded within the sniffing window.
    SniffWindowExceeded {
        /// Number of raw bytes buffered when the window closed.
        buffered: usize,
    },
}

/// The target of an operation is in the wrong state for it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Rejected {
    /// The endpoint is draining or closed; no more sends are accepted.
    EndpointClosed,

    /// The operation needs a connected endpoint.
    NotConnected,

    /// The operation only applies to stream endpoints.
    NotAStream,

    /// No live endpoint is known under the given token.
    UnknownEndpoint,
}

/// The delegation registry refused a binding.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum RegistryError {
    /// The connection is already bound to a different tunnel.
    ConflictingTunnel,

    /// The connection's shard is served by a different tunnel.
    ShardConflict,

    /// The tunnel already carries a connection with this id.
    AlreadyRegistered,

    /// The tunnel is not known to the registry.
    UnknownTunnel,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "Io: {}", err),
            Error::Corrupted(err) => write!(f, "Corrupted: {}", err),
            Error::Codec(err) => write!(f, "Codec: {}", err),
            Error::Rejected(err) => write!(f, "Rejected: {}", err),
            Error::Registry(err) => write!(f, "Registry: {}", err),
            Error::Handler(reason) => write!(f, "Handler: {}", reason),
        }
    }
}

impl Display for Corrupted {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Corrupted::FrameTooShort { received } => {
                write!(f, "FrameTooShort: received {}", received)
            }
            Corrupted::LengthMismatch { declared, actual } => write!(
                f,
                "LengthMismatch: declared {}, actual {}",
                declared, actual
            ),
            Corrupted::PayloadTooLarge { len } => write!(f, "PayloadTooLarge: {}", len),
        }
    }
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            CodecError::Malformed { stage, reason } => {
                write!(f, "Malformed: {} ({})", stage, reason)
            }
            CodecError::OverConsumed { stage } => write!(f, "OverConsumed: {}", stage),
            CodecError::SniffWindowExceeded { buffered } => {
                write!(f, "SniffWindowExceeded: {} bytes buffered", buffered)
            }
        }
    }
}

impl Display for Rejected {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Rejected::EndpointClosed => write!(f, "EndpointClosed"),
            Rejected::NotConnected => write!(f, "NotConnected"),
            Rejected::NotAStream => write!(f, "NotAStream"),
            Rejected::UnknownEndpoint => write!(f, "UnknownEndpoint"),
        }
    }
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            RegistryError::ConflictingTunnel => write!(f, "ConflictingTunnel"),
            RegistryError::ShardConflict => write!(f, "ShardConflict"),
            RegistryError::AlreadyRegistered => write!(f, "AlreadyRegistered"),
            RegistryError::UnknownTunnel => write!(f, "UnknownTunnel"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Corrupted(err) => Some(err),
            Error::Codec(err) => Some(err),
            Error::Rejected(err) => Some(err),
            Error::Registry(err) => Some(err),
            Error::Handler(_) => None,
        }
    }
}

impl error::Error for Corrupted {}

impl error::Error for CodecError {}

impl error::Error for Rejected {}

impl error::Error for RegistryError {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(err) => err,
            other => io::Error::new(ErrorKind::Other, other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Corrupted> for Error {
    fn from(e: Corrupted) -> Self {
        Error::Corrupted(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<Rejected> for Error {
    fn from(e: Rejected) -> Self {
        Error::Rejected(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Handler(format!("bad initial content: {}", e))
    }
}
