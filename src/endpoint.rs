//! The non-blocking endpoint: one descriptor with a send queue, a codec
//! pipeline, and a half-close and timeout state machine.
//!
//! An endpoint never calls back into its owner. Everything except inbound
//! data is reported as an [`EndpointEvent`] queued on the [`Reactor`] and
//! delivered after the current handler returns. Inbound data is pulled by
//! the owner through [`Endpoint::receive_once`], so the owner can pause
//! reading the moment it cannot take more.
//!
//! # Close sequence
//!
//! ```text
//! INIT -> CONNECTING -> CONNECTED -> DRAINING -> CLOSED
//!                           |                      ^
//!                           +----------------------+
//! ```
//!
//! `shutdown` queues a FIN behind pending data; `close` keeps flushing
//! pending data for a grace period before the descriptor is released.
//! FIN sent and FIN received are tracked beside the state; once both have
//! happened the endpoint closes.
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    time::{Duration, Instant},
};

use mio::{
    Token,
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    codec::{Output, Pipeline},
    config::{Config, Watermarks},
    error::{Error, Rejected},
    reactor::{Direction, Interest, Reactor},
    specification::READ_CHUNK,
    timer::TimerId,
};

/// The descriptor behind an endpoint.
#[derive(Debug)]
pub enum Io {
    /// A TCP stream.
    Stream(TcpStream),
    /// A UDP socket.
    Datagram(UdpSocket),
    /// A virtual network device opened non-blocking.
    Device(File),
}

impl Io {
    fn kind(&self) -> EndpointKind {
        match self {
            Io::Stream(_) => EndpointKind::Stream,
            Io::Datagram(_) => EndpointKind::Datagram,
            Io::Device(_) => EndpointKind::Device,
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Io::Stream(s) => s.as_raw_fd(),
            Io::Datagram(s) => s.as_raw_fd(),
            Io::Device(f) => f.as_raw_fd(),
        }
    }
}

/// What kind of descriptor an endpoint wraps.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EndpointKind {
    /// A TCP stream.
    Stream,
    /// A UDP socket.
    Datagram,
    /// A virtual network device.
    Device,
}

/// Where an endpoint is in its lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// Created, no descriptor yet.
    Init,
    /// An outbound connect is in progress.
    Connecting,
    /// Ready for I/O.
    Connected,
    /// Closing; pending data is still being flushed.
    Draining,
    /// The descriptor has been released.
    Closed,
}

/// Something that happened to an endpoint, delivered through the reactor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndpointEvent {
    /// An outbound connect completed.
    Connected,
    /// Bytes left the send queue.
    Sent {
        /// Bytes written by this flush.
        sent: usize,
        /// Bytes still queued.
        pending: usize,
    },
    /// The peer finished sending.
    FinReceived,
    /// The descriptor was released. Reported exactly once.
    Closed,
    /// Pending bytes crossed the high watermark.
    BufferHigh,
    /// Pending bytes fell back to the low watermark.
    BufferLow,
    /// A named timer fired.
    Timer(&'static str),
    /// A background probe finished.
    Probe {
        /// Name given when the probe was spawned.
        name: &'static str,
        /// Its result.
        reachable: bool,
    },
}

/// The result of one read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Inbound {
    /// Decoded units, possibly none yet.
    Units {
        /// Fully decoded units.
        units: Vec<Vec<u8>>,
        /// The sender, for datagrams.
        from: Option<SocketAddr>,
    },
    /// Undecodable bytes; the pipeline has turned raw.
    Raw {
        /// Units decoded from the same read before the failure.
        decoded: Vec<Vec<u8>>,
        /// The bytes.
        bytes: Vec<u8>,
        /// Set on the read that turned the pipeline raw.
        first: bool,
    },
    /// Nothing more to read until the next readiness.
    Drained,
    /// The endpoint is not receiving anymore.
    Stopped,
}

/// The knobs an endpoint takes from the [`Config`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EndpointSettings {
    /// Pending-byte thresholds for `BufferHigh` and `BufferLow`.
    pub watermarks: Watermarks,
    /// How long a closing endpoint keeps flushing.
    pub close_grace: Duration,
    /// How long a half-closed stream waits for the peer's FIN.
    pub fin_wait: Duration,
}

impl From<&Config> for EndpointSettings {
    fn from(config: &Config) -> Self {
        Self {
            watermarks: config.watermarks,
            close_grace: config.timeouts.close_grace,
            fin_wait: config.timeouts.fin_wait,
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        let timeouts = crate::config::Timeouts::default();
        Self {
            watermarks: Watermarks::default(),
            close_grace: timeouts.close_grace,
            fin_wait: timeouts.fin_wait,
        }
    }
}

#[derive(Debug)]
enum Chunk {
    Data {
        bytes: Vec<u8>,
        dest: Option<SocketAddr>,
    },
    Fin,
}

/// A non-blocking descriptor and its state machine.
#[derive(Debug)]
pub struct Endpoint {
    token: Token,
    kind: EndpointKind,
    io: Option<Io>,
    fd: Option<RawFd>,
    state: ConnectionState,
    established: bool,
    error: bool,
    fin_queued: bool,
    fin_sent: bool,
    fin_received: bool,
    start_on_connect: bool,
    default_dest: Option<SocketAddr>,
    queue: VecDeque<Chunk>,
    queued_bytes: usize,
    above_high: bool,
    pipeline: Pipeline,
    settings: EndpointSettings,
    idle: Option<Duration>,
    idle_timer: Option<TimerId>,
    last_activity: Instant,
    close_timer: Option<TimerId>,
    fin_wait_timer: Option<TimerId>,
    timers: HashMap<&'static str, TimerId>,
}

impl Endpoint {
    fn with_io(token: Token, io: Option<Io>, settings: EndpointSettings) -> Self {
        let kind = io.as_ref().map(Io::kind).unwrap_or(EndpointKind::Stream);
        let established = io.is_some();
        Self {
            token,
            kind,
            fd: io.as_ref().map(Io::raw_fd),
            io,
            state: if established {
                ConnectionState::Connected
            } else {
                ConnectionState::Init
            },
            established,
            error: false,
            fin_queued: false,
            fin_sent: false,
            fin_received: false,
            start_on_connect: false,
            default_dest: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            above_high: false,
            pipeline: Pipeline::new(),
            settings,
            idle: None,
            idle_timer: None,
            last_activity: Instant::now(),
            close_timer: None,
            fin_wait_timer: None,
            timers: HashMap::new(),
        }
    }

    /// A stream endpoint that still has to [`connect`](Self::connect).
    pub fn new(token: Token, settings: EndpointSettings) -> Self {
        Self::with_io(token, None, settings)
    }

    /// A stream endpoint over an accepted connection.
    pub fn accepted(token: Token, stream: TcpStream, settings: EndpointSettings) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(token = token.0, %err, "set_nodelay failed");
        }
        Self::with_io(token, Some(Io::Stream(stream)), settings)
    }

    /// A datagram endpoint. Sends without a destination go to
    /// `default_dest`.
    pub fn datagram(
        token: Token,
        socket: UdpSocket,
        default_dest: Option<SocketAddr>,
        settings: EndpointSettings,
    ) -> Self {
        let mut endpoint = Self::with_io(token, Some(Io::Datagram(socket)), settings);
        endpoint.default_dest = default_dest;
        endpoint
    }

    /// A device endpoint. `file` must be in non-blocking mode.
    pub fn device(token: Token, file: File, settings: EndpointSettings) -> Self {
        Self::with_io(token, Some(Io::Device(file)), settings)
    }

    /// The token of this endpoint.
    pub fn token(&self) -> Token {
        self.token
    }

    /// What this endpoint wraps.
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Where this endpoint is in its lifetime.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the descriptor has been released.
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether this side's FIN went out.
    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    /// Whether the peer's FIN came in.
    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// Bytes waiting in the send queue.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Whether the send queue crossed its high watermark and has not yet
    /// fallen back to the low one.
    pub fn is_buffer_high(&self) -> bool {
        self.above_high
    }

    /// Whether the send queue is below its high watermark and open.
    pub fn is_ready_to_send(&self) -> bool {
        !self.above_high
            && matches!(
                self.state,
                ConnectionState::Init | ConnectionState::Connecting | ConnectionState::Connected
            )
    }

    /// Whether read interest is registered.
    pub fn is_receiving(&self, reactor: &Reactor) -> bool {
        reactor.is_registered(self.token, Direction::Read)
    }

    /// The codec pipeline.
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// Replaces the codec pipeline.
    pub fn set_pipeline(&mut self, pipeline: Pipeline) {
        self.pipeline = pipeline;
    }

    /// Starts receiving as soon as an outbound connect completes.
    pub fn set_start_on_connect(&mut self, start: bool) {
        self.start_on_connect = start;
    }

    /// The peer of a stream.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.io.as_ref()? {
            Io::Stream(s) => s.peer_addr().ok(),
            Io::Datagram(_) => self.default_dest,
            Io::Device(_) => None,
        }
    }

    /// The local address of a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.io.as_ref()? {
            Io::Stream(s) => s.local_addr().ok(),
            Io::Datagram(s) => s.local_addr().ok(),
            Io::Device(_) => None,
        }
    }

    fn want(&mut self, reactor: &mut Reactor, direction: Direction, on: bool) -> io::Result<()> {
        let Some(fd) = self.fd else {
            return Ok(());
        };
        let interest = Interest {
            token: self.token,
            fd,
            direction,
        };
        if on {
            reactor.register(interest)
        } else {
            reactor.deregister(interest)
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Starts an outbound connect.
    ///
    /// A connect that fails closes the endpoint; the owner learns about it
    /// from [`EndpointEvent::Closed`].
    pub fn connect(&mut self, reactor: &mut Reactor, addr: SocketAddr) -> Result<(), Error> {
        if self.state != ConnectionState::Init {
            return Err(Rejected::EndpointClosed.into());
        }
        debug!(token = self.token.0, %addr, "connecting");
        match TcpStream::connect(addr) {
            Ok(stream) => {
                self.fd = Some(stream.as_raw_fd());
                self.io = Some(Io::Stream(stream));
                self.state = ConnectionState::Connecting;
                if let Err(err) = self.want(reactor, Direction::Write, true) {
                    self.fail(reactor, err);
                }
            }
            Err(err) => self.fail(reactor, err),
        }
        Ok(())
    }

    fn finish_connect(&mut self, reactor: &mut Reactor) {
        let Some(Io::Stream(stream)) = self.io.as_ref() else {
            return;
        };
        let result = match stream.take_error() {
            Ok(Some(err)) | Err(err) => Err(err),
            Ok(None) => stream.peer_addr().map(|_| ()),
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotConnected => return,
            Err(err) => {
                self.fail(reactor, err);
                return;
            }
        }
        if let Err(err) = stream.set_nodelay(true) {
            debug!(token = self.token.0, %err, "set_nodelay failed");
        }

        self.established = true;
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
        }
        debug!(token = self.token.0, peer = ?self.peer_addr(), "connected");
        reactor.notify(self.token, EndpointEvent::Connected);
        if self.start_on_connect {
            self.start_receiving(reactor);
        }
        self.flush(reactor);
    }

    /// Queues `data` for sending, after running it through the encoders.
    ///
    /// Returns the number of bytes queued. Refused once the endpoint is
    /// shutting down or closing.
    pub fn send(
        &mut self,
        reactor: &mut Reactor,
        data: Vec<u8>,
        dest: Option<SocketAddr>,
    ) -> Result<usize, Error> {
        if matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Closed
        ) || self.fin_queued
            || self.fin_sent
        {
            return Err(Rejected::EndpointClosed.into());
        }
        if data.is_empty() {
            return Ok(self.queued_bytes);
        }

        trace!(token = self.token.0, len = data.len(), "send");
        let bytes = self.pipeline.encode(data);
        self.queued_bytes += bytes.len();
        self.queue.push_back(Chunk::Data { bytes, dest });
        self.touch();
        if self.established {
            if let Err(err) = self.want(reactor, Direction::Write, true) {
                self.fail(reactor, err);
                return Err(Rejected::EndpointClosed.into());
            }
        }
        if !self.above_high && self.queued_bytes >= self.settings.watermarks.high {
            self.above_high = true;
            debug!(token = self.token.0, pending = self.queued_bytes, "buffer high");
            reactor.notify(self.token, EndpointEvent::BufferHigh);
        }
        Ok(self.queued_bytes)
    }

    /// Handles write readiness: completes a pending connect or flushes the
    /// send queue.
    pub fn on_writable(&mut self, reactor: &mut Reactor) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if !self.established {
            self.finish_connect(reactor);
        } else {
            self.flush(reactor);
        }
    }

    fn write(&mut self, bytes: &[u8], dest: Option<SocketAddr>) -> io::Result<usize> {
        match self.io.as_mut() {
            Some(Io::Stream(s)) => s.write(bytes),
            Some(Io::Datagram(s)) => match dest.or(self.default_dest) {
                Some(dest) => s.send_to(bytes, dest),
                None => s.send(bytes),
            },
            Some(Io::Device(f)) => f.write(bytes),
            None => Err(io::Error::from(ErrorKind::NotConnected)),
        }
    }

    fn flush(&mut self, reactor: &mut Reactor) {
        let mut sent = 0;
        let mut short = false;
        let mut fin_reached = false;
        while let Some(chunk) = self.queue.pop_front() {
            let (bytes, dest) = match chunk {
                Chunk::Data { bytes, dest } => (bytes, dest),
                Chunk::Fin => {
                    fin_reached = true;
                    break;
                }
            };
            match self.write(&bytes, dest) {
                Ok(n) if n < bytes.len() => {
                    sent += n;
                    self.queue.push_front(Chunk::Data {
                        bytes: bytes[n..].to_vec(),
                        dest,
                    });
                    short = true;
                    break;
                }
                Ok(n) => sent += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.queue.push_front(Chunk::Data { bytes, dest });
                    break;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    self.queue.push_front(Chunk::Data { bytes, dest });
                }
                Err(err) => {
                    self.fail(reactor, err);
                    return;
                }
            }
        }

        if sent > 0 {
            self.queued_bytes -= sent;
            self.touch();
            trace!(token = self.token.0, sent, pending = self.queued_bytes, "flushed");
            reactor.notify(
                self.token,
                EndpointEvent::Sent {
                    sent,
                    pending: self.queued_bytes,
                },
            );
            if self.above_high && self.queued_bytes <= self.settings.watermarks.low {
                self.above_high = false;
                debug!(token = self.token.0, pending = self.queued_bytes, "buffer low");
                reactor.notify(self.token, EndpointEvent::BufferLow);
            }
        }

        if fin_reached {
            self.send_fin(reactor);
            if self.state == ConnectionState::Closed {
                return;
            }
        }

        if self.queue.is_empty() {
            if let Err(err) = self.want(reactor, Direction::Write, false) {
                self.fail(reactor, err);
                return;
            }
            if self.state == ConnectionState::Draining {
                self.finalize(reactor);
            }
        } else if short {
            if let Err(err) = reactor.rearm(self.token) {
                self.fail(reactor, err);
            }
        }
    }

    /// Starts reading. Refused after the peer's FIN or once closing; before
    /// a connect completes, reading starts when it does.
    pub fn start_receiving(&mut self, reactor: &mut Reactor) {
        match self.state {
            ConnectionState::Draining | ConnectionState::Closed => return,
            ConnectionState::Init | ConnectionState::Connecting => {
                self.start_on_connect = true;
                return;
            }
            ConnectionState::Connected => {}
        }
        if self.fin_received {
            return;
        }
        if let Err(err) = self.want(reactor, Direction::Read, true) {
            self.fail(reactor, err);
        }
    }

    /// Stops reading until [`start_receiving`](Self::start_receiving).
    pub fn stop_receiving(&mut self, reactor: &mut Reactor) {
        if let Err(err) = self.want(reactor, Direction::Read, false) {
            self.fail(reactor, err);
        }
    }

    /// Reads one chunk and runs it through the decode stages.
    pub fn receive_once(&mut self, reactor: &mut Reactor) -> Inbound {
        if !self.is_receiving(reactor) {
            return Inbound::Stopped;
        }
        let mut buf = vec![0u8; READ_CHUNK];
        let result = match self.io.as_mut() {
            Some(Io::Stream(s)) => s.read(&mut buf).map(|n| (n, None)),
            Some(Io::Datagram(s)) => s.recv_from(&mut buf).map(|(n, from)| (n, Some(from))),
            Some(Io::Device(f)) => f.read(&mut buf).map(|n| (n, None)),
            None => return Inbound::Stopped,
        };
        match result {
            Ok((0, _)) if self.kind != EndpointKind::Datagram => {
                self.on_eof(reactor);
                Inbound::Stopped
            }
            Ok((n, from)) => {
                trace!(token = self.token.0, n, "received");
                buf.truncate(n);
                self.touch();
                match self.pipeline.decode(&buf) {
                    Output::Units(units) => Inbound::Units { units, from },
                    Output::Raw {
                        decoded,
                        bytes,
                        first,
                    } => Inbound::Raw {
                        decoded,
                        bytes,
                        first,
                    },
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Inbound::Drained,
            Err(err) if err.kind() == ErrorKind::Interrupted => Inbound::Units {
                units: Vec::new(),
                from: None,
            },
            Err(err) => {
                self.fail(reactor, err);
                Inbound::Stopped
            }
        }
    }

    fn on_eof(&mut self, reactor: &mut Reactor) {
        debug!(token = self.token.0, "fin received");
        self.fin_received = true;
        self.stop_receiving(reactor);
        if self.fin_sent {
            self.close(reactor);
        } else if self.state != ConnectionState::Closed {
            reactor.notify(self.token, EndpointEvent::FinReceived);
        }
    }

    /// Half-closes a stream once everything queued so far has been sent.
    ///
    /// The FIN is queued at most once. If the peer's FIN was already seen,
    /// the endpoint closes after sending its own.
    pub fn shutdown(&mut self, reactor: &mut Reactor) -> Result<(), Error> {
        if self.kind != EndpointKind::Stream {
            return Err(Rejected::NotAStream.into());
        }
        if matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Closed
        ) || self.fin_queued
            || self.fin_sent
        {
            return Ok(());
        }
        self.fin_queued = true;
        if self.queue.is_empty() && self.established {
            self.send_fin(reactor);
        } else {
            self.queue.push_back(Chunk::Fin);
        }
        Ok(())
    }

    fn send_fin(&mut self, reactor: &mut Reactor) {
        self.fin_sent = true;
        if let Some(Io::Stream(stream)) = self.io.as_ref() {
            if let Err(err) = stream.shutdown(Shutdown::Write) {
                if err.kind() != ErrorKind::NotConnected {
                    self.fail(reactor, err);
                    return;
                }
            }
        }
        debug!(token = self.token.0, "fin sent");
        if self.fin_received {
            self.close(reactor);
        } else if self.fin_wait_timer.is_none() {
            self.fin_wait_timer = Some(reactor.add_timer(self.settings.fin_wait, self.token));
        }
    }

    /// Closes the endpoint.
    ///
    /// Reading stops at once. Pending data keeps flushing for up to the
    /// close grace period; the descriptor is released when the queue drains
    /// or the grace period ends, whichever comes first.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Closed
        ) {
            return;
        }
        if let Some(fd) = self.fd {
            if let Err(err) = reactor.deregister(Interest::read(self.token, fd)) {
                debug!(token = self.token.0, %err, "deregister failed");
            }
        }
        self.set_timeout(reactor, None);

        if !self.error && !self.queue.is_empty() && self.state != ConnectionState::Init {
            debug!(
                token = self.token.0,
                pending = self.queued_bytes,
                "draining before close"
            );
            self.state = ConnectionState::Draining;
            self.close_timer = Some(reactor.add_timer(self.settings.close_grace, self.token));
        } else {
            self.finalize(reactor);
        }
    }

    /// Closes the endpoint at once, dropping pending data.
    pub fn abort(&mut self, reactor: &mut Reactor) {
        self.error = true;
        self.finalize(reactor);
    }

    fn fail(&mut self, reactor: &mut Reactor, err: io::Error) {
        error!(token = self.token.0, %err, "i/o error");
        self.abort(reactor);
    }

    fn finalize(&mut self, reactor: &mut Reactor) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        reactor.forget(self.token);
        for id in [
            self.idle_timer.take(),
            self.close_timer.take(),
            self.fin_wait_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            reactor.cancel_timer(id);
        }
        for (_, id) in self.timers.drain() {
            reactor.cancel_timer(id);
        }
        if !self.queue.is_empty() {
            warn!(
                token = self.token.0,
                pending = self.queued_bytes,
                "dropping unsent data"
            );
        }
        self.queue.clear();
        self.queued_bytes = 0;
        self.io = None;
        self.fd = None;
        debug!(token = self.token.0, "closed");
        reactor.notify(self.token, EndpointEvent::Closed);
    }

    /// Closes the endpoint after `timeout` without send or receive
    /// activity. `None` disables the idle timeout.
    pub fn set_timeout(&mut self, reactor: &mut Reactor, timeout: Option<Duration>) {
        if let Some(id) = self.idle_timer.take() {
            reactor.cancel_timer(id);
        }
        if matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Closed
        ) {
            return;
        }
        self.idle = timeout.filter(|timeout| !timeout.is_zero());
        if let Some(idle) = self.idle {
            self.touch();
            self.idle_timer = Some(reactor.add_timer(idle, self.token));
        }
    }

    /// Arms the named one-shot timer, replacing an armed timer of the same
    /// name. It fires as [`EndpointEvent::Timer`], unless the endpoint has
    /// started closing by then.
    pub fn add_timer(&mut self, reactor: &mut Reactor, name: &'static str, delay: Duration) {
        if matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Closed
        ) {
            return;
        }
        let id = reactor.add_timer(delay, self.token);
        if let Some(old) = self.timers.insert(name, id) {
            reactor.cancel_timer(old);
        }
    }

    /// Cancels the named timer.
    pub fn del_timer(&mut self, reactor: &mut Reactor, name: &'static str) {
        if let Some(id) = self.timers.remove(name) {
            reactor.cancel_timer(id);
        }
    }

    /// Whether the named timer is armed.
    pub fn has_timer(&self, name: &'static str) -> bool {
        self.timers.contains_key(name)
    }

    /// Handles one of this endpoint's timers.
    pub fn on_timer(&mut self, reactor: &mut Reactor, id: TimerId) {
        if self.idle_timer == Some(id) {
            self.idle_timer = None;
            let Some(idle) = self.idle else {
                return;
            };
            let quiet = self.last_activity.elapsed();
            if quiet >= idle {
                info!(token = self.token.0, ?idle, "idle timeout");
                self.close(reactor);
            } else {
                self.idle_timer = Some(reactor.add_timer(idle - quiet, self.token));
            }
        } else if self.close_timer == Some(id) {
            self.close_timer = None;
            warn!(
                token = self.token.0,
                pending = self.queued_bytes,
                "close grace period over"
            );
            self.abort(reactor);
        } else if self.fin_wait_timer == Some(id) {
            self.fin_wait_timer = None;
            // The wait restarts with every read; only a silent peer is cut off.
            let wait = self.settings.fin_wait;
            let quiet = self.last_activity.elapsed();
            if quiet >= wait {
                debug!(token = self.token.0, "peer did not finish in time");
                self.close(reactor);
            } else {
                self.fin_wait_timer = Some(reactor.add_timer(wait - quiet, self.token));
            }
        } else if let Some(name) = self
            .timers
            .iter()
            .find(|(_, timer)| **timer == id)
            .map(|(name, _)| *name)
        {
            self.timers.remove(name);
            if self.state == ConnectionState::Draining {
                trace!(token = self.token.0, name, "timer ignored while draining");
                return;
            }
            reactor.notify(self.token, EndpointEvent::Timer(name));
        }
    }
}
