//! The readiness reactor: one registration per descriptor and direction, a
//! timer queue, and a queue of deferred endpoint notifications.
//!
//! The reactor only indexes interests. Whoever registers an interest owns it
//! and decides what readiness means; the reactor reports which tokens became
//! ready in which direction and leaves the dispatch to its caller.
use std::{
    collections::{HashMap, VecDeque},
    io::{self, ErrorKind},
    os::fd::RawFd,
    sync::{
        Arc,
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use mio::{Events, Interest as MioInterest, Poll, Token, Waker, unix::SourceFd};
use tracing::{debug, trace, warn};

use crate::{
    endpoint::EndpointEvent,
    timer::{TimerId, TimerQueue},
};

const WAKER: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// The direction of an interest.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Readable, or the peer closed its side.
    Read,
    /// Writable, or a pending connect completed.
    Write,
}

/// A wish to be told when `fd` is ready in `direction`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Interest {
    /// The owner of the interest.
    pub token: Token,
    /// The descriptor watched.
    pub fd: RawFd,
    /// The direction watched.
    pub direction: Direction,
}

impl Interest {
    /// Read interest on `fd`.
    pub fn read(token: Token, fd: RawFd) -> Self {
        Self {
            token,
            fd,
            direction: Direction::Read,
        }
    }

    /// Write interest on `fd`.
    pub fn write(token: Token, fd: RawFd) -> Self {
        Self {
            token,
            fd,
            direction: Direction::Write,
        }
    }
}

/// A token whose registered directions became ready.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Ready {
    /// The owner of the interests.
    pub token: Token,
    /// Read interest is registered and the descriptor is readable.
    pub readable: bool,
    /// Write interest is registered and the descriptor is writable.
    pub writable: bool,
}

#[derive(Copy, Clone, Debug)]
struct Registration {
    fd: RawFd,
    read: bool,
    write: bool,
}

impl Registration {
    fn mask(&self) -> Option<MioInterest> {
        match (self.read, self.write) {
            (true, true) => Some(MioInterest::READABLE | MioInterest::WRITABLE),
            (true, false) => Some(MioInterest::READABLE),
            (false, true) => Some(MioInterest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// The single-threaded event reactor.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    events: Events,
    interests: HashMap<Token, Registration>,
    timers: TimerQueue<Token>,
    notifications: VecDeque<(Token, EndpointEvent)>,
    waker: Arc<Waker>,
    probe_tx: Sender<(Token, EndpointEvent)>,
    probe_rx: Receiver<(Token, EndpointEvent)>,
    next_token: usize,
}

impl Reactor {
    /// Creates the reactor. Token 0 is reserved for its waker.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (probe_tx, probe_rx) = mpsc::channel();
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            interests: HashMap::new(),
            timers: TimerQueue::default(),
            notifications: VecDeque::new(),
            waker,
            probe_tx,
            probe_rx,
            next_token: 1,
        })
    }

    /// Hands out a token that has never been used by this reactor.
    pub fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Adds an interest. Registering an active interest again is a no-op.
    ///
    /// The descriptor's OS-level mask becomes the union of its active
    /// directions.
    pub fn register(&mut self, interest: Interest) -> io::Result<()> {
        let Interest { token, fd, direction } = interest;
        match self.interests.get_mut(&token) {
            Some(reg) => {
                let flag = match direction {
                    Direction::Read => &mut reg.read,
                    Direction::Write => &mut reg.write,
                };
                if *flag {
                    return Ok(());
                }
                *flag = true;
                let reg = *reg;
                if let Some(mask) = reg.mask() {
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&reg.fd), token, mask)?;
                }
            }
            None => {
                let reg = Registration {
                    fd,
                    read: direction == Direction::Read,
                    write: direction == Direction::Write,
                };
                if let Some(mask) = reg.mask() {
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, mask)?;
                }
                self.interests.insert(token, reg);
            }
        }
        trace!(token = token.0, fd, ?direction, "interest registered");
        Ok(())
    }

    /// Removes an interest. Removing an inactive interest is a no-op, and
    /// removing one direction keeps the other one registered.
    pub fn deregister(&mut self, interest: Interest) -> io::Result<()> {
        let Interest { token, direction, .. } = interest;
        let Some(reg) = self.interests.get_mut(&token) else {
            return Ok(());
        };
        let flag = match direction {
            Direction::Read => &mut reg.read,
            Direction::Write => &mut reg.write,
        };
        if !*flag {
            return Ok(());
        }
        *flag = false;
        let reg = *reg;
        match reg.mask() {
            Some(mask) => {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&reg.fd), token, mask)?;
            }
            None => {
                self.interests.remove(&token);
                self.poll.registry().deregister(&mut SourceFd(&reg.fd))?;
            }
        }
        trace!(token = token.0, ?direction, "interest deregistered");
        Ok(())
    }

    /// Whether the interest is active.
    pub fn is_registered(&self, token: Token, direction: Direction) -> bool {
        self.interests
            .get(&token)
            .map(|reg| match direction {
                Direction::Read => reg.read,
                Direction::Write => reg.write,
            })
            .unwrap_or(false)
    }

    /// Asks the OS to report the current readiness of `token` again.
    ///
    /// Readiness is edge-triggered; a write that stopped short of
    /// would-block leaves no edge to wait for, so the owner re-arms.
    pub fn rearm(&mut self, token: Token) -> io::Result<()> {
        if let Some(reg) = self.interests.get(&token) {
            if let Some(mask) = reg.mask() {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&reg.fd), token, mask)?;
            }
        }
        Ok(())
    }

    /// Drops both directions of `token`.
    pub fn forget(&mut self, token: Token) {
        if let Some(reg) = self.interests.remove(&token) {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&reg.fd)) {
                debug!(token = token.0, %err, "deregister failed");
            }
        }
    }

    /// Arms a one-shot timer owned by `token`.
    pub fn add_timer(&mut self, delay: Duration, token: Token) -> TimerId {
        self.timers.add(Instant::now(), delay, token)
    }

    /// Cancels a timer. It will never be handed out by
    /// [`take_timer`](Self::take_timer).
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Whether the timer is still armed.
    pub fn is_timer_live(&self, id: TimerId) -> bool {
        self.timers.is_live(id)
    }

    /// The timers due now, in non-decreasing deadline order.
    pub fn expire_timers(&mut self) -> Vec<TimerId> {
        self.timers.expire(Instant::now())
    }

    /// Disarms an expired timer and returns its owner, unless it was
    /// canceled after expiring.
    pub fn take_timer(&mut self, id: TimerId) -> Option<Token> {
        self.timers.take(id)
    }

    /// Queues a notification for `token`, delivered after the current
    /// handler returns.
    pub fn notify(&mut self, token: Token, event: EndpointEvent) {
        self.notifications.push_back((token, event));
    }

    /// Pops the oldest queued notification.
    pub fn next_notification(&mut self) -> Option<(Token, EndpointEvent)> {
        self.notifications.pop_front()
    }

    /// Runs a blocking `probe` on a helper thread.
    ///
    /// The result comes back as an [`EndpointEvent::Probe`] for `token`
    /// through the notification queue. The helper thread never touches loop
    /// state.
    pub fn spawn_probe<F>(&self, token: Token, name: &'static str, probe: F) -> io::Result<()>
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let sender = self.probe_tx.clone();
        let waker = Arc::clone(&self.waker);
        thread::Builder::new()
            .name(format!("probe-{}", name))
            .spawn(move || {
                let reachable = probe();
                if sender
                    .send((token, EndpointEvent::Probe { name, reachable }))
                    .is_ok()
                {
                    if let Err(err) = waker.wake() {
                        warn!(%err, "failed to wake the reactor");
                    }
                }
            })?;
        Ok(())
    }

    /// Waits for readiness.
    ///
    /// Blocks for at most the smaller of `timeout` and the time left until
    /// the next live timer. Only directions with an active interest are
    /// reported; errors and hang-ups count as readiness of whichever
    /// directions are registered.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        let timeout = match (timeout, self.timers.timeout(Instant::now())) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::new();
        let mut woken = false;
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER {
                woken = true;
                continue;
            }
            let Some(reg) = self.interests.get(&token) else {
                continue;
            };
            let failed = event.is_error();
            let readable = reg.read && (event.is_readable() || event.is_read_closed() || failed);
            let writable = reg.write && (event.is_writable() || event.is_write_closed() || failed);
            if readable || writable {
                ready.push(Ready {
                    token,
                    readable,
                    writable,
                });
            }
        }
        if woken {
            while let Ok(notification) = self.probe_rx.try_recv() {
                self.notifications.push_back(notification);
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod test {
    use std::{io::Write, os::fd::AsRawFd, os::unix::net::UnixStream};

    use super::*;

    #[test]
    fn test_duplicate_read_interest_keeps_write() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        let token = reactor.allocate_token();
        let fd = a.as_raw_fd();

        reactor.register(Interest::read(token, fd)).unwrap();
        reactor.register(Interest::read(token, fd)).unwrap();
        reactor.register(Interest::write(token, fd)).unwrap();
        assert!(reactor.is_registered(token, Direction::Read));
        assert!(reactor.is_registered(token, Direction::Write));

        // One deregistration undoes both registrations of the read interest.
        reactor.deregister(Interest::read(token, fd)).unwrap();
        assert!(!reactor.is_registered(token, Direction::Read));
        assert!(reactor.is_registered(token, Direction::Write));
        reactor.deregister(Interest::read(token, fd)).unwrap();
        assert!(reactor.is_registered(token, Direction::Write));

        b.write_all(b"x").unwrap();
        let ready = reactor.poll(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(
            ready,
            vec![Ready {
                token,
                readable: false,
                writable: true
            }]
        );
    }

    #[test]
    fn test_poll_reports_only_registered_directions() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        let token = reactor.allocate_token();
        reactor.register(Interest::read(token, a.as_raw_fd())).unwrap();

        b.write_all(b"hello").unwrap();
        let ready = reactor.poll(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
        assert!(!ready[0].writable);

        reactor.forget(token);
        assert!(!reactor.is_registered(token, Direction::Read));
    }

    #[test]
    fn test_canceled_timer_is_not_taken() {
        let mut reactor = Reactor::new().unwrap();
        let token = reactor.allocate_token();
        let id = reactor.add_timer(Duration::from_millis(40), token);
        std::thread::sleep(Duration::from_millis(20));
        reactor.cancel_timer(id);
        std::thread::sleep(Duration::from_millis(40));
        let _ = reactor.poll(Some(Duration::from_millis(1))).unwrap();
        assert!(reactor.expire_timers().is_empty());
        assert_eq!(reactor.take_timer(id), None);
    }

    #[test]
    fn test_poll_wakes_for_timer() {
        let mut reactor = Reactor::new().unwrap();
        let token = reactor.allocate_token();
        let id = reactor.add_timer(Duration::from_millis(10), token);
        let started = Instant::now();
        let _ = reactor.poll(Some(Duration::from_secs(5))).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(reactor.expire_timers(), vec![id]);
        assert_eq!(reactor.take_timer(id), Some(token));
    }

    #[test]
    fn test_probe_result_comes_back_as_notification() {
        let mut reactor = Reactor::new().unwrap();
        let token = reactor.allocate_token();
        reactor.spawn_probe(token, "relay", || true).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut got = None;
        while got.is_none() && Instant::now() < deadline {
            reactor.poll(Some(Duration::from_millis(50))).unwrap();
            got = reactor.next_notification();
        }
        match got {
            Some((t, EndpointEvent::Probe { name, reachable })) => {
                assert_eq!(t, token);
                assert_eq!(name, "relay");
                assert!(reachable);
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }
}
