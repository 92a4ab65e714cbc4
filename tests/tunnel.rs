//! Two engines on one thread, pumped alternately, with blocking std sockets
//! on helper threads playing the applications around them.
use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket},
    os::{fd::OwnedFd, unix::net::UnixDatagram},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use obfstunnel::{
    Config, DeviceTarget, Engine, Frame, FrameKind, Pipeline, Role, Timeouts,
    codec::Output, mimicry::physical_chain,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn accepting(fallback: Option<SocketAddr>) -> (Engine, SocketAddr) {
    let config = Config::builder_with_role(Role::Accept { fallback }).with_defaults();
    let mut engine = Engine::new(config).unwrap();
    let relay = engine.listen_tunnels(localhost()).unwrap();
    (engine, relay)
}

fn connecting() -> Engine {
    Engine::new(Config::builder_with_role(Role::connect()).with_defaults()).unwrap()
}

/// Pumps every engine in turn until `done` holds, for at most ten seconds.
fn pump_until(engines: &mut [&mut Engine], done: impl FnMut() -> bool) {
    pump_within(engines, Duration::from_secs(10), done);
}

fn pump_within(engines: &mut [&mut Engine], limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "gave up waiting");
        for engine in engines.iter_mut() {
            engine.turn(Some(Duration::from_millis(5))).unwrap();
        }
    }
}

fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind(localhost()).unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => stream.write_all(&buf[..n]).unwrap(),
                    }
                }
                let _ = stream.shutdown(Shutdown::Write);
            });
        }
    });
    addr
}

#[test]
fn test_echo_through_tunnel() {
    init_tracing();
    let backend = echo_backend();
    let (mut server, relay) = accepting(None);
    let mut client = connecting();
    let local = client.forward_tcp(localhost(), relay, backend).unwrap();

    let app = thread::spawn(move || {
        let mut stream = TcpStream::connect(local).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut got = [0u8; 4];
        stream.read_exact(&mut got).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        (got, rest)
    });
    pump_until(&mut [&mut client, &mut server], || app.is_finished());

    let (got, rest) = app.join().unwrap();
    assert_eq!(&got, b"ping");
    assert!(rest.is_empty());
    assert_eq!(client.registry().tunnel_count(), 1);
}

#[test]
fn test_large_transfer_keeps_order() {
    init_tracing();
    let backend = echo_backend();
    let (mut server, relay) = accepting(None);
    let mut client = connecting();
    let local = client.forward_tcp(localhost(), relay, backend).unwrap();

    let data: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = data.clone();
    let app = thread::spawn(move || {
        let stream = TcpStream::connect(local).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let sender = thread::spawn(move || {
            writer.write_all(&data).unwrap();
            writer.shutdown(Shutdown::Write).unwrap();
        });
        let mut reader = stream;
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        sender.join().unwrap();
        got
    });
    pump_until(&mut [&mut client, &mut server], || app.is_finished());

    let got = app.join().unwrap();
    assert_eq!(got.len(), expected.len());
    assert!(got == expected);
}

#[test]
fn test_datagrams_through_tunnel() {
    init_tracing();
    let backend = UdpSocket::bind(localhost()).unwrap();
    let backend_addr = backend.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = backend.recv_from(&mut buf) {
            let _ = backend.send_to(&buf[..n], from);
        }
    });
    let (mut server, relay) = accepting(None);
    let mut client = connecting();
    let local = client.forward_udp(localhost(), relay, backend_addr).unwrap();

    let app = thread::spawn(move || {
        let socket = UdpSocket::bind(localhost()).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        socket.send_to(b"ping", local).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = socket.recv_from(&mut buf).unwrap();
        (buf[..n].to_vec(), from)
    });
    pump_until(&mut [&mut client, &mut server], || app.is_finished());

    let (got, from) = app.join().unwrap();
    assert_eq!(got, b"ping");
    assert_eq!(from, local);
}

#[test]
fn test_probe_is_relayed_to_fallback() {
    init_tracing();
    let site = TcpListener::bind(localhost()).unwrap();
    let site_addr = site.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = site.accept().unwrap();
        let mut request = [0u8; 18];
        stream.read_exact(&mut request).unwrap();
        assert_eq!(&request, b"GET / HTTP/1.1\r\n\r\n");
        stream.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").unwrap();
    });
    let (mut server, relay) = accepting(Some(site_addr));

    let prober = thread::spawn(move || {
        let mut stream = TcpStream::connect(relay).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        reply
    });
    pump_until(&mut [&mut server], || prober.is_finished());

    assert_eq!(prober.join().unwrap(), b"HTTP/1.1 404 Not Found\r\n\r\n");
}

#[test]
fn test_probe_without_fallback_is_closed() {
    init_tracing();
    let (mut server, relay) = accepting(None);

    let prober = thread::spawn(move || {
        let mut stream = TcpStream::connect(relay).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut buf = [0u8; 64];
        stream.read(&mut buf)
    });
    pump_until(&mut [&mut server], || prober.is_finished());

    match prober.join().unwrap() {
        Ok(n) => assert_eq!(n, 0),
        Err(err) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
    }
}

#[test]
fn test_lost_tunnel_closes_its_flows() {
    init_tracing();
    // Accepts the tunnel and hangs up at once.
    let impostor = TcpListener::bind(localhost()).unwrap();
    let relay = impostor.local_addr().unwrap();
    thread::spawn(move || {
        for stream in impostor.incoming() {
            drop(stream);
        }
    });
    let mut client = connecting();
    let local = client.forward_tcp(localhost(), relay, localhost()).unwrap();

    let app = thread::spawn(move || {
        let mut stream = TcpStream::connect(local).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut buf = [0u8; 16];
        stream.read(&mut buf)
    });
    pump_until(&mut [&mut client], || app.is_finished());

    assert!(matches!(app.join().unwrap(), Ok(0) | Err(_)));
    assert_eq!(client.registry().tunnel_count(), 0);
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    packet
}

/// A device stand-in: one end for the engine, one end for the test.
fn device_pair() -> (File, UnixDatagram) {
    let (device, peer) = UnixDatagram::pair().unwrap();
    device.set_nonblocking(true).unwrap();
    peer.set_nonblocking(true).unwrap();
    (File::from(OwnedFd::from(device)), peer)
}

#[test]
fn test_device_packets_are_routed_both_ways() {
    init_tracing();
    let target = DeviceTarget {
        addr: Ipv4Addr::new(10, 9, 0, 1),
        prefix: 24,
    };
    let (mut server, relay) = accepting(None);
    let (server_device, server_peer) = device_pair();
    let mut server_device = Some(server_device);
    server.set_device_opener(move |requested| {
        assert_eq!(requested.addr, Ipv4Addr::new(10, 9, 0, 1));
        server_device
            .take()
            .ok_or_else(|| io::Error::other("device opened twice"))
    });

    let mut client = connecting();
    let (client_device, client_peer) = device_pair();
    client.attach_device(client_device, relay, target).unwrap();

    let host = Ipv4Addr::new(10, 9, 0, 2);
    let outbound = ipv4_packet(host, target.addr, b"hello");
    let mut buf = [0u8; 2048];
    // Packets sent before the flow is up are dropped, so keep sending.
    pump_until(&mut [&mut client, &mut server], || {
        let _ = client_peer.send(&outbound);
        matches!(server_peer.recv(&mut buf), Ok(n) if buf[..n] == outbound[..])
    });

    let inbound = ipv4_packet(target.addr, host, b"world");
    server_peer.send(&inbound).unwrap();
    pump_until(&mut [&mut client, &mut server], || {
        while let Ok(n) = client_peer.recv(&mut buf) {
            if buf[..n] == inbound[..] {
                return true;
            }
        }
        false
    });

    // No route was learned for this host.
    let stray = ipv4_packet(target.addr, Ipv4Addr::new(10, 9, 0, 77), b"lost");
    server_peer.send(&stray).unwrap();
    for _ in 0..20 {
        client.turn(Some(Duration::from_millis(5))).unwrap();
        server.turn(Some(Duration::from_millis(5))).unwrap();
    }
    while let Ok(n) = client_peer.recv(&mut buf) {
        assert_ne!(buf[..n], stray[..]);
    }
}

/// The accepting end of a tunnel, driven by hand: decodes what the engine
/// sends and writes whatever frames a test needs.
struct RawRelay {
    listener: TcpListener,
    stream: Option<TcpStream>,
    pipeline: Pipeline,
    frames: Vec<Frame>,
    payload: Vec<u8>,
    eof: bool,
}

impl RawRelay {
    fn bind() -> Self {
        let listener = TcpListener::bind(localhost()).unwrap();
        listener.set_nonblocking(true).unwrap();
        Self {
            listener,
            stream: None,
            pipeline: physical_chain(false),
            frames: Vec::new(),
            payload: Vec::new(),
            eof: false,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accepts the tunnel if needed, then decodes everything readable.
    /// `PAYLOAD` bodies are collected apart from the other frames.
    fn poll(&mut self) {
        if self.stream.is_none() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).unwrap();
                    self.stream = Some(stream);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => panic!("accept failed: {err}"),
            }
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut buf = vec![0u8; 64 * 1024];
        while !self.eof {
            match stream.read(&mut buf) {
                Ok(0) => self.eof = true,
                Ok(n) => match self.pipeline.decode(&buf[..n]) {
                    Output::Units(units) => {
                        for unit in units {
                            let frame = Frame::parse(&unit).unwrap();
                            if frame.kind == FrameKind::Payload {
                                self.payload.extend_from_slice(&frame.payload);
                            } else {
                                self.frames.push(frame);
                            }
                        }
                    }
                    other => panic!("undecodable tunnel traffic: {other:?}"),
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(_) => self.eof = true,
            }
        }
    }

    fn count(&self, kind: FrameKind) -> usize {
        self.frames.iter().filter(|frame| frame.kind == kind).count()
    }

    /// Sends one unit through the physical chain, framed or not.
    fn send_unit(&mut self, unit: Vec<u8>) {
        let bytes = self.pipeline.encode(unit);
        self.stream.as_mut().unwrap().write_all(&bytes).unwrap();
    }

    fn finish(&mut self) {
        self.stream.as_mut().unwrap().shutdown(Shutdown::Write).unwrap();
    }
}

fn connecting_with(pool_size: u32, timeouts: Timeouts, low: usize, high: usize) -> Engine {
    let config = Config::builder_with_role(Role::Connect { pool_size })
        .with_timeouts(timeouts)
        .with_watermarks(low, high);
    Engine::new(config).unwrap()
}

/// Whether the other end of `stream` hung up.
fn hung_up(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() != ErrorKind::WouldBlock,
    }
}

#[test]
fn test_heartbeats_until_peer_finishes() {
    init_tracing();
    let timeouts = Timeouts {
        heartbeat: Duration::from_millis(50),
        ..Timeouts::default()
    };
    let mut client = connecting_with(32, timeouts, 256 * 1024, 1024 * 1024);
    let mut relay = RawRelay::bind();
    let local = client.forward_tcp(localhost(), relay.addr(), localhost()).unwrap();
    let _app = TcpStream::connect(local).unwrap();

    pump_until(&mut [&mut client], || {
        relay.poll();
        relay.count(FrameKind::Heartbeat) >= 2
    });
    assert_eq!(relay.frames[0].kind, FrameKind::TcpInitial);

    relay.finish();
    pump_until(&mut [&mut client], || {
        relay.poll();
        relay.eof
    });
    let seen = relay.count(FrameKind::Heartbeat);
    let quiet_until = Instant::now() + Duration::from_millis(300);
    pump_until(&mut [&mut client], || Instant::now() > quiet_until);
    relay.poll();
    assert_eq!(relay.count(FrameKind::Heartbeat), seen);
    assert_eq!(client.registry().tunnel_count(), 0);
}

#[test]
fn test_full_tunnel_pauses_its_flows() {
    init_tracing();
    let mut client = connecting_with(32, Timeouts::default(), 16 * 1024, 64 * 1024);
    let mut relay = RawRelay::bind();
    let local = client.forward_tcp(localhost(), relay.addr(), localhost()).unwrap();

    // Writes an endless counting pattern until told to stop.
    let written = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let (written, stop) = (written.clone(), stop.clone());
        thread::spawn(move || {
            let mut stream = TcpStream::connect(local).unwrap();
            let mut offset = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let chunk: Vec<u8> = (offset..offset + 16 * 1024)
                    .map(|i| (i % 251) as u8)
                    .collect();
                stream.write_all(&chunk).unwrap();
                offset += chunk.len();
                written.store(offset, Ordering::SeqCst);
            }
            stream.shutdown(Shutdown::Write).unwrap();
            offset
        })
    };

    // Nobody reads the tunnel: once every buffer on the way is full the
    // writer must stall instead of the client queueing without bound.
    let mut last = (0, Instant::now());
    pump_within(&mut [&mut client], Duration::from_secs(30), || {
        let now = written.load(Ordering::SeqCst);
        if now != last.0 {
            last = (now, Instant::now());
        }
        now > 0 && last.1.elapsed() > Duration::from_millis(500)
    });
    assert!(!writer.is_finished());

    stop.store(true, Ordering::SeqCst);
    pump_within(&mut [&mut client], Duration::from_secs(60), || {
        relay.poll();
        relay.count(FrameKind::TcpFin) == 1
    });
    let total = writer.join().unwrap();
    assert_eq!(relay.payload.len(), total);
    assert!(
        relay
            .payload
            .iter()
            .enumerate()
            .all(|(i, byte)| *byte == (i % 251) as u8)
    );
}

#[test]
fn test_corrupted_frame_closes_tunnel_and_flows() {
    init_tracing();
    let mut client = connecting_with(1, Timeouts::default(), 256 * 1024, 1024 * 1024);
    let mut relay = RawRelay::bind();
    let local = client.forward_tcp(localhost(), relay.addr(), localhost()).unwrap();
    let mut apps: Vec<TcpStream> = (0..2).map(|_| TcpStream::connect(local).unwrap()).collect();
    for app in &apps {
        app.set_nonblocking(true).unwrap();
    }

    pump_until(&mut [&mut client], || {
        relay.poll();
        relay.count(FrameKind::TcpInitial) == 2
    });
    assert_eq!(client.registry().tunnel_count(), 1);

    // A well-formed physical unit whose frame claims more payload than it has.
    let id = relay.frames[0].id;
    let mut unit = Frame::new(FrameKind::Payload, id, b"hello".to_vec())
        .encode()
        .unwrap();
    unit[2..6].copy_from_slice(&99u32.to_be_bytes());
    relay.send_unit(unit);

    pump_until(&mut [&mut client], || {
        relay.poll();
        relay.eof && apps.iter_mut().all(hung_up)
    });
    assert_eq!(client.registry().tunnel_count(), 0);
}
