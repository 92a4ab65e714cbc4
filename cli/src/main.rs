use std::{net::SocketAddr, str::FromStr};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use obfstunnel::{Config, DeviceTarget, Engine, Role};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod tun;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Accept tunnels on these addresses (addr:port[,addr:port...])
    #[arg(short = 'A', long, value_delimiter = ',', conflicts_with = "connect")]
    accept: Vec<SocketAddr>,

    /// Forward through tunnels (from/via/to/protocol[,...]), protocol is
    /// tcp, udp or tun. For tun, `from` is the device name and `to` is
    /// addr/prefix of the network to join.
    #[arg(short = 'C', long, value_delimiter = ',')]
    connect: Vec<Forward>,

    /// Where connections that do not speak the tunnel protocol are relayed
    #[arg(long, default_value = "127.0.0.1:8000", conflicts_with = "no_fallback")]
    fallback: SocketAddr,

    /// Close connections that do not speak the tunnel protocol
    #[arg(long)]
    no_fallback: bool,

    /// Physical tunnels per relay
    #[arg(long, default_value_t = 32)]
    pool_size: u32,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Debug)]
enum Forward {
    Tcp {
        from: SocketAddr,
        via: SocketAddr,
        to: SocketAddr,
    },
    Udp {
        from: SocketAddr,
        via: SocketAddr,
        to: SocketAddr,
    },
    Tun {
        device: String,
        via: SocketAddr,
        target: DeviceTarget,
    },
}

impl FromStr for Forward {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [from, via, to, "tcp"] => Ok(Forward::Tcp {
                from: addr(from)?,
                via: addr(via)?,
                to: addr(to)?,
            }),
            [from, via, to, "udp"] => Ok(Forward::Udp {
                from: addr(from)?,
                via: addr(via)?,
                to: addr(to)?,
            }),
            [device, via, network, prefix, "tun"] => Ok(Forward::Tun {
                device: device.to_string(),
                via: addr(via)?,
                target: DeviceTarget {
                    addr: network
                        .parse()
                        .map_err(|e| format!("invalid network {network:?}: {e}"))?,
                    prefix: prefix
                        .parse()
                        .ok()
                        .filter(|p| *p <= 32)
                        .ok_or_else(|| format!("invalid prefix {prefix:?}"))?,
                },
            }),
            _ => Err(format!(
                "expected from/via/to/tcp, from/via/to/udp or device/via/addr/prefix/tun, got {s:?}"
            )),
        }
    }
}

fn addr(part: &str) -> Result<SocketAddr, String> {
    part.parse()
        .map_err(|e| format!("invalid address {part:?}: {e}"))
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn accepting(cli: &Cli) -> Result<Engine> {
    let fallback = (!cli.no_fallback).then_some(cli.fallback);
    let config = Config::builder_with_role(Role::Accept { fallback }).with_defaults();
    let mut engine = Engine::new(config)?;
    engine.set_device_opener(tun::open_for_peer);
    for addr in &cli.accept {
        engine
            .listen_tunnels(*addr)
            .with_context(|| format!("cannot accept tunnels on {addr}"))?;
    }
    info!(?fallback, "accepting tunnels");
    Ok(engine)
}

fn connecting(cli: &Cli) -> Result<Engine> {
    let role = Role::Connect {
        pool_size: cli.pool_size,
    };
    let mut engine = Engine::new(Config::builder_with_role(role).with_defaults())?;
    for forward in &cli.connect {
        match forward {
            Forward::Tcp { from, via, to } => {
                engine
                    .forward_tcp(*from, *via, *to)
                    .with_context(|| format!("cannot forward tcp from {from}"))?;
            }
            Forward::Udp { from, via, to } => {
                engine
                    .forward_udp(*from, *via, *to)
                    .with_context(|| format!("cannot forward udp from {from}"))?;
            }
            Forward::Tun {
                device,
                via,
                target,
            } => {
                let (file, name) = tun::open(device)
                    .with_context(|| format!("cannot open device {device}"))?;
                engine.attach_device(file, *via, *target)?;
                info!(device = %name, %via, "device attached");
            }
        }
    }
    Ok(engine)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut engine = if !cli.accept.is_empty() {
        accepting(&cli)?
    } else if !cli.connect.is_empty() {
        connecting(&cli)?
    } else {
        Cli::command().print_help()?;
        return Ok(());
    };
    engine.run().context("event loop failed")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_forwards() {
        let Forward::Tcp { from, via, to } = "127.0.0.1:1080/203.0.113.7:443/127.0.0.1:22/tcp"
            .parse::<Forward>()
            .unwrap()
        else {
            panic!("not a tcp forward");
        };
        assert_eq!(from, "127.0.0.1:1080".parse().unwrap());
        assert_eq!(via, "203.0.113.7:443".parse().unwrap());
        assert_eq!(to, "127.0.0.1:22".parse().unwrap());

        let Forward::Tun { device, target, .. } = "tun7/203.0.113.7:443/10.9.0.1/24/tun"
            .parse::<Forward>()
            .unwrap()
        else {
            panic!("not a tun forward");
        };
        assert_eq!(device, "tun7");
        assert_eq!(target.addr, "10.9.0.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(target.prefix, 24);
    }

    #[test]
    fn test_reject_bad_forwards() {
        for bad in [
            "127.0.0.1:1080/203.0.113.7:443/127.0.0.1:22/sctp",
            "127.0.0.1:1080/203.0.113.7:443/tcp",
            "tun7/203.0.113.7:443/10.9.0.1/33/tun",
            "localhost:1/203.0.113.7:443/127.0.0.1:22/udp",
        ] {
            assert!(bad.parse::<Forward>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_modes_conflict() {
        let both = Cli::try_parse_from([
            "obfstunnel",
            "-A",
            "0.0.0.0:443",
            "-C",
            "127.0.0.1:1080/203.0.113.7:443/127.0.0.1:22/tcp",
        ]);
        assert!(both.is_err());

        let cli = Cli::try_parse_from(["obfstunnel", "-A", "0.0.0.0:443,0.0.0.0:8443", "-vv"]).unwrap();
        assert_eq!(cli.accept.len(), 2);
        assert_eq!(cli.verbose, 2);
    }
}
