//! Linux tun devices.
use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    process::Command,
};

use obfstunnel::DeviceTarget;
use tracing::info;

const TUNSETIFF: u64 = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

// `struct ifreq` with the `ifr_flags` member of its union.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Opens the tun device `name` in non-blocking mode and returns it with the
/// name the kernel gave it. A `%d` in `name` lets the kernel pick a number.
pub(crate) fn open(name: &str) -> io::Result<(File, String)> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid device name {name:?}"),
        ));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI,
        _pad: [0; 22],
    };
    for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    // SAFETY: `req` is a full-sized `ifreq` that outlives the call.
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) } < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(&file)?;

    let assigned = req
        .name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8 as char)
        .collect();
    Ok((file, assigned))
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` stays open for the lifetime of `file`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Assigns `target` to the device `name` and brings it up.
pub(crate) fn configure(name: &str, target: &DeviceTarget) -> io::Result<()> {
    let network = format!("{}/{}", target.addr, target.prefix);
    run(Command::new("ip").args(["addr", "add", &network, "dev", name]))?;
    run(Command::new("ip").args(["link", "set", "dev", name, "up"]))
}

fn run(command: &mut Command) -> io::Result<()> {
    let status = command.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{command:?} exited with {status}")))
    }
}

/// Opens and addresses a fresh device for a network a peer asked for.
pub(crate) fn open_for_peer(target: &DeviceTarget) -> io::Result<File> {
    let (device, name) = open("obfs%d")?;
    configure(&name, target)?;
    info!(device = %name, addr = %target.addr, prefix = target.prefix, "device up");
    Ok(device)
}
