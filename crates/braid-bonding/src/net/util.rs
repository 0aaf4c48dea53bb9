use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Pin a socket to a network interface with `SO_BINDTODEVICE`, so traffic
/// leaves through that WAN link regardless of the routing table.
#[cfg(target_os = "linux")]
pub fn bind_to_device(socket: &impl AsRawFd, iface: &str) -> io::Result<()> {
    let name = iface.as_bytes();
    // SAFETY: the pointer and length describe `name`, which outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            name.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_to_device(_socket: &impl AsRawFd, _iface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_BINDTODEVICE is Linux only",
    ))
}

/// Bind an unconnected UDP socket on the wildcard address of `peer`'s
/// family, pinned to `iface` when given.
pub fn bind_udp_for(peer: SocketAddr, iface: Option<&str>) -> io::Result<UdpSocket> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = UdpSocket::bind(local)?;
    if let Some(iface) = iface {
        bind_to_device(&socket, iface)?;
    }
    Ok(socket)
}

/// Operational state of an interface from `/sys/class/net/<iface>/operstate`.
///
/// `Some(false)` only for an explicit `down`; `None` when the interface or
/// file is missing or the state is `unknown` (common for tunnels and `lo`).
pub fn read_operstate(iface: &str) -> Option<bool> {
    read_operstate_at(Path::new("/sys/class/net"), iface)
}

fn read_operstate_at(root: &Path, iface: &str) -> Option<bool> {
    let raw = std::fs::read_to_string(root.join(iface).join("operstate")).ok()?;
    match raw.trim() {
        "up" => Some(true),
        "down" | "lowerlayerdown" | "notpresent" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operstate_parsing() {
        let dir = std::env::temp_dir().join(format!("braid-operstate-{}", std::process::id()));
        for (iface, state) in [("wan0", "up\n"), ("wan1", "down\n"), ("tun0", "unknown\n")] {
            std::fs::create_dir_all(dir.join(iface)).unwrap();
            std::fs::write(dir.join(iface).join("operstate"), state).unwrap();
        }
        assert_eq!(read_operstate_at(&dir, "wan0"), Some(true));
        assert_eq!(read_operstate_at(&dir, "wan1"), Some(false));
        assert_eq!(read_operstate_at(&dir, "tun0"), None);
        assert_eq!(read_operstate_at(&dir, "missing"), None);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn nonexistent_interface_has_no_operstate() {
        assert_eq!(read_operstate("does_not_exist_xyz99"), None);
    }

    #[test]
    fn bind_udp_matches_peer_family() {
        let v4 = bind_udp_for("127.0.0.1:9".parse().unwrap(), None).unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn bind_to_unknown_device_fails() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(bind_to_device(&sock, "does_not_exist_xyz99").is_err());
    }
}
