//! Parses listen specs, creates bound/listening fds, and the ancillary-data
//! protocols (fd passing, peer credentials) for UNIX domain sockets.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use crate::error::{ConMgrError, Result};
use crate::net::tcp::TcpListener;
use crate::net::unix::UnixListener;
use crate::sys::commom::IntoInner;
use crate::sys::socket::{self, PeerCred, Socket};

/// `spec := unix:<path> | host:port`
#[derive(Debug, Clone)]
pub enum ListenSpec {
    Unix(PathBuf),
    Net(String),
}

impl ListenSpec {
    pub fn parse(spec: &str) -> Result<ListenSpec> {
        if let Some(path) = spec.strip_prefix("unix:") {
            Ok(ListenSpec::Unix(PathBuf::from(path)))
        } else if spec.rsplit_once(':').is_some() {
            Ok(ListenSpec::Net(spec.to_string()))
        } else {
            Err(ConMgrError::BadListenSpec(spec.to_string()))
        }
    }
}

/// Two listen specs are duplicates iff this key matches: family + address +
/// port + scope for `AF_INET`/`AF_INET6`; path string-equality for
/// `AF_UNIX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenKey {
    Unix(PathBuf),
    V4 { addr: std::net::Ipv4Addr, port: u16 },
    V6 { addr: std::net::Ipv6Addr, port: u16, scope_id: u32 },
}

impl ListenKey {
    pub fn from_addr(addr: SocketAddr) -> ListenKey {
        match addr {
            SocketAddr::V4(a) => ListenKey::V4 { addr: *a.ip(), port: a.port() },
            SocketAddr::V6(a) => ListenKey::V6 {
                addr: *a.ip(),
                port: a.port(),
                scope_id: a.scope_id(),
            },
        }
    }

    pub fn from_unix(path: &Path) -> ListenKey {
        ListenKey::Unix(path.to_path_buf())
    }
}

/// Create, `unlink`-ing a stale path first (`ENOENT` ignored), bind, and
/// listen a `AF_UNIX SOCK_STREAM` socket.
pub fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Resolve `spec` and bind+listen one `SOCK_STREAM` socket per address not
/// already covered by `already_listening`, with `SO_REUSEADDR` set before
/// bind.
pub fn bind_net(
    spec: &str,
    already_listening: &mut std::collections::HashSet<ListenKey>,
) -> io::Result<Vec<TcpListener>> {
    let mut out = Vec::new();

    for addr in spec.to_socket_addrs()? {
        let key = ListenKey::from_addr(addr);
        if !already_listening.insert(key) {
            log::debug!("listen spec {spec} duplicates an existing listener for {addr}, skipping");
            continue;
        }

        let fam = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let sock = Socket::new_raw(fam, libc::SOCK_STREAM)?;
        socket::setsockopt(&sock, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1i32)?;
        sock.bind(&addr)?;
        sock.listen(128)?;

        let fd: i32 = sock.into_inner();
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        out.push(TcpListener::new(std_listener)?);
    }

    Ok(out)
}

/// Create a non-blocking socket of the matching family and issue `connect`.
/// The caller registers the resulting fd under `PollMode::Connected` and
/// waits for writability to learn the outcome.
pub fn connect(addr: &SocketAddr) -> io::Result<Socket> {
    let fam = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let sock = Socket::new_raw(fam, libc::SOCK_STREAM)?;
    sock.set_nonblocking(true)?;
    sock.connect(addr)?;
    Ok(sock)
}

/// Send `fd` as `SCM_RIGHTS` ancillary data over `sock`. The caller always
/// closes its local copy of `fd` after this returns, success or not.
pub fn send_fd(sock: &Socket, fd: std::os::unix::io::RawFd) -> Result<()> {
    if fd < 0 {
        return Err(ConMgrError::InvalidArg(fd));
    }
    socket::send_fd(sock, fd).map_err(ConMgrError::Io)
}

/// Receive a single fd sent via `send_fd`.
pub fn recv_fd(sock: &Socket) -> Result<std::os::unix::io::RawFd> {
    match socket::recv_fd(sock) {
        Ok(Some(fd)) => Ok(fd),
        Ok(None) => Err(ConMgrError::missing_socket("no ancillary fd in message")),
        Err(e) => Err(ConMgrError::Io(e)),
    }
}

/// `SO_PEERCRED` (Linux) / `LOCAL_PEERCRED` (BSD, macOS) peer credentials.
pub fn peer_credentials(sock: &Socket) -> Result<PeerCred> {
    socket::peer_cred(sock).map_err(ConMgrError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix_spec() {
        match ListenSpec::parse("unix:/tmp/conmgr.sock").unwrap() {
            ListenSpec::Unix(p) => assert_eq!(p, PathBuf::from("/tmp/conmgr.sock")),
            _ => panic!("expected unix spec"),
        }
    }

    #[test]
    fn parse_net_spec() {
        match ListenSpec::parse("127.0.0.1:0").unwrap() {
            ListenSpec::Net(s) => assert_eq!(s, "127.0.0.1:0"),
            _ => panic!("expected net spec"),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ListenSpec::parse("not-a-spec").is_err());
    }

    #[test]
    fn dedup_keys_distinguish_ports() {
        let a = ListenKey::from_addr("127.0.0.1:80".parse().unwrap());
        let b = ListenKey::from_addr("127.0.0.1:81".parse().unwrap());
        assert_ne!(a, b);
    }
}
