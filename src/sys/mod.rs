//! Thin libc wrappers the rest of the crate is built on: owned fds, the
//! epoll selector, non-blocking sockets with ancillary-data support, and an
//! eventfd-backed waker.

use std::io;

/// Run a libc call, retrying on `EINTR` and turning a `-1` return into
/// `io::Error::last_os_error()`.
#[macro_export]
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        loop {
            let res = unsafe { libc::$fn($($arg),*) };
            if res == -1 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(err);
            }
            break Ok(res);
        }
    }};
}

pub mod commom;
pub mod epoll;
pub mod eventfd;
pub mod fd;
pub mod socket;

pub use commom::{AsInner, AsInnerMut, FromInner, IntoInner};

/// Turn a raw libc return value into a `Result`, treating `-1` as an error.
pub fn cvt(t: libc::c_int) -> io::Result<libc::c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}
