//! Converts asynchronous signal deliveries into ordinary data events: a pipe
//! whose read end is registered as a Raw connection, and whose write end is
//! reachable from signal-handler context via a single atomic fd.

use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{OnceLock, RwLock};

use crate::sys::fd::FileDesc;
use crate::work::WorkStatus;

/// The handler needs a process-wide write-end fd visible from signal
/// context; a plain atomic integer is all signal-safe code may touch.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

type SignalWork = Box<dyn Fn(WorkStatus) + Send + Sync>;

#[derive(Default)]
struct Registry {
    handlers_installed: HashSet<i32>,
    work: HashMap<i32, Vec<SignalWork>>,
}

static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();

fn registry() -> &'static RwLock<Registry> {
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

/// Owns the read end of the signal pipe. One instance per process; the
/// manager registers its fd as a Raw connection and calls `drain` from that
/// connection's `on_data`.
pub struct SignalChannel {
    read_fd: FileDesc,
}

impl SignalChannel {
    pub fn install() -> io::Result<SignalChannel> {
        let mut fds = [0 as RawFd; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

        let read_fd = FileDesc::new(fds[0]);
        WRITE_FD.store(fds[1], Ordering::SeqCst);

        unsafe {
            libc::pthread_atfork(None, None, Some(fork_child_reset));
        }

        Ok(SignalChannel { read_fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.read_fd.raw()
    }

    /// Register a callback for `signum`, installing the OS handler the
    /// first time this signal number is requested.
    pub fn register(&self, signum: i32, callback: impl Fn(WorkStatus) + Send + Sync + 'static) {
        let mut reg = registry().write().unwrap();
        reg.work.entry(signum).or_default().push(Box::new(callback));
        if reg.handlers_installed.insert(signum) {
            unsafe { install_handler(signum) };
        }
    }

    /// Drain the pipe 4 bytes (one signal number) at a time and run every
    /// registered callback for each. Unmatched signal numbers are logged
    /// and ignored. Call from the signal connection's `on_data`.
    pub fn drain(&self, status: WorkStatus) {
        let mut buf = [0u8; 4];
        loop {
            match (&self.read_fd).read(&mut buf) {
                Ok(4) => {
                    let signum = i32::from_ne_bytes(buf);
                    let reg = registry().read().unwrap();
                    match reg.work.get(&signum) {
                        Some(callbacks) => {
                            for cb in callbacks {
                                cb(status);
                            }
                        }
                        None => log::warn!("signal {signum} delivered with no registered work, ignoring"),
                    }
                }
                Ok(0) => break,
                Ok(_) => break, // short read: a torn write can't happen across a single signal, treat as drained
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("signal pipe read failed: {e}");
                    break;
                }
            }
        }
    }
}

unsafe fn install_handler(signum: i32) {
    let mut sa: libc::sigaction = mem::zeroed();
    sa.sa_sigaction = handle_signal as usize;
    sa.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut sa.sa_mask);
    libc::sigaction(signum, &sa, std::ptr::null_mut());
}

/// Writes the 4-byte signal number to the pipe. No other work is done here:
/// retries on `EAGAIN`/`EWOULDBLOCK`/`EINTR`, returns silently on
/// `EPIPE`/`EBADF` (a post-shutdown race with the read end closing), aborts
/// on any other failure.
extern "C" fn handle_signal(signum: libc::c_int) {
    let saved_errno = unsafe { *libc::__errno_location() };

    let fd = WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let bytes = signum.to_ne_bytes();
        let mut off = 0;
        'write: loop {
            let ret = unsafe {
                libc::write(
                    fd,
                    bytes[off..].as_ptr() as *const libc::c_void,
                    bytes.len() - off,
                )
            };
            if ret >= 0 {
                off += ret as usize;
                if off >= bytes.len() {
                    break 'write;
                }
                continue;
            }

            match unsafe { *libc::__errno_location() } {
                libc::EAGAIN | libc::EWOULDBLOCK | libc::EINTR => continue,
                libc::EPIPE | libc::EBADF => break 'write,
                _ => unsafe { libc::abort() },
            }
        }
    }

    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

/// The signal-dispatcher thread does not survive `fork`; a child-side hook
/// resets the handler table, pipe fd, and any registered work so a forking
/// client doesn't deadlock on state inherited from the parent.
extern "C" fn fork_child_reset() {
    WRITE_FD.store(-1, Ordering::SeqCst);
    if let Ok(mut reg) = registry().write() {
        reg.handlers_installed.clear();
        reg.work.clear();
    }
}
