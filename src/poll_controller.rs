//! Bridges connection state to the kernel readiness primitive. Every fd is
//! registered with `EpollOpt::level()` — this crate never uses edge
//! triggering, so a connection that doesn't fully drain a buffer is simply
//! re-notified on the next `wait` instead of looping until `EWOULDBLOCK`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::epoll::{Epoll, EpollOpt, Events, Ready, Token};
use crate::waker::Waker;

/// What readiness signal the OS should deliver for a given fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    None,
    Connected,
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Listen,
    Unsupported,
}

impl PollMode {
    pub fn type_to_string(self) -> &'static str {
        match self {
            PollMode::None => "none",
            PollMode::Connected => "connected",
            PollMode::ReadOnly => "read-only",
            PollMode::WriteOnly => "write-only",
            PollMode::ReadWrite => "read-write",
            PollMode::Listen => "listen",
            PollMode::Unsupported => "unsupported",
        }
    }

    fn interest(self) -> Option<Ready> {
        match self {
            PollMode::None | PollMode::Unsupported => None,
            PollMode::Connected | PollMode::WriteOnly => Some(Ready::writable()),
            PollMode::ReadOnly | PollMode::Listen => Some(Ready::readable()),
            PollMode::ReadWrite => Some(Ready::readable() | Ready::writable()),
        }
    }
}

/// Token reserved for the interrupt waker; real connections never hold it
/// since `Token` values handed out by the manager come from a `Slab`.
const WAKER_TOKEN: Token = Token(usize::MAX);

pub struct PollController {
    epoll: Epoll,
    waker: Waker,
}

impl PollController {
    pub fn new() -> io::Result<PollController> {
        let epoll = Epoll::new()?;
        let waker = Waker::new()?;
        epoll.add(&waker, WAKER_TOKEN, Ready::readable(), EpollOpt::level())?;

        Ok(PollController { epoll, waker })
    }

    /// Register `fd` under `mode`. Returns the mode actually applied —
    /// `Unsupported` if the kernel refused the fd (`EPERM`), `mode`
    /// otherwise.
    pub fn link(&self, fd: RawFd, token: Token, mode: PollMode) -> io::Result<PollMode> {
        match mode.interest() {
            None => Ok(mode),
            Some(interest) => match self.epoll.add(&fd, token, interest, EpollOpt::level()) {
                Ok(()) => Ok(mode),
                Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(PollMode::Unsupported),
                Err(e) => Err(e),
            },
        }
    }

    /// Change the registered mode of an already-registered fd. Idempotent
    /// when `old == new`. A fd previously marked `Unsupported` is never
    /// touched again.
    pub fn relink(
        &self,
        fd: RawFd,
        token: Token,
        old: PollMode,
        new: PollMode,
    ) -> io::Result<PollMode> {
        if old == PollMode::Unsupported {
            return Ok(PollMode::Unsupported);
        }
        if old == new {
            return Ok(new);
        }

        match (old.interest(), new.interest()) {
            (None, Some(_)) => self.link(fd, token, new),
            (Some(_), None) => {
                self.unlink(fd)?;
                Ok(PollMode::None)
            }
            (Some(interest), Some(_)) => match self.epoll.modify(&fd, token, interest, EpollOpt::level()) {
                Ok(()) => Ok(new),
                Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(PollMode::Unsupported),
                Err(e) => Err(e),
            },
            (None, None) => Ok(new),
        }
    }

    /// Deregister `fd`. Safe to call when the fd was already closed by the
    /// caller (and thus implicitly dropped from epoll).
    pub fn unlink(&self, fd: RawFd) -> io::Result<()> {
        match self.epoll.delete(&fd) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cause a concurrent `wait` to return promptly. Callable from any
    /// worker thread; never from a signal handler.
    pub fn interrupt(&self) -> io::Result<()> {
        self.waker.wakeup()
    }

    /// Block until at least one registered fd is ready or `interrupt` was
    /// called. Waker events are drained here and never surfaced to callers.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.epoll.wait(events, timeout)?;

        let mut woke = false;
        for ev in events.iter() {
            if ev.token() == WAKER_TOKEN {
                woke = true;
            }
        }
        if woke {
            self.waker.finish()?;
        }

        Ok(events.len())
    }
}
