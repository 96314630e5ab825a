//! Pure decision logic for the per-connection lifecycle: what the next poll
//! mode should be, and how a unified mode maps onto a connection's one or
//! two underlying fds. The actual I/O driven by these decisions lives in
//! `Manager`.

use crate::config::Config;
use crate::connection::Connection;
use crate::poll_controller::PollMode;

/// What the watch loop should do with a connection on this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// No more I/O pending for this connection and no work in flight: tear
    /// it down and fire `on_finish`.
    Closed,
    Mode(PollMode),
}

/// Evaluated top to bottom, first match wins — see the component design's
/// state machine rules.
pub fn next_action(conn: &Connection, config: &Config) -> NextAction {
    if conn.input_fd() < 0 && conn.out_queue.is_empty() && !conn.work_active {
        return NextAction::Closed;
    }

    if conn.is_listen && conn.input_fd() >= 0 {
        return NextAction::Mode(PollMode::Listen);
    }

    if !conn.is_connected && conn.output_fd() >= 0 {
        return NextAction::Mode(PollMode::Connected);
    }

    if conn.work_active {
        return NextAction::Mode(PollMode::None);
    }

    if conn.read_eof && conn.out_queue.is_empty() {
        return NextAction::Mode(PollMode::None);
    }

    let want_read = !conn.read_eof && conn.in_buffer.len() < config.in_buffer_soft_cap;
    let want_write = !conn.out_queue.is_empty();

    let mode = match (want_read, want_write) {
        (false, false) => PollMode::None,
        (true, false) => PollMode::ReadOnly,
        (false, true) => PollMode::WriteOnly,
        (true, true) => PollMode::ReadWrite,
    };

    NextAction::Mode(mode)
}

/// Per-fd modes for `set_polling`'s unified `desired` mode. Panics if
/// `same_fd` and either side was previously pinned `Unsupported` — the two
/// halves of one fd cannot independently be `Unsupported`; that combination
/// is a programmer error the spec forbids recovering from silently.
pub fn per_fd_modes(desired: PollMode, same_fd: bool) -> (PollMode, PollMode) {
    if same_fd {
        (desired, desired)
    } else {
        match desired {
            PollMode::None => (PollMode::None, PollMode::None),
            PollMode::Connected => (PollMode::Connected, PollMode::Connected),
            PollMode::ReadOnly => (PollMode::ReadOnly, PollMode::None),
            PollMode::WriteOnly => (PollMode::None, PollMode::WriteOnly),
            PollMode::ReadWrite => (PollMode::ReadOnly, PollMode::WriteOnly),
            PollMode::Listen => (PollMode::Listen, PollMode::None),
            PollMode::Unsupported => (PollMode::Unsupported, PollMode::Unsupported),
        }
    }
}

/// Asserts the forbidden same-fd `Unsupported` combination described in the
/// resolved open question (§9).
pub fn assert_same_fd_not_split_unsupported(conn: &Connection) {
    if conn.same_fd {
        assert!(
            !(conn.polling_input == PollMode::Unsupported) || conn.polling_output == PollMode::Unsupported,
            "connection {:?}: same fd cannot have input Unsupported while output is not",
            conn.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnType, Events};

    fn conn_with(f: impl FnOnce(&mut Connection)) -> Connection {
        let mut c = Connection::new(None, None, "test".into(), ConnType::Raw, Events::default());
        f(&mut c);
        c
    }

    #[test]
    fn closed_when_no_input_no_output_no_work() {
        let c = conn_with(|_| {});
        assert_eq!(next_action(&c, &Config::default()), NextAction::Closed);
    }

    #[test]
    fn read_write_combination() {
        let mut c = conn_with(|c| {
            c.input = Some(crate::connection::Handle::Fd(std::sync::Arc::new(dummy_fd())));
            c.is_connected = true;
        });
        c.out_queue.push(b"hi".to_vec());
        assert_eq!(
            next_action(&c, &Config::default()),
            NextAction::Mode(PollMode::ReadWrite)
        );
    }

    fn dummy_fd() -> crate::sys::fd::FileDesc {
        use std::os::unix::io::FromRawFd;
        unsafe { crate::sys::fd::FileDesc::from_raw_fd(libc::dup(0)) }
    }

    #[test]
    fn per_fd_modes_distinct_read_write() {
        assert_eq!(
            per_fd_modes(PollMode::ReadWrite, false),
            (PollMode::ReadOnly, PollMode::WriteOnly)
        );
        assert_eq!(per_fd_modes(PollMode::ReadWrite, true), (PollMode::ReadWrite, PollMode::ReadWrite));
    }
}
