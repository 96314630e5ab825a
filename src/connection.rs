//! The per-fd (or fd-pair) connection object: buffers, state flags, and the
//! work queues that the event dispatcher drains.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::buffer::{InBuffer, OutQueue};
use crate::manager::Manager;
use crate::poll_controller::PollMode;
use crate::work::WorkStatus;

/// Opaque per-connection user state, set by `on_connection`'s return value
/// and read by later callbacks.
pub type Arg = Box<dyn Any + Send>;

/// A decoded RPC message, opaque to this crate — handed to `on_msg` as-is.
pub type Message = Box<dyn Any + Send>;

/// Byte-stream vs message-framed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Raw,
    Rpc,
}

/// Returned by `on_data`; a non-`Continue` result closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Continue,
    Close,
}

/// The RPC framing pump is an external collaborator: this crate only needs
/// to know how to pull one message at a time out of the accumulated input.
pub trait MessageCodec: Send + Sync {
    /// Attempt to decode one message from the front of `buf`. Returns the
    /// message and the number of bytes it consumed, or `None` if `buf`
    /// doesn't yet hold a complete message.
    fn decode(&self, buf: &[u8]) -> io::Result<Option<(Message, usize)>>;
}

pub type OnConnection =
    dyn Fn(&Manager, ConnId, Option<Arg>) -> Option<Arg> + Send + Sync;
pub type OnData = dyn Fn(&Manager, ConnId) -> DataStatus + Send + Sync;
pub type OnMsg = dyn Fn(&Manager, ConnId, Message) + Send + Sync;
pub type OnFinish = dyn Fn(&Manager, ConnId, Option<Arg>, WorkStatus) + Send + Sync;
pub type OnFingerprint = dyn Fn(&Manager, ConnId, &[u8]) -> Option<ConnType> + Send + Sync;

/// Immutable set of callback hooks. At least `on_data` (Raw) or `on_msg`
/// (Rpc) must be present.
#[derive(Default, Clone)]
pub struct Events {
    pub on_connection: Option<Arc<OnConnection>>,
    pub on_data: Option<Arc<OnData>>,
    pub on_msg: Option<Arc<OnMsg>>,
    pub on_finish: Option<Arc<OnFinish>>,
    pub on_fingerprint: Option<Arc<OnFingerprint>>,
}

/// Identifies a connection inside the manager's slab. Stable for the
/// lifetime of the connection; never reused while the connection is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

/// A raw fd or a connected/listening socket — whichever this connection
/// wraps. Exposes the same narrow read/write/raw-fd surface either way.
pub enum Handle {
    Socket(Arc<crate::sys::socket::Socket>),
    Fd(Arc<crate::sys::fd::FileDesc>),
}

impl Handle {
    /// Wraps a connected socket fd shared between a connection's `input`
    /// and `output` handles — the two halves must close it exactly once,
    /// on whichever drops last.
    pub fn shared_socket(sock: crate::sys::socket::Socket) -> Arc<crate::sys::socket::Socket> {
        Arc::new(sock)
    }

    /// Same sharing discipline as [`Handle::shared_socket`], for a
    /// connection backed by a bare fd pair instead of a socket.
    pub fn shared_fd(fd: crate::sys::fd::FileDesc) -> Arc<crate::sys::fd::FileDesc> {
        Arc::new(fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        use crate::sys::commom::AsInner;
        match self {
            Handle::Socket(s) => *s.as_inner(),
            Handle::Fd(f) => f.raw(),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Handle::Socket(s) => s.read(buf),
            Handle::Fd(f) => f.read(buf),
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Handle::Socket(s) => s.write(buf),
            Handle::Fd(f) => f.write(buf),
        }
    }
}

/// A callback invocation queued under this connection's serialization
/// discipline.
pub type WorkFn = Box<dyn FnOnce(&Manager, ConnId, WorkStatus) + Send>;

pub struct Connection {
    pub(crate) input: Option<Handle>,
    pub(crate) output: Option<Handle>,
    /// Set when `input`/`output` alias the same fd (a connected socket).
    pub(crate) same_fd: bool,

    pub name: String,
    pub conn_type: ConnType,
    pub events: Events,
    pub codec: Option<Arc<dyn MessageCodec>>,
    pub arg: Option<Arg>,

    pub in_buffer: InBuffer,
    pub out_queue: OutQueue,

    pub is_listen: bool,
    pub is_connected: bool,
    pub read_eof: bool,
    pub work_active: bool,
    pub wait_on_finish: bool,
    /// Set once `on_fingerprint` has run (or been skipped, if unset) for
    /// this connection's first chunk of data.
    pub(crate) fingerprinted: bool,

    pub address: Option<SocketAddr>,
    pub unix_socket_path: Option<std::path::PathBuf>,

    pub polling_input: PollMode,
    pub polling_output: PollMode,

    pub(crate) work: VecDeque<WorkFn>,
    pub(crate) write_complete_work: VecDeque<WorkFn>,

    pub mss: Option<u32>,
}

impl Connection {
    pub fn new(
        input: Option<Handle>,
        output: Option<Handle>,
        name: String,
        conn_type: ConnType,
        events: Events,
    ) -> Connection {
        let same_fd = match (&input, &output) {
            (Some(a), Some(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        };

        Connection {
            input,
            output,
            same_fd,
            name,
            conn_type,
            events,
            codec: None,
            arg: None,
            in_buffer: InBuffer::new(),
            out_queue: OutQueue::new(),
            is_listen: false,
            is_connected: false,
            read_eof: false,
            work_active: false,
            wait_on_finish: false,
            fingerprinted: false,
            address: None,
            unix_socket_path: None,
            polling_input: PollMode::None,
            polling_output: PollMode::None,
            work: VecDeque::new(),
            write_complete_work: VecDeque::new(),
            mss: None,
        }
    }

    pub fn input_fd(&self) -> RawFd {
        self.input.as_ref().map_or(-1, Handle::as_raw_fd)
    }

    pub fn output_fd(&self) -> RawFd {
        self.output.as_ref().map_or(-1, Handle::as_raw_fd)
    }

    pub fn is_socket(&self) -> bool {
        matches!(self.input, Some(Handle::Socket(_))) || matches!(self.output, Some(Handle::Socket(_)))
    }

    pub fn can_read(&self) -> bool {
        !self.read_eof && self.input.is_some()
    }

    pub fn can_write(&self) -> bool {
        self.output.is_some() && !self.out_queue.is_empty()
    }
}
