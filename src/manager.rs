//! Top-level coordinator: owns the connection set, the watch loop, and the
//! manager mutex protecting all of it.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use slab::Slab;

use crate::buffer::InBuffer;
use crate::config::Config;
use crate::connection::{ConnId, ConnType, Connection, Events, Handle, MessageCodec};
use crate::epoll::{self, Token};
use crate::error::{ConMgrError, Result};
use crate::listener::{self, ListenKey, ListenSpec};
use crate::net::tcp::TcpListener;
use crate::net::unix::UnixListener;
use crate::poll_controller::{PollController, PollMode};
use crate::signal::SignalChannel;
use crate::state_machine::{self, NextAction};
use crate::sys::commom::FromInner;
use crate::sys::socket::Socket;
use crate::work::{Job, Spawner, ThreadPoolSpawner, WorkStatus};

enum ListenerFd {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenerFd {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        match self {
            ListenerFd::Tcp(l) => l.as_raw_fd(),
            ListenerFd::Unix(l) => l.as_raw_fd(),
        }
    }
}

struct State {
    connections: Slab<Connection>,
    listeners: IndexMap<ConnId, ListenerFd>,
    listen_keys: HashSet<ListenKey>,
    shutdown: bool,
}

/// Owns the connection set, the listener set, the shutdown flag, and every
/// flag field on `Connection` objects. Every public mutator takes this
/// lock, updates, signals `watch_sleep`, and releases.
pub struct Manager {
    state: Mutex<State>,
    watch_sleep: Condvar,
    poll: PollController,
    config: Config,
    spawner: Arc<dyn Spawner>,
    signals: SignalChannel,
    self_weak: OnceLock<Weak<Manager>>,
}

impl Manager {
    pub fn new(config: Config) -> io::Result<Arc<Manager>> {
        let spawner = Arc::new(ThreadPoolSpawner::new(4)?);
        Manager::with_spawner(config, spawner)
    }

    pub fn with_spawner(config: Config, spawner: Arc<dyn Spawner>) -> io::Result<Arc<Manager>> {
        let poll = PollController::new()?;
        let signals = SignalChannel::install()?;

        let manager = Arc::new(Manager {
            state: Mutex::new(State {
                connections: Slab::new(),
                listeners: IndexMap::new(),
                listen_keys: HashSet::new(),
                shutdown: false,
            }),
            watch_sleep: Condvar::new(),
            poll,
            config,
            spawner,
            signals,
            self_weak: OnceLock::new(),
        });

        let _ = manager.self_weak.set(Arc::downgrade(&manager));
        manager.install_signal_connection()?;

        Ok(manager)
    }

    fn install_signal_connection(self: &Arc<Self>) -> io::Result<()> {
        let fd = self.signals.raw_fd();
        let events = Events {
            on_data: Some(Arc::new(|mgr: &Manager, _id: ConnId| {
                mgr.signals.drain(WorkStatus::Normal);
                crate::connection::DataStatus::Continue
            })),
            ..Default::default()
        };

        let conn = Connection::new(
            Some(Handle::Fd(Arc::new(crate::sys::fd::FileDesc::new(fd)))),
            None,
            "signal-channel".into(),
            ConnType::Raw,
            events,
        );

        let mut state = self.state.lock().unwrap();
        state.connections.insert(conn);
        Ok(())
    }

    /// Register a callback for `signum`; later deliveries invoke it with no
    /// connection argument.
    pub fn register_signal_work(&self, signum: i32, callback: impl Fn(WorkStatus) + Send + Sync + 'static) {
        self.signals.register(signum, callback);
    }

    // ---- listener & connection factory -------------------------------

    pub fn create_listen(self: &Arc<Self>, spec: &str, conn_type: ConnType, events: Events) -> Result<Vec<ConnId>> {
        let spec = ListenSpec::parse(spec)?;
        let mut state = self.state.lock().unwrap();
        let mut ids = Vec::new();

        match spec {
            ListenSpec::Unix(path) => {
                let key = ListenKey::from_unix(&path);
                if !state.listen_keys.insert(key) {
                    log::debug!("unix listen spec {path:?} duplicates an existing listener, skipping");
                    drop(state);
                    return Ok(ids);
                }
                let listener = listener::bind_unix(&path).map_err(ConMgrError::Io)?;
                let id = self
                    .adopt_listener(&mut state, ListenerFd::Unix(listener), conn_type, events, Some(path))
                    .map_err(ConMgrError::Io)?;
                ids.push(id);
            }
            ListenSpec::Net(spec) => {
                let listeners = listener::bind_net(&spec, &mut state.listen_keys).map_err(ConMgrError::Io)?;
                for l in listeners {
                    let id = self
                        .adopt_listener(&mut state, ListenerFd::Tcp(l), conn_type, events.clone(), None)
                        .map_err(ConMgrError::Io)?;
                    ids.push(id);
                }
            }
        }

        drop(state);
        self.poll.interrupt().map_err(ConMgrError::Io)?;
        self.watch_sleep.notify_all();
        Ok(ids)
    }

    /// Local address of a TCP listener connection, for callers that bound
    /// an ephemeral port (`:0`) and need to learn what was actually chosen.
    pub fn listener_local_addr(&self, id: ConnId) -> Result<SocketAddr> {
        let state = self.state.lock().unwrap();
        match state.listeners.get(&id) {
            Some(ListenerFd::Tcp(l)) => l.local_addr().map_err(ConMgrError::Io),
            Some(ListenerFd::Unix(_)) => Err(ConMgrError::NotASocket),
            None => Err(ConMgrError::missing_socket("no such listener")),
        }
    }

    /// The accepted/listening fd stays owned by `listener` in
    /// `state.listeners`; the connection object polls a `dup`'d copy so
    /// closing the connection and dropping the listener each close their
    /// own fd exactly once.
    fn adopt_listener(
        self: &Arc<Self>,
        state: &mut State,
        listener: ListenerFd,
        conn_type: ConnType,
        events: Events,
        unix_path: Option<std::path::PathBuf>,
    ) -> io::Result<ConnId> {
        let fd = listener.as_raw_fd();
        let dup_fd = std::mem::ManuallyDrop::new(crate::sys::fd::FileDesc::new(fd)).duplicate()?;
        let mut conn = Connection::new(
            Some(Handle::Fd(Arc::new(dup_fd))),
            None,
            format!("listener:{fd}"),
            conn_type,
            events,
        );
        conn.is_listen = true;
        conn.unix_socket_path = unix_path;
        let conn_id = ConnId(state.connections.insert(conn));
        state.listeners.insert(conn_id, listener);
        Ok(conn_id)
    }

    /// Issue `connect(addr)`. The new connection is registered under
    /// `PollMode::Connected`; `on_connection` fires once the socket error is
    /// queried as zero on first writability.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr, conn_type: ConnType, events: Events) -> Result<ConnId> {
        let sock = listener::connect(&addr).map_err(ConMgrError::Io)?;
        let shared = Handle::shared_socket(sock);

        let mut state = self.state.lock().unwrap();
        let mut conn = Connection::new(
            Some(Handle::Socket(shared.clone())),
            Some(Handle::Socket(shared)),
            addr.to_string(),
            conn_type,
            events,
        );
        conn.address = Some(addr);
        let id = ConnId(state.connections.insert(conn));
        drop(state);

        self.poll.interrupt().map_err(ConMgrError::Io)?;
        self.watch_sleep.notify_all();
        Ok(id)
    }

    /// Symmetric with `connect` for the `unix:` half of the listen-spec
    /// grammar. A domain-socket connect never blocks on a handshake, so the
    /// connection is marked connected immediately rather than routed
    /// through `PollMode::Connected`.
    pub fn connect_unix(self: &Arc<Self>, path: &Path, conn_type: ConnType, events: Events) -> Result<ConnId> {
        let stream = crate::net::unix::UnixStream::connect(path).map_err(ConMgrError::Io)?;
        let fd = stream.into_raw_fd();
        // Wrapped as a Socket, not a bare Fd: this is a real AF_UNIX socket,
        // and fd-passing/peer-credentials both require Handle::Socket.
        let shared = Handle::shared_socket(Socket::from_inner(fd));

        let mut state = self.state.lock().unwrap();
        let mut conn = Connection::new(
            Some(Handle::Socket(shared.clone())),
            Some(Handle::Socket(shared)),
            path.display().to_string(),
            conn_type,
            events,
        );
        conn.is_connected = true;
        let on_connection = conn.events.on_connection.clone();
        if on_connection.is_some() {
            conn.work_active = true;
        }
        let id = ConnId(state.connections.insert(conn));
        drop(state);

        if let Some(on_connection) = on_connection {
            let manager = self.clone_for_job();
            self.spawner.spawn(Box::new(move || {
                let arg = on_connection(&manager, id, None);
                manager.set_arg(id, arg);
            }));
        }

        self.poll.interrupt().map_err(ConMgrError::Io)?;
        self.watch_sleep.notify_all();
        Ok(id)
    }

    // ---- connection-facing API (§6) -----------------------------------

    /// Borrow-read the accumulated input. Returns a copy rather than a
    /// direct borrow: the buffer lives behind the manager mutex, which no
    /// caller may hold across a callback invocation.
    pub fn get_in_buffer(&self, id: ConnId) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.connections[id.0].in_buffer.as_slice().to_vec()
    }

    pub fn mark_consumed_in_buffer(&self, id: ConnId, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.connections[id.0].in_buffer.mark_consumed(n);
    }

    /// Attaches (or replaces) the message codec used for this connection's
    /// Rpc-typed dispatch. For a listener, attaches the codec every future
    /// accepted connection inherits; for an individual connection, takes
    /// effect on its next dispatch.
    pub fn set_codec(&self, id: ConnId, codec: Arc<dyn MessageCodec>) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.connections.get_mut(id.0) {
            conn.codec = Some(codec);
        }
    }

    /// Switches a connection between `Raw` and `Rpc`, then re-dispatches any
    /// already-buffered, not yet consumed input under the new type.
    pub fn change_mode(&self, id: ConnId, new_type: ConnType) {
        let mut state = self.state.lock().unwrap();
        let Some(conn) = state.connections.get_mut(id.0) else { return };
        conn.conn_type = new_type;
        if conn.work_active || conn.in_buffer.is_empty() {
            return;
        }
        self.dispatch_data(&mut state, id);
    }

    pub fn queue_write(&self, id: ConnId, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.connections[id.0].out_queue.push(bytes);
        drop(state);
        let _ = self.poll.interrupt();
        self.watch_sleep.notify_all();
    }

    pub fn queue_close(&self, id: ConnId) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.connections.get_mut(id.0) {
            if conn.work_active {
                // deferred: re-checked on dispatch once the running callback returns
                conn.work.push_back(Box::new(move |mgr, id, status| {
                    if status == WorkStatus::Cancelled {
                        return;
                    }
                    mgr.queue_close(id);
                }));
            } else {
                self.close_locked(&mut state, id);
            }
        }
    }

    fn close_locked(&self, state: &mut State, id: ConnId) {
        if let Some(conn) = state.connections.get_mut(id.0) {
            if conn.input.is_none() && conn.read_eof {
                return; // idempotent: already closed
            }
            let _ = self.poll.unlink(conn.input_fd());
            if conn.output_fd() != conn.input_fd() {
                let _ = self.poll.unlink(conn.output_fd());
            }
            conn.input = None;
            conn.read_eof = true;
            if let Some(path) = conn.unix_socket_path.take() {
                let _ = std::fs::remove_file(path);
            }
            conn.polling_input = PollMode::None;
            conn.polling_output = PollMode::None;
        }
    }

    /// Callable only from inside a callback (asserts `work_active`).
    pub fn get_status(&self, id: ConnId) -> ConnStatus {
        let state = self.state.lock().unwrap();
        let conn = &state.connections[id.0];
        assert!(conn.work_active, "get_status is only callable from inside a callback");
        ConnStatus {
            is_socket: conn.is_socket(),
            is_listen: conn.is_listen,
            read_eof: conn.read_eof,
            is_connected: conn.is_connected,
        }
    }

    // ---- watch loop -----------------------------------------------------

    pub fn spawn_watch_thread(self: &Arc<Self>) -> io::Result<thread::JoinHandle<()>> {
        let manager = self.clone();
        thread::Builder::new()
            .name("conmgr-watch".into())
            .spawn(move || manager.run())
    }

    pub fn run(self: &Arc<Self>) {
        let mut events = epoll::Events::with_capacity(self.config.events_capacity);
        loop {
            if self.reconcile_and_check_done() {
                break;
            }

            match self.poll.wait(&mut events, Some(self.config.watch_idle_timeout)) {
                Ok(_) => {}
                Err(e) => {
                    log::error!("poll wait failed: {e}");
                    continue;
                }
            }

            let ready: Vec<(ConnId, crate::epoll::Ready)> =
                events.iter().map(|ev| (ConnId(ev.token().0), ev.readiness())).collect();

            for (id, readiness) in ready {
                self.handle_readiness(id, readiness);
            }
        }
    }

    /// Computes next poll modes for every connection, applies them, closes
    /// drained connections, and reports whether the manager is fully shut
    /// down (no connections left and shutdown requested).
    fn reconcile_and_check_done(self: &Arc<Self>) -> bool {
        // A connection that never triggers on_data/on_msg (e.g. the
        // receiving half of a fd handoff) would otherwise never have its
        // queued work run, since that only happens as dispatch finishes.
        let pending_work: Vec<ConnId> = {
            let state = self.state.lock().unwrap();
            state
                .connections
                .iter()
                .filter(|(_, c)| !c.work_active && !c.work.is_empty())
                .map(|(k, _)| ConnId(k))
                .collect()
        };
        for id in pending_work {
            self.drain_deferred_work(id, WorkStatus::Normal);
        }

        let mut state = self.state.lock().unwrap();
        if state.shutdown && state.connections.is_empty() {
            return true;
        }

        let ids: Vec<usize> = state.connections.iter().map(|(k, _)| k).collect();
        let mut to_finish = Vec::new();

        for key in ids {
            let action = {
                let conn = &state.connections[key];
                state_machine::next_action(conn, &self.config)
            };

            match action {
                NextAction::Closed => to_finish.push(ConnId(key)),
                NextAction::Mode(mode) => self.set_polling(&mut state, ConnId(key), mode),
            }
        }

        for id in to_finish {
            self.finish_locked(&mut state, id);
        }

        false
    }

    fn set_polling(&self, state: &mut State, id: ConnId, desired: PollMode) {
        let conn = &mut state.connections[id.0];
        let (want_in, want_out) = state_machine::per_fd_modes(desired, conn.same_fd);

        if conn.input_fd() >= 0 && conn.polling_input != PollMode::Unsupported {
            match self.poll.relink(conn.input_fd(), Token(id.0), conn.polling_input, want_in) {
                Ok(applied) => conn.polling_input = applied,
                Err(e) => log::warn!("{}: failed to relink input fd: {e}", conn.name),
            }
        }

        if !conn.same_fd && conn.output_fd() >= 0 && conn.polling_output != PollMode::Unsupported {
            match self.poll.relink(conn.output_fd(), Token(id.0), conn.polling_output, want_out) {
                Ok(applied) => conn.polling_output = applied,
                Err(e) => log::warn!("{}: failed to relink output fd: {e}", conn.name),
            }
        } else if conn.same_fd {
            conn.polling_output = conn.polling_input;
        }

        state_machine::assert_same_fd_not_split_unsupported(conn);
    }

    fn finish_locked(&self, state: &mut State, id: ConnId) {
        self.close_locked(state, id);
        if let Some(conn) = state.connections.try_remove(id.0) {
            if let Some(on_finish) = conn.events.on_finish.clone() {
                let arg = conn.arg;
                let manager = self.clone_for_job();
                self.spawner.spawn(Box::new(move || {
                    on_finish(&manager, id, arg, WorkStatus::Normal);
                }));
            }
        }
    }

    fn clone_for_job(&self) -> Arc<Manager> {
        self.self_weak
            .get()
            .expect("self_weak set during construction")
            .upgrade()
            .expect("manager dropped while a job referencing it was still pending")
    }

    fn handle_readiness(self: &Arc<Self>, id: ConnId, readiness: crate::epoll::Ready) {
        let mut state = self.state.lock().unwrap();

        let is_listener = state.listeners.contains_key(&id);

        if readiness.is_error() || readiness.is_hup() {
            self.close_locked(&mut state, id);
            return;
        }

        if is_listener {
            drop(state);
            self.accept_all(id);
            return;
        }

        let Some(conn) = state.connections.get_mut(id.0) else { return };

        if !conn.is_connected && conn.polling_input == PollMode::Connected
            || !conn.is_connected && conn.polling_output == PollMode::Connected
        {
            self.complete_connect(&mut state, id);
            return;
        }

        if readiness.is_readable() {
            self.do_read(&mut state, id);
        }
        if readiness.is_writable() {
            self.do_write(&mut state, id);
        }
    }

    fn complete_connect(&self, state: &mut State, id: ConnId) {
        let conn = &mut state.connections[id.0];
        let fd = conn.output_fd();
        let sock = Socket::from_inner(fd);
        let err = sock.take_error();
        std::mem::forget(sock); // we don't own this fd independently of Connection

        match err {
            Ok(None) => {
                conn.is_connected = true;
                if let Some(on_connection) = conn.events.on_connection.clone() {
                    conn.work_active = true;
                    let manager = self.clone_for_job();
                    self.spawner.spawn(Box::new(move || {
                        let arg = on_connection(&manager, id, None);
                        manager.set_arg(id, arg);
                    }));
                }
            }
            Ok(Some(e)) => {
                log::warn!("{}: connect failed: {e}", conn.name);
                self.close_locked(state, id);
            }
            Err(e) => {
                log::warn!("{}: SO_ERROR query failed: {e}", conn.name);
                self.close_locked(state, id);
            }
        }
    }

    fn set_arg(self: &Arc<Self>, id: ConnId, arg: Option<crate::connection::Arg>) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.connections.get_mut(id.0) {
            if arg.is_none() {
                self.close_locked(&mut state, id);
            } else {
                conn.arg = arg;
            }
        }
        drop(state);
        self.clear_work_active(id);
        self.drain_deferred_work(id, WorkStatus::Normal);
    }

    fn do_read(&self, state: &mut State, id: ConnId) {
        let conn = &mut state.connections[id.0];
        if conn.work_active {
            return;
        }
        let Some(input) = conn.input.as_ref() else { return };

        let mut chunk = [0u8; 64 * 1024];
        match input.read(&mut chunk) {
            Ok(0) => conn.read_eof = true,
            Ok(n) => {
                conn.in_buffer.extend_from_slice(&chunk[..n]);

                if !conn.fingerprinted {
                    conn.fingerprinted = true;
                    if let Some(on_fingerprint) = conn.events.on_fingerprint.clone() {
                        conn.work_active = true;
                        let head = conn.in_buffer.as_slice().to_vec();
                        let manager = self.clone_for_job();
                        self.spawner.spawn(Box::new(move || {
                            let new_type = on_fingerprint(&manager, id, &head);
                            let mut state = manager.state.lock().unwrap();
                            let Some(conn) = state.connections.get_mut(id.0) else { return };
                            if let Some(new_type) = new_type {
                                conn.conn_type = new_type;
                            }
                            conn.work_active = false;
                            manager.dispatch_data(&mut state, id);
                        }));
                        return;
                    }
                }

                self.dispatch_data(state, id);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => self.close_locked(state, id),
        }
    }

    fn dispatch_data(&self, state: &mut State, id: ConnId) {
        let conn = &mut state.connections[id.0];
        conn.work_active = true;

        match conn.conn_type {
            ConnType::Raw => {
                if let Some(on_data) = conn.events.on_data.clone() {
                    let manager = self.clone_for_job();
                    self.spawner.spawn(Box::new(move || {
                        let status = on_data(&manager, id);
                        manager.finish_work(id, status);
                    }));
                } else {
                    conn.work_active = false;
                }
            }
            ConnType::Rpc => {
                if let (Some(codec), Some(on_msg)) = (conn.codec.clone(), conn.events.on_msg.clone()) {
                    let manager = self.clone_for_job();
                    self.spawner.spawn(Box::new(move || {
                        manager.pump_messages(id, codec, on_msg);
                    }));
                } else {
                    conn.work_active = false;
                }
            }
        }
    }

    fn pump_messages(
        self: &Arc<Self>,
        id: ConnId,
        codec: Arc<dyn crate::connection::MessageCodec>,
        on_msg: Arc<crate::connection::OnMsg>,
    ) {
        loop {
            let decoded = {
                let mut state = self.state.lock().unwrap();
                let Some(conn) = state.connections.get_mut(id.0) else { return };
                match codec.decode(conn.in_buffer.as_slice()) {
                    Ok(Some((msg, consumed))) => {
                        conn.in_buffer.mark_consumed(consumed);
                        Some(msg)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("message decode failed: {e}");
                        None
                    }
                }
            };

            match decoded {
                Some(msg) => on_msg(self, id, msg),
                None => break,
            }
        }

        self.clear_work_active(id);
        self.drain_deferred_work(id, WorkStatus::Normal);
    }

    fn finish_work(self: &Arc<Self>, id: ConnId, status: crate::connection::DataStatus) {
        self.clear_work_active(id);
        if status == crate::connection::DataStatus::Close {
            self.queue_close(id);
        }
        self.drain_deferred_work(id, WorkStatus::Normal);
    }

    fn clear_work_active(&self, id: ConnId) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.connections.get_mut(id.0) {
            conn.work_active = false;
        }
        drop(state);
        let _ = self.poll.interrupt();
        self.watch_sleep.notify_all();
    }

    fn drain_deferred_work(self: &Arc<Self>, id: ConnId, status: WorkStatus) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap();
                let Some(conn) = state.connections.get_mut(id.0) else { return };
                if conn.work_active {
                    return;
                }
                conn.work.pop_front()
            };
            match job {
                Some(job) => job(self, id, status),
                None => return,
            }
        }
    }

    fn do_write(&self, state: &mut State, id: ConnId) {
        let conn = &mut state.connections[id.0];
        let Some(output) = conn.output.as_ref() else { return };
        let Some(head) = conn.out_queue.head() else { return };

        match output.write(head) {
            Ok(n) => conn.out_queue.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => self.close_locked(state, id),
        }

        if conn.out_queue.is_empty() {
            while let Some(job) = state.connections[id.0].write_complete_work.pop_front() {
                job(self, id, WorkStatus::Normal);
            }
        }
    }

    fn accept_all(self: &Arc<Self>, listener_id: ConnId) {
        loop {
            let mut state = self.state.lock().unwrap();
            let Some(listener) = state.listeners.get_mut(&listener_id) else {
                return;
            };

            let accepted = match listener {
                ListenerFd::Tcp(l) => l.accept().map(|(s, a)| (s.into_raw_fd(), Some(a))),
                ListenerFd::Unix(l) => l.accept().map(|(s, _)| (s.into_raw_fd(), None)),
            };

            let (conn_type, events, codec) = {
                let listener_conn = &state.connections[listener_id.0];
                (listener_conn.conn_type, listener_conn.events.clone(), listener_conn.codec.clone())
            };

            match accepted {
                Ok((fd, addr)) => {
                    let shared = Handle::shared_socket(Socket::from_inner(fd));
                    let on_connection = events.on_connection.clone();
                    let mut conn = Connection::new(
                        Some(Handle::Socket(shared.clone())),
                        Some(Handle::Socket(shared)),
                        addr.map(|a| a.to_string()).unwrap_or_else(|| format!("fd:{fd}")),
                        conn_type,
                        events,
                    );
                    conn.is_connected = true;
                    conn.address = addr;
                    conn.codec = codec;
                    if on_connection.is_some() {
                        conn.work_active = true;
                    }
                    let id = ConnId(state.connections.insert(conn));

                    if let Some(on_connection) = on_connection {
                        let manager = self.clone_for_job();
                        self.spawner.spawn(Box::new(move || {
                            let arg = on_connection(&manager, id, None);
                            manager.set_arg(id, arg);
                        }));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    // ---- fd passing (UNIX domain only) --------------------------------

    pub fn queue_send_fd(self: &Arc<Self>, id: ConnId, fd: std::os::unix::io::RawFd) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.connections.get_mut(id.0) {
            conn.work.push_back(Box::new(move |mgr, id, status| {
                if status == WorkStatus::Cancelled {
                    unsafe {
                        libc::close(fd);
                    }
                    return;
                }
                let result = {
                    let state = mgr.state.lock().unwrap();
                    match state.connections.get(id.0).and_then(|c| c.output.as_ref()) {
                        Some(Handle::Socket(_)) => {
                            let sock_fd = state.connections[id.0].output_fd();
                            let sock = Socket::from_inner(sock_fd);
                            let r = crate::listener::send_fd(&sock, fd);
                            std::mem::forget(sock);
                            r
                        }
                        _ => Err(ConMgrError::NotASocket),
                    }
                };
                if let Err(e) = result {
                    log::warn!("queue_send_fd failed: {e}");
                }
                unsafe {
                    libc::close(fd);
                }
            }));
        }
    }

    pub fn queue_receive_fd(self: &Arc<Self>, id: ConnId, conn_type: ConnType, events: Events) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.connections.get_mut(id.0) {
            conn.work.push_back(Box::new(move |mgr, id, status| {
                if status == WorkStatus::Cancelled {
                    return;
                }
                mgr.do_receive_fd(id, conn_type, events);
            }));
        }
    }

    fn do_receive_fd(self: &Arc<Self>, id: ConnId, conn_type: ConnType, events: Events) {
        let mut state = self.state.lock().unwrap();
        let Some(conn) = state.connections.get(id.0) else { return };
        let Some(Handle::Socket(_)) = conn.input.as_ref() else {
            log::warn!("queue_receive_fd on a non-socket connection");
            self.close_locked(&mut state, id);
            return;
        };

        let sock_fd = conn.input_fd();
        let sock = Socket::from_inner(sock_fd);
        let result = crate::listener::recv_fd(&sock);
        std::mem::forget(sock);

        match result {
            Ok(fd) => {
                let shared = Handle::shared_fd(crate::sys::fd::FileDesc::new(fd));
                let on_connection = events.on_connection.clone();
                let mut new_conn = Connection::new(
                    Some(Handle::Fd(shared.clone())),
                    Some(Handle::Fd(shared)),
                    format!("received-fd:{fd}"),
                    conn_type,
                    events,
                );
                new_conn.is_connected = true;
                if on_connection.is_some() {
                    new_conn.work_active = true;
                }
                let new_id = ConnId(state.connections.insert(new_conn));

                if let Some(on_connection) = on_connection {
                    let manager = self.clone_for_job();
                    self.spawner.spawn(Box::new(move || {
                        let arg = on_connection(&manager, new_id, None);
                        manager.set_arg(new_id, arg);
                    }));
                }
            }
            Err(e) => {
                log::warn!("{}: receive_fd failed: {e}", conn.name);
                self.close_locked(&mut state, id);
            }
        }
    }

    pub fn peer_credentials(&self, id: ConnId) -> Result<crate::sys::socket::PeerCred> {
        let state = self.state.lock().unwrap();
        let conn = state
            .connections
            .get(id.0)
            .ok_or_else(|| ConMgrError::missing_socket("no such connection"))?;
        match conn.input.as_ref() {
            Some(Handle::Socket(_)) => {
                let fd = conn.input_fd();
                let sock = Socket::from_inner(fd);
                let r = crate::listener::peer_credentials(&sock);
                std::mem::forget(sock);
                r
            }
            _ => Err(ConMgrError::NotASocket),
        }
    }

    // ---- shutdown -------------------------------------------------------

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;

        let ids: Vec<usize> = state.connections.iter().map(|(k, _)| k).collect();
        for key in ids {
            let conn = &mut state.connections[key];
            for job in conn.work.drain(..) {
                job(self, ConnId(key), WorkStatus::Cancelled);
            }
            for job in conn.write_complete_work.drain(..) {
                job(self, ConnId(key), WorkStatus::Cancelled);
            }
            self.close_locked(&mut state, ConnId(key));
        }

        drop(state);
        let _ = self.poll.interrupt();
        self.watch_sleep.notify_all();
    }
}

/// Snapshot returned by `get_status`; callable only from inside a callback.
#[derive(Debug, Clone, Copy)]
pub struct ConnStatus {
    pub is_socket: bool,
    pub is_listen: bool,
    pub read_eof: bool,
    pub is_connected: bool,
}
