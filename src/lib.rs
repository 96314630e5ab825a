//! `conmgr`: an epoll-based connection manager for long-running daemons.
//!
//! A `Manager` multiplexes any number of fd-backed connections — listening
//! sockets, connected TCP/UNIX sockets, and bare pipe fds — behind one
//! watch thread, and drives application callbacks on an outer worker pool
//! (or a bundled one, [`ThreadPoolSpawner`]) so slow handlers never stall
//! the event loop.
//!
//! # Example
//!
//! ```no_run
//! use conmgr::{Config, ConnType, Events, Manager};
//! use std::sync::Arc;
//!
//! let manager = Manager::new(Config::default()).unwrap();
//!
//! let events = Events {
//!     on_data: Some(Arc::new(|mgr: &Manager, id| {
//!         let buf = mgr.get_in_buffer(id);
//!         mgr.queue_write(id, buf.clone());
//!         mgr.mark_consumed_in_buffer(id, buf.len());
//!         conmgr::DataStatus::Continue
//!     })),
//!     ..Events::default()
//! };
//!
//! manager.create_listen("127.0.0.1:0", ConnType::Raw, events).unwrap();
//! manager.spawn_watch_thread().unwrap();
//! ```

pub mod epoll;
mod sys;

pub mod net;
mod waker;

mod buffer;
mod config;
mod connection;
mod error;
mod listener;
mod manager;
mod poll_controller;
mod signal;
mod state_machine;
mod work;

pub use config::Config;
pub use connection::{
    Arg, ConnId, ConnType, DataStatus, Events, Message, MessageCodec, OnConnection, OnData,
    OnFingerprint, OnFinish, OnMsg,
};
pub use error::{ConMgrError, Result};
pub use listener::{ListenKey, ListenSpec};
pub use manager::{ConnStatus, Manager};
pub use poll_controller::PollMode;
pub use sys::socket::PeerCred;
pub use work::{Job, Spawner, ThreadPoolSpawner, WorkStatus};

pub use epoll::{EpollOpt, Event, Events as PollEvents, Ready, Token};
pub use waker::Waker;
