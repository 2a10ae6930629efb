//! A single-threaded reactor for building non-blocking network services,
//! combining a libevent-style readiness backend (epoll, falling back to
//! poll) with a muduo-style `EventLoop`/`TcpServer` object model.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! reev = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use reev::{EventLoop, TcpServer, TcpServerConfig};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:13265".parse().unwrap();
//! let server = TcpServer::new(event_loop.clone(), addr, TcpServerConfig::default()).unwrap();
//!
//! server.set_message_callback(|conn, buf, _now| {
//!     let echoed = buf.retrieve_all_as_vec();
//!     conn.send(&echoed);
//! });
//!
//! server.start().unwrap();
//! event_loop.run().unwrap();
//! ```
//!
//! Every `EventLoop` is pinned to the OS thread that constructs it: one
//! loop per thread, and all but a handful of cross-thread-safe methods
//! (`run_in_loop`, `queue_in_loop`, `wakeup`, `cancel`, `quit`,
//! `TcpConnection::send`) must be called from that thread. Scale across
//! cores with an [`EventLoopThreadPool`], which `TcpServer` uses
//! internally to round-robin accepted connections onto worker loops.

extern crate libc;
#[macro_use]
extern crate log;

pub mod acceptor;
pub mod backend;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
pub mod inet_addr;
pub mod ready;
mod sys;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timer;
pub mod timer_queue;
pub mod token;
pub mod wakeup;

pub use acceptor::Acceptor;
pub use backend::{Backend, EpollBackend, PollBackend};
pub use buffer::Buffer;
pub use channel::{Channel, SharedChannel};
pub use config::{ConnectorConfig, TcpServerConfig};
pub use connector::Connector;
pub use error::ReactorError;
pub use event_loop::EventLoop;
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use inet_addr::InetAddr;
pub use ready::Ready;
pub use tcp_connection::TcpConnection;
pub use tcp_server::TcpServer;
pub use timer::TimerId;
pub use token::Token;
pub use wakeup::Wakeup;
