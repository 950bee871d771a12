//! bellows - multi-reactor TCP server framework.
//!
//! This crate multiplexes many TCP connections across a fixed pool of
//! event-loop threads using level-triggered readiness notification. One
//! accept loop owns the listening socket; accepted connections are handed to
//! I/O loops round-robin and stay on their loop for life. Application code
//! sees connect/message/write-complete callbacks and never touches a socket
//! directly.
//!
//! # Architecture
//!
//! - **Single-threaded ownership**: every channel and connection belongs to
//!   exactly one loop thread; there are no per-connection locks.
//! - **Cross-thread handoff**: any thread may queue a task onto any loop;
//!   the target loop is woken through an eventfd self-pipe.
//! - **Level-triggered readiness**: the poller keeps reporting until an fd
//!   is drained, so partial reads and writes need no rearming.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bellows::{EventLoop, PortReuse, TcpServer};
//!
//! let accept_loop = EventLoop::new();
//! let server = TcpServer::new(
//!     &accept_loop,
//!     "127.0.0.1:7878".parse()?,
//!     "echo",
//!     PortReuse::Disabled,
//! );
//! server.set_thread_num(4);
//! server.set_message_cb(Arc::new(|conn, input, _when| {
//!     let bytes = input.retrieve_all_as_bytes();
//!     conn.send(&bytes);
//! }));
//! server.start();
//! accept_loop.run();
//! ```
//!
//! # Backend Selection
//!
//! The readiness backend defaults to level-triggered epoll and may be
//! overridden through the `BELLOWS_POLLER` environment variable.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod epoll;
pub mod event_loop;
pub(crate) mod local;
pub mod metrics;
pub mod poller;
pub mod server;
pub mod workers;

// Public API re-exports
pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::{Channel, Interest, Ready};
pub use connection::{
    ConnState, ConnectionCallback, ConnectionRef, DEFAULT_HIGH_WATER_MARK, HighWaterMarkCallback,
    MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use epoll::EpollPoller;
pub use event_loop::EventLoop;
pub use poller::{POLLER_ENV, Poller, PollerKind};
pub use server::{PortReuse, TcpServer};
pub use workers::{LoopThreadPool, ThreadInitCallback};
