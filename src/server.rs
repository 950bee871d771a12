//! TCP server: acceptor plus I/O loop pool plus connection registry.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use socket2::Socket;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::connection::{
    Callbacks, CloseCallback, ConnectionCallback, ConnectionRef, DEFAULT_HIGH_WATER_MARK,
    HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::local::LoopCell;
use crate::metrics::CONNECTIONS_ACTIVE;
use crate::workers::{LoopThreadPool, ThreadInitCallback};

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PortReuse {
    #[default]
    Disabled,
    Enabled,
}

impl std::fmt::Display for PortReuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortReuse::Disabled => write!(f, "no-reuse"),
            PortReuse::Enabled => write!(f, "reuse"),
        }
    }
}

impl std::str::FromStr for PortReuse {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reuse" | "enabled" | "on" => Ok(PortReuse::Enabled),
            "no-reuse" | "disabled" | "off" => Ok(PortReuse::Disabled),
            _ => Err(format!("unknown port-reuse option: {}", s)),
        }
    }
}

struct Inner {
    pool: LoopThreadPool,
    connections: HashMap<String, ConnectionRef>,
    next_conn_id: u64,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    high_water_mark: usize,
    thread_init_cb: Option<ThreadInitCallback>,
}

/// Multi-reactor TCP server.
///
/// Construct on the accept loop's thread, configure callbacks and the I/O
/// thread count, then `start()`. New connections are assigned to I/O loops
/// round-robin and stay there for life; the registry maps connection names
/// to live connections and is touched only on the accept loop.
pub struct TcpServer {
    accept_loop: EventLoop,
    name: String,
    ip_port: String,
    started: AtomicBool,
    self_weak: Weak<TcpServer>,
    acceptor: Arc<Acceptor>,
    inner: LoopCell<Inner>,
}

impl TcpServer {
    /// Create a server listening on `listen_addr`. Must be called on
    /// `accept_loop`'s thread; socket setup failures are fatal.
    pub fn new(
        accept_loop: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: PortReuse,
    ) -> Arc<Self> {
        let name = name.into();
        let acceptor = Acceptor::new(accept_loop, listen_addr, option == PortReuse::Enabled);

        let server = Arc::new_cyclic(|weak: &Weak<TcpServer>| Self {
            accept_loop: accept_loop.clone(),
            ip_port: listen_addr.to_string(),
            started: AtomicBool::new(false),
            self_weak: weak.clone(),
            acceptor,
            inner: LoopCell::new(
                accept_loop.thread_id(),
                Inner {
                    pool: LoopThreadPool::new(accept_loop.clone(), name.clone()),
                    connections: HashMap::new(),
                    next_conn_id: 0,
                    connection_cb: None,
                    message_cb: None,
                    write_complete_cb: None,
                    high_water_mark_cb: None,
                    high_water_mark: DEFAULT_HIGH_WATER_MARK,
                    thread_init_cb: None,
                },
            ),
            name,
        });

        let weak = server.self_weak.clone();
        server.acceptor.set_new_connection_cb(move |socket, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer);
            }
        });
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of I/O loop threads; 0 runs all I/O on the accept loop.
    /// Call before `start()`.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.with(|i| i.pool.set_thread_num(num_threads));
    }

    pub fn set_connection_cb(&self, cb: ConnectionCallback) {
        self.inner.with(|i| i.connection_cb = Some(cb));
    }

    pub fn set_message_cb(&self, cb: MessageCallback) {
        self.inner.with(|i| i.message_cb = Some(cb));
    }

    pub fn set_write_complete_cb(&self, cb: WriteCompleteCallback) {
        self.inner.with(|i| i.write_complete_cb = Some(cb));
    }

    pub fn set_high_water_mark_cb(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.inner.with(|i| {
            i.high_water_mark_cb = Some(cb);
            i.high_water_mark = mark;
        });
    }

    pub fn set_thread_init_cb(&self, cb: ThreadInitCallback) {
        self.inner.with(|i| i.thread_init_cb = Some(cb));
    }

    /// Start the I/O pool and begin listening. Safe to call repeatedly;
    /// only the first call has an effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.with(|i| {
            let init = i.thread_init_cb.clone();
            i.pool.start(init);
        });
        let acceptor = self.acceptor.clone();
        self.accept_loop.run_in_loop(move || acceptor.listen());
        info!(server = %self.name, addr = %self.ip_port, "server started");
    }

    // Runs on the accept loop for every accepted socket.
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        let (conn, io_loop) = self.inner.with(|i| {
            let io_loop = i.pool.next_loop();
            i.next_conn_id += 1;
            let conn_name = format!("{}-{}#{}", self.name, self.ip_port, i.next_conn_id);

            let local_addr = match socket.local_addr() {
                Ok(addr) => addr
                    .as_socket()
                    .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
                Err(err) => {
                    error!(%err, "getsockname failed");
                    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
                }
            };

            info!(
                server = %self.name,
                conn = %conn_name,
                peer = %peer_addr,
                "new connection"
            );

            let weak = self.self_weak.clone();
            let close_cb: CloseCallback = Arc::new(move |conn: &ConnectionRef| {
                if let Some(server) = weak.upgrade() {
                    server.remove_connection(conn);
                }
            });

            let conn = TcpConnection::new(
                io_loop.clone(),
                conn_name.clone(),
                socket,
                local_addr,
                peer_addr,
                Callbacks {
                    connection_cb: i.connection_cb.clone(),
                    message_cb: i.message_cb.clone(),
                    write_complete_cb: i.write_complete_cb.clone(),
                    high_water_mark_cb: i.high_water_mark_cb.clone(),
                    high_water_mark: i.high_water_mark,
                    close_cb: Some(close_cb),
                },
            );
            i.connections.insert(conn_name, conn.clone());
            (conn, io_loop)
        });

        CONNECTIONS_ACTIVE.increment();
        io_loop.run_in_loop(move || conn.connect_established());
    }

    // Installed as every connection's close callback; runs on the
    // connection's I/O loop and hops to the accept loop to erase the
    // registry entry.
    fn remove_connection(&self, conn: &ConnectionRef) {
        let Some(server) = self.self_weak.upgrade() else {
            return;
        };
        let conn = conn.clone();
        self.accept_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &ConnectionRef) {
        info!(server = %self.name, conn = %conn.name(), "removing connection");
        let removed = self.inner.with(|i| i.connections.remove(conn.name()));
        if removed.is_some() {
            CONNECTIONS_ACTIVE.decrement();
        }
        // The scheduled task holds its own strong reference, so dropping the
        // registry entry above cannot destroy the connection early.
        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Orderly teardown needs the accept loop's thread; elsewhere the
        // loops are already gone or the host is exiting.
        if thread::current().id() == self.inner.owner() {
            self.inner.with(|i| {
                for (_, conn) in i.connections.drain() {
                    CONNECTIONS_ACTIVE.decrement();
                    let io_loop = conn.owner_loop().clone();
                    io_loop.run_in_loop(move || conn.connect_destroyed());
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_port_reuse_display() {
        assert_eq!(format!("{}", PortReuse::Enabled), "reuse");
        assert_eq!(format!("{}", PortReuse::Disabled), "no-reuse");
    }

    #[test]
    fn test_port_reuse_from_str() {
        assert_eq!(PortReuse::from_str("reuse").unwrap(), PortReuse::Enabled);
        assert_eq!(PortReuse::from_str("on").unwrap(), PortReuse::Enabled);
        assert_eq!(
            PortReuse::from_str("no-reuse").unwrap(),
            PortReuse::Disabled
        );
        assert_eq!(PortReuse::from_str("off").unwrap(), PortReuse::Disabled);
        assert!(PortReuse::from_str("sometimes").is_err());
    }

    #[test]
    fn test_port_reuse_default() {
        assert_eq!(PortReuse::default(), PortReuse::Disabled);
    }

    #[test]
    fn test_start_is_idempotent() {
        let accept_loop = EventLoop::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(&accept_loop, addr, "test", PortReuse::Disabled);
        assert!(!server.acceptor.listening());

        server.start();
        assert!(server.acceptor.listening());
        server.start();
        server.start();
        assert!(server.acceptor.listening());
        assert!(server.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn test_connection_names_are_unique() {
        let accept_loop = EventLoop::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(&accept_loop, addr, "test", PortReuse::Disabled);
        server.inner.with(|i| {
            i.next_conn_id += 1;
            let first = format!("{}-{}#{}", server.name, server.ip_port, i.next_conn_id);
            i.next_conn_id += 1;
            let second = format!("{}-{}#{}", server.name, server.ip_port, i.next_conn_id);
            assert_ne!(first, second);
        });
    }
}
