//! Listening-socket wrapper living on the accept loop.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::thread;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::local::LoopCell;
use crate::metrics::CONNECTIONS_ACCEPTED;

/// Invoked on the accept loop for every accepted socket.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

struct Inner {
    socket: Socket,
    channel: Arc<Channel>,
    new_connection_cb: Option<NewConnectionCallback>,
    listening: bool,
}

/// Owns the listening socket and its read channel on the accept loop.
///
/// Socket creation and bind happen at construction; `listen()` starts the
/// kernel listen and enables read interest. On readability, accepts until
/// the backlog is drained and hands each socket to the new-connection
/// callback (or closes it when none is installed).
pub struct Acceptor {
    self_weak: Weak<Acceptor>,
    inner: LoopCell<Inner>,
}

impl Acceptor {
    /// Build the listening socket. Must be called on `event_loop`'s thread.
    ///
    /// # Panics
    ///
    /// Socket creation, option setup, and bind are setup steps; failure is
    /// fatal.
    pub fn new(event_loop: &EventLoop, listen_addr: SocketAddr, reuse_port: bool) -> Arc<Self> {
        let domain = Domain::for_address(listen_addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .unwrap_or_else(|err| panic!("listen socket create failed: {}", err));
        socket
            .set_nonblocking(true)
            .unwrap_or_else(|err| panic!("set_nonblocking failed: {}", err));
        socket
            .set_reuse_address(true)
            .unwrap_or_else(|err| panic!("set_reuse_address failed: {}", err));
        if reuse_port {
            socket
                .set_reuse_port(true)
                .unwrap_or_else(|err| panic!("set_reuse_port failed: {}", err));
        }
        socket
            .bind(&listen_addr.into())
            .unwrap_or_else(|err| panic!("bind {} failed: {}", listen_addr, err));

        let channel = Channel::new(event_loop, socket.as_raw_fd());
        let acceptor = Arc::new_cyclic(|weak: &Weak<Acceptor>| Self {
            self_weak: weak.clone(),
            inner: LoopCell::new(
                event_loop.thread_id(),
                Inner {
                    socket,
                    channel,
                    new_connection_cb: None,
                    listening: false,
                },
            ),
        });

        let weak = acceptor.self_weak.clone();
        let channel = acceptor.inner.with(|i| i.channel.clone());
        channel.set_read_cb(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        debug!(addr = %listen_addr, reuse_port, "acceptor created");
        acceptor
    }

    pub fn set_new_connection_cb(&self, cb: impl FnMut(Socket, SocketAddr) + Send + 'static) {
        self.inner.with(|i| i.new_connection_cb = Some(Box::new(cb)));
    }

    pub fn listening(&self) -> bool {
        self.inner.with(|i| i.listening)
    }

    /// The bound address, once known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .with(|i| i.socket.local_addr().ok().and_then(|addr| addr.as_socket()))
    }

    /// Start the kernel listen and enable read interest.
    pub fn listen(&self) {
        let channel = self.inner.with(|i| {
            i.listening = true;
            i.socket
                .listen(libc::SOMAXCONN)
                .unwrap_or_else(|err| panic!("listen failed: {}", err));
            i.channel.clone()
        });
        channel.enable_reading();
    }

    fn handle_read(&self) {
        loop {
            let accepted = self.inner.with(|i| i.socket.accept());
            match accepted {
                Ok((socket, addr)) => {
                    if let Err(err) = socket.set_nonblocking(true) {
                        error!(%err, "set_nonblocking on accepted socket failed");
                        continue;
                    }
                    let peer = addr
                        .as_socket()
                        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                    CONNECTIONS_ACCEPTED.increment();

                    // The callback is taken out of the slot for the call so
                    // it may re-enter acceptor state.
                    let cb = self.inner.with(|i| i.new_connection_cb.take());
                    match cb {
                        Some(mut f) => {
                            f(socket, peer);
                            self.inner.with(|i| {
                                if i.new_connection_cb.is_none() {
                                    i.new_connection_cb = Some(f);
                                }
                            });
                        }
                        None => drop(socket),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    if err.raw_os_error() == Some(libc::EMFILE) {
                        error!("accept failed: process out of file descriptors (EMFILE)");
                    } else {
                        error!(%err, "accept failed");
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Orderly channel teardown is only possible on the accept loop's
        // thread; the server drops the acceptor there.
        if thread::current().id() == self.inner.owner() {
            self.inner.with(|i| {
                i.channel.disable_all();
                i.channel.remove();
            });
        }
    }
}
