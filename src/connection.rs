//! Per-connection state machine over buffered, callback-driven I/O.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use socket2::Socket;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::local::LoopCell;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT};

/// Output-buffer size above which the high-water-mark callback fires.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Shared handle to a connection.
pub type ConnectionRef = Arc<TcpConnection>;
/// Invoked on transitions into `Connected` and into `Disconnected`.
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked with the input buffer when bytes arrive; the handler retrieves
/// what it consumes.
pub type MessageCallback = Arc<dyn Fn(&ConnectionRef, &mut Buffer, Instant) + Send + Sync>;
/// Invoked after the output buffer drains to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked once per upward crossing of the high-water mark with the output
/// buffer size at that moment.
pub type HighWaterMarkCallback = Arc<dyn Fn(&ConnectionRef, usize) + Send + Sync>;
/// Server-installed: removes the connection from the registry.
pub(crate) type CloseCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Callback set copied into a connection at construction.
pub(crate) struct Callbacks {
    pub(crate) connection_cb: Option<ConnectionCallback>,
    pub(crate) message_cb: Option<MessageCallback>,
    pub(crate) write_complete_cb: Option<WriteCompleteCallback>,
    pub(crate) high_water_mark_cb: Option<HighWaterMarkCallback>,
    pub(crate) high_water_mark: usize,
    pub(crate) close_cb: Option<CloseCallback>,
}

struct Inner {
    socket: Socket,
    channel: Arc<Channel>,
    output: Buffer,
    high_water_mark: usize,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<CloseCallback>,
}

/// One accepted TCP connection, bound to a single I/O loop for life.
///
/// `send` and `shutdown` are safe from any thread; they hop onto the owning
/// loop when needed. All buffer and channel state is loop-thread-only. The
/// server registry holds one strong reference; in-flight tasks and callback
/// dispatch hold their own, so the fd closes only after the last observer
/// is done.
pub struct TcpConnection {
    event_loop: EventLoop,
    name: String,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    self_weak: Weak<TcpConnection>,
    input: LoopCell<Buffer>,
    inner: LoopCell<Inner>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: EventLoop,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        callbacks: Callbacks,
    ) -> ConnectionRef {
        if let Err(err) = socket.set_keepalive(true) {
            warn!(name = %name, %err, "set_keepalive failed");
        }
        let fd = socket.as_raw_fd();
        let channel = Channel::new(&event_loop, fd);
        let owner = event_loop.thread_id();

        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| Self {
            event_loop,
            name,
            fd,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            self_weak: weak.clone(),
            input: LoopCell::new(owner, Buffer::new()),
            inner: LoopCell::new(
                owner,
                Inner {
                    socket,
                    channel,
                    output: Buffer::new(),
                    high_water_mark: callbacks.high_water_mark,
                    connection_cb: callbacks.connection_cb,
                    message_cb: callbacks.message_cb,
                    write_complete_cb: callbacks.write_complete_cb,
                    high_water_mark_cb: callbacks.high_water_mark_cb,
                    close_cb: callbacks.close_cb,
                },
            ),
        });
        debug!(name = %conn.name, fd, "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn owner_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Send `data` to the peer. Runs inline when called on the owning loop's
    /// thread; otherwise the bytes are copied and the write is scheduled
    /// there. Dropped silently unless the connection is `Connected`.
    pub fn send(&self, data: impl AsRef<[u8]>) {
        if self.state() != ConnState::Connected {
            return;
        }
        let data = data.as_ref();
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(this) = self.self_weak.upgrade() {
            let owned = data.to_vec();
            self.event_loop.run_in_loop(move || this.send_in_loop(&owned));
        }
    }

    /// Close the write half once the output buffer drains.
    pub fn shutdown(&self) {
        let transitioned = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if transitioned.is_ok()
            && let Some(this) = self.self_weak.upgrade()
        {
            self.event_loop.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            warn!(
                name = %self.name,
                bytes = data.len(),
                "already disconnected, dropping write"
            );
            return;
        }

        let mut written = 0;
        let mut fault = false;
        let mut notify_write_complete = false;
        let mut high_water: Option<usize> = None;

        self.inner.with(|i| {
            // Nothing queued and writability not armed: try the socket
            // directly before falling back to the output buffer.
            if !i.channel.is_writing() && i.output.readable_bytes() == 0 {
                match i.socket.send(data) {
                    Ok(n) => {
                        written = n;
                        BYTES_SENT.add(n as u64);
                        if written == data.len() && i.write_complete_cb.is_some() {
                            notify_write_complete = true;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        error!(name = %self.name, %err, "direct write failed");
                        if matches!(
                            err.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) {
                            fault = true;
                        }
                    }
                }
            }

            if !fault && written < data.len() {
                let remaining = data.len() - written;
                let old_len = i.output.readable_bytes();
                if old_len < i.high_water_mark
                    && old_len + remaining >= i.high_water_mark
                    && i.high_water_mark_cb.is_some()
                {
                    high_water = Some(old_len + remaining);
                }
                i.output.append(&data[written..]);
                if !i.channel.is_writing() {
                    i.channel.enable_writing();
                }
            }
        });

        if notify_write_complete {
            self.queue_write_complete();
        }
        if let Some(size) = high_water {
            self.queue_high_water_mark(size);
        }
    }

    fn shutdown_in_loop(&self) {
        self.inner.with(|i| {
            if !i.channel.is_writing()
                && let Err(err) = i.socket.shutdown(std::net::Shutdown::Write)
            {
                error!(name = %self.name, %err, "shutdown of write half failed");
            }
        });
    }

    fn handle_read(&self, receive_time: Instant) {
        let result = self.input.with(|input| input.read_from_fd(self.fd));
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                trace!(name = %self.name, bytes = n, "read");
                let cb = self.inner.with(|i| i.message_cb.clone());
                if let (Some(cb), Some(this)) = (cb, self.self_weak.upgrade()) {
                    self.input.with(|input| cb(&this, input, receive_time));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!(name = %self.name, %err, "read failed");
                self.handle_error();
                // A reset peer never produces a clean EOF; route it through
                // the close path so the connection does not linger.
                if err.kind() == io::ErrorKind::ConnectionReset {
                    self.handle_close();
                }
            }
        }
    }

    fn handle_write(&self) {
        let is_writing = self.inner.with(|i| i.channel.is_writing());
        if !is_writing {
            error!(fd = self.fd, "connection is down, no more writing");
            return;
        }

        let mut drained = false;
        self.inner.with(|i| match i.output.write_to_fd(self.fd) {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                i.output.retrieve(n);
                if i.output.readable_bytes() == 0 {
                    i.channel.disable_writing();
                    drained = true;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!(name = %self.name, %err, "write failed");
            }
        });

        if drained {
            self.queue_write_complete();
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(&self) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        info!(name = %self.name, fd = self.fd, state = ?self.state(), "connection closing");
        self.set_state(ConnState::Disconnected);
        self.inner.with(|i| i.channel.disable_all());

        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let (connection_cb, close_cb) = self
            .inner
            .with(|i| (i.connection_cb.clone(), i.close_cb.clone()));
        if let Some(cb) = connection_cb {
            cb(&this);
        }
        if let Some(cb) = close_cb {
            cb(&this);
        }
    }

    fn handle_error(&self) {
        match self.inner.with(|i| i.socket.take_error()) {
            Ok(Some(err)) => error!(name = %self.name, %err, "socket error"),
            Ok(None) => error!(name = %self.name, "error event without SO_ERROR"),
            Err(err) => error!(name = %self.name, %err, "reading SO_ERROR failed"),
        }
    }

    /// First thing run on the I/O loop after the server installs the
    /// connection: wire the channel to this connection, tie it, start
    /// reading, and announce the `Connected` transition.
    pub(crate) fn connect_established(&self) {
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        let channel = self.inner.with(|i| i.channel.clone());
        {
            let weak = self.self_weak.clone();
            channel.set_read_cb(move |t| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(t);
                }
            });
        }
        {
            let weak = self.self_weak.clone();
            channel.set_write_cb(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
        }
        {
            let weak = self.self_weak.clone();
            channel.set_close_cb(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
        {
            let weak = self.self_weak.clone();
            channel.set_error_cb(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });
        }

        if let Some(this) = self.self_weak.upgrade() {
            let tie: Arc<dyn Any + Send + Sync> = this.clone();
            channel.tie(&tie);
            channel.enable_reading();

            let cb = self.inner.with(|i| i.connection_cb.clone());
            if let Some(cb) = cb {
                cb(&this);
            }
        }
    }

    /// Final teardown, run exactly once on the I/O loop after the registry
    /// entry is gone. Covers the path where the server shuts down while the
    /// connection is still `Connected`.
    pub(crate) fn connect_destroyed(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.inner.with(|i| i.channel.disable_all());
            let cb = self.inner.with(|i| i.connection_cb.clone());
            if let (Some(cb), Some(this)) = (cb, self.self_weak.upgrade()) {
                cb(&this);
            }
        }
        self.inner.with(|i| i.channel.remove());
    }

    fn queue_write_complete(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let cb = self.inner.with(|i| i.write_complete_cb.clone());
        if let Some(cb) = cb {
            self.event_loop.queue_in_loop(move || cb(&this));
        }
    }

    fn queue_high_water_mark(&self, size: usize) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let cb = self.inner.with(|i| i.high_water_mark_cb.clone());
        if let Some(cb) = cb {
            self.event_loop.queue_in_loop(move || cb(&this, size));
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, fd = self.fd, state = ?self.state(), "connection destroyed");
    }
}
