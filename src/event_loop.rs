//! Single-threaded event loop with a cross-thread task queue.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, error};

use crate::channel::Channel;
use crate::local::LoopCell;
use crate::metrics::LOOP_WAKEUPS;
use crate::poller::{Poller, new_default_poller};

/// Default readiness-wait timeout.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

struct Core {
    poller: Box<dyn Poller>,
    wakeup_channel: Option<Arc<Channel>>,
}

struct Shared {
    thread_id: ThreadId,
    looping: AtomicBool,
    quitting: AtomicBool,
    calling_pending: AtomicBool,
    pending: Mutex<Vec<Task>>,
    wakeup_fd: RawFd,
    core: LoopCell<Core>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe { libc::close(self.wakeup_fd) };
        if thread::current().id() == self.thread_id {
            LOOP_IN_THIS_THREAD.with(|marker| marker.set(false));
        }
    }
}

/// Handle to a single-threaded event loop.
///
/// The loop itself only ever executes on the thread that constructed it;
/// the handle is cheap to clone and may be used from any thread to enqueue
/// work ([`run_in_loop`](EventLoop::run_in_loop) /
/// [`queue_in_loop`](EventLoop::queue_in_loop)) or to ask the loop to stop.
/// Channel registration is loop-thread-only.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

/// Non-owning loop handle, used where a strong handle would form a cycle
/// (the loop's own wakeup channel, channels generally).
#[derive(Clone)]
pub(crate) struct WeakLoop {
    shared: Weak<Shared>,
}

impl WeakLoop {
    pub(crate) fn upgrade(&self) -> Option<EventLoop> {
        self.shared.upgrade().map(|shared| EventLoop { shared })
    }
}

impl EventLoop {
    /// Create a loop owned by the current thread.
    ///
    /// # Panics
    ///
    /// At most one loop may exist per thread; a second construction is fatal,
    /// as is failure to create the wakeup eventfd.
    pub fn new() -> Self {
        LOOP_IN_THIS_THREAD.with(|marker| {
            assert!(
                !marker.get(),
                "another EventLoop already exists in this thread"
            );
            marker.set(true);
        });

        let thread_id = thread::current().id();
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            panic!("eventfd failed: {}", io::Error::last_os_error());
        }

        let event_loop = EventLoop {
            shared: Arc::new(Shared {
                thread_id,
                looping: AtomicBool::new(false),
                quitting: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                wakeup_fd,
                core: LoopCell::new(
                    thread_id,
                    Core {
                        poller: new_default_poller(),
                        wakeup_channel: None,
                    },
                ),
            }),
        };

        let wakeup_channel = Channel::new(&event_loop, wakeup_fd);
        wakeup_channel.set_read_cb(move |_| {
            let mut value: u64 = 0;
            let n = unsafe {
                libc::read(
                    wakeup_fd,
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if n != 8 {
                error!(n, "wakeup read returned unexpected size");
            }
        });
        wakeup_channel.enable_reading();
        event_loop
            .shared
            .core
            .with(|core| core.wakeup_channel = Some(wakeup_channel));

        debug!(?thread_id, "event loop created");
        event_loop
    }

    /// Run the loop until [`quit`](EventLoop::quit).
    ///
    /// Each iteration waits for readiness, dispatches every ready channel,
    /// then drains the pending-task queue.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "run() called off the loop's owning thread"
        );
        self.shared.looping.store(true, Ordering::Release);
        debug!("event loop running");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.shared.quitting.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self
                .shared
                .core
                .with(|core| core.poller.poll(POLL_TIMEOUT, &mut active));
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.do_pending_tasks();
        }

        debug!("event loop stopped");
        self.shared.looping.store(false, Ordering::Release);
    }

    /// Ask the loop to stop after its current iteration.
    pub fn quit(&self) {
        self.shared.quitting.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: inline when already there, queued
    /// otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Append `task` to the pending queue. The loop is woken when the caller
    /// is another thread, or when the loop is currently draining its queue;
    /// otherwise a task queued during the drain could sit until the next
    /// natural wakeup.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    pub(crate) fn downgrade(&self) -> WeakLoop {
        WeakLoop {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Forward to the multiplexer. Loop-thread only.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.shared
            .core
            .with(|core| core.poller.update_channel(channel));
    }

    /// Forward to the multiplexer. Loop-thread only.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.shared
            .core
            .with(|core| core.poller.remove_channel(channel));
    }

    /// Forward to the multiplexer. Loop-thread only.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.shared
            .core
            .with(|core| core.poller.has_channel(channel))
    }

    fn wakeup(&self) {
        LOOP_WAKEUPS.increment();
        let value: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != 8 {
            error!(n, "wakeup write returned unexpected size");
        }
    }

    // The queue is swapped out under the mutex so tasks can enqueue more
    // tasks without deadlocking on it.
    fn do_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_run_in_loop_inline_on_owner_thread() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop.run_in_loop(move || flag.store(true, Ordering::Release));
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_second_loop_in_same_thread_panics() {
        let result = thread::spawn(|| {
            let _first = EventLoop::new();
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _second = EventLoop::new();
            }))
            .is_err()
        })
        .join()
        .unwrap();
        assert!(result);
    }

    #[test]
    fn test_loop_marker_cleared_after_drop() {
        thread::spawn(|| {
            drop(EventLoop::new());
            // A fresh loop on the same thread is fine once the first is gone.
            drop(EventLoop::new());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_cross_thread_tasks_run_in_fifo_order() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        let event_loop = rx.recv().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = order.clone();
            event_loop.queue_in_loop(move || order.lock().unwrap().push(i));
        }
        let (done_tx, done_rx) = mpsc::channel();
        event_loop.queue_in_loop(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());

        event_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_task_queued_during_drain_still_runs() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        let event_loop = rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let inner_loop = event_loop.clone();
        event_loop.queue_in_loop(move || {
            // Queued while the loop is draining; the wakeup rule guarantees
            // it is picked up on the next iteration rather than lost.
            let done_tx = done_tx.clone();
            inner_loop.queue_in_loop(move || done_tx.send(()).unwrap());
        });
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        event_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_quit_from_other_thread_unblocks_poll() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        let event_loop = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(event_loop.is_looping());
        event_loop.quit();
        handle.join().unwrap();
        assert!(!event_loop.is_looping());
    }

    #[test]
    fn test_channel_read_dispatch() {
        let event_loop = EventLoop::new();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let hits = Arc::new(AtomicUsize::new(0));
        let channel = Channel::new(&event_loop, read_fd);
        {
            let hits = hits.clone();
            let event_loop = event_loop.clone();
            channel.set_read_cb(move |_| {
                let mut buf = [0u8; 16];
                unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                hits.fetch_add(1, Ordering::AcqRel);
                event_loop.quit();
            });
        }
        channel.enable_reading();
        assert!(event_loop.has_channel(&channel));

        let n = unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        event_loop.run();
        assert_eq!(hits.load(Ordering::Acquire), 1);

        channel.disable_all();
        channel.remove();
        assert!(!event_loop.has_channel(&channel));
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
