//! I/O loop thread pool with round-robin dispatch.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::event_loop::EventLoop;

/// Callback run on each I/O loop thread after its loop is constructed and
/// before it starts polling. With zero threads it runs on the base loop.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// Owns the I/O loop threads and hands out loops round-robin.
///
/// With zero threads the base loop (the accept loop) serves all I/O itself.
/// Dropping the pool quits every loop and joins its thread.
pub struct LoopThreadPool {
    base_loop: EventLoop,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    loops: Vec<EventLoop>,
    handles: Vec<JoinHandle<()>>,
}

impl LoopThreadPool {
    pub fn new(base_loop: EventLoop, name: impl Into<String>) -> Self {
        Self {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            loops: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Number of I/O loop threads to start. 0 keeps all I/O on the base loop.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the I/O threads, each running one freshly constructed loop.
    /// Each thread hands its loop handle back before entering `run()`.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        if self.started {
            return;
        }
        self.started = true;

        for index in 0..self.num_threads {
            let thread_name = format!("{}-io-{}", self.name, index);
            let init = init.clone();
            let (tx, rx) = crossbeam_channel::bounded(1);

            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let event_loop = EventLoop::new();
                    if let Some(init) = &init {
                        init(&event_loop);
                    }
                    let _ = tx.send(event_loop.clone());
                    event_loop.run();
                })
                .expect("failed to spawn io loop thread");

            let event_loop = rx.recv().expect("io loop thread died during startup");
            self.loops.push(event_loop);
            self.handles.push(handle);
        }

        if self.num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base_loop);
            }
        }
        debug!(name = %self.name, threads = self.num_threads, "loop pool started");
    }

    /// Pick the loop for the next connection, round-robin. Falls back to the
    /// base loop when the pool has no threads of its own.
    pub fn next_loop(&mut self) -> EventLoop {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let chosen = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        chosen
    }

    pub fn started(&self) -> bool {
        self.started
    }
}

impl Drop for LoopThreadPool {
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.quit();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
