//! Per-fd binding of an interest set and event callbacks to one loop.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bitflags::bitflags;
use tracing::trace;

use crate::event_loop::{EventLoop, WeakLoop};
use crate::local::LoopCell;

bitflags! {
    /// Events a channel asks the multiplexer to watch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

bitflags! {
    /// Events the multiplexer reported for a channel on the latest wait.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const PRIORITY = 1 << 2;
        const HUP = 1 << 3;
        const ERROR = 1 << 4;
    }
}

/// Registration state of a channel with its multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    /// Never registered, or fully removed.
    New,
    /// In the registration map and the kernel interest set.
    Added,
    /// In the registration map but removed from the kernel interest set.
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Instant) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

struct Inner {
    interest: Interest,
    revents: Ready,
    poll_state: PollState,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

/// One file descriptor's hookup to its owning loop.
///
/// A channel never owns the fd; its owner (acceptor, connection, or the loop
/// itself for the wakeup fd) does, and must remove the channel from the
/// multiplexer before closing it. All mutation happens on the owning loop's
/// thread.
pub struct Channel {
    // Weak so the loop's own wakeup channel does not keep the loop alive.
    event_loop: WeakLoop,
    fd: RawFd,
    self_weak: Weak<Channel>,
    inner: LoopCell<Inner>,
}

impl Channel {
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            event_loop: event_loop.downgrade(),
            fd,
            self_weak: weak.clone(),
            inner: LoopCell::new(
                event_loop.thread_id(),
                Inner {
                    interest: Interest::empty(),
                    revents: Ready::empty(),
                    poll_state: PollState::New,
                    tie: None,
                    read_cb: None,
                    write_cb: None,
                    close_cb: None,
                    error_cb: None,
                },
            ),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_cb(&self, cb: impl FnMut(Instant) + Send + 'static) {
        self.inner.with(|i| i.read_cb = Some(Box::new(cb)));
    }

    pub fn set_write_cb(&self, cb: impl FnMut() + Send + 'static) {
        self.inner.with(|i| i.write_cb = Some(Box::new(cb)));
    }

    pub fn set_close_cb(&self, cb: impl FnMut() + Send + 'static) {
        self.inner.with(|i| i.close_cb = Some(Box::new(cb)));
    }

    pub fn set_error_cb(&self, cb: impl FnMut() + Send + 'static) {
        self.inner.with(|i| i.error_cb = Some(Box::new(cb)));
    }

    /// Keep `owner` alive for the duration of each callback dispatch. If the
    /// upgrade fails at dispatch time, no callback runs.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        self.inner.with(|i| i.tie = Some(Arc::downgrade(owner)));
    }

    pub fn is_reading(&self) -> bool {
        self.inner.with(|i| i.interest.contains(Interest::READABLE))
    }

    pub fn is_writing(&self) -> bool {
        self.inner.with(|i| i.interest.contains(Interest::WRITABLE))
    }

    pub fn enable_reading(&self) {
        self.inner.with(|i| i.interest |= Interest::READABLE);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.with(|i| i.interest -= Interest::READABLE);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.with(|i| i.interest |= Interest::WRITABLE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.with(|i| i.interest -= Interest::WRITABLE);
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.with(|i| i.interest = Interest::empty());
        self.update();
    }

    /// Unregister from the owning loop's multiplexer.
    pub fn remove(&self) {
        if let (Some(this), Some(event_loop)) =
            (self.self_weak.upgrade(), self.event_loop.upgrade())
        {
            event_loop.remove_channel(&this);
        }
    }

    pub(crate) fn interest(&self) -> Interest {
        self.inner.with(|i| i.interest)
    }

    pub(crate) fn poll_state(&self) -> PollState {
        self.inner.with(|i| i.poll_state)
    }

    pub(crate) fn set_poll_state(&self, state: PollState) {
        self.inner.with(|i| i.poll_state = state);
    }

    /// Record the ready mask from the latest wait. Called by the multiplexer.
    pub(crate) fn set_revents(&self, revents: Ready) {
        self.inner.with(|i| i.revents = revents);
    }

    /// Dispatch the callbacks selected by the ready mask.
    ///
    /// Order: peer hangup without pending readable data closes first, then
    /// errors, then reads, then writes. When a tie is installed, the owner is
    /// upgraded for the duration of the dispatch; a dead owner suppresses it.
    pub fn handle_event(&self, receive_time: Instant) {
        let tie = self.inner.with(|i| i.tie.clone());
        match tie {
            Some(tie) => {
                if let Some(_guard) = tie.upgrade() {
                    self.dispatch(receive_time);
                }
            }
            None => self.dispatch(receive_time),
        }
    }

    fn dispatch(&self, receive_time: Instant) {
        let revents = self.inner.with(|i| i.revents);
        trace!(fd = self.fd, ?revents, "channel dispatch");

        if revents.contains(Ready::HUP) && !revents.contains(Ready::READABLE) {
            self.invoke(|i| &mut i.close_cb);
        }
        if revents.contains(Ready::ERROR) {
            self.invoke(|i| &mut i.error_cb);
        }
        if revents.intersects(Ready::READABLE | Ready::PRIORITY) {
            let cb = self.inner.with(|i| i.read_cb.take());
            if let Some(mut f) = cb {
                f(receive_time);
                self.inner.with(|i| {
                    if i.read_cb.is_none() {
                        i.read_cb = Some(f);
                    }
                });
            }
        }
        if revents.contains(Ready::WRITABLE) {
            self.invoke(|i| &mut i.write_cb);
        }
    }

    // Callbacks are taken out of the slot while they run so they can
    // re-enter channel state (enable/disable interest) without tripping the
    // borrow check, then put back unless replaced mid-call.
    fn invoke(&self, slot: impl Fn(&mut Inner) -> &mut Option<EventCallback>) {
        let cb = self.inner.with(|i| slot(i).take());
        if let Some(mut f) = cb {
            f();
            self.inner.with(|i| {
                let s = slot(i);
                if s.is_none() {
                    *s = Some(f);
                }
            });
        }
    }

    fn update(&self) {
        if let (Some(this), Some(event_loop)) =
            (self.self_weak.upgrade(), self.event_loop.upgrade())
        {
            event_loop.update_channel(&this);
        }
    }
}
