//! Level-triggered epoll backend.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::channel::{Channel, Interest, PollState, Ready};
use crate::poller::Poller;

/// Initial size of the ready-event array; doubled whenever a wait saturates it.
const INITIAL_EVENT_SLOTS: usize = 16;

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn ready_from_epoll(events: u32) -> Ready {
    let mut ready = Ready::empty();
    if events & libc::EPOLLIN as u32 != 0 {
        ready |= Ready::READABLE;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        ready |= Ready::PRIORITY;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        ready |= Ready::WRITABLE;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        ready |= Ready::HUP;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        ready |= Ready::ERROR;
    }
    ready
}

/// Readiness backend over level-triggered `epoll(7)`.
///
/// Registrations are level-triggered on purpose: the connection code relies
/// on repeat notification until an fd is drained, so partial reads and
/// writes never need rearming.
pub struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    /// # Panics
    ///
    /// Creating the epoll instance is a setup step; failure is fatal.
    pub fn new() -> Self {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            panic!("epoll_create1 failed: {}", io::Error::last_os_error());
        }
        Self {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_SLOTS],
            channels: HashMap::new(),
        }
    }

    fn fill_active(&self, ready_count: usize, active: &mut Vec<Arc<Channel>>) {
        for event in &self.events[..ready_count] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(ready_from_epoll(event.events));
                active.push(channel.clone());
            }
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, %err, "epoll_ctl del failed");
            } else {
                // A failed add or modify means the channel's registration
                // state no longer matches the kernel; there is no way to
                // keep running correctly.
                panic!("epoll_ctl add/mod failed for fd {}: {}", fd, err);
            }
        }
    }
}

impl Default for EpollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant {
        trace!(fds = self.channels.len(), "entering epoll_wait");

        let ready = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout.as_millis() as libc::c_int,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();

        if ready > 0 {
            trace!(fds = self.channels.len(), ready, "epoll_wait returned");
            self.fill_active(ready as usize, active);
            if ready as usize == self.events.len() {
                self.events.resize(
                    self.events.len() * 2,
                    libc::epoll_event { events: 0, u64: 0 },
                );
            }
        } else if ready == 0 {
            trace!("epoll_wait timed out");
        } else if saved.kind() != io::ErrorKind::Interrupted {
            error!(err = %saved, "epoll_wait failed");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let state = channel.poll_state();
        trace!(fd, interest = ?channel.interest(), ?state, "update channel");

        match state {
            PollState::New | PollState::Deleted => {
                if state == PollState::New {
                    self.channels.insert(fd, channel.clone());
                }
                channel.set_poll_state(PollState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            PollState::Added => {
                if channel.interest().is_empty() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_poll_state(PollState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!(fd, "remove channel");
        self.channels.remove(&fd);
        if channel.poll_state() == PollState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poll_state(PollState::New);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|registered| Arc::ptr_eq(registered, channel))
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}
