//! Readiness-notification interface and backend selection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::channel::Channel;
use crate::epoll::EpollPoller;

/// Environment variable consulted when constructing the default poller.
pub const POLLER_ENV: &str = "BELLOWS_POLLER";

/// Readiness backend contract.
///
/// A poller owns the registration map from fd to channel and the kernel
/// interest set behind it. It is driven exclusively from its loop's thread.
pub trait Poller: Send {
    /// Block up to `timeout` and collect the channels whose ready mask was
    /// set by this wait. Returns the receive timestamp. An interrupted wait
    /// collects nothing.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Install or refresh `channel`'s interest set.
    ///
    /// A `New` channel enters the registration map and the kernel set. An
    /// `Added` channel with no remaining interest leaves the kernel set but
    /// stays in the map as `Deleted`; otherwise its registration is modified.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Erase `channel` from the registration map, removing it from the
    /// kernel set if it was still there.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    /// Whether `channel` is in this poller's registration map.
    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

/// Selectable poller backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PollerKind {
    /// Level-triggered epoll.
    #[default]
    Epoll,
}

impl std::fmt::Display for PollerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollerKind::Epoll => write!(f, "epoll"),
        }
    }
}

impl std::str::FromStr for PollerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "epoll" | "level-triggered" | "lt" => Ok(PollerKind::Epoll),
            _ => Err(format!("unknown poller backend: {}", s)),
        }
    }
}

/// Construct the poller named by [`POLLER_ENV`], falling back to the
/// level-triggered epoll backend.
pub fn new_default_poller() -> Box<dyn Poller> {
    let kind = match std::env::var(POLLER_ENV) {
        Ok(value) => match value.parse::<PollerKind>() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(%err, "ignoring {}", POLLER_ENV);
                PollerKind::default()
            }
        },
        Err(_) => PollerKind::default(),
    };
    match kind {
        PollerKind::Epoll => Box::new(EpollPoller::new()),
    }
}
