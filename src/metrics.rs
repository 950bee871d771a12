//! Reactor metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "bytes_received",
    description = "Total bytes read off connection sockets"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "bytes_sent",
    description = "Total bytes written to connection sockets"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups delivered via the self-pipe"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();
