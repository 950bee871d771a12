use std::sync::Arc;

use bellows::{EventLoop, PortReuse, TcpServer};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let addr = bind_addr.parse().expect("invalid listen address");

    let accept_loop = EventLoop::new();
    let server = TcpServer::new(&accept_loop, addr, "echo", PortReuse::Disabled);
    server.set_thread_num(4);

    server.set_connection_cb(Arc::new(|conn| {
        if conn.connected() {
            eprintln!("{} up from {}", conn.name(), conn.peer_addr());
        } else {
            eprintln!("{} down", conn.name());
        }
    }));
    server.set_message_cb(Arc::new(|conn, input, _when| {
        let bytes = input.retrieve_all_as_bytes();
        conn.send(&bytes);
    }));

    eprintln!("echo server listening on {bind_addr}");
    server.start();
    accept_loop.run();
}
