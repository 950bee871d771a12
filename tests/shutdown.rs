//! Graceful shutdown ordering and peer-reset teardown.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bellows::{EventLoop, PortReuse, TcpServer};

const PAYLOAD_SIZE: usize = 1024 * 1024;

struct ServerHandle {
    accept_loop: EventLoop,
    thread: JoinHandle<()>,
}

impl ServerHandle {
    fn stop(self) {
        self.accept_loop.quit();
        self.thread.join().unwrap();
    }
}

fn start_server(
    configure: impl FnOnce(&Arc<TcpServer>) + Send + 'static,
) -> (SocketAddr, ServerHandle) {
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let accept_loop = EventLoop::new();
        let server = TcpServer::new(
            &accept_loop,
            "127.0.0.1:0".parse().unwrap(),
            "shutdown-test",
            PortReuse::Disabled,
        );
        server.set_thread_num(1);
        configure(&server);
        server.start();
        tx.send((server.local_addr().unwrap(), accept_loop.clone()))
            .unwrap();
        accept_loop.run();
    });
    let (addr, accept_loop) = rx.recv().unwrap();
    (addr, ServerHandle { accept_loop, thread })
}

fn wait_for(deadline: Instant, mut condition: impl FnMut() -> bool) -> bool {
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn test_graceful_shutdown_delivers_all_bytes_then_eof() {
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let events2 = events.clone();
    let events3 = events.clone();
    let (addr, handle) = start_server(move |server| {
        server.set_write_complete_cb(Arc::new(move |_conn| {
            events2.lock().unwrap().push("write_complete");
        }));
        server.set_connection_cb(Arc::new(move |conn| {
            if conn.connected() {
                conn.send(vec![0x5Au8; PAYLOAD_SIZE]);
                conn.shutdown();
            } else {
                events3.lock().unwrap().push("disconnected");
            }
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Read until EOF; every byte must arrive before the write half closes.
    let mut total = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = client.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        assert!(buf[..n].iter().all(|&b| b == 0x5A));
        total += n;
    }
    assert_eq!(total, PAYLOAD_SIZE);

    // Full close from our side lets the server observe EOF and come down.
    drop(client);

    let deadline = Instant::now() + Duration::from_secs(10);
    assert!(wait_for(deadline, || {
        events.lock().unwrap().contains(&"disconnected")
    }));

    let events = events.lock().unwrap();
    let write_complete = events.iter().position(|&e| e == "write_complete");
    let disconnected = events.iter().position(|&e| e == "disconnected");
    assert!(
        write_complete.is_some(),
        "write-complete must fire after the payload drains"
    );
    assert!(write_complete.unwrap() < disconnected.unwrap());

    handle.stop();
}

#[test]
fn test_peer_reset_tears_the_connection_down() {
    let transitions = Arc::new(AtomicUsize::new(0));
    let messages = Arc::new(AtomicUsize::new(0));

    let (transitions2, messages2) = (transitions.clone(), messages.clone());
    let (addr, handle) = start_server(move |server| {
        server.set_connection_cb(Arc::new(move |_conn| {
            transitions2.fetch_add(1, Ordering::AcqRel);
        }));
        server.set_message_cb(Arc::new(move |conn, input, _when| {
            messages2.fetch_add(1, Ordering::AcqRel);
            let bytes = input.retrieve_all_as_bytes();
            conn.send(&bytes);
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"mid-stream").unwrap();

    // Let the echo land in our receive buffer, then close without reading
    // it: the kernel answers with RST instead of FIN.
    thread::sleep(Duration::from_millis(200));
    drop(client);

    let deadline = Instant::now() + Duration::from_secs(10);
    assert!(
        wait_for(deadline, || transitions.load(Ordering::Acquire) == 2),
        "reset peer must drive the connection to Disconnected"
    );

    // No further callbacks once down.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transitions.load(Ordering::Acquire), 2);
    assert_eq!(messages.load(Ordering::Acquire), 1);

    handle.stop();
}
