//! Integration tests: real loopback sockets driven by event pollers.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use mediastream::error::{Error, SockError};
use mediastream::poller::{EventPoller, EventPollerPool};
use mediastream::transport::{SockInfo, Socket};

const WAIT: Duration = Duration::from_secs(5);

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn connect(poller: &Arc<EventPoller>, addr: SocketAddr) -> Arc<Socket> {
    let sock = Socket::new(poller.clone());
    let (tx, rx) = mpsc::channel();
    sock.connect(
        &addr.ip().to_string(),
        addr.port(),
        move |res| {
            let _ = tx.send(res);
        },
        5.0,
        "0.0.0.0",
        0,
    );
    rx.recv_timeout(WAIT).expect("connect callback").expect("connected");
    sock
}

/// A listener whose accepted children append everything they read to `received`.
fn collecting_listener(
    poller: &Arc<EventPoller>,
) -> (Arc<Socket>, Arc<Mutex<Vec<Arc<Socket>>>>, Arc<Mutex<Vec<u8>>>) {
    let listener = Socket::new(poller.clone());
    let children = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));

    let kept = children.clone();
    let sink = received.clone();
    listener.set_on_accept(move |child| {
        let sink = sink.clone();
        child.set_on_read(move |data, _| sink.lock().extend_from_slice(data));
        kept.lock().push(child);
    });
    listener.listen(0, "127.0.0.1", 1024).unwrap();
    (listener, children, received)
}

#[test]
fn tcp_send_arrives_in_order() {
    let pool = EventPollerPool::new(2).unwrap();
    let (listener, _children, received) = collecting_listener(&pool.pollers()[0]);
    let addr = listener.local_addr().unwrap();

    let client = connect(&pool.pollers()[1], addr);
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(1500) {
        assert_eq!(client.send_bytes(chunk).unwrap(), chunk.len());
    }

    assert!(wait_for(WAIT, || received.lock().len() >= payload.len()));
    assert_eq!(*received.lock(), payload);
}

#[test]
fn busy_until_peer_drains() {
    let poller = EventPoller::spawn("busy-test").unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = connect(&poller, server.local_addr().unwrap());
    let (mut peer, _) = server.accept().unwrap();

    let flushes = Arc::new(AtomicUsize::new(0));
    let counter = flushes.clone();
    client.set_on_flush(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    });

    let chunk = Bytes::from(vec![0xA5u8; 1024 * 1024]);
    for _ in 0..32 {
        client.send(chunk.clone(), None, false).unwrap();
    }
    assert!(!client.is_socket_busy());
    client.flush_all();

    assert!(wait_for(WAIT, || client.is_socket_busy()));
    assert_eq!(flushes.load(Ordering::SeqCst), 0);
    assert!(client.send_buffer_count() > 0);

    let reader = thread::spawn(move || {
        let mut total = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        while total < 32 * 1024 * 1024 {
            match peer.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        total
    });

    assert!(wait_for(WAIT, || !client.is_socket_busy()));
    assert_eq!(reader.join().unwrap(), 32 * 1024 * 1024);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(client.send_buffer_count(), 0);

    drop(client);
    poller.shutdown();
}

#[test]
fn stalled_send_times_out() {
    let poller = EventPoller::spawn("stall-test").unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = connect(&poller, server.local_addr().unwrap());
    let (_peer, _) = server.accept().unwrap();

    let (tx, rx) = mpsc::channel();
    client.set_on_err(move |err| {
        let _ = tx.send(err.clone());
    });
    client.set_send_timeout_second(1);

    let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
    for _ in 0..32 {
        client.send(chunk.clone(), None, true).unwrap();
    }

    let err = rx.recv_timeout(WAIT).expect("send timeout");
    assert!(matches!(err, SockError::Timeout(_)), "got {err:?}");
    assert!(client.raw_fd().is_none());
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    drop(client);
    poller.shutdown();
}

#[test]
fn peer_close_reports_end_of_stream() {
    let poller = EventPoller::spawn("eof-test").unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = connect(&poller, server.local_addr().unwrap());
    let (tx, rx) = mpsc::channel();
    client.set_on_err(move |err| {
        let _ = tx.send(err.clone());
    });

    let (peer, _) = server.accept().unwrap();
    drop(peer);

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockError::EndOfStream);
    drop(client);
    poller.shutdown();
}

#[test]
fn emit_err_fires_once() {
    let poller = EventPoller::spawn("emit-test").unwrap();
    let sock = Socket::new(poller.clone());
    sock.bind_udp_sock(0, "127.0.0.1").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    sock.set_on_err(move |err| {
        assert_eq!(err.code(), mediastream::ErrCode::Shutdown);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(sock.emit_err(SockError::Shutdown("test".into())));
    assert!(!sock.emit_err(SockError::Shutdown("again".into())));
    assert!(wait_for(WAIT, || calls.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(sock.send_bytes(b"x"), Err(Error::NoSocket)));

    drop(sock);
    poller.shutdown();
}

#[test]
fn connect_refused_reported_once() {
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let poller = EventPoller::spawn("refused-test").unwrap();
    let sock = Socket::new(poller.clone());
    let (tx, rx) = mpsc::channel();
    sock.connect(
        "127.0.0.1",
        port,
        move |res| {
            let _ = tx.send(res);
        },
        5.0,
        "0.0.0.0",
        0,
    );

    let res = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(res, Err(SockError::ConnectionRefused(_))), "got {res:?}");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(sock.raw_fd().is_none());

    drop(sock);
    poller.shutdown();
}

#[test]
fn second_connect_supersedes_first() {
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let poller = EventPoller::spawn("supersede-test").unwrap();
    let sock = Socket::new(poller.clone());

    let (tx, rx) = mpsc::channel();
    let first = tx.clone();
    // Issue both attempts from the loop so the first is replaced before it completes.
    let target = sock.clone();
    poller.run_async(
        move || {
            target.connect(
                "127.0.0.1",
                addr.port(),
                move |res| {
                    let _ = first.send(("first", res));
                },
                5.0,
                "0.0.0.0",
                0,
            );
            target.connect(
                "127.0.0.1",
                addr.port(),
                move |res| {
                    let _ = tx.send(("second", res));
                },
                5.0,
                "0.0.0.0",
                0,
            );
        },
        false,
    );

    let (which, res) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(which, "second");
    assert!(res.is_ok());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    drop(sock);
    poller.shutdown();
}

#[test]
fn cloned_listener_accepts_on_second_poller() {
    let pool = EventPollerPool::new(2).unwrap();
    let (listener, _children, received) = collecting_listener(&pool.pollers()[0]);
    let addr = listener.local_addr().unwrap();

    // Same poller: a descriptor is registered at most once per poller.
    let same = Socket::new(pool.pollers()[0].clone());
    assert!(matches!(
        same.clone_from_listen_socket(&listener),
        Err(Error::SamePoller)
    ));

    let clone = Socket::new(pool.pollers()[1].clone());
    let accepted_on = Arc::new(Mutex::new(Vec::new()));
    let names = accepted_on.clone();
    let sink = received.clone();
    let clone_children = Arc::new(Mutex::new(Vec::new()));
    let kept = clone_children.clone();
    clone.set_on_accept(move |child| {
        names.lock().push(child.poller().name().to_string());
        let sink = sink.clone();
        child.set_on_read(move |data, _| sink.lock().extend_from_slice(data));
        kept.lock().push(child);
    });
    clone.clone_from_listen_socket(&listener).unwrap();
    assert!(clone.clone_from_listen_socket(&listener).is_ok());

    // Once the original stops servicing the descriptor, only the clone accepts.
    listener.close_sock();
    assert_eq!(clone.local_addr(), Some(addr));

    let mut stream = TcpStream::connect(addr).unwrap();
    std::io::Write::write_all(&mut stream, b"via clone").unwrap();

    assert!(wait_for(WAIT, || received.lock().len() == 9));
    assert_eq!(&received.lock()[..], b"via clone");
    assert_eq!(*accepted_on.lock(), vec!["event-poller-1".to_string()]);

    let other = Socket::new(pool.pollers()[1].clone());
    other.bind_udp_sock(0, "127.0.0.1").unwrap();
    assert!(matches!(
        other.clone_from_listen_socket(&clone),
        Err(Error::SocketInUse)
    ));
}

#[test]
fn before_accept_pins_child_to_poller() {
    let pool = EventPollerPool::new(2).unwrap();
    let listener = Socket::new(pool.pollers()[0].clone());
    let target = pool.pollers()[1].clone();
    listener.set_on_before_accept(move |_| Some(Socket::new(target.clone())));

    let (tx, rx) = mpsc::channel();
    let children = Arc::new(Mutex::new(Vec::new()));
    let kept = children.clone();
    listener.set_on_accept(move |child| {
        let tx = tx.clone();
        let name = child.poller().name().to_string();
        child.set_on_read(move |data, _| {
            let _ = tx.send((name.clone(), data.to_vec()));
        });
        kept.lock().push(child);
    });
    listener.listen(0, "127.0.0.1", 16).unwrap();

    let mut stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    std::io::Write::write_all(&mut stream, b"ping").unwrap();

    let (name, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(name, "event-poller-1");
    assert_eq!(data, b"ping");
}

#[test]
fn udp_datagram_round_trip() {
    let poller = EventPoller::spawn("udp-test").unwrap();
    let a = Socket::new(poller.clone());
    let b = Socket::new(poller.clone());
    a.bind_udp_sock(0, "127.0.0.1").unwrap();
    b.bind_udp_sock(0, "127.0.0.1").unwrap();

    let (tx, rx) = mpsc::channel();
    b.set_on_read(move |data, from| {
        let _ = tx.send((data.to_vec(), from));
    });

    let dest = b.local_addr().unwrap();
    a.send(Bytes::from_static(b"one"), Some(dest), true).unwrap();
    a.send(Bytes::from_static(b"two"), Some(dest), true).unwrap();

    let (data, from) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data, b"one");
    assert_eq!(Some(from), a.local_addr());
    let (data, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data, b"two");

    drop(a);
    drop(b);
    poller.shutdown();
}

#[test]
fn disabled_recv_holds_data_until_resumed() {
    let poller = EventPoller::spawn("recv-test").unwrap();
    let sock = Socket::new(poller.clone());
    sock.bind_udp_sock(0, "127.0.0.1").unwrap();
    let (tx, rx) = mpsc::channel();
    sock.set_on_read(move |data, _| {
        let _ = tx.send(data.to_vec());
    });

    sock.enable_recv(false);
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender
        .send_to(b"held", sock.local_addr().unwrap())
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    sock.enable_recv(true);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"held");

    drop(sock);
    poller.shutdown();
}

#[test]
fn read_callback_may_pause_and_resume_itself() {
    let poller = EventPoller::spawn("reenter-test").unwrap();
    let sock = Socket::new(poller.clone());
    sock.bind_udp_sock(0, "127.0.0.1").unwrap();

    let (tx, rx) = mpsc::channel();
    let weak = Arc::downgrade(&sock);
    sock.set_on_read(move |data, _| {
        if let Some(sock) = weak.upgrade() {
            sock.enable_recv(false);
            sock.enable_recv(true);
        }
        let _ = tx.send(data.to_vec());
    });

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest = sock.local_addr().unwrap();
    sender.send_to(b"first", dest).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"first");
    sender.send_to(b"second", dest).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"second");

    // The loop thread is still responsive.
    let (done_tx, done_rx) = mpsc::channel();
    poller.run_async(
        move || {
            let _ = done_tx.send(());
        },
        false,
    );
    assert!(done_rx.recv_timeout(WAIT).is_ok());

    drop(sock);
    poller.shutdown();
}

#[test]
fn unresolvable_host_reports_dns_failure() {
    let poller = EventPoller::spawn("dns-test").unwrap();
    let sock = Socket::new(poller.clone());
    let (tx, rx) = mpsc::channel();
    sock.connect(
        "nonexistent.invalid",
        80,
        move |res| {
            let _ = tx.send(res);
        },
        60.0,
        "0.0.0.0",
        0,
    );

    let res = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert!(matches!(res, Err(SockError::Dns(_))), "got {res:?}");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(sock.raw_fd().is_none());

    drop(sock);
    poller.shutdown();
}

#[test]
fn unanswered_connect_times_out() {
    // With a zero backlog the accept queue holds one connection; later
    // handshakes are dropped by the kernel and never complete.
    let raw = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
    raw.bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into()).unwrap();
    raw.listen(0).unwrap();
    let server: TcpListener = raw.into();
    let addr = server.local_addr().unwrap();

    let mut fillers = Vec::new();
    for _ in 0..4 {
        let filler = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        filler.set_nonblocking(true).unwrap();
        let _ = filler.connect(&addr.into());
        fillers.push(filler);
    }
    thread::sleep(Duration::from_millis(100));

    let poller = EventPoller::spawn("timeout-test").unwrap();
    let sock = Socket::new(poller.clone());
    let (tx, rx) = mpsc::channel();
    sock.connect(
        "127.0.0.1",
        addr.port(),
        move |res| {
            let _ = tx.send(res);
        },
        0.5,
        "0.0.0.0",
        0,
    );

    let res = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(res, Err(SockError::Timeout(_))), "got {res:?}");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(sock.raw_fd().is_none());

    drop(sock);
    drop(fillers);
    poller.shutdown();
}

#[test]
fn custom_send_flags_still_deliver() {
    let poller = EventPoller::spawn("flags-test").unwrap();
    let sock = Socket::new(poller.clone());
    sock.bind_udp_sock(0, "127.0.0.1").unwrap();
    sock.set_send_flags(0);

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(WAIT)).unwrap();
    sock.send(Bytes::from_static(b"plain"), Some(receiver.local_addr().unwrap()), true)
        .unwrap();

    let mut buf = [0u8; 16];
    let n = receiver.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"plain");

    drop(sock);
    poller.shutdown();
}
