//! Reactor integration tests
//!
//! Run with: cargo test --test reactor_test -- --nocapture
//!
//! Each test pairs the reactor with plain std sockets acting as the remote
//! peer, so every assertion runs against real kernel socket behavior on the
//! loopback interface.

use groundwork::{
    Error, IoBuffer, IoCallback, IoEvent, OpenFlags, Reactor, ReactorConfig, alloc_site,
};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};
use std::time::{Duration, Instant};

/// Flattened events for assertions.
#[derive(Debug)]
enum Ev {
    Connect(Result<(), Error>),
    Accept(groundwork::ConnHandle),
    Read(Result<Vec<u8>, Error>),
    Write(Result<(), Error>),
    PeerGone(Error),
}

fn channel_callback() -> (IoCallback, Receiver<Ev>) {
    let (tx, rx) = channel();
    let callback: IoCallback = Arc::new(move |_handle, event| {
        let flattened = match event {
            IoEvent::Connect(result) => Ev::Connect(result),
            IoEvent::Accept(handle) => Ev::Accept(handle),
            IoEvent::Read(buffer) => {
                Ev::Read(buffer.result().map(|_| buffer.as_slice().to_vec()))
            }
            IoEvent::Write(result) => Ev::Write(result),
            IoEvent::PeerDisconnect(err) => Ev::PeerGone(err),
        };
        let _ = tx.send(flattened);
    });
    (callback, rx)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn read_buffer(bytes: usize) -> IoBuffer {
    IoBuffer::with_capacity(bytes, alloc_site!()).unwrap()
}

/// Make the stream reset instead of FIN on close.
fn set_linger_zero(stream: &TcpStream) {
    let linger = libc::linger { l_onoff: 1, l_linger: 0 };
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&raw const linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
}

#[test]
fn test_client_connect_then_read() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (callback, rx) = channel_callback();
    let handle = reactor
        .open_client(&format!("ip://127.0.0.1:{port}"), OpenFlags::empty(), callback)
        .unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Connect(Ok(())) => {}
        other => panic!("expected successful connect, got {other:?}"),
    }

    // Park a read; nothing may arrive before the peer sends.
    handle.read_block_async(read_buffer(1024)).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    let payload: Vec<u8> = (0..100u8).collect();
    peer.write_all(&payload).unwrap();
    peer.flush().unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Read(Ok(data)) => assert_eq!(data, payload),
        other => panic!("expected 100-byte read, got {other:?}"),
    }

    // Exactly one event until the peer sends again.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    handle.close();
    handle.close(); // close is idempotent
    assert!(reactor.wait_for_all_closed(Duration::from_secs(5)));
    assert_eq!(reactor.active_connections(), 0);
}

#[test]
fn test_read_timeout_delivers_no_response_once() {
    init_tracing();
    let config = ReactorConfig {
        read_timeout_ms: 400,
        timeout_check_ms: 100,
        ..ReactorConfig::default()
    };
    let reactor = Reactor::with_config(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (callback, rx) = channel_callback();
    let handle = reactor
        .open_client(&format!("ip://127.0.0.1:{port}"), OpenFlags::empty(), callback)
        .unwrap();
    // Accept but never send anything.
    let (_peer, _) = listener.accept().unwrap();
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Connect(Ok(())) => {}
        other => panic!("expected successful connect, got {other:?}"),
    }

    let started = Instant::now();
    handle.read_block_async(read_buffer(512)).unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Read(Err(Error::NoResponse)) => {}
        other => panic!("expected read timeout, got {other:?}"),
    }
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(300), "fired too early: {waited:?}");
    assert!(waited <= Duration::from_secs(3), "fired too late: {waited:?}");

    // The timeout fires exactly once and the connection is torn down.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(reactor.wait_for_all_closed(Duration::from_secs(5)));
    assert_eq!(reactor.stats().timeouts_fired, 1);

    // Submissions on the closed connection fail synchronously.
    assert_eq!(handle.read_block_async(read_buffer(16)), Err(Error::EndOfStream));
}

#[test]
fn test_write_to_reset_peer() {
    init_tracing();
    let config = ReactorConfig { timeout_check_ms: 100, ..ReactorConfig::default() };
    let reactor = Reactor::with_config(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (callback, rx) = channel_callback();
    let handle = reactor
        .open_client(&format!("ip://127.0.0.1:{port}"), OpenFlags::empty(), callback)
        .unwrap();
    let (peer, _) = listener.accept().unwrap();
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Connect(Ok(())) => {}
        other => panic!("expected successful connect, got {other:?}"),
    }

    // A megabyte cannot fit in the socket buffers, so the tail parks.
    let payload = vec![0xAB_u8; 1 << 20];
    let buffer = IoBuffer::from_payload(&payload, alloc_site!()).unwrap();
    handle.write_block_async(buffer).unwrap();

    // Let some bytes flow, then reset the connection mid-stream.
    std::thread::sleep(Duration::from_millis(100));
    set_linger_zero(&peer);
    drop(peer);

    // Exactly one WRITE completion, with peer-disconnected semantics.
    let deadline = Instant::now() + Duration::from_secs(10);
    let write_result = loop {
        assert!(Instant::now() < deadline, "no write completion");
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Ev::Write(result) => break result,
            // The reset may also surface as an unsolicited peer-gone event.
            Ev::PeerGone(_) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_eq!(write_result, Err(Error::PeerDisconnected));

    assert!(reactor.wait_for_all_closed(Duration::from_secs(5)));
    assert_eq!(reactor.active_connections(), 0);

    // The connection is Closed; later submissions fail synchronously.
    let late = IoBuffer::from_payload(b"late", alloc_site!()).unwrap();
    assert_eq!(handle.write_block_async(late), Err(Error::PeerDisconnected));

    // And no further write completion arrives for them.
    assert!(matches!(
        rx.recv_timeout(Duration::from_millis(300)),
        Err(_)
    ));
}

#[test]
fn test_server_accept_and_unsolicited_read() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let (callback, rx) = channel_callback();
    let server = reactor.open_server(false, 0, true, callback).unwrap();
    let port = server.local_addr().unwrap().port();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let accepted = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Accept(handle) => handle,
        other => panic!("expected accept, got {other:?}"),
    };
    assert_eq!(reactor.active_connections(), 2);

    // Data with no read submitted still surfaces as a READ completion.
    client.write_all(b"unsolicited ping").unwrap();
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Read(Ok(data)) => assert_eq!(data, b"unsolicited ping"),
        other => panic!("expected read, got {other:?}"),
    }

    // Echo back through the reactor.
    let reply = IoBuffer::from_payload(b"pong", alloc_site!()).unwrap();
    accepted.write_block_async(reply).unwrap();
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Write(Ok(())) => {}
        other => panic!("expected write completion, got {other:?}"),
    }
    let mut received = [0u8; 4];
    std::io::Read::read_exact(&mut client, &mut received).unwrap();
    assert_eq!(&received, b"pong");

    accepted.close();
    server.close();
    assert!(reactor.wait_for_all_closed(Duration::from_secs(5)));
    assert_eq!(reactor.active_connections(), 0);

    let stats = reactor.stats();
    assert_eq!(stats.total_accepted, 1);
    assert_eq!(stats.total_opened, 1);
    assert_eq!(stats.total_closed, 2);
}

#[test]
fn test_udp_server_receives_datagram() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let (callback, rx) = channel_callback();
    let server = reactor.open_server(true, 0, true, callback).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"datagram one", ("127.0.0.1", port)).unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Read(Ok(data)) => assert_eq!(data, b"datagram one"),
        other => panic!("expected datagram, got {other:?}"),
    }

    server.close();
    assert!(reactor.wait_for_all_closed(Duration::from_secs(5)));
}

#[test]
fn test_eof_completes_parked_read() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (callback, rx) = channel_callback();
    let handle = reactor
        .open_client(&format!("ip://127.0.0.1:{port}"), OpenFlags::empty(), callback)
        .unwrap();
    let (peer, _) = listener.accept().unwrap();
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Connect(Ok(())) => {}
        other => panic!("expected successful connect, got {other:?}"),
    }

    handle.read_block_async(read_buffer(256)).unwrap();
    drop(peer); // orderly close

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Ev::Read(Err(Error::EndOfStream)) => {}
        other => panic!("expected end of stream, got {other:?}"),
    }
    assert!(reactor.wait_for_all_closed(Duration::from_secs(5)));
    assert_eq!(reactor.active_connections(), 0);
}

#[test]
fn test_open_close_restores_counts() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let baseline = reactor.active_connections();

    let (callback, _rx) = channel_callback();
    let server = reactor.open_server(false, 0, true, callback).unwrap();
    assert_eq!(reactor.active_connections(), baseline + 1);

    server.close();
    assert!(reactor.wait_for_all_closed(Duration::from_secs(5)));
    assert_eq!(reactor.active_connections(), baseline);
}
