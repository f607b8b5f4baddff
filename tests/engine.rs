//! Reactor-level tests over real sockets: echo, admission control,
//! lifecycle.

use squall::{Config, Engine};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config() -> Config {
    Config {
        addrs: vec!["127.0.0.1:0".to_string()],
        n_poller: 2,
        ..Config::default()
    }
}

#[test]
fn test_echo_round_trip() {
    let mut engine = Engine::new(config());
    engine.on_data(|conn, data| {
        let _ = conn.write(data);
    });
    engine.start().expect("start");
    let addr = engine.local_addrs()[0];

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");

    stream.write_all(b"ping").expect("write");
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"ping");

    // A second round on the same connection.
    stream.write_all(b"pong").expect("write");
    stream.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"pong");

    engine.stop();
}

#[test]
fn test_open_close_hooks_fire_once() {
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let mut engine = Engine::new(config());
    let o = opened.clone();
    engine.on_open(move |_conn| {
        o.fetch_add(1, Ordering::SeqCst);
    });
    let c = closed.clone();
    engine.on_close(move |_conn, _err| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    engine.start().expect("start");
    let addr = engine.local_addrs()[0];

    let stream = TcpStream::connect(addr).expect("connect");
    wait_until(|| opened.load(Ordering::SeqCst) == 1);
    drop(stream);
    wait_until(|| closed.load(Ordering::SeqCst) == 1);

    // The close hook must not fire again during shutdown.
    engine.stop();
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_admission_control_refuses_over_max_load() {
    let mut engine = Engine::new(Config {
        max_load: 1,
        ..config()
    });
    engine.start().expect("start");
    let addr = engine.local_addrs()[0];

    let first = TcpStream::connect(addr).expect("connect");
    wait_until(|| engine.current_load() == 1);

    let mut second = TcpStream::connect(addr).expect("connect");
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    wait_until(|| engine.refused() == 1);

    // The refused socket is closed without a byte.
    let mut buf = [0u8; 1];
    let n = second.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);

    assert!(engine.current_load() <= 1);
    drop(first);
    engine.stop();
}

#[test]
fn test_attach_stream() {
    let mut engine = Engine::new(config());
    engine.start().expect("start");
    let addr = engine.local_addrs()[0];

    // Dial the engine's own listener and attach the client side, so both
    // ends of the stream are reactor-owned connections.
    let dialed = TcpStream::connect(addr).expect("connect");
    let conn = engine.attach_stream(dialed).expect("attach");
    conn.write(b"hi").expect("write via attached conn");
    wait_until(|| engine.current_load() == 2);

    engine.stop();
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}
