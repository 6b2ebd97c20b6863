//! Loopback tests for the transport loop.

use super::*;

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::AtomicUsize;

use crossbeam_channel::{Receiver, Sender, unbounded};

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connecting,
    Line(String),
    Stopped(StopCause),
}

/// Records every callback and answers a couple of fixed lines.
struct Recorder {
    seen: Sender<Seen>,
    ticks: Arc<AtomicUsize>,
}

impl Protocol for Recorder {
    type Request = String;

    fn on_connecting(&mut self, _now: Instant) {
        let _ = self.seen.send(Seen::Connecting);
    }

    fn on_line(&mut self, line: &str, _now: Instant, link: &mut Link) {
        let _ = self.seen.send(Seen::Line(line.to_string()));
        match line {
            "echo" => link.send("echoed"),
            "halt" => link.stop("told to stop"),
            _ => {}
        }
    }

    fn on_request(&mut self, request: String, _now: Instant, link: &mut Link) {
        link.send(request);
    }

    fn on_tick(&mut self, _now: Instant, _link: &mut Link) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stopped(&mut self, cause: &StopCause) {
        let _ = self.seen.send(Seen::Stopped(cause.clone()));
    }
}

fn engine() -> (TransportEngine<Recorder>, Receiver<Seen>, Arc<AtomicUsize>) {
    let (tx, rx) = unbounded();
    let ticks = Arc::new(AtomicUsize::new(0));
    let config = TransportConfig {
        tick_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let recorder = Recorder {
        seen: tx,
        ticks: Arc::clone(&ticks),
    };
    (TransportEngine::new(config, recorder), rx, ticks)
}

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn accept(listener: &TcpListener) -> StdTcpStream {
    let (stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn next(seen: &Receiver<Seen>) -> Seen {
    seen.recv_timeout(Duration::from_secs(5))
        .expect("expected a protocol callback")
}

fn wait_until_stopped(engine: &TransportEngine<Recorder>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.is_running() {
        assert!(Instant::now() < deadline, "loop did not stop");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_start_rejects_invalid_endpoint() {
    let (engine, _seen, _) = engine();
    assert!(matches!(
        engine.start("127.0.0.1", 0),
        Err(TransportError::InvalidPort)
    ));
    assert!(matches!(
        engine.start("  ", 10000),
        Err(TransportError::EmptyHost)
    ));

    let (ok, message) = engine.start_report("127.0.0.1", 0);
    assert!(!ok);
    assert!(message.contains("port"));
    assert!(!engine.is_running());
}

#[test]
fn test_start_report_success() {
    let (listener, port) = listener();
    let (engine, _seen, _) = engine();
    let (ok, message) = engine.start_report("127.0.0.1", port);
    assert!(ok, "{message}");
    let _peer = accept(&listener);
    assert!(matches!(
        engine.start("127.0.0.1", port),
        Err(TransportError::AlreadyRunning)
    ));
    engine.stop("done");
}

#[test]
fn test_send_before_start_is_rejected() {
    let (engine, _seen, _) = engine();
    assert!(matches!(
        engine.send("BJ:HIT_____"),
        Err(TransportError::NotRunning)
    ));
    assert!(matches!(engine.reconnect(), Err(TransportError::NoEndpoint)));
}

#[test]
fn test_lines_are_reassembled_across_reads() {
    let (listener, port) = listener();
    let (engine, seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();
    assert_eq!(next(&seen), Seen::Connecting);

    let mut peer = accept(&listener);
    peer.write_all(b"BJ:ONE_____\nBJ:TW").unwrap();
    peer.flush().unwrap();
    thread::sleep(Duration::from_millis(60));
    peer.write_all(b"O_____\nBJ:THREE___\n").unwrap();

    assert_eq!(next(&seen), Seen::Line("BJ:ONE_____".into()));
    assert_eq!(next(&seen), Seen::Line("BJ:TWO_____".into()));
    assert_eq!(next(&seen), Seen::Line("BJ:THREE___".into()));
    engine.stop("done");
}

#[test]
fn test_outbound_order_matches_call_order() {
    let (listener, port) = listener();
    let (engine, _seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();

    engine.send("BJ:FIRST___").unwrap();
    engine.submit("BJ:SECOND__".to_string()).unwrap();
    engine.send("BJ:THIRD___\n").unwrap();

    let peer = accept(&listener);
    let mut lines = BufReader::new(peer).lines();
    assert_eq!(lines.next().unwrap().unwrap(), "BJ:FIRST___");
    assert_eq!(lines.next().unwrap().unwrap(), "BJ:SECOND__");
    assert_eq!(lines.next().unwrap().unwrap(), "BJ:THIRD___");
    engine.stop("done");
}

#[test]
fn test_protocol_replies_reach_the_peer() {
    let (listener, port) = listener();
    let (engine, _seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();

    let mut peer = accept(&listener);
    peer.write_all(b"echo\n").unwrap();

    let mut lines = BufReader::new(peer).lines();
    assert_eq!(lines.next().unwrap().unwrap(), "echoed");
    engine.stop("done");
}

#[test]
fn test_peer_close_ends_the_loop() {
    let (listener, port) = listener();
    let (engine, seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();
    assert_eq!(next(&seen), Seen::Connecting);

    drop(accept(&listener));

    assert_eq!(next(&seen), Seen::Stopped(StopCause::PeerClosed));
    wait_until_stopped(&engine);
    assert!(matches!(
        engine.send("BJ:HIT_____"),
        Err(TransportError::NotRunning)
    ));
}

#[test]
fn test_refused_connection_is_reported_asynchronously() {
    let (listener, port) = listener();
    drop(listener);

    let (engine, seen, _) = engine();
    assert!(engine.start("127.0.0.1", port).is_ok());
    assert_eq!(next(&seen), Seen::Connecting);

    match next(&seen) {
        Seen::Stopped(StopCause::Fault(reason)) => assert!(reason.contains("connect")),
        other => panic!("expected connect fault, got {other:?}"),
    }
    wait_until_stopped(&engine);
}

#[test]
fn test_protocol_stop_closes_the_socket() {
    let (listener, port) = listener();
    let (engine, seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();

    let mut peer = accept(&listener);
    peer.write_all(b"halt\n").unwrap();

    assert_eq!(next(&seen), Seen::Connecting);
    assert_eq!(next(&seen), Seen::Line("halt".into()));
    assert_eq!(
        next(&seen),
        Seen::Stopped(StopCause::Protocol("told to stop".into()))
    );

    let mut buf = [0u8; 16];
    assert_eq!(peer.read(&mut buf).unwrap(), 0, "peer should see EOF");
}

#[test]
fn test_stop_is_idempotent_and_returns_the_protocol() {
    let (listener, port) = listener();
    let (engine, seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();
    let _peer = accept(&listener);

    assert!(engine.with_protocol(|_| ()).is_none());
    engine.stop("bye");
    engine.stop("bye again");

    assert_eq!(next(&seen), Seen::Connecting);
    assert_eq!(next(&seen), Seen::Stopped(StopCause::Requested("bye".into())));
    assert!(seen.try_recv().is_err(), "second stop must be a no-op");
    assert!(!engine.is_running());
    assert!(engine.with_protocol(|_| ()).is_some());
}

#[test]
fn test_reconnect_starts_with_an_empty_buffer() {
    let (listener, port) = listener();
    let (engine, seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();

    let mut first = accept(&listener);
    first.write_all(b"BJ:PART").unwrap();
    thread::sleep(Duration::from_millis(60));

    engine.reconnect().unwrap();
    let mut second = accept(&listener);
    second.write_all(b"IAL\n").unwrap();

    assert_eq!(next(&seen), Seen::Connecting);
    assert_eq!(
        next(&seen),
        Seen::Stopped(StopCause::Requested("reconnect".into()))
    );
    assert_eq!(next(&seen), Seen::Connecting);
    assert_eq!(next(&seen), Seen::Line("IAL".into()));
    assert_eq!(engine.endpoint(), Some(("127.0.0.1".to_string(), port)));
    engine.stop("done");
}

#[test]
fn test_ticks_run_without_traffic() {
    let (listener, port) = listener();
    let (engine, _seen, ticks) = engine();
    engine.start("127.0.0.1", port).unwrap();
    let _peer = accept(&listener);

    thread::sleep(Duration::from_millis(250));
    assert!(
        ticks.load(Ordering::SeqCst) >= 3,
        "expected periodic ticks, got {}",
        ticks.load(Ordering::SeqCst)
    );
    engine.stop("done");
}

#[test]
fn test_stop_cause_reason() {
    assert_eq!(StopCause::PeerClosed.reason(), "peer closed");
    assert_eq!(StopCause::Fault("x".into()).reason(), "x");
    assert!(StopCause::PeerClosed.is_fault());
    assert!(!StopCause::Requested("x".into()).is_fault());
    assert!(!StopCause::Protocol("x".into()).is_fault());
}

#[test]
fn test_link_keeps_first_stop_reason() {
    let mut link = Link::default();
    link.send("BJ:HIT_____");
    link.stop("first");
    link.stop("second");
    assert_eq!(link.stop_requested(), Some("first"));
    assert_eq!(link.drain_sent(), vec!["BJ:HIT_____\n"]);
    assert_eq!(link.queued(), 0);
}

#[test]
fn test_reconnect_drops_unwritten_frames() {
    let (listener, port) = listener();
    let (engine, seen, _) = engine();
    engine.start("127.0.0.1", port).unwrap();

    // The first peer never reads, so this frame cannot drain completely.
    let _stalled = accept(&listener);
    engine.send("x".repeat(32 * 1024 * 1024)).unwrap();
    engine.send("BJ:STALE___").unwrap();
    thread::sleep(Duration::from_millis(100));

    engine.reconnect().unwrap();
    engine.send("BJ:FRESH___").unwrap();

    let second = accept(&listener);
    let mut lines = BufReader::new(second).lines();
    assert_eq!(lines.next().unwrap().unwrap(), "BJ:FRESH___");

    assert_eq!(next(&seen), Seen::Connecting);
    assert_eq!(
        next(&seen),
        Seen::Stopped(StopCause::Requested("reconnect".into()))
    );
    engine.stop("done");
}

#[test]
fn test_concurrent_stop_and_reconnect_keep_the_protocol() {
    let (listener, port) = listener();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });

    let (engine, _seen, _) = engine();
    let engine = Arc::new(engine);
    engine.start("127.0.0.1", port).unwrap();

    let stopper = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for _ in 0..50 {
                engine.stop("bye");
                thread::sleep(Duration::from_micros(50));
            }
        })
    };

    let mut failures = Vec::new();
    for _ in 0..50 {
        if let Err(e) = engine.reconnect() {
            failures.push(e.to_string());
        }
    }
    stopper.join().unwrap();

    assert!(failures.is_empty(), "{failures:?}");
    engine.stop("done");
    assert!(engine.with_protocol(|_| ()).is_some());
}
