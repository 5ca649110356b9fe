//! End-to-end sessions over loopback.
//!
//! Both roles run in one process, each on its own thread, exactly the way
//! the two demo binaries run on two hosts.

use std::thread;
use std::time::{Duration, Instant};

use farmem::prelude::*;
use farmem::proto::session::RmaSession;
use farmem::role;

const TIMEOUT: Duration = Duration::from_secs(5);

fn quick_config(port: u16) -> Config {
    Config {
        port,
        region_len: 4096,
        accept_timeout_ms: 5000,
        ..Config::default()
    }
}

/// Establish one connection at the fabric level, responder on the calling
/// thread, initiator on a spawned one. The listener binds an ephemeral
/// port so tests never collide.
fn establish_pair() -> (Listener, Endpoint, Connecter, Endpoint) {
    let mut listener = Listener::bind_and_listen(EventChannel::new(), 0, 1).unwrap();
    let port = listener.local_port().unwrap();

    let initiator = thread::spawn(move || {
        let mut connecter = Connecter::new(EventChannel::new());
        connecter.resolve_addr("127.0.0.1", port, TIMEOUT).unwrap();
        connecter.resolve_route(TIMEOUT).unwrap();
        let endpoint = Endpoint::new(Cq::DEFAULT_CQ_DEPTH, QpCaps::default()).unwrap();
        connecter.connect(&endpoint.qp, TIMEOUT).unwrap();
        (connecter, endpoint)
    });

    let pending = listener.accept_next(TIMEOUT).unwrap();
    let endpoint = Endpoint::new(Cq::DEFAULT_CQ_DEPTH, QpCaps::default()).unwrap();
    listener
        .finalize_accept(pending, &endpoint.qp, TIMEOUT)
        .unwrap();

    let (connecter, init_endpoint) = initiator.join().unwrap();
    (listener, endpoint, connecter, init_endpoint)
}

#[test]
fn full_session_between_roles() {
    let config = quick_config(47911);
    let responder_config = config.clone();
    let responder = thread::spawn(move || role::responder::run(&responder_config));

    // Give the listener a moment to bind.
    thread::sleep(Duration::from_millis(100));
    let outcome = role::initiator::run("127.0.0.1", &config).unwrap();

    // The bulk push and the first one-sided read both observe the greeting
    // prefix of the region: greeting bytes, then the zero fill.
    let greeting = config.greeting.as_bytes();
    assert_eq!(outcome.bulk.len(), config.bulk_len);
    assert_eq!(&outcome.bulk[..greeting.len()], greeting);
    assert!(outcome.bulk[greeting.len()..].iter().all(|&b| b == 0));
    assert_eq!(outcome.observed, outcome.bulk);

    // The read-back reproduces the written message, terminator included.
    let mut message = config.message.clone().into_bytes();
    message.push(0);
    assert_eq!(&outcome.verified[..message.len()], &message[..]);

    // The responder's memory now holds the initiator's message; no local
    // completion announced the change.
    let mut served = responder.join().unwrap().unwrap();
    assert_eq!(&served.region_bytes()[..message.len()], &message[..]);
    assert!(served.wait_disconnect(TIMEOUT));
}

#[test]
fn connect_to_dead_port_fails_within_bounded_wait() {
    // Bind and drop to obtain a port that actively refuses.
    let port = {
        let sock = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        sock.local_addr().unwrap().port()
    };

    let mut connecter = Connecter::new(EventChannel::new());
    let start = Instant::now();
    let err = connecter
        .resolve_addr("127.0.0.1", port, Duration::from_secs(2))
        .unwrap_err();
    assert!(matches!(err, Error::AddressResolution(_)), "{err}");
    assert!(start.elapsed() < Duration::from_secs(4));
}

#[test]
fn rejected_connection_surfaces_on_both_sides() {
    let mut listener = Listener::bind_and_listen(EventChannel::new(), 0, 1).unwrap();
    let port = listener.local_port().unwrap();

    let initiator = thread::spawn(move || {
        let mut connecter = Connecter::new(EventChannel::new());
        connecter.resolve_addr("127.0.0.1", port, TIMEOUT).unwrap();
        connecter.resolve_route(TIMEOUT).unwrap();
        let endpoint = Endpoint::new(Cq::DEFAULT_CQ_DEPTH, QpCaps::default()).unwrap();
        connecter.connect(&endpoint.qp, TIMEOUT).unwrap_err()
    });

    let pending = listener.accept_next(TIMEOUT).unwrap();
    listener.reject(pending).unwrap();
    assert_eq!(listener.state(), CmState::Listening);

    let err = initiator.join().unwrap();
    assert!(matches!(err, Error::ConnectionRejected), "{err}");
}

#[test]
fn send_without_posted_receive_is_fatal_for_the_sender() {
    let (_listener, _resp, _connecter, init) = establish_pair();

    let src = RegisteredMem::new(&init.pd, 64).unwrap();
    init.qp
        .post_send(src.as_mr_slice(), 7, true)
        .unwrap();
    let err = init.qp.wait_signaled(7, TIMEOUT).unwrap_err();
    assert!(
        matches!(
            err,
            Error::WorkCompletion {
                wr_id: 7,
                status: WcStatus::RnrRetryExceeded,
            }
        ),
        "{err}"
    );
}

#[test]
fn one_sided_cycles_are_repeatable_and_reads_leave_no_trace() {
    let (_listener, resp, _connecter, init) = establish_pair();

    let region = RegisteredMem::new_with_content(&resp.pd, b"untouched", Permission::default())
        .unwrap();
    let remote = region.as_remote().unwrap();
    let mut scratch = RegisteredMem::with_permission(&init.pd, 64, Permission::LOCAL_WRITE)
        .unwrap();

    let session = RmaSession::new(&init.qp, remote, TIMEOUT);

    // Reads do not mutate the target.
    for wr in 10..13 {
        let slice = scratch.get_slice(0..9).unwrap();
        session.read_into(slice, wr).unwrap();
        assert_eq!(&scratch[..9], b"untouched");
    }
    assert_eq!(&region[..], b"untouched");

    // Write-then-read cycles are idempotent.
    for round in 0..3u8 {
        scratch[..9].copy_from_slice(b"OVERWRITE");
        let slice = scratch.get_slice(0..9).unwrap();
        session.write_from(slice, 20 + u64::from(round)).unwrap();

        scratch[..9].fill(0);
        let slice = scratch.get_slice(0..9).unwrap();
        session.read_into(slice, 30 + u64::from(round)).unwrap();
        assert_eq!(&scratch[..9], b"OVERWRITE");
        assert_eq!(&region[..], b"OVERWRITE");
    }
}

#[test]
fn remote_access_respects_region_permissions() {
    let (_listener, resp, _connecter, init) = establish_pair();

    // Readable but not writable from the remote side.
    let region = RegisteredMem::with_permission(
        &resp.pd,
        64,
        Permission::LOCAL_WRITE | Permission::REMOTE_READ,
    )
    .unwrap();
    let remote = region.as_remote().unwrap();
    let scratch = RegisteredMem::new(&init.pd, 64).unwrap();

    init.qp
        .post_read(scratch.get_slice(0..16).unwrap(), remote, 1, true)
        .unwrap();
    init.qp.wait_signaled(1, TIMEOUT).unwrap();

    init.qp
        .post_write(scratch.get_slice(0..16).unwrap(), remote, 2, true)
        .unwrap();
    let err = init.qp.wait_signaled(2, TIMEOUT).unwrap_err();
    assert!(
        matches!(
            err,
            Error::WorkCompletion {
                wr_id: 2,
                status: WcStatus::RemAccessErr,
            }
        ),
        "{err}"
    );
}

#[test]
fn failed_unsignaled_work_still_completes() {
    let (_listener, _resp, _connecter, init) = establish_pair();

    // No receive posted on the far side: the send fails on the wire, and
    // even though it was posted unsignaled the failure must surface.
    let src = RegisteredMem::new(&init.pd, 16).unwrap();
    init.qp.post_send(src.as_mr_slice(), 9, false).unwrap();

    let wc = init
        .cq
        .poll_one_timeout(TIMEOUT)
        .expect("a failed unsignaled work request must still complete");
    assert_eq!(wc.wr_id, 9);
    assert_eq!(wc.status, WcStatus::RnrRetryExceeded);
}

#[test]
fn region_teardown_races_cleanly_with_remote_reads() {
    let (_listener, resp, _connecter, init) = establish_pair();

    let region = RegisteredMem::new(&resp.pd, 4096).unwrap();
    let remote = region.as_remote().unwrap();
    let scratch = RegisteredMem::new(&init.pd, 4096).unwrap();

    let dropper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        drop(region);
    });

    // Keep reading while the region disappears under us. Every read must
    // either land its bytes or come back denied; nothing in between.
    let start = Instant::now();
    let mut wr = 0u64;
    let denied = loop {
        if start.elapsed() > TIMEOUT {
            break false;
        }
        init.qp
            .post_read(scratch.get_slice(0..512).unwrap(), remote, wr, true)
            .unwrap();
        match init.qp.wait_signaled(wr, TIMEOUT) {
            Ok(_) => wr += 1,
            Err(Error::WorkCompletion {
                status: WcStatus::RemAccessErr,
                ..
            }) => break true,
            Err(other) => panic!("unexpected failure: {other}"),
        }
    };
    dropper.join().unwrap();
    assert!(denied, "reads must be denied once the region is gone");
}

#[test]
fn disconnect_flushes_outstanding_receives() {
    let (_listener, resp, connecter, init) = establish_pair();

    let buf = RegisteredMem::new(&resp.pd, 64).unwrap();
    resp.qp.post_recv(buf.as_mr_slice(), 42).unwrap();
    assert_eq!(resp.qp.outstanding_recvs(), 1);

    // Tearing down the initiator endpoint sends the disconnect notice.
    drop(init);
    drop(connecter);

    let err = resp.qp.wait_signaled(42, TIMEOUT).unwrap_err();
    assert!(
        matches!(
            err,
            Error::WorkCompletion {
                wr_id: 42,
                status: WcStatus::FlushErr,
            }
        ),
        "{err}"
    );
    assert_eq!(resp.qp.outstanding_recvs(), 0);
}

#[test]
fn acquisition_failures_leave_no_residue() {
    // A port can only be bound once; the loser reports Bind.
    let first = Listener::bind_and_listen(EventChannel::new(), 0, 1).unwrap();
    let port = first.local_port().unwrap();
    let err = Listener::bind_and_listen(EventChannel::new(), port, 1).unwrap_err();
    assert!(matches!(err, Error::Bind(_)), "{err}");

    // Once the holder unwinds, the port is immediately reusable.
    drop(first);
    let again = Listener::bind_and_listen(EventChannel::new(), port, 1);
    assert!(again.is_ok());

    // Failed acquisitions further down the chain leave earlier resources
    // usable: a zero-depth completion queue is refused, a fresh endpoint
    // still comes up afterwards.
    assert!(Cq::new(0).is_err());
    let pd = Pd::alloc().unwrap();
    assert!(matches!(
        RegisteredMem::new(&pd, 0),
        Err(Error::Registration(_))
    ));
    assert!(Endpoint::new(Cq::DEFAULT_CQ_DEPTH, QpCaps::default()).is_ok());
}
