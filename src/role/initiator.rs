//! Initiator role: obtain the descriptor, then modify the peer's memory.

use crate::cm::{Connecter, EventChannel};
use crate::config::Config;
use crate::error::Result;
use crate::fabric::mr::{Permission, RemoteMem};
use crate::fabric::qp::{Endpoint, QpCaps};
use crate::proto::exchange;
use crate::proto::session::RmaSession;
use crate::utils::{self, RegisteredMem};

/// Everything the initiator came away with.
#[derive(Debug)]
pub struct InitiatorOutcome {
    /// The remote region descriptor received over the two-sided path.
    pub descriptor: RemoteMem,
    /// The bulk payload the responder pushed.
    pub bulk: Vec<u8>,
    /// The remote region prefix as first observed by a one-sided read.
    pub observed: Vec<u8>,
    /// The read-back after the one-sided write, verified against the
    /// message.
    pub verified: Vec<u8>,
}

/// Run the whole initiator session against `host`.
///
/// Resolution, route, and connect each block for their matching event
/// within the configured bounded wait; the descriptor receive is posted
/// before the connect request goes out, so the responder's immediate send
/// can never find the receive queue empty. After the rendezvous and bulk
/// receive, the one-sided session reads the remote prefix, writes the
/// configured message over it, and reads it back for verification.
pub fn run(host: &str, config: &Config) -> Result<InitiatorOutcome> {
    utils::lock_memory_hint();

    let channel = EventChannel::new();
    let mut connecter = Connecter::new(channel);
    connecter.resolve_addr(host, config.port, config.resolve_timeout())?;
    connecter.resolve_route(config.resolve_timeout())?;

    let endpoint = Endpoint::new(config.cq_depth, QpCaps::default())?;
    let ctrl = RegisteredMem::with_permission(
        &endpoint.pd,
        exchange::CTRL_LEN,
        Permission::LOCAL_WRITE,
    )?;
    let bulk_buf = RegisteredMem::with_permission(
        &endpoint.pd,
        config.bulk_len,
        Permission::LOCAL_WRITE,
    )?;

    // Receive first, connect second.
    exchange::initiator_expect_descriptor(&endpoint.qp, &ctrl)?;
    connecter.connect(&endpoint.qp, config.resolve_timeout())?;

    let descriptor =
        exchange::initiator_await_descriptor(&endpoint.qp, &ctrl, config.completion_timeout())?;

    let bulk_slice = bulk_buf
        .get_slice(0..config.bulk_len)
        .ok_or_else(|| crate::Error::Registration("bulk buffer undersized".into()))?;
    exchange::initiator_signal_ready(
        &endpoint.qp,
        &ctrl,
        bulk_slice,
        config.completion_timeout(),
    )?;
    let bulk_len = exchange::initiator_await_bulk(&endpoint.qp, config.completion_timeout())?;
    let bulk = bulk_buf[..bulk_len].to_vec();
    log::info!("received {bulk_len}-byte bulk payload");

    // The message goes over the wire with its terminator, as a C string
    // peer would expect to find it in memory.
    let mut message = config.message.clone().into_bytes();
    message.push(0);

    let span = config.bulk_len.max(message.len());
    let mut scratch = RegisteredMem::with_permission(&endpoint.pd, span, Permission::LOCAL_WRITE)?;
    let session = RmaSession::new(&endpoint.qp, descriptor, config.completion_timeout());
    let outcome = session.run(&mut scratch, &message, config.bulk_len)?;
    log::info!("one-sided session verified {} bytes", message.len());

    Ok(InitiatorOutcome {
        descriptor,
        bulk,
        observed: outcome.observed,
        verified: outcome.verified,
    })
}
