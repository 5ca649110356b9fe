//! Descriptor exchange and readiness rendezvous.
//!
//! Runs once, immediately after establishment and before any one-sided
//! traffic. The two-sided path is unforgiving: a send with no receive
//! outstanding on the far side is fatal, so every step here posts its
//! receive strictly before the corresponding send can land.
//!
//! Control traffic goes through a small scratch area separate from the
//! exposed region, so the exchange never clobbers the bytes the region
//! owner wants observed.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::fabric::mr::{Mr, RemoteMem};
use crate::fabric::qp::Qp;
use crate::proto::wr_id;
use crate::utils::registered_mem::RegisteredMem;

/// Scratch layout: the descriptor staging area, then one signal byte.
const DESC_RANGE: std::ops::Range<usize> = 0..RemoteMem::WIRE_LEN;
const SIGNAL_RANGE: std::ops::Range<usize> = RemoteMem::WIRE_LEN..RemoteMem::WIRE_LEN + 1;

/// Minimum scratch buffer size for the exchange.
pub const CTRL_LEN: usize = RemoteMem::WIRE_LEN + 1;

fn ctrl_slice(ctrl: &RegisteredMem, range: std::ops::Range<usize>) -> Result<crate::MrSlice> {
    ctrl.get_slice(range)
        .ok_or_else(|| Error::Registration("control buffer too small for exchange".into()))
}

/// Responder half: offer the region's descriptor and await the initiator's
/// readiness signal.
///
/// Posts the signal receive before sending the descriptor, so the
/// initiator's signal can never arrive with no receive outstanding.
pub fn responder_offer(
    qp: &Qp,
    region: &Mr,
    ctrl: &mut RegisteredMem,
    timeout: Duration,
) -> Result<()> {
    let descriptor = region.as_remote().ok_or_else(|| {
        Error::Registration("offered region carries no remote capability".into())
    })?;

    qp.post_recv(ctrl_slice(ctrl, SIGNAL_RANGE)?, wr_id::READY_SIGNAL)?;

    ctrl[DESC_RANGE].copy_from_slice(&descriptor.to_wire());
    qp.post_send(ctrl_slice(ctrl, DESC_RANGE)?, wr_id::DESC_SEND, true)?;
    qp.wait_signaled(wr_id::DESC_SEND, timeout)?;
    log::debug!(
        "descriptor sent: addr={:#x} rkey={:#x}",
        descriptor.addr,
        descriptor.rkey
    );

    qp.wait_signaled(wr_id::READY_SIGNAL, timeout)?;
    log::debug!("initiator signalled ready");
    Ok(())
}

/// Responder half, step two: push the bulk payload.
///
/// Only valid after [`responder_offer`] returned: the readiness signal is
/// the initiator's guarantee that its bulk receive is posted.
pub fn responder_push_bulk(
    qp: &Qp,
    region: &Mr,
    bulk_len: usize,
    timeout: Duration,
) -> Result<()> {
    let slice = region
        .get_slice(0..bulk_len)
        .ok_or_else(|| Error::Registration("region smaller than bulk payload".into()))?;
    qp.post_send(slice, wr_id::BULK_SEND, true)?;
    qp.wait_signaled(wr_id::BULK_SEND, timeout)?;
    Ok(())
}

/// Initiator half, step one: pre-post the descriptor receive.
///
/// Must run before `connect()`: the responder sends the descriptor as soon
/// as the connection is established, and that send may not find the
/// receive queue empty.
pub fn initiator_expect_descriptor(qp: &Qp, ctrl: &RegisteredMem) -> Result<()> {
    qp.post_recv(ctrl_slice(ctrl, DESC_RANGE)?, wr_id::DESC_RECV)
}

/// Initiator half, step two: resolve the descriptor from the received
/// bytes.
pub fn initiator_await_descriptor(
    qp: &Qp,
    ctrl: &RegisteredMem,
    timeout: Duration,
) -> Result<RemoteMem> {
    let wc = qp.wait_signaled(wr_id::DESC_RECV, timeout)?;
    if wc.byte_len != RemoteMem::WIRE_LEN {
        return Err(Error::WorkCompletion {
            wr_id: wc.wr_id,
            status: crate::WcStatus::LocLenErr,
        });
    }
    let mut wire = [0u8; RemoteMem::WIRE_LEN];
    wire.copy_from_slice(&ctrl[DESC_RANGE]);
    let descriptor = RemoteMem::from_wire(&wire);
    log::debug!(
        "descriptor received: addr={:#x} rkey={:#x}",
        descriptor.addr,
        descriptor.rkey
    );
    Ok(descriptor)
}

/// Initiator half, step three: rendezvous.
///
/// Posts the bulk receive first, then tells the responder we are ready via
/// a 1-byte signal send. The signal's content is undefined; its arrival is
/// the information.
pub fn initiator_signal_ready(
    qp: &Qp,
    ctrl: &RegisteredMem,
    bulk: crate::MrSlice,
    timeout: Duration,
) -> Result<()> {
    qp.post_recv(bulk, wr_id::BULK_RECV)?;
    qp.post_send(ctrl_slice(ctrl, SIGNAL_RANGE)?, wr_id::READY_SIGNAL, true)?;
    qp.wait_signaled(wr_id::READY_SIGNAL, timeout)?;
    Ok(())
}

/// Initiator half, step four: await the bulk payload. Returns its length.
pub fn initiator_await_bulk(qp: &Qp, timeout: Duration) -> Result<usize> {
    let wc = qp.wait_signaled(wr_id::BULK_RECV, timeout)?;
    Ok(wc.byte_len)
}
