//! Per-connection engine: the emulated NIC.
//!
//! Each established connection owns one engine thread. It is the only
//! reader of the connection's socket and the only party that touches
//! registered memory on behalf of the peer: inbound one-sided READ/WRITE
//! requests are validated against the region table and serviced here,
//! without ever involving the application thread. Inbound sends are matched
//! to posted receives, and acknowledgements for our own outbound work are
//! resolved into completions.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::cm::CmEvent;
use crate::fabric::cq::{WcOpcode, WcStatus};
use crate::fabric::mr::Permission;
use crate::fabric::qp::{wc_entry, PendingKind, PendingOp, QpShared};
use crate::fabric::wire::{self, Frame, WireStatus};

/// Handle to a running engine thread.
pub(crate) struct Engine {
    thread: JoinHandle<()>,
}

impl Engine {
    /// Start the engine for an established connection. `reader` is owned by
    /// the engine; `writer` is shared with the posting paths.
    pub(crate) fn spawn(
        reader: TcpStream,
        writer: Arc<Mutex<TcpStream>>,
        shared: Arc<QpShared>,
        cm_tx: Sender<CmEvent>,
    ) -> Self {
        let thread = thread::Builder::new()
            .name("farmem-engine".into())
            .spawn(move || run(reader, writer, shared, cm_tx))
            .expect("cannot spawn fabric engine thread");
        Self { thread }
    }

    pub(crate) fn join(self) {
        let _ = self.thread.join();
    }
}

fn run(
    mut reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    shared: Arc<QpShared>,
    cm_tx: Sender<CmEvent>,
) {
    let orderly = loop {
        let frame = match wire::read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(e) => {
                if e.kind() != ErrorKind::UnexpectedEof && e.kind() != ErrorKind::ConnectionReset {
                    log::warn!("engine: transport error: {e}");
                }
                break false;
            }
        };

        let reply = match frame {
            Frame::Send { seq, payload } => Some(handle_send(&shared, seq, &payload)),
            Frame::ReadReq {
                seq,
                addr,
                rkey,
                len,
            } => Some(handle_read_req(&shared, seq, addr, rkey, len)),
            Frame::WriteReq {
                seq,
                addr,
                rkey,
                payload,
            } => Some(handle_write_req(&shared, seq, addr, rkey, &payload)),
            Frame::SendAck { seq, status } => {
                resolve_ack(&shared, seq, status, WcOpcode::Send);
                None
            }
            Frame::WriteAck { seq, status } => {
                resolve_ack(&shared, seq, status, WcOpcode::RdmaWrite);
                None
            }
            Frame::ReadResp { seq, status, data } => {
                resolve_read_resp(&shared, seq, status, &data);
                None
            }
            Frame::Disconnect => break true,
            // Connection management frames are consumed before the engine
            // takes over the stream.
            other => {
                log::warn!("engine: unexpected frame after establishment: {other:?}");
                break false;
            }
        };

        if let Some(reply) = reply {
            let mut w = writer.lock().unwrap();
            if let Err(e) = wire::write_frame(&mut *w, &reply) {
                log::warn!("engine: failed to write reply: {e}");
                break false;
            }
        }
    };

    shared.broken.store(true, Ordering::Release);
    flush(&shared);
    if orderly {
        let _ = cm_tx.send(CmEvent::Disconnected);
    } else {
        let _ = cm_tx.send(CmEvent::Error);
    }
    log::debug!("engine: exiting (orderly = {orderly})");
}

/// Match an inbound send to the next outstanding receive.
fn handle_send(shared: &QpShared, seq: u64, payload: &[u8]) -> Frame {
    let posted = shared.recv_queue.lock().unwrap().pop_front();
    let Some(recv) = posted else {
        // No receive outstanding: fatal on a reliable connection. Surface
        // it to the sender rather than dropping the payload silently.
        log::warn!("engine: inbound send with no posted receive");
        return Frame::SendAck {
            seq,
            status: WireStatus::ReceiverNotReady,
        };
    };
    recv.outstanding.fetch_sub(1, Ordering::Release);

    if payload.len() > recv.slice.len {
        shared.cq.push(wc_entry(
            recv.wr_id,
            WcStatus::LocLenErr,
            WcOpcode::Recv,
            payload.len(),
        ));
        return Frame::SendAck {
            seq,
            status: WireStatus::LengthMismatch,
        };
    }

    // Re-validate the destination and copy while the region table lock
    // holds the registration (and the memory behind it) alive; it may have
    // gone away since the receive was posted.
    let copied = shared.pd.with_local_range(
        recv.slice.lkey,
        recv.slice.addr,
        recv.slice.len,
        Permission::LOCAL_WRITE,
        // SAFETY: range validated by the table; the lock keeps the memory
        // pinned for the duration of the copy.
        |dst| unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len()) },
    );
    if copied.is_none() {
        shared.cq.push(wc_entry(
            recv.wr_id,
            WcStatus::LocProtErr,
            WcOpcode::Recv,
            0,
        ));
        return Frame::SendAck {
            seq,
            status: WireStatus::AccessDenied,
        };
    }

    shared.cq.push(wc_entry(
        recv.wr_id,
        WcStatus::Success,
        WcOpcode::Recv,
        payload.len(),
    ));
    Frame::SendAck {
        seq,
        status: WireStatus::Ok,
    }
}

/// Service a one-sided read against local registered memory.
fn handle_read_req(shared: &QpShared, seq: u64, addr: u64, rkey: u32, len: u32) -> Frame {
    let data = shared.pd.with_remote_range(
        rkey,
        addr,
        len as usize,
        Permission::REMOTE_READ,
        // SAFETY: range validated by the table; the lock keeps the memory
        // pinned while the bytes are copied out.
        |src| unsafe { std::slice::from_raw_parts(src as *const u8, len as usize) }.to_vec(),
    );
    match data {
        Some(data) => Frame::ReadResp {
            seq,
            status: WireStatus::Ok,
            data,
        },
        None => {
            log::warn!("engine: denied remote read addr={addr:#x} rkey={rkey:#x} len={len}");
            Frame::ReadResp {
                seq,
                status: WireStatus::AccessDenied,
                data: Vec::new(),
            }
        }
    }
}

/// Service a one-sided write against local registered memory.
fn handle_write_req(shared: &QpShared, seq: u64, addr: u64, rkey: u32, payload: &[u8]) -> Frame {
    let copied = shared.pd.with_remote_range(
        rkey,
        addr,
        payload.len(),
        Permission::REMOTE_WRITE,
        // SAFETY: range validated by the table; the lock keeps the memory
        // pinned for the duration of the copy.
        |dst| unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len()) },
    );
    match copied {
        Some(()) => Frame::WriteAck {
            seq,
            status: WireStatus::Ok,
        },
        None => {
            log::warn!(
                "engine: denied remote write addr={addr:#x} rkey={rkey:#x} len={}",
                payload.len()
            );
            Frame::WriteAck {
                seq,
                status: WireStatus::AccessDenied,
            }
        }
    }
}

fn take_pending(shared: &QpShared, seq: u64) -> Option<PendingOp> {
    let op = shared.pending.lock().unwrap().remove(&seq);
    if let Some(ref op) = op {
        op.outstanding.fetch_sub(1, Ordering::Release);
    } else {
        log::warn!("engine: acknowledgement for unknown sequence {seq}");
    }
    op
}

fn ack_status(status: WireStatus) -> WcStatus {
    match status {
        WireStatus::Ok => WcStatus::Success,
        WireStatus::ReceiverNotReady => WcStatus::RnrRetryExceeded,
        WireStatus::LengthMismatch | WireStatus::AccessDenied => WcStatus::RemAccessErr,
    }
}

/// Resolve an acknowledgement for an outbound send or write.
fn resolve_ack(shared: &QpShared, seq: u64, status: WireStatus, opcode: WcOpcode) {
    let Some(op) = take_pending(shared, seq) else {
        return;
    };
    let status = ack_status(status);
    if op.signaled || !status.is_success() {
        // An unsignaled failure must still surface somewhere.
        shared.cq.push(wc_entry(op.wr_id, status, opcode, 0));
    }
}

/// Land a one-sided read's data and resolve its completion.
fn resolve_read_resp(shared: &QpShared, seq: u64, status: WireStatus, data: &[u8]) {
    let Some(op) = take_pending(shared, seq) else {
        return;
    };
    let PendingKind::Read { dst } = op.kind else {
        log::warn!("engine: read response for a non-read work request");
        return;
    };

    let status = if status != WireStatus::Ok {
        WcStatus::RemAccessErr
    } else if data.len() > dst.len {
        WcStatus::LocLenErr
    } else {
        let copied = shared.pd.with_local_range(
            dst.lkey,
            dst.addr,
            dst.len,
            Permission::LOCAL_WRITE,
            // SAFETY: range validated by the table; the lock keeps the
            // destination pinned for the duration of the copy.
            |p| unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p, data.len()) },
        );
        match copied {
            Some(()) => WcStatus::Success,
            None => WcStatus::LocProtErr,
        }
    };

    if op.signaled {
        shared
            .cq
            .push(wc_entry(op.wr_id, status, WcOpcode::RdmaRead, data.len()));
    } else if !status.is_success() {
        // An unsignaled failure must still surface somewhere.
        shared
            .cq
            .push(wc_entry(op.wr_id, status, WcOpcode::RdmaRead, 0));
    }
}

/// Flush everything still queued once the connection is gone.
fn flush(shared: &QpShared) {
    let mut pending = shared.pending.lock().unwrap();
    for (_, op) in pending.drain() {
        op.outstanding.fetch_sub(1, Ordering::Release);
        if op.signaled {
            let opcode = match op.kind {
                PendingKind::Send => WcOpcode::Send,
                PendingKind::Write => WcOpcode::RdmaWrite,
                PendingKind::Read { .. } => WcOpcode::RdmaRead,
            };
            shared
                .cq
                .push(wc_entry(op.wr_id, WcStatus::FlushErr, opcode, 0));
        }
    }
    drop(pending);

    let mut recvs = shared.recv_queue.lock().unwrap();
    for recv in recvs.drain(..) {
        recv.outstanding.fetch_sub(1, Ordering::Release);
        shared
            .cq
            .push(wc_entry(recv.wr_id, WcStatus::FlushErr, WcOpcode::Recv, 0));
    }
}
