//! Queue pair and related types.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cm::CmEvent;
use crate::error::{Error, Result};
use crate::fabric::cq::{Cq, Wc, WcOpcode, WcStatus};
use crate::fabric::engine::Engine;
use crate::fabric::mr::{MrSlice, Permission, RemoteMem};
use crate::fabric::pd::Pd;
use crate::fabric::wire::{self, Frame};

/// Queue pair capability settings.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    /// Maximum outstanding send-queue work requests.
    pub max_send_wr: usize,
    /// Maximum outstanding receive-queue work requests.
    pub max_recv_wr: usize,
    /// Maximum scatter/gather elements per work request.
    pub max_sge: usize,
}

impl Default for QpCaps {
    /// 16 outstanding requests each way, single-segment work requests.
    fn default() -> Self {
        Self {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_sge: 1,
        }
    }
}

/// Depth the emulated device supports per work queue.
const DEVICE_MAX_WR: usize = 1024;

/// A receive posted to the receive queue, awaiting an inbound send.
pub(crate) struct PostedRecv {
    pub wr_id: u64,
    pub slice: MrSlice,
    pub outstanding: Arc<std::sync::atomic::AtomicUsize>,
}

/// Work the send queue has issued and not yet resolved.
pub(crate) enum PendingKind {
    Send,
    Write,
    Read { dst: MrSlice },
}

pub(crate) struct PendingOp {
    pub wr_id: u64,
    pub signaled: bool,
    pub kind: PendingKind,
    pub outstanding: Arc<std::sync::atomic::AtomicUsize>,
}

/// State shared between the application-side queue pair handle and the
/// engine thread servicing its connection.
pub(crate) struct QpShared {
    pub pd: Pd,
    pub cq: Cq,
    pub caps: QpCaps,
    pub recv_queue: Mutex<VecDeque<PostedRecv>>,
    pub pending: Mutex<HashMap<u64, PendingOp>>,
    pub next_seq: AtomicU64,
    /// Set once the connection is gone; all further posts fail fast.
    pub broken: AtomicBool,
}

/// The established-connection half of a queue pair: socket writer shared
/// with the engine, plus the engine handle itself.
struct Conn {
    writer: Arc<Mutex<TcpStream>>,
    raw: TcpStream,
    engine: Option<Engine>,
}

/// Queue pair.
///
/// The work-queue abstraction through which all operations on one
/// connection are issued. Created against a protection domain and a
/// completion queue, then bound to a transport stream during connection
/// establishment. Receives may be posted before the connection is
/// established; everything that transmits requires an established
/// connection.
pub struct Qp {
    shared: Arc<QpShared>,
    conn: Mutex<Option<Conn>>,
    /// Successful completions observed while waiting for a different
    /// work request; handed back on the next wait.
    stash: Mutex<VecDeque<Wc>>,
}

impl Qp {
    /// Create a new queue pair on the given protection domain, delivering
    /// completions to the given completion queue.
    pub fn create(pd: &Pd, cq: &Cq, caps: QpCaps) -> Result<Self> {
        if caps.max_sge != 1 {
            return Err(Error::acquisition(
                "queue pair",
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "emulated fabric supports exactly one segment per work request",
                ),
            ));
        }
        if caps.max_send_wr == 0
            || caps.max_recv_wr == 0
            || caps.max_send_wr > DEVICE_MAX_WR
            || caps.max_recv_wr > DEVICE_MAX_WR
        {
            return Err(Error::acquisition(
                "queue pair",
                io::Error::new(io::ErrorKind::InvalidInput, "work queue depth out of range"),
            ));
        }

        Ok(Self {
            shared: Arc::new(QpShared {
                pd: pd.clone(),
                cq: cq.clone(),
                caps,
                recv_queue: Mutex::new(VecDeque::new()),
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                broken: AtomicBool::new(false),
            }),
            conn: Mutex::new(None),
            stash: Mutex::new(VecDeque::new()),
        })
    }

    /// Get the protection domain this queue pair belongs to.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.shared.pd
    }

    /// Get the completion queue completions are delivered to.
    #[inline]
    pub fn cq(&self) -> &Cq {
        &self.shared.cq
    }

    /// Bind this queue pair to an established transport stream and start
    /// the engine that services the connection.
    pub(crate) fn activate(&self, stream: TcpStream, cm_tx: Sender<CmEvent>) -> Result<()> {
        let writer = stream
            .try_clone()
            .map_err(|e| Error::acquisition("queue pair transport", e))?;
        let raw = stream
            .try_clone()
            .map_err(|e| Error::acquisition("queue pair transport", e))?;
        let writer = Arc::new(Mutex::new(writer));
        let engine = Engine::spawn(stream, writer.clone(), self.shared.clone(), cm_tx);
        *self.conn.lock().unwrap() = Some(Conn {
            writer,
            raw,
            engine: Some(engine),
        });
        Ok(())
    }

    fn writer(&self) -> Result<Arc<Mutex<TcpStream>>> {
        if self.shared.broken.load(Ordering::Acquire) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection is gone",
            )));
        }
        let conn = self.conn.lock().unwrap();
        match conn.as_ref() {
            Some(c) => Ok(c.writer.clone()),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "queue pair is not connected",
            ))),
        }
    }

    fn next_seq(&self) -> u64 {
        self.shared.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve a local segment at post time the way the device would,
    /// returning `InvalidInput` for anything the region table cannot cover.
    fn resolve_posted(&self, slice: &MrSlice) -> Result<Arc<std::sync::atomic::AtomicUsize>> {
        self.shared
            .pd
            .resolve_local(slice.lkey, slice.addr, slice.len, Permission::EMPTY)
            .map(|entry| entry.outstanding)
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "segment not covered by a local registration",
                ))
            })
    }

    /// Post a receive.
    ///
    /// At least one receive must be outstanding whenever two-sided traffic
    /// from the peer is expected: an inbound send with no posted receive is
    /// an error on both sides, never a silent success. Receives may (and
    /// for pre-connection traffic must) be posted before the connection is
    /// established.
    pub fn post_recv(&self, slice: MrSlice, wr_id: u64) -> Result<()> {
        let outstanding = self.resolve_posted(&slice)?;
        let mut queue = self.shared.recv_queue.lock().unwrap();
        if queue.len() >= self.shared.caps.max_recv_wr {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "receive queue full",
            )));
        }
        outstanding.fetch_add(1, Ordering::Release);
        queue.push_back(PostedRecv {
            wr_id,
            slice,
            outstanding,
        });
        Ok(())
    }

    fn post_transmit(
        &self,
        slice: MrSlice,
        wr_id: u64,
        signaled: bool,
        kind: PendingKind,
        make_frame: impl FnOnce(u64, Vec<u8>) -> Frame,
        copy_out: bool,
    ) -> Result<()> {
        let outstanding = self.resolve_posted(&slice)?;
        let writer = self.writer()?;

        // Source bytes leave local memory at post time, copied under the
        // region table lock so the registration cannot vanish mid-copy.
        let payload = if copy_out {
            self.shared
                .pd
                .with_local_range(slice.lkey, slice.addr, slice.len, Permission::EMPTY, |src| {
                    // SAFETY: range validated by the table; the lock keeps
                    // the memory pinned while the bytes are copied out.
                    unsafe { std::slice::from_raw_parts(src as *const u8, slice.len) }.to_vec()
                })
                .ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "segment not covered by a local registration",
                    ))
                })?
        } else {
            Vec::new()
        };

        let seq = self.next_seq();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.len() >= self.shared.caps.max_send_wr {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "send queue full",
                )));
            }
            outstanding.fetch_add(1, Ordering::Release);
            pending.insert(
                seq,
                PendingOp {
                    wr_id,
                    signaled,
                    kind,
                    outstanding,
                },
            );
        }

        let frame = make_frame(seq, payload);
        let res = {
            let mut w = writer.lock().unwrap();
            wire::write_frame(&mut *w, &frame)
        };
        if let Err(e) = res {
            if let Some(op) = self.shared.pending.lock().unwrap().remove(&seq) {
                op.outstanding.fetch_sub(1, Ordering::Release);
            }
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Post a two-sided send of the given local segment. The payload lands
    /// in the peer's next outstanding receive.
    pub fn post_send(&self, slice: MrSlice, wr_id: u64, signaled: bool) -> Result<()> {
        self.post_transmit(
            slice,
            wr_id,
            signaled,
            PendingKind::Send,
            |seq, payload| Frame::Send { seq, payload },
            true,
        )
    }

    /// Post a one-sided read: pull `local.len` bytes from the remote
    /// region into the local segment. The remote CPU is not involved.
    pub fn post_read(
        &self,
        local: MrSlice,
        remote: RemoteMem,
        wr_id: u64,
        signaled: bool,
    ) -> Result<()> {
        let len = local.len as u32;
        self.post_transmit(
            local,
            wr_id,
            signaled,
            PendingKind::Read { dst: local },
            move |seq, _| Frame::ReadReq {
                seq,
                addr: remote.addr,
                rkey: remote.rkey,
                len,
            },
            false,
        )
    }

    /// Post a one-sided write: push the local segment's bytes into the
    /// remote region. The remote CPU is not involved.
    pub fn post_write(
        &self,
        local: MrSlice,
        remote: RemoteMem,
        wr_id: u64,
        signaled: bool,
    ) -> Result<()> {
        self.post_transmit(
            local,
            wr_id,
            signaled,
            PendingKind::Write,
            move |seq, payload| Frame::WriteReq {
                seq,
                addr: remote.addr,
                rkey: remote.rkey,
                payload,
            },
            true,
        )
    }

    /// Block until the signaled work request `wr_id` completes.
    ///
    /// Any completion with non-success status fails the wait immediately,
    /// whichever request it belongs to. Successful completions for other
    /// requests are stashed and handed back to later waits in arrival
    /// order.
    pub fn wait_signaled(&self, wr_id: u64, timeout: Duration) -> Result<Wc> {
        {
            let mut stash = self.stash.lock().unwrap();
            if let Some(pos) = stash.iter().position(|wc| wc.wr_id == wr_id) {
                let wc = stash.remove(pos).unwrap();
                wc.ok()?;
                return Ok(wc);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::CompletionTimeout(wr_id));
            }
            let Some(wc) = self.shared.cq.poll_one_timeout(deadline - now) else {
                return Err(Error::CompletionTimeout(wr_id));
            };
            wc.ok()?;
            if wc.wr_id == wr_id {
                return Ok(wc);
            }
            log::debug!("stashing completion for wr {} while waiting for {}", wc.wr_id, wr_id);
            self.stash.lock().unwrap().push_back(wc);
        }
    }

    /// Number of receives currently outstanding.
    pub fn outstanding_recvs(&self) -> usize {
        self.shared.recv_queue.lock().unwrap().len()
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        let mut conn = self.conn.lock().unwrap();
        if let Some(mut c) = conn.take() {
            // Orderly notice first; the peer flushes its pending work.
            {
                let mut w = c.writer.lock().unwrap();
                let _ = wire::write_frame(&mut *w, &Frame::Disconnect);
            }
            let _ = c.raw.shutdown(Shutdown::Both);
            if let Some(engine) = c.engine.take() {
                engine.join();
            }
        }
    }
}

impl std::fmt::Debug for Qp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Qp<{:p}>", Arc::as_ptr(&self.shared)))
    }
}

/// One side of a reliable connection: the transport resources a role owns,
/// bundled so that teardown runs in strict reverse acquisition order
/// (queue pair, then completion queue, then protection domain).
pub struct Endpoint {
    // Field order is drop order.
    pub qp: Qp,
    pub cq: Cq,
    pub pd: Pd,
}

impl Endpoint {
    /// Acquire the protection domain, completion queue, and queue pair, in
    /// that order, unwinding automatically on partial failure.
    pub fn new(cq_depth: usize, caps: QpCaps) -> Result<Self> {
        let pd = Pd::alloc()?;
        let cq = Cq::new(cq_depth)?;
        let qp = Qp::create(&pd, &cq, caps)?;
        Ok(Self { qp, cq, pd })
    }
}

pub(crate) fn wc_entry(wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: usize) -> Wc {
    Wc {
        wr_id,
        status,
        opcode,
        byte_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_validates_caps() {
        let pd = Pd::alloc().unwrap();
        let cq = Cq::new(4).unwrap();
        assert!(Qp::create(&pd, &cq, QpCaps::default()).is_ok());
        assert!(Qp::create(
            &pd,
            &cq,
            QpCaps {
                max_sge: 2,
                ..QpCaps::default()
            }
        )
        .is_err());
        assert!(Qp::create(
            &pd,
            &cq,
            QpCaps {
                max_send_wr: 0,
                ..QpCaps::default()
            }
        )
        .is_err());
    }

    #[test]
    fn posts_require_a_connection_or_registration() {
        let pd = Pd::alloc().unwrap();
        let cq = Cq::new(4).unwrap();
        let qp = Qp::create(&pd, &cq, QpCaps::default()).unwrap();

        // Unregistered segment: rejected at post time.
        let bogus = MrSlice {
            addr: 0x1000,
            len: 16,
            lkey: 1,
        };
        assert!(matches!(qp.post_recv(bogus, 1), Err(Error::Io(_))));

        // Registered segment but no connection: send cannot be posted,
        // receive can (and must, for pre-connection traffic).
        let mut buf = [0u8; 64];
        let mr = unsafe {
            crate::fabric::mr::Mr::reg(&pd, buf.as_mut_ptr(), buf.len(), Permission::default())
        }
        .unwrap();
        assert!(qp.post_recv(mr.as_slice(), 2).is_ok());
        assert_eq!(qp.outstanding_recvs(), 1);
        assert!(matches!(
            qp.post_send(mr.as_slice(), 3, true),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn recv_queue_depth_is_bounded() {
        let pd = Pd::alloc().unwrap();
        let cq = Cq::new(4).unwrap();
        let qp = Qp::create(
            &pd,
            &cq,
            QpCaps {
                max_recv_wr: 2,
                ..QpCaps::default()
            },
        )
        .unwrap();

        let mut buf = [0u8; 64];
        let mr = unsafe {
            crate::fabric::mr::Mr::reg(&pd, buf.as_mut_ptr(), buf.len(), Permission::default())
        }
        .unwrap();
        qp.post_recv(mr.as_slice(), 1).unwrap();
        qp.post_recv(mr.as_slice(), 2).unwrap();
        assert!(matches!(
            qp.post_recv(mr.as_slice(), 3),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock
        ));
    }
}
