//! Completion queue and work completion.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::{Error, Result};

/// Opcode of a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// One-sided write request.
    RdmaWrite,
    /// One-sided read request.
    RdmaRead,
    /// Receive request.
    Recv,
}

/// Status of a completion queue entry.
///
/// Any status other than [`Success`] is fatal for the session that observes
/// it; the design makes no attempt to retry a failed operation.
///
/// [`Success`]: WcStatus::Success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// Operation completed successfully; the buffers it referenced are
    /// ready to be reused.
    #[error("success")]
    Success,

    /// A posted receive was too small for the incoming message.
    #[error("local length error")]
    LocLenErr,

    /// A locally posted work request referenced a segment that is not
    /// covered by a valid registration for the requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// The remote side rejected the access: invalid remote key, range out
    /// of bounds, or missing remote permission.
    #[error("remote access error")]
    RemAccessErr,

    /// The peer had no receive outstanding for our send.
    #[error("receiver not ready")]
    RnrRetryExceeded,

    /// The work request was flushed because the connection went away before
    /// it could complete.
    #[error("work request flushed")]
    FlushErr,
}

impl WcStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// Work completion entry.
#[derive(Debug, Clone, Copy)]
pub struct Wc {
    /// User-specified ID of the corresponding work request.
    pub wr_id: u64,
    /// Completion status.
    pub status: WcStatus,
    /// Opcode of the completed work request.
    pub opcode: WcOpcode,
    /// Number of bytes transferred, meaningful for receives and reads.
    pub byte_len: usize,
}

impl Wc {
    /// Interpret this completion as a `Result`, mapping any non-success
    /// status to [`Error::WorkCompletion`].
    pub fn ok(&self) -> Result<()> {
        if self.status.is_success() {
            Ok(())
        } else {
            Err(Error::WorkCompletion {
                wr_id: self.wr_id,
                status: self.status,
            })
        }
    }
}

struct CqQueue {
    entries: VecDeque<Wc>,
}

/// Ownership holder of completion queue.
struct CqInner {
    queue: Mutex<CqQueue>,
    avail: Condvar,
    capacity: usize,
}

/// Completion queue.
///
/// The notification sink where outcomes of signaled operations appear.
/// Polling is the sole synchronization primitive of the execution model:
/// a caller's forward progress is gated on observing the completion of its
/// previously issued operation. Besides the non-blocking [`poll_one`], the
/// queue offers a blocking wait with a bounded timeout so callers are not
/// forced into a busy loop.
///
/// [`poll_one`]: Cq::poll_one
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: usize = 16;

    /// Create a new completion queue with the given capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ResourceAcquisition {
                resource: "completion queue",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "zero CQ capacity",
                ),
            });
        }
        Ok(Self {
            inner: Arc::new(CqInner {
                queue: Mutex::new(CqQueue {
                    entries: VecDeque::with_capacity(capacity),
                }),
                avail: Condvar::new(),
                capacity,
            }),
        })
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Deliver a completion. Called by the engine and by posting paths that
    /// fail local validation.
    pub(crate) fn push(&self, wc: Wc) {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.entries.len() >= self.inner.capacity {
            // Overrun mirrors a fatal CQ error on real hardware; keep the
            // entry anyway so the session observes *something* and dies on
            // its status check rather than hanging.
            log::error!("completion queue overrun (capacity {})", self.inner.capacity);
        }
        queue.entries.push_back(wc);
        self.inner.avail.notify_one();
    }

    /// Non-blockingly poll one work completion.
    ///
    /// Returns `None` if no completion has arrived yet. It is the caller's
    /// responsibility to check the status code of the returned entry.
    #[inline]
    pub fn poll_one(&self) -> Option<Wc> {
        self.inner.queue.lock().unwrap().entries.pop_front()
    }

    /// Blockingly poll one work completion, waiting at most `timeout`.
    ///
    /// Returns `None` if the timeout expires with the queue still empty.
    pub fn poll_one_timeout(&self, timeout: Duration) -> Option<Wc> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if let Some(wc) = queue.entries.pop_front() {
                return Some(wc);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .avail
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = guard;
        }
    }
}

impl std::fmt::Debug for Cq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Cq<{:p}>", Arc::as_ptr(&self.inner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wc(wr_id: u64, status: WcStatus) -> Wc {
        Wc {
            wr_id,
            status,
            opcode: WcOpcode::Send,
            byte_len: 0,
        }
    }

    #[test]
    fn poll_returns_in_delivery_order() {
        let cq = Cq::new(4).unwrap();
        cq.push(wc(1, WcStatus::Success));
        cq.push(wc(2, WcStatus::Success));
        assert_eq!(cq.poll_one().unwrap().wr_id, 1);
        assert_eq!(cq.poll_one().unwrap().wr_id, 2);
        assert!(cq.poll_one().is_none());
    }

    #[test]
    fn timeout_poll_observes_cross_thread_delivery() {
        let cq = Cq::new(4).unwrap();
        let pusher = cq.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            pusher.push(wc(7, WcStatus::Success));
        });
        let got = cq.poll_one_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.wr_id, 7);
        t.join().unwrap();
    }

    #[test]
    fn timeout_expires_empty() {
        let cq = Cq::new(4).unwrap();
        assert!(cq.poll_one_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn failed_status_maps_to_error() {
        let entry = wc(3, WcStatus::RemAccessErr);
        assert!(matches!(
            entry.ok(),
            Err(Error::WorkCompletion {
                wr_id: 3,
                status: WcStatus::RemAccessErr
            })
        ));
        assert!(wc(4, WcStatus::Success).ok().is_ok());
    }
}
