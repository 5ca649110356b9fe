//! One-sided remote memory access session.
//!
//! The reason the rest of the crate exists: given a resolved remote memory
//! descriptor, read a prefix of the remote region, mutate purely locally,
//! write the mutation back, and verify it landed by reading again. Every
//! step blocks on its own completion before the next is issued; the remote
//! CPU is involved in none of them.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::fabric::mr::RemoteMem;
use crate::fabric::qp::Qp;
use crate::proto::wr_id;
use crate::utils::registered_mem::RegisteredMem;

/// What a completed session observed.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Bytes of the remote region prefix as first read.
    pub observed: Vec<u8>,
    /// Bytes read back after the write (prefix of the same length).
    pub verified: Vec<u8>,
}

/// A one-sided access session against one remote region.
pub struct RmaSession<'a> {
    qp: &'a Qp,
    remote: RemoteMem,
    timeout: Duration,
}

impl<'a> RmaSession<'a> {
    /// Open a session over an established queue pair.
    pub fn new(qp: &'a Qp, remote: RemoteMem, timeout: Duration) -> Self {
        Self {
            qp,
            remote,
            timeout,
        }
    }

    /// One-sided read of `local.len` bytes from the remote region into
    /// `local`, blocking until completion.
    pub fn read_into(&self, local: crate::MrSlice, wr: u64) -> Result<()> {
        self.qp.post_read(local, self.remote, wr, true)?;
        self.qp.wait_signaled(wr, self.timeout)?;
        Ok(())
    }

    /// One-sided write of `local`'s bytes into the remote region,
    /// blocking until completion.
    pub fn write_from(&self, local: crate::MrSlice, wr: u64) -> Result<()> {
        self.qp.post_write(local, self.remote, wr, true)?;
        self.qp.wait_signaled(wr, self.timeout)?;
        Ok(())
    }

    /// The full read → mutate → write → verify sequence.
    ///
    /// `scratch` supplies the local staging memory (at least
    /// `prefix_len.max(message.len())` bytes); `message` is the mutation
    /// written at the start of the remote region. Returns what was
    /// observed before the write and what was read back after it; the
    /// read-back must reproduce `message` byte for byte or the session
    /// fails with [`Error::Verification`].
    pub fn run(
        &self,
        scratch: &mut RegisteredMem,
        message: &[u8],
        prefix_len: usize,
    ) -> Result<SessionOutcome> {
        let span = prefix_len.max(message.len());
        let slice = scratch
            .get_slice(0..span)
            .ok_or_else(|| Error::Registration("scratch smaller than session span".into()))?;

        // (1) Observe the remote prefix.
        let read_slice = scratch
            .get_slice(0..prefix_len)
            .ok_or_else(|| Error::Registration("scratch smaller than read prefix".into()))?;
        self.read_into(read_slice, wr_id::RMA_READ)?;
        let observed = scratch[..prefix_len].to_vec();

        // (2) Mutation happens entirely in local memory: the remote role
        // cannot observe this step.
        scratch[..span].fill(0);
        scratch[..message.len()].copy_from_slice(message);

        // (3) Push the mutation.
        let write_slice = scratch
            .get_slice(0..message.len())
            .ok_or_else(|| Error::Registration("scratch smaller than message".into()))?;
        self.write_from(write_slice, wr_id::RMA_WRITE)?;

        // (4) Read back and compare against what was written.
        scratch[..span].fill(0);
        self.read_into(slice, wr_id::RMA_VERIFY)?;
        let verified = scratch[..span].to_vec();
        if let Some(bad) = message
            .iter()
            .zip(verified.iter())
            .position(|(a, b)| a != b)
        {
            return Err(Error::Verification(bad));
        }

        Ok(SessionOutcome { observed, verified })
    }
}
