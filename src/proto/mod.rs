//! The protocol layered on an established connection.
//!
//! Two pieces, run strictly in order: the descriptor [`exchange`], which
//! hands the initiator a remote memory descriptor over the two-sided path,
//! and the one-sided [`session`], which uses that descriptor to read,
//! write, and verify remote memory without involving the remote CPU.

pub mod exchange;
pub mod session;

/// Well-known work request IDs used by the protocol steps.
pub(crate) mod wr_id {
    /// Responder's send carrying the descriptor.
    pub const DESC_SEND: u64 = 1;
    /// Initiator's pre-posted receive for the descriptor.
    pub const DESC_RECV: u64 = 2;
    /// Initiator's one-sided read of the region prefix.
    pub const RMA_READ: u64 = 3;
    /// Initiator's one-sided write of its message.
    pub const RMA_WRITE: u64 = 4;
    /// Initiator's verification read.
    pub const RMA_VERIFY: u64 = 5;
    /// Responder's push of the bulk payload.
    pub const BULK_SEND: u64 = 6;
    /// Initiator's receive for the bulk payload.
    pub const BULK_RECV: u64 = 7;
    /// The 1-byte readiness signal, both sides.
    pub const READY_SIGNAL: u64 = 100;
}
