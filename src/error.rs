//! Crate-wide error taxonomy.
//!
//! Every error here is terminal for the session that observed it: nothing is
//! retried internally, and resources unwind in reverse acquisition order via
//! ownership as the error propagates.

use std::io;

use thiserror::Error;

use crate::cm::{CmEvent, CmState};
use crate::fabric::cq::WcStatus;

/// Errors produced by fabric resources and the protocol layers above them.
#[derive(Debug, Error)]
pub enum Error {
    /// A fabric resource (event channel, connection identity, protection
    /// domain, completion queue, queue pair) could not be created.
    #[error("failed to acquire {resource}")]
    ResourceAcquisition {
        resource: &'static str,
        #[source]
        source: io::Error,
    },

    /// The target address could not be resolved within the bounded wait.
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// The route to a resolved address could not be determined.
    #[error("route resolution failed: {0}")]
    RouteResolution(String),

    /// The listening identity could not be bound (address in use, permission
    /// failure).
    #[error("failed to bind listener")]
    Bind(#[source] io::Error),

    /// The peer actively rejected the connection request.
    #[error("connection rejected by peer")]
    ConnectionRejected,

    /// Connection establishment did not terminate in `Established`. Covers
    /// both initiator connect failure and responder accept failure.
    #[error("connection establishment failed: {0}")]
    ConnectionEstablishment(String),

    /// The event source delivered an event other than the one the current
    /// state expects.
    #[error("unexpected event in state {state:?}: expected {expected:?}, got {actual:?}")]
    UnexpectedEvent {
        state: CmState,
        expected: Option<CmEvent>,
        actual: CmEvent,
    },

    /// The fabric could not pin the requested memory range.
    #[error("memory registration failed: {0}")]
    Registration(String),

    /// Deregistration was attempted while work requests referencing the
    /// region are still outstanding.
    #[error("memory region busy: {0} work request(s) outstanding")]
    RegionBusy(usize),

    /// The bounded wait for a signaled work request's completion expired.
    #[error("timed out waiting for completion of work request {0}")]
    CompletionTimeout(u64),

    /// A signaled work request completed with non-success status.
    #[error("work request {wr_id} completed with status: {status}")]
    WorkCompletion { wr_id: u64, status: WcStatus },

    /// Read-back after a one-sided write observed different bytes.
    #[error("read-back verification failed at byte {0}")]
    Verification(usize),

    /// The configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error on the underlying fabric transport.
    #[error("fabric I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Wrap an I/O error as a resource acquisition failure.
    pub(crate) fn acquisition(resource: &'static str, source: io::Error) -> Self {
        Self::ResourceAcquisition { resource, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
