//! Fabric resources and the emulated transport beneath them.
//!
//! The resource types here mirror the verbs-style vocabulary: a protection
//! domain ([`pd::Pd`]) isolates registrations and keys, a completion queue
//! ([`cq::Cq`]) is the notification sink for signaled work, a queue pair
//! ([`qp::Qp`]) issues all operations on one connection, and a memory region
//! ([`mr::Mr`]) is a pinned, capability-tagged span of local memory.
//!
//! Instead of hardware, each established connection is backed by an
//! [`engine`] thread that owns the socket's read side. It services inbound
//! one-sided READ/WRITE requests against the local region table without
//! involving the application thread, matches inbound sends to posted
//! receives, and resolves acknowledgements for outbound work into
//! completions.

pub mod cq;
pub mod mr;
pub mod pd;
pub mod qp;

pub(crate) mod engine;
pub(crate) mod wire;
