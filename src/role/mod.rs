//! The two session roles.
//!
//! Both roles are thin drivers over the same component set: connection
//! management, an [`Endpoint`](crate::Endpoint), registered memory, the
//! descriptor exchange, and (on the initiator side) the one-sided session.
//! Neither role owns any logic of its own beyond acquisition order.
//!
//! Resources are acquired in a fixed order (event source, connection
//! identity, protection domain, completion queue, queue pair, registered
//! memory) and released in reverse, with one deliberate exception: the
//! queue pair and its engine go down before any registered memory, since
//! the engine is the party that touches that memory on the peer's behalf.
//! In Rust this is field and binding declaration order doing its job.

pub mod initiator;
pub mod responder;

pub use initiator::InitiatorOutcome;
pub use responder::Served;
