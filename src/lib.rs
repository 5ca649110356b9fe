//! A library for one-sided remote memory access over a reliable,
//! connection-oriented, memory-semantic fabric.
//!
//! `farmem` lets one peer read and write another peer's pinned memory
//! without invoking the remote CPU for each operation. The crate is split
//! along the natural seams of such a system:
//!
//! - [`fabric`] holds the transport resources: protection domains ([`Pd`]),
//!   completion queues ([`Cq`]), queue pairs ([`Qp`]) and memory regions
//!   ([`Mr`]). Resource holder types are `Arc`-based: cloning them clones a
//!   reference to the same underlying resource, which drastically simplifies
//!   ownership when a resource is shared between the application thread and
//!   the fabric engine.
//! - [`cm`] drives connection establishment for both roles as an explicit
//!   state machine over a small event vocabulary.
//! - [`proto`] layers the descriptor exchange and the one-sided
//!   read/write/verify session on top of an established connection.
//! - [`role`] provides the two end-to-end drivers (initiator and responder)
//!   over the shared component set.
//!
//! The fabric itself is emulated over TCP: every established connection owns
//! an engine thread that plays the role of the NIC, servicing inbound
//! one-sided operations against the local region table and delivering
//! completions. Code written against [`Qp`] and [`Cq`] never observes the
//! difference.
//!
//! # Example
//!
//! ```no_run
//! use farmem::prelude::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let pd = Pd::alloc()?;
//!     let cq = Cq::new(Cq::DEFAULT_CQ_DEPTH)?;
//!     let qp = Qp::create(&pd, &cq, QpCaps::default())?;
//!
//!     let buf = RegisteredMem::new(&pd, 4096)?;
//!     let _ = (qp, buf);
//!     Ok(())
//! }
//! ```

mod error;

pub mod cm;
pub mod config;
pub mod fabric;
pub mod prelude;
pub mod proto;
pub mod role;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use fabric::{cq::*, mr::*, pd::Pd, qp::*};
