//! The farmem prelude.
//!
//! The purpose of this module is to alleviate imports of common fabric
//! functionalities.

pub use crate::cm::{CmEvent, CmState, Connecter, EventChannel, EventSource, Listener};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::fabric::cq::{Cq, Wc, WcOpcode, WcStatus};
pub use crate::fabric::mr::{Mr, MrSlice, Permission, RemoteMem};
pub use crate::fabric::pd::Pd;
pub use crate::fabric::qp::{Endpoint, Qp, QpCaps};
pub use crate::utils::registered_mem::RegisteredMem;
