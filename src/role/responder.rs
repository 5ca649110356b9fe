//! Responder role: expose a region and let the peer rummage in it.

use std::net::SocketAddr;
use std::time::Duration;

use crate::cm::{CmEvent, EventChannel, Listener};
use crate::config::Config;
use crate::error::Result;
use crate::fabric::qp::{Endpoint, QpCaps};
use crate::proto::exchange;
use crate::utils::{self, RegisteredMem};

/// A served connection, held open so the peer's one-sided traffic keeps
/// landing in [`region`](Self::region_bytes) after [`run`] returns.
///
/// Dropping this tears the whole session down: queue pair and engine
/// first, then the registered memory, then the listening identity and its
/// event channel.
pub struct Served {
    // Field order is drop order.
    endpoint: Endpoint,
    region: RegisteredMem,
    _ctrl: RegisteredMem,
    listener: Listener,
    peer: SocketAddr,
}

impl Served {
    /// Address of the connected initiator.
    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The exposed region's current contents.
    ///
    /// The peer mutates this memory without any local completion, so two
    /// calls may disagree; that is the point of the exercise.
    #[inline]
    pub fn region_bytes(&self) -> &[u8] {
        &self.region
    }

    /// Number of receives still outstanding on the data queue pair.
    #[inline]
    pub fn outstanding_recvs(&self) -> usize {
        self.endpoint.qp.outstanding_recvs()
    }

    /// Block up to `timeout` for the peer's disconnect notice.
    pub fn wait_disconnect(&mut self, timeout: Duration) -> bool {
        matches!(
            self.listener.wait_event(timeout),
            Some(CmEvent::Disconnected)
        )
    }
}

/// Run the responder up to the end of its active part: bind and listen,
/// accept one connection, expose the greeting region, hand the initiator
/// its descriptor, and push the bulk payload once the initiator signals
/// ready.
///
/// Returns the live session; the caller decides how long to keep the
/// region observable.
pub fn run(config: &Config) -> Result<Served> {
    utils::lock_memory_hint();

    let channel = EventChannel::new();
    let mut listener = Listener::bind_and_listen(channel, config.port, config.backlog)?;
    let pending = listener.accept_next(config.accept_timeout())?;
    let peer = pending.peer_addr();

    let endpoint = Endpoint::new(config.cq_depth, QpCaps::default())?;

    // The exposed region: zero-filled, greeting at the front, the
    // terminator implicit in the zero fill.
    let mut region = RegisteredMem::new(&endpoint.pd, config.region_len)?;
    let greeting = config.greeting.as_bytes();
    region[..greeting.len()].copy_from_slice(greeting);

    let mut ctrl = RegisteredMem::with_permission(
        &endpoint.pd,
        exchange::CTRL_LEN,
        crate::Permission::LOCAL_WRITE,
    )?;

    listener.finalize_accept(pending, &endpoint.qp, config.resolve_timeout())?;

    exchange::responder_offer(
        &endpoint.qp,
        region.mr(),
        &mut ctrl,
        config.completion_timeout(),
    )?;
    exchange::responder_push_bulk(
        &endpoint.qp,
        region.mr(),
        config.bulk_len,
        config.completion_timeout(),
    )?;
    log::info!("serving region of {} bytes to {peer}", config.region_len);

    Ok(Served {
        endpoint,
        region,
        _ctrl: ctrl,
        listener,
        peer,
    })
}
