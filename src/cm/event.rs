//! Connection management events and the event source they arrive through.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// The event vocabulary shared by both role state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    ConnectRequest,
    Established,
    Disconnected,
    Error,
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmEvent::AddrResolved => "ADDR_RESOLVED",
            CmEvent::RouteResolved => "ROUTE_RESOLVED",
            CmEvent::ConnectRequest => "CONNECT_REQUEST",
            CmEvent::Established => "ESTABLISHED",
            CmEvent::Disconnected => "DISCONNECTED",
            CmEvent::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Something that delivers connection management events, one at a time.
///
/// The production implementation is [`EventChannel`]; tests substitute
/// scripted sources so the state machines run without any I/O.
pub trait EventSource {
    /// Wait for the next event, up to `timeout`. `None` means the bounded
    /// wait expired (or the source is gone) with no event observed.
    fn next_event(&mut self, timeout: Duration) -> Option<CmEvent>;

    /// Deliver an operation's outcome into the source. The production
    /// channel feeds its own queue; a scripted source decides for itself
    /// what the next event is and may ignore this.
    fn notify(&self, event: CmEvent);
}

/// The event channel: first resource acquired by either role, last one
/// released. Operations that drive the state machine push their outcome
/// here; the state machine consumes events in order.
pub struct EventChannel {
    tx: Sender<CmEvent>,
    rx: Receiver<CmEvent>,
}

impl EventChannel {
    /// Create a new event channel.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    /// Get a producer handle, for the fabric side of the channel.
    pub(crate) fn sender(&self) -> Sender<CmEvent> {
        self.tx.clone()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for EventChannel {
    fn next_event(&mut self, timeout: Duration) -> Option<CmEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => Some(ev),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn notify(&self, event: CmEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_delivers_in_order() {
        let mut ch = EventChannel::new();
        let tx = ch.sender();
        tx.send(CmEvent::AddrResolved).unwrap();
        tx.send(CmEvent::RouteResolved).unwrap();
        assert_eq!(
            ch.next_event(Duration::from_millis(100)),
            Some(CmEvent::AddrResolved)
        );
        assert_eq!(
            ch.next_event(Duration::from_millis(100)),
            Some(CmEvent::RouteResolved)
        );
        assert_eq!(ch.next_event(Duration::from_millis(10)), None);
    }
}
