//! Connection state machines as pure data.
//!
//! Both role machines share one event vocabulary and one transition
//! function, so the legality of every `(state, event)` pair can be tested
//! without a live fabric. The I/O wait lives entirely behind
//! [`EventSource`]; the state machine itself never blocks.
//!
//! [`EventSource`]: super::EventSource

use crate::cm::CmEvent;
use crate::error::{Error, Result};

/// Connection states across both roles.
///
/// Initiator path: `Init → ResolvingAddr → AddrResolved → ResolvingRoute →
/// RouteResolved → Connecting → Established`.
///
/// Responder path: `Init → Bound → Listening → ConnectRequestReceived →
/// Accepted → Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmState {
    Init,
    // Initiator.
    ResolvingAddr,
    AddrResolved,
    ResolvingRoute,
    RouteResolved,
    Connecting,
    // Responder.
    Bound,
    Listening,
    ConnectRequestReceived,
    Accepted,
    // Terminal.
    Established,
    Disconnected,
}

/// The event a waiting state expects, if the state waits at all.
///
/// States that advance by a local action (submitting an operation) rather
/// than by observing an event return `None`.
pub fn expected_event(state: CmState) -> Option<CmEvent> {
    match state {
        CmState::ResolvingAddr => Some(CmEvent::AddrResolved),
        CmState::ResolvingRoute => Some(CmEvent::RouteResolved),
        CmState::Connecting | CmState::Accepted => Some(CmEvent::Established),
        CmState::Listening => Some(CmEvent::ConnectRequest),
        _ => None,
    }
}

/// Advance the machine by one observed event.
///
/// Receiving any event other than the one the current state expects is a
/// fatal [`Error::UnexpectedEvent`]; the caller aborts the session and
/// unwinds.
pub fn step(state: CmState, event: CmEvent) -> Result<CmState> {
    let next = match (state, event) {
        (CmState::ResolvingAddr, CmEvent::AddrResolved) => CmState::AddrResolved,
        (CmState::ResolvingRoute, CmEvent::RouteResolved) => CmState::RouteResolved,
        (CmState::Connecting, CmEvent::Established) => CmState::Established,
        (CmState::Listening, CmEvent::ConnectRequest) => CmState::ConnectRequestReceived,
        (CmState::Accepted, CmEvent::Established) => CmState::Established,
        (CmState::Established, CmEvent::Disconnected) => CmState::Disconnected,
        (state, actual) => {
            return Err(Error::UnexpectedEvent {
                state,
                expected: expected_event(state),
                actual,
            })
        }
    };
    Ok(next)
}

/// Advance the machine by a locally submitted operation (no event involved).
pub fn submit(state: CmState, next: CmState) -> CmState {
    debug_assert!(matches!(
        (state, next),
        (CmState::Init, CmState::ResolvingAddr)
            | (CmState::AddrResolved, CmState::ResolvingRoute)
            | (CmState::RouteResolved, CmState::Connecting)
            | (CmState::Init, CmState::Bound)
            | (CmState::Bound, CmState::Listening)
            | (CmState::ConnectRequestReceived, CmState::Accepted)
    ));
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_EVENTS: [CmEvent; 6] = [
        CmEvent::AddrResolved,
        CmEvent::RouteResolved,
        CmEvent::ConnectRequest,
        CmEvent::Established,
        CmEvent::Disconnected,
        CmEvent::Error,
    ];

    #[test]
    fn initiator_happy_path() {
        let mut s = CmState::Init;
        s = submit(s, CmState::ResolvingAddr);
        s = step(s, CmEvent::AddrResolved).unwrap();
        assert_eq!(s, CmState::AddrResolved);
        s = submit(s, CmState::ResolvingRoute);
        s = step(s, CmEvent::RouteResolved).unwrap();
        assert_eq!(s, CmState::RouteResolved);
        s = submit(s, CmState::Connecting);
        s = step(s, CmEvent::Established).unwrap();
        assert_eq!(s, CmState::Established);
    }

    #[test]
    fn responder_happy_path() {
        let mut s = CmState::Init;
        s = submit(s, CmState::Bound);
        s = submit(s, CmState::Listening);
        s = step(s, CmEvent::ConnectRequest).unwrap();
        assert_eq!(s, CmState::ConnectRequestReceived);
        s = submit(s, CmState::Accepted);
        s = step(s, CmEvent::Established).unwrap();
        assert_eq!(s, CmState::Established);
    }

    #[test]
    fn disconnect_after_establishment() {
        let s = step(CmState::Established, CmEvent::Disconnected).unwrap();
        assert_eq!(s, CmState::Disconnected);
    }

    #[test]
    fn every_wrong_event_is_rejected() {
        let waiting_states = [
            CmState::ResolvingAddr,
            CmState::ResolvingRoute,
            CmState::Connecting,
            CmState::Listening,
            CmState::Accepted,
        ];
        for state in waiting_states {
            let expected = expected_event(state).unwrap();
            for event in ALL_EVENTS {
                let res = step(state, event);
                if event == expected {
                    assert!(res.is_ok(), "{state:?} must accept {event}");
                } else {
                    match res {
                        Err(Error::UnexpectedEvent {
                            state: s,
                            expected: exp,
                            actual,
                        }) => {
                            assert_eq!(s, state);
                            assert_eq!(exp, Some(expected));
                            assert_eq!(actual, event);
                        }
                        other => panic!("{state:?} × {event} must fail, got {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn non_waiting_states_reject_all_events() {
        for state in [CmState::Init, CmState::Bound, CmState::Disconnected] {
            assert_eq!(expected_event(state), None);
            for event in ALL_EVENTS {
                assert!(step(state, event).is_err());
            }
        }
    }
}
