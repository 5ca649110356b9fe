//! Connection management.
//!
//! Establishment is a per-role state machine over one shared event
//! vocabulary: every transition submits an operation, then blocks on the
//! event source for exactly the matching event. Any other event, or the
//! absence of the expected one within a bounded wait, is fatal and unwinds
//! the session.
//!
//! The machines themselves are pure data in [`state`]; this module supplies
//! the two drivers: [`Connecter`] for the initiator role and [`Listener`]
//! for the responder role. Both are generic over [`EventSource`], so tests
//! can drive them with scripted events; the production source is
//! [`EventChannel`], and only a channel-backed driver can finish
//! establishment (the engine needs the channel's sender for disconnect
//! notices). A [`Listener`] is only ever a listening identity: each
//! accepted connection gets its own [`PendingConnection`], and only that
//! identity carries data traffic.

mod event;
pub mod state;

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

pub use self::event::{CmEvent, EventChannel, EventSource};
pub use self::state::CmState;

use crate::error::{Error, Result};
use crate::fabric::qp::Qp;
use crate::fabric::wire::{self, Frame};

/// Interval at which a bounded accept wait re-checks its deadline.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Initiator-side connection driver.
///
/// Drives `Init → ResolvingAddr → AddrResolved → ResolvingRoute →
/// RouteResolved → Connecting → Established`, one submitted operation and
/// one awaited event per transition.
pub struct Connecter<S = EventChannel> {
    channel: S,
    state: CmState,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl<S: EventSource> Connecter<S> {
    /// Create a connecter over an arbitrary event source.
    pub fn with_source(channel: S) -> Self {
        Self {
            channel,
            state: CmState::Init,
            stream: None,
            peer: None,
        }
    }

    /// Get the current connection state.
    #[inline]
    pub fn state(&self) -> CmState {
        self.state
    }

    /// Block for the event the current state expects and advance.
    fn await_event(&mut self, timeout: Duration, on_timeout: impl FnOnce() -> Error) -> Result<()> {
        match self.channel.next_event(timeout) {
            Some(ev) => {
                self.state = state::step(self.state, ev)?;
                Ok(())
            }
            None => Err(on_timeout()),
        }
    }

    /// Resolve the responder's address and reach it.
    ///
    /// Fails with [`Error::AddressResolution`] if the host does not resolve
    /// or no matching event arrives in time.
    pub fn resolve_addr(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        self.state = state::submit(self.state, CmState::ResolvingAddr);

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::AddressResolution(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| Error::AddressResolution(format!("no address for {host}")))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Error::AddressResolution(format!("{addr} unreachable: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::acquisition("connection identity", e))?;

        self.peer = Some(addr);
        self.stream = Some(stream);
        self.channel.notify(CmEvent::AddrResolved);
        self.await_event(timeout, || {
            Error::AddressResolution("no ADDR_RESOLVED event within bounded wait".into())
        })
    }

    /// Resolve the route to the already-resolved address.
    pub fn resolve_route(&mut self, timeout: Duration) -> Result<()> {
        self.state = state::submit(self.state, CmState::ResolvingRoute);

        let reachable = self
            .stream
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .is_some();
        if !reachable {
            return Err(Error::RouteResolution("no route to resolved address".into()));
        }
        self.channel.notify(CmEvent::RouteResolved);
        self.await_event(timeout, || {
            Error::RouteResolution("no ROUTE_RESOLVED event within bounded wait".into())
        })
    }

    /// Observe post-establishment events (disconnect notices in particular).
    pub fn wait_event(&mut self, timeout: Duration) -> Option<CmEvent> {
        self.channel.next_event(timeout)
    }
}

impl Connecter<EventChannel> {
    /// Create a new connecter over an already-acquired event channel.
    ///
    /// The channel is deliberately passed in: the event source is the first
    /// resource acquired and the last released.
    pub fn new(channel: EventChannel) -> Self {
        Self::with_source(channel)
    }

    /// Submit the connection request and block for `Established`, binding
    /// the queue pair to the connection on success.
    ///
    /// The queue pair (and anything that must receive pre-connection
    /// traffic, like the descriptor receive) must be set up before this is
    /// called.
    pub fn connect(&mut self, qp: &Qp, timeout: Duration) -> Result<()> {
        self.state = state::submit(self.state, CmState::Connecting);

        let mut stream = self.stream.take().ok_or_else(|| {
            Error::ConnectionEstablishment("connect before address resolution".into())
        })?;

        wire::write_frame(&mut stream, &Frame::ConnectReq)
            .map_err(|e| Error::ConnectionEstablishment(format!("connect request failed: {e}")))?;

        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::acquisition("connection identity", e))?;
        match wire::read_frame(&mut stream) {
            Ok(Frame::ConnectAccept) => {}
            Ok(Frame::ConnectReject) => return Err(Error::ConnectionRejected),
            Ok(other) => {
                return Err(Error::ConnectionEstablishment(format!(
                    "unexpected reply to connect request: {other:?}"
                )))
            }
            Err(e) => {
                return Err(Error::ConnectionEstablishment(format!(
                    "no reply to connect request: {e}"
                )))
            }
        }
        stream
            .set_read_timeout(None)
            .map_err(|e| Error::acquisition("connection identity", e))?;

        self.channel.notify(CmEvent::Established);
        self.await_event(timeout, || {
            Error::ConnectionEstablishment("no ESTABLISHED event within bounded wait".into())
        })?;

        qp.activate(stream, self.channel.sender())?;
        if let Some(peer) = self.peer {
            log::debug!("connected to {peer}");
        }
        Ok(())
    }
}

impl<S> fmt::Debug for Connecter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connecter")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish()
    }
}

/// A connection request accepted from the wire, not yet finalized.
///
/// This identity is distinct from the listening identity that produced it;
/// only this one ever carries data.
pub struct PendingConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl PendingConnection {
    /// Address of the connecting peer.
    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Responder-side connection driver.
///
/// Drives `Init → Bound → Listening → ConnectRequestReceived → Accepted →
/// Established`.
pub struct Listener<S = EventChannel> {
    channel: S,
    listener: TcpListener,
    state: CmState,
}

impl<S: EventSource> Listener<S> {
    /// Bind the listening identity and start listening.
    ///
    /// `backlog` is recorded for parity with the fabric interface; the
    /// platform listener applies its own queue depth. Fails with
    /// [`Error::Bind`] on address-in-use or permission failure.
    pub fn bind_and_listen(channel: S, port: u16, backlog: u32) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(Error::Bind)?;
        log::debug!(
            "listening on {} (backlog {backlog})",
            listener.local_addr().map_err(Error::Bind)?
        );

        let state = state::submit(CmState::Init, CmState::Bound);
        let state = state::submit(state, CmState::Listening);
        Ok(Self {
            channel,
            listener,
            state,
        })
    }

    /// Get the current connection state.
    #[inline]
    pub fn state(&self) -> CmState {
        self.state
    }

    /// Port the listening identity is bound to.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr().map_err(Error::Bind)?.port())
    }

    /// Block until a connection request is observed, up to `timeout`.
    pub fn accept_next(&mut self, timeout: Duration) -> Result<PendingConnection> {
        let deadline = Instant::now() + timeout;
        self.listener
            .set_nonblocking(true)
            .map_err(|e| Error::acquisition("connection identity", e))?;

        let (mut stream, peer) = loop {
            match self.listener.accept() {
                Ok(conn) => break conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::ConnectionEstablishment(
                            "no connection request within bounded wait".into(),
                        ));
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(Error::acquisition("connection identity", e)),
            }
        };

        stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_nodelay(true))
            .and_then(|_| stream.set_read_timeout(Some(timeout)))
            .map_err(|e| Error::acquisition("connection identity", e))?;
        match wire::read_frame(&mut stream) {
            Ok(Frame::ConnectReq) => {}
            Ok(other) => {
                return Err(Error::ConnectionEstablishment(format!(
                    "expected connect request, got {other:?}"
                )))
            }
            Err(e) => {
                return Err(Error::ConnectionEstablishment(format!(
                    "malformed connect request: {e}"
                )))
            }
        }
        stream
            .set_read_timeout(None)
            .map_err(|e| Error::acquisition("connection identity", e))?;

        self.channel.notify(CmEvent::ConnectRequest);
        match self.channel.next_event(timeout) {
            Some(ev) => self.state = state::step(self.state, ev)?,
            None => {
                return Err(Error::ConnectionEstablishment(
                    "no CONNECT_REQUEST event within bounded wait".into(),
                ))
            }
        }

        log::debug!("connection request from {peer}");
        Ok(PendingConnection { stream, peer })
    }

    /// Turn down a pending connection request and resume listening.
    pub fn reject(&mut self, mut pending: PendingConnection) -> Result<()> {
        wire::write_frame(&mut pending.stream, &Frame::ConnectReject).map_err(Error::Io)?;
        // The listening identity stays valid; only the pending one dies.
        self.state = CmState::Listening;
        Ok(())
    }

    /// Observe post-establishment events.
    pub fn wait_event(&mut self, timeout: Duration) -> Option<CmEvent> {
        self.channel.next_event(timeout)
    }
}

impl Listener<EventChannel> {
    /// Submit the accept and block for `Established`, binding the queue
    /// pair to the accepted connection.
    pub fn finalize_accept(
        &mut self,
        mut pending: PendingConnection,
        qp: &Qp,
        timeout: Duration,
    ) -> Result<()> {
        self.state = state::submit(self.state, CmState::Accepted);

        wire::write_frame(&mut pending.stream, &Frame::ConnectAccept)
            .map_err(|e| Error::ConnectionEstablishment(format!("accept failed: {e}")))?;

        self.channel.notify(CmEvent::Established);
        match self.channel.next_event(timeout) {
            Some(ev) => self.state = state::step(self.state, ev)?,
            None => {
                return Err(Error::ConnectionEstablishment(
                    "no ESTABLISHED event within bounded wait".into(),
                ))
            }
        }

        qp.activate(pending.stream, self.channel.sender())?;
        log::debug!("accepted connection from {}", pending.peer);
        Ok(())
    }
}

impl<S> fmt::Debug for Listener<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.state)
            .field("addr", &self.listener.local_addr().ok())
            .finish()
    }
}
