//! Authoritative per-peer connection state
//!
//! Each session is keyed by [`PeerAddress`] in a `DashMap`. Compound
//! transitions (reserve, complete discovery, expire) run under the shard
//! lock of a single entry so a discovery completion and a timer expiry can
//! never both win.
//!
//! Removals take a `purge` closure that runs while the entry is still
//! locked. Route teardown happens there, so a connect to the same address
//! can only reserve a new session once the old routes are gone.

use crate::executor::TimerId;
use crate::transport::TransportHandle;
use crate::types::{PeerAddress, PeerInfo, PeerState, Topology};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle event that arrived before the attempt was announced
#[derive(Debug, Clone)]
enum Early {
    LinkLost,
    Discovered(Topology),
}

#[derive(Debug, Clone)]
struct PeerSession {
    state: PeerState,
    handle: Option<TransportHandle>,
    /// Set once the caller has been told the attempt started
    announced: bool,
    early: Option<Early>,
    timer: Option<TimerId>,
    topology: Option<Arc<Topology>>,
    mtu: Option<u16>,
    connected_seq: u64,
    connected_at: Option<DateTime<Utc>>,
}

impl PeerSession {
    fn idle() -> Self {
        Self {
            state: PeerState::Idle,
            handle: None,
            announced: false,
            early: None,
            timer: None,
            topology: None,
            mtu: None,
            connected_seq: 0,
            connected_at: None,
        }
    }

    fn snapshot(&self, address: &PeerAddress) -> PeerInfo {
        PeerInfo {
            address: address.clone(),
            state: self.state,
            mtu: self.mtu,
            connected_at: self.connected_at,
        }
    }
}

/// State left behind by a purged session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSession {
    pub state: PeerState,
    pub handle: Option<TransportHandle>,
    pub timer: Option<TimerId>,
}

impl From<PeerSession> for RemovedSession {
    fn from(session: PeerSession) -> Self {
        Self {
            state: session.state,
            handle: session.handle,
            timer: session.timer,
        }
    }
}

/// Outcome of reserving a peer for a connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginConnect {
    /// The peer is now Connecting; any stale handle must be closed
    Reserved { stale: Option<TransportHandle> },
    /// An attempt is already running or the peer is connected
    Busy(PeerState),
}

/// Outcome of announcing a started attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announce<R> {
    /// Still waiting for the link; the timer is now stored
    Pending,
    /// Discovery already completed, the peer is Connected. The caller keeps
    /// the timer and must cancel it.
    Connected,
    /// The link failed before the announcement; the session is purged
    LinkLost { removed: RemovedSession, purged: R },
    /// The attempt was torn down by someone else
    Cancelled,
}

/// Outcome of a services-discovered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// Connecting → Connected. The timer is handed out exactly once.
    Connected { timer: Option<TimerId> },
    /// Held until the attempt is announced
    Deferred,
    /// Rediscovery on a connected peer replaced the topology
    Refreshed,
    /// No session matches the handle
    Ignored,
}

/// Outcome of a link-down event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDown<R> {
    Removed { removed: RemovedSession, purged: R },
    /// Held until the attempt is announced
    Deferred,
    /// No session owns the handle
    Stale,
}

/// Concurrent store of peer sessions
#[derive(Debug, Default)]
pub struct PeerRegistry {
    sessions: DashMap<PeerAddress, PeerSession>,
    next_seq: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an idle session if none exists
    pub fn upsert_session(&self, address: &PeerAddress) {
        self.sessions
            .entry(address.clone())
            .or_insert_with(PeerSession::idle);
    }

    pub fn get(&self, address: &PeerAddress) -> Option<PeerInfo> {
        self.sessions.get(address).map(|s| s.snapshot(address))
    }

    pub fn state(&self, address: &PeerAddress) -> PeerState {
        self.sessions
            .get(address)
            .map(|s| s.state)
            .unwrap_or(PeerState::Idle)
    }

    pub fn set_connecting(&self, address: &PeerAddress, connecting: bool) {
        if let Some(mut session) = self.sessions.get_mut(address) {
            if connecting {
                session.state = PeerState::Connecting;
            } else if session.state.is_connecting() {
                session.state = PeerState::Idle;
            }
        }
    }

    pub fn set_connected(&self, address: &PeerAddress, connected: bool) {
        if let Some(mut session) = self.sessions.get_mut(address) {
            if connected {
                if !session.state.is_connected() {
                    session.connected_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    session.connected_at = Some(Utc::now());
                }
                session.state = PeerState::Connected;
            } else if session.state.is_connected() {
                session.state = PeerState::Idle;
                session.connected_at = None;
            }
        }
    }

    /// Purge a session with its handle, timer and topology
    pub fn remove_session(&self, address: &PeerAddress) -> Option<RemovedSession> {
        self.sessions.remove(address).map(|(_, s)| s.into())
    }

    /// Reserve the peer for a new connect attempt under `handle`. `register`
    /// runs under the entry lock once the reservation succeeds.
    pub fn begin_connect(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        register: impl FnOnce(),
    ) -> BeginConnect {
        let reserved = PeerSession {
            state: PeerState::Connecting,
            handle: Some(handle),
            ..PeerSession::idle()
        };
        match self.sessions.entry(address.clone()) {
            Entry::Occupied(mut occupied) => {
                let session = occupied.get_mut();
                if session.state != PeerState::Idle {
                    return BeginConnect::Busy(session.state);
                }
                let stale = session.handle.take();
                *session = reserved;
                register();
                BeginConnect::Reserved { stale }
            }
            Entry::Vacant(vacant) => {
                let _session = vacant.insert(reserved);
                register();
                BeginConnect::Reserved { stale: None }
            }
        }
    }

    /// Mark a started attempt as announced and store its timer, settling any
    /// lifecycle event that arrived first
    pub fn announce<R>(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        timer: TimerId,
        purge: impl FnOnce() -> R,
    ) -> Announce<R> {
        let Entry::Occupied(mut entry) = self.sessions.entry(address.clone()) else {
            return Announce::Cancelled;
        };
        let session = entry.get_mut();
        if !session.state.is_connecting() || session.handle != Some(handle) || session.announced {
            return Announce::Cancelled;
        }

        session.announced = true;
        match session.early.take() {
            None => {
                session.timer = Some(timer);
                Announce::Pending
            }
            Some(Early::Discovered(topology)) => {
                self.promote(session, topology);
                Announce::Connected
            }
            Some(Early::LinkLost) => {
                let purged = purge();
                Announce::LinkLost {
                    removed: entry.remove().into(),
                    purged,
                }
            }
        }
    }

    /// Connecting → Connected, handing out the timer
    fn promote(&self, session: &mut PeerSession, topology: Topology) -> Option<TimerId> {
        session.state = PeerState::Connected;
        session.topology = Some(Arc::new(topology));
        session.connected_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        session.connected_at = Some(Utc::now());
        session.timer.take()
    }

    pub fn complete_discovery(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        topology: Topology,
    ) -> Discovery {
        let Some(mut session) = self.sessions.get_mut(address) else {
            return Discovery::Ignored;
        };
        if session.handle != Some(handle) {
            return Discovery::Ignored;
        }

        match session.state {
            PeerState::Connecting if !session.announced => {
                if matches!(session.early, Some(Early::LinkLost)) {
                    return Discovery::Ignored;
                }
                session.early = Some(Early::Discovered(topology));
                Discovery::Deferred
            }
            PeerState::Connecting => Discovery::Connected {
                timer: self.promote(&mut session, topology),
            },
            PeerState::Connected => {
                session.topology = Some(Arc::new(topology));
                Discovery::Refreshed
            }
            PeerState::Idle => Discovery::Ignored,
        }
    }

    /// Drop an attempt whose timeout fired, if it is still the same attempt
    /// and still Connecting
    pub fn expire<R>(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        purge: impl FnOnce() -> R,
    ) -> Option<(RemovedSession, R)> {
        self.remove_where(
            address,
            |s| s.state.is_connecting() && s.handle == Some(handle),
            purge,
        )
    }

    /// Handle a link-down event for `handle`. A failure before the attempt
    /// is announced is held for [`PeerRegistry::announce`].
    pub fn link_down<R>(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        purge: impl FnOnce() -> R,
    ) -> LinkDown<R> {
        match self.sessions.entry(address.clone()) {
            Entry::Occupied(mut entry) if entry.get().handle == Some(handle) => {
                let session = entry.get_mut();
                if session.state.is_connecting() && !session.announced {
                    session.early = Some(Early::LinkLost);
                    return LinkDown::Deferred;
                }
                let purged = purge();
                LinkDown::Removed {
                    removed: entry.remove().into(),
                    purged,
                }
            }
            _ => LinkDown::Stale,
        }
    }

    /// Purge the session only if it still owns `handle`
    pub fn remove_if_handle<R>(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        purge: impl FnOnce() -> R,
    ) -> Option<(RemovedSession, R)> {
        self.remove_where(address, |s| s.handle == Some(handle), purge)
    }

    /// Purge the session only if it holds a transport handle
    pub fn remove_active<R>(
        &self,
        address: &PeerAddress,
        purge: impl FnOnce() -> R,
    ) -> Option<(RemovedSession, R)> {
        self.remove_where(address, |s| s.handle.is_some(), purge)
    }

    fn remove_where<R>(
        &self,
        address: &PeerAddress,
        matches: impl Fn(&PeerSession) -> bool,
        purge: impl FnOnce() -> R,
    ) -> Option<(RemovedSession, R)> {
        match self.sessions.entry(address.clone()) {
            Entry::Occupied(entry) if matches(entry.get()) => {
                let purged = purge();
                Some((entry.remove().into(), purged))
            }
            _ => None,
        }
    }

    /// Whether `handle` belongs to an attempt still waiting for its link
    pub fn is_pending(&self, address: &PeerAddress, handle: TransportHandle) -> bool {
        self.sessions
            .get(address)
            .map(|s| s.state.is_connecting() && s.handle == Some(handle))
            .unwrap_or(false)
    }

    pub fn handle_of(&self, address: &PeerAddress) -> Option<TransportHandle> {
        self.sessions.get(address).and_then(|s| s.handle)
    }

    pub fn topology_of(&self, address: &PeerAddress) -> Option<Arc<Topology>> {
        self.sessions.get(address).and_then(|s| s.topology.clone())
    }

    /// Handle and topology of a connected peer
    pub fn link_of(&self, address: &PeerAddress) -> Option<(TransportHandle, Arc<Topology>)> {
        let session = self.sessions.get(address)?;
        if !session.state.is_connected() {
            return None;
        }
        Some((session.handle?, session.topology.clone()?))
    }

    pub fn is_connected(&self, address: &PeerAddress) -> bool {
        self.state(address).is_connected()
    }

    /// Connected peers in the order they connected
    pub fn connected(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<(u64, PeerAddress)> = self
            .sessions
            .iter()
            .filter(|entry| entry.state.is_connected())
            .map(|entry| (entry.connected_seq, entry.key().clone()))
            .collect();
        peers.sort_by_key(|(seq, _)| *seq);
        peers.into_iter().map(|(_, address)| address).collect()
    }

    /// Peers holding a transport handle, connecting or connected
    pub fn addresses_with_handle(&self) -> Vec<PeerAddress> {
        self.sessions
            .iter()
            .filter(|entry| entry.handle.is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn set_mtu(&self, address: &PeerAddress, mtu: u16) {
        if let Some(mut session) = self.sessions.get_mut(address) {
            session.mtu = Some(mtu);
        }
    }

    /// Remove every session, returning what was held
    pub fn clear(&self) -> Vec<(PeerAddress, RemovedSession)> {
        let addresses: Vec<PeerAddress> =
            self.sessions.iter().map(|e| e.key().clone()).collect();
        addresses
            .into_iter()
            .filter_map(|a| self.sessions.remove(&a))
            .map(|(a, s)| (a, s.into()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
