//! Server state management for the signaling relay
//!
//! Two registries hold all shared mutable state: [`ClientRegistry`] for live
//! connections and [`RoomRegistry`] for established calls. Each wraps its map
//! in a single mutex so read-then-write sequences are atomic.
//!
//! Lock order: when both are needed, the room registry is locked first and the
//! client registry second. Neither lock is ever held across an `.await`.

use crate::error::SignalingError;
use crate::protocol::{CallId, CallStatus, PeerId, PeerStatus, ServerMessage};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Item carried by a connection's outbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(ServerMessage),
    /// Ask the writer to emit a transport-level ping
    Probe,
}

/// Enqueue-only handle to one connection's writer task
///
/// A full or closed queue trips the connection's close signal, which sends
/// the connection through its normal teardown.
#[derive(Debug, Clone)]
pub struct Outbox {
    peer: PeerId,
    tx: mpsc::Sender<Frame>,
    closer: CancellationToken,
    /// Sequence number of the newest peer list queued here
    presence_seq: Arc<Mutex<u64>>,
}

impl Outbox {
    pub fn new(
        peer: PeerId,
        capacity: usize,
        closer: CancellationToken,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Self {
            peer,
            tx,
            closer,
            presence_seq: Arc::new(Mutex::new(0)),
        };
        (outbox, rx)
    }

    /// Queue a message without waiting
    pub fn send(&self, message: ServerMessage) -> Result<(), SignalingError> {
        self.push(Frame::Message(message))
    }

    /// Queue a peer list taken at `seq`. Returns `Ok(false)` without queueing
    /// when a newer peer list has already been queued.
    pub fn send_presence(&self, seq: u64, message: ServerMessage) -> Result<bool, SignalingError> {
        let mut last = self.presence_seq.lock();
        if seq <= *last {
            return Ok(false);
        }
        self.push(Frame::Message(message))?;
        *last = seq;
        Ok(true)
    }

    /// Queue a liveness probe
    pub fn probe(&self) -> Result<(), SignalingError> {
        self.push(Frame::Probe)
    }

    fn push(&self, frame: Frame) -> Result<(), SignalingError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(peer_id = %self.peer, "outbound queue full, closing connection");
                self.closer.cancel();
                Err(SignalingError::SendError {
                    peer: self.peer,
                    reason: "queue full",
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.closer.cancel();
                Err(SignalingError::SendError {
                    peer: self.peer,
                    reason: "connection closed",
                })
            }
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Signal that fires when this connection must shut down
    pub fn closer(&self) -> &CancellationToken {
        &self.closer
    }

    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// Where a client stands in the call state machine
///
/// Every non-idle state carries the call id and the counterpart, so a client
/// can never be idle while holding a call id or the other way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Initiated a call, waiting for the callee to accept
    Calling { call_id: CallId, callee: PeerId },
    /// Being called, waiting for this client to accept or reject
    Ringing { call_id: CallId, caller: PeerId },
    InCall {
        call_id: CallId,
        peer: PeerId,
        initiator: bool,
    },
}

impl CallState {
    pub fn status(&self) -> CallStatus {
        match self {
            CallState::Idle => CallStatus::Idle,
            CallState::Calling { .. } => CallStatus::Calling,
            CallState::Ringing { .. } => CallStatus::Ringing,
            CallState::InCall { .. } => CallStatus::InCall,
        }
    }

    pub fn call_id(&self) -> Option<CallId> {
        match *self {
            CallState::Idle => None,
            CallState::Calling { call_id, .. }
            | CallState::Ringing { call_id, .. }
            | CallState::InCall { call_id, .. } => Some(call_id),
        }
    }

    /// The other party of the current or pending call
    pub fn counterpart(&self) -> Option<PeerId> {
        match *self {
            CallState::Idle => None,
            CallState::Calling { callee, .. } => Some(callee),
            CallState::Ringing { caller, .. } => Some(caller),
            CallState::InCall { peer, .. } => Some(peer),
        }
    }

    pub fn is_initiator(&self) -> bool {
        match *self {
            CallState::Calling { .. } => true,
            CallState::InCall { initiator, .. } => initiator,
            CallState::Idle | CallState::Ringing { .. } => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }

    /// True if this state belongs to `call_id`
    pub fn is_on(&self, call_id: CallId) -> bool {
        self.call_id() == Some(call_id)
    }
}

/// One live connection
#[derive(Debug, Clone)]
pub struct Client {
    pub id: PeerId,
    pub state: CallState,
    pub last_activity: Instant,
    pub outbox: Outbox,
}

impl Client {
    /// A freshly accepted, idle client
    pub fn new(outbox: Outbox) -> Self {
        Self {
            id: outbox.peer(),
            state: CallState::Idle,
            last_activity: Instant::now(),
            outbox,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.state.status()
    }
}

/// Client map guarded by [`ClientRegistry`]
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: BTreeMap<PeerId, Client>,
    presence_seq: u64,
}

impl ClientTable {
    pub fn insert(&mut self, client: Client) -> Option<Client> {
        self.clients.insert(client.id, client)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut Client> {
        self.clients.get_mut(id)
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn state(&self, id: &PeerId) -> Option<CallState> {
        self.clients.get(id).map(|c| c.state)
    }

    /// Overwrite a client's state; returns false if the client is gone
    pub fn set_state(&mut self, id: &PeerId, state: CallState) -> bool {
        match self.clients.get_mut(id) {
            Some(client) => {
                client.state = state;
                true
            }
            None => false,
        }
    }

    /// Reset a client to idle if it is still on `call_id`
    pub fn reset_if_on(&mut self, id: &PeerId, call_id: CallId) -> bool {
        match self.clients.get_mut(id) {
            Some(client) if client.state.is_on(call_id) => {
                client.state = CallState::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn outbox(&self, id: &PeerId) -> Option<Outbox> {
        self.clients.get(id).map(|c| c.outbox.clone())
    }

    /// First idle client other than `except`, in registry order
    pub fn find_idle_except(&self, except: &PeerId) -> Option<PeerId> {
        self.clients
            .values()
            .find(|c| c.id != *except && c.state.is_idle())
            .map(|c| c.id)
    }

    pub fn touch(&mut self, id: &PeerId) {
        if let Some(client) = self.clients.get_mut(id) {
            client.last_activity = Instant::now();
        }
    }

    /// Order stamp for a presence snapshot taken under this lock
    pub fn next_presence_seq(&mut self) -> u64 {
        self.presence_seq += 1;
        self.presence_seq
    }

    /// (id, status) of every client
    pub fn snapshot(&self) -> Vec<PeerStatus> {
        self.clients
            .values()
            .map(|c| PeerStatus {
                id: c.id,
                status: c.status(),
            })
            .collect()
    }

    pub fn outboxes(&self) -> Vec<Outbox> {
        self.clients.values().map(|c| c.outbox.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Thread-safe registry of live clients
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<ClientTable>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the registry lock for a multi-step read or update
    pub fn lock(&self) -> MutexGuard<'_, ClientTable> {
        self.inner.lock()
    }

    pub fn register(&self, client: Client) {
        let id = client.id;
        if self.lock().insert(client).is_some() {
            warn!(peer_id = %id, "replaced an existing client with the same id");
        }
    }

    /// Record inbound traffic or a pong from `id`
    pub fn touch(&self, id: &PeerId) {
        self.lock().touch(id);
    }

    pub fn last_activity(&self, id: &PeerId) -> Option<Instant> {
        self.lock().get(id).map(|c| c.last_activity)
    }

    pub fn state(&self, id: &PeerId) -> Option<CallState> {
        self.lock().state(id)
    }

    pub fn status(&self, id: &PeerId) -> Option<CallStatus> {
        self.state(id).map(|s| s.status())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A two-party call, created only once both sides have agreed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub call_id: CallId,
    pub initiator: PeerId,
    pub responder: PeerId,
}

impl Room {
    pub fn new(call_id: CallId, initiator: PeerId, responder: PeerId) -> Self {
        Self {
            call_id,
            initiator,
            responder,
        }
    }

    pub fn has(&self, peer: &PeerId) -> bool {
        self.initiator == *peer || self.responder == *peer
    }

    /// The participant opposite `peer`, or `None` if `peer` is not in the room
    pub fn other(&self, peer: &PeerId) -> Option<PeerId> {
        if self.initiator == *peer {
            Some(self.responder)
        } else if self.responder == *peer {
            Some(self.initiator)
        } else {
            None
        }
    }
}

/// Room map guarded by [`RoomRegistry`]
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<CallId, Room>,
}

impl RoomTable {
    /// Insert a new room; an existing id is never overwritten
    pub fn create(&mut self, room: Room) -> Result<(), SignalingError> {
        if self.rooms.contains_key(&room.call_id) {
            return Err(SignalingError::DuplicateCall(room.call_id));
        }
        debug!(call_id = %room.call_id, "room created");
        self.rooms.insert(room.call_id, room);
        Ok(())
    }

    pub fn get(&self, call_id: &CallId) -> Option<&Room> {
        self.rooms.get(call_id)
    }

    pub fn remove(&mut self, call_id: &CallId) -> Option<Room> {
        self.rooms.remove(call_id)
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.rooms.contains_key(call_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// Thread-safe registry of established calls
#[derive(Debug, Default)]
pub struct RoomRegistry {
    inner: Mutex<RoomTable>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the registry lock. Must be taken before the client registry lock.
    pub fn lock(&self) -> MutexGuard<'_, RoomTable> {
        self.inner.lock()
    }

    pub fn get(&self, call_id: &CallId) -> Option<Room> {
        self.lock().get(call_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Handle to both registries, created once at startup
#[derive(Debug, Default, Clone)]
pub struct ServerState {
    pub clients: Arc<ClientRegistry>,
    pub rooms: Arc<RoomRegistry>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (Client, mpsc::Receiver<Frame>) {
        let (outbox, rx) = Outbox::new(PeerId::new(), 8, CancellationToken::new());
        (Client::new(outbox), rx)
    }

    #[test]
    fn call_state_keeps_status_and_call_id_in_step() {
        let call_id = CallId::new();
        let other = PeerId::new();
        let states = [
            CallState::Idle,
            CallState::Calling {
                call_id,
                callee: other,
            },
            CallState::Ringing {
                call_id,
                caller: other,
            },
            CallState::InCall {
                call_id,
                peer: other,
                initiator: false,
            },
        ];
        for state in states {
            assert_eq!(state.status() == CallStatus::Idle, state.call_id().is_none());
            assert_eq!(state.is_idle(), state.counterpart().is_none());
        }
        assert!(states[1].is_initiator());
        assert!(!states[2].is_initiator());
    }

    #[test]
    fn duplicate_room_is_refused() {
        let mut rooms = RoomTable::default();
        let call_id = CallId::new();
        let (a, b) = (PeerId::new(), PeerId::new());
        rooms.create(Room::new(call_id, a, b)).unwrap();
        let err = rooms.create(Room::new(call_id, b, a)).unwrap_err();
        assert!(matches!(err, SignalingError::DuplicateCall(id) if id == call_id));
        assert_eq!(rooms.get(&call_id).unwrap().initiator, a);
    }

    #[test]
    fn room_other_side() {
        let (a, b, c) = (PeerId::new(), PeerId::new(), PeerId::new());
        let room = Room::new(CallId::new(), a, b);
        assert_eq!(room.other(&a), Some(b));
        assert_eq!(room.other(&b), Some(a));
        assert_eq!(room.other(&c), None);
        assert!(!room.has(&c));
    }

    #[test]
    fn idle_search_skips_self_and_busy_clients() {
        let mut table = ClientTable::default();
        let (me, _rx1) = client();
        let (mut busy, _rx2) = client();
        let (free, _rx3) = client();
        busy.state = CallState::Ringing {
            call_id: CallId::new(),
            caller: PeerId::new(),
        };
        let (me_id, free_id) = (me.id, free.id);
        table.insert(me);
        table.insert(busy);
        assert_eq!(table.find_idle_except(&me_id), None);
        table.insert(free);
        assert_eq!(table.find_idle_except(&me_id), Some(free_id));
    }

    #[test]
    fn snapshot_reports_every_client() {
        let registry = ClientRegistry::new();
        let (a, _rx1) = client();
        let (b, _rx2) = client();
        let (a_id, b_id) = (a.id, b.id);
        registry.register(a);
        registry.register(b);
        registry.lock().set_state(
            &b_id,
            CallState::Calling {
                call_id: CallId::new(),
                callee: a_id,
            },
        );
        let snapshot = registry.lock().snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&PeerStatus {
            id: a_id,
            status: CallStatus::Idle
        }));
        assert!(snapshot.contains(&PeerStatus {
            id: b_id,
            status: CallStatus::Calling
        }));
    }

    #[test]
    fn reset_only_applies_to_matching_call() {
        let mut table = ClientTable::default();
        let (mut c, _rx) = client();
        let call_id = CallId::new();
        c.state = CallState::Ringing {
            call_id,
            caller: PeerId::new(),
        };
        let id = c.id;
        table.insert(c);
        assert!(!table.reset_if_on(&id, CallId::new()));
        assert!(table.reset_if_on(&id, call_id));
        assert!(table.state(&id).unwrap().is_idle());
    }

    #[test]
    fn full_outbox_trips_close_signal() {
        let closer = CancellationToken::new();
        let (outbox, _rx) = Outbox::new(PeerId::new(), 1, closer.clone());
        outbox.send(ServerMessage::Pong).unwrap();
        let err = outbox.send(ServerMessage::Pong).unwrap_err();
        assert!(matches!(err, SignalingError::SendError { reason: "queue full", .. }));
        assert!(closer.is_cancelled());
    }

    #[test]
    fn older_peer_list_is_not_queued_after_newer() {
        let (outbox, mut rx) = Outbox::new(PeerId::new(), 4, CancellationToken::new());
        let newer = ServerMessage::PeerList { peers: Vec::new() };
        let older = ServerMessage::PeerList {
            peers: vec![PeerStatus {
                id: PeerId::new(),
                status: CallStatus::Ringing,
            }],
        };

        assert!(outbox.send_presence(2, newer.clone()).unwrap());
        assert!(!outbox.send_presence(1, older).unwrap());
        assert_eq!(rx.try_recv().unwrap(), Frame::Message(newer));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_outbox_trips_close_signal() {
        let closer = CancellationToken::new();
        let (outbox, rx) = Outbox::new(PeerId::new(), 4, closer.clone());
        drop(rx);
        assert!(outbox.probe().is_err());
        assert!(closer.is_cancelled());
    }
}
