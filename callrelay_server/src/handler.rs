//! Message routing for the signaling relay
//!
//! [`MessageRouter`] is the call state machine. Each handler validates the
//! sender's current state, mutates the registries under lock, and returns the
//! messages to enqueue. Delivery and the presence broadcast happen only after
//! every lock has been released.
//!
//! ```text
//! caller: idle -> calling -> in-call -> idle
//! callee: idle -> ringing -> in-call -> idle
//! ```
//!
//! Rooms are created only when a call is accepted, so a room always holds two
//! confirmed participants.

use crate::presence::PresenceBroadcaster;
use crate::protocol::{CallId, ClientMessage, PeerId, ServerMessage};
use crate::state::{
    CallState, Client, ClientRegistry, ClientTable, Outbox, Room, RoomRegistry, RoomTable,
    ServerState,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reason sent with `peer_disconnected` when the transport went away
pub const REASON_DISCONNECTED: &str = "disconnected";
const REASON_HANGUP: &str = "hangup";

/// Messages to enqueue once the locks are gone
#[derive(Debug, Default)]
struct Outcome {
    deliveries: Vec<(Outbox, ServerMessage)>,
    presence_changed: bool,
}

impl Outcome {
    fn send(to: Outbox, message: ServerMessage) -> Self {
        Self::default().and_send(to, message)
    }

    fn and_send(mut self, to: Outbox, message: ServerMessage) -> Self {
        self.deliveries.push((to, message));
        self
    }

    fn changed(mut self) -> Self {
        self.presence_changed = true;
        self
    }
}

/// Routes inbound client messages and owns the call state machine
#[derive(Debug, Clone)]
pub struct MessageRouter {
    clients: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
    presence: PresenceBroadcaster,
}

impl MessageRouter {
    pub fn new(state: &ServerState) -> Self {
        Self {
            clients: state.clients.clone(),
            rooms: state.rooms.clone(),
            presence: PresenceBroadcaster::new(state.clients.clone()),
        }
    }

    /// Register a freshly accepted connection as an idle client
    pub fn connect(&self, outbox: Outbox) {
        let peer_id = outbox.peer();
        self.clients.register(Client::new(outbox));
        info!(%peer_id, "client connected");
        self.presence.broadcast();
    }

    /// Dispatch one decoded message from `sender`
    pub fn handle(&self, sender: PeerId, message: ClientMessage) {
        let outcome = match message {
            ClientMessage::Register => self.register(sender),
            ClientMessage::InitiateCall { data, target_peer } => {
                self.initiate_call(sender, data, target_peer)
            }
            ClientMessage::AcceptCall { call_id, data } => self.accept_call(sender, call_id, data),
            ClientMessage::RejectCall { call_id, reason } => {
                self.reject_call(sender, call_id, reason)
            }
            ClientMessage::Offer { call_id, data } => {
                self.forward(sender, call_id, false, "offer", |peer_id| {
                    ServerMessage::Offer {
                        call_id,
                        peer_id,
                        data,
                    }
                })
            }
            ClientMessage::Answer { call_id, data } => {
                self.forward(sender, call_id, false, "answer", |peer_id| {
                    ServerMessage::Answer {
                        call_id,
                        peer_id,
                        data,
                    }
                })
            }
            ClientMessage::IceCandidate { call_id, data } => {
                self.forward(sender, call_id, true, "ice-candidate", |peer_id| {
                    ServerMessage::IceCandidate {
                        call_id,
                        peer_id,
                        data,
                    }
                })
            }
            ClientMessage::Hangup { call_id, reason } => self.hangup(sender, call_id, reason),
            ClientMessage::Ping => self.reply(sender, ServerMessage::Pong),
        };
        self.finish(outcome);
    }

    /// Answer a frame that could not be decoded
    pub fn handle_malformed(&self, sender: PeerId) {
        let outcome = self.reply(sender, ServerMessage::error("malformed message", None));
        self.finish(outcome);
    }

    /// Tear down a client: end its call, drop it from the registry, close its
    /// connection and broadcast presence. Returns false if it was already gone.
    pub fn disconnect(&self, peer_id: PeerId, reason: &str) -> bool {
        let outcome = {
            let mut rooms = self.rooms.lock();
            let mut clients = self.clients.lock();
            let Some(state) = clients.state(&peer_id) else {
                return false;
            };
            let mut outcome = end_call(&mut rooms, &mut clients, peer_id, state, reason);
            if let Some(client) = clients.remove(&peer_id) {
                client.outbox.close();
            }
            outcome.presence_changed = true;
            outcome
        };
        self.finish(outcome);
        info!(%peer_id, reason, "client removed");
        true
    }

    fn finish(&self, outcome: Outcome) {
        for (outbox, message) in outcome.deliveries {
            if let Err(e) = outbox.send(message) {
                warn!(peer_id = %outbox.peer(), error = %e, "dropping message");
            }
        }
        if outcome.presence_changed {
            self.presence.broadcast();
        }
    }

    fn reply(&self, sender: PeerId, message: ServerMessage) -> Outcome {
        match self.clients.lock().outbox(&sender) {
            Some(outbox) => Outcome::send(outbox, message),
            None => Outcome::default(),
        }
    }

    fn register(&self, sender: PeerId) -> Outcome {
        self.reply(sender, ServerMessage::RegisterSuccess { peer_id: sender })
            .changed()
    }

    fn initiate_call(&self, sender: PeerId, data: String, target: Option<PeerId>) -> Outcome {
        let mut clients = self.clients.lock();
        let Some(caller) = clients.get(&sender) else {
            return Outcome::default();
        };
        let caller_outbox = caller.outbox.clone();

        if !caller.state.is_idle() {
            return Outcome::send(
                caller_outbox,
                ServerMessage::error("already in a call", caller.state.call_id()),
            );
        }
        if data.is_empty() {
            return Outcome::send(caller_outbox, ServerMessage::error("missing offer data", None));
        }

        let callee = match target {
            Some(target) => {
                let available = target != sender
                    && clients.state(&target).is_some_and(|s| s.is_idle());
                if !available {
                    debug!(peer_id = %sender, %target, "directed call target unavailable");
                    return Outcome::send(caller_outbox, ServerMessage::error("peer unavailable", None));
                }
                target
            }
            None => match clients.find_idle_except(&sender) {
                Some(callee) => callee,
                None => {
                    debug!(peer_id = %sender, "no idle peer to call");
                    return Outcome::send(
                        caller_outbox,
                        ServerMessage::error("no peers available", None),
                    );
                }
            },
        };
        let Some(callee_outbox) = clients.outbox(&callee) else {
            return Outcome::default();
        };

        let call_id = CallId::new();
        clients.set_state(&sender, CallState::Calling { call_id, callee });
        clients.set_state(
            &callee,
            CallState::Ringing {
                call_id,
                caller: sender,
            },
        );
        info!(%call_id, caller = %sender, %callee, "call initiated");

        Outcome::send(
            callee_outbox,
            ServerMessage::IncomingCall {
                call_id,
                caller_id: sender,
                data,
            },
        )
        .and_send(
            caller_outbox,
            ServerMessage::CallInitiated {
                call_id,
                peer_id: callee,
            },
        )
        .changed()
    }

    fn accept_call(&self, sender: PeerId, call_id: CallId, data: String) -> Outcome {
        let mut rooms = self.rooms.lock();
        let mut clients = self.clients.lock();
        let Some(callee) = clients.get(&sender) else {
            return Outcome::default();
        };
        let callee_outbox = callee.outbox.clone();

        let caller = match callee.state {
            CallState::Ringing {
                call_id: ringing,
                caller,
            } if ringing == call_id => caller,
            state @ (CallState::InCall { .. } | CallState::Ringing { .. }) => {
                // Repeated accept of an established call, or an accept for a
                // call this client is not ringing on
                debug!(peer_id = %sender, %call_id, status = %state.status(), "accept for a call that is no longer pending");
                return Outcome::send(
                    callee_outbox,
                    ServerMessage::error("caller unavailable", Some(call_id)),
                );
            }
            state => {
                debug!(peer_id = %sender, %call_id, status = %state.status(), "accept without a matching ringing call");
                return Outcome::send(
                    callee_outbox,
                    ServerMessage::error("no incoming call to accept", Some(call_id)),
                );
            }
        };

        let caller_ready = clients.state(&caller)
            == Some(CallState::Calling {
                call_id,
                callee: sender,
            });
        let caller_outbox = clients.outbox(&caller);
        let (true, Some(caller_outbox)) = (caller_ready, caller_outbox) else {
            clients.set_state(&sender, CallState::Idle);
            info!(%call_id, peer_id = %sender, "accepted call has no waiting caller");
            return Outcome::send(
                callee_outbox,
                ServerMessage::error("caller unavailable", Some(call_id)),
            )
            .changed();
        };

        if let Err(e) = rooms.create(Room::new(call_id, caller, sender)) {
            error!(%call_id, error = %e, "room already present for a ringing call");
            clients.set_state(&sender, CallState::Idle);
            return Outcome::send(
                callee_outbox,
                ServerMessage::error("caller unavailable", Some(call_id)),
            )
            .changed();
        }

        clients.set_state(
            &caller,
            CallState::InCall {
                call_id,
                peer: sender,
                initiator: true,
            },
        );
        clients.set_state(
            &sender,
            CallState::InCall {
                call_id,
                peer: caller,
                initiator: false,
            },
        );
        info!(%call_id, %caller, callee = %sender, "call established");

        Outcome::send(
            caller_outbox,
            ServerMessage::Answer {
                call_id,
                peer_id: sender,
                data,
            },
        )
        .changed()
    }

    fn reject_call(&self, sender: PeerId, call_id: CallId, reason: Option<String>) -> Outcome {
        let mut rooms = self.rooms.lock();
        let mut clients = self.clients.lock();

        let caller = match clients.state(&sender) {
            Some(CallState::Ringing {
                call_id: ringing,
                caller,
            }) if ringing == call_id => caller,
            _ => {
                debug!(peer_id = %sender, %call_id, "ignoring reject without a matching ringing call");
                return Outcome::default();
            }
        };

        if rooms.remove(&call_id).is_some() {
            error!(%call_id, "discarded a room that existed for an unanswered call");
        }
        clients.set_state(&sender, CallState::Idle);
        let mut outcome = Outcome::default().changed();
        if clients.reset_if_on(&caller, call_id) {
            if let Some(outbox) = clients.outbox(&caller) {
                outcome = outcome.and_send(
                    outbox,
                    ServerMessage::CallRejected {
                        call_id,
                        peer_id: sender,
                        reason,
                    },
                );
            }
        }
        info!(%call_id, %caller, callee = %sender, "call rejected");
        outcome
    }

    /// Pass an opaque payload to the other side of `call_id`.
    ///
    /// Drops are silent towards the sender. With `allow_pending`, a call that
    /// is still ringing forwards to the pending counterpart as long as both
    /// sides still point at the same call.
    fn forward(
        &self,
        sender: PeerId,
        call_id: CallId,
        allow_pending: bool,
        kind: &'static str,
        build: impl FnOnce(PeerId) -> ServerMessage,
    ) -> Outcome {
        let rooms = self.rooms.lock();
        let clients = self.clients.lock();
        let Some(state) = clients.state(&sender) else {
            return Outcome::default();
        };
        if !state.is_on(call_id) {
            debug!(peer_id = %sender, %call_id, kind, "dropping payload for a call the sender is not on");
            return Outcome::default();
        }

        let recipient = match rooms.get(&call_id) {
            Some(room) => match room.other(&sender) {
                Some(peer) => peer,
                None => {
                    error!(peer_id = %sender, %call_id, kind, "sender is on the call but not in its room");
                    return Outcome::default();
                }
            },
            None if allow_pending => match state.counterpart() {
                Some(peer) if clients.state(&peer).is_some_and(|s| s.is_on(call_id)) => peer,
                _ => {
                    debug!(peer_id = %sender, %call_id, kind, "dropping payload, counterpart left");
                    return Outcome::default();
                }
            },
            None => {
                debug!(peer_id = %sender, %call_id, kind, "dropping payload, no room");
                return Outcome::default();
            }
        };

        match clients.outbox(&recipient) {
            Some(outbox) => {
                debug!(%call_id, from = %sender, to = %recipient, kind, "forwarding payload");
                Outcome::send(outbox, build(sender))
            }
            None => {
                error!(%call_id, peer_id = %recipient, kind, "call references an unregistered client");
                Outcome::default()
            }
        }
    }

    fn hangup(&self, sender: PeerId, call_id: Option<CallId>, reason: Option<String>) -> Outcome {
        let mut rooms = self.rooms.lock();
        let mut clients = self.clients.lock();
        let Some(state) = clients.state(&sender) else {
            return Outcome::default();
        };
        match (state.call_id(), call_id) {
            (None, _) => {
                debug!(peer_id = %sender, "hangup while idle");
                Outcome::default()
            }
            (Some(current), Some(requested)) if current != requested => {
                debug!(peer_id = %sender, %requested, %current, "ignoring hangup for another call");
                Outcome::default()
            }
            (Some(_), _) => {
                let reason = reason.unwrap_or_else(|| REASON_HANGUP.to_string());
                end_call(&mut rooms, &mut clients, sender, state, &reason)
            }
        }
    }
}

/// End whatever call `sender` is on: reset it and its counterpart to idle,
/// delete the room if one exists, and notify the counterpart.
///
/// Callers hold both locks, rooms first.
fn end_call(
    rooms: &mut RoomTable,
    clients: &mut ClientTable,
    sender: PeerId,
    state: CallState,
    reason: &str,
) -> Outcome {
    let Some(call_id) = state.call_id() else {
        return Outcome::default();
    };
    clients.set_state(&sender, CallState::Idle);

    let mut counterpart = state.counterpart();
    match rooms.get(&call_id).map(|room| room.other(&sender)) {
        Some(Some(peer)) => {
            if counterpart != Some(peer) {
                error!(%call_id, peer_id = %sender, "room and client state disagree on the counterpart");
                counterpart = Some(peer);
            }
            rooms.remove(&call_id);
        }
        Some(None) => {
            error!(%call_id, peer_id = %sender, "client is on a call whose room does not include it");
        }
        None => {}
    }

    let mut outcome = Outcome::default().changed();
    if let Some(peer) = counterpart {
        if clients.reset_if_on(&peer, call_id) {
            if let Some(outbox) = clients.outbox(&peer) {
                outcome = outcome.and_send(
                    outbox,
                    ServerMessage::PeerDisconnected {
                        call_id,
                        peer_id: sender,
                        reason: reason.to_string(),
                    },
                );
            }
        }
    }
    info!(%call_id, peer_id = %sender, reason, "call ended");
    outcome
}
