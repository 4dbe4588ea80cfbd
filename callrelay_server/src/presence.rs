//! Presence fan-out to connected clients.

use crate::protocol::{PeerStatus, ServerMessage};
use crate::state::{ClientRegistry, Outbox};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pushes the current `peer_list` to every connected client.
///
/// The snapshot is taken under the client registry lock and stamped with a
/// sequence number from the same critical section. Delivery happens after the
/// lock is released and only enqueues, so a slow recipient never holds up the
/// others. When two broadcasts overlap, a recipient that already has the newer
/// snapshot queued skips the older one.
#[derive(Debug, Clone)]
pub struct PresenceBroadcaster {
    clients: Arc<ClientRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(clients: Arc<ClientRegistry>) -> Self {
        Self { clients }
    }

    /// Snapshot and broadcast. Must not be called while a registry lock is held.
    pub fn broadcast(&self) {
        self.capture().deliver();
    }

    fn capture(&self) -> Snapshot {
        let mut clients = self.clients.lock();
        Snapshot {
            seq: clients.next_presence_seq(),
            peers: clients.snapshot(),
            recipients: clients.outboxes(),
        }
    }
}

/// A peer list as seen under the registry lock, with its recipients
#[derive(Debug)]
struct Snapshot {
    seq: u64,
    peers: Vec<PeerStatus>,
    recipients: Vec<Outbox>,
}

impl Snapshot {
    fn deliver(self) {
        let message = ServerMessage::PeerList { peers: self.peers };
        let (mut failed, mut stale) = (0usize, 0usize);
        for outbox in &self.recipients {
            match outbox.send_presence(self.seq, message.clone()) {
                Ok(true) => {}
                Ok(false) => stale += 1,
                Err(e) => {
                    failed += 1;
                    warn!(peer_id = %outbox.peer(), error = %e, "failed to deliver presence update");
                }
            }
        }
        debug!(
            seq = self.seq,
            recipients = self.recipients.len(),
            failed,
            stale,
            "broadcast peer list"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallStatus, PeerId};
    use crate::protocol::CallId;
    use crate::state::{CallState, Client, Frame};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn connect(
        registry: &ClientRegistry,
        capacity: usize,
    ) -> (PeerId, CancellationToken, mpsc::Receiver<Frame>) {
        let closer = CancellationToken::new();
        let (outbox, rx) = Outbox::new(PeerId::new(), capacity, closer.clone());
        let id = outbox.peer();
        registry.register(Client::new(outbox));
        (id, closer, rx)
    }

    #[test]
    fn every_client_receives_the_snapshot() {
        let registry = Arc::new(ClientRegistry::new());
        let (a, _, mut rx_a) = connect(&registry, 4);
        let (b, _, mut rx_b) = connect(&registry, 4);
        PresenceBroadcaster::new(registry.clone()).broadcast();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                Frame::Message(ServerMessage::PeerList { peers }) => {
                    assert_eq!(peers.len(), 2);
                    assert!(peers.iter().any(|p| p.id == a));
                    assert!(peers.iter().any(|p| p.id == b));
                    assert!(peers.iter().all(|p| p.status == CallStatus::Idle));
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn overlapping_broadcasts_leave_the_newest_snapshot_last() {
        let registry = Arc::new(ClientRegistry::new());
        let (a, _, mut rx_a) = connect(&registry, 8);
        let (b, _, _rx_b) = connect(&registry, 8);
        let presence = PresenceBroadcaster::new(registry.clone());

        let before = presence.capture();
        registry.lock().set_state(
            &a,
            CallState::Calling {
                call_id: CallId::new(),
                callee: b,
            },
        );
        let after = presence.capture();
        after.deliver();
        before.deliver();

        let mut lists = Vec::new();
        while let Ok(Frame::Message(ServerMessage::PeerList { peers })) = rx_a.try_recv() {
            lists.push(peers);
        }
        assert_eq!(lists.len(), 1);
        let mine = lists[0].iter().find(|p| p.id == a).unwrap();
        assert_eq!(mine.status, CallStatus::Calling);
    }

    #[test]
    fn slow_recipient_is_flagged_without_blocking_others() {
        let registry = Arc::new(ClientRegistry::new());
        let (_slow, slow_closer, _slow_rx) = connect(&registry, 1);
        let (_fast, fast_closer, mut fast_rx) = connect(&registry, 8);
        let presence = PresenceBroadcaster::new(registry.clone());

        presence.broadcast();
        presence.broadcast();

        assert!(slow_closer.is_cancelled());
        assert!(!fast_closer.is_cancelled());
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }
}
