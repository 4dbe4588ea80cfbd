//! Connection liveness
//!
//! The relay pings every client on a fixed interval. Any inbound frame,
//! including a pong, counts as proof of life. A client that stays silent for
//! longer than the timeout is closed and torn down like a read error.

use crate::protocol::PeerId;
use crate::state::{ClientRegistry, Outbox};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

/// Probe cadence and eviction window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// How often the relay sends a ping
    pub probe_interval: Duration,
    /// Silence after which a client is evicted
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl LivenessConfig {
    /// Build from seconds; the timeout is never shorter than one interval
    pub fn from_secs(probe_interval_secs: u64, timeout_secs: u64) -> Self {
        let probe_interval = Duration::from_secs(probe_interval_secs.max(1));
        Self {
            probe_interval,
            timeout: Duration::from_secs(timeout_secs).max(probe_interval),
        }
    }
}

/// Probe `peer_id` until its connection closes or it misses the window.
///
/// Exits quietly once the client is gone from the registry.
pub async fn drive(
    peer_id: PeerId,
    clients: Arc<ClientRegistry>,
    outbox: Outbox,
    config: LivenessConfig,
) {
    let mut ticker = interval(config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = outbox.closer().cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(last_activity) = clients.last_activity(&peer_id) else {
            return;
        };
        let silent_for = last_activity.elapsed();
        if silent_for >= config.timeout {
            warn!(%peer_id, silent_secs = silent_for.as_secs(), "liveness timeout, closing connection");
            outbox.close();
            return;
        }
        if let Err(e) = outbox.probe() {
            debug!(%peer_id, error = %e, "could not queue liveness probe");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Client, Frame};
    use tokio::sync::mpsc;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (
        Arc<ClientRegistry>,
        PeerId,
        Outbox,
        CancellationToken,
        mpsc::Receiver<Frame>,
    ) {
        let clients = Arc::new(ClientRegistry::new());
        let closer = CancellationToken::new();
        let (outbox, rx) = Outbox::new(PeerId::new(), 16, closer.clone());
        let peer_id = outbox.peer();
        clients.register(Client::new(outbox.clone()));
        (clients, peer_id, outbox, closer, rx)
    }

    #[test]
    fn timeout_is_at_least_one_interval() {
        let config = LivenessConfig::from_secs(30, 10);
        assert_eq!(config.timeout, Duration::from_secs(30));
        let config = LivenessConfig::from_secs(0, 0);
        assert_eq!(config.probe_interval, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_evicted_after_timeout() {
        let (clients, peer_id, outbox, closer, mut rx) = setup();
        let task = tokio::spawn(drive(peer_id, clients, outbox, LivenessConfig::default()));

        sleep(Duration::from_secs(45)).await;
        assert!(!closer.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), Frame::Probe);

        sleep(Duration::from_secs(20)).await;
        assert!(closer.is_cancelled());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_client_alive() {
        let (clients, peer_id, outbox, closer, _rx) = setup();
        let task = tokio::spawn(drive(
            peer_id,
            clients.clone(),
            outbox,
            LivenessConfig::default(),
        ));

        for _ in 0..10 {
            sleep(Duration::from_secs(20)).await;
            clients.touch(&peer_id);
        }
        assert!(!closer.is_cancelled());

        closer.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_once_client_is_removed() {
        let (clients, peer_id, outbox, closer, _rx) = setup();
        let task = tokio::spawn(drive(
            peer_id,
            clients.clone(),
            outbox,
            LivenessConfig::default(),
        ));

        clients.lock().remove(&peer_id);
        sleep(Duration::from_secs(31)).await;
        assert!(task.is_finished());
        assert!(!closer.is_cancelled());
    }
}
