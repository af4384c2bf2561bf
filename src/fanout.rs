use crate::models::LiveMessage;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Real-time distribution of accepted readings to connected observers.
///
/// Every observer gets its own bounded queue; `broadcast` uses `try_send`, so
/// one slow or stalled observer can never block the caller or its peers. An
/// observer whose queue is full is dropped, which closes its receiver and
/// disconnects the session.
pub struct FanoutChannel {
    observers: Mutex<HashMap<Uuid, mpsc::Sender<LiveMessage>>>,
    queue_size: usize,
}

impl FanoutChannel {
    pub fn new(queue_size: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            queue_size,
        }
    }

    pub fn register(&self) -> (Uuid, mpsc::Receiver<LiveMessage>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let id = Uuid::new_v4();
        self.observers.lock().unwrap().insert(id, tx);
        debug!("Observer {} registered.", id);
        (id, rx)
    }

    pub fn unregister(&self, id: Uuid) {
        if self.observers.lock().unwrap().remove(&id).is_some() {
            debug!("Observer {} unregistered.", id);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn broadcast(&self, message: LiveMessage) {
        let targets: Vec<(Uuid, mpsc::Sender<LiveMessage>)> = {
            let observers = self.observers.lock().unwrap();
            observers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Observer {} queue full; disconnecting it.", id);
                    dead.push(id);
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut observers = self.observers.lock().unwrap();
            for id in dead {
                observers.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SensorPayload;

    fn message(tag: &str) -> LiveMessage {
        LiveMessage {
            topic: "iot/tank/sensors".to_string(),
            payload: SensorPayload {
                temperature: 20.0,
                turbidity: 0.5,
                water_quality: tag.to_string(),
                ph: 7.0,
            },
            received_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn slow_observer_is_dropped_without_stalling_the_rest() {
        let fanout = FanoutChannel::new(1);
        let mut receivers: Vec<_> = (0..10).map(|_| fanout.register()).collect();

        fanout.broadcast(message("first"));

        // Drain all but one queue, leaving that observer full.
        for (_, rx) in receivers.iter_mut().skip(1) {
            assert!(rx.recv().await.is_some());
        }

        fanout.broadcast(message("second"));

        for (_, rx) in receivers.iter_mut().skip(1) {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.payload.water_quality, "second");
        }

        // The blocked observer keeps its stale message, then sees its channel
        // close instead of receiving the new broadcast.
        let (_, blocked_rx) = &mut receivers[0];
        assert_eq!(blocked_rx.recv().await.unwrap().payload.water_quality, "first");
        assert!(blocked_rx.recv().await.is_none());
        assert_eq!(fanout.observer_count(), 9);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let fanout = FanoutChannel::new(4);
        let (id, _rx) = fanout.register();
        fanout.unregister(id);
        fanout.unregister(id);
        assert_eq!(fanout.observer_count(), 0);
        fanout.broadcast(message("nobody"));
    }

    #[tokio::test]
    async fn closed_observers_are_pruned_on_broadcast() {
        let fanout = FanoutChannel::new(4);
        let (_id, rx) = fanout.register();
        drop(rx);
        fanout.broadcast(message("gone"));
        assert_eq!(fanout.observer_count(), 0);
    }
}
