use crate::models::LifecycleEvent;
use log::warn;
use tokio::sync::mpsc;

pub type LifecycleReceiver = mpsc::UnboundedReceiver<LifecycleEvent>;

/// In-process bus carrying device lifecycle events from the registry to the
/// broker connection manager.
///
/// A single ordered queue feeds a single consumer, which trivially preserves
/// emission order per device. Publishing never blocks; events emitted while
/// no consumer is attached are dropped, which is safe because a fresh connect
/// re-derives the full subscription set from the registry snapshot.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl EventBus {
    /// Create the bus together with its single consumer end.
    pub fn channel() -> (Self, LifecycleReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            warn!("Lifecycle event dropped: no consumer attached.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (bus, mut rx) = EventBus::channel();
        bus.publish(LifecycleEvent::Created {
            device_id: "d1".into(),
        });
        bus.publish(LifecycleEvent::Renamed {
            old_device_id: "d1".into(),
            new_device_id: "d2".into(),
        });
        bus.publish(LifecycleEvent::Deleted {
            device_id: "d2".into(),
        });

        assert_eq!(
            rx.recv().await,
            Some(LifecycleEvent::Created {
                device_id: "d1".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(LifecycleEvent::Renamed {
                old_device_id: "d1".into(),
                new_device_id: "d2".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(LifecycleEvent::Deleted {
                device_id: "d2".into()
            })
        );
    }

    #[tokio::test]
    async fn publish_without_consumer_does_not_panic() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        bus.publish(LifecycleEvent::Created {
            device_id: "orphan".into(),
        });
    }
}
