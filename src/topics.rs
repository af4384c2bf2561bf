use crate::models::LifecycleEvent;
use std::collections::HashSet;
use std::sync::Mutex;

/// Telemetry topic for a device, matching what the firmware publishes on.
pub fn sensor_topic(device_id: &str) -> String {
    format!("iot/{device_id}/sensors")
}

/// Command topic the LED controller on the device listens on.
pub fn led_control_topic(device_id: &str) -> String {
    format!("iot/{device_id}/led/control")
}

/// Inverse of `sensor_topic`. Returns `None` for anything that is not a
/// well-formed single-device telemetry topic.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix("iot/")?
        .strip_suffix("/sensors")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// The set of device ids whose topics should currently be subscribed.
///
/// Lifecycle events mutate this set as they are processed; a reconnect
/// replaces it wholesale with the registry snapshot. The mutex is never held
/// across an await point.
pub struct TopicRegistry {
    devices: Mutex<HashSet<String>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the backing set with a fresh registry snapshot.
    pub fn replace(&self, device_ids: impl IntoIterator<Item = String>) {
        let mut devices = self.devices.lock().unwrap();
        devices.clear();
        devices.extend(device_ids);
    }

    pub fn apply(&self, event: &LifecycleEvent) {
        let mut devices = self.devices.lock().unwrap();
        match event {
            LifecycleEvent::Created { device_id } => {
                devices.insert(device_id.clone());
            }
            LifecycleEvent::Renamed {
                old_device_id,
                new_device_id,
            } => {
                devices.insert(new_device_id.clone());
                devices.remove(old_device_id);
            }
            LifecycleEvent::Deleted { device_id } => {
                devices.remove(device_id);
            }
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.lock().unwrap().contains(device_id)
    }

    /// Snapshot of every topic that should be subscribed, for bulk
    /// resubscription after a fresh connect.
    pub fn all_topics(&self) -> Vec<String> {
        let devices = self.devices.lock().unwrap();
        devices.iter().map(|id| sensor_topic(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_topic_is_deterministic_and_injective() {
        assert_eq!(sensor_topic("tank-01"), "iot/tank-01/sensors");
        assert_eq!(sensor_topic("tank-01"), sensor_topic("tank-01"));
        assert_ne!(sensor_topic("tank-01"), sensor_topic("tank-02"));
    }

    #[test]
    fn device_id_round_trips_through_topic() {
        assert_eq!(device_id_from_topic(&sensor_topic("dev7")), Some("dev7"));
    }

    #[test]
    fn foreign_topics_do_not_parse() {
        assert_eq!(device_id_from_topic("iot/dev7/led/control"), None);
        assert_eq!(device_id_from_topic("iot//sensors"), None);
        assert_eq!(device_id_from_topic("home/dev7/sensors"), None);
        assert_eq!(device_id_from_topic("iot/a/b/sensors"), None);
    }

    #[test]
    fn lifecycle_events_update_the_backing_set() {
        let registry = TopicRegistry::new();
        registry.apply(&LifecycleEvent::Created {
            device_id: "a".into(),
        });
        registry.apply(&LifecycleEvent::Created {
            device_id: "b".into(),
        });
        assert!(registry.contains("a"));

        registry.apply(&LifecycleEvent::Renamed {
            old_device_id: "a".into(),
            new_device_id: "c".into(),
        });
        assert!(!registry.contains("a"));
        assert!(registry.contains("c"));

        registry.apply(&LifecycleEvent::Deleted {
            device_id: "b".into(),
        });
        assert!(!registry.contains("b"));

        let mut topics = registry.all_topics();
        topics.sort();
        assert_eq!(topics, vec!["iot/c/sensors".to_string()]);
    }

    #[test]
    fn replace_overwrites_stale_entries() {
        let registry = TopicRegistry::new();
        registry.apply(&LifecycleEvent::Created {
            device_id: "stale".into(),
        });
        registry.replace(vec!["x".to_string(), "y".to_string()]);
        assert!(!registry.contains("stale"));
        assert_eq!(registry.all_topics().len(), 2);
    }
}
