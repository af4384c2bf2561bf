use crate::config::Config;
use crate::db::DatabaseService;
use crate::events::LifecycleReceiver;
use crate::fanout::FanoutChannel;
use crate::models::{LifecycleEvent, LiveMessage, SensorPayload, SensorReading};
use crate::topics::{self, TopicRegistry};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

/// Subscription work is serialized on its own task so awaiting the client's
/// bounded request channel never stalls the event loop that drains it.
#[derive(Debug)]
enum SubscriptionCommand {
    Resync,
    Apply(LifecycleEvent),
}

/// Owns the single broker connection. Keeps topic subscriptions consistent
/// with the device registry, routes inbound telemetry into the store writer
/// and the live fan-out, and reconnects with capped exponential backoff.
pub struct MqttService {
    state: StdMutex<ClientState>,
    client: Mutex<Option<AsyncClient>>,
    /// Topics believed to be subscribed on the live connection. Replaced
    /// wholesale by the bulk resubscribe after every (re)connect.
    subscriptions: StdMutex<HashSet<String>>,
    registry: Arc<TopicRegistry>,
    db: Arc<DatabaseService>,
    writer: mpsc::Sender<SensorReading>,
    fanout: Arc<FanoutChannel>,
    config: Config,
}

impl MqttService {
    pub fn new(
        registry: Arc<TopicRegistry>,
        db: Arc<DatabaseService>,
        writer: mpsc::Sender<SensorReading>,
        fanout: Arc<FanoutChannel>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(ClientState::Disconnected),
            client: Mutex::new(None),
            subscriptions: StdMutex::new(HashSet::new()),
            registry,
            db,
            writer,
            fanout,
            config,
        })
    }

    fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }

    pub async fn start(
        self: Arc<Self>,
        mut lifecycle: LifecycleReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting MQTT service...");

        let initial_retry_interval = Duration::from_millis(self.config.mqtt_retry_interval_ms);
        let mut retry_interval = initial_retry_interval;
        let mut first_attempt = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(if first_attempt {
                ClientState::Connecting
            } else {
                ClientState::Reconnecting
            });
            first_attempt = false;

            debug!(
                "Configuring MQTT broker at {}:{}...",
                self.config.mqtt_host, self.config.mqtt_port
            );

            let client_id = format!("aquaflux_{}", Uuid::new_v4());
            let mut mqtt_options =
                MqttOptions::new(client_id, &self.config.mqtt_host, self.config.mqtt_port);
            mqtt_options.set_keep_alive(Duration::from_secs(10));
            mqtt_options.set_clean_session(true);

            if !self.config.mqtt_username.is_empty() && !self.config.mqtt_password.is_empty() {
                mqtt_options
                    .set_credentials(&self.config.mqtt_username, &self.config.mqtt_password);
            }

            let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

            {
                let mut client_lock = self.client.lock().await;
                *client_lock = Some(client.clone());
            }

            // Ends on its own once the command channel and event loop of this
            // connection attempt are gone.
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            tokio::spawn(
                self.clone()
                    .run_subscription_worker(client.clone(), command_rx),
            );

            loop {
                tokio::select! {
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(
                                "Connected to MQTT broker at {}:{}.",
                                self.config.mqtt_host, self.config.mqtt_port
                            );
                            self.set_state(ClientState::Connected);
                            retry_interval = initial_retry_interval;
                            let _ = command_tx.send(SubscriptionCommand::Resync);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let self_clone = self.clone();
                            tokio::spawn(async move {
                                self_clone
                                    .handle_publish(publish.topic, publish.payload.to_vec())
                                    .await;
                            });
                        }
                        Ok(event) => {
                            debug!("Unhandled event: {:?}", event);
                        }
                        Err(e) => {
                            error!("Error in MQTT event loop: {:?}", e);
                            self.set_state(ClientState::Disconnected);
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        self.shutdown(&client).await;
                        return;
                    }
                    Some(event) = lifecycle.recv() => {
                        let _ = command_tx.send(SubscriptionCommand::Apply(event));
                    }
                }
            }

            {
                let mut client_lock = self.client.lock().await;
                *client_lock = None;
            }

            warn!(
                "Lost connection to MQTT broker. Retrying in {:?}...",
                retry_interval
            );

            // Keep consuming lifecycle events during the backoff so the
            // registry stays current; the bulk resubscribe reconciles the
            // actual subscriptions once we are back.
            let backoff = sleep(retry_interval);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    _ = shutdown.changed() => {
                        self.set_state(ClientState::Disconnected);
                        return;
                    }
                    Some(event) = lifecycle.recv() => {
                        debug!("Not connected; deferring subscription change for {:?}.", event);
                        self.registry.apply(&event);
                    }
                }
            }
            retry_interval = (retry_interval * 2).min(Duration::from_secs(60));
        }
    }

    async fn run_subscription_worker(
        self: Arc<Self>,
        client: AsyncClient,
        mut commands: mpsc::UnboundedReceiver<SubscriptionCommand>,
    ) {
        while let Some(command) = commands.recv().await {
            match command {
                SubscriptionCommand::Resync => self.resubscribe_all(&client).await,
                SubscriptionCommand::Apply(event) => self.handle_lifecycle(&client, event).await,
            }
        }
    }

    /// Re-derive the full subscription set from the registry snapshot and
    /// subscribe everything. This runs on every (re)connect and is the
    /// recovery mechanism for lifecycle events missed while disconnected.
    async fn resubscribe_all(&self, client: &AsyncClient) {
        let snapshot = match self.db.device_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to read device registry snapshot: {}", e);
                return;
            }
        };
        self.registry.replace(snapshot);

        let topics = self.registry.all_topics();
        {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.clear();
            subscriptions.extend(topics.iter().cloned());
        }

        for topic in &topics {
            if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
                error!("Failed to subscribe to topic '{}': {}", topic, e);
            }
        }
        info!("Subscribed to {} device topic(s).", topics.len());
    }

    async fn handle_lifecycle(&self, client: &AsyncClient, event: LifecycleEvent) {
        self.registry.apply(&event);

        if self.state() != ClientState::Connected {
            debug!("Not connected; deferring subscription change for {:?}.", event);
            return;
        }

        match event {
            LifecycleEvent::Created { device_id } => {
                let topic = topics::sensor_topic(&device_id);
                if self.track_subscribe(&topic) {
                    self.subscribe(client, &topic).await;
                }
            }
            LifecycleEvent::Renamed {
                old_device_id,
                new_device_id,
            } => {
                // Subscribe the new topic before dropping the old one, so the
                // device never has zero active subscriptions mid-swap.
                let new_topic = topics::sensor_topic(&new_device_id);
                let old_topic = topics::sensor_topic(&old_device_id);
                if self.track_subscribe(&new_topic) {
                    self.subscribe(client, &new_topic).await;
                }
                if self.track_unsubscribe(&old_topic) {
                    self.unsubscribe(client, &old_topic).await;
                }
            }
            LifecycleEvent::Deleted { device_id } => {
                let topic = topics::sensor_topic(&device_id);
                if self.track_unsubscribe(&topic) {
                    self.unsubscribe(client, &topic).await;
                }
            }
        }
    }

    /// Record the topic as subscribed. Returns false if it already was.
    fn track_subscribe(&self, topic: &str) -> bool {
        self.subscriptions.lock().unwrap().insert(topic.to_string())
    }

    /// Forget the topic. Returns false if it was not subscribed.
    fn track_unsubscribe(&self, topic: &str) -> bool {
        self.subscriptions.lock().unwrap().remove(topic)
    }

    async fn subscribe(&self, client: &AsyncClient, topic: &str) {
        match client.subscribe(topic, QoS::AtMostOnce).await {
            Ok(_) => info!("Subscribed to topic '{}'.", topic),
            Err(e) => error!("Failed to subscribe to topic '{}': {}", topic, e),
        }
    }

    async fn unsubscribe(&self, client: &AsyncClient, topic: &str) {
        match client.unsubscribe(topic).await {
            Ok(_) => info!("Unsubscribed from topic '{}'.", topic),
            Err(e) => error!("Failed to unsubscribe from topic '{}': {}", topic, e),
        }
    }

    /// Ingestion path for one inbound message. Every failure is contained
    /// here; nothing propagates back into the event loop.
    async fn handle_publish(self: Arc<Self>, topic: String, payload: Vec<u8>) {
        let Some(device_id) = topics::device_id_from_topic(&topic) else {
            warn!("Ignoring message on unexpected topic '{}'.", topic);
            return;
        };
        if !self.registry.contains(device_id) {
            // Possible for messages already in flight when a device was
            // deleted; orphaned but harmless.
            debug!("Dropping message for unknown device '{}'.", device_id);
            return;
        }

        let payload: SensorPayload = match serde_json::from_slice(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Invalid sensor payload on '{}': {}", topic, e);
                return;
            }
        };

        let received_at = OffsetDateTime::now_utc();
        let reading = SensorReading::from_payload(device_id, &payload, received_at.unix_timestamp());

        match self.writer.try_send(reading) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    "Write buffer full; dropping reading from '{}'.",
                    dropped.device_id
                );
            }
            Err(TrySendError::Closed(dropped)) => {
                error!(
                    "Store writer is gone; dropping reading from '{}'.",
                    dropped.device_id
                );
            }
        }

        // Live view is independent of persistence success.
        let received_at = received_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::new());
        self.fanout.broadcast(LiveMessage {
            topic,
            payload,
            received_at,
        });
    }

    /// Outbound publish. Messages are not queued while disconnected;
    /// delivery is at-most-once by design.
    pub async fn publish_message(&self, topic: &str, message: &str, qos: QoS, retain: bool) {
        if self.state() != ClientState::Connected {
            warn!("MQTT not connected; dropping publish to '{}'.", topic);
            return;
        }
        let client = self.client.lock().await;
        match client.as_ref() {
            Some(client) => match client.publish(topic, qos, retain, message).await {
                Ok(_) => info!("Published to '{}': {}", topic, message),
                Err(e) => error!("Failed to publish message to '{}': {:?}", topic, e),
            },
            None => warn!("MQTT client not available; dropping publish to '{}'.", topic),
        }
    }

    async fn shutdown(&self, client: &AsyncClient) {
        info!("MQTT service shutting down...");
        self.set_state(ClientState::ShuttingDown);

        // Non-blocking client calls: the event loop is no longer polled past
        // this point, so everything here is strictly best-effort.
        let topics: Vec<String> = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.drain().collect()
        };
        for topic in topics {
            if let Err(e) = client.try_unsubscribe(&topic) {
                debug!("Unsubscribe of '{}' failed during shutdown: {:?}", topic, e);
            }
        }
        if let Err(e) = client.try_disconnect() {
            debug!("Disconnect failed during shutdown: {:?}", e);
        }

        {
            let mut client_lock = self.client.lock().await;
            *client_lock = None;
        }
        self.set_state(ClientState::Disconnected);
        info!("MQTT client disconnected.");
    }

    #[cfg(test)]
    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().unwrap().contains(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        service: Arc<MqttService>,
        client: AsyncClient,
        writer_rx: mpsc::Receiver<SensorReading>,
        // Never polled; held so client requests keep a live channel.
        _eventloop: rumqttc::EventLoop,
    }

    fn harness() -> Harness {
        harness_with_buffer(8)
    }

    fn harness_with_buffer(write_buffer_size: usize) -> Harness {
        let config = Config {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_retry_interval_ms: 5000,
            http_port: 3000,
            db_path: ":memory:".to_string(),
            write_buffer_size,
            write_drain_timeout_ms: 1000,
            observer_queue_size: 8,
        };
        let db = Arc::new(DatabaseService::open_in_memory().unwrap());
        let registry = Arc::new(TopicRegistry::new());
        let fanout = Arc::new(FanoutChannel::new(config.observer_queue_size));
        let (writer_tx, writer_rx) = mpsc::channel(config.write_buffer_size);
        let service = MqttService::new(registry, db, writer_tx, fanout, config);

        // A client whose event loop is never polled: requests just queue up,
        // which is all the bookkeeping tests need.
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("test-client", "localhost", 1883), 64);
        Harness {
            service,
            client,
            writer_rx,
            _eventloop: eventloop,
        }
    }

    #[tokio::test]
    async fn created_event_subscribes_topic_while_connected() {
        let h = harness();
        h.service.set_state(ClientState::Connected);
        h.service
            .handle_lifecycle(
                &h.client,
                LifecycleEvent::Created {
                    device_id: "tank-01".into(),
                },
            )
            .await;

        assert!(h.service.is_subscribed("iot/tank-01/sensors"));
        assert!(h.service.registry.contains("tank-01"));
    }

    #[tokio::test]
    async fn rename_swaps_topics() {
        let h = harness();
        h.service.set_state(ClientState::Connected);
        h.service
            .handle_lifecycle(
                &h.client,
                LifecycleEvent::Created {
                    device_id: "old".into(),
                },
            )
            .await;
        h.service
            .handle_lifecycle(
                &h.client,
                LifecycleEvent::Renamed {
                    old_device_id: "old".into(),
                    new_device_id: "new".into(),
                },
            )
            .await;

        assert!(h.service.is_subscribed("iot/new/sensors"));
        assert!(!h.service.is_subscribed("iot/old/sensors"));
        assert!(!h.service.registry.contains("old"));
    }

    #[tokio::test]
    async fn deleted_event_unsubscribes_topic() {
        let h = harness();
        h.service.set_state(ClientState::Connected);
        h.service
            .handle_lifecycle(
                &h.client,
                LifecycleEvent::Created {
                    device_id: "tank-01".into(),
                },
            )
            .await;
        h.service
            .handle_lifecycle(
                &h.client,
                LifecycleEvent::Deleted {
                    device_id: "tank-01".into(),
                },
            )
            .await;

        assert!(!h.service.is_subscribed("iot/tank-01/sensors"));
        assert!(!h.service.registry.contains("tank-01"));
    }

    #[tokio::test]
    async fn lifecycle_while_disconnected_updates_registry_only() {
        let h = harness();
        h.service
            .handle_lifecycle(
                &h.client,
                LifecycleEvent::Created {
                    device_id: "tank-01".into(),
                },
            )
            .await;

        assert!(h.service.registry.contains("tank-01"));
        assert!(!h.service.is_subscribed("iot/tank-01/sensors"));
    }

    #[tokio::test]
    async fn resubscribe_restores_snapshot_after_reconnect() {
        let h = harness();
        h.service.db.create_device("a", "A").unwrap();
        h.service.db.create_device("b", "B").unwrap();
        // Stale in-memory state from before the simulated disconnect.
        h.service.registry.replace(vec!["stale".to_string()]);
        h.service.track_subscribe("iot/stale/sensors");

        h.service.resubscribe_all(&h.client).await;

        assert!(h.service.is_subscribed("iot/a/sensors"));
        assert!(h.service.is_subscribed("iot/b/sensors"));
        assert!(!h.service.is_subscribed("iot/stale/sensors"));
        let mut topics = h.service.registry.all_topics();
        topics.sort();
        assert_eq!(topics, vec!["iot/a/sensors", "iot/b/sensors"]);
    }

    #[tokio::test]
    async fn accepted_message_is_stored_and_broadcast_once() {
        let mut h = harness();
        h.service.registry.replace(vec!["tank-01".to_string()]);
        let (_id, mut observer) = h.service.fanout.register();

        h.service
            .clone()
            .handle_publish(
                "iot/tank-01/sensors".to_string(),
                br#"{"temperature": 22.5, "ph": 7.2}"#.to_vec(),
            )
            .await;

        let stored = h.writer_rx.try_recv().unwrap();
        assert_eq!(stored.device_id, "tank-01");
        assert_eq!(stored.temperature, 22.5);
        assert_eq!(stored.water_quality, ""); // defaulted
        assert!(h.writer_rx.try_recv().is_err());

        let live = observer.recv().await.unwrap();
        assert_eq!(live.topic, "iot/tank-01/sensors");
        assert_eq!(live.payload.ph, 7.2);
    }

    #[tokio::test]
    async fn write_buffer_overflow_drops_newest_without_blocking() {
        let mut h = harness_with_buffer(1);
        h.service.registry.replace(vec!["tank-01".to_string()]);
        let (_id, mut observer) = h.service.fanout.register();

        h.service
            .clone()
            .handle_publish(
                "iot/tank-01/sensors".to_string(),
                br#"{"temperature": 1.0}"#.to_vec(),
            )
            .await;
        // Second message arrives while the writer buffer is still full.
        h.service
            .clone()
            .handle_publish(
                "iot/tank-01/sensors".to_string(),
                br#"{"temperature": 2.0}"#.to_vec(),
            )
            .await;

        // The buffered reading survives; the newest one was dropped.
        let retained = h.writer_rx.try_recv().unwrap();
        assert_eq!(retained.temperature, 1.0);
        assert!(h.writer_rx.try_recv().is_err());

        // The live view is unaffected by the dropped write.
        assert_eq!(observer.recv().await.unwrap().payload.temperature, 1.0);
        assert_eq!(observer.recv().await.unwrap().payload.temperature, 2.0);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_silently() {
        let mut h = harness();
        h.service.registry.replace(vec!["tank-01".to_string()]);
        let (_id, mut observer) = h.service.fanout.register();

        h.service
            .clone()
            .handle_publish("iot/tank-01/sensors".to_string(), b"not json".to_vec())
            .await;

        assert!(h.writer_rx.try_recv().is_err());
        assert!(observer.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_device_and_foreign_topics_are_dropped() {
        let mut h = harness();
        h.service
            .clone()
            .handle_publish(
                "iot/ghost/sensors".to_string(),
                br#"{"temperature": 1.0}"#.to_vec(),
            )
            .await;
        h.service
            .clone()
            .handle_publish("weird/topic".to_string(), br#"{}"#.to_vec())
            .await;

        assert!(h.writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_a_noop() {
        let h = harness();
        h.service
            .publish_message("iot/tank-01/led/control", "{}", QoS::AtLeastOnce, false)
            .await;
        // No client was ever attached; the call must return without panicking.
        assert_eq!(h.service.state(), ClientState::Disconnected);
    }
}
