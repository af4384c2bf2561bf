mod config;
mod db;
mod devices;
mod events;
mod fanout;
mod models;
mod mqtt_service;
mod rest_server;
mod service_utils;
mod topics;

use crate::config::Config;
use crate::db::DatabaseService;
use crate::devices::DeviceRegistry;
use crate::events::EventBus;
use crate::fanout::FanoutChannel;
use crate::mqtt_service::MqttService;
use crate::rest_server::{run_rest_server, AppState};
use crate::service_utils::{handle_shutdown, start_mqtt_service};
use crate::topics::TopicRegistry;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let db = match DatabaseService::new(&config.db_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    // Shared components: lifecycle bus, topic registry, live fan-out and the
    // bounded write buffer in front of the store.
    let (bus, lifecycle_rx) = EventBus::channel();
    let registry = Arc::new(TopicRegistry::new());
    let fanout = Arc::new(FanoutChannel::new(config.observer_queue_size));
    let (writer_tx, writer_rx) = mpsc::channel(config.write_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let writer_task = db::spawn_reading_writer(
        db.clone(),
        writer_rx,
        shutdown_rx.clone(),
        Duration::from_millis(config.write_drain_timeout_ms),
    );

    let mqtt_service = MqttService::new(
        registry.clone(),
        db.clone(),
        writer_tx,
        fanout.clone(),
        config.clone(),
    );
    start_mqtt_service(mqtt_service.clone(), lifecycle_rx, shutdown_rx.clone());

    let device_registry = Arc::new(DeviceRegistry::new(db.clone(), bus));

    // Start REST API server
    let state = AppState {
        db,
        devices: device_registry,
        fanout,
        mqtt: mqtt_service,
    };
    let http_port = config.http_port;
    let rest_api_task = tokio::spawn(async move {
        run_rest_server(state, http_port).await;
    });

    handle_shutdown(shutdown_tx).await;

    // The MQTT service unsubscribes and disconnects on its own; give the
    // store writer the chance to drain before exiting.
    rest_api_task.abort();
    if let Err(e) = writer_task.await {
        if !e.is_cancelled() {
            error!("Store writer task failed: {:?}", e);
        }
    }
    info!("All services shut down successfully.");
}
