use crate::events::LifecycleReceiver;
use crate::mqtt_service::MqttService;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Start the MQTT service on its own task.
pub fn start_mqtt_service(
    mqtt_service: Arc<MqttService>,
    lifecycle: LifecycleReceiver,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        mqtt_service.start(lifecycle, shutdown).await;
    });
}

/// Block until a termination signal arrives, then flip the shutdown flag
/// every long-running task watches.
pub async fn handle_shutdown(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for termination signal: {:?}", e);
    }
    info!("Shutdown signal received; stopping services...");
    let _ = shutdown_tx.send(true);
}
