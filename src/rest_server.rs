use crate::db::{DatabaseService, HistoryParams};
use crate::devices::{DeviceError, DeviceRegistry};
use crate::fanout::FanoutChannel;
use crate::models::Device;
use crate::mqtt_service::MqttService;
use crate::topics;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use log::{error, info};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseService>,
    pub devices: Arc<DeviceRegistry>,
    pub fanout: Arc<FanoutChannel>,
    pub mqtt: Arc<MqttService>,
}

/// API Response envelope for non-data endpoints.
#[derive(Serialize)]
struct ApiResponse {
    status: String,
    message: String,
}

impl ApiResponse {
    fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
            message: message.into(),
        })
    }

    fn error(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "error".to_string(),
            message: message.into(),
        })
    }
}

#[derive(Deserialize)]
struct CreateDeviceRequest {
    #[serde(rename = "deviceId")]
    device_id: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct UpdateDeviceRequest {
    #[serde(rename = "deviceId")]
    device_id: String,
    name: String,
}

#[derive(Deserialize, Serialize)]
struct LedControlRequest {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<String>,
}

fn device_error_response(e: DeviceError) -> (StatusCode, Json<ApiResponse>) {
    let status = match &e {
        DeviceError::NotFound => StatusCode::NOT_FOUND,
        DeviceError::Duplicate(_) => StatusCode::CONFLICT,
        DeviceError::InvalidId(_) => StatusCode::BAD_REQUEST,
        DeviceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, ApiResponse::error(e.to_string()))
}

/// Root handler
async fn root_handler() -> Json<ApiResponse> {
    ApiResponse::success("AquaFlux telemetry API")
}

async fn list_devices(
    State(state): State<AppState>,
) -> Result<Json<Vec<Device>>, (StatusCode, Json<ApiResponse>)> {
    state
        .devices
        .list()
        .map(Json)
        .map_err(device_error_response)
}

async fn create_device(
    State(state): State<AppState>,
    Json(body): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), (StatusCode, Json<ApiResponse>)> {
    let name = body.name.unwrap_or_else(|| "My device".to_string());
    state
        .devices
        .create(&body.device_id, &name)
        .map(|device| (StatusCode::CREATED, Json(device)))
        .map_err(device_error_response)
}

async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateDeviceRequest>,
) -> Result<Json<Device>, (StatusCode, Json<ApiResponse>)> {
    state
        .devices
        .update(id, &body.device_id, &body.name)
        .map(Json)
        .map_err(device_error_response)
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Device>, (StatusCode, Json<ApiResponse>)> {
    state
        .devices
        .delete(id)
        .map(Json)
        .map_err(device_error_response)
}

/// Downsampled history for one device. Invalid window or bucket parameters
/// are rejected here; an unknown device yields an empty list, not an error.
async fn device_data(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<crate::models::AggregatePoint>>, (StatusCode, Json<ApiResponse>)> {
    if let Err(e) = params.validate() {
        return Err((StatusCode::BAD_REQUEST, ApiResponse::error(e.to_string())));
    }
    match state
        .db
        .sensor_history(&device_id, params.duration_minutes, params.aggregate_seconds)
    {
        Ok(points) => Ok(Json(points)),
        Err(e) => {
            error!("Historical query for '{}' failed: {}", device_id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error("historical query failed"),
            ))
        }
    }
}

/// Dispatch an LED command to the device over the broker. Best-effort: the
/// publish is dropped with a warning when the broker is unreachable.
async fn control_led(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<LedControlRequest>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    match state.devices.exists(&device_id) {
        Ok(true) => {}
        Ok(false) => return Err(device_error_response(DeviceError::NotFound)),
        Err(e) => return Err(device_error_response(e)),
    }

    let payload = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    state
        .mqtt
        .publish_message(
            &topics::led_control_topic(&device_id),
            &payload,
            QoS::AtLeastOnce,
            true,
        )
        .await;
    Ok(ApiResponse::success("command dispatched"))
}

/// Live telemetry stream. Each connection becomes one fan-out observer for
/// its lifetime.
async fn live_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observe(socket, state.fanout.clone()))
}

async fn observe(socket: WebSocket, fanout: Arc<FanoutChannel>) {
    let (observer_id, mut queue) = fanout.register();
    info!("Observer {} connected.", observer_id);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            delivery = queue.recv() => match delivery {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Queue closed: the fan-out dropped this observer for falling
                // behind. Close the socket rather than leaving it dangling.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {} // observers only listen; ignore chatter
            },
        }
    }

    fanout.unregister(observer_id);
    info!("Observer {} disconnected.", observer_id);
}

/// Run the REST/WebSocket server with the composed application state.
pub async fn run_rest_server(state: AppState, port: u16) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/api/devices", get(list_devices).post(create_device))
        // The router requires one parameter name per path position, so this
        // placeholder matches the sibling routes even though the segment here
        // carries the internal numeric id.
        .route(
            "/api/devices/{device_id}",
            axum::routing::put(update_device).delete(delete_device),
        )
        .route("/api/devices/{device_id}/data", get(device_data))
        .route(
            "/api/devices/{device_id}/control",
            axum::routing::patch(control_led),
        )
        .route("/api/live", get(live_ws))
        .layer(cors)
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!("REST API listening on {}.", addr);
            if let Err(e) = axum::serve(listener, app).await {
                error!("REST server error: {}", e);
            }
        }
        Err(e) => error!("Failed to bind REST server on {}: {}", addr, e),
    }
}
