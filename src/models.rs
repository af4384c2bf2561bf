use serde::{Deserialize, Serialize};

/// A registered field device. `id` is the internal database key; `device_id`
/// is the stable external identifier the firmware embeds in its topics.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: i64,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub name: String,
}

/// Inbound sensor payload as published by the firmware. Constrained devices
/// may omit any field; missing fields fall back to zero values instead of
/// failing the whole message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SensorPayload {
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub turbidity: f64,
    #[serde(default)]
    pub water_quality: String,
    #[serde(default)]
    pub ph: f64,
}

/// An accepted reading, stamped at ingest time. Append-only once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub device_id: String,
    pub timestamp: i64,
    pub temperature: f64,
    pub turbidity: f64,
    pub water_quality: String,
    pub ph: f64,
}

impl SensorReading {
    pub fn from_payload(device_id: &str, payload: &SensorPayload, timestamp: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp,
            temperature: payload.temperature,
            turbidity: payload.turbidity,
            water_quality: payload.water_quality.clone(),
            ph: payload.ph,
        }
    }
}

/// Message pushed to live observers for every accepted reading.
#[derive(Debug, Clone, Serialize)]
pub struct LiveMessage {
    pub topic: String,
    pub payload: SensorPayload,
    #[serde(rename = "receivedAt")]
    pub received_at: String,
}

/// One time bucket of the historical query result. Numeric fields are always
/// present because missing telemetry is zero-coerced at ingest; `water_quality`
/// is omitted when no point in the bucket reported one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatePoint {
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turbidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<f64>,
}

/// Device registry mutation, consumed by the broker connection manager to
/// keep subscriptions current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created {
        device_id: String,
    },
    /// Emitted only when the external identifier actually changed.
    Renamed {
        old_device_id: String,
        new_device_id: String,
    },
    Deleted {
        device_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_fields_default_to_zero_values() {
        let payload: SensorPayload = serde_json::from_str(r#"{"temperature": 21.5}"#).unwrap();
        assert_eq!(payload.temperature, 21.5);
        assert_eq!(payload.turbidity, 0.0);
        assert_eq!(payload.ph, 0.0);
        assert_eq!(payload.water_quality, "");
    }

    #[test]
    fn full_payload_parses() {
        let payload: SensorPayload = serde_json::from_str(
            r#"{"temperature": 24.0, "turbidity": 1.2, "water_quality": "good", "ph": 7.1}"#,
        )
        .unwrap();
        assert_eq!(payload.water_quality, "good");
        assert_eq!(payload.ph, 7.1);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(serde_json::from_str::<SensorPayload>("not json").is_err());
        assert!(serde_json::from_str::<SensorPayload>(r#"{"temperature": "hot"}"#).is_err());
    }
}
