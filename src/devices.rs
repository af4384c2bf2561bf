use crate::db::{DatabaseService, StoreError};
use crate::events::EventBus;
use crate::models::{Device, LifecycleEvent};
use log::info;
use rusqlite::ErrorCode;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found")]
    NotFound,
    #[error("device id '{0}' already exists")]
    Duplicate(String),
    #[error("invalid device id '{0}'")]
    InvalidId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Device registry operations. Every mutation that changes broker-relevant
/// state emits a lifecycle event for the connection manager; a rename event
/// is only emitted when the external identifier actually changed.
pub struct DeviceRegistry {
    db: Arc<DatabaseService>,
    bus: EventBus,
}

impl DeviceRegistry {
    pub fn new(db: Arc<DatabaseService>, bus: EventBus) -> Self {
        Self { db, bus }
    }

    pub fn create(&self, device_id: &str, name: &str) -> Result<Device, DeviceError> {
        validate_device_id(device_id)?;
        let device = self
            .db
            .create_device(device_id, name)
            .map_err(|e| map_duplicate(e, device_id))?;
        info!("Device '{}' created.", device.device_id);
        self.bus.publish(LifecycleEvent::Created {
            device_id: device.device_id.clone(),
        });
        Ok(device)
    }

    pub fn list(&self) -> Result<Vec<Device>, DeviceError> {
        Ok(self.db.list_devices()?)
    }

    pub fn exists(&self, device_id: &str) -> Result<bool, DeviceError> {
        Ok(self.db.device_exists(device_id)?)
    }

    pub fn update(&self, id: i64, device_id: &str, name: &str) -> Result<Device, DeviceError> {
        validate_device_id(device_id)?;
        let old = self.db.get_device(id)?.ok_or(DeviceError::NotFound)?;
        self.db
            .update_device(id, device_id, name)
            .map_err(|e| map_duplicate(e, device_id))?;

        if old.device_id != device_id {
            info!(
                "Device '{}' renamed to '{}'.",
                old.device_id, device_id
            );
            self.bus.publish(LifecycleEvent::Renamed {
                old_device_id: old.device_id,
                new_device_id: device_id.to_string(),
            });
        }
        Ok(Device {
            id,
            device_id: device_id.to_string(),
            name: name.to_string(),
        })
    }

    pub fn delete(&self, id: i64) -> Result<Device, DeviceError> {
        let device = self.db.get_device(id)?.ok_or(DeviceError::NotFound)?;
        self.db.delete_device(id)?;
        info!("Device '{}' deleted.", device.device_id);
        self.bus.publish(LifecycleEvent::Deleted {
            device_id: device.device_id.clone(),
        });
        Ok(device)
    }
}

/// Device ids become topic segments, so anything with topic-level meaning
/// is rejected here rather than in the topic registry.
fn validate_device_id(device_id: &str) -> Result<(), DeviceError> {
    if device_id.is_empty() || device_id.chars().any(|c| "/+#".contains(c) || c.is_whitespace()) {
        return Err(DeviceError::InvalidId(device_id.to_string()));
    }
    Ok(())
}

fn map_duplicate(e: StoreError, device_id: &str) -> DeviceError {
    if let StoreError::Db(rusqlite::Error::SqliteFailure(err, _)) = &e {
        if err.code == ErrorCode::ConstraintViolation {
            return DeviceError::Duplicate(device_id.to_string());
        }
    }
    DeviceError::Store(e)
}
