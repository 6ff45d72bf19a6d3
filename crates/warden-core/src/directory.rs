//! Sources of the initial device list.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use warden_db::queries::devices as device_db;

use crate::Device;

/// Supplies the devices to activate when the supervisor starts.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>>;
}

/// Fixed, in-memory device list.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    devices: Vec<Device>,
}

impl StaticDirectory {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.clone())
    }
}

/// Device list stored in the `devices` table.
#[derive(Debug, Clone)]
pub struct PgDeviceDirectory {
    pool: PgPool,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        device_db::list_devices(&self.pool).await
    }
}
