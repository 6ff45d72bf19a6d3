//! Database query functions for the `devices` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{Device, DeviceId};

/// Insert a device, or replace the name and parameters of an existing row
/// with the same UDID. Returns the stored device.
pub async fn upsert_device(pool: &PgPool, device: &Device) -> Result<Device> {
    let stored = sqlx::query_as::<_, Device>(
        "INSERT INTO devices (udid, name, params) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (udid) DO UPDATE \
         SET name = EXCLUDED.name, params = EXCLUDED.params, updated_at = now() \
         RETURNING udid, name, params",
    )
    .bind(&device.udid)
    .bind(&device.name)
    .bind(Json(&device.params))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to store device {}", device.udid))?;

    Ok(stored)
}

/// Fetch a device by UDID.
pub async fn get_device(pool: &PgPool, udid: &DeviceId) -> Result<Option<Device>> {
    let device =
        sqlx::query_as::<_, Device>("SELECT udid, name, params FROM devices WHERE udid = $1")
            .bind(udid)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to fetch device {udid}"))?;

    Ok(device)
}

/// List every device, oldest registration first.
pub async fn list_devices(pool: &PgPool) -> Result<Vec<Device>> {
    let devices = sqlx::query_as::<_, Device>(
        "SELECT udid, name, params FROM devices ORDER BY created_at, udid",
    )
    .fetch_all(pool)
    .await
    .context("failed to list devices")?;

    Ok(devices)
}

/// Delete a device. Returns the removed row, or `None` if it did not exist.
pub async fn delete_device(pool: &PgPool, udid: &DeviceId) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>(
        "DELETE FROM devices WHERE udid = $1 RETURNING udid, name, params",
    )
    .bind(udid)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to delete device {udid}"))?;

    Ok(device)
}

/// Count the rows in the `devices` table.
pub async fn count_devices(pool: &PgPool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
        .fetch_one(pool)
        .await
        .context("failed to count devices")?;

    Ok(count)
}
