//! CLI handlers for `warden device` subcommands.
//!
//! Implements:
//! - `warden device add`    -- register or update a device
//! - `warden device list`   -- list registered devices in table format
//! - `warden device remove` -- delete a device from the directory
//!
//! These edit the persisted directory only. A running supervisor picks up
//! changes through the control API or on its next start.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use warden_db::models::{Device, DeviceId, parse_param};
use warden_db::queries::devices as device_db;

use crate::DeviceCommands;

/// Dispatch a `DeviceCommands` variant to the appropriate handler.
pub async fn run_device_command(command: DeviceCommands, pool: &PgPool) -> Result<()> {
    match command {
        DeviceCommands::Add { udid, name, params } => {
            let device = build_device(&udid, &name, &params)?;
            let stored = device_db::upsert_device(pool, &device).await?;
            println!("Registered device {} ({})", stored.udid, stored.name);
            Ok(())
        }
        DeviceCommands::List => cmd_list(pool).await,
        DeviceCommands::Remove { udid } => {
            let id = parse_udid(&udid)?;
            match device_db::delete_device(pool, &id).await? {
                Some(device) => {
                    println!("Removed device {} ({})", device.udid, device.name);
                    Ok(())
                }
                None => bail!("device {id} not found"),
            }
        }
    }
}

fn parse_udid(raw: &str) -> Result<DeviceId> {
    raw.parse()
        .with_context(|| format!("invalid device id: {raw:?}"))
}

/// Assemble a device from CLI arguments. A repeated key keeps the last value.
fn build_device(udid: &str, name: &str, params: &[String]) -> Result<Device> {
    let name = name.trim();
    if name.is_empty() {
        bail!("device name must not be empty");
    }
    let mut parsed = BTreeMap::new();
    for raw in params {
        let (key, value) = parse_param(raw)?;
        parsed.insert(key, value);
    }
    Ok(Device {
        udid: parse_udid(udid)?,
        name: name.to_string(),
        params: parsed,
    })
}

async fn cmd_list(pool: &PgPool) -> Result<()> {
    let devices = device_db::list_devices(pool).await?;

    if devices.is_empty() {
        println!("No devices found. Use `warden device add` to register one.");
        return Ok(());
    }

    let udid_w = devices
        .iter()
        .map(|d| d.udid.as_str().len())
        .max()
        .unwrap_or(4)
        .max(4);
    let name_w = devices.iter().map(|d| d.name.len()).max().unwrap_or(4).max(4);

    println!("{:<udid_w$}  {:<name_w$}  PARAMS", "UDID", "NAME");
    for device in &devices {
        println!(
            "{:<udid_w$}  {:<name_w$}  {}",
            device.udid.as_str(),
            device.name,
            device.param_args().join(" ")
        );
    }
    println!("\n{} device(s)", devices.len());

    Ok(())
}
