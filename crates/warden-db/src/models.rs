use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// DeviceId
// ---------------------------------------------------------------------------

/// Unique identifier of a device (its UDID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a device identifier or parameter cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceParseError {
    #[error("device id must not be empty")]
    EmptyId,
    #[error("device id {0:?} contains whitespace")]
    WhitespaceInId(String),
    #[error("invalid parameter {0:?}: expected key=value")]
    InvalidParam(String),
}

impl FromStr for DeviceId {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DeviceParseError::EmptyId);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(DeviceParseError::WhitespaceInId(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A supervised device.
///
/// `params` is opaque to the supervisor: every entry is handed to the harness
/// verbatim as a `key=value` argument. Equality and hashing consider only the
/// identifier, so two submissions of the same UDID with different parameters
/// are the same device.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub udid: DeviceId,
    pub name: String,
    #[serde(default)]
    #[sqlx(json)]
    pub params: BTreeMap<String, String>,
}

impl Device {
    pub fn new(udid: DeviceId, name: impl Into<String>) -> Self {
        Self {
            udid,
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Whether `other` is this device with the same name and parameters,
    /// i.e. would run the harness with the same arguments.
    pub fn same_config(&self, other: &Device) -> bool {
        self.udid == other.udid && self.name == other.name && self.params == other.params
    }

    /// Render the parameters as `key=value` arguments, in key order.
    pub fn param_args(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.udid == other.udid
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.udid.hash(state);
    }
}

/// Parse a `key=value` parameter. The key must be non-empty; the value may
/// contain further `=` characters.
pub fn parse_param(raw: &str) -> Result<(String, String), DeviceParseError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.to_owned()))
        }
        _ => Err(DeviceParseError::InvalidParam(raw.to_owned())),
    }
}
