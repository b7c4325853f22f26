use serde::{Deserialize, Deserializer, Serialize};
use serde_valid::Validate;
use std::{fmt, net::IpAddr};

/// A Shelly device as discovered, selected and persisted.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Device {
    pub ssid: String,
    #[serde(default, alias = "ip")]
    pub address: String,
    #[serde(default)]
    pub bssid: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<u8>,
    #[serde(default)]
    pub selected: bool,
}

impl Device {
    /// Identity used for de-duplication: ssid plus bssid when known.
    pub fn identity(&self) -> (&str, &str) {
        (&self.ssid, &self.bssid)
    }

    /// Bssid to pin a host-join to, if the device carries one.
    pub fn join_bssid(&self) -> Option<&str> {
        (!self.bssid.is_empty()).then_some(self.bssid.as_str())
    }
}

pub type DeviceSet = Vec<Device>;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Info,
    Progress,
    Success,
    Error,
    Warning,
}

/// One entry of the provisioning run log.
///
/// Serialized as `{"type": ..., "message": ..., "ssid": ...}` which is what
/// the panel page consumes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub message: String,
    #[serde(rename = "ssid", default, skip_serializing_if = "Option::is_none")]
    pub device_ssid: Option<String>,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            device_ssid: None,
        }
    }

    pub fn for_device(kind: StatusKind, message: impl Into<String>, ssid: &str) -> Self {
        Self {
            kind,
            message: message.into(),
            device_ssid: Some(ssid.to_string()),
        }
    }
}

/// Target network credentials, held only for the duration of one run.
#[derive(Clone, Default, Deserialize, Validate)]
pub struct Credentials {
    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(min_length = 1)]
    pub ssid: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(min_length = 1)]
    pub password: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A row of a WiFi scan.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub bssid: String,
    pub signal: u8,
}

/// An `_http._tcp` service seen while browsing mDNS.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AnnouncedService {
    /// Instance name without the service type, e.g. `shellyplug-s-7A1B2C`
    pub instance: String,
    pub addresses: Vec<IpAddr>,
    /// `model` TXT property
    pub model: String,
    /// `friendly_name` TXT property
    pub friendly_name: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Completed,
}
