use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server configuration
    pub ui: UiConfig,

    /// Path configuration
    pub paths: PathConfig,

    /// Provisioning run configuration
    pub provisioning: ProvisioningConfig,

    /// NetworkManager CLI configuration
    pub network_manager: NetworkManagerConfig,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub devices_file: PathBuf,
    pub panel_html: PathBuf,
}

/// How the host reaches a device during a provisioning run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReachabilityMode {
    /// Devices are already reachable by IP on the host's network.
    #[default]
    Direct,
    /// The host joins each device's own access point, one at a time.
    HostJoin,
}

impl std::str::FromStr for ReachabilityMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "ip" => Ok(Self::Direct),
            "host-join" | "hostjoin" | "bssid" => Ok(Self::HostJoin),
            other => bail!("unknown provisioning mode: {other}"),
        }
    }
}

/// Timing and addressing of a provisioning run.
#[derive(Clone, Debug)]
pub struct ProvisioningSettings {
    pub mode: ReachabilityMode,
    pub device_ap_address: String,
    pub configure_timeout: Duration,
    pub join_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            mode: ReachabilityMode::Direct,
            device_ap_address: ProvisioningConfig::DEFAULT_DEVICE_AP_ADDRESS.to_string(),
            configure_timeout: Duration::from_secs(15),
            join_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisioningConfig {
    pub settings: ProvisioningSettings,
    pub ssid_prefix: String,
    pub scan_timeout: Duration,
    pub browse_duration: Duration,
}

#[derive(Clone, Debug)]
pub struct NetworkManagerConfig {
    pub nmcli_path: PathBuf,
    pub interface: Option<String>,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables.
    ///
    /// # Panics
    /// Panics if configuration loading fails. Call [`AppConfig::init`] first
    /// to handle that case gracefully.
    pub fn get() -> &'static Self {
        Self::cell().get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    /// Load and cache the configuration, reporting invalid values as error.
    pub fn init() -> Result<&'static Self> {
        if let Some(config) = Self::cell().get() {
            return Ok(config);
        }

        let config = Self::load_internal()?;
        Ok(Self::cell().get_or_init(|| config))
    }

    fn cell() -> &'static OnceLock<AppConfig> {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        &APP_CONFIG
    }

    fn load_internal() -> Result<Self> {
        let ui = UiConfig::load()?;
        let paths = PathConfig::load()?;
        let provisioning = ProvisioningConfig::load()?;
        let network_manager = NetworkManagerConfig::load()?;

        Ok(Self {
            ui,
            paths,
            provisioning,
            network_manager,
        })
    }
}

impl UiConfig {
    fn load() -> Result<Self> {
        let bind = env::var("UI_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("UI_PORT")
            .unwrap_or_else(|_| "5000".to_string())
            .parse::<u16>()
            .context("failed to parse UI_PORT: invalid format")?;

        Ok(Self { bind, port })
    }
}

impl PathConfig {
    const DEVICES_FILE_NAME: &str = "shelly_devices.json";

    fn load() -> Result<Self> {
        let data_dir = Self::data_dir();
        let devices_file = data_dir.join(Self::DEVICES_FILE_NAME);
        let panel_html = env::var("PANEL_HTML")
            .unwrap_or_else(|_| "panel.html".to_string())
            .into();

        Ok(Self {
            data_dir,
            devices_file,
            panel_html,
        })
    }

    #[cfg(not(any(test, feature = "mock")))]
    fn data_dir() -> PathBuf {
        env::var("DATA_DIR")
            .unwrap_or_else(|_| "/data".to_string())
            .into()
    }

    // In test mode, use temp directory as default to avoid /data requirement
    #[cfg(any(test, feature = "mock"))]
    fn data_dir() -> PathBuf {
        env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("shelly-provisioner-test"))
    }
}

impl ProvisioningConfig {
    pub const DEFAULT_DEVICE_AP_ADDRESS: &str = "192.168.33.1";

    fn load() -> Result<Self> {
        let mode = env::var("PROVISIONING_MODE")
            .unwrap_or_else(|_| "direct".to_string())
            .parse::<ReachabilityMode>()
            .context("failed to parse PROVISIONING_MODE")?;
        let device_ap_address = env::var("DEVICE_AP_ADDRESS")
            .unwrap_or_else(|_| Self::DEFAULT_DEVICE_AP_ADDRESS.to_string());
        let ssid_prefix = env::var("DEVICE_SSID_PREFIX").unwrap_or_else(|_| "shelly".to_string());

        let settings = ProvisioningSettings {
            mode,
            device_ap_address,
            configure_timeout: secs_from_env("CONFIGURE_TIMEOUT_SECS", 15)?,
            join_timeout: secs_from_env("JOIN_TIMEOUT_SECS", 60)?,
            settle_delay: secs_from_env("SETTLE_DELAY_SECS", 10)?,
        };

        Ok(Self {
            settings,
            ssid_prefix,
            scan_timeout: secs_from_env("SCAN_TIMEOUT_SECS", 45)?,
            browse_duration: secs_from_env("MDNS_BROWSE_SECS", 10)?,
        })
    }
}

impl NetworkManagerConfig {
    fn load() -> Result<Self> {
        let nmcli_path = env::var("NMCLI_PATH")
            .unwrap_or_else(|_| "nmcli".to_string())
            .into();
        let interface = env::var("WIFI_INTERFACE")
            .ok()
            .filter(|iface| !iface.trim().is_empty());

        Ok(Self {
            nmcli_path,
            interface,
        })
    }
}

fn secs_from_env(name: &str, default: u64) -> Result<Duration> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .context(format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
