use crate::{error::ConfigureError, types::Credentials};
use anyhow::{Context, Result};
use log::{error, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use trait_variant::make;

/// Sends target network credentials to a single device.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DeviceConfigurator {
    async fn configure(
        &self,
        address: String,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<(), ConfigureError>;
}

/// [`DeviceConfigurator`] talking to the Shelly HTTP settings API.
#[derive(Clone)]
pub struct ShellyDeviceClient {
    client: Client,
}

impl ShellyDeviceClient {
    const STA_SETTINGS_ENDPOINT: &str = "/settings/sta";

    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .build()
            .context("failed to create device HTTP client")?;

        Ok(ShellyDeviceClient { client })
    }

    /// Station settings URL carrying the percent-encoded credentials
    pub fn settings_url(address: &str, credentials: &Credentials) -> String {
        format!(
            "http://{address}{}?ssid={}&password={}",
            Self::STA_SETTINGS_ENDPOINT,
            urlencoding::encode(&credentials.ssid),
            urlencoding::encode(&credentials.password)
        )
    }
}

impl DeviceConfigurator for ShellyDeviceClient {
    async fn configure(
        &self,
        address: String,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<(), ConfigureError> {
        let url = Self::settings_url(&address, &credentials);
        // the url carries the password, only the device address is logged
        info!("GET http://{address}{}", Self::STA_SETTINGS_ENDPOINT);

        let res = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    return ConfigureError::Timeout {
                        secs: timeout.as_secs(),
                    };
                }

                let e = e.without_url();
                error!("request to {address} failed: {e:#}");
                ConfigureError::Transport(e.to_string())
            })?;

        match res.status() {
            StatusCode::OK => Ok(()),
            status => Err(ConfigureError::Status(status.as_u16())),
        }
    }
}
