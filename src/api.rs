use crate::{
    config::{AppConfig, ReachabilityMode},
    device_client::DeviceConfigurator,
    error::ScanError,
    http_client::{Envelope, ResponseStatus, ServiceResultResponse, handle_service_result},
    mdns_client::DeviceBrowser,
    network_manager_client::NetworkConnector,
    services::{discovery::DiscoveryService, provisioning::ProvisioningService},
    types::{Credentials, Device, DeviceSet, RunState},
};
use actix_files::NamedFile;
use actix_web::{HttpResponse, Responder, error::InternalError, web};
use anyhow::Context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::{collections::HashSet, sync::Arc, time::Duration};

#[derive(Deserialize)]
pub struct SaveDevicesPayload {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Debug, Serialize)]
pub struct HealthcheckInfo {
    pub status: ResponseStatus,
    pub state: RunState,
    pub mode: ReachabilityMode,
}

pub struct Api<Network, Configurator, Browser>
where
    Network: NetworkConnector,
    Configurator: DeviceConfigurator,
    Browser: DeviceBrowser,
{
    pub provisioning: Arc<ProvisioningService<Network, Configurator>>,
    pub browser: Browser,
    pub ssid_prefix: String,
    pub scan_timeout: Duration,
    pub browse_duration: Duration,
}

impl<Network, Configurator, Browser> Api<Network, Configurator, Browser>
where
    Network: NetworkConnector + Send + Sync + 'static,
    Configurator: DeviceConfigurator + Send + Sync + 'static,
    Browser: DeviceBrowser + 'static,
{
    pub fn new(
        provisioning: ProvisioningService<Network, Configurator>,
        browser: Browser,
        ssid_prefix: impl Into<String>,
        scan_timeout: Duration,
        browse_duration: Duration,
    ) -> Self {
        Api {
            provisioning: Arc::new(provisioning),
            browser,
            ssid_prefix: ssid_prefix.into(),
            scan_timeout,
            browse_duration,
        }
    }

    /// Register all routes of the provisioning API
    ///
    /// The scan is reachable under `/setup/scan` and `/api/setup/scan`, the
    /// latter being what the panel page of the add-on variant calls.
    /// Undecodable JSON bodies are answered with an error envelope.
    pub fn routes(cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
            warn!("rejecting request body: {err}");
            let response = HttpResponse::BadRequest()
                .json(Envelope::error(format!("Ungültige Anfrage: {err}")));
            InternalError::from_response(err, response).into()
        }))
        .route("/", web::get().to(Self::index))
            .route("/version", web::get().to(Self::version))
            .route("/healthcheck", web::get().to(Self::healthcheck))
            .route("/setup/scan", web::post().to(Self::scan))
            .route("/api/setup/scan", web::post().to(Self::scan))
            .route("/setup/save", web::post().to(Self::save_devices))
            .route(
                "/configure/get_saved_devices",
                web::get().to(Self::saved_devices),
            )
            .route("/configure/start", web::post().to(Self::start))
            .route("/configure/cancel", web::post().to(Self::cancel))
            .route("/status", web::get().to(Self::status));
    }

    pub async fn index() -> actix_web::Result<NamedFile> {
        debug!("index() called");
        Ok(NamedFile::open(&AppConfig::get().paths.panel_html)?)
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    pub async fn healthcheck(api: web::Data<Self>) -> impl Responder {
        debug!("healthcheck() called");

        HttpResponse::Ok().json(HealthcheckInfo {
            status: ResponseStatus::Success,
            state: api.provisioning.state(),
            mode: api.provisioning.mode(),
        })
    }

    /// Direct mode browses mDNS for devices on the host's network, host-join
    /// mode scans for device access points.
    pub async fn scan(api: web::Data<Self>) -> impl Responder {
        debug!("scan() called");

        let result = api
            .discover()
            .await
            .context("Serverfehler während des Scans");

        match result {
            Ok(devices) if devices.is_empty() => {
                warn!("scan found no devices");
                HttpResponse::Ok().json(Envelope::error(
                    "Keine Shelly-Geräte gefunden (nach Scan).",
                ))
            }
            result => handle_service_result(
                result.map(|mut devices| {
                    DiscoveryService::merge_saved(&mut devices, &api.provisioning.store().load());
                    Envelope::data(devices)
                }),
                "scan",
            ),
        }
    }

    pub async fn save_devices(
        body: web::Json<SaveDevicesPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("save_devices() called");

        let devices = Self::selected_unique(body.into_inner().devices, api.provisioning.mode());

        if !api.provisioning.store().save(&devices) {
            return HttpResponse::InternalServerError()
                .json(Envelope::error("Geräte konnten nicht gespeichert werden."));
        }

        HttpResponse::Ok().json(Envelope::success(format!(
            "{} Geräte gespeichert.",
            devices.len()
        )))
    }

    pub async fn saved_devices(api: web::Data<Self>) -> impl Responder {
        debug!("saved_devices() called");
        HttpResponse::Ok().json(Envelope::data(api.provisioning.store().load()))
    }

    pub async fn start(body: web::Json<Credentials>, api: web::Data<Self>) -> impl Responder {
        debug!("start() called: {body:?}");

        let credentials = body.into_inner();
        let incomplete = credentials.validate().is_err();

        match api.provisioning.start(credentials).await {
            Err(e) => HttpResponse::Conflict().json(Envelope::error(e.to_string())),
            Ok(_) if incomplete => HttpResponse::Ok().json(Envelope::error("WLAN-Daten fehlen.")),
            Ok(events) => events.into_response(),
        }
    }

    pub async fn cancel(api: web::Data<Self>) -> impl Responder {
        debug!("cancel() called");

        if api.provisioning.cancel() {
            HttpResponse::Ok().json(Envelope::success("Abbruch angefordert."))
        } else {
            HttpResponse::Ok().json(Envelope::error("Keine Konfiguration aktiv."))
        }
    }

    pub async fn status(api: web::Data<Self>) -> impl Responder {
        api.provisioning.status().into_response()
    }

    async fn discover(&self) -> Result<DeviceSet, ScanError> {
        match self.provisioning.mode() {
            ReachabilityMode::Direct => {
                DiscoveryService::browse(&self.browser, &self.ssid_prefix, self.browse_duration)
                    .await
            }
            ReachabilityMode::HostJoin => {
                DiscoveryService::scan(
                    self.provisioning.network(),
                    &self.ssid_prefix,
                    self.scan_timeout,
                )
                .await
            }
        }
    }

    /// Keep selected devices only, dropping later duplicates of a device
    fn selected_unique(devices: DeviceSet, mode: ReachabilityMode) -> DeviceSet {
        let mut seen = HashSet::new();

        devices
            .into_iter()
            .filter(|device| device.selected)
            .filter(|device| {
                let (ssid, bssid) = device.identity();
                let bssid = match mode {
                    ReachabilityMode::Direct => String::new(),
                    ReachabilityMode::HostJoin => bssid.to_uppercase(),
                };
                seen.insert((ssid.to_string(), bssid))
            })
            .collect()
    }
}
