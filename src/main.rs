use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use shelly_provisioner::{
    api::Api,
    config::{AppConfig, ReachabilityMode},
    device_client::ShellyDeviceClient,
    mdns_client::MdnsDeviceBrowser,
    network_manager_client::NmcliNetworkConnector,
    services::{device_store::DeviceStore, provisioning::ProvisioningService},
};
use std::io::Write;
use tokio::signal::unix::{SignalKind, signal};

type ProvisioningApi = Api<NmcliNetworkConnector, ShellyDeviceClient, MdnsDeviceBrowser>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let (server_handle, server_task) = run_server()?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
        },
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");
    server_handle.stop(true).await;
    info!("shutdown complete");

    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init().context("failed to load configuration")?;

    info!(
        "provisioning mode: {:?}, devices file: {:?}",
        config.provisioning.settings.mode, config.paths.devices_file
    );

    if config.provisioning.settings.mode == ReachabilityMode::HostJoin
        && config.network_manager.interface.is_none()
    {
        warn!("no WIFI_INTERFACE configured, nmcli picks the wifi device");
    }

    if !config.paths.panel_html.exists() {
        warn!("panel page not found at {:?}", config.paths.panel_html);
    }

    Ok(())
}

fn run_server() -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let config = AppConfig::get();

    let provisioning = ProvisioningService::new(
        DeviceStore::new(&config.paths.devices_file),
        NmcliNetworkConnector::new(&config.network_manager),
        ShellyDeviceClient::new().context("failed to create device client")?,
        config.provisioning.settings.clone(),
    );
    let api = Data::new(ProvisioningApi::new(
        provisioning,
        MdnsDeviceBrowser,
        config.provisioning.ssid_prefix.clone(),
        config.provisioning.scan_timeout,
        config.provisioning.browse_duration,
    ));

    let address = format!("{}:{}", config.ui.bind, config.ui.port);
    info!("starting server on {address}");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(api.clone())
            .configure(ProvisioningApi::routes)
    })
    .bind(&address)
    .context("failed to bind server")?
    .disable_signals()
    .run();

    Ok((server.handle(), tokio::spawn(server)))
}
