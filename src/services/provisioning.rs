//! Device provisioning orchestrator
//!
//! Drives one run over the saved device set: for every device the host
//! reaches it (directly or by joining its access point), sends the target
//! network credentials and records the outcome in the run log. Devices are
//! handled strictly one after another and a failing device never aborts the
//! run.
//!
//! A run executes on its own task, so a caller going away mid-run neither
//! skips the remaining devices nor the restore of the host network.

use crate::{
    config::{ProvisioningSettings, ReachabilityMode},
    device_client::DeviceConfigurator,
    error::{AlreadyRunning, ConfigureError, ValidationError},
    network_manager_client::NetworkConnector,
    services::device_store::DeviceStore,
    types::{Credentials, Device, RunState, StatusEvent, StatusKind},
};
use log::{error, info, warn};
use serde_valid::Validate;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use tokio::time::sleep;

#[derive(Debug, Default)]
struct RunLog {
    state: RunState,
    events: Vec<StatusEvent>,
}

fn lock(run: &Mutex<RunLog>) -> MutexGuard<'_, RunLog> {
    run.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the run slot. Dropping it, also by unwinding, marks the run completed.
struct RunGuard {
    run: Option<Arc<Mutex<RunLog>>>,
}

impl RunGuard {
    /// Complete the run and snapshot its log under the same lock, so a
    /// following run cannot clear the log before it is read.
    fn finish(mut self) -> Vec<StatusEvent> {
        let Some(run) = self.run.take() else {
            return Vec::new();
        };

        let mut log = lock(&run);
        log.state = RunState::Completed;
        log.events.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            lock(&run).state = RunState::Completed;
        }
    }
}

/// Service running provisioning over all saved devices
pub struct ProvisioningService<N, C>
where
    N: NetworkConnector,
    C: DeviceConfigurator,
{
    store: DeviceStore,
    network: N,
    configurator: C,
    settings: ProvisioningSettings,
    run: Arc<Mutex<RunLog>>,
    cancel_requested: AtomicBool,
}

impl<N, C> ProvisioningService<N, C>
where
    N: NetworkConnector + Send + Sync + 'static,
    C: DeviceConfigurator + Send + Sync + 'static,
{
    pub fn new(
        store: DeviceStore,
        network: N,
        configurator: C,
        settings: ProvisioningSettings,
    ) -> Self {
        ProvisioningService {
            store,
            network,
            configurator,
            settings,
            run: Arc::new(Mutex::new(RunLog::default())),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn mode(&self) -> ReachabilityMode {
        self.settings.mode
    }

    /// Provision all saved devices with `credentials`
    ///
    /// Resets the run log and runs to completion on a spawned task. Dropping
    /// the returned future does not stop the run.
    ///
    /// # Returns
    /// The complete run log, or `AlreadyRunning` if another run is in progress
    /// (the log of that run is left untouched)
    pub async fn start(
        self: &Arc<Self>,
        credentials: Credentials,
    ) -> Result<Vec<StatusEvent>, AlreadyRunning> {
        let guard = self.begin_run()?;
        let service = Arc::clone(self);

        let run = tokio::spawn(async move {
            service.provision_all(&credentials).await;
            guard.finish()
        });

        match run.await {
            Ok(events) => Ok(events),
            Err(e) => {
                error!("provisioning run aborted: {e}");
                Ok(self.status())
            }
        }
    }

    /// Snapshot of the current run log
    pub fn status(&self) -> Vec<StatusEvent> {
        lock(&self.run).events.clone()
    }

    pub fn state(&self) -> RunState {
        lock(&self.run).state
    }

    /// Request the running run to stop before its next device
    ///
    /// # Returns
    /// false if no run is in progress
    pub fn cancel(&self) -> bool {
        if lock(&self.run).state != RunState::Running {
            return false;
        }

        info!("cancellation of provisioning run requested");
        self.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    fn begin_run(&self) -> Result<RunGuard, AlreadyRunning> {
        let mut log = lock(&self.run);

        if log.state == RunState::Running {
            warn!("rejecting start: provisioning run already in progress");
            return Err(AlreadyRunning);
        }

        log.state = RunState::Running;
        log.events.clear();
        self.cancel_requested.store(false, Ordering::SeqCst);

        Ok(RunGuard {
            run: Some(Arc::clone(&self.run)),
        })
    }

    fn push(&self, event: StatusEvent) {
        match event.kind {
            StatusKind::Error => error!("{}", event.message),
            StatusKind::Warning => warn!("{}", event.message),
            _ => info!("{}", event.message),
        }
        lock(&self.run).events.push(event);
    }

    async fn provision_all(&self, credentials: &Credentials) {
        if let Err(e) = credentials
            .validate()
            .map_err(|e| ValidationError(e.to_string()))
        {
            warn!("{e}");
            self.push(StatusEvent::new(StatusKind::Error, "WLAN-Daten fehlen."));
            return;
        }

        let devices = self.store.load();
        if devices.is_empty() {
            self.push(StatusEvent::new(
                StatusKind::Warning,
                "Keine Geräte zum Konfigurieren gespeichert.",
            ));
            return;
        }

        let original_network = match self.settings.mode {
            ReachabilityMode::Direct => None,
            ReachabilityMode::HostJoin => self.network.current_network_id().await,
        };

        if self.settings.mode == ReachabilityMode::HostJoin && original_network.is_none() {
            self.push(StatusEvent::new(
                StatusKind::Warning,
                "Aktuelle WLAN-Verbindung konnte nicht ermittelt werden. \
                 Sie wird nach der Konfiguration nicht automatisch wiederhergestellt.",
            ));
        }

        self.push(StatusEvent::new(
            StatusKind::Info,
            format!("Starte Konfiguration für {} Geräte...", devices.len()),
        ));

        for device in &devices {
            if self.cancel_requested.load(Ordering::SeqCst) {
                self.push(StatusEvent::new(
                    StatusKind::Warning,
                    "Konfiguration abgebrochen.",
                ));
                break;
            }

            self.provision_device(device, credentials).await;
        }

        if let Some(network_id) = original_network {
            self.restore(network_id).await;
        }

        self.push(StatusEvent::new(
            StatusKind::Info,
            "Konfiguration abgeschlossen.",
        ));
    }

    async fn provision_device(&self, device: &Device, credentials: &Credentials) {
        let ssid = device.ssid.as_str();

        let address = match self.reach(device).await {
            Ok(address) => address,
            Err(event) => {
                self.push(event);
                return;
            }
        };

        let result = self
            .configurator
            .configure(
                address,
                credentials.clone(),
                self.settings.configure_timeout,
            )
            .await;

        let event = match result {
            Ok(()) => StatusEvent::for_device(
                StatusKind::Success,
                format!("'{ssid}' erfolgreich konfiguriert."),
                ssid,
            ),
            Err(ConfigureError::Status(code)) => StatusEvent::for_device(
                StatusKind::Error,
                format!("'{ssid}' API-Fehler: HTTP {code}"),
                ssid,
            ),
            Err(e) => StatusEvent::for_device(
                StatusKind::Error,
                format!("Fehler bei der Konfiguration von '{ssid}': {e}"),
                ssid,
            ),
        };
        self.push(event);

        // a join leaves an autoconnecting profile for the device AP behind
        if self.settings.mode == ReachabilityMode::HostJoin {
            self.network.forget_network(ssid.to_string()).await;
        }
    }

    /// Make `device` reachable and return the address to configure it at
    async fn reach(&self, device: &Device) -> Result<String, StatusEvent> {
        let ssid = device.ssid.as_str();

        match self.settings.mode {
            ReachabilityMode::Direct => {
                let address = device.address.trim();
                if address.is_empty() {
                    return Err(StatusEvent::for_device(
                        StatusKind::Error,
                        format!("Gerät '{ssid}' hat keine IP-Adresse. Überspringe..."),
                        ssid,
                    ));
                }
                Ok(address.to_string())
            }
            ReachabilityMode::HostJoin => {
                if ssid.trim().is_empty() {
                    return Err(StatusEvent::for_device(
                        StatusKind::Error,
                        "Gerät ohne SSID kann nicht verbunden werden. Überspringe...",
                        ssid,
                    ));
                }

                self.push(StatusEvent::for_device(
                    StatusKind::Progress,
                    format!("Verbinde mit '{ssid}'..."),
                    ssid,
                ));

                self.network
                    .join_network(
                        ssid.to_string(),
                        device.join_bssid().map(ToString::to_string),
                        self.settings.join_timeout,
                    )
                    .await
                    .map_err(|e| {
                        StatusEvent::for_device(
                            StatusKind::Error,
                            format!("Verbindung mit '{ssid}' fehlgeschlagen: {e}"),
                            ssid,
                        )
                    })?;

                // the device tears down and brings up its AP asynchronously to the join
                sleep(self.settings.settle_delay).await;

                Ok(self.settings.device_ap_address.clone())
            }
        }
    }

    async fn restore(&self, network_id: String) {
        if self
            .network
            .restore_network(network_id.clone(), self.settings.join_timeout)
            .await
        {
            info!("restored network '{network_id}'");
            return;
        }

        self.push(StatusEvent::new(
            StatusKind::Error,
            format!(
                "Wiederherstellung der WLAN-Verbindung '{network_id}' fehlgeschlagen. \
                 Bitte manuell neu verbinden."
            ),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_client::MockDeviceConfigurator,
        error::JoinError,
        network_manager_client::MockNetworkConnector,
    };
    use mockall::{
        Sequence,
        predicate::{always, eq},
    };
    use std::time::Duration;
    use tempfile::TempDir;

    type TestService = ProvisioningService<MockNetworkConnector, MockDeviceConfigurator>;

    fn settings(mode: ReachabilityMode) -> ProvisioningSettings {
        ProvisioningSettings {
            mode,
            device_ap_address: "192.168.33.1".to_string(),
            configure_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(1),
            settle_delay: Duration::ZERO,
        }
    }

    fn device(ssid: &str, address: &str) -> Device {
        Device {
            ssid: ssid.to_string(),
            address: address.to_string(),
            selected: true,
            ..Default::default()
        }
    }

    fn service_with(
        dir: &TempDir,
        devices: &[Device],
        settings: ProvisioningSettings,
        network: MockNetworkConnector,
        configurator: MockDeviceConfigurator,
    ) -> Arc<TestService> {
        let store = DeviceStore::new(dir.path().join("shelly_devices.json"));
        if !devices.is_empty() {
            assert!(store.save(&devices.to_vec()));
        }
        Arc::new(ProvisioningService::new(
            store,
            network,
            configurator,
            settings,
        ))
    }

    fn service(
        dir: &TempDir,
        devices: &[Device],
        mode: ReachabilityMode,
        network: MockNetworkConnector,
        configurator: MockDeviceConfigurator,
    ) -> Arc<TestService> {
        service_with(dir, devices, settings(mode), network, configurator)
    }

    fn configured_ok(configurator: &mut MockDeviceConfigurator) {
        configurator
            .expect_configure()
            .returning(|_, _, _| Box::pin(async { Ok(()) }));
    }

    fn kinds(events: &[StatusEvent]) -> Vec<StatusKind> {
        events.iter().map(|e| e.kind).collect()
    }

    fn credentials() -> Credentials {
        Credentials::new("Home", "secret123")
    }

    mod validation {
        use super::*;

        #[tokio::test]
        async fn missing_credentials_yield_single_error() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configurator.expect_configure().never();
            let service = service(
                &dir,
                &[device("shelly-1", "192.168.1.50")],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            for credentials in [
                Credentials::new("", "secret123"),
                Credentials::new("Home", ""),
                Credentials::default(),
            ] {
                let log = service.start(credentials).await.unwrap();

                assert_eq!(
                    log,
                    vec![StatusEvent::new(StatusKind::Error, "WLAN-Daten fehlen.")]
                );
            }
            assert_eq!(service.state(), RunState::Completed);
        }
    }

    mod direct {
        use super::*;

        #[tokio::test]
        async fn empty_device_set_yields_single_warning() {
            let dir = TempDir::new().unwrap();
            let service = service(
                &dir,
                &[],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                MockDeviceConfigurator::new(),
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(
                log,
                vec![StatusEvent::new(
                    StatusKind::Warning,
                    "Keine Geräte zum Konfigurieren gespeichert."
                )]
            );
        }

        #[tokio::test]
        async fn single_device_success() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configurator
                .expect_configure()
                .withf(|address, credentials, _| {
                    address == "192.168.1.50"
                        && credentials.ssid == "Home"
                        && credentials.password == "secret123"
                })
                .times(1)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            let mut network = MockNetworkConnector::new();
            network.expect_current_network_id().never();
            network.expect_join_network().never();
            network.expect_restore_network().never();
            network.expect_forget_network().never();
            let service = service(
                &dir,
                &[device("shelly-1", "192.168.1.50")],
                ReachabilityMode::Direct,
                network,
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(
                log,
                vec![
                    StatusEvent::new(StatusKind::Info, "Starte Konfiguration für 1 Geräte..."),
                    StatusEvent::for_device(
                        StatusKind::Success,
                        "'shelly-1' erfolgreich konfiguriert.",
                        "shelly-1"
                    ),
                    StatusEvent::new(StatusKind::Info, "Konfiguration abgeschlossen."),
                ]
            );
            assert_eq!(service.status(), log);
        }

        #[tokio::test]
        async fn failing_configurator_reports_every_device_without_aborting() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configurator
                .expect_configure()
                .times(3)
                .returning(|_, _, _| Box::pin(async { Err(ConfigureError::Status(500)) }));
            let service = service(
                &dir,
                &[
                    device("shelly-1", "192.168.1.51"),
                    device("shelly-2", "192.168.1.52"),
                    device("shelly-3", "192.168.1.53"),
                ],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(
                kinds(&log),
                vec![
                    StatusKind::Info,
                    StatusKind::Error,
                    StatusKind::Error,
                    StatusKind::Error,
                    StatusKind::Info,
                ]
            );
            assert_eq!(log[2].message, "'shelly-2' API-Fehler: HTTP 500");
            assert!(log.iter().all(|e| e.kind != StatusKind::Success));
        }

        #[tokio::test]
        async fn timeout_on_one_device_continues_with_the_next() {
            let dir = TempDir::new().unwrap();
            let mut seq = Sequence::new();
            let mut configurator = MockDeviceConfigurator::new();
            configurator
                .expect_configure()
                .withf(|address, _, _| address == "192.168.1.51")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            configurator
                .expect_configure()
                .withf(|address, _, _| address == "192.168.1.52")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, timeout| {
                    let secs = timeout.as_secs();
                    Box::pin(async move { Err(ConfigureError::Timeout { secs }) })
                });
            configurator
                .expect_configure()
                .withf(|address, _, _| address == "192.168.1.53")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            let service = service(
                &dir,
                &[
                    device("shelly-1", "192.168.1.51"),
                    device("shelly-2", "192.168.1.52"),
                    device("shelly-3", "192.168.1.53"),
                ],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(log.len(), 5);
            assert_eq!(log[2].kind, StatusKind::Error);
            assert_eq!(log[2].device_ssid.as_deref(), Some("shelly-2"));
            assert!(log[2].message.contains("shelly-2"));
            assert!(log[2].message.contains("timed out"));
            assert_eq!(log[3].kind, StatusKind::Success);
            assert_eq!(log[3].device_ssid.as_deref(), Some("shelly-3"));
        }

        #[tokio::test]
        async fn device_without_address_is_skipped() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configurator
                .expect_configure()
                .withf(|address, _, _| address == "192.168.1.52")
                .times(1)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            let service = service(
                &dir,
                &[device("shelly-1", ""), device("shelly-2", "192.168.1.52")],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(
                log[1],
                StatusEvent::for_device(
                    StatusKind::Error,
                    "Gerät 'shelly-1' hat keine IP-Adresse. Überspringe...",
                    "shelly-1"
                )
            );
            assert_eq!(log[2].kind, StatusKind::Success);
            assert_eq!(log.len(), 4);
        }

        #[tokio::test]
        async fn transport_error_text_is_reported() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configurator.expect_configure().returning(|_, _, _| {
                Box::pin(async {
                    Err(ConfigureError::Transport("connection refused".to_string()))
                })
            });
            let service = service(
                &dir,
                &[device("shelly-1", "192.168.1.50")],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(
                log[1].message,
                "Fehler bei der Konfiguration von 'shelly-1': connection refused"
            );
        }

        #[tokio::test]
        async fn new_run_discards_previous_log() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configured_ok(&mut configurator);
            let service = service(
                &dir,
                &[device("shelly-1", "192.168.1.50")],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            assert_eq!(service.start(credentials()).await.unwrap().len(), 3);
            assert_eq!(service.start(credentials()).await.unwrap().len(), 3);
            assert_eq!(service.status().len(), 3);
        }
    }

    mod host_join {
        use super::*;

        fn device_ap(ssid: &str, bssid: &str) -> Device {
            Device {
                ssid: ssid.to_string(),
                bssid: bssid.to_string(),
                selected: true,
                ..Default::default()
            }
        }

        fn forgets(network: &mut MockNetworkConnector) {
            network
                .expect_forget_network()
                .returning(|_| Box::pin(async { true }));
        }

        #[tokio::test]
        async fn joins_each_device_ap_and_restores_original_network() {
            let dir = TempDir::new().unwrap();
            let mut seq = Sequence::new();
            let mut network = MockNetworkConnector::new();
            let mut configurator = MockDeviceConfigurator::new();

            network
                .expect_current_network_id()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|| Box::pin(async { Some("Home".to_string()) }));
            network
                .expect_join_network()
                .withf(|ssid, bssid, _| {
                    ssid == "shelly1-AAAA" && bssid.as_deref() == Some("AA:AA:AA:AA:AA:AA")
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            configurator
                .expect_configure()
                .withf(|address, _, _| address == "192.168.33.1")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            network
                .expect_forget_network()
                .with(eq("shelly1-AAAA".to_string()))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Box::pin(async { true }));
            network
                .expect_join_network()
                .withf(|ssid, bssid, _| ssid == "shelly1-BBBB" && bssid.is_none())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            configurator
                .expect_configure()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            network
                .expect_forget_network()
                .with(eq("shelly1-BBBB".to_string()))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Box::pin(async { true }));
            network
                .expect_restore_network()
                .with(eq("Home".to_string()), always())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Box::pin(async { true }));

            let service = service(
                &dir,
                &[
                    device_ap("shelly1-AAAA", "AA:AA:AA:AA:AA:AA"),
                    device_ap("shelly1-BBBB", ""),
                ],
                ReachabilityMode::HostJoin,
                network,
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(
                kinds(&log),
                vec![
                    StatusKind::Info,
                    StatusKind::Progress,
                    StatusKind::Success,
                    StatusKind::Progress,
                    StatusKind::Success,
                    StatusKind::Info,
                ]
            );
        }

        #[tokio::test]
        async fn failed_join_skips_configure_and_continues() {
            let dir = TempDir::new().unwrap();
            let mut network = MockNetworkConnector::new();
            let mut configurator = MockDeviceConfigurator::new();

            network
                .expect_current_network_id()
                .returning(|| Box::pin(async { Some("Home".to_string()) }));
            network
                .expect_join_network()
                .withf(|ssid, _, _| ssid == "shelly1-AAAA")
                .returning(|_, _, _| Box::pin(async { Err(JoinError::Timeout { secs: 60 }) }));
            network
                .expect_join_network()
                .withf(|ssid, _, _| ssid == "shelly1-BBBB")
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            network
                .expect_forget_network()
                .with(eq("shelly1-BBBB".to_string()))
                .times(1)
                .returning(|_| Box::pin(async { true }));
            network
                .expect_restore_network()
                .returning(|_, _| Box::pin(async { true }));
            configurator
                .expect_configure()
                .times(1)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));

            let service = service(
                &dir,
                &[device_ap("shelly1-AAAA", ""), device_ap("shelly1-BBBB", "")],
                ReachabilityMode::HostJoin,
                network,
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(log[2].kind, StatusKind::Error);
            assert_eq!(
                log[2].message,
                "Verbindung mit 'shelly1-AAAA' fehlgeschlagen: join timed out after 60s"
            );
            assert_eq!(log[4].kind, StatusKind::Success);
            assert_eq!(log[4].device_ssid.as_deref(), Some("shelly1-BBBB"));
        }

        #[tokio::test]
        async fn failed_restore_appends_exactly_one_error() {
            let dir = TempDir::new().unwrap();
            let mut network = MockNetworkConnector::new();
            let mut configurator = MockDeviceConfigurator::new();

            network
                .expect_current_network_id()
                .returning(|| Box::pin(async { Some("Home".to_string()) }));
            network
                .expect_join_network()
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            forgets(&mut network);
            network
                .expect_restore_network()
                .times(1)
                .returning(|_, _| Box::pin(async { false }));
            configured_ok(&mut configurator);

            let service = service(
                &dir,
                &[device_ap("shelly1-AAAA", "")],
                ReachabilityMode::HostJoin,
                network,
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();
            let errors: Vec<&StatusEvent> =
                log.iter().filter(|e| e.kind == StatusKind::Error).collect();

            assert_eq!(errors.len(), 1);
            assert!(errors[0].message.contains("'Home'"));
            assert!(errors[0].message.contains("manuell"));
            assert_eq!(log.last().unwrap().message, "Konfiguration abgeschlossen.");
        }

        #[tokio::test]
        async fn unknown_original_network_skips_restore_with_warning() {
            let dir = TempDir::new().unwrap();
            let mut network = MockNetworkConnector::new();
            let mut configurator = MockDeviceConfigurator::new();

            network
                .expect_current_network_id()
                .returning(|| Box::pin(async { None }));
            network
                .expect_join_network()
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            forgets(&mut network);
            network.expect_restore_network().never();
            configured_ok(&mut configurator);

            let service = service(
                &dir,
                &[device_ap("shelly1-AAAA", "")],
                ReachabilityMode::HostJoin,
                network,
                configurator,
            );

            let log = service.start(credentials()).await.unwrap();

            assert_eq!(
                kinds(&log),
                vec![
                    StatusKind::Warning,
                    StatusKind::Info,
                    StatusKind::Progress,
                    StatusKind::Success,
                    StatusKind::Info,
                ]
            );
        }

        #[tokio::test]
        async fn run_completes_and_restores_when_caller_goes_away() {
            let dir = TempDir::new().unwrap();
            let mut network = MockNetworkConnector::new();
            let mut configurator = MockDeviceConfigurator::new();

            network
                .expect_current_network_id()
                .returning(|| Box::pin(async { Some("Home".to_string()) }));
            network
                .expect_join_network()
                .times(2)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));
            forgets(&mut network);
            network
                .expect_restore_network()
                .with(eq("Home".to_string()), always())
                .times(1)
                .returning(|_, _| Box::pin(async { true }));
            configurator
                .expect_configure()
                .times(2)
                .returning(|_, _, _| Box::pin(async { Ok(()) }));

            let service = service_with(
                &dir,
                &[device_ap("shelly1-AAAA", ""), device_ap("shelly1-BBBB", "")],
                ProvisioningSettings {
                    settle_delay: Duration::from_millis(100),
                    ..settings(ReachabilityMode::HostJoin)
                },
                network,
                configurator,
            );

            let caller =
                tokio::time::timeout(Duration::from_millis(20), service.start(credentials())).await;
            assert!(caller.is_err());
            assert_eq!(service.state(), RunState::Running);

            for _ in 0..100 {
                if service.state() == RunState::Completed {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }

            assert_eq!(service.state(), RunState::Completed);
            let log = service.status();
            assert_eq!(log.last().unwrap().message, "Konfiguration abgeschlossen.");
            assert_eq!(
                log.iter().filter(|e| e.kind == StatusKind::Success).count(),
                2
            );
        }
    }

    mod run_guard {
        use super::*;

        #[tokio::test]
        async fn second_start_while_running_is_rejected() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configurator.expect_configure().never();
            let service = service(
                &dir,
                &[device("shelly-1", "192.168.1.50")],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            let guard = service.begin_run().unwrap();
            service.push(StatusEvent::new(StatusKind::Info, "first run"));

            assert_eq!(service.start(credentials()).await, Err(AlreadyRunning));
            assert_eq!(service.status().len(), 1);
            assert_eq!(service.state(), RunState::Running);

            drop(guard);
            assert_eq!(service.state(), RunState::Completed);
        }

        #[test]
        fn finish_snapshots_log_before_releasing_the_slot() {
            let dir = TempDir::new().unwrap();
            let service = service(
                &dir,
                &[],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                MockDeviceConfigurator::new(),
            );

            let first = service.begin_run().unwrap();
            service.push(StatusEvent::new(StatusKind::Info, "first run"));
            let events = first.finish();

            let _second = service.begin_run().unwrap();

            assert_eq!(events, vec![StatusEvent::new(StatusKind::Info, "first run")]);
            // the finished guard must not complete the run that followed it
            assert_eq!(service.state(), RunState::Running);
            assert!(service.status().is_empty());
        }

        #[test]
        fn cancel_only_applies_to_running_run() {
            let dir = TempDir::new().unwrap();
            let service = service(
                &dir,
                &[],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                MockDeviceConfigurator::new(),
            );

            assert_eq!(service.state(), RunState::Idle);
            assert!(!service.cancel());

            let _guard = service.begin_run().unwrap();
            assert!(service.cancel());
        }

        #[tokio::test]
        async fn cancellation_stops_before_next_device() {
            let dir = TempDir::new().unwrap();
            let mut configurator = MockDeviceConfigurator::new();
            configurator.expect_configure().never();
            let service = service(
                &dir,
                &[device("shelly-1", "192.168.1.51"), device("shelly-2", "192.168.1.52")],
                ReachabilityMode::Direct,
                MockNetworkConnector::new(),
                configurator,
            );

            let guard = service.begin_run().unwrap();
            assert!(service.cancel());
            service.provision_all(&credentials()).await;
            let log = guard.finish();

            assert_eq!(
                kinds(&log),
                vec![StatusKind::Info, StatusKind::Warning, StatusKind::Info]
            );
        }
    }
}
