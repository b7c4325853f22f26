use crate::{error::ScanError, types::AnnouncedService};
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use trait_variant::make;

/// Browses the local network for announced HTTP services.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DeviceBrowser {
    /// Collect the services resolved within `duration`.
    async fn browse(&self, duration: Duration) -> Result<Vec<AnnouncedService>, ScanError>;
}

/// [`DeviceBrowser`] using a multicast DNS service daemon per browse.
#[derive(Clone, Debug, Default)]
pub struct MdnsDeviceBrowser;

impl MdnsDeviceBrowser {
    const SERVICE_TYPE: &str = "_http._tcp.local.";

    fn announced_service(info: &ServiceInfo) -> AnnouncedService {
        AnnouncedService {
            instance: instance_name(info.get_fullname(), Self::SERVICE_TYPE),
            addresses: info.get_addresses().iter().copied().collect(),
            model: info.get_property_val_str("model").unwrap_or_default().to_string(),
            friendly_name: info
                .get_property_val_str("friendly_name")
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl DeviceBrowser for MdnsDeviceBrowser {
    async fn browse(&self, duration: Duration) -> Result<Vec<AnnouncedService>, ScanError> {
        info!("browsing {} for {duration:?}", Self::SERVICE_TYPE);

        let daemon = ServiceDaemon::new().map_err(|e| ScanError::Browse(e.to_string()))?;
        let receiver = daemon
            .browse(Self::SERVICE_TYPE)
            .map_err(|e| ScanError::Browse(e.to_string()))?;

        let deadline = Instant::now() + duration;
        let mut services = Vec::new();

        while let Ok(event) = timeout_at(deadline, receiver.recv_async()).await {
            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let service = Self::announced_service(&info);
                    debug!("resolved {} at {:?}", service.instance, service.addresses);
                    services.push(service);
                }
                Ok(other) => debug!("ignoring mDNS event {other:?}"),
                Err(e) => {
                    warn!("mDNS event channel closed: {e}");
                    break;
                }
            }
        }

        if let Err(e) = daemon.shutdown() {
            warn!("failed to shut down mDNS daemon: {e}");
        }

        info!("mDNS browse resolved {} services", services.len());
        Ok(services)
    }
}

/// `shelly1-ABCDEF._http._tcp.local.` -> `shelly1-ABCDEF`
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}
