//! Device discovery
//!
//! Devices already on the host's network announce themselves via mDNS and
//! are found with their address. Unconfigured devices only show up as
//! access points in a WiFi scan.

use crate::{
    error::ScanError,
    mdns_client::DeviceBrowser,
    network_manager_client::NetworkConnector,
    types::{AnnouncedService, Device, ScannedNetwork},
};
use log::{debug, info};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

/// Service turning announced services and visible access points into device candidates
pub struct DiscoveryService;

impl DiscoveryService {
    /// Browse mDNS for devices reachable on the host's network
    ///
    /// # Arguments
    /// * `browser` - Browser collecting announced HTTP services
    /// * `model_hint` - Text the announced `model` must contain (case-insensitive)
    /// * `duration` - How long to collect announcements
    ///
    /// # Returns
    /// One device per announced instance that has an address, in announce order
    pub async fn browse<B>(
        browser: &B,
        model_hint: &str,
        duration: Duration,
    ) -> Result<Vec<Device>, ScanError>
    where
        B: DeviceBrowser,
    {
        let services = browser.browse(duration).await?;
        let devices = Self::devices_from_services(services, model_hint);

        info!("discovered {} devices via mDNS", devices.len());
        Ok(devices)
    }

    fn devices_from_services(services: Vec<AnnouncedService>, model_hint: &str) -> Vec<Device> {
        let model_hint = model_hint.to_lowercase();
        let mut seen = HashSet::new();

        services
            .into_iter()
            .filter(|s| s.model.to_lowercase().contains(&model_hint))
            .filter_map(|service| {
                let address = service
                    .addresses
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| service.addresses.first())
                    .map(ToString::to_string);

                let Some(address) = address else {
                    debug!("{} announced without address", service.instance);
                    return None;
                };

                if !seen.insert(service.instance.clone()) {
                    return None;
                }

                Some(Device {
                    ssid: service.instance,
                    address,
                    description: service.friendly_name,
                    model: service.model,
                    ..Default::default()
                })
            })
            .collect()
    }

    /// Scan for devices whose access point SSID starts with `prefix`
    ///
    /// # Arguments
    /// * `connector` - Network connector performing the scan
    /// * `prefix` - SSID prefix of device access points (case-insensitive)
    /// * `scan_timeout` - Upper bound for the rescan
    ///
    /// # Returns
    /// Devices ordered by descending signal strength, one per BSSID
    pub async fn scan<N>(
        connector: &N,
        prefix: &str,
        scan_timeout: Duration,
    ) -> Result<Vec<Device>, ScanError>
    where
        N: NetworkConnector,
    {
        let networks = connector.list_networks(scan_timeout).await?;
        let devices = Self::devices_from_networks(networks, prefix);

        info!("discovered {} devices", devices.len());
        Ok(devices)
    }

    /// Carry address and selection of already saved devices over to scan results
    ///
    /// A WiFi scan only sees access points, so the address known for a device
    /// comes from the saved set. Addresses announced via mDNS are kept.
    pub fn merge_saved(devices: &mut [Device], saved: &[Device]) {
        for device in devices.iter_mut() {
            let Some(known) = saved.iter().find(|s| {
                s.ssid == device.ssid
                    && (s.bssid.is_empty() || s.bssid.eq_ignore_ascii_case(&device.bssid))
            }) else {
                continue;
            };

            debug!("{} already saved", device.ssid);
            if device.address.is_empty() {
                device.address.clone_from(&known.address);
            }
            device.selected = known.selected;
            if !known.description.is_empty() {
                device.description.clone_from(&known.description);
            }
        }
    }

    fn devices_from_networks(networks: Vec<ScannedNetwork>, prefix: &str) -> Vec<Device> {
        let prefix = prefix.to_lowercase();
        let mut strongest: HashMap<String, ScannedNetwork> = HashMap::new();
        let mut order = Vec::new();

        for network in networks
            .into_iter()
            .filter(|n| n.ssid.to_lowercase().starts_with(&prefix))
        {
            let key = if network.bssid.is_empty() {
                network.ssid.clone()
            } else {
                network.bssid.to_uppercase()
            };

            match strongest.get(&key) {
                Some(seen) if seen.signal >= network.signal => {
                    debug!("ignoring weaker duplicate of {key}");
                }
                Some(_) => {
                    strongest.insert(key, network);
                }
                None => {
                    order.push(key.clone());
                    strongest.insert(key, network);
                }
            }
        }

        let mut devices: Vec<Device> = order
            .into_iter()
            .filter_map(|key| strongest.remove(&key))
            .map(Self::device_from_network)
            .collect();

        // stable sort keeps scan order among equal signals
        devices.sort_by(|a, b| b.signal.cmp(&a.signal));
        devices
    }

    fn device_from_network(network: ScannedNetwork) -> Device {
        Device {
            model: Self::model_from_ssid(&network.ssid),
            description: network.ssid.clone(),
            ssid: network.ssid,
            address: String::new(),
            bssid: network.bssid,
            signal: Some(network.signal),
            selected: false,
        }
    }

    /// Shelly access points are named `<model>-<device id>`
    fn model_from_ssid(ssid: &str) -> String {
        match ssid.rsplit_once('-') {
            Some((model, _id)) if !model.is_empty() => model.to_string(),
            _ => ssid.to_string(),
        }
    }
}
