use crate::{
    config::NetworkManagerConfig,
    error::{JoinError, ScanError},
    types::ScannedNetwork,
};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{path::PathBuf, process::Output, time::Duration};
use tokio::{process::Command, time::timeout};
use trait_variant::make;

/// Host-side WiFi operations needed by discovery and provisioning.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait NetworkConnector {
    /// Identifier of the currently active WiFi connection, if any.
    async fn current_network_id(&self) -> Option<String>;
    async fn list_networks(&self, rescan_timeout: Duration)
    -> Result<Vec<ScannedNetwork>, ScanError>;
    async fn join_network(
        &self,
        ssid: String,
        bssid: Option<String>,
        timeout: Duration,
    ) -> Result<(), JoinError>;
    /// Best-effort rejoin of `network_id`; `false` if it did not come up.
    async fn restore_network(&self, network_id: String, timeout: Duration) -> bool;
    /// Delete the connection profile a join left behind for `network_id`.
    async fn forget_network(&self, network_id: String) -> bool;
}

/// [`NetworkConnector`] backed by the NetworkManager command line client.
#[derive(Clone, Debug)]
pub struct NmcliNetworkConnector {
    nmcli_path: PathBuf,
    interface: Option<String>,
}

/// Why an nmcli invocation did not succeed.
#[derive(Debug)]
enum NmcliFailure {
    Unavailable(String),
    Failed { status: i32, stderr: String },
    Timeout { secs: u64 },
}

impl From<NmcliFailure> for ScanError {
    fn from(failure: NmcliFailure) -> Self {
        match failure {
            NmcliFailure::Unavailable(cause) => ScanError::ToolUnavailable(cause),
            NmcliFailure::Failed { status, stderr } => ScanError::CommandFailed { status, stderr },
            NmcliFailure::Timeout { secs } => ScanError::Timeout { secs },
        }
    }
}

impl From<NmcliFailure> for JoinError {
    fn from(failure: NmcliFailure) -> Self {
        match failure {
            NmcliFailure::Unavailable(cause) => JoinError::ToolUnavailable(cause),
            NmcliFailure::Failed { status, stderr } => JoinError::CommandFailed { status, stderr },
            NmcliFailure::Timeout { secs } => JoinError::Timeout { secs },
        }
    }
}

impl NmcliNetworkConnector {
    const WIRELESS_CONNECTION_TYPE: &str = "802-11-wireless";
    const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(config: &NetworkManagerConfig) -> Self {
        NmcliNetworkConnector {
            nmcli_path: config.nmcli_path.clone(),
            interface: config.interface.clone(),
        }
    }

    fn scan_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-t",
            "-f",
            "SSID,BSSID,SIGNAL",
            "device",
            "wifi",
            "list",
            "--rescan",
            "yes",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        if let Some(iface) = &self.interface {
            args.extend(["ifname".to_string(), iface.clone()]);
        }
        args
    }

    fn join_args(&self, ssid: &str, bssid: Option<&str>, wait: Duration) -> Vec<String> {
        let mut args = vec![
            "--wait".to_string(),
            wait.as_secs().max(1).to_string(),
            "device".to_string(),
            "wifi".to_string(),
            "connect".to_string(),
            ssid.to_string(),
        ];

        if let Some(bssid) = bssid {
            args.extend(["bssid".to_string(), bssid.to_string()]);
        }
        if let Some(iface) = &self.interface {
            args.extend(["ifname".to_string(), iface.clone()]);
        }
        args
    }

    fn forget_args(network_id: &str) -> Vec<String> {
        vec![
            "connection".to_string(),
            "delete".to_string(),
            "id".to_string(),
            network_id.to_string(),
        ]
    }

    /// Run nmcli with `args`, killing it if it outlives `limit`
    async fn run(&self, args: &[String], limit: Duration) -> Result<Output, NmcliFailure> {
        debug!("{} {}", self.nmcli_path.display(), args.join(" "));

        let mut command = Command::new(&self.nmcli_path);
        command.args(args).kill_on_drop(true);

        let output = match timeout(limit, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(NmcliFailure::Unavailable(format!(
                    "failed to run {}: {e}",
                    self.nmcli_path.display()
                )));
            }
            Err(_) => {
                return Err(NmcliFailure::Timeout {
                    secs: limit.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(NmcliFailure::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output)
    }
}

impl NetworkConnector for NmcliNetworkConnector {
    async fn current_network_id(&self) -> Option<String> {
        let args: Vec<String> = ["-t", "-f", "NAME,TYPE", "connection", "show", "--active"]
            .iter()
            .map(ToString::to_string)
            .collect();

        let output = match self.run(&args, Self::QUERY_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                warn!("failed to query active network: {e:?}");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let network_id = parse_active_wifi(&stdout);

        match &network_id {
            Some(id) => info!("active network is '{id}'"),
            None => warn!("no active wifi connection found"),
        }
        network_id
    }

    async fn list_networks(
        &self,
        rescan_timeout: Duration,
    ) -> Result<Vec<ScannedNetwork>, ScanError> {
        info!("scanning wifi networks");

        let output = self.run(&self.scan_args(), rescan_timeout).await?;
        let networks = parse_wifi_list(&String::from_utf8_lossy(&output.stdout));

        info!("scan found {} networks", networks.len());
        Ok(networks)
    }

    async fn join_network(
        &self,
        ssid: String,
        bssid: Option<String>,
        timeout: Duration,
    ) -> Result<(), JoinError> {
        info!("joining network '{ssid}'");

        let args = self.join_args(&ssid, bssid.as_deref(), timeout);
        // nmcli's own --wait bounds the join, the outer limit only catches a hung process
        self.run(&args, timeout + Self::QUERY_TIMEOUT).await?;

        info!("joined network '{ssid}'");
        Ok(())
    }

    async fn restore_network(&self, network_id: String, timeout: Duration) -> bool {
        info!("restoring network '{network_id}'");

        let args = vec![
            "--wait".to_string(),
            timeout.as_secs().max(1).to_string(),
            "connection".to_string(),
            "up".to_string(),
            "id".to_string(),
            network_id.clone(),
        ];

        match self.run(&args, timeout + Self::QUERY_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to restore network '{network_id}': {e:?}");
                false
            }
        }
    }

    async fn forget_network(&self, network_id: String) -> bool {
        debug!("forgetting network '{network_id}'");

        match self
            .run(&Self::forget_args(&network_id), Self::QUERY_TIMEOUT)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to delete connection '{network_id}': {e:?}");
                false
            }
        }
    }
}

/// Split one line of `nmcli -t` output into its fields.
///
/// Terse mode escapes `:` as `\:` and `\` as `\\` inside values.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn parse_wifi_list(stdout: &str) -> Vec<ScannedNetwork> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_terse(line);
            let [ssid, bssid, signal] = fields.as_slice() else {
                debug!("skipping malformed scan row: {line}");
                return None;
            };

            if ssid.is_empty() {
                return None;
            }

            Some(ScannedNetwork {
                ssid: ssid.clone(),
                bssid: bssid.clone(),
                signal: signal.trim().parse().unwrap_or(0),
            })
        })
        .collect()
}

fn parse_active_wifi(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let fields = split_terse(line);
        match fields.as_slice() {
            [name, kind]
                if kind == NmcliNetworkConnector::WIRELESS_CONNECTION_TYPE && !name.is_empty() =>
            {
                Some(name.clone())
            }
            _ => None,
        }
    })
}
