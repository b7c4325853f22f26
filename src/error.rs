use thiserror::Error;

/// Failure of a WiFi scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("network tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("scan failed with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("scan timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("mDNS browse failed: {0}")]
    Browse(String),
}

/// Failure of the host to associate with a network.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("network tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("join failed with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("join timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Failure of the provisioning request sent to a device.
#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Error)]
#[error("invalid credentials: {0}")]
pub struct ValidationError(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("a provisioning run is already in progress")]
pub struct AlreadyRunning;
