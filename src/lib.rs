pub mod api;
pub mod config;
pub mod device_client;
pub mod error;
pub mod http_client;
pub mod mdns_client;
pub mod network_manager_client;
pub mod services;
pub mod types;
