//! Business logic services
//!
//! This module contains the provisioning logic separated from HTTP concerns.
//! Collaborators that talk to the outside world are injected as traits so
//! the services can be tested with mocks.

pub mod device_store;
pub mod discovery;
pub mod provisioning;
