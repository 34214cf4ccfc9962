//! Service management (orchestrator side)
//!
//! Builds the durable description of a service: device paths, the
//! name → UUID binding, config files, the service attr and one member per
//! replica, with static IPs and volumes where requested.

pub mod config_file;
pub mod device;
pub mod service;
pub mod static_ip;

pub use config_file::{ConfigFileContent, ConfigVersioner};
pub use device::{next_device_name, DeviceAllocator, FIRST_DEVICE, LAST_DEVICE};
pub use service::{CreateServiceRequest, ReplicaConfig, ServiceManager};
pub use static_ip::StaticIpAllocator;
