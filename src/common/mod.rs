//! Common utilities and types shared across stateplane

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{AgentConfig, Config, ManageConfig, PollPolicy};
pub use error::{Error, Result};
pub use hash::{blake3_hash, content_checksum};
pub use utils::{
    config_file_id, config_file_version, default_domain_name, dns_name, member_index_from_name,
    member_name, new_service_uuid, next_ip, parse_cidr, poll_until, timestamp_now_millis,
    validate_name, DEFAULT_HOST_IP,
};
