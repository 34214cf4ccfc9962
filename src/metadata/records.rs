//! Record kinds held by the metadata store
//!
//! - Device: a reserved block-device path within a cluster
//! - Service: the name → UUID binding
//! - ServiceAttr: the mutable service-wide descriptor
//! - ServiceMember: one replica slot, the unit of ownership transfer
//! - ConfigFile: immutable, versioned config content
//! - ServiceStaticIp: a secondary IP reserved for one member

use crate::common::{content_checksum, timestamp_now_millis};
use serde::{Deserialize, Serialize};

/// Owner placeholders for a member that has never been claimed
pub const DEFAULT_TASK_ID: &str = "defaultTaskID";
pub const DEFAULT_CONTAINER_INSTANCE_ID: &str = "defaultContainerInstanceID";
pub const DEFAULT_SERVER_INSTANCE_ID: &str = "defaultServerInstanceID";

pub const DEFAULT_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub cluster_name: String,
    pub device_name: String,
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub cluster_name: String,
    pub service_name: String,
    pub service_uuid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Creating,
    Initializing,
    Active,
    Deleting,
    Deleted,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Creating => write!(f, "creating"),
            ServiceStatus::Initializing => write!(f, "initializing"),
            ServiceStatus::Active => write!(f, "active"),
            ServiceStatus::Deleting => write!(f, "deleting"),
            ServiceStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Requested shape of a cloud volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub volume_type: String,
    pub size_gb: u64,
    #[serde(default)]
    pub iops: u64,
    #[serde(default)]
    pub encrypted: bool,
}

/// Volume layout shared by all members of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVolumes {
    pub primary_device_name: String,
    pub primary: VolumeSpec,
    pub journal_device_name: Option<String>,
    pub journal: Option<VolumeSpec>,
}

/// Pointer from a service or member to one config file version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigId {
    pub file_name: String,
    pub file_id: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAttr {
    pub service_uuid: String,
    pub status: ServiceStatus,
    pub revision: u64,
    pub last_modified: i64,
    pub replicas: u32,
    pub cluster_name: String,
    pub service_name: String,
    pub volumes: ServiceVolumes,
    pub register_dns: bool,
    pub domain_name: String,
    pub hosted_zone_id: String,
    pub require_static_ip: bool,
    pub service_configs: Vec<ConfigId>,
}

impl ServiceAttr {
    /// Copy with a new status, ready for a CAS update
    pub fn with_status(&self, status: ServiceStatus) -> Self {
        let mut next = self.next_revision();
        next.status = status;
        next
    }

    /// Copy with one service config repointed
    pub fn with_service_config(&self, index: usize, config: ConfigId) -> Self {
        let mut next = self.next_revision();
        if let Some(slot) = next.service_configs.get_mut(index) {
            *slot = config;
        }
        next
    }

    fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.revision = self.revision + 1;
        next.last_modified = timestamp_now_millis();
        next
    }
}

/// Volumes bound to one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberVolumes {
    pub primary_volume_id: String,
    pub primary_device_name: String,
    pub journal_volume_id: Option<String>,
    pub journal_device_name: Option<String>,
}

impl MemberVolumes {
    /// (volume id, device name) pairs, primary first
    pub fn attachments(&self) -> Vec<(&str, &str)> {
        let mut out = vec![(
            self.primary_volume_id.as_str(),
            self.primary_device_name.as_str(),
        )];
        if let (Some(id), Some(dev)) = (&self.journal_volume_id, &self.journal_device_name) {
            out.push((id.as_str(), dev.as_str()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMember {
    pub service_uuid: String,
    pub member_index: u32,
    pub member_name: String,
    pub revision: u64,
    pub last_modified: i64,
    pub available_zone: String,
    pub task_id: String,
    pub container_instance_id: String,
    pub server_instance_id: String,
    pub static_ip: Option<String>,
    pub volumes: MemberVolumes,
    pub configs: Vec<ConfigId>,
}

impl ServiceMember {
    /// A fresh, never-owned member
    pub fn new(
        service_uuid: &str,
        member_index: u32,
        member_name: &str,
        available_zone: &str,
        static_ip: Option<String>,
        volumes: MemberVolumes,
        configs: Vec<ConfigId>,
    ) -> Self {
        Self {
            service_uuid: service_uuid.to_string(),
            member_index,
            member_name: member_name.to_string(),
            revision: 0,
            last_modified: timestamp_now_millis(),
            available_zone: available_zone.to_string(),
            task_id: DEFAULT_TASK_ID.to_string(),
            container_instance_id: DEFAULT_CONTAINER_INSTANCE_ID.to_string(),
            server_instance_id: DEFAULT_SERVER_INSTANCE_ID.to_string(),
            static_ip,
            volumes,
            configs,
        }
    }

    /// Copy carrying a new owner, ready for a CAS update
    pub fn with_owner(&self, task_id: &str, container_instance_id: &str, server_instance_id: &str) -> Self {
        let mut next = self.next_revision();
        next.task_id = task_id.to_string();
        next.container_instance_id = container_instance_id.to_string();
        next.server_instance_id = server_instance_id.to_string();
        next
    }

    /// Copy with one member config repointed
    pub fn with_config(&self, index: usize, config: ConfigId) -> Self {
        let mut next = self.next_revision();
        if let Some(slot) = next.configs.get_mut(index) {
            *slot = config;
        }
        next
    }

    /// Has this member ever been placed on a server?
    pub fn has_server_owner(&self) -> bool {
        self.server_instance_id != DEFAULT_SERVER_INSTANCE_ID
    }

    fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.revision = self.revision + 1;
        next.last_modified = timestamp_now_millis();
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub service_uuid: String,
    pub file_id: String,
    pub revision: u64,
    pub file_name: String,
    pub file_mode: u32,
    pub checksum: String,
    pub content: String,
    pub last_modified: i64,
}

impl ConfigFile {
    pub fn new(service_uuid: &str, file_id: &str, file_name: &str, file_mode: u32, content: &str) -> Self {
        Self {
            service_uuid: service_uuid.to_string(),
            file_id: file_id.to_string(),
            revision: 0,
            file_name: file_name.to_string(),
            file_mode,
            checksum: content_checksum(content),
            content: content.to_string(),
            last_modified: timestamp_now_millis(),
        }
    }

    pub fn config_id(&self) -> ConfigId {
        ConfigId {
            file_name: self.file_name.clone(),
            file_id: self.file_id.clone(),
            checksum: self.checksum.clone(),
        }
    }

    /// Same file, ignoring modification time
    pub fn same_content(&self, other: &ConfigFile) -> bool {
        self.service_uuid == other.service_uuid
            && self.file_id == other.file_id
            && self.revision == other.revision
            && self.file_name == other.file_name
            && self.file_mode == other.file_mode
            && self.checksum == other.checksum
            && self.content == other.content
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStaticIp {
    pub static_ip: String,
    pub revision: u64,
    pub service_uuid: String,
    pub available_zone: String,
    pub server_instance_id: String,
    pub network_interface_id: String,
}

impl ServiceStaticIp {
    /// Copy bound to a new interface, ready for a CAS update
    pub fn with_owner(&self, server_instance_id: &str, network_interface_id: &str) -> Self {
        let mut next = self.clone();
        next.revision = self.revision + 1;
        next.server_instance_id = server_instance_id.to_string();
        next.network_interface_id = network_interface_id.to_string();
        next
    }
}
