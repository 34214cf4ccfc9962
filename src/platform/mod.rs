//! Collaborator contracts
//!
//! The orchestrator and the agent only ever talk to the container platform,
//! the cloud volume/network APIs and DNS through these traits. Concrete
//! adapters (ECS, Kubernetes, EC2, Route53, ...) live outside this crate;
//! `memory` provides in-process variants.

pub mod memory;

pub use memory::{MemDns, MemNetwork, MemPlatform, MemVolumes};

use crate::common::{Error, Result};
use crate::metadata::VolumeSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identity of the node an agent runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNode {
    pub cluster_name: String,
    pub server_instance_id: String,
    pub container_instance_id: String,
    pub available_zone: String,
    pub private_ip: String,
}

#[async_trait]
pub trait ContainerPlatform: Send + Sync {
    /// Task ids currently running for a service
    async fn list_active_tasks(&self, cluster: &str, service: &str) -> Result<HashSet<String>>;

    /// The service's task on one container instance
    async fn get_task_for_node(
        &self,
        cluster: &str,
        service: &str,
        container_instance_id: &str,
    ) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    Creating,
    Available,
    Attaching,
    InUse,
    Attached,
    Detaching,
    Detached,
    Error,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::Attaching => "attaching",
            VolumeState::InUse => "in-use",
            VolumeState::Attached => "attached",
            VolumeState::Detaching => "detaching",
            VolumeState::Detached => "detached",
            VolumeState::Error => "error",
        }
    }

    /// Free to be attached
    pub fn is_free(&self) -> bool {
        matches!(self, VolumeState::Available | VolumeState::Detached)
    }

    /// Attached (or on its way) to some instance
    pub fn is_bound(&self) -> bool {
        matches!(
            self,
            VolumeState::InUse | VolumeState::Attached | VolumeState::Attaching
        )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VolumeState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(VolumeState::Creating),
            "available" => Ok(VolumeState::Available),
            "attaching" => Ok(VolumeState::Attaching),
            "in-use" => Ok(VolumeState::InUse),
            "attached" => Ok(VolumeState::Attached),
            "detaching" => Ok(VolumeState::Detaching),
            "detached" => Ok(VolumeState::Detached),
            "error" => Ok(VolumeState::Error),
            other => Err(Error::Internal(format!("unknown volume state: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub state: VolumeState,
    pub available_zone: String,
    /// Instance the volume is attached to, if any
    pub attached_instance: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeOptions {
    pub available_zone: String,
    pub spec: VolumeSpec,
    /// Tag for operators, usually the member name
    pub tag: String,
}

#[async_trait]
pub trait VolumeProvider: Send + Sync {
    async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<String>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;
    async fn detach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;
    async fn get_volume_state(&self, volume_id: &str) -> Result<VolumeState>;
    async fn get_volume_info(&self, volume_id: &str) -> Result<VolumeInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub interface_id: String,
    pub server_instance_id: String,
    pub available_zone: String,
    pub primary_private_ip: String,
    /// Secondary IPs currently assigned
    pub private_ips: Vec<String>,
}

#[async_trait]
pub trait NetworkProvider: Send + Sync {
    async fn assign_static_ip(&self, interface_id: &str, ip: &str) -> Result<()>;
    /// Succeeds when the IP is not on the interface
    async fn unassign_static_ip(&self, interface_id: &str, ip: &str) -> Result<()>;
    async fn get_instance_network_interface(&self, instance_id: &str) -> Result<NetworkInterface>;
    /// Interfaces of a cluster's instances in one zone, plus the zone's CIDR block
    async fn get_network_interfaces(
        &self,
        cluster: &str,
        zone: &str,
    ) -> Result<(Vec<NetworkInterface>, String)>;
}

#[async_trait]
pub trait DnsService: Send + Sync {
    async fn get_or_create_hosted_zone(&self, domain: &str) -> Result<String>;
    async fn update_record(&self, name: &str, ip: &str, zone_id: &str) -> Result<()>;
    async fn get_record(&self, name: &str, zone_id: &str) -> Result<String>;
    async fn delete_record(&self, name: &str, zone_id: &str) -> Result<()>;
    /// Resolve through the node's own resolver
    async fn lookup_local(&self, name: &str) -> Result<String>;
}
