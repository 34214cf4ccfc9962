//! Metadata store contract
//!
//! Every record kind supports create-if-absent (`AlreadyExists` on conflict)
//! and strongly consistent reads. Mutable kinds are updated with
//! compare-and-swap: the caller passes the record it read (`old`) and the
//! record it wants (`new`), and the store rejects the write with
//! `ConditionFailed` unless `old` still matches what is stored.
//!
//! The CAS rules live in the `check_*_update` functions below so that every
//! backend enforces the same thing.

pub mod memory;
pub mod records;
pub mod rocks;

pub use memory::MemStore;
pub use records::{
    ConfigFile, ConfigId, Device, MemberVolumes, Service, ServiceAttr, ServiceMember,
    ServiceStaticIp, ServiceStatus, ServiceVolumes, VolumeSpec, DEFAULT_CONTAINER_INSTANCE_ID,
    DEFAULT_FILE_MODE, DEFAULT_SERVER_INSTANCE_ID, DEFAULT_TASK_ID,
};
pub use rocks::RocksStore;

use crate::common::{Error, Result};
use async_trait::async_trait;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    // === Device ===
    async fn create_device(&self, dev: &Device) -> Result<()>;
    async fn get_device(&self, cluster: &str, device_name: &str) -> Result<Device>;
    async fn delete_device(&self, cluster: &str, device_name: &str) -> Result<()>;
    /// Devices of a cluster ordered by (name length, name)
    async fn list_devices(&self, cluster: &str) -> Result<Vec<Device>>;

    // === Service ===
    async fn create_service(&self, svc: &Service) -> Result<()>;
    async fn get_service(&self, cluster: &str, service_name: &str) -> Result<Service>;
    async fn delete_service(&self, cluster: &str, service_name: &str) -> Result<()>;
    async fn list_services(&self, cluster: &str) -> Result<Vec<Service>>;

    // === ServiceAttr ===
    async fn create_service_attr(&self, attr: &ServiceAttr) -> Result<()>;
    async fn update_service_attr(&self, old: &ServiceAttr, new: &ServiceAttr) -> Result<()>;
    async fn get_service_attr(&self, service_uuid: &str) -> Result<ServiceAttr>;
    async fn delete_service_attr(&self, service_uuid: &str) -> Result<()>;

    // === ServiceMember ===
    async fn create_service_member(&self, member: &ServiceMember) -> Result<()>;
    async fn update_service_member(&self, old: &ServiceMember, new: &ServiceMember) -> Result<()>;
    async fn get_service_member(&self, service_uuid: &str, member_index: u32) -> Result<ServiceMember>;
    /// Members of a service ordered by index
    async fn list_service_members(&self, service_uuid: &str) -> Result<Vec<ServiceMember>>;
    async fn delete_service_member(&self, service_uuid: &str, member_index: u32) -> Result<()>;

    // === ConfigFile ===
    async fn create_config_file(&self, cfg: &ConfigFile) -> Result<()>;
    async fn get_config_file(&self, service_uuid: &str, file_id: &str) -> Result<ConfigFile>;
    async fn delete_config_file(&self, service_uuid: &str, file_id: &str) -> Result<()>;

    // === ServiceStaticIp ===
    async fn create_service_static_ip(&self, ip: &ServiceStaticIp) -> Result<()>;
    async fn update_service_static_ip(&self, old: &ServiceStaticIp, new: &ServiceStaticIp) -> Result<()>;
    async fn get_service_static_ip(&self, static_ip: &str) -> Result<ServiceStaticIp>;
    async fn delete_service_static_ip(&self, static_ip: &str) -> Result<()>;
}

fn condition_failed(what: &str, reason: &str) -> Error {
    Error::ConditionFailed(format!("{}: {}", what, reason))
}

/// CAS rule for ServiceAttr: stored must equal `old`, revision steps by one,
/// identity and volume layout never change.
pub fn check_attr_update(stored: &ServiceAttr, old: &ServiceAttr, new: &ServiceAttr) -> Result<()> {
    let what = format!("service attr {}", old.service_uuid);
    if stored != old {
        return Err(condition_failed(&what, "stale record"));
    }
    if new.revision != old.revision + 1 {
        return Err(condition_failed(&what, "revision must increase by 1"));
    }
    if new.service_uuid != old.service_uuid
        || new.cluster_name != old.cluster_name
        || new.service_name != old.service_name
        || new.volumes != old.volumes
    {
        return Err(condition_failed(&what, "immutable field changed"));
    }
    Ok(())
}

/// CAS rule for ServiceMember: stored must equal `old`, revision steps by
/// one, and the identity fields (uuid, index, name, zone, devices, static IP)
/// never change.
pub fn check_member_update(stored: &ServiceMember, old: &ServiceMember, new: &ServiceMember) -> Result<()> {
    let what = format!("member {}/{}", old.service_uuid, old.member_index);
    if stored != old {
        return Err(condition_failed(&what, "stale record"));
    }
    if new.revision != old.revision + 1 {
        return Err(condition_failed(&what, "revision must increase by 1"));
    }
    if new.service_uuid != old.service_uuid
        || new.member_index != old.member_index
        || new.member_name != old.member_name
        || new.available_zone != old.available_zone
        || new.static_ip != old.static_ip
        || new.volumes.primary_device_name != old.volumes.primary_device_name
        || new.volumes.journal_device_name != old.volumes.journal_device_name
    {
        return Err(condition_failed(&what, "immutable field changed"));
    }
    Ok(())
}

/// CAS rule for ServiceStaticIp: only the owner fields may move.
pub fn check_static_ip_update(
    stored: &ServiceStaticIp,
    old: &ServiceStaticIp,
    new: &ServiceStaticIp,
) -> Result<()> {
    let what = format!("static ip {}", old.static_ip);
    if stored != old {
        return Err(condition_failed(&what, "stale record"));
    }
    if new.revision != old.revision + 1 {
        return Err(condition_failed(&what, "revision must increase by 1"));
    }
    if new.static_ip != old.static_ip
        || new.service_uuid != old.service_uuid
        || new.available_zone != old.available_zone
    {
        return Err(condition_failed(&what, "immutable field changed"));
    }
    Ok(())
}

/// Order used for device listing: shorter names first, then lexical.
/// Matches the allocation sequence (`xvdz` < `xvdba`).
pub fn device_order(a: &Device, b: &Device) -> std::cmp::Ordering {
    a.device_name
        .len()
        .cmp(&b.device_name.len())
        .then_with(|| a.device_name.cmp(&b.device_name))
}
