//! In-memory metadata store
//!
//! A single mutex guards all tables, so create-if-absent and CAS are atomic.
//! Used by tests and single-process deployments.

use super::{
    check_attr_update, check_member_update, check_static_ip_update, device_order, ConfigFile,
    Device, MetadataStore, Service, ServiceAttr, ServiceMember, ServiceStaticIp,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    devices: BTreeMap<(String, String), Device>,
    services: BTreeMap<(String, String), Service>,
    attrs: BTreeMap<String, ServiceAttr>,
    members: BTreeMap<(String, u32), ServiceMember>,
    config_files: BTreeMap<(String, String), ConfigFile>,
    static_ips: BTreeMap<String, ServiceStaticIp>,
}

#[derive(Default)]
pub struct MemStore {
    tables: Mutex<Tables>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Internal("metadata lock poisoned".into()))
    }
}

fn insert_new<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V, what: String) -> Result<()> {
    if map.contains_key(&key) {
        return Err(Error::AlreadyExists(what));
    }
    map.insert(key, value);
    Ok(())
}

fn remove_existing<K: Ord, V>(map: &mut BTreeMap<K, V>, key: &K, what: String) -> Result<()> {
    map.remove(key).map(|_| ()).ok_or(Error::NotFound(what))
}

#[async_trait]
impl MetadataStore for MemStore {
    // === Device ===

    async fn create_device(&self, dev: &Device) -> Result<()> {
        let key = (dev.cluster_name.clone(), dev.device_name.clone());
        let what = format!("device {}/{}", dev.cluster_name, dev.device_name);
        insert_new(&mut self.tables()?.devices, key, dev.clone(), what)
    }

    async fn get_device(&self, cluster: &str, device_name: &str) -> Result<Device> {
        self.tables()?
            .devices
            .get(&(cluster.to_string(), device_name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("device {}/{}", cluster, device_name)))
    }

    async fn delete_device(&self, cluster: &str, device_name: &str) -> Result<()> {
        let key = (cluster.to_string(), device_name.to_string());
        let what = format!("device {}/{}", cluster, device_name);
        remove_existing(&mut self.tables()?.devices, &key, what)
    }

    async fn list_devices(&self, cluster: &str) -> Result<Vec<Device>> {
        let mut devs: Vec<Device> = self
            .tables()?
            .devices
            .values()
            .filter(|d| d.cluster_name == cluster)
            .cloned()
            .collect();
        devs.sort_by(device_order);
        Ok(devs)
    }

    // === Service ===

    async fn create_service(&self, svc: &Service) -> Result<()> {
        let key = (svc.cluster_name.clone(), svc.service_name.clone());
        let what = format!("service {}/{}", svc.cluster_name, svc.service_name);
        insert_new(&mut self.tables()?.services, key, svc.clone(), what)
    }

    async fn get_service(&self, cluster: &str, service_name: &str) -> Result<Service> {
        self.tables()?
            .services
            .get(&(cluster.to_string(), service_name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {}/{}", cluster, service_name)))
    }

    async fn delete_service(&self, cluster: &str, service_name: &str) -> Result<()> {
        let key = (cluster.to_string(), service_name.to_string());
        let what = format!("service {}/{}", cluster, service_name);
        remove_existing(&mut self.tables()?.services, &key, what)
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<Service>> {
        Ok(self
            .tables()?
            .services
            .values()
            .filter(|s| s.cluster_name == cluster)
            .cloned()
            .collect())
    }

    // === ServiceAttr ===

    async fn create_service_attr(&self, attr: &ServiceAttr) -> Result<()> {
        let what = format!("service attr {}", attr.service_uuid);
        insert_new(
            &mut self.tables()?.attrs,
            attr.service_uuid.clone(),
            attr.clone(),
            what,
        )
    }

    async fn update_service_attr(&self, old: &ServiceAttr, new: &ServiceAttr) -> Result<()> {
        let mut tables = self.tables()?;
        let stored = tables
            .attrs
            .get(&old.service_uuid)
            .ok_or_else(|| Error::NotFound(format!("service attr {}", old.service_uuid)))?;
        check_attr_update(stored, old, new)?;
        tables.attrs.insert(new.service_uuid.clone(), new.clone());
        Ok(())
    }

    async fn get_service_attr(&self, service_uuid: &str) -> Result<ServiceAttr> {
        self.tables()?
            .attrs
            .get(service_uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service attr {}", service_uuid)))
    }

    async fn delete_service_attr(&self, service_uuid: &str) -> Result<()> {
        let what = format!("service attr {}", service_uuid);
        remove_existing(&mut self.tables()?.attrs, &service_uuid.to_string(), what)
    }

    // === ServiceMember ===

    async fn create_service_member(&self, member: &ServiceMember) -> Result<()> {
        let key = (member.service_uuid.clone(), member.member_index);
        let what = format!("member {}/{}", member.service_uuid, member.member_index);
        insert_new(&mut self.tables()?.members, key, member.clone(), what)
    }

    async fn update_service_member(&self, old: &ServiceMember, new: &ServiceMember) -> Result<()> {
        let key = (old.service_uuid.clone(), old.member_index);
        let mut tables = self.tables()?;
        let stored = tables.members.get(&key).ok_or_else(|| {
            Error::NotFound(format!("member {}/{}", old.service_uuid, old.member_index))
        })?;
        check_member_update(stored, old, new)?;
        tables.members.insert(key, new.clone());
        Ok(())
    }

    async fn get_service_member(&self, service_uuid: &str, member_index: u32) -> Result<ServiceMember> {
        self.tables()?
            .members
            .get(&(service_uuid.to_string(), member_index))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("member {}/{}", service_uuid, member_index)))
    }

    async fn list_service_members(&self, service_uuid: &str) -> Result<Vec<ServiceMember>> {
        Ok(self
            .tables()?
            .members
            .range((service_uuid.to_string(), 0)..=(service_uuid.to_string(), u32::MAX))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn delete_service_member(&self, service_uuid: &str, member_index: u32) -> Result<()> {
        let key = (service_uuid.to_string(), member_index);
        let what = format!("member {}/{}", service_uuid, member_index);
        remove_existing(&mut self.tables()?.members, &key, what)
    }

    // === ConfigFile ===

    async fn create_config_file(&self, cfg: &ConfigFile) -> Result<()> {
        let key = (cfg.service_uuid.clone(), cfg.file_id.clone());
        let what = format!("config file {}/{}", cfg.service_uuid, cfg.file_id);
        insert_new(&mut self.tables()?.config_files, key, cfg.clone(), what)
    }

    async fn get_config_file(&self, service_uuid: &str, file_id: &str) -> Result<ConfigFile> {
        self.tables()?
            .config_files
            .get(&(service_uuid.to_string(), file_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("config file {}/{}", service_uuid, file_id)))
    }

    async fn delete_config_file(&self, service_uuid: &str, file_id: &str) -> Result<()> {
        let key = (service_uuid.to_string(), file_id.to_string());
        let what = format!("config file {}/{}", service_uuid, file_id);
        remove_existing(&mut self.tables()?.config_files, &key, what)
    }

    // === ServiceStaticIp ===

    async fn create_service_static_ip(&self, ip: &ServiceStaticIp) -> Result<()> {
        let what = format!("static ip {}", ip.static_ip);
        insert_new(
            &mut self.tables()?.static_ips,
            ip.static_ip.clone(),
            ip.clone(),
            what,
        )
    }

    async fn update_service_static_ip(&self, old: &ServiceStaticIp, new: &ServiceStaticIp) -> Result<()> {
        let mut tables = self.tables()?;
        let stored = tables
            .static_ips
            .get(&old.static_ip)
            .ok_or_else(|| Error::NotFound(format!("static ip {}", old.static_ip)))?;
        check_static_ip_update(stored, old, new)?;
        tables.static_ips.insert(new.static_ip.clone(), new.clone());
        Ok(())
    }

    async fn get_service_static_ip(&self, static_ip: &str) -> Result<ServiceStaticIp> {
        self.tables()?
            .static_ips
            .get(static_ip)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("static ip {}", static_ip)))
    }

    async fn delete_service_static_ip(&self, static_ip: &str) -> Result<()> {
        let what = format!("static ip {}", static_ip);
        remove_existing(&mut self.tables()?.static_ips, &static_ip.to_string(), what)
    }
}
