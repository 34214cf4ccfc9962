//! Metadata store using RocksDB
//!
//! One column family per record kind, bincode values. Writes that must read
//! before they write (create-if-absent, CAS) are serialized by a process-local
//! lock, which makes this backend safe for a single orchestrator process.

use super::{
    check_attr_update, check_member_update, check_static_ip_update, device_order, ConfigFile,
    Device, MetadataStore, Service, ServiceAttr, ServiceMember, ServiceStaticIp,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

const CF_DEVICES: &str = "devices";
const CF_SERVICES: &str = "services";
const CF_ATTRS: &str = "service_attrs";
const CF_MEMBERS: &str = "service_members";
const CF_CONFIG_FILES: &str = "config_files";
const CF_STATIC_IPS: &str = "static_ips";

type UpdateCheck<T> = fn(&T, &T, &T) -> Result<()>;

pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

fn device_key(cluster: &str, device_name: &str) -> String {
    format!("{}/{}", cluster, device_name)
}

fn service_key(cluster: &str, service_name: &str) -> String {
    format!("{}/{}", cluster, service_name)
}

fn member_key(service_uuid: &str, member_index: u32) -> String {
    format!("{}/{:010}", service_uuid, member_index)
}

fn config_file_key(service_uuid: &str, file_id: &str) -> String {
    format!("{}/{}", service_uuid, file_id)
}

impl RocksStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![
                CF_DEVICES,
                CF_SERVICES,
                CF_ATTRS,
                CF_MEMBERS,
                CF_CONFIG_FILES,
                CF_STATIC_IPS,
            ],
        )?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_record<T: DeserializeOwned>(&self, cf: &str, key: &str, what: String) -> Result<T> {
        self.read(cf, key)?.ok_or(Error::NotFound(what))
    }

    fn put_new<T: Serialize>(&self, cf: &str, key: &str, value: &T, what: String) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("metadata write lock poisoned".into()))?;
        let handle = self.cf(cf)?;
        if self.db.get_pinned_cf(handle, key.as_bytes())?.is_some() {
            return Err(Error::AlreadyExists(what));
        }
        self.db.put_cf(handle, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn compare_and_put<T>(
        &self,
        cf: &str,
        key: &str,
        old: &T,
        new: &T,
        check: UpdateCheck<T>,
        what: String,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let bytes = bincode::serialize(new)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("metadata write lock poisoned".into()))?;
        let stored: T = self.get_record(cf, key, what)?;
        check(&stored, old, new)?;
        self.db.put_cf(self.cf(cf)?, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn delete_existing(&self, cf: &str, key: &str, what: String) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Internal("metadata write lock poisoned".into()))?;
        let handle = self.cf(cf)?;
        if self.db.get_pinned_cf(handle, key.as_bytes())?.is_none() {
            return Err(Error::NotFound(what));
        }
        self.db.delete_cf(handle, key.as_bytes())?;
        Ok(())
    }

    fn scan_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &str) -> Result<Vec<T>> {
        let iter = self.db.iterator_cf(
            self.cf(cf)?,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl MetadataStore for RocksStore {
    // === Device ===

    async fn create_device(&self, dev: &Device) -> Result<()> {
        let key = device_key(&dev.cluster_name, &dev.device_name);
        self.put_new(CF_DEVICES, &key, dev, format!("device {}", key))
    }

    async fn get_device(&self, cluster: &str, device_name: &str) -> Result<Device> {
        let key = device_key(cluster, device_name);
        self.get_record(CF_DEVICES, &key, format!("device {}", key))
    }

    async fn delete_device(&self, cluster: &str, device_name: &str) -> Result<()> {
        let key = device_key(cluster, device_name);
        self.delete_existing(CF_DEVICES, &key, format!("device {}", key))
    }

    async fn list_devices(&self, cluster: &str) -> Result<Vec<Device>> {
        let mut devs: Vec<Device> = self.scan_prefix(CF_DEVICES, &format!("{}/", cluster))?;
        devs.sort_by(device_order);
        Ok(devs)
    }

    // === Service ===

    async fn create_service(&self, svc: &Service) -> Result<()> {
        let key = service_key(&svc.cluster_name, &svc.service_name);
        self.put_new(CF_SERVICES, &key, svc, format!("service {}", key))
    }

    async fn get_service(&self, cluster: &str, service_name: &str) -> Result<Service> {
        let key = service_key(cluster, service_name);
        self.get_record(CF_SERVICES, &key, format!("service {}", key))
    }

    async fn delete_service(&self, cluster: &str, service_name: &str) -> Result<()> {
        let key = service_key(cluster, service_name);
        self.delete_existing(CF_SERVICES, &key, format!("service {}", key))
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<Service>> {
        self.scan_prefix(CF_SERVICES, &format!("{}/", cluster))
    }

    // === ServiceAttr ===

    async fn create_service_attr(&self, attr: &ServiceAttr) -> Result<()> {
        let key = &attr.service_uuid;
        self.put_new(CF_ATTRS, key, attr, format!("service attr {}", key))
    }

    async fn update_service_attr(&self, old: &ServiceAttr, new: &ServiceAttr) -> Result<()> {
        let key = &old.service_uuid;
        self.compare_and_put(
            CF_ATTRS,
            key,
            old,
            new,
            check_attr_update,
            format!("service attr {}", key),
        )
    }

    async fn get_service_attr(&self, service_uuid: &str) -> Result<ServiceAttr> {
        self.get_record(CF_ATTRS, service_uuid, format!("service attr {}", service_uuid))
    }

    async fn delete_service_attr(&self, service_uuid: &str) -> Result<()> {
        self.delete_existing(CF_ATTRS, service_uuid, format!("service attr {}", service_uuid))
    }

    // === ServiceMember ===

    async fn create_service_member(&self, member: &ServiceMember) -> Result<()> {
        let key = member_key(&member.service_uuid, member.member_index);
        self.put_new(CF_MEMBERS, &key, member, format!("member {}", key))
    }

    async fn update_service_member(&self, old: &ServiceMember, new: &ServiceMember) -> Result<()> {
        let key = member_key(&old.service_uuid, old.member_index);
        self.compare_and_put(
            CF_MEMBERS,
            &key,
            old,
            new,
            check_member_update,
            format!("member {}", key),
        )
    }

    async fn get_service_member(&self, service_uuid: &str, member_index: u32) -> Result<ServiceMember> {
        let key = member_key(service_uuid, member_index);
        self.get_record(CF_MEMBERS, &key, format!("member {}", key))
    }

    async fn list_service_members(&self, service_uuid: &str) -> Result<Vec<ServiceMember>> {
        self.scan_prefix(CF_MEMBERS, &format!("{}/", service_uuid))
    }

    async fn delete_service_member(&self, service_uuid: &str, member_index: u32) -> Result<()> {
        let key = member_key(service_uuid, member_index);
        self.delete_existing(CF_MEMBERS, &key, format!("member {}", key))
    }

    // === ConfigFile ===

    async fn create_config_file(&self, cfg: &ConfigFile) -> Result<()> {
        let key = config_file_key(&cfg.service_uuid, &cfg.file_id);
        self.put_new(CF_CONFIG_FILES, &key, cfg, format!("config file {}", key))
    }

    async fn get_config_file(&self, service_uuid: &str, file_id: &str) -> Result<ConfigFile> {
        let key = config_file_key(service_uuid, file_id);
        self.get_record(CF_CONFIG_FILES, &key, format!("config file {}", key))
    }

    async fn delete_config_file(&self, service_uuid: &str, file_id: &str) -> Result<()> {
        let key = config_file_key(service_uuid, file_id);
        self.delete_existing(CF_CONFIG_FILES, &key, format!("config file {}", key))
    }

    // === ServiceStaticIp ===

    async fn create_service_static_ip(&self, ip: &ServiceStaticIp) -> Result<()> {
        let key = &ip.static_ip;
        self.put_new(CF_STATIC_IPS, key, ip, format!("static ip {}", key))
    }

    async fn update_service_static_ip(&self, old: &ServiceStaticIp, new: &ServiceStaticIp) -> Result<()> {
        let key = &old.static_ip;
        self.compare_and_put(
            CF_STATIC_IPS,
            key,
            old,
            new,
            check_static_ip_update,
            format!("static ip {}", key),
        )
    }

    async fn get_service_static_ip(&self, static_ip: &str) -> Result<ServiceStaticIp> {
        self.get_record(CF_STATIC_IPS, static_ip, format!("static ip {}", static_ip))
    }

    async fn delete_service_static_ip(&self, static_ip: &str) -> Result<()> {
        self.delete_existing(CF_STATIC_IPS, static_ip, format!("static ip {}", static_ip))
    }
}
