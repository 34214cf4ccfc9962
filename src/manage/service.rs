//! Service lifecycle: creation, activation, teardown
//!
//! `create_service` is a sequence of individually idempotent steps, so a
//! caller recovers from any failure by repeating the whole call:
//!
//! ```text
//! devices ─► name→uuid ─► volume layout ─► configs + attr ─► members ─► Initializing
//! ```
//!
//! Conflicts (`AlreadyExists`) at each step mean an earlier attempt got
//! there first; the persisted record wins and the sequence continues.

use super::config_file::{ConfigFileContent, ConfigVersioner};
use super::device::DeviceAllocator;
use super::static_ip::StaticIpAllocator;
use crate::common::{
    default_domain_name, dns_name, member_name, new_service_uuid, poll_until, timestamp_now_millis,
    validate_name, Error, ManageConfig, Result, DEFAULT_HOST_IP,
};
use crate::metadata::{
    ConfigFile, MemberVolumes, MetadataStore, Service, ServiceAttr, ServiceMember, ServiceStatus,
    ServiceVolumes, VolumeSpec,
};
use crate::platform::{CreateVolumeOptions, DnsService, NetworkProvider, VolumeProvider, VolumeState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::Instrument;

/// Per-replica placement and config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub available_zone: String,
    #[serde(default)]
    pub configs: Vec<ConfigFileContent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub cluster_name: String,
    pub service_name: String,
    pub replicas: u32,
    pub primary_volume: VolumeSpec,
    #[serde(default)]
    pub journal_volume: Option<VolumeSpec>,
    #[serde(default)]
    pub register_dns: bool,
    /// Defaults to `{cluster}-stateplane.com`
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub require_static_ip: bool,
    #[serde(default)]
    pub service_configs: Vec<ConfigFileContent>,
    /// One entry per replica, in member index order
    pub replica_configs: Vec<ReplicaConfig>,
}

impl CreateServiceRequest {
    pub fn validate(&self) -> Result<()> {
        validate_name("cluster name", &self.cluster_name)?;
        validate_name("service name", &self.service_name)?;
        if self.replicas == 0 {
            return Err(Error::InvalidArgument("replicas must be > 0".into()));
        }
        if self.replica_configs.len() != self.replicas as usize {
            return Err(Error::InvalidArgument(format!(
                "{} replica configs for {} replicas",
                self.replica_configs.len(),
                self.replicas
            )));
        }
        if self.primary_volume.size_gb == 0 {
            return Err(Error::InvalidArgument("primary volume size must be > 0".into()));
        }
        if self.require_static_ip && !self.register_dns {
            return Err(Error::InvalidArgument(
                "static IPs require DNS registration".into(),
            ));
        }
        Ok(())
    }

    fn domain(&self) -> String {
        self.domain_name
            .clone()
            .unwrap_or_else(|| default_domain_name(&self.cluster_name))
    }
}

pub struct ServiceManager {
    store: Arc<dyn MetadataStore>,
    volumes: Arc<dyn VolumeProvider>,
    dns: Arc<dyn DnsService>,
    devices: DeviceAllocator,
    configs: ConfigVersioner,
    static_ips: StaticIpAllocator,
    config: ManageConfig,
}

impl ServiceManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        volumes: Arc<dyn VolumeProvider>,
        network: Arc<dyn NetworkProvider>,
        dns: Arc<dyn DnsService>,
        config: ManageConfig,
    ) -> Self {
        Self {
            devices: DeviceAllocator::new(store.clone(), config.max_retry_count),
            configs: ConfigVersioner::new(store.clone()),
            static_ips: StaticIpAllocator::new(store.clone(), network, config.max_retry_count),
            store,
            volumes,
            dns,
            config,
        }
    }

    /// Create every record of a service. Safe to call again after any
    /// failure; repeated calls converge on one UUID.
    pub async fn create_service(&self, req: &CreateServiceRequest) -> Result<String> {
        req.validate()?;
        let span = tracing::info_span!(
            "create_service",
            cluster = %req.cluster_name,
            service = %req.service_name
        );
        self.create_service_inner(req).instrument(span).await
    }

    async fn create_service_inner(&self, req: &CreateServiceRequest) -> Result<String> {
        let cluster = &req.cluster_name;
        let service = &req.service_name;

        let primary_device = self.devices.allocate_device(cluster, service, None).await?;
        let journal_device = match req.journal_volume {
            Some(_) => Some(
                self.devices
                    .allocate_device(cluster, service, Some(&primary_device))
                    .await?,
            ),
            None => None,
        };

        let uuid = self.create_service_binding(cluster, service).await?;

        let attr = match self.store.get_service_attr(&uuid).await {
            Ok(existing) => {
                if existing.volumes.primary_device_name != primary_device {
                    tracing::warn!(
                        "Keeping recorded device {} for {} (allocated {})",
                        existing.volumes.primary_device_name,
                        service,
                        primary_device
                    );
                }
                existing
            }
            Err(Error::NotFound(_)) => {
                let volumes = ServiceVolumes {
                    primary_device_name: primary_device,
                    primary: req.primary_volume.clone(),
                    journal_device_name: journal_device,
                    journal: req.journal_volume.clone(),
                };
                self.create_service_attr(req, &uuid, volumes).await?
            }
            Err(e) => return Err(e),
        };

        match attr.status {
            ServiceStatus::Creating => {}
            ServiceStatus::Initializing | ServiceStatus::Active => {
                tracing::info!("Service {} already created ({})", uuid, attr.status);
                return Ok(uuid);
            }
            ServiceStatus::Deleting | ServiceStatus::Deleted => {
                return Err(Error::ServiceDeleting(format!("{}/{}", cluster, service)));
            }
        }
        if attr.replicas != req.replicas {
            tracing::warn!(
                "Service {} keeps recorded replicas {} (requested {})",
                uuid,
                attr.replicas,
                req.replicas
            );
        }

        self.create_members(&attr, req).await?;

        let initializing = attr.with_status(ServiceStatus::Initializing);
        match self.store.update_service_attr(&attr, &initializing).await {
            Ok(()) => {}
            Err(Error::ConditionFailed(_)) => {
                // a concurrent attempt may have finished first
                let current = self.store.get_service_attr(&uuid).await?;
                if current.status == ServiceStatus::Creating {
                    let initializing = current.with_status(ServiceStatus::Initializing);
                    self.store.update_service_attr(&current, &initializing).await?;
                } else if !matches!(
                    current.status,
                    ServiceStatus::Initializing | ServiceStatus::Active
                ) {
                    return Err(Error::ServiceDeleting(format!("{}/{}", cluster, service)));
                }
            }
            Err(e) => return Err(e),
        }
        tracing::info!("Service {} created with {} members", uuid, attr.replicas);
        Ok(uuid)
    }

    /// Create-if-absent the name → UUID binding, adopting an existing UUID
    async fn create_service_binding(&self, cluster: &str, service: &str) -> Result<String> {
        let record = Service {
            cluster_name: cluster.to_string(),
            service_name: service.to_string(),
            service_uuid: new_service_uuid(),
        };
        match self.store.create_service(&record).await {
            Ok(()) => {
                tracing::info!("Created service {} as {}", service, record.service_uuid);
                Ok(record.service_uuid)
            }
            Err(Error::AlreadyExists(_)) => {
                let existing = self.store.get_service(cluster, service).await?;
                tracing::info!("Service {} exists as {}", service, existing.service_uuid);
                Ok(existing.service_uuid)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_service_attr(&self, req: &CreateServiceRequest, uuid: &str, volumes: ServiceVolumes) -> Result<ServiceAttr> {
        let service_configs = self
            .configs
            .create_initial_configs(uuid, &req.service_name, &req.service_configs)
            .await?;

        let domain = req.domain();
        let hosted_zone_id = if req.register_dns {
            self.dns.get_or_create_hosted_zone(&domain).await?
        } else {
            String::new()
        };

        let attr = ServiceAttr {
            service_uuid: uuid.to_string(),
            status: ServiceStatus::Creating,
            revision: 0,
            last_modified: timestamp_now_millis(),
            replicas: req.replicas,
            cluster_name: req.cluster_name.clone(),
            service_name: req.service_name.clone(),
            volumes,
            register_dns: req.register_dns,
            domain_name: domain,
            hosted_zone_id,
            require_static_ip: req.require_static_ip,
            service_configs,
        };

        match self.store.create_service_attr(&attr).await {
            Ok(()) => Ok(attr),
            Err(Error::AlreadyExists(_)) => self.store.get_service_attr(uuid).await,
            Err(e) => Err(e),
        }
    }

    /// Create the members that do not exist yet. Existing ones are left alone.
    async fn create_members(&self, attr: &ServiceAttr, req: &CreateServiceRequest) -> Result<()> {
        let existing = self.store.list_service_members(&attr.service_uuid).await?;
        let existing_idx: HashSet<u32> = existing.iter().map(|m| m.member_index).collect();
        let pending: Vec<u32> = (0..attr.replicas)
            .filter(|i| !existing_idx.contains(i))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut static_ips: HashMap<u32, String> = HashMap::new();
        if attr.require_static_ip {
            let in_use: HashSet<String> = existing.iter().filter_map(|m| m.static_ip.clone()).collect();
            let mut by_zone: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
            for &index in &pending {
                by_zone
                    .entry(replica_config(req, index)?.available_zone.as_str())
                    .or_default()
                    .push(index);
            }
            for (zone, indexes) in by_zone {
                let ips = self
                    .static_ips
                    .create_static_ips(&attr.cluster_name, &attr.service_uuid, zone, indexes.len(), &in_use)
                    .await?;
                for (index, ip) in indexes.into_iter().zip(ips) {
                    static_ips.insert(index, ip.static_ip);
                }
            }
        }

        for index in pending {
            let replica = replica_config(req, index)?;
            let name = member_name(&attr.service_name, index);
            let static_ip = static_ips.remove(&index);

            if attr.register_dns {
                let host = static_ip.as_deref().unwrap_or(DEFAULT_HOST_IP);
                let record = dns_name(&name, &attr.domain_name);
                if let Err(e) = self
                    .dns
                    .update_record(&record, host, &attr.hosted_zone_id)
                    .await
                {
                    tracing::warn!("Pre-registering dns {} failed: {}", record, e);
                }
            }

            let configs = self
                .configs
                .create_initial_configs(&attr.service_uuid, &name, &replica.configs)
                .await?;
            let volumes = self
                .create_member_volumes(attr, &name, &replica.available_zone)
                .await?;

            let member = ServiceMember::new(
                &attr.service_uuid,
                index,
                &name,
                &replica.available_zone,
                static_ip,
                volumes,
                configs,
            );
            match self.store.create_service_member(&member).await {
                Ok(()) => tracing::info!("Created member {} of {}", name, attr.service_uuid),
                Err(Error::AlreadyExists(_)) => {
                    tracing::warn!("Member {} created concurrently", name)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // TODO: tag volumes with the member name and look them up here so a
    // crash between volume creation and member creation does not orphan them.
    async fn create_member_volumes(&self, attr: &ServiceAttr, member: &str, zone: &str) -> Result<MemberVolumes> {
        let primary = self
            .create_volume(zone, &attr.volumes.primary, member)
            .await?;
        let journal = match &attr.volumes.journal {
            Some(spec) => Some(self.create_volume(zone, spec, member).await?),
            None => None,
        };

        Ok(MemberVolumes {
            primary_volume_id: primary,
            primary_device_name: attr.volumes.primary_device_name.clone(),
            journal_volume_id: journal,
            journal_device_name: attr.volumes.journal_device_name.clone(),
        })
    }

    async fn create_volume(&self, zone: &str, spec: &VolumeSpec, member: &str) -> Result<String> {
        let opts = CreateVolumeOptions {
            available_zone: zone.to_string(),
            spec: spec.clone(),
            tag: member.to_string(),
        };
        let volume_id = self.volumes.create_volume(&opts).await?;

        let what = format!("volume {} available", volume_id);
        poll_until(&self.config.volume_create_poll, &what, || async {
            match self.volumes.get_volume_state(&volume_id).await? {
                VolumeState::Available => Ok(true),
                VolumeState::Creating => Ok(false),
                other => Err(Error::IncorrectVolumeState {
                    volume_id: volume_id.clone(),
                    state: other.to_string(),
                }),
            }
        })
        .await?;

        tracing::info!("Created volume {} for {} in {}", volume_id, member, zone);
        Ok(volume_id)
    }

    /// Move a freshly created service from Initializing to Active
    pub async fn set_service_initialized(&self, service_uuid: &str) -> Result<()> {
        let attr = self.store.get_service_attr(service_uuid).await?;
        match attr.status {
            ServiceStatus::Active => Ok(()),
            ServiceStatus::Initializing => {
                let active = attr.with_status(ServiceStatus::Active);
                self.store.update_service_attr(&attr, &active).await?;
                tracing::info!("Service {} is active", service_uuid);
                Ok(())
            }
            other => Err(Error::InvalidArgument(format!(
                "service {} is {}, not initializing",
                service_uuid, other
            ))),
        }
    }

    /// Remove every record of a service, returning its volume ids so the
    /// caller can delete the volumes. Safe to retry.
    pub async fn delete_service(&self, cluster: &str, service: &str) -> Result<Vec<String>> {
        let span = tracing::info_span!("delete_service", cluster = %cluster, service = %service);
        self.delete_service_inner(cluster, service)
            .instrument(span)
            .await
    }

    async fn delete_service_inner(&self, cluster: &str, service: &str) -> Result<Vec<String>> {
        let uuid = match self.store.get_service(cluster, service).await {
            Ok(svc) => svc.service_uuid,
            Err(Error::NotFound(_)) => {
                tracing::info!("Service {}/{} already deleted", cluster, service);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut volume_ids = Vec::new();
        match self.store.get_service_attr(&uuid).await {
            Ok(attr) => {
                let attr = if attr.status == ServiceStatus::Deleting {
                    attr
                } else {
                    let deleting = attr.with_status(ServiceStatus::Deleting);
                    self.store.update_service_attr(&attr, &deleting).await?;
                    deleting
                };

                for member in self.store.list_service_members(&uuid).await? {
                    volume_ids.extend(self.delete_member(&attr, &member).await?);
                }

                self.configs
                    .delete_configs(&uuid, &attr.service_configs)
                    .await?;
                ignore_not_found(self.store.delete_service_attr(&uuid).await)?;
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.devices.release_devices(cluster, service).await?;
        ignore_not_found(self.store.delete_service(cluster, service).await)?;
        tracing::info!("Deleted service {} ({} volumes)", uuid, volume_ids.len());
        Ok(volume_ids)
    }

    async fn delete_member(&self, attr: &ServiceAttr, member: &ServiceMember) -> Result<Vec<String>> {
        if attr.register_dns {
            let record = dns_name(&member.member_name, &attr.domain_name);
            if let Err(e) = self.dns.delete_record(&record, &attr.hosted_zone_id).await {
                tracing::warn!("Deleting dns record {} failed: {}", record, e);
            }
        }
        if let Some(ip) = &member.static_ip {
            self.static_ips.delete_static_ip(ip).await?;
        }
        self.configs
            .delete_configs(&member.service_uuid, &member.configs)
            .await?;

        let mut ids = Vec::new();
        for (volume_id, device) in member.volumes.attachments() {
            self.detach_for_delete(volume_id, device).await;
            ids.push(volume_id.to_string());
        }

        ignore_not_found(
            self.store
                .delete_service_member(&member.service_uuid, member.member_index)
                .await,
        )?;
        Ok(ids)
    }

    async fn detach_for_delete(&self, volume_id: &str, device: &str) {
        let info = match self.volumes.get_volume_info(volume_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Volume {} not inspected before delete: {}", volume_id, e);
                return;
            }
        };
        if let (true, Some(instance)) = (info.state.is_bound(), info.attached_instance) {
            if let Err(e) = self.volumes.detach_volume(volume_id, &instance, device).await {
                tracing::warn!("Detaching {} from {} failed: {}", volume_id, instance, e);
            }
        }
    }

    pub async fn get_service_uuid(&self, cluster: &str, service: &str) -> Result<String> {
        Ok(self.store.get_service(cluster, service).await?.service_uuid)
    }

    pub async fn get_service_attr(&self, service_uuid: &str) -> Result<ServiceAttr> {
        self.store.get_service_attr(service_uuid).await
    }

    pub async fn list_service_members(&self, service_uuid: &str) -> Result<Vec<ServiceMember>> {
        self.store.list_service_members(service_uuid).await
    }

    pub async fn list_service_volumes(&self, service_uuid: &str) -> Result<Vec<MemberVolumes>> {
        Ok(self
            .store
            .list_service_members(service_uuid)
            .await?
            .into_iter()
            .map(|m| m.volumes)
            .collect())
    }

    pub async fn update_service_config(&self, service_uuid: &str, file_name: &str, content: &str) -> Result<ConfigFile> {
        self.configs
            .update_service_config(service_uuid, file_name, content)
            .await
    }

    pub async fn update_member_config(
        &self,
        service_uuid: &str,
        member_index: u32,
        file_name: &str,
        content: &str,
    ) -> Result<ConfigFile> {
        self.configs
            .update_member_config(service_uuid, member_index, file_name, content)
            .await
    }
}

fn replica_config(req: &CreateServiceRequest, index: u32) -> Result<&ReplicaConfig> {
    req.replica_configs
        .get(index as usize)
        .ok_or_else(|| Error::InvalidArgument(format!("no replica config for member {}", index)))
}

fn ignore_not_found(res: Result<()>) -> Result<()> {
    match res {
        Err(Error::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PollPolicy;
    use crate::metadata::MemStore;
    use crate::platform::{MemDns, MemNetwork, MemVolumes, NetworkInterface};

    struct Fixture {
        store: Arc<MemStore>,
        volumes: Arc<MemVolumes>,
        dns: Arc<MemDns>,
        manager: ServiceManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let volumes = Arc::new(MemVolumes::with_transition_polls(1));
        let network = Arc::new(MemNetwork::new());
        network.set_zone_cidr("az-1", "10.0.0.0/24").unwrap();
        network
            .add_interface(NetworkInterface {
                interface_id: "eni-1".into(),
                server_instance_id: "i-1".into(),
                available_zone: "az-1".into(),
                primary_private_ip: "10.0.0.4".into(),
                private_ips: vec![],
            })
            .unwrap();
        let dns = Arc::new(MemDns::new());
        let config = ManageConfig {
            max_retry_count: 3,
            volume_create_poll: PollPolicy::new(1, 20),
        };
        let manager = ServiceManager::new(
            store.clone(),
            volumes.clone(),
            network,
            dns.clone(),
            config,
        );
        Fixture {
            store,
            volumes,
            dns,
            manager,
        }
    }

    fn request(replicas: u32) -> CreateServiceRequest {
        CreateServiceRequest {
            cluster_name: "c1".into(),
            service_name: "svc-a".into(),
            replicas,
            primary_volume: VolumeSpec {
                volume_type: "gp2".into(),
                size_gb: 10,
                iops: 0,
                encrypted: false,
            },
            journal_volume: None,
            register_dns: true,
            domain_name: None,
            require_static_ip: false,
            service_configs: vec![ConfigFileContent::new("service.conf", "replicas=3")],
            replica_configs: (0..replicas)
                .map(|i| ReplicaConfig {
                    available_zone: "az-1".into(),
                    configs: vec![ConfigFileContent::new("member.conf", &format!("id={}", i))],
                })
                .collect(),
        }
    }

    #[test]
    fn test_request_validation() {
        let mut req = request(3);
        assert!(req.validate().is_ok());
        req.replica_configs.pop();
        assert!(req.validate().is_err());

        let mut req = request(1);
        req.register_dns = false;
        req.require_static_ip = true;
        assert!(req.validate().is_err());

        let mut req = request(1);
        req.service_name = "bad name".into();
        assert!(req.validate().is_err());
    }

    #[tokio::test]
    async fn test_create_service_records() {
        let f = fixture();
        let uuid = f.manager.create_service(&request(3)).await.unwrap();

        let attr = f.store.get_service_attr(&uuid).await.unwrap();
        assert_eq!(attr.status, ServiceStatus::Initializing);
        assert_eq!(attr.volumes.primary_device_name, "/dev/xvdf");
        assert_eq!(attr.domain_name, "c1-stateplane.com");
        assert_eq!(attr.service_configs.len(), 1);

        let members = f.store.list_service_members(&uuid).await.unwrap();
        assert_eq!(members.len(), 3);
        for (i, m) in members.iter().enumerate() {
            assert_eq!(m.member_index, i as u32);
            assert_eq!(m.member_name, format!("svc-a-{}", i));
            assert!(!m.has_server_owner());
            assert_eq!(m.configs.len(), 1);
            assert_eq!(
                f.dns
                    .get_record(&format!("svc-a-{}.c1-stateplane.com", i), &attr.hosted_zone_id)
                    .await
                    .unwrap(),
                DEFAULT_HOST_IP
            );
        }
        assert_eq!(f.volumes.volume_count(), 3);
    }

    #[tokio::test]
    async fn test_create_service_with_journal() {
        let f = fixture();
        let mut req = request(2);
        req.journal_volume = Some(VolumeSpec {
            volume_type: "gp2".into(),
            size_gb: 2,
            iops: 0,
            encrypted: false,
        });
        let uuid = f.manager.create_service(&req).await.unwrap();

        let attr = f.store.get_service_attr(&uuid).await.unwrap();
        assert_eq!(attr.volumes.journal_device_name.as_deref(), Some("/dev/xvdg"));
        let vols = f.manager.list_service_volumes(&uuid).await.unwrap();
        assert_eq!(vols.len(), 2);
        assert!(vols.iter().all(|v| v.journal_volume_id.is_some()));
        assert_eq!(f.volumes.volume_count(), 4);
    }

    #[tokio::test]
    async fn test_create_service_resumes_missing_members() {
        let f = fixture();
        let uuid = f.manager.create_service(&request(3)).await.unwrap();

        // simulate a crash that left only member 0 behind
        let attr = f.store.get_service_attr(&uuid).await.unwrap();
        let creating = ServiceAttr {
            status: ServiceStatus::Creating,
            ..attr.clone()
        };
        f.store.delete_service_attr(&uuid).await.unwrap();
        f.store.create_service_attr(&creating).await.unwrap();
        let member0 = f.store.get_service_member(&uuid, 0).await.unwrap();
        f.store.delete_service_member(&uuid, 1).await.unwrap();
        f.store.delete_service_member(&uuid, 2).await.unwrap();

        let again = f.manager.create_service(&request(3)).await.unwrap();
        assert_eq!(again, uuid);
        let members = f.store.list_service_members(&uuid).await.unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0], member0);
        assert_eq!(
            f.store.get_service_attr(&uuid).await.unwrap().status,
            ServiceStatus::Initializing
        );
    }

    #[tokio::test]
    async fn test_set_service_initialized() {
        let f = fixture();
        let uuid = f.manager.create_service(&request(1)).await.unwrap();
        f.manager.set_service_initialized(&uuid).await.unwrap();
        f.manager.set_service_initialized(&uuid).await.unwrap();
        assert_eq!(
            f.manager.get_service_attr(&uuid).await.unwrap().status,
            ServiceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_delete_service() {
        let f = fixture();
        let mut req = request(2);
        req.require_static_ip = true;
        let uuid = f.manager.create_service(&req).await.unwrap();
        let members = f.store.list_service_members(&uuid).await.unwrap();
        let ip = members[0].static_ip.clone().unwrap();

        let vols = f.manager.delete_service("c1", "svc-a").await.unwrap();
        assert_eq!(vols.len(), 2);
        assert!(f.store.get_service("c1", "svc-a").await.unwrap_err().is_not_found());
        assert!(f.store.get_service_attr(&uuid).await.unwrap_err().is_not_found());
        assert!(f.store.list_service_members(&uuid).await.unwrap().is_empty());
        assert!(f.store.list_devices("c1").await.unwrap().is_empty());
        assert!(f.store.get_service_static_ip(&ip).await.unwrap_err().is_not_found());

        // retry after completion
        assert!(f.manager.delete_service("c1", "svc-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_after_delete_started() {
        let f = fixture();
        let uuid = f.manager.create_service(&request(1)).await.unwrap();
        let attr = f.store.get_service_attr(&uuid).await.unwrap();
        f.store
            .update_service_attr(&attr, &attr.with_status(ServiceStatus::Deleting))
            .await
            .unwrap();

        let err = f.manager.create_service(&request(1)).await.unwrap_err();
        assert!(matches!(err, Error::ServiceDeleting(_)));
    }

    #[tokio::test]
    async fn test_update_service_config() {
        let f = fixture();
        let uuid = f.manager.create_service(&request(1)).await.unwrap();
        let next = f
            .manager
            .update_service_config(&uuid, "service.conf", "replicas=5")
            .await
            .unwrap();
        assert_eq!(next.file_id, "svc-a-service.conf-1");
        let attr = f.store.get_service_attr(&uuid).await.unwrap();
        assert_eq!(attr.service_configs[0].file_id, next.file_id);
    }
}
