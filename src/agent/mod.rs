//! Per-node volume agent
//!
//! When a task of a stateful service starts on this node, the agent picks
//! an idle member, moves the member's volumes (and static IP) here, formats
//! and mounts them. A failed mount undoes only the steps it completed.
//! Unmount reverses it once the last user on the node is gone.
//!
//! ```text
//! mount(uuid)
//!   ├─ service lock + refcount ── already mounted? ─▶ path
//!   ├─ select member ──▶ take ownership (detach, attach, CAS)
//!   ├─ static ip / dns
//!   └─ format if blank ──▶ add ip ──▶ mount primary (+ journal)
//! ```

pub mod host;
pub mod mount;
pub mod network;
pub mod selector;
pub mod transfer;

pub use host::{
    CommandFilesystem, CommandHostNetwork, Filesystem, HostNetwork, MemFilesystem, MemHostNetwork,
};
pub use mount::{journal_mount_path, primary_mount_path, MountTable, Release};
pub use network::ServiceNetwork;
pub use selector::{choose_member, MemberSelector};
pub use transfer::{Claim, OwnershipTransfer};

use crate::common::{AgentConfig, Error, Result};
use crate::metadata::{MetadataStore, ServiceMember, ServiceStatus};
use crate::platform::{ContainerPlatform, DnsService, LocalNode, NetworkProvider, VolumeProvider};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

/// Remote systems the agent works against
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MetadataStore>,
    pub platform: Arc<dyn ContainerPlatform>,
    pub volumes: Arc<dyn VolumeProvider>,
    pub network: Arc<dyn NetworkProvider>,
    pub dns: Arc<dyn DnsService>,
}

/// Local host operations
#[derive(Clone)]
pub struct HostOps {
    pub fs: Arc<dyn Filesystem>,
    pub net: Arc<dyn HostNetwork>,
}

impl HostOps {
    /// Shell-command backed operations
    pub fn commands(config: &AgentConfig) -> Self {
        Self {
            fs: Arc::new(CommandFilesystem::new(config)),
            net: Arc::new(CommandHostNetwork::new(config)),
        }
    }
}

/// Steps of a mount that completed, for undoing a failed one
#[derive(Debug, Default)]
struct MountProgress {
    ip_added: bool,
    primary_mounted: bool,
    journal_mounted: bool,
}

pub struct VolumeAgent {
    node: LocalNode,
    config: AgentConfig,
    store: Arc<dyn MetadataStore>,
    platform: Arc<dyn ContainerPlatform>,
    selector: MemberSelector,
    transfer: OwnershipTransfer,
    network: ServiceNetwork,
    host: HostOps,
    mounts: MountTable,
}

impl VolumeAgent {
    pub fn new(node: LocalNode, config: AgentConfig, remote: Collaborators, host: HostOps) -> Self {
        let selector = MemberSelector::new(
            remote.store.clone(),
            remote.platform.clone(),
            remote.network.clone(),
            node.clone(),
        );
        let transfer = OwnershipTransfer::new(
            remote.store.clone(),
            remote.volumes.clone(),
            config.volume_poll,
        );
        let network = ServiceNetwork::new(
            remote.store.clone(),
            remote.network,
            remote.dns,
            host.net.clone(),
            node.clone(),
            config.dns_poll,
        );

        Self {
            node,
            config,
            store: remote.store,
            platform: remote.platform,
            selector,
            transfer,
            network,
            host,
            mounts: MountTable::new(),
        }
    }

    pub fn node(&self) -> &LocalNode {
        &self.node
    }

    /// Pick a member of the service for this node and take it over.
    ///
    /// Losing a claim race re-runs selection, up to `max_claim_attempts`.
    pub async fn select_and_take_ownership(
        &self,
        service_uuid: &str,
        requested: Option<&str>,
    ) -> Result<ServiceMember> {
        self.claim_member(service_uuid, requested)
            .await
            .map(|claim| claim.member)
    }

    async fn claim_member(&self, service_uuid: &str, requested: Option<&str>) -> Result<Claim> {
        let span = tracing::info_span!(
            "take_ownership",
            service = %service_uuid,
            node = %self.node.server_instance_id
        );

        async move {
            let attr = self.store.get_service_attr(service_uuid).await?;
            if matches!(attr.status, ServiceStatus::Deleting | ServiceStatus::Deleted) {
                return Err(Error::ServiceDeleting(attr.service_name.clone()));
            }

            for attempt in 1..=self.config.max_claim_attempts {
                let member = self.selector.select_member(&attr, requested).await?;
                let task_id = match requested {
                    // ordinal-addressed platforms run one task per member
                    Some(name) => format!("{}-{}", name, self.node.container_instance_id),
                    None => {
                        self.platform
                            .get_task_for_node(
                                &attr.cluster_name,
                                &attr.service_name,
                                &self.node.container_instance_id,
                            )
                            .await?
                    }
                };

                match self.transfer.take_ownership(&member, &task_id, &self.node).await {
                    Ok(claim) => {
                        if attr.require_static_ip {
                            self.network.reconcile_static_ip(&attr, &claim.member).await?;
                        } else if attr.register_dns {
                            self.network.update_dns(&attr, &claim.member).await?;
                        }
                        tracing::info!(
                            "Took ownership of {} ({} volumes attached)",
                            claim.member.member_name,
                            claim.attached.len()
                        );
                        return Ok(claim);
                    }
                    Err(Error::ConditionFailed(reason)) => {
                        tracing::warn!(
                            "Lost claim on {} (attempt {}/{}): {}",
                            member.member_name,
                            attempt,
                            self.config.max_claim_attempts,
                            reason
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            Err(Error::NoIdleMember(format!(
                "service {} still contended after {} claims",
                attr.service_name, self.config.max_claim_attempts
            )))
        }
        .instrument(span)
        .await
    }

    /// Mount the service's volumes on this node. Returns the primary mount
    /// path; a service already mounted here just gains a reference.
    pub async fn mount(&self, service_uuid: &str, requested: Option<&str>) -> Result<PathBuf> {
        let lock = self.mounts.service_lock(service_uuid)?;
        let _guard = lock.lock().await;

        let path = primary_mount_path(&self.config.mount_root, service_uuid);
        if let Some(member) = self.mounts.acquire(service_uuid)? {
            tracing::info!("Service {} already mounted as {}", service_uuid, member.member_name);
            return Ok(path);
        }

        let claim = self.claim_member(service_uuid, requested).await?;
        let mut progress = MountProgress::default();
        if let Err(e) = self.prepare_and_mount(&claim.member, &mut progress).await {
            tracing::error!("Mounting {} failed: {}", claim.member.member_name, e);
            self.undo_mount(&claim, &progress).await;
            return Err(e);
        }

        self.mounts.insert(claim.member)?;
        Ok(path)
    }

    async fn prepare_and_mount(&self, member: &ServiceMember, progress: &mut MountProgress) -> Result<()> {
        for (volume_id, device) in member.volumes.attachments() {
            if !self.host.fs.is_formatted(device).await? {
                tracing::info!("Formatting {} ({})", device, volume_id);
                self.host.fs.format(device).await?;
            }
        }

        if let Some(ip) = &member.static_ip {
            self.host.net.add_ip(ip).await?;
            progress.ip_added = true;
        }

        let root = &self.config.mount_root;
        self.host
            .fs
            .mount(
                &member.volumes.primary_device_name,
                &primary_mount_path(root, &member.service_uuid),
            )
            .await?;
        progress.primary_mounted = true;
        if let Some(journal) = &member.volumes.journal_device_name {
            self.host
                .fs
                .mount(journal, &journal_mount_path(root, &member.service_uuid))
                .await?;
            progress.journal_mounted = true;
        }
        tracing::info!(
            "Mounted {} of service {}",
            member.member_name,
            member.service_uuid
        );
        Ok(())
    }

    /// Reverse the steps a failed mount completed, newest first. Volumes
    /// are detached only if the claim attached them and nothing is left
    /// mounted on top of them.
    async fn undo_mount(&self, claim: &Claim, progress: &MountProgress) {
        let member = &claim.member;
        let root = &self.config.mount_root;
        let mut unmounted = true;

        let mut paths = Vec::new();
        if progress.journal_mounted {
            paths.push(journal_mount_path(root, &member.service_uuid));
        }
        if progress.primary_mounted {
            paths.push(primary_mount_path(root, &member.service_uuid));
        }
        for path in paths {
            if let Err(e) = self.host.fs.unmount(&path).await {
                tracing::warn!("Unmounting {} after failed mount: {}", path.display(), e);
                unmounted = false;
            }
        }

        if progress.ip_added {
            if let Some(ip) = &member.static_ip {
                if let Err(e) = self.host.net.delete_ip(ip).await {
                    tracing::warn!("Deleting ip {} from host failed: {}", ip, e);
                }
            }
        }

        if !unmounted {
            tracing::warn!("Leaving volumes of {} attached, still mounted", member.member_name);
            return;
        }
        self.transfer
            .detach_volumes(&claim.attached, &self.node.server_instance_id)
            .await;
    }

    /// Drop one reference; the last one tears the mount down
    pub async fn unmount(&self, service_uuid: &str) -> Result<()> {
        let lock = self.mounts.service_lock(service_uuid)?;
        let _guard = lock.lock().await;

        match self.mounts.release(service_uuid)? {
            Release::NotMounted => {
                self.unmount_stale(service_uuid).await;
                Err(Error::NotFound(format!(
                    "service {} is not mounted on this node",
                    service_uuid
                )))
            }
            Release::StillInUse(refs) => {
                tracing::info!("Service {} still has {} users", service_uuid, refs);
                Ok(())
            }
            Release::Last(member) => {
                if let Err(e) = self.release_ownership(&member).await {
                    self.mounts.insert(member)?;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Undo this node's hold on a member: local IP, mounts, attachments.
    /// The member record keeps naming this node until the next claim.
    pub async fn release_ownership(&self, member: &ServiceMember) -> Result<()> {
        if let Some(ip) = &member.static_ip {
            if let Err(e) = self.host.net.delete_ip(ip).await {
                tracing::warn!("Deleting ip {} from host failed: {}", ip, e);
            }
        }

        let root = &self.config.mount_root;
        self.host
            .fs
            .unmount(&primary_mount_path(root, &member.service_uuid))
            .await?;
        if member.volumes.journal_device_name.is_some() {
            self.host
                .fs
                .unmount(&journal_mount_path(root, &member.service_uuid))
                .await?;
        }

        self.transfer
            .detach_member_volumes(&member.volumes, &self.node.server_instance_id)
            .await;
        tracing::info!("Released {} from {}", member.member_name, self.node.server_instance_id);
        Ok(())
    }

    /// Mounts of a service this agent does not track, left behind by an
    /// earlier agent process. Best effort.
    async fn unmount_stale(&self, service_uuid: &str) {
        let root = &self.config.mount_root;
        for path in [
            journal_mount_path(root, service_uuid),
            primary_mount_path(root, service_uuid),
        ] {
            match self.host.fs.is_mounted(&path).await {
                Ok(true) => {
                    tracing::info!("Unmounting stale mount {}", path.display());
                    if let Err(e) = self.host.fs.unmount(&path).await {
                        tracing::warn!("Unmounting stale {} failed: {}", path.display(), e);
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Checking mount {} failed: {}", path.display(), e),
            }
        }
    }

    /// Mounted member of a service and its reference count
    pub fn mounted(&self, service_uuid: &str) -> Option<(ServiceMember, u32)> {
        self.mounts.get(service_uuid)
    }
}
