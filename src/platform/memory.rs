//! In-process collaborators
//!
//! Loopback variants of the platform, volume, network and DNS contracts.
//! They keep just enough state to behave like the real services (volume
//! state transitions, IP uniqueness across interfaces) and expose a few
//! knobs for tests.

use super::{
    ContainerPlatform, CreateVolumeOptions, DnsService, NetworkInterface, NetworkProvider,
    VolumeInfo, VolumeProvider, VolumeState,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

fn locked<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| Error::Internal(format!("{} lock poisoned", what)))
}

// === Container platform ===

/// Running tasks keyed by (cluster, service) then container instance
#[derive(Default)]
pub struct MemPlatform {
    tasks: Mutex<HashMap<(String, String), HashMap<String, String>>>,
}

impl MemPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_task(&self, cluster: &str, service: &str, container_instance_id: &str, task_id: &str) -> Result<()> {
        locked(&self.tasks, "platform")?
            .entry((cluster.to_string(), service.to_string()))
            .or_default()
            .insert(container_instance_id.to_string(), task_id.to_string());
        Ok(())
    }

    pub fn stop_task(&self, cluster: &str, service: &str, container_instance_id: &str) -> Result<()> {
        if let Some(tasks) =
            locked(&self.tasks, "platform")?.get_mut(&(cluster.to_string(), service.to_string()))
        {
            tasks.remove(container_instance_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerPlatform for MemPlatform {
    async fn list_active_tasks(&self, cluster: &str, service: &str) -> Result<HashSet<String>> {
        Ok(locked(&self.tasks, "platform")?
            .get(&(cluster.to_string(), service.to_string()))
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_task_for_node(&self, cluster: &str, service: &str, container_instance_id: &str) -> Result<String> {
        locked(&self.tasks, "platform")?
            .get(&(cluster.to_string(), service.to_string()))
            .and_then(|tasks| tasks.get(container_instance_id).cloned())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no task of {}/{} on {}",
                    cluster, service, container_instance_id
                ))
            })
    }
}

// === Volumes ===

struct MemVolume {
    info: VolumeInfo,
    /// (target state, polls left before reaching it)
    pending: Option<(VolumeState, u32)>,
    stuck: bool,
}

/// Volumes with attach/detach transitions that settle after a fixed number
/// of state polls.
pub struct MemVolumes {
    volumes: Mutex<HashMap<String, MemVolume>>,
    failing_attach: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    transition_polls: u32,
}

impl Default for MemVolumes {
    fn default() -> Self {
        Self::new()
    }
}

impl MemVolumes {
    /// Transitions complete immediately
    pub fn new() -> Self {
        Self::with_transition_polls(0)
    }

    /// Attach/detach stay in `attaching`/`detaching` for `polls` state reads
    pub fn with_transition_polls(polls: u32) -> Self {
        Self {
            volumes: Mutex::new(HashMap::new()),
            failing_attach: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            transition_polls: polls,
        }
    }

    /// Keep the volume in its current transitional state forever
    pub fn set_stuck(&self, volume_id: &str) -> Result<()> {
        if let Some(vol) = locked(&self.volumes, "volumes")?.get_mut(volume_id) {
            vol.stuck = true;
        }
        Ok(())
    }

    /// Make every attach of this volume fail
    pub fn fail_attach(&self, volume_id: &str) -> Result<()> {
        locked(&self.failing_attach, "volumes")?.insert(volume_id.to_string());
        Ok(())
    }

    /// Instance the volume is attached to, if any
    pub fn attachment(&self, volume_id: &str) -> Result<Option<String>> {
        Ok(locked(&self.volumes, "volumes")?
            .get(volume_id)
            .and_then(|v| v.info.attached_instance.clone()))
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.lock().map(|v| v.len()).unwrap_or(0)
    }

    fn transition(&self, vol: &mut MemVolume, during: VolumeState, target: VolumeState) {
        if self.transition_polls == 0 {
            vol.info.state = target;
            vol.pending = None;
        } else {
            vol.info.state = during;
            vol.pending = Some((target, self.transition_polls));
        }
    }

    fn incorrect(vol: &MemVolume) -> Error {
        Error::IncorrectVolumeState {
            volume_id: vol.info.volume_id.clone(),
            state: vol.info.state.to_string(),
        }
    }
}

#[async_trait]
impl VolumeProvider for MemVolumes {
    async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<String> {
        let id = format!("vol-{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut vol = MemVolume {
            info: VolumeInfo {
                volume_id: id.clone(),
                state: VolumeState::Available,
                available_zone: opts.available_zone.clone(),
                attached_instance: None,
                device: None,
            },
            pending: None,
            stuck: false,
        };
        self.transition(&mut vol, VolumeState::Creating, VolumeState::Available);
        locked(&self.volumes, "volumes")?.insert(id.clone(), vol);
        Ok(id)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut volumes = locked(&self.volumes, "volumes")?;
        let vol = volumes
            .get(volume_id)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_id)))?;
        if !vol.info.state.is_free() {
            return Err(Self::incorrect(vol));
        }
        volumes.remove(volume_id);
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        if locked(&self.failing_attach, "volumes")?.contains(volume_id) {
            return Err(Error::Internal(format!("attach of {} rejected", volume_id)));
        }

        let mut volumes = locked(&self.volumes, "volumes")?;
        let vol = volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_id)))?;

        if vol.info.state.is_free() {
            vol.info.attached_instance = Some(instance_id.to_string());
            vol.info.device = Some(device.to_string());
            self.transition(vol, VolumeState::Attaching, VolumeState::InUse);
            return Ok(());
        }

        // bound volumes are rejected even for their current instance
        Err(Self::incorrect(vol))
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str, _device: &str) -> Result<()> {
        let mut volumes = locked(&self.volumes, "volumes")?;
        let vol = volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_id)))?;

        match vol.info.state {
            VolumeState::Detaching => Ok(()),
            s if s.is_bound() && vol.info.attached_instance.as_deref() == Some(instance_id) => {
                vol.info.attached_instance = None;
                vol.info.device = None;
                self.transition(vol, VolumeState::Detaching, VolumeState::Available);
                Ok(())
            }
            _ => Err(Self::incorrect(vol)),
        }
    }

    async fn get_volume_state(&self, volume_id: &str) -> Result<VolumeState> {
        let mut volumes = locked(&self.volumes, "volumes")?;
        let vol = volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_id)))?;

        if !vol.stuck {
            if let Some((target, left)) = vol.pending {
                if left <= 1 {
                    vol.info.state = target;
                    vol.pending = None;
                } else {
                    vol.pending = Some((target, left - 1));
                }
            }
        }
        Ok(vol.info.state)
    }

    async fn get_volume_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        locked(&self.volumes, "volumes")?
            .get(volume_id)
            .map(|v| v.info.clone())
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_id)))
    }
}

// === Network ===

#[derive(Default)]
struct NetworkState {
    interfaces: BTreeMap<String, NetworkInterface>,
    cidrs: HashMap<String, String>,
}

/// Network interfaces of a fleet, one per instance
#[derive(Default)]
pub struct MemNetwork {
    state: Mutex<NetworkState>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_zone_cidr(&self, zone: &str, cidr: &str) -> Result<()> {
        locked(&self.state, "network")?
            .cidrs
            .insert(zone.to_string(), cidr.to_string());
        Ok(())
    }

    pub fn add_interface(&self, iface: NetworkInterface) -> Result<()> {
        locked(&self.state, "network")?
            .interfaces
            .insert(iface.interface_id.clone(), iface);
        Ok(())
    }

    /// Interface currently holding the IP
    pub fn owner_of(&self, ip: &str) -> Result<Option<String>> {
        Ok(locked(&self.state, "network")?
            .interfaces
            .values()
            .find(|i| i.private_ips.iter().any(|p| p == ip))
            .map(|i| i.interface_id.clone()))
    }
}

#[async_trait]
impl NetworkProvider for MemNetwork {
    async fn assign_static_ip(&self, interface_id: &str, ip: &str) -> Result<()> {
        let mut state = locked(&self.state, "network")?;
        let taken = state.interfaces.values().any(|i| {
            i.interface_id != interface_id
                && (i.primary_private_ip == ip || i.private_ips.iter().any(|p| p == ip))
        });
        if taken {
            return Err(Error::Internal(format!(
                "ip {} is assigned to another interface",
                ip
            )));
        }

        let iface = state
            .interfaces
            .get_mut(interface_id)
            .ok_or_else(|| Error::NotFound(format!("interface {}", interface_id)))?;
        if !iface.private_ips.iter().any(|p| p == ip) {
            iface.private_ips.push(ip.to_string());
        }
        Ok(())
    }

    async fn unassign_static_ip(&self, interface_id: &str, ip: &str) -> Result<()> {
        let mut state = locked(&self.state, "network")?;
        if let Some(iface) = state.interfaces.get_mut(interface_id) {
            iface.private_ips.retain(|p| p != ip);
        }
        Ok(())
    }

    async fn get_instance_network_interface(&self, instance_id: &str) -> Result<NetworkInterface> {
        locked(&self.state, "network")?
            .interfaces
            .values()
            .find(|i| i.server_instance_id == instance_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("interface of instance {}", instance_id)))
    }

    async fn get_network_interfaces(&self, _cluster: &str, zone: &str) -> Result<(Vec<NetworkInterface>, String)> {
        let state = locked(&self.state, "network")?;
        let cidr = state
            .cidrs
            .get(zone)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cidr of zone {}", zone)))?;
        let ifaces = state
            .interfaces
            .values()
            .filter(|i| i.available_zone == zone)
            .cloned()
            .collect();
        Ok((ifaces, cidr))
    }
}

// === DNS ===

#[derive(Default)]
struct DnsState {
    zones: HashMap<String, String>,
    records: HashMap<(String, String), String>,
}

/// Hosted zones and A records; local lookups see updates immediately
#[derive(Default)]
pub struct MemDns {
    state: Mutex<DnsState>,
}

impl MemDns {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DnsService for MemDns {
    async fn get_or_create_hosted_zone(&self, domain: &str) -> Result<String> {
        let mut state = locked(&self.state, "dns")?;
        let next = state.zones.len() + 1;
        Ok(state
            .zones
            .entry(domain.to_string())
            .or_insert_with(|| format!("zone-{}", next))
            .clone())
    }

    async fn update_record(&self, name: &str, ip: &str, zone_id: &str) -> Result<()> {
        locked(&self.state, "dns")?
            .records
            .insert((zone_id.to_string(), name.to_string()), ip.to_string());
        Ok(())
    }

    async fn get_record(&self, name: &str, zone_id: &str) -> Result<String> {
        locked(&self.state, "dns")?
            .records
            .get(&(zone_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("dns record {}", name)))
    }

    async fn delete_record(&self, name: &str, zone_id: &str) -> Result<()> {
        locked(&self.state, "dns")?
            .records
            .remove(&(zone_id.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("dns record {}", name)))
    }

    async fn lookup_local(&self, name: &str) -> Result<String> {
        locked(&self.state, "dns")?
            .records
            .iter()
            .find(|((_, n), _)| n == name)
            .map(|(_, ip)| ip.clone())
            .ok_or_else(|| Error::NotFound(format!("dns record {}", name)))
    }
}
