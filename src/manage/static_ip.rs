//! Static IP pool for services that need stable member addresses
//!
//! IPs are secondary private IPs on the cluster's network interfaces. Each
//! one gets a ServiceStaticIp record naming the service and the interface
//! currently holding it. Creation is resumable: IPs left on interfaces by an
//! interrupted attempt are picked up again before new ones are drawn from
//! the zone's CIDR block.

use crate::common::{next_ip, Error, Result};
use crate::metadata::{MetadataStore, ServiceStaticIp};
use crate::platform::{NetworkInterface, NetworkProvider};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct StaticIpAllocator {
    store: Arc<dyn MetadataStore>,
    network: Arc<dyn NetworkProvider>,
    max_retry_count: u32,
    /// One allocation at a time per process; interfaces are shared
    lock: Mutex<()>,
}

impl StaticIpAllocator {
    pub fn new(store: Arc<dyn MetadataStore>, network: Arc<dyn NetworkProvider>, max_retry_count: u32) -> Self {
        Self {
            store,
            network,
            max_retry_count,
            lock: Mutex::new(()),
        }
    }

    /// Reserve `count` static IPs for `service_uuid` in `zone`.
    ///
    /// `in_use` holds IPs already bound to existing members; those are
    /// never handed out again.
    pub async fn create_static_ips(
        &self,
        cluster: &str,
        service_uuid: &str,
        zone: &str,
        count: usize,
        in_use: &HashSet<String>,
    ) -> Result<Vec<ServiceStaticIp>> {
        let _guard = self.lock.lock().await;

        let (mut ifaces, cidr) = self.network.get_network_interfaces(cluster, zone).await?;
        if ifaces.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "no network interface in zone {} of cluster {}",
                zone, cluster
            )));
        }

        let mut ips = self
            .reusable_ips(service_uuid, zone, &ifaces, count, in_use)
            .await?;
        if ips.len() == count {
            return Ok(ips);
        }

        let mut used: HashSet<Ipv4Addr> = ifaces
            .iter()
            .flat_map(|i| std::iter::once(&i.primary_private_ip).chain(i.private_ips.iter()))
            .filter_map(|ip| ip.parse().ok())
            .collect();
        used.extend(in_use.iter().filter_map(|ip| ip.parse::<Ipv4Addr>().ok()));

        // least loaded interfaces first, then round robin
        ifaces.sort_by_key(|i| i.private_ips.len());
        let mut last: Option<Ipv4Addr> = None;
        let mut failures = 0u32;
        let mut slot = 0usize;

        while ips.len() < count {
            let iface = &ifaces[slot % ifaces.len()];
            let ip = next_ip(&cidr, last, &used)?;
            last = Some(ip);
            used.insert(ip);
            let ip = ip.to_string();

            if let Err(e) = self.network.assign_static_ip(&iface.interface_id, &ip).await {
                failures += 1;
                tracing::warn!(
                    "Assigning {} to {} failed ({}/{}): {}",
                    ip,
                    iface.interface_id,
                    failures,
                    self.max_retry_count,
                    e
                );
                if failures >= self.max_retry_count {
                    return Err(e);
                }
                continue;
            }

            let record = ServiceStaticIp {
                static_ip: ip.clone(),
                revision: 0,
                service_uuid: service_uuid.to_string(),
                available_zone: zone.to_string(),
                server_instance_id: iface.server_instance_id.clone(),
                network_interface_id: iface.interface_id.clone(),
            };
            match self.claim_record(&record).await? {
                Some(claimed) => {
                    tracing::info!(
                        "Assigned static ip {} to service {} on {}",
                        ip,
                        service_uuid,
                        iface.interface_id
                    );
                    ips.push(claimed);
                    slot += 1;
                }
                None => {
                    // record belongs to someone else; give the address back
                    if let Err(e) = self.network.unassign_static_ip(&iface.interface_id, &ip).await {
                        tracing::warn!("Unassigning foreign ip {} failed: {}", ip, e);
                    }
                }
            }
        }

        Ok(ips)
    }

    /// IPs already on interfaces that this service may take: ones without a
    /// record (adopted) and ones recorded for this service but not yet bound
    /// to a member.
    async fn reusable_ips(
        &self,
        service_uuid: &str,
        zone: &str,
        ifaces: &[NetworkInterface],
        count: usize,
        in_use: &HashSet<String>,
    ) -> Result<Vec<ServiceStaticIp>> {
        let mut out = Vec::new();
        for iface in ifaces {
            for ip in &iface.private_ips {
                if out.len() == count {
                    return Ok(out);
                }
                if in_use.contains(ip) {
                    continue;
                }

                let record = match self.store.get_service_static_ip(ip).await {
                    Ok(record) if record.service_uuid == service_uuid => record,
                    Ok(_) => continue,
                    Err(Error::NotFound(_)) => ServiceStaticIp {
                        static_ip: ip.clone(),
                        revision: 0,
                        service_uuid: service_uuid.to_string(),
                        available_zone: zone.to_string(),
                        server_instance_id: iface.server_instance_id.clone(),
                        network_interface_id: iface.interface_id.clone(),
                    },
                    Err(e) => return Err(e),
                };

                if let Some(claimed) = self.claim_record(&record).await? {
                    tracing::info!("Reusing static ip {} for service {}", ip, service_uuid);
                    out.push(self.fix_owner(claimed, iface).await?);
                }
            }
        }
        Ok(out)
    }

    /// Create the record, or accept an existing one of the same service.
    /// `None` when the IP is recorded for another service.
    async fn claim_record(&self, record: &ServiceStaticIp) -> Result<Option<ServiceStaticIp>> {
        match self.store.create_service_static_ip(record).await {
            Ok(()) => Ok(Some(record.clone())),
            Err(Error::AlreadyExists(_)) => {
                let existing = self.store.get_service_static_ip(&record.static_ip).await?;
                if existing.service_uuid == record.service_uuid {
                    Ok(Some(existing))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn fix_owner(&self, record: ServiceStaticIp, iface: &NetworkInterface) -> Result<ServiceStaticIp> {
        if record.network_interface_id == iface.interface_id
            && record.server_instance_id == iface.server_instance_id
        {
            return Ok(record);
        }
        let fixed = record.with_owner(&iface.server_instance_id, &iface.interface_id);
        self.store.update_service_static_ip(&record, &fixed).await?;
        Ok(fixed)
    }

    /// Unassign an IP from its interface and drop its record
    pub async fn delete_static_ip(&self, ip: &str) -> Result<()> {
        let record = match self.store.get_service_static_ip(ip).await {
            Ok(record) => record,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        self.network
            .unassign_static_ip(&record.network_interface_id, ip)
            .await?;
        match self.store.delete_service_static_ip(ip).await {
            Ok(()) | Err(Error::NotFound(_)) => {
                tracing::info!("Deleted static ip {} of service {}", ip, record.service_uuid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemStore;
    use crate::platform::MemNetwork;

    fn network() -> Arc<MemNetwork> {
        let net = MemNetwork::new();
        net.set_zone_cidr("az-1", "10.0.0.0/24").unwrap();
        for (id, inst, primary) in [("eni-1", "i-1", "10.0.0.4"), ("eni-2", "i-2", "10.0.0.9")] {
            net.add_interface(NetworkInterface {
                interface_id: id.into(),
                server_instance_id: inst.into(),
                available_zone: "az-1".into(),
                primary_private_ip: primary.into(),
                private_ips: vec![],
            })
            .unwrap();
        }
        Arc::new(net)
    }

    #[tokio::test]
    async fn test_allocates_round_robin_from_cidr() {
        let store = Arc::new(MemStore::new());
        let net = network();
        let alloc = StaticIpAllocator::new(store.clone(), net.clone(), 3);

        let ips = alloc
            .create_static_ips("c1", "u1", "az-1", 3, &HashSet::new())
            .await
            .unwrap();
        let addrs: Vec<&str> = ips.iter().map(|r| r.static_ip.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.5", "10.0.0.6", "10.0.0.7"]);

        // spread over both interfaces
        let owners: HashSet<String> = ips.iter().map(|r| r.network_interface_id.clone()).collect();
        assert_eq!(owners.len(), 2);
        for r in &ips {
            assert_eq!(
                net.owner_of(&r.static_ip).unwrap().as_deref(),
                Some(r.network_interface_id.as_str())
            );
            assert_eq!(store.get_service_static_ip(&r.static_ip).await.unwrap(), *r);
        }
    }

    #[tokio::test]
    async fn test_resume_reuses_assigned_ips() {
        let store = Arc::new(MemStore::new());
        let net = network();
        let alloc = StaticIpAllocator::new(store.clone(), net.clone(), 3);

        let first = alloc
            .create_static_ips("c1", "u1", "az-1", 2, &HashSet::new())
            .await
            .unwrap();
        // an interrupted CreateService asks again for the same members
        let again = alloc
            .create_static_ips("c1", "u1", "az-1", 2, &HashSet::new())
            .await
            .unwrap();
        let a: HashSet<_> = first.iter().map(|r| r.static_ip.clone()).collect();
        let b: HashSet<_> = again.iter().map(|r| r.static_ip.clone()).collect();
        assert_eq!(a, b);

        // bound IPs are skipped
        let more = alloc.create_static_ips("c1", "u1", "az-1", 1, &a).await.unwrap();
        assert!(!a.contains(&more[0].static_ip));
    }

    #[tokio::test]
    async fn test_other_service_ips_untouched() {
        let store = Arc::new(MemStore::new());
        let net = network();
        let alloc = StaticIpAllocator::new(store.clone(), net.clone(), 3);

        let theirs = alloc
            .create_static_ips("c1", "u-other", "az-1", 1, &HashSet::new())
            .await
            .unwrap();
        let ours = alloc
            .create_static_ips("c1", "u1", "az-1", 1, &HashSet::new())
            .await
            .unwrap();
        assert_ne!(theirs[0].static_ip, ours[0].static_ip);
    }

    #[tokio::test]
    async fn test_delete_static_ip() {
        let store = Arc::new(MemStore::new());
        let net = network();
        let alloc = StaticIpAllocator::new(store.clone(), net.clone(), 3);
        let ips = alloc
            .create_static_ips("c1", "u1", "az-1", 1, &HashSet::new())
            .await
            .unwrap();
        let ip = &ips[0].static_ip;

        alloc.delete_static_ip(ip).await.unwrap();
        assert!(net.owner_of(ip).unwrap().is_none());
        assert!(store.get_service_static_ip(ip).await.unwrap_err().is_not_found());
        // second delete is a no-op
        alloc.delete_static_ip(ip).await.unwrap();
    }
}
