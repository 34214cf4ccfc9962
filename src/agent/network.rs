//! Static IP and DNS handoff for a member moving to this node

use super::host::HostNetwork;
use crate::common::{dns_name, poll_until, Error, PollPolicy, Result};
use crate::metadata::{MetadataStore, ServiceAttr, ServiceMember};
use crate::platform::{DnsService, LocalNode, NetworkProvider};
use std::sync::Arc;

pub struct ServiceNetwork {
    store: Arc<dyn MetadataStore>,
    network: Arc<dyn NetworkProvider>,
    dns: Arc<dyn DnsService>,
    host: Arc<dyn HostNetwork>,
    node: LocalNode,
    dns_poll: PollPolicy,
}

impl ServiceNetwork {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        network: Arc<dyn NetworkProvider>,
        dns: Arc<dyn DnsService>,
        host: Arc<dyn HostNetwork>,
        node: LocalNode,
        dns_poll: PollPolicy,
    ) -> Self {
        Self {
            store,
            network,
            dns,
            host,
            node,
            dns_poll,
        }
    }

    /// Bring the member's static IP onto this node's interface.
    ///
    /// IPs of the same service left on the interface by an earlier failed
    /// handoff are removed first. When the IP had to be moved, waits until
    /// the member's DNS name resolves to it.
    pub async fn reconcile_static_ip(&self, attr: &ServiceAttr, member: &ServiceMember) -> Result<String> {
        let ip = member.static_ip.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!("member {} has no static ip", member.member_name))
        })?;
        let iface = self
            .network
            .get_instance_network_interface(&self.node.server_instance_id)
            .await?;

        for local_ip in iface.private_ips.iter().filter(|p| p.as_str() != ip) {
            match self.store.get_service_static_ip(local_ip).await {
                Ok(record) if record.service_uuid == member.service_uuid => {
                    tracing::warn!(
                        "Removing dangling ip {} of service {} from {}",
                        local_ip,
                        attr.service_name,
                        iface.interface_id
                    );
                    if let Err(e) = self
                        .network
                        .unassign_static_ip(&iface.interface_id, local_ip)
                        .await
                    {
                        tracing::warn!("Unassigning {} failed: {}", local_ip, e);
                    }
                    if let Err(e) = self.host.delete_ip(local_ip).await {
                        tracing::warn!("Deleting {} from host failed: {}", local_ip, e);
                    }
                }
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => tracing::warn!("Reading static ip {} failed: {}", local_ip, e),
            }
        }

        let record = self.store.get_service_static_ip(ip).await?;

        if iface.private_ips.iter().any(|p| p == ip) {
            if record.network_interface_id != iface.interface_id
                || record.server_instance_id != self.node.server_instance_id
            {
                let fixed = record.with_owner(&self.node.server_instance_id, &iface.interface_id);
                self.store.update_service_static_ip(&record, &fixed).await?;
                tracing::info!("Fixed owner of static ip {} to {}", ip, iface.interface_id);
            }
            return Ok(ip.to_string());
        }

        if record.network_interface_id != iface.interface_id {
            self.network
                .unassign_static_ip(&record.network_interface_id, ip)
                .await?;
        }
        self.network
            .assign_static_ip(&iface.interface_id, ip)
            .await?;
        let moved = record.with_owner(&self.node.server_instance_id, &iface.interface_id);
        self.store.update_service_static_ip(&record, &moved).await?;
        tracing::info!(
            "Moved static ip {} of {} from {} to {}",
            ip,
            member.member_name,
            record.network_interface_id,
            iface.interface_id
        );

        self.wait_dns(&dns_name(&member.member_name, &attr.domain_name), ip)
            .await?;
        Ok(ip.to_string())
    }

    /// Point the member's DNS name at this node and wait until it resolves
    pub async fn update_dns(&self, attr: &ServiceAttr, member: &ServiceMember) -> Result<String> {
        let name = dns_name(&member.member_name, &attr.domain_name);
        self.dns
            .update_record(&name, &self.node.private_ip, &attr.hosted_zone_id)
            .await?;
        self.wait_dns(&name, &self.node.private_ip).await?;
        tracing::info!("DNS {} now points to {}", name, self.node.private_ip);
        Ok(name)
    }

    async fn wait_dns(&self, name: &str, ip: &str) -> Result<()> {
        let what = format!("dns {} resolving to {}", name, ip);
        poll_until(&self.dns_poll, &what, || async {
            match self.dns.lookup_local(name).await {
                Ok(resolved) => Ok(resolved == ip),
                Err(Error::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }
}
