//! Picking the member a task on this node should become
//!
//! A member is idle when its recorded task is not among the platform's
//! active tasks. The choice prefers members already tied to this node so
//! volumes and IPs that are local stay local.

use crate::common::{member_index_from_name, Error, Result};
use crate::metadata::{MetadataStore, ServiceAttr, ServiceMember};
use crate::platform::{ContainerPlatform, LocalNode, NetworkProvider};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

pub struct MemberSelector {
    store: Arc<dyn MetadataStore>,
    platform: Arc<dyn ContainerPlatform>,
    network: Arc<dyn NetworkProvider>,
    node: LocalNode,
}

impl MemberSelector {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        platform: Arc<dyn ContainerPlatform>,
        network: Arc<dyn NetworkProvider>,
        node: LocalNode,
    ) -> Self {
        Self {
            store,
            platform,
            network,
            node,
        }
    }

    /// Member for a task of `attr` starting on this node.
    ///
    /// `requested` names a specific member (`{service}-{index}`), as
    /// platforms with stable ordinals do.
    pub async fn select_member(&self, attr: &ServiceAttr, requested: Option<&str>) -> Result<ServiceMember> {
        if let Some(name) = requested {
            let index = member_index_from_name(name)?;
            let member = self.store.get_service_member(&attr.service_uuid, index).await?;
            if member.member_name != name {
                return Err(Error::InvalidArgument(format!(
                    "member {} of service {} is named {}",
                    index, attr.service_name, member.member_name
                )));
            }
            return Ok(member);
        }

        let active = self
            .platform
            .list_active_tasks(&attr.cluster_name, &attr.service_name)
            .await?;
        let members = self.store.list_service_members(&attr.service_uuid).await?;

        let local_ips: HashSet<String> = if attr.require_static_ip {
            self.network
                .get_instance_network_interface(&self.node.server_instance_id)
                .await?
                .private_ips
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };

        let start = if members.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..members.len())
        };

        match choose_member(&members, &active, &local_ips, &self.node, start) {
            Some(i) => {
                let member = &members[i];
                tracing::info!(
                    "Selected member {} of service {} (task {})",
                    member.member_name,
                    attr.service_name,
                    member.task_id
                );
                Ok(member.clone())
            }
            None => Err(Error::NoIdleMember(format!(
                "all {} members of {} are owned by active tasks",
                members.len(),
                attr.service_name
            ))),
        }
    }
}

/// Index of the chosen member. First match wins:
///
/// 1. a member whose task is active on this node's container instance
/// 2. an idle member last owned by this container instance
/// 3. an idle member whose static IP is on this node's interface
/// 4. any idle member, scanning circularly from `start`
///
/// Rules 2-4 only consider members in the node's zone.
pub fn choose_member(
    members: &[ServiceMember],
    active: &HashSet<String>,
    local_ips: &HashSet<String>,
    node: &LocalNode,
    start: usize,
) -> Option<usize> {
    let on_node = |m: &ServiceMember| m.container_instance_id == node.container_instance_id;

    if let Some(i) = members
        .iter()
        .position(|m| active.contains(&m.task_id) && on_node(m))
    {
        return Some(i);
    }

    let idle = |m: &ServiceMember| {
        !active.contains(&m.task_id) && m.available_zone == node.available_zone
    };

    if let Some(i) = members.iter().position(|m| idle(m) && on_node(m)) {
        return Some(i);
    }

    if !local_ips.is_empty() {
        let found = members.iter().position(|m| {
            idle(m) && m.static_ip.as_ref().is_some_and(|ip| local_ips.contains(ip))
        });
        if found.is_some() {
            return found;
        }
    }

    let n = members.len();
    (0..n).map(|k| (start + k) % n).find(|&i| idle(&members[i]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MemStore, MemberVolumes, ServiceStatus, ServiceVolumes, VolumeSpec};
    use crate::platform::{MemNetwork, MemPlatform, NetworkInterface};

    fn node() -> LocalNode {
        LocalNode {
            cluster_name: "c1".into(),
            server_instance_id: "i-local".into(),
            container_instance_id: "ci-local".into(),
            available_zone: "az-1".into(),
            private_ip: "10.0.0.4".into(),
        }
    }

    fn member(index: u32, zone: &str) -> ServiceMember {
        ServiceMember::new(
            "u1",
            index,
            &format!("db-{}", index),
            zone,
            None,
            MemberVolumes {
                primary_volume_id: format!("vol-{}", index),
                primary_device_name: "/dev/xvdf".into(),
                journal_volume_id: None,
                journal_device_name: None,
            },
            vec![],
        )
    }

    fn owned(index: u32, task: &str, ci: &str) -> ServiceMember {
        member(index, "az-1").with_owner(task, ci, &format!("i-{}", ci))
    }

    fn attr(require_static_ip: bool) -> ServiceAttr {
        ServiceAttr {
            service_uuid: "u1".into(),
            status: ServiceStatus::Active,
            revision: 0,
            last_modified: 0,
            replicas: 3,
            cluster_name: "c1".into(),
            service_name: "db".into(),
            volumes: ServiceVolumes {
                primary_device_name: "/dev/xvdf".into(),
                primary: VolumeSpec {
                    volume_type: "gp2".into(),
                    size_gb: 1,
                    iops: 0,
                    encrypted: false,
                },
                journal_device_name: None,
                journal: None,
            },
            register_dns: true,
            domain_name: "c1-stateplane.com".into(),
            hosted_zone_id: "zone-1".into(),
            require_static_ip,
            service_configs: vec![],
        }
    }

    #[test]
    fn test_prefers_local_idle_member() {
        let members = vec![
            owned(0, "t-0", "ci-a"),
            owned(1, "t-1", "ci-b"),
            owned(2, "t-2", "ci-local"),
            owned(3, "t-3", "ci-c"),
        ];
        let active = HashSet::new();
        for start in 0..members.len() {
            assert_eq!(
                choose_member(&members, &active, &HashSet::new(), &node(), start),
                Some(2)
            );
        }
    }

    #[test]
    fn test_active_task_on_local_node_is_reused() {
        let members = vec![member(0, "az-1"), owned(1, "t-1", "ci-local")];
        let active: HashSet<String> = ["t-1".to_string()].into();
        assert_eq!(
            choose_member(&members, &active, &HashSet::new(), &node(), 0),
            Some(1)
        );
    }

    #[test]
    fn test_static_ip_affinity() {
        let mut m0 = owned(0, "t-0", "ci-a");
        m0.static_ip = Some("10.0.0.5".into());
        let mut m1 = owned(1, "t-1", "ci-b");
        m1.static_ip = Some("10.0.0.6".into());
        let members = vec![m0, m1];
        let local: HashSet<String> = ["10.0.0.6".to_string()].into();
        assert_eq!(
            choose_member(&members, &HashSet::new(), &local, &node(), 0),
            Some(1)
        );
    }

    #[test]
    fn test_zone_filter_and_exhaustion() {
        let members = vec![member(0, "az-2"), owned(1, "t-1", "ci-b")];
        let active: HashSet<String> = ["t-1".to_string()].into();
        assert_eq!(
            choose_member(&members, &active, &HashSet::new(), &node(), 0),
            None
        );
    }

    #[test]
    fn test_random_start_spreads_choice() {
        let members: Vec<_> = (0..4).map(|i| member(i, "az-1")).collect();
        let picks: HashSet<usize> = (0..4)
            .filter_map(|start| choose_member(&members, &HashSet::new(), &HashSet::new(), &node(), start))
            .collect();
        assert_eq!(picks.len(), 4);
    }

    #[tokio::test]
    async fn test_select_member_paths() {
        let store = Arc::new(MemStore::new());
        let platform = Arc::new(MemPlatform::new());
        let network = Arc::new(MemNetwork::new());
        network
            .add_interface(NetworkInterface {
                interface_id: "eni-local".into(),
                server_instance_id: "i-local".into(),
                available_zone: "az-1".into(),
                primary_private_ip: "10.0.0.4".into(),
                private_ips: vec![],
            })
            .unwrap();

        let m0 = owned(0, "t-0", "ci-a");
        let m1 = owned(1, "t-1", "ci-b");
        store.create_service_member(&m0).await.unwrap();
        store.create_service_member(&m1).await.unwrap();
        platform.start_task("c1", "db", "ci-a", "t-0").unwrap();

        let selector = MemberSelector::new(store, platform.clone(), network, node());
        let picked = selector.select_member(&attr(true), None).await.unwrap();
        assert_eq!(picked.member_index, 1);

        let named = selector.select_member(&attr(false), Some("db-0")).await.unwrap();
        assert_eq!(named.member_index, 0);
        assert!(selector
            .select_member(&attr(false), Some("db-7"))
            .await
            .unwrap_err()
            .is_not_found());

        platform.start_task("c1", "db", "ci-b", "t-1").unwrap();
        let err = selector.select_member(&attr(false), None).await.unwrap_err();
        assert!(matches!(err, Error::NoIdleMember(_)));
    }
}
