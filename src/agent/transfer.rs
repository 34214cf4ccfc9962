//! Moving a member's volumes to this node
//!
//! Per volume: detach from whoever holds it, attach here, wait until the
//! provider reports it in use. Volumes already attached to this node are
//! left alone. Only then is the new owner written to the member record,
//! with a CAS update. Losing that update means another node claimed the
//! member first; the volumes are left as they are and the next transfer
//! reads their real state from the provider again.

use crate::common::{poll_until, Error, PollPolicy, Result};
use crate::metadata::{MemberVolumes, MetadataStore, ServiceMember};
use crate::platform::{LocalNode, VolumeProvider, VolumeState};
use std::sync::Arc;

/// A member taken over by this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// The member as stored after the claim
    pub member: ServiceMember,
    /// `(volume_id, device)` pairs this claim attached; volumes that were
    /// already attached here are not listed
    pub attached: Vec<(String, String)>,
}

pub struct OwnershipTransfer {
    store: Arc<dyn MetadataStore>,
    volumes: Arc<dyn VolumeProvider>,
    poll: PollPolicy,
}

impl OwnershipTransfer {
    pub fn new(store: Arc<dyn MetadataStore>, volumes: Arc<dyn VolumeProvider>, poll: PollPolicy) -> Self {
        Self { store, volumes, poll }
    }

    /// Attach the member's volumes to `node` and record `task_id` on this
    /// node as the owner.
    pub async fn take_ownership(&self, member: &ServiceMember, task_id: &str, node: &LocalNode) -> Result<Claim> {
        let instance = node.server_instance_id.as_str();

        let mut to_attach = Vec::new();
        for (volume_id, device) in member.volumes.attachments() {
            let already_here = self
                .detach_from_last_owner(volume_id, device, member, instance)
                .await?;
            if !already_here {
                to_attach.push((volume_id.to_string(), device.to_string()));
            }
        }
        self.attach_volumes(&member.volumes, &to_attach, instance)
            .await?;

        if member.task_id == task_id
            && member.container_instance_id == node.container_instance_id
            && member.server_instance_id == instance
        {
            return Ok(Claim {
                member: member.clone(),
                attached: to_attach,
            });
        }

        let updated = member.with_owner(task_id, &node.container_instance_id, instance);
        self.store.update_service_member(member, &updated).await?;
        tracing::info!(
            "Member {} now owned by task {} on {} (was {} on {})",
            member.member_name,
            task_id,
            instance,
            member.task_id,
            member.server_instance_id
        );
        Ok(Claim {
            member: updated,
            attached: to_attach,
        })
    }

    /// Free the volume for `local_instance`. Returns true when it is
    /// already attached there.
    async fn detach_from_last_owner(
        &self,
        volume_id: &str,
        device: &str,
        member: &ServiceMember,
        local_instance: &str,
    ) -> Result<bool> {
        let info = self.volumes.get_volume_info(volume_id).await?;
        match info.state {
            VolumeState::Available | VolumeState::Detached => Ok(false),
            VolumeState::Detaching => self.wait_detached(volume_id).await.map(|()| false),
            VolumeState::InUse | VolumeState::Attached | VolumeState::Attaching => {
                // the provider's view wins over the record, which may be stale
                let holder = info.attached_instance.clone().or_else(|| {
                    member
                        .has_server_owner()
                        .then(|| member.server_instance_id.clone())
                });
                let Some(holder) = holder else {
                    return Err(Error::IncorrectVolumeState {
                        volume_id: volume_id.to_string(),
                        state: format!("{} with no known holder", info.state),
                    });
                };
                if holder == local_instance {
                    tracing::info!("Volume {} already attached to {}", volume_id, holder);
                    return Ok(true);
                }

                tracing::info!("Detaching volume {} {} from {}", volume_id, device, holder);
                match self.volumes.detach_volume(volume_id, &holder, device).await {
                    Ok(()) | Err(Error::IncorrectVolumeState { .. }) => {}
                    Err(e) => return Err(e),
                }
                self.wait_detached(volume_id).await.map(|()| false)
            }
            VolumeState::Creating | VolumeState::Error => Err(Error::IncorrectVolumeState {
                volume_id: volume_id.to_string(),
                state: info.state.to_string(),
            }),
        }
    }

    /// Attach `to_attach`, then wait for every volume of the member to be
    /// in use. A failure detaches what this call attached and nothing else.
    async fn attach_volumes(
        &self,
        volumes: &MemberVolumes,
        to_attach: &[(String, String)],
        instance: &str,
    ) -> Result<()> {
        let mut attached = Vec::with_capacity(to_attach.len());
        for (volume_id, device) in to_attach {
            if let Err(e) = self.volumes.attach_volume(volume_id, instance, device).await {
                tracing::error!("Attaching {} to {} failed: {}", volume_id, instance, e);
                self.detach_volumes(&attached, instance).await;
                return Err(e);
            }
            attached.push((volume_id.clone(), device.clone()));
        }

        for (volume_id, _) in volumes.attachments() {
            if let Err(e) = self.wait_attached(volume_id).await {
                tracing::error!("Volume {} did not attach to {}: {}", volume_id, instance, e);
                self.detach_volumes(&attached, instance).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Best-effort detach of the given `(volume_id, device)` pairs, not waited on
    pub async fn detach_volumes(&self, attached: &[(String, String)], instance: &str) {
        for (volume_id, device) in attached {
            match self.volumes.detach_volume(volume_id, instance, device).await {
                Ok(()) => tracing::info!("Detaching volume {} from {}", volume_id, instance),
                Err(e) => tracing::warn!("Detach of {} from {} failed: {}", volume_id, instance, e),
            }
        }
    }

    /// Best-effort detach of all of a member's volumes, not waited on
    pub async fn detach_member_volumes(&self, volumes: &MemberVolumes, instance: &str) {
        let all: Vec<(String, String)> = volumes
            .attachments()
            .into_iter()
            .map(|(v, d)| (v.to_string(), d.to_string()))
            .collect();
        self.detach_volumes(&all, instance).await;
    }

    async fn wait_detached(&self, volume_id: &str) -> Result<()> {
        let what = format!("volume {} detached", volume_id);
        poll_until(&self.poll, &what, || async {
            match self.volumes.get_volume_state(volume_id).await? {
                s if s.is_free() => Ok(true),
                VolumeState::Error => Err(Error::IncorrectVolumeState {
                    volume_id: volume_id.to_string(),
                    state: VolumeState::Error.to_string(),
                }),
                _ => Ok(false),
            }
        })
        .await
    }

    async fn wait_attached(&self, volume_id: &str) -> Result<()> {
        let what = format!("volume {} attached", volume_id);
        poll_until(&self.poll, &what, || async {
            match self.volumes.get_volume_state(volume_id).await? {
                VolumeState::InUse | VolumeState::Attached => Ok(true),
                VolumeState::Error => Err(Error::IncorrectVolumeState {
                    volume_id: volume_id.to_string(),
                    state: VolumeState::Error.to_string(),
                }),
                _ => Ok(false),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MemStore, VolumeSpec};
    use crate::platform::{CreateVolumeOptions, MemVolumes};

    fn node(n: u32) -> LocalNode {
        LocalNode {
            cluster_name: "c1".into(),
            server_instance_id: format!("i-{}", n),
            container_instance_id: format!("ci-{}", n),
            available_zone: "az-1".into(),
            private_ip: format!("10.0.0.{}", 10 + n),
        }
    }

    async fn setup(journal: bool) -> (Arc<MemStore>, Arc<MemVolumes>, ServiceMember) {
        let store = Arc::new(MemStore::new());
        let vols = Arc::new(MemVolumes::with_transition_polls(1));
        let opts = CreateVolumeOptions {
            available_zone: "az-1".into(),
            spec: VolumeSpec {
                volume_type: "gp2".into(),
                size_gb: 1,
                iops: 0,
                encrypted: false,
            },
            tag: "db-0".into(),
        };
        let primary = vols.create_volume(&opts).await.unwrap();
        vols.get_volume_state(&primary).await.unwrap();
        let journal_id = if journal {
            let id = vols.create_volume(&opts).await.unwrap();
            vols.get_volume_state(&id).await.unwrap();
            Some(id)
        } else {
            None
        };

        let member = ServiceMember::new(
            "u1",
            0,
            "db-0",
            "az-1",
            None,
            MemberVolumes {
                primary_volume_id: primary,
                primary_device_name: "/dev/xvdf".into(),
                journal_device_name: journal_id.as_ref().map(|_| "/dev/xvdg".to_string()),
                journal_volume_id: journal_id,
            },
            vec![],
        );
        store.create_service_member(&member).await.unwrap();
        (store, vols, member)
    }

    fn transfer(store: &Arc<MemStore>, vols: &Arc<MemVolumes>) -> OwnershipTransfer {
        OwnershipTransfer::new(store.clone(), vols.clone(), PollPolicy::new(1, 20))
    }

    #[tokio::test]
    async fn test_first_claim_attaches_and_records_owner() {
        let (store, vols, member) = setup(true).await;
        let claim = transfer(&store, &vols)
            .take_ownership(&member, "t-1", &node(1))
            .await
            .unwrap();
        let owned = claim.member;

        assert_eq!(owned.revision, 1);
        assert_eq!(owned.server_instance_id, "i-1");
        assert_eq!(claim.attached.len(), 2);
        assert_eq!(store.get_service_member("u1", 0).await.unwrap(), owned);
        for (vol, _) in owned.volumes.attachments() {
            assert_eq!(vols.attachment(vol).unwrap().as_deref(), Some("i-1"));
        }
    }

    #[tokio::test]
    async fn test_moves_volumes_from_previous_owner() {
        let (store, vols, member) = setup(true).await;
        let t = transfer(&store, &vols);
        let on_one = t.take_ownership(&member, "t-1", &node(1)).await.unwrap().member;

        let on_two = t.take_ownership(&on_one, "t-2", &node(2)).await.unwrap().member;
        assert_eq!(on_two.revision, 2);
        assert_eq!(on_two.container_instance_id, "ci-2");
        for (vol, _) in on_two.volumes.attachments() {
            assert_eq!(vols.attachment(vol).unwrap().as_deref(), Some("i-2"));
        }
    }

    #[tokio::test]
    async fn test_repeat_claim_on_same_node_is_noop() {
        let (store, vols, member) = setup(false).await;
        let t = transfer(&store, &vols);
        let owned = t.take_ownership(&member, "t-1", &node(1)).await.unwrap().member;
        let again = t.take_ownership(&owned, "t-1", &node(1)).await.unwrap();
        assert_eq!(again.member.revision, owned.revision);
        assert!(again.attached.is_empty());
    }

    #[tokio::test]
    async fn test_new_task_on_same_node_keeps_volumes() {
        let (store, vols, member) = setup(true).await;
        let t = transfer(&store, &vols);
        let owned = t.take_ownership(&member, "t-1", &node(1)).await.unwrap().member;

        // attaching the journal again would be rejected; it must not be tried
        let journal = owned.volumes.journal_volume_id.clone().unwrap();
        vols.fail_attach(&journal).unwrap();

        let claim = t.take_ownership(&owned, "t-2", &node(1)).await.unwrap();
        assert!(claim.attached.is_empty());
        assert_eq!(claim.member.task_id, "t-2");
        assert_eq!(claim.member.revision, owned.revision + 1);
        for (vol, _) in owned.volumes.attachments() {
            assert_eq!(vols.attachment(vol).unwrap().as_deref(), Some("i-1"));
        }
    }

    #[tokio::test]
    async fn test_claim_with_some_volumes_already_local() {
        let (store, vols, member) = setup(true).await;
        let primary = member.volumes.primary_volume_id.clone();
        let journal = member.volumes.journal_volume_id.clone().unwrap();

        // primary is already here, journal is still held by node 2
        vols.attach_volume(&primary, "i-1", "/dev/xvdf").await.unwrap();
        vols.attach_volume(&journal, "i-2", "/dev/xvdg").await.unwrap();

        let claim = transfer(&store, &vols)
            .take_ownership(&member, "t-1", &node(1))
            .await
            .unwrap();
        assert_eq!(claim.attached, vec![(journal.clone(), "/dev/xvdg".to_string())]);
        assert_eq!(vols.attachment(&primary).unwrap().as_deref(), Some("i-1"));
        assert_eq!(vols.attachment(&journal).unwrap().as_deref(), Some("i-1"));
    }

    #[tokio::test]
    async fn test_rollback_keeps_volumes_that_were_already_local() {
        let (store, vols, member) = setup(true).await;
        let primary = member.volumes.primary_volume_id.clone();
        let journal = member.volumes.journal_volume_id.clone().unwrap();

        vols.attach_volume(&primary, "i-1", "/dev/xvdf").await.unwrap();
        vols.attach_volume(&journal, "i-2", "/dev/xvdg").await.unwrap();
        vols.fail_attach(&journal).unwrap();

        let err = transfer(&store, &vols)
            .take_ownership(&member, "t-1", &node(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        // the journal left node 2 but never arrived; the primary was not touched
        assert_eq!(vols.attachment(&primary).unwrap().as_deref(), Some("i-1"));
        assert!(vols.attachment(&journal).unwrap().is_none());
        assert_eq!(store.get_service_member("u1", 0).await.unwrap().revision, 0);
    }

    #[tokio::test]
    async fn test_racing_claims_have_one_winner() {
        let (store, vols, member) = setup(false).await;
        let t = transfer(&store, &vols);

        // both nodes selected the same snapshot of the member
        let first = t.take_ownership(&member, "t-1", &node(1)).await;
        let second = t.take_ownership(&member, "t-2", &node(2)).await;

        assert!(first.is_ok());
        assert!(second.unwrap_err().is_condition_failed());
        let stored = store.get_service_member("u1", 0).await.unwrap();
        assert_eq!(stored.task_id, "t-1");
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn test_attach_failure_rolls_back_primary() {
        let (store, vols, member) = setup(true).await;
        let journal = member.volumes.journal_volume_id.clone().unwrap();
        vols.fail_attach(&journal).unwrap();

        let err = transfer(&store, &vols)
            .take_ownership(&member, "t-1", &node(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        // primary was detached again and the record is untouched
        let primary = &member.volumes.primary_volume_id;
        assert!(vols.attachment(primary).unwrap().is_none());
        assert_eq!(store.get_service_member("u1", 0).await.unwrap().revision, 0);
    }

    #[tokio::test]
    async fn test_stuck_attach_times_out() {
        let (store, vols, member) = setup(false).await;
        let t = OwnershipTransfer::new(store.clone(), vols.clone(), PollPolicy::new(1, 3));
        let primary = member.volumes.primary_volume_id.clone();

        vols.attach_volume(&primary, "i-1", "/dev/xvdf").await.unwrap();
        vols.set_stuck(&primary).unwrap();

        // held in attaching by i-1; node 2 cannot get it free in time
        let err = t.take_ownership(&member, "t-2", &node(2)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(store.get_service_member("u1", 0).await.unwrap().revision, 0);
    }
}
