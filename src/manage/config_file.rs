//! Config file versioning
//!
//! Config files are immutable. A file id encodes its version
//! (`{prefix}-{file_name}-{version}`); changing content means creating the
//! next version, repointing the owning ServiceAttr or ServiceMember with a
//! CAS update, then deleting the old version on a best-effort basis. A crash
//! or a failed delete leaves the old version behind for a sweeper.

use crate::common::{config_file_id, config_file_version, content_checksum, Error, Result};
use crate::metadata::{ConfigFile, ConfigId, MetadataStore, DEFAULT_FILE_MODE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Attempts at repointing an owner record before giving up
const MAX_REPOINT_ATTEMPTS: u32 = 3;

/// Requested content of one config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFileContent {
    pub file_name: String,
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    pub content: String,
}

fn default_file_mode() -> u32 {
    DEFAULT_FILE_MODE
}

impl ConfigFileContent {
    pub fn new(file_name: &str, content: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            file_mode: DEFAULT_FILE_MODE,
            content: content.to_string(),
        }
    }
}

pub struct ConfigVersioner {
    store: Arc<dyn MetadataStore>,
}

impl ConfigVersioner {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Create a config file, or accept an identical one left by an earlier
    /// attempt. Differing content under the same id is `ConfigMismatch`.
    pub async fn create_config_file(&self, cfg: &ConfigFile) -> Result<ConfigFile> {
        match self.store.create_config_file(cfg).await {
            Ok(()) => Ok(cfg.clone()),
            Err(Error::AlreadyExists(_)) => {
                let existing = self
                    .store
                    .get_config_file(&cfg.service_uuid, &cfg.file_id)
                    .await?;
                if !existing.same_content(cfg) {
                    tracing::error!(
                        "Config file {} exists with checksum {}, requested {}",
                        cfg.file_id,
                        existing.checksum,
                        cfg.checksum
                    );
                    return Err(Error::ConfigMismatch {
                        file_id: cfg.file_id.clone(),
                    });
                }
                tracing::info!("Config file {} already exists", cfg.file_id);
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    /// Create the next version of `old` carrying `new_content`
    pub async fn create_new_version(&self, old: &ConfigFile, new_content: &str) -> Result<ConfigFile> {
        let version = config_file_version(&old.file_id)?;
        let suffix = format!("-{}-{}", old.file_name, version);
        let prefix = old.file_id.strip_suffix(&suffix).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "config file id {} does not end with {}",
                old.file_id, suffix
            ))
        })?;

        let file_id = config_file_id(prefix, &old.file_name, version + 1);
        let mut next = ConfigFile::new(
            &old.service_uuid,
            &file_id,
            &old.file_name,
            old.file_mode,
            new_content,
        );
        next.revision = old.revision + 1;
        self.create_config_file(&next).await
    }

    /// Version 0 of each file, ids prefixed with `prefix` (service or member name)
    pub async fn create_initial_configs(
        &self,
        service_uuid: &str,
        prefix: &str,
        contents: &[ConfigFileContent],
    ) -> Result<Vec<ConfigId>> {
        let mut ids = Vec::with_capacity(contents.len());
        for c in contents {
            let cfg = ConfigFile::new(
                service_uuid,
                &config_file_id(prefix, &c.file_name, 0),
                &c.file_name,
                c.file_mode,
                &c.content,
            );
            ids.push(self.create_config_file(&cfg).await?.config_id());
        }
        Ok(ids)
    }

    /// Best-effort delete of a superseded version
    pub async fn delete_old_version(&self, old: &ConfigFile) {
        if let Err(e) = self
            .store
            .delete_config_file(&old.service_uuid, &old.file_id)
            .await
        {
            tracing::warn!(
                "Leaving old config file {} of {} behind: {}",
                old.file_id,
                old.service_uuid,
                e
            );
        }
    }

    /// Delete config files, ignoring ones already gone
    pub async fn delete_configs(&self, service_uuid: &str, configs: &[ConfigId]) -> Result<()> {
        for cfg in configs {
            match self.store.delete_config_file(service_uuid, &cfg.file_id).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Replace the content of a service-level config file
    pub async fn update_service_config(&self, service_uuid: &str, file_name: &str, content: &str) -> Result<ConfigFile> {
        let checksum = content_checksum(content);
        for attempt in 1..=MAX_REPOINT_ATTEMPTS {
            let attr = self.store.get_service_attr(service_uuid).await?;
            let (index, current) = find_config(&attr.service_configs, file_name, service_uuid)?;
            let old = self.store.get_config_file(service_uuid, &current.file_id).await?;
            if old.checksum == checksum {
                return Ok(old);
            }

            let next = self.create_new_version(&old, content).await?;
            let updated = attr.with_service_config(index, next.config_id());
            match self.store.update_service_attr(&attr, &updated).await {
                Ok(()) => {
                    tracing::info!(
                        "Service {} config {} now at {}",
                        service_uuid,
                        file_name,
                        next.file_id
                    );
                    self.delete_old_version(&old).await;
                    return Ok(next);
                }
                Err(Error::ConditionFailed(reason)) => {
                    tracing::warn!(
                        "Service attr {} changed while updating {} (attempt {}): {}",
                        service_uuid,
                        file_name,
                        attempt,
                        reason
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ConditionFailed(format!(
            "service attr {} kept changing while updating {}",
            service_uuid, file_name
        )))
    }

    /// Replace the content of one member's config file
    pub async fn update_member_config(
        &self,
        service_uuid: &str,
        member_index: u32,
        file_name: &str,
        content: &str,
    ) -> Result<ConfigFile> {
        let checksum = content_checksum(content);
        for attempt in 1..=MAX_REPOINT_ATTEMPTS {
            let member = self
                .store
                .get_service_member(service_uuid, member_index)
                .await?;
            let (index, current) = find_config(&member.configs, file_name, &member.member_name)?;
            let old = self.store.get_config_file(service_uuid, &current.file_id).await?;
            if old.checksum == checksum {
                return Ok(old);
            }

            let next = self.create_new_version(&old, content).await?;
            let updated = member.with_config(index, next.config_id());
            match self.store.update_service_member(&member, &updated).await {
                Ok(()) => {
                    tracing::info!(
                        "Member {} config {} now at {}",
                        member.member_name,
                        file_name,
                        next.file_id
                    );
                    self.delete_old_version(&old).await;
                    return Ok(next);
                }
                Err(Error::ConditionFailed(reason)) => {
                    tracing::warn!(
                        "Member {} changed while updating {} (attempt {}): {}",
                        member.member_name,
                        file_name,
                        attempt,
                        reason
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ConditionFailed(format!(
            "member {}/{} kept changing while updating {}",
            service_uuid, member_index, file_name
        )))
    }
}

fn find_config<'a>(configs: &'a [ConfigId], file_name: &str, owner: &str) -> Result<(usize, &'a ConfigId)> {
    configs
        .iter()
        .enumerate()
        .find(|(_, c)| c.file_name == file_name)
        .ok_or_else(|| Error::NotFound(format!("config {} of {}", file_name, owner)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MemStore, MemberVolumes, ServiceMember};

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = Arc::new(MemStore::new());
        let versioner = ConfigVersioner::new(store.clone());
        let cfg = ConfigFile::new("u1", "db-0-my.cnf-0", "my.cnf", DEFAULT_FILE_MODE, "port=3306");

        let first = versioner.create_config_file(&cfg).await.unwrap();
        let mut retry = cfg.clone();
        retry.last_modified += 5;
        let second = versioner.create_config_file(&retry).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_create_mismatch() {
        let store = Arc::new(MemStore::new());
        let versioner = ConfigVersioner::new(store);
        let cfg = ConfigFile::new("u1", "db-0-my.cnf-0", "my.cnf", DEFAULT_FILE_MODE, "port=3306");
        versioner.create_config_file(&cfg).await.unwrap();

        let other = ConfigFile::new("u1", "db-0-my.cnf-0", "my.cnf", DEFAULT_FILE_MODE, "port=3307");
        let err = versioner.create_config_file(&other).await.unwrap_err();
        assert!(matches!(err, Error::ConfigMismatch { .. }));
    }

    #[tokio::test]
    async fn test_new_version_round_trip() {
        let store = Arc::new(MemStore::new());
        let versioner = ConfigVersioner::new(store.clone());
        let v0 = versioner
            .create_config_file(&ConfigFile::new(
                "u1",
                "db-0-my.cnf-0",
                "my.cnf",
                DEFAULT_FILE_MODE,
                "a",
            ))
            .await
            .unwrap();

        let v1 = versioner.create_new_version(&v0, "b").await.unwrap();
        assert_eq!(v1.file_id, "db-0-my.cnf-1");
        assert_eq!(v1.revision, 1);

        let read = store.get_config_file("u1", &v1.file_id).await.unwrap();
        assert_eq!(read.checksum, content_checksum("b"));
        // old version stays readable until deleted
        assert_eq!(store.get_config_file("u1", &v0.file_id).await.unwrap(), v0);
    }

    #[tokio::test]
    async fn test_update_member_config_repoints_and_deletes_old() {
        let store = Arc::new(MemStore::new());
        let versioner = ConfigVersioner::new(store.clone());
        let ids = versioner
            .create_initial_configs("u1", "db-0", &[ConfigFileContent::new("my.cnf", "a")])
            .await
            .unwrap();
        let member = ServiceMember::new(
            "u1",
            0,
            "db-0",
            "az-1",
            None,
            MemberVolumes {
                primary_volume_id: "vol-1".into(),
                primary_device_name: "/dev/xvdf".into(),
                journal_volume_id: None,
                journal_device_name: None,
            },
            ids.clone(),
        );
        store.create_service_member(&member).await.unwrap();

        let next = versioner
            .update_member_config("u1", 0, "my.cnf", "b")
            .await
            .unwrap();
        assert_eq!(next.file_id, "db-0-my.cnf-1");

        let stored = store.get_service_member("u1", 0).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.configs[0], next.config_id());
        assert!(store
            .get_config_file("u1", &ids[0].file_id)
            .await
            .unwrap_err()
            .is_not_found());

        // same content again is a no-op
        let same = versioner
            .update_member_config("u1", 0, "my.cnf", "b")
            .await
            .unwrap();
        assert_eq!(same.file_id, next.file_id);
        assert_eq!(store.get_service_member("u1", 0).await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_file() {
        let store = Arc::new(MemStore::new());
        let versioner = ConfigVersioner::new(store);
        let err = versioner
            .update_service_config("missing", "my.cnf", "x")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
