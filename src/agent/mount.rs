//! Node-local bookkeeping of mounted services
//!
//! The table mutex only guards the map and is never held across I/O.
//! Slow work for one service is serialized by that service's own async
//! lock, so unrelated services never wait on each other.

use crate::common::{Error, Result};
use crate::metadata::ServiceMember;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub fn primary_mount_path(root: &Path, service_uuid: &str) -> PathBuf {
    root.join(service_uuid)
}

pub fn journal_mount_path(root: &Path, service_uuid: &str) -> PathBuf {
    root.join(format!("journal-{}", service_uuid))
}

#[derive(Debug, Clone)]
struct Mounted {
    member: ServiceMember,
    refs: u32,
}

/// Outcome of dropping one reference
#[derive(Debug)]
pub enum Release {
    NotMounted,
    StillInUse(u32),
    /// Last reference gone; the entry was removed
    Last(ServiceMember),
}

#[derive(Default)]
pub struct MountTable {
    mounted: Mutex<HashMap<String, Mounted>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock serializing mount and unmount of one service on this node
    pub fn service_lock(&self, service_uuid: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Internal("service lock table poisoned".into()))?;
        Ok(locks.entry(service_uuid.to_string()).or_default().clone())
    }

    /// Take another reference on a mounted service
    pub fn acquire(&self, service_uuid: &str) -> Result<Option<ServiceMember>> {
        Ok(self.table()?.get_mut(service_uuid).map(|m| {
            m.refs += 1;
            m.member.clone()
        }))
    }

    /// Record a fresh mount holding one reference
    pub fn insert(&self, member: ServiceMember) -> Result<()> {
        self.table()?
            .insert(member.service_uuid.clone(), Mounted { member, refs: 1 });
        Ok(())
    }

    pub fn release(&self, service_uuid: &str) -> Result<Release> {
        let mut table = self.table()?;
        let Some(entry) = table.get_mut(service_uuid) else {
            return Ok(Release::NotMounted);
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(Release::StillInUse(entry.refs));
        }
        Ok(table
            .remove(service_uuid)
            .map(|m| Release::Last(m.member))
            .unwrap_or(Release::NotMounted))
    }

    /// Mounted member and its reference count
    pub fn get(&self, service_uuid: &str) -> Option<(ServiceMember, u32)> {
        let table = self.mounted.lock().ok()?;
        table
            .get(service_uuid)
            .map(|m| (m.member.clone(), m.refs))
    }

    pub fn len(&self) -> usize {
        self.mounted.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<String, Mounted>>> {
        self.mounted
            .lock()
            .map_err(|_| Error::Internal("mount table poisoned".into()))
    }
}
