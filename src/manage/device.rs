//! Block-device path allocation
//!
//! Paths follow `/dev/xvdf` .. `/dev/xvdz`, `/dev/xvdba` .. `/dev/xvdbz`,
//! `/dev/xvdca` .. `/dev/xvdcz`. The next path is derived from the Device
//! records already in the store, never from process-local counters, so any
//! number of orchestrators can allocate concurrently; the create-if-absent
//! write decides who gets a slot.

use crate::common::{Error, Result};
use crate::metadata::{Device, MetadataStore};
use std::sync::Arc;

pub const DEVICE_PREFIX: &str = "/dev/xvd";
pub const FIRST_DEVICE: &str = "/dev/xvdf";
pub const LAST_DEVICE: &str = "/dev/xvdcz";

/// Device path following `last` in the allocation sequence
pub fn next_device_name(last: &str) -> Result<String> {
    let invalid = || Error::InvalidArgument(format!("invalid device name: {}", last));
    let suffix = last.strip_prefix(DEVICE_PREFIX).ok_or_else(invalid)?;

    let next = match suffix.as_bytes() {
        [c] if (b'f'..b'z').contains(c) => vec![c + 1],
        [b'z'] => vec![b'b', b'a'],
        [hi, lo] if (b'b'..=b'c').contains(hi) && (b'a'..b'z').contains(lo) => vec![*hi, lo + 1],
        [b'b', b'z'] => vec![b'c', b'a'],
        [b'c', b'z'] => {
            return Err(Error::ResourceExhausted(format!(
                "device names exhausted after {}",
                LAST_DEVICE
            )))
        }
        _ => return Err(invalid()),
    };

    let next = String::from_utf8(next).map_err(|_| invalid())?;
    Ok(format!("{}{}", DEVICE_PREFIX, next))
}

pub struct DeviceAllocator {
    store: Arc<dyn MetadataStore>,
    max_retry_count: u32,
}

impl DeviceAllocator {
    pub fn new(store: Arc<dyn MetadataStore>, max_retry_count: u32) -> Self {
        Self {
            store,
            max_retry_count,
        }
    }

    /// Reserve a device path for `service` in `cluster`.
    ///
    /// Returns the service's existing device when one is already recorded
    /// (other than `exclude`), so retries converge on the same path. A
    /// service name that differs only by case from an existing one is
    /// rejected with `ServiceExists`.
    pub async fn allocate_device(&self, cluster: &str, service: &str, exclude: Option<&str>) -> Result<String> {
        for attempt in 1..=self.max_retry_count {
            let devs = self.store.list_devices(cluster).await?;

            let owned = devs
                .iter()
                .filter(|d| Some(d.device_name.as_str()) != exclude)
                .find(|d| d.service_name == service);
            if let Some(dev) = owned {
                tracing::info!(
                    "Device {} already assigned to {}/{}",
                    dev.device_name,
                    cluster,
                    service
                );
                return Ok(dev.device_name.clone());
            }

            if let Some(clash) = devs
                .iter()
                .find(|d| d.service_name != service && d.service_name.eq_ignore_ascii_case(service))
            {
                return Err(Error::ServiceExists(format!(
                    "{} conflicts with existing service {}",
                    service, clash.service_name
                )));
            }

            // `exclude` is already in `devs`, so the successor of the last device is past it
            let next = match devs.last() {
                Some(last) => next_device_name(&last.device_name)?,
                None => FIRST_DEVICE.to_string(),
            };

            let dev = Device {
                cluster_name: cluster.to_string(),
                device_name: next.clone(),
                service_name: service.to_string(),
            };
            match self.store.create_device(&dev).await {
                Ok(()) => {
                    tracing::info!("Assigned device {} to {}/{}", next, cluster, service);
                    return Ok(next);
                }
                Err(Error::AlreadyExists(_)) => {
                    tracing::warn!(
                        "Device {} taken concurrently (attempt {}), retrying",
                        next,
                        attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Internal(format!(
            "could not allocate a device for {}/{} after {} attempts",
            cluster, service, self.max_retry_count
        )))
    }

    /// Remove every Device record of a service. Missing records are fine.
    pub async fn release_devices(&self, cluster: &str, service: &str) -> Result<()> {
        for dev in self.store.list_devices(cluster).await? {
            if dev.service_name != service {
                continue;
            }
            match self.store.delete_device(cluster, &dev.device_name).await {
                Ok(()) | Err(Error::NotFound(_)) => {
                    tracing::info!("Released device {} of {}/{}", dev.device_name, cluster, service)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemStore;

    fn allocator(store: Arc<MemStore>) -> DeviceAllocator {
        DeviceAllocator::new(store, 3)
    }

    #[test]
    fn test_next_device_name() {
        assert_eq!(next_device_name("/dev/xvdf").unwrap(), "/dev/xvdg");
        assert_eq!(next_device_name("/dev/xvdz").unwrap(), "/dev/xvdba");
        assert_eq!(next_device_name("/dev/xvdbk").unwrap(), "/dev/xvdbl");
        assert_eq!(next_device_name("/dev/xvdbz").unwrap(), "/dev/xvdca");
        assert!(matches!(
            next_device_name(LAST_DEVICE),
            Err(Error::ResourceExhausted(_))
        ));
        assert!(matches!(
            next_device_name("/dev/sda"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(next_device_name("/dev/xvda").is_err());
        assert!(next_device_name("/dev/xvdda").is_err());
    }

    #[test]
    fn test_sequence_length() {
        let mut names = vec![FIRST_DEVICE.to_string()];
        while let Ok(next) = next_device_name(names.last().unwrap()) {
            names.push(next);
        }
        // f..z, ba..bz, ca..cz
        assert_eq!(names.len(), 21 + 26 + 26);
        assert_eq!(names.last().unwrap(), LAST_DEVICE);
    }

    #[tokio::test]
    async fn test_sequential_allocations_follow_sequence() {
        let store = Arc::new(MemStore::new());
        let alloc = allocator(store.clone());

        let mut expected = vec![FIRST_DEVICE.to_string()];
        for _ in 1..30 {
            let next = next_device_name(expected.last().unwrap()).unwrap();
            expected.push(next);
        }

        let mut got = Vec::new();
        for i in 0..30 {
            got.push(
                alloc
                    .allocate_device("c1", &format!("svc{}", i), None)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_allocation_is_idempotent_per_service() {
        let store = Arc::new(MemStore::new());
        let alloc = allocator(store.clone());

        let primary = alloc.allocate_device("c1", "db", None).await.unwrap();
        let journal = alloc
            .allocate_device("c1", "db", Some(&primary))
            .await
            .unwrap();
        assert_eq!(primary, "/dev/xvdf");
        assert_eq!(journal, "/dev/xvdg");

        // retry after a crash converges on the same paths
        assert_eq!(alloc.allocate_device("c1", "db", None).await.unwrap(), primary);
        assert_eq!(
            alloc.allocate_device("c1", "db", Some(&primary)).await.unwrap(),
            journal
        );
        assert_eq!(store.list_devices("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_journal_device_after_other_services() {
        let store = Arc::new(MemStore::new());
        let alloc = allocator(store.clone());

        let primary = alloc.allocate_device("c1", "db", None).await.unwrap();
        alloc.allocate_device("c1", "cache", None).await.unwrap();
        let journal = alloc
            .allocate_device("c1", "db", Some(&primary))
            .await
            .unwrap();
        assert_eq!(journal, "/dev/xvdh");
        assert_ne!(journal, primary);
    }

    #[tokio::test]
    async fn test_case_insensitive_clash() {
        let store = Arc::new(MemStore::new());
        let alloc = allocator(store);
        alloc.allocate_device("c1", "MyDB", None).await.unwrap();
        let err = alloc.allocate_device("c1", "mydb", None).await.unwrap_err();
        assert!(matches!(err, Error::ServiceExists(_)));
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let store = Arc::new(MemStore::new());
        store
            .create_device(&Device {
                cluster_name: "c1".into(),
                device_name: LAST_DEVICE.into(),
                service_name: "old".into(),
            })
            .await
            .unwrap();
        let err = allocator(store).allocate_device("c1", "db", None).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_clusters_are_independent() {
        let store = Arc::new(MemStore::new());
        let alloc = allocator(store);
        assert_eq!(alloc.allocate_device("c1", "db", None).await.unwrap(), FIRST_DEVICE);
        assert_eq!(alloc.allocate_device("c2", "db", None).await.unwrap(), FIRST_DEVICE);
    }

    #[tokio::test]
    async fn test_release_devices() {
        let store = Arc::new(MemStore::new());
        let alloc = allocator(store.clone());
        let primary = alloc.allocate_device("c1", "db", None).await.unwrap();
        alloc.allocate_device("c1", "db", Some(&primary)).await.unwrap();
        alloc.allocate_device("c1", "other", None).await.unwrap();

        alloc.release_devices("c1", "db").await.unwrap();
        let left = store.list_devices("c1").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].service_name, "other");
    }
}
