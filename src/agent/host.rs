//! Host-level operations: filesystems and local IP addresses
//!
//! The command-backed variants shell out to `blkid`, `mkfs`, `mount`,
//! `umount` and `ip`. The in-memory variants record calls for tests.

use crate::common::{AgentConfig, Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;

#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Does the device carry a filesystem signature?
    async fn is_formatted(&self, device: &str) -> Result<bool>;
    async fn format(&self, device: &str) -> Result<()>;
    /// Mount `device` at `path`, creating the directory
    async fn mount(&self, device: &str, path: &Path) -> Result<()>;
    /// Unmount `path` and remove the directory; a path that is not mounted is fine
    async fn unmount(&self, path: &Path) -> Result<()>;
    /// Is some device mounted at `path`?
    async fn is_mounted(&self, path: &Path) -> Result<bool>;
}

#[async_trait]
pub trait HostNetwork: Send + Sync {
    async fn add_ip(&self, ip: &str) -> Result<()>;
    async fn delete_ip(&self, ip: &str) -> Result<()>;
}

async fn run(program: &str, args: &[&str]) -> Result<Output> {
    tracing::debug!("Running {} {}", program, args.join(" "));
    Ok(tokio::process::Command::new(program)
        .args(args)
        .output()
        .await?)
}

fn command_error(program: &str, args: &[&str], output: &Output) -> Error {
    Error::Command {
        command: format!("{} {}", program, args.join(" ")),
        output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

// === Command-backed ===

pub struct CommandFilesystem {
    fs_type: String,
    mkfs_command: String,
    mount_options: String,
}

impl CommandFilesystem {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            fs_type: config.fs_type.clone(),
            mkfs_command: config.mkfs_command.clone(),
            mount_options: config.mount_options.clone(),
        }
    }
}

#[async_trait]
impl Filesystem for CommandFilesystem {
    async fn is_formatted(&self, device: &str) -> Result<bool> {
        let args = ["-p", "-u", "filesystem", device];
        let output = run("blkid", &args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            // blkid exits 2 when no signature is found
            Some(2) => Ok(false),
            _ => Err(command_error("blkid", &args, &output)),
        }
    }

    async fn format(&self, device: &str) -> Result<()> {
        let args = [device];
        let output = run(&self.mkfs_command, &args).await?;
        if !output.status.success() {
            return Err(command_error(&self.mkfs_command, &args, &output));
        }
        tracing::info!("Formatted {} as {}", device, self.fs_type);
        Ok(())
    }

    async fn mount(&self, device: &str, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        let target = path.to_string_lossy();
        let args = ["-t", &self.fs_type, "-o", &self.mount_options, device, &target];
        let output = run("mount", &args).await?;
        if !output.status.success() {
            return Err(command_error("mount", &args, &output));
        }
        tracing::info!("Mounted {} at {}", device, target);
        Ok(())
    }

    async fn unmount(&self, path: &Path) -> Result<()> {
        // nothing can be mounted on a missing path
        if !tokio::fs::try_exists(path).await? {
            return Ok(());
        }

        let target = path.to_string_lossy();
        let args = [target.as_ref()];
        let output = run("umount", &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not mounted") && !stderr.contains("no mount point") {
                return Err(command_error("umount", &args, &output));
            }
        }

        match tokio::fs::remove_dir(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Unmounted {}", target);
        Ok(())
    }

    async fn is_mounted(&self, path: &Path) -> Result<bool> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        let target = path.to_string_lossy();
        let args = ["-q", target.as_ref()];
        let output = run("mountpoint", &args).await?;
        Ok(output.status.success())
    }
}

pub struct CommandHostNetwork {
    interface: String,
}

impl CommandHostNetwork {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            interface: config.network_interface.clone(),
        }
    }
}

#[async_trait]
impl HostNetwork for CommandHostNetwork {
    async fn add_ip(&self, ip: &str) -> Result<()> {
        let addr = format!("{}/32", ip);
        let args = ["addr", "add", addr.as_str(), "dev", self.interface.as_str()];
        let output = run("ip", &args).await?;
        if !output.status.success() && !String::from_utf8_lossy(&output.stderr).contains("File exists") {
            return Err(command_error("ip", &args, &output));
        }
        Ok(())
    }

    async fn delete_ip(&self, ip: &str) -> Result<()> {
        let addr = format!("{}/32", ip);
        let args = ["addr", "del", addr.as_str(), "dev", self.interface.as_str()];
        let output = run("ip", &args).await?;
        if !output.status.success()
            && !String::from_utf8_lossy(&output.stderr).contains("Cannot assign requested address")
        {
            return Err(command_error("ip", &args, &output));
        }
        Ok(())
    }
}

// === In-memory ===

#[derive(Default)]
struct FsState {
    formatted: HashSet<String>,
    mounts: HashMap<PathBuf, String>,
    format_count: usize,
}

#[derive(Default)]
pub struct MemFilesystem {
    state: Mutex<FsState>,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device mounted at `path`
    pub fn mounted(&self, path: &Path) -> Option<String> {
        self.state.lock().ok()?.mounts.get(path).cloned()
    }

    pub fn mount_count(&self) -> usize {
        self.state.lock().map(|s| s.mounts.len()).unwrap_or(0)
    }

    pub fn format_count(&self) -> usize {
        self.state.lock().map(|s| s.format_count).unwrap_or(0)
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, FsState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("filesystem lock poisoned".into()))
    }
}

#[async_trait]
impl Filesystem for MemFilesystem {
    async fn is_formatted(&self, device: &str) -> Result<bool> {
        Ok(self.state()?.formatted.contains(device))
    }

    async fn format(&self, device: &str) -> Result<()> {
        let mut state = self.state()?;
        state.formatted.insert(device.to_string());
        state.format_count += 1;
        Ok(())
    }

    async fn mount(&self, device: &str, path: &Path) -> Result<()> {
        let mut state = self.state()?;
        if let Some(existing) = state.mounts.get(path) {
            return Err(Error::Command {
                command: format!("mount {} {}", device, path.display()),
                output: format!("{} already mounted", existing),
            });
        }
        state.mounts.insert(path.to_path_buf(), device.to_string());
        Ok(())
    }

    async fn unmount(&self, path: &Path) -> Result<()> {
        self.state()?.mounts.remove(path);
        Ok(())
    }

    async fn is_mounted(&self, path: &Path) -> Result<bool> {
        Ok(self.state()?.mounts.contains_key(path))
    }
}

#[derive(Default)]
pub struct MemHostNetwork {
    ips: Mutex<HashSet<String>>,
}

impl MemHostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.ips.lock().map(|ips| ips.contains(ip)).unwrap_or(false)
    }
}

#[async_trait]
impl HostNetwork for MemHostNetwork {
    async fn add_ip(&self, ip: &str) -> Result<()> {
        self.ips
            .lock()
            .map_err(|_| Error::Internal("host network lock poisoned".into()))?
            .insert(ip.to_string());
        Ok(())
    }

    async fn delete_ip(&self, ip: &str) -> Result<()> {
        self.ips
            .lock()
            .map_err(|_| Error::Internal("host network lock poisoned".into()))?
            .remove(ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_filesystem() {
        let fs = MemFilesystem::new();
        assert!(!fs.is_formatted("/dev/xvdf").await.unwrap());
        fs.format("/dev/xvdf").await.unwrap();
        assert!(fs.is_formatted("/dev/xvdf").await.unwrap());

        let path = Path::new("/mnt/stateplane/u1");
        fs.mount("/dev/xvdf", path).await.unwrap();
        assert!(fs.mount("/dev/xvdg", path).await.is_err());
        assert_eq!(fs.mounted(path).as_deref(), Some("/dev/xvdf"));
        assert!(fs.is_mounted(path).await.unwrap());

        fs.unmount(path).await.unwrap();
        fs.unmount(path).await.unwrap();
        assert_eq!(fs.mount_count(), 0);
    }

    #[tokio::test]
    async fn test_command_unmount_missing_dir() {
        // umount of a path that was never mounted is tolerated
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("never-mounted");
        let fs = CommandFilesystem::new(&AgentConfig::default());
        fs.unmount(&path).await.unwrap();
        assert!(!path.exists());
        assert!(!fs.is_mounted(&path).await.unwrap());
    }
}
