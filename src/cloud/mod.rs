//! The cloud capability the scheduler consumes: quota, flavors, spawning and
//! remote execution. The provider's own API lives behind these traits; the
//! manager only ever sees `Quota`, `Flavor` and `Host`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone)]
pub enum CloudError {
    #[error("no server flavor can satisfy the request")]
    NoFlavor,
    #[error("deploy failed: {0}")]
    Deploy(String),
    #[error("quota lookup failed: {0}")]
    Quota(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("remote command failed: {0}")]
    Exec(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("host already destroyed")]
    Destroyed,
}

/// Project resource limits and current consumption. A zero maximum means the
/// dimension is unlimited; callers substitute a large sentinel.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Quota {
    pub max_instances: u64,
    pub max_cores: u64,
    pub max_ram_mb: u64,
    pub max_volume_gb: u64,
    pub used_instances: u64,
    pub used_cores: u64,
    pub used_ram_mb: u64,
    pub used_volume_gb: u64,
}

/// A VM shape offered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub cores: u64,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

/// What `deploy` must set up (idempotently, against the provider's saved
/// state file): keypair, security group with these ports, subnet and DNS.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub required_ports: Vec<u16>,
    pub cidr: String,
    pub gateway_ip: String,
    pub dns_name_servers: Vec<String>,
}

/// Everything needed to bring up one server.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub os_prefix: String,
    pub user: String,
    pub flavor_id: String,
    /// Disk the job needs; a volume is attached when the flavor's own disk
    /// is smaller.
    pub disk_gb: u64,
    pub keep_time: Duration,
    pub head_node: bool,
    pub post_creation_script: Vec<u8>,
}

/// Command execution and file transfer on a spawned server, typically over
/// SSH. Implemented by the provider.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run_cmd(&self, cmd: &str, background: bool) -> Result<String, CloudError>;
    async fn upload_file(&self, local: &Path, remote: &Path) -> Result<(), CloudError>;
    /// Tear the server down at the provider.
    async fn destroy(&self) -> Result<(), CloudError>;
}

#[derive(Default)]
struct Used {
    cores: u64,
    ram_mb: u64,
    disk_gb: u64,
}

/// A compute target: the local host or a spawned server, with bookkeeping of
/// the resources currently promised to commands.
pub struct Host {
    pub id: String,
    pub ip: String,
    pub os: String,
    pub flavor: Flavor,
    /// Usable disk; the flavor's own, or the attached volume when larger.
    pub disk_gb: u64,
    keep_time: Duration,
    used: Mutex<Used>,
    idle_since: Mutex<Option<Instant>>,
    destroyed: AtomicBool,
    remote: Option<Arc<dyn RemoteExec>>,
}

impl Host {
    pub fn new(
        id: impl Into<String>,
        ip: impl Into<String>,
        os: impl Into<String>,
        flavor: Flavor,
        disk_gb: u64,
        keep_time: Duration,
        remote: Option<Arc<dyn RemoteExec>>,
    ) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            os: os.into(),
            flavor,
            disk_gb,
            keep_time,
            used: Mutex::new(Used::default()),
            idle_since: Mutex::new(Some(Instant::now())),
            destroyed: AtomicBool::new(false),
            remote,
        }
    }

    /// How many commands with these needs fit in the space not already
    /// promised away. Zero-valued request dimensions don't constrain.
    pub fn has_space_for(&self, cores: u64, ram_mb: u64, disk_gb: u64) -> u64 {
        if self.destroyed() {
            return 0;
        }
        let used = self.used.lock().unwrap();
        let avail_cores = self.flavor.cores.saturating_sub(used.cores);
        let avail_ram = self.flavor.ram_mb.saturating_sub(used.ram_mb);
        let avail_disk = self.disk_gb.saturating_sub(used.disk_gb);
        if avail_cores < cores || avail_ram < ram_mb || avail_disk < disk_gb {
            return 0;
        }
        let mut can = u64::MAX;
        if cores > 0 {
            can = can.min(avail_cores / cores);
        }
        if ram_mb > 0 {
            can = can.min(avail_ram / ram_mb);
        }
        if disk_gb > 0 {
            can = can.min(avail_disk / disk_gb);
        }
        if can == u64::MAX {
            // nothing constrained; at least one fits
            can = 1;
        }
        can
    }

    /// Promise resources to a command about to run here.
    pub fn allocate(&self, cores: u64, ram_mb: u64, disk_gb: u64) {
        let mut used = self.used.lock().unwrap();
        used.cores += cores;
        used.ram_mb += ram_mb;
        used.disk_gb += disk_gb;
        *self.idle_since.lock().unwrap() = None;
    }

    /// Return resources after a command finishes.
    pub fn release(&self, cores: u64, ram_mb: u64, disk_gb: u64) {
        let mut used = self.used.lock().unwrap();
        used.cores = used.cores.saturating_sub(cores);
        used.ram_mb = used.ram_mb.saturating_sub(ram_mb);
        used.disk_gb = used.disk_gb.saturating_sub(disk_gb);
        if used.cores == 0 && used.ram_mb == 0 && used.disk_gb == 0 {
            *self.idle_since.lock().unwrap() = Some(Instant::now());
        }
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Idle past its keep time, so due for garbage collection.
    pub fn expired(&self) -> bool {
        if self.keep_time.is_zero() {
            return false;
        }
        self.idle_since
            .lock()
            .unwrap()
            .is_some_and(|since| since.elapsed() >= self.keep_time)
    }

    pub async fn run_cmd(&self, cmd: &str, background: bool) -> Result<String, CloudError> {
        if self.destroyed() {
            return Err(CloudError::Destroyed);
        }
        match &self.remote {
            Some(remote) => remote.run_cmd(cmd, background).await,
            None => Err(CloudError::Exec(format!(
                "host {} has no remote execution channel",
                self.id
            ))),
        }
    }

    pub async fn upload_file(&self, local: &Path, remote_path: &Path) -> Result<(), CloudError> {
        if self.destroyed() {
            return Err(CloudError::Destroyed);
        }
        match &self.remote {
            Some(remote) => remote.upload_file(local, remote_path).await,
            None => Err(CloudError::Upload(format!(
                "host {} has no remote execution channel",
                self.id
            ))),
        }
    }

    /// Mark destroyed and tear the server down at the provider. Safe to call
    /// twice; the second call is a no-op.
    pub async fn destroy(&self) -> Result<(), CloudError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(remote) = &self.remote {
            remote.destroy().await?;
        }
        Ok(())
    }
}

/// An OpenStack-like cloud, as far as the scheduler is concerned.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create keypair, security group, subnet and DNS, idempotently against
    /// the provider's saved state file.
    async fn deploy(&self, cfg: &DeployConfig) -> Result<(), CloudError>;

    async fn get_quota(&self) -> Result<Quota, CloudError>;

    /// The smallest (cheapest) flavor with at least this many cores and RAM
    /// whose name matches `regex` (empty = no restriction).
    async fn cheapest_server_flavor(
        &self,
        cores: u64,
        ram_mb: u64,
        regex: &str,
    ) -> Result<Flavor, CloudError>;

    /// Bring up a server. Blocking; may take minutes.
    async fn spawn(&self, req: &SpawnRequest) -> Result<Arc<Host>, CloudError>;

    /// Remove everything `deploy` created.
    async fn tear_down(&self) -> Result<(), CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flavor(cores: u64, ram_mb: u64, disk_gb: u64) -> Flavor {
        Flavor {
            id: "f".to_string(),
            name: "f".to_string(),
            cores,
            ram_mb,
            disk_gb,
        }
    }

    #[tokio::test]
    async fn space_accounting() {
        let host = Host::new(
            "h1",
            "10.0.0.2",
            "ubuntu",
            flavor(8, 16000, 100),
            100,
            Duration::ZERO,
            None,
        );
        assert_eq!(host.has_space_for(2, 4000, 0), 4);
        host.allocate(6, 4000, 0);
        assert_eq!(host.has_space_for(2, 4000, 0), 1);
        host.allocate(2, 4000, 0);
        assert_eq!(host.has_space_for(2, 4000, 0), 0);
        host.release(8, 8000, 0);
        assert_eq!(host.has_space_for(2, 4000, 0), 2);
    }

    #[tokio::test]
    async fn destroyed_host_has_no_space() {
        let host = Host::new(
            "h1",
            "10.0.0.2",
            "ubuntu",
            flavor(8, 16000, 100),
            100,
            Duration::ZERO,
            None,
        );
        host.destroy().await.unwrap();
        assert!(host.destroyed());
        assert_eq!(host.has_space_for(1, 0, 0), 0);
        assert!(matches!(
            host.run_cmd("true", false).await,
            Err(CloudError::Destroyed)
        ));
    }
}
