//! Scheduling on this host alone: a single synthetic "localhost" entry sized
//! from detected memory, CPU count and free disk, with commands run through
//! the configured shell.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::cloud::{Flavor, Host};
use crate::error::{DroverError, Result};
use crate::job::Requirements;

use super::SchedulerBackend;

const GB: u64 = 1_073_741_824;

pub struct LocalBackend {
    shell: String,
    host: Arc<Host>,
}

impl LocalBackend {
    /// Size the localhost entry from the running machine.
    pub fn new(shell: impl Into<String>) -> Result<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        let ram_mb = proc_meminfo_mb()?;
        let disk_gb = disk_available_gb(Path::new("."))?;
        Ok(Self::with_resources(shell, cores, ram_mb, disk_gb))
    }

    /// Explicit sizing, for tests and constrained deployments.
    pub fn with_resources(shell: impl Into<String>, cores: u64, ram_mb: u64, disk_gb: u64) -> Self {
        let flavor = Flavor {
            id: "localhost".to_string(),
            name: "localhost".to_string(),
            cores,
            ram_mb,
            disk_gb,
        };
        let host = Arc::new(Host::new(
            "localhost",
            "127.0.0.1",
            "",
            flavor,
            disk_gb,
            Duration::ZERO,
            None,
        ));
        Self {
            shell: shell.into(),
            host,
        }
    }

    /// The host entry, shared with the cloud backend's server map so both
    /// account against the same usage.
    pub fn host(&self) -> Arc<Host> {
        self.host.clone()
    }
}

#[async_trait]
impl SchedulerBackend for LocalBackend {
    async fn req_check(&self, req: &Requirements) -> Result<()> {
        let flavor = &self.host.flavor;
        if req.cores > flavor.cores || req.ram_mb > flavor.ram_mb || req.disk_gb > self.host.disk_gb
        {
            return Err(DroverError::Impossible(format!(
                "requirement {} exceeds this host",
                req.stringify()
            )));
        }
        Ok(())
    }

    async fn can_count(&self, req: &Requirements) -> u64 {
        self.host.has_space_for(req.cores, req.ram_mb, req.disk_gb)
    }

    async fn run_cmd(&self, cmd: &str, req: &Requirements) -> Result<()> {
        self.host.allocate(req.cores, req.ram_mb, req.disk_gb);
        tracing::debug!(cmd, "executing locally");
        let result = Command::new(&self.shell)
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        self.host.release(req.cores, req.ram_mb, req.disk_gb);
        match result {
            Ok(output) => {
                if !output.status.success() {
                    tracing::debug!(
                        cmd,
                        exit_code = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "local command exited non-zero"
                    );
                }
                Ok(())
            }
            Err(e) => Err(DroverError::Internal(format!(
                "could not start {cmd} via {}: {e}",
                self.shell
            ))),
        }
    }

    async fn host_to_id(&self, host: &str) -> String {
        if host == "localhost" || host == "127.0.0.1" {
            "localhost".to_string()
        } else {
            String::new()
        }
    }

    async fn cleanup(&self) {}
}

/// Total memory in MB, from /proc/meminfo.
pub(crate) fn proc_meminfo_mb() -> Result<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo")?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .map_err(|e| DroverError::Internal(format!("bad /proc/meminfo: {e}")))?;
            return Ok(kb / 1024);
        }
    }
    Err(DroverError::Internal(
        "no MemTotal in /proc/meminfo".to_string(),
    ))
}

/// Free disk in GB for the filesystem holding `path`.
pub(crate) fn disk_available_gb(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| DroverError::Internal(format!("statvfs failed: {e}")))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64 / GB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn req_check_rejects_oversize() {
        let local = LocalBackend::with_resources("bash", 4, 8000, 50);
        let ok = Requirements::new(4000, Duration::from_secs(60), 2, 10);
        assert!(local.req_check(&ok).await.is_ok());

        let too_big = Requirements::new(16000, Duration::from_secs(60), 2, 10);
        assert!(matches!(
            local.req_check(&too_big).await,
            Err(DroverError::Impossible(_))
        ));
    }

    #[tokio::test]
    async fn can_count_divides_free_space() {
        let local = LocalBackend::with_resources("bash", 8, 16000, 100);
        let req = Requirements::new(4000, Duration::from_secs(60), 2, 0);
        assert_eq!(local.can_count(&req).await, 4);
    }

    #[tokio::test]
    async fn run_cmd_releases_resources() {
        let local = LocalBackend::with_resources("bash", 2, 2000, 10);
        let req = Requirements::new(1000, Duration::from_secs(60), 1, 0);
        local.run_cmd("true", &req).await.unwrap();
        assert_eq!(local.can_count(&req).await, 2);
    }

    #[tokio::test]
    async fn failing_command_is_not_a_dispatch_error() {
        let local = LocalBackend::with_resources("bash", 2, 2000, 10);
        let req = Requirements::new(1000, Duration::from_secs(60), 1, 0);
        assert!(local.run_cmd("exit 3", &req).await.is_ok());
    }
}
