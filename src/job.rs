use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The state a job is in, derived from which sub-queue its item occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobState {
    Delayed,
    Ready,
    Reserved,
    Running,
    Lost,
    Buried,
    Dependent,
    Complete,
    #[default]
    Unknown,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Delayed => "delayed",
            JobState::Ready => "ready",
            JobState::Reserved => "reserved",
            JobState::Running => "running",
            JobState::Lost => "lost",
            JobState::Buried => "buried",
            JobState::Dependent => "dependent",
            JobState::Complete => "complete",
            JobState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Resource requirements of a job's command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Requirements {
    /// Megabytes of memory the command needs.
    pub ram_mb: u64,
    /// Wall-clock time the command is expected to take.
    pub time: Duration,
    pub cores: u64,
    /// Gigabytes of local disk the command needs.
    pub disk_gb: u64,
    /// Free-form hints; recognised keys are `cloud_os`, `cloud_user`,
    /// `cloud_script` and `cloud_os_ram`.
    pub other: BTreeMap<String, String>,
}

impl Requirements {
    pub fn new(ram_mb: u64, time: Duration, cores: u64, disk_gb: u64) -> Self {
        Self {
            ram_mb,
            time,
            cores,
            disk_gb,
            other: BTreeMap::new(),
        }
    }

    pub fn with_other(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.other.insert(key.into(), val.into());
        self
    }

    /// OS image prefix this job must run on, when it can't use the default.
    pub fn cloud_os(&self) -> Option<&str> {
        self.other.get("cloud_os").map(String::as_str)
    }

    /// Login username for the job's OS image.
    pub fn cloud_user(&self) -> Option<&str> {
        self.other.get("cloud_user").map(String::as_str)
    }

    /// Script to run on a freshly spawned server before this job.
    pub fn cloud_script(&self) -> Option<&str> {
        self.other.get("cloud_script").map(String::as_str)
    }

    /// Minimum RAM in MB needed to boot the job's OS image.
    pub fn cloud_os_ram_mb(&self) -> Option<u64> {
        self.other.get("cloud_os_ram").and_then(|v| v.parse().ok())
    }

    /// Canonical rendering; jobs with equal renderings share a scheduler
    /// group and so can be picked up by the same runners.
    pub fn stringify(&self) -> String {
        let mut s = format!(
            "{}:{}:{}:{}",
            self.ram_mb,
            self.time.as_secs(),
            self.cores,
            self.disk_gb
        );
        for (k, v) in &self.other {
            s.push_str(&format!(":{}={}", k, v));
        }
        s
    }
}

/// A single dependency of a job: either the key of another job, or the name
/// of a dependency group, all of whose jobs must complete first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependency {
    JobKey(String),
    DepGroup(String),
}

impl Dependency {
    /// The name this dependency resolves under in the queue's index.
    pub fn name(&self) -> &str {
        match self {
            Dependency::JobKey(k) => k,
            Dependency::DepGroup(g) => g,
        }
    }
}

/// When a post-execution behaviour triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BehaviourTrigger {
    OnSuccess,
    OnFailure,
    OnExit,
}

/// A post-execution action carried with the job and carried out by the
/// runner that executed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Behaviour {
    pub when: BehaviourTrigger,
    pub action: BehaviourAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BehaviourAction {
    /// Run this command in the job's (actual) working directory.
    Run(String),
    /// Delete the unique working directory created for the job.
    CleanupCwd,
}

/// A filesystem mount the runner should establish before executing the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MountConfig {
    pub mount: Option<String>,
    pub cache_base: Option<String>,
    pub verbose: bool,
    pub targets: Vec<MountTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MountTarget {
    pub path: String,
    pub cache: bool,
    pub write: bool,
}

/// A deduplicated work record: a command with requirements, grouping and
/// execution state.
///
/// Identity is the hash of (Cmd, Cwd-if-it-matters); submitting the same
/// command in the same significant directory twice yields one job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Job {
    /// Name of the queue the job was submitted to; used to put recovered
    /// jobs back where they came from after a restart.
    pub queue: String,
    pub cmd: String,
    pub cwd: String,
    /// When false, `cwd` is only the starting point: the command runs in a
    /// unique directory created under it, and `cwd` is excluded from the
    /// job's identity.
    pub cwd_matters: bool,
    /// Change $HOME to the working directory before execution.
    pub change_home: bool,
    /// The unique directory the command actually ran in, when one was made.
    pub actual_cwd: String,

    /// Grouping for reporting purposes.
    pub rep_group: String,
    /// Hint used to group jobs with similar expected resource usage.
    pub req_group: String,
    /// Dependency group names this job contributes to.
    pub dep_groups: Vec<String>,
    pub dependencies: Vec<Dependency>,

    pub requirements: Requirements,
    /// 0-255; higher runs first.
    pub priority: u8,
    /// How many times to retry the command after failure before burying.
    pub retries: u8,
    /// Remaining failed attempts before the job is buried.
    pub until_buried: u32,
    pub behaviours: Vec<Behaviour>,
    pub mount_configs: Vec<MountConfig>,

    /// Key into the environment store for the variables the command runs
    /// under; set by the server at submission.
    pub env_key: String,
    /// Environment variables overriding the stored ones.
    pub env_override: Vec<u8>,

    pub state: JobState,
    /// Client that holds the reservation, when reserved/running/lost.
    pub reserved_by: Option<Uuid>,
    pub pid: Option<u32>,
    pub host: String,
    pub host_id: String,
    pub host_ip: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exited: bool,
    pub exitcode: i32,
    pub peak_ram_mb: u64,
    pub cpu_time: f64,
    pub attempts: u32,
    pub fail_reason: String,
    pub kill_called: bool,
    pub lost: bool,

    /// Derived from requirements; jobs needing identical resources share one
    /// scheduler group, so runners sized for it only pull matching work.
    pub scheduler_group: String,

    /// Stdout/stderr/environment, populated from the store only when a
    /// client asks for them.
    pub std_out: Vec<u8>,
    pub std_err: Vec<u8>,
    pub env: Vec<u8>,
}

impl Job {
    pub fn new(cmd: impl Into<String>, cwd: impl Into<String>, requirements: Requirements) -> Self {
        let mut job = Job {
            cmd: cmd.into(),
            cwd: cwd.into(),
            requirements,
            exitcode: -1,
            ..Default::default()
        };
        job.until_buried = u32::from(job.retries) + 1;
        job
    }

    pub fn with_rep_group(mut self, rep_group: impl Into<String>) -> Self {
        self.rep_group = rep_group.into();
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self.until_buried = u32::from(retries) + 1;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dep_groups(mut self, groups: Vec<String>) -> Self {
        self.dep_groups = groups;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Dependency>) -> Self {
        self.dependencies = deps;
        self
    }

    /// The job's identity: hex sha256 over the command and, when it matters,
    /// the working directory.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.cmd.as_bytes());
        hasher.update([0u8]);
        if self.cwd_matters {
            hasher.update(self.cwd.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Hash environment variable bytes into their content address in the store.
pub fn env_key(env: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(env);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_cwd_unless_it_matters() {
        let a = Job::new("echo hi", "/tmp/a", Requirements::default());
        let b = Job::new("echo hi", "/tmp/b", Requirements::default());
        assert_eq!(a.key(), b.key());

        let mut c = a.clone();
        c.cwd_matters = true;
        let mut d = b.clone();
        d.cwd_matters = true;
        assert_ne!(c.key(), d.key());
    }

    #[test]
    fn scheduler_group_tracks_requirements() {
        let r1 = Requirements::new(1024, Duration::from_secs(3600), 1, 0);
        let r2 = Requirements::new(1024, Duration::from_secs(3600), 1, 0);
        assert_eq!(r1.stringify(), r2.stringify());

        let r3 = Requirements::new(2048, Duration::from_secs(3600), 1, 0);
        assert_ne!(r1.stringify(), r3.stringify());

        let r4 = r1.clone().with_other("cloud_os", "ubuntu");
        assert_ne!(r1.stringify(), r4.stringify());
    }
}
