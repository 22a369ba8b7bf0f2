use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the manager process.
///
/// Built by the CLI from flags, or loaded from a JSON file. Paths default to
/// locations under `manager_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Port the request server listens on.
    pub port: u16,
    /// Working directory for the manager's own files.
    pub manager_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub db_file: PathBuf,
    /// Umask applied before the server creates any files.
    pub umask: u32,
    /// Usernames allowed to talk to the server. This is advisory only: it
    /// stops accidental use of someone else's manager, not a determined liar.
    pub allowed_users: Vec<String>,
    /// "production" or "development"; reported in ServerInfo.
    pub deployment: String,

    /// Time a reserved job may go untouched before it is considered lost.
    pub ttr: Duration,
    /// Delay applied when a reserved job is released back for retry.
    pub release_delay: Duration,
    /// How often a blocked reserve re-polls the ready sub-queue.
    pub reserve_ticker: Duration,
    /// If set, a job left lost for this long after TTR expiry is buried.
    pub lost_after_ttr_bury: Option<Duration>,

    /// Command template the scheduler runs to bring up a runner; `{queue}`
    /// and `{group}` are substituted. Empty disables requirement-driven
    /// scheduling (jobs are then only run by externally started runners).
    pub runner_cmd: String,
    /// Shell used to execute commands on the local host.
    pub shell: String,

    /// Cloud settings; `None` means local-only scheduling.
    pub cloud: Option<CloudConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let manager_dir = PathBuf::from(".drover");
        Self {
            port: 11301,
            pid_file: manager_dir.join("pid"),
            log_file: manager_dir.join("log"),
            db_file: manager_dir.join("db"),
            manager_dir,
            umask: 0o077,
            allowed_users: Vec::new(),
            deployment: "production".to_string(),
            ttr: Duration::from_secs(60),
            release_delay: Duration::from_secs(30),
            reserve_ticker: Duration::from_secs(1),
            lost_after_ttr_bury: None,
            runner_cmd: String::new(),
            shell: "bash".to_string(),
            cloud: None,
        }
    }
}

impl ManagerConfig {
    pub fn new(port: u16, manager_dir: PathBuf) -> Self {
        Self {
            port,
            pid_file: manager_dir.join("pid"),
            log_file: manager_dir.join("log"),
            db_file: manager_dir.join("db"),
            manager_dir,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.allowed_users.push(user.into());
        self
    }
}

/// Options required to schedule on an OpenStack-like cloud. All are required
/// with no usable defaults unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Prefix used to name any created resources (keys, security groups,
    /// servers).
    pub resource_name: String,
    /// Prefix or full name of the OS image spawned servers run by default;
    /// overridden per job by `Other["cloud_os"]`.
    pub os_prefix: String,
    /// Login username for that OS; overridden by `Other["cloud_user"]`.
    pub os_user: String,
    /// Minimum RAM in MB needed to boot the OS image; overridden by
    /// `Other["cloud_os_ram"]`.
    pub os_ram_mb: u64,
    /// Regular expression limiting which server flavors may be used. Empty
    /// means no limit.
    pub flavor_regex: String,
    /// Script content executed on a server after it is spawned; overridden by
    /// `Other["cloud_script"]`.
    pub post_creation_script: Vec<u8>,
    /// TCP ports that must be open on spawned servers; at minimum 22.
    pub server_ports: Vec<u16>,
    /// File where the provider records created resources, so deploy and
    /// teardown are idempotent.
    pub save_path: PathBuf,
    /// How long an idle server lives before being destroyed. Zero means
    /// never destroy for idleness.
    pub server_keep_time: Duration,
    /// Hard cap on spawned instances; 0 means quota-limited only.
    pub max_instances: u64,
    /// Minimum spacing between spawn starts.
    pub spawn_gap: Duration,
    /// How often a queued spawner re-checks whether its turn has come.
    pub spawn_poll: Duration,
    /// Range of network IPs usable for spawned servers.
    pub cidr: String,
    pub gateway_ip: String,
    pub dns_name_servers: Vec<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            resource_name: "drover".to_string(),
            os_prefix: String::new(),
            os_user: String::new(),
            os_ram_mb: 2048,
            flavor_regex: String::new(),
            post_creation_script: Vec::new(),
            server_ports: vec![22],
            save_path: PathBuf::from(".drover/cloud_resources"),
            server_keep_time: Duration::ZERO,
            max_instances: 0,
            spawn_gap: Duration::from_secs(10),
            spawn_poll: Duration::from_secs(1),
            cidr: "192.168.0.0/18".to_string(),
            gateway_ip: "192.168.0.1".to_string(),
            dns_name_servers: vec!["8.8.4.4".to_string(), "8.8.8.8".to_string()],
        }
    }
}
