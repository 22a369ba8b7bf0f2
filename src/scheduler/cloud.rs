//! Scheduling onto servers spawned on demand in an OpenStack-like cloud.
//!
//! Extends the local backend: commands run on the local host when it has
//! room, on an existing spawned server with matching OS and space, on a
//! server already mid-spawn (a standin), or on a freshly spawned one. Spawns
//! are throttled to one start per configured gap, and quota is guarded by
//! pessimistic reservations that are refunded whether the spawn works or not.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;

use crate::cloud::{CloudError, CloudProvider, DeployConfig, Flavor, Host, SpawnRequest};
use crate::config::CloudConfig;
use crate::error::{DroverError, Result};
use crate::job::Requirements;

use super::local::LocalBackend;
use super::SchedulerBackend;

/// Stands in for "unlimited" when the provider reports no quota.
const UNQUOTAD: u64 = 1_000_000;

#[derive(Default)]
struct StandinUsed {
    cores: u64,
    ram_mb: u64,
    disk_gb: u64,
}

/// A server in the middle of being spawned. Commands can be allocated
/// against its future capacity; every waiter sees the same one-shot outcome.
pub struct Standin {
    pub id: String,
    pub flavor: Flavor,
    pub disk_gb: u64,
    pub os: String,
    used: StdMutex<StandinUsed>,
    outcome: watch::Sender<Option<Option<Arc<Host>>>>,
}

impl Standin {
    fn new(id: impl Into<String>, flavor: Flavor, disk_gb: u64, os: impl Into<String>) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            id: id.into(),
            flavor,
            disk_gb,
            os: os.into(),
            used: StdMutex::new(StandinUsed::default()),
            outcome,
        })
    }

    fn allocate(&self, req: &Requirements) {
        let mut used = self.used.lock().unwrap();
        used.cores += req.cores;
        used.ram_mb += req.ram_mb;
        used.disk_gb += req.disk_gb;
    }

    fn has_space_for(&self, req: &Requirements) -> u64 {
        let used = self.used.lock().unwrap();
        let avail_cores = self.flavor.cores.saturating_sub(used.cores);
        let avail_ram = self.flavor.ram_mb.saturating_sub(used.ram_mb);
        let avail_disk = self.disk_gb.saturating_sub(used.disk_gb);
        if avail_cores < req.cores || avail_ram < req.ram_mb || avail_disk < req.disk_gb {
            return 0;
        }
        let mut can = u64::MAX;
        if req.cores > 0 {
            can = can.min(avail_cores / req.cores);
        }
        if req.ram_mb > 0 {
            can = can.min(avail_ram / req.ram_mb);
        }
        if req.disk_gb > 0 {
            can = can.min(avail_disk / req.disk_gb);
        }
        if can == u64::MAX {
            can = 1;
        }
        can
    }

    /// The server failed to come up; all waiters receive None.
    fn failed(&self) {
        let _ = self.outcome.send(Some(None));
    }

    /// The server is up; all waiters receive it.
    fn worked(&self, host: Arc<Host>) {
        let _ = self.outcome.send(Some(Some(host)));
    }

    /// Block until `worked` or `failed` is called. Any number of callers may
    /// wait; all see the same outcome.
    pub async fn wait_for_host(&self) -> Option<Arc<Host>> {
        let mut rx = self.outcome.subscribe();
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

struct QuotaCaps {
    instances: u64,
    cores: u64,
    ram_mb: u64,
    volume_gb: u64,
}

#[derive(Default)]
struct CloudState {
    servers: HashMap<String, Arc<Host>>,
    standins: HashMap<String, Arc<Standin>>,
    waiting_to_spawn: u64,
    spawning_now: u64,
    next_spawn_time: Option<Instant>,
    reserved_instances: u64,
    reserved_cores: u64,
    reserved_ram_mb: u64,
    reserved_volume_gb: u64,
}

pub struct CloudScheduler {
    local: LocalBackend,
    provider: Arc<dyn CloudProvider>,
    config: CloudConfig,
    caps: QuotaCaps,
    state: Mutex<CloudState>,
    /// Rendezvous used to cancel a single spawn-throttle waiter, so it can
    /// try a just-freed server instead of spawning a new one.
    stop_waiting: Notify,
}

impl CloudScheduler {
    /// Deploy cloud prerequisites, read quota, and seed the server map with
    /// the local host.
    pub async fn new(
        local: LocalBackend,
        provider: Arc<dyn CloudProvider>,
        config: CloudConfig,
    ) -> Result<Self> {
        provider
            .deploy(&DeployConfig {
                required_ports: config.server_ports.clone(),
                cidr: config.cidr.clone(),
                gateway_ip: config.gateway_ip.clone(),
                dns_name_servers: config.dns_name_servers.clone(),
            })
            .await?;

        let quota = provider.get_quota().await?;
        let nonzero = |v: u64| if v == 0 { UNQUOTAD } else { v };
        let mut caps = QuotaCaps {
            instances: nonzero(quota.max_instances),
            cores: nonzero(quota.max_cores),
            ram_mb: nonzero(quota.max_ram_mb),
            volume_gb: nonzero(quota.max_volume_gb),
        };
        if config.max_instances > 0 && config.max_instances < caps.instances {
            caps.instances = config.max_instances;
        }

        let mut state = CloudState::default();
        state
            .servers
            .insert("localhost".to_string(), local.host());

        Ok(Self {
            local,
            provider,
            config,
            caps,
            state: Mutex::new(state),
            stop_waiting: Notify::new(),
        })
    }

    /// The configured OS RAM floor can raise a requirement's RAM for spawn
    /// sizing; what the command needs and what boots the image may differ.
    fn req_for_spawn(&self, req: &Requirements) -> Requirements {
        let os_ram = req.cloud_os_ram_mb().unwrap_or(self.config.os_ram_mb);
        if req.ram_mb < os_ram {
            let mut raised = req.clone();
            raised.ram_mb = os_ram;
            raised
        } else {
            req.clone()
        }
    }

    /// The smallest flavor capable of the requirement, restricted by the
    /// configured flavor regex.
    async fn determine_flavor(&self, req: &Requirements) -> Result<Flavor> {
        self.provider
            .cheapest_server_flavor(req.cores, req.ram_mb, &self.config.flavor_regex)
            .await
            .map_err(|e| match e {
                CloudError::NoFlavor => {
                    DroverError::Impossible("no flavor can run this requirement".to_string())
                }
                other => other.into(),
            })
    }

    fn os_prefix_for(&self, req: &Requirements) -> String {
        req.cloud_os()
            .map(str::to_string)
            .unwrap_or_else(|| self.config.os_prefix.clone())
    }

    /// Check the command's executable exists on a fresh server; upload it if
    /// not.
    async fn ensure_exe(&self, host: &Arc<Host>, cmd: &str) -> std::result::Result<(), CloudError> {
        let exe = cmd.split_whitespace().next().unwrap_or(cmd);
        let Some(exe_path) = lookup_path(exe) else {
            return Err(CloudError::Exec(format!("{exe} not found on this host")));
        };
        let stdout = host
            .run_cmd(&format!("file {}", exe_path.display()), false)
            .await?;
        if stdout.contains("No such file") {
            host.upload_file(&exe_path, &exe_path).await.map_err(|e| {
                CloudError::Upload(format!(
                    "could not upload {}: {e} (try putting the exe in /tmp?)",
                    exe_path.display()
                ))
            })?;
            host.run_cmd(&format!("chmod u+x {}", exe_path.display()), false)
                .await?;
        }
        Ok(())
    }

    /// Wait for our turn in the spawn queue: promoted when the gap since the
    /// previous spawn start has passed, cancelled if `stop_waiting` picks us.
    /// Returns false when cancelled.
    async fn wait_for_spawn_turn(&self) -> bool {
        let mut ticker = tokio::time::interval(self.config.spawn_poll);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut state = self.state.lock().await;
                    let due = state
                        .next_spawn_time
                        .map(|t| Instant::now() >= t)
                        .unwrap_or(true);
                    if due {
                        state.next_spawn_time = Some(Instant::now() + self.config.spawn_gap);
                        state.waiting_to_spawn -= 1;
                        state.spawning_now += 1;
                        return true;
                    }
                }
                _ = self.stop_waiting.notified() => {
                    return false;
                }
            }
        }
    }
}

#[async_trait]
impl SchedulerBackend for CloudScheduler {
    async fn req_check(&self, req: &Requirements) -> Result<()> {
        if req.ram_mb > self.caps.ram_mb
            || req.cores > self.caps.cores
            || req.disk_gb > self.caps.volume_gb
        {
            return Err(DroverError::Impossible(format!(
                "requirement {} exceeds project quota",
                req.stringify()
            )));
        }
        self.determine_flavor(req).await?;
        Ok(())
    }

    async fn can_count(&self, req: &Requirements) -> u64 {
        let mut state = self.state.lock().await;

        // existing capacity, garbage-collecting dead and idle-expired hosts
        let mut count = 0;
        let mut gone = Vec::new();
        for (id, host) in &state.servers {
            if host.destroyed() {
                gone.push(id.clone());
                continue;
            }
            if id != "localhost" && host.expired() {
                let host = host.clone();
                tokio::spawn(async move {
                    if let Err(e) = host.destroy().await {
                        tracing::warn!(host = %host.id, error = %e, "could not destroy idle server");
                    }
                });
                gone.push(id.clone());
                continue;
            }
            count += host.has_space_for(req.cores, req.ram_mb, req.disk_gb);
        }
        for id in gone {
            state.servers.remove(&id);
        }

        // capacity we could spawn before hitting quota
        let spawn_req = self.req_for_spawn(req);
        let Ok(flavor) = self.determine_flavor(&spawn_req).await else {
            return count;
        };
        let Ok(quota) = self.provider.get_quota().await else {
            return count;
        };
        let check_volume = req.disk_gb > flavor.disk_gb;
        let remaining_instances = self
            .caps
            .instances
            .saturating_sub(quota.used_instances + state.reserved_instances);
        let remaining_cores = self
            .caps
            .cores
            .saturating_sub(quota.used_cores + state.reserved_cores);
        let remaining_ram = self
            .caps
            .ram_mb
            .saturating_sub(quota.used_ram_mb + state.reserved_ram_mb);
        let remaining_volume = self
            .caps
            .volume_gb
            .saturating_sub(quota.used_volume_gb + state.reserved_volume_gb);
        if remaining_instances < 1
            || remaining_ram < flavor.ram_mb
            || remaining_cores < flavor.cores
            || (check_volume && remaining_volume < req.disk_gb)
        {
            return count;
        }

        let mut spawnable = remaining_instances;
        if flavor.ram_mb > 0 {
            spawnable = spawnable.min(remaining_ram / flavor.ram_mb);
        }
        if flavor.cores > 0 {
            spawnable = spawnable.min(remaining_cores / flavor.cores);
        }
        if check_volume {
            spawnable = spawnable.min(remaining_volume / req.disk_gb);
        }

        let mut per_server = u64::MAX;
        if spawn_req.cores > 0 {
            per_server = per_server.min(flavor.cores / spawn_req.cores);
        }
        if spawn_req.ram_mb > 0 {
            per_server = per_server.min(flavor.ram_mb / spawn_req.ram_mb);
        }
        if spawn_req.disk_gb > 0 {
            per_server = per_server.min(if check_volume {
                // the volume is created to exactly match the required disk
                1
            } else {
                flavor.disk_gb / spawn_req.disk_gb
            });
        }
        if per_server == u64::MAX {
            per_server = 1;
        }

        count + spawnable * per_server
    }

    async fn run_cmd(&self, cmd: &str, req: &Requirements) -> Result<()> {
        let os_prefix = self.os_prefix_for(req);

        let mut state = self.state.lock().await;
        state.servers.retain(|_, h| !h.destroyed());

        // an existing server with matching OS and room?
        let mut server: Option<Arc<Host>> = None;
        for host in state.servers.values() {
            if host.os == os_prefix
                && host.has_space_for(req.cores, req.ram_mb, req.disk_gb) > 0
            {
                server = Some(host.clone());
                break;
            }
        }

        // or room on a server already being spawned?
        if server.is_none() {
            let standin = state
                .standins
                .values()
                .find(|s| s.os == os_prefix && s.has_space_for(req) > 0)
                .cloned();
            if let Some(standin) = standin {
                standin.allocate(req);
                drop(state);
                let host = standin.wait_for_host().await;
                state = self.state.lock().await;
                match host {
                    Some(host) if !host.destroyed() => server = Some(host),
                    // spawn failed under us; fall through and spawn our own
                    _ => {}
                }
            }
        }

        // otherwise spawn the smallest server that can run this command
        if server.is_none() {
            let flavor = self.determine_flavor(&self.req_for_spawn(req)).await?;
            let volume_affected = req.disk_gb > flavor.disk_gb;

            // record the quota we're about to use and unlock so other
            // dispatches can proceed while we spawn
            let num_spawning = state.waiting_to_spawn + state.spawning_now;
            if num_spawning == 0 {
                state.next_spawn_time = Some(Instant::now() + self.config.spawn_gap);
                state.spawning_now += 1;
            } else {
                state.waiting_to_spawn += 1;
            }
            state.reserved_instances += 1;
            state.reserved_cores += flavor.cores;
            state.reserved_ram_mb += flavor.ram_mb;
            if volume_affected {
                state.reserved_volume_gb += req.disk_gb;
            }

            let standin_id = uuid::Uuid::new_v4().to_string();
            let standin = Standin::new(&standin_id, flavor.clone(), req.disk_gb, &os_prefix);
            standin.allocate(req);
            state.standins.insert(standin_id.clone(), standin.clone());
            drop(state);

            // don't overload the system: wait our turn if a spawn is already
            // under way
            if num_spawning > 0 && !self.wait_for_spawn_turn().await {
                let mut state = self.state.lock().await;
                state.waiting_to_spawn -= 1;
                state.reserved_instances -= 1;
                state.reserved_cores -= flavor.cores;
                state.reserved_ram_mb -= flavor.ram_mb;
                if volume_affected {
                    state.reserved_volume_gb -= req.disk_gb;
                }
                standin.failed();
                state.standins.remove(&standin_id);
                return Err(CloudError::Spawn("gave up waiting to spawn".to_string()).into());
            }

            let user = req
                .cloud_user()
                .map(str::to_string)
                .unwrap_or_else(|| self.config.os_user.clone());
            let script = req
                .cloud_script()
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_else(|| self.config.post_creation_script.clone());

            let spawned = self
                .provider
                .spawn(&SpawnRequest {
                    os_prefix: os_prefix.clone(),
                    user,
                    flavor_id: flavor.id.clone(),
                    disk_gb: req.disk_gb,
                    keep_time: self.config.server_keep_time,
                    head_node: false,
                    post_creation_script: script,
                })
                .await;

            let spawned = match spawned {
                Ok(host) => match self.ensure_exe(&host, cmd).await {
                    Ok(()) => Ok(host),
                    Err(e) => {
                        let _ = host.destroy().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            let mut state = self.state.lock().await;
            state.spawning_now -= 1;
            state.reserved_instances -= 1;
            state.reserved_cores -= flavor.cores;
            state.reserved_ram_mb -= flavor.ram_mb;
            if volume_affected {
                state.reserved_volume_gb -= req.disk_gb;
            }
            match spawned {
                Err(e) => {
                    standin.failed();
                    state.standins.remove(&standin_id);
                    tracing::warn!(os = %os_prefix, error = %e, "server spawn failed");
                    return Err(e.into());
                }
                Ok(host) => {
                    state.servers.insert(host.id.clone(), host.clone());
                    standin.worked(host.clone());
                    state.standins.remove(&standin_id);
                    tracing::info!(host = %host.id, ip = %host.ip, "server spawned");
                    server = Some(host);
                }
            }
            drop(state);
        } else {
            drop(state);
        }

        let server = server.expect("a server was found or spawned");
        let is_local = server.ip == "127.0.0.1";

        // localhost accounting belongs to the local backend; remote servers
        // are accounted here
        let result = if is_local {
            self.local.run_cmd(cmd, req).await
        } else {
            server.allocate(req.cores, req.ram_mb, req.disk_gb);
            let run = server.run_cmd(cmd, false).await;
            server.release(req.cores, req.ram_mb, req.disk_gb);
            run.map(|_| ()).map_err(DroverError::from)
        };

        // a remote slot just freed up: let one queued spawner give up
        // waiting and potentially get scheduled on this server instead
        if !is_local {
            let waiting = self.state.lock().await.waiting_to_spawn;
            if waiting > 0 {
                self.stop_waiting.notify_one();
            }
        }

        result
    }

    async fn host_to_id(&self, host: &str) -> String {
        if host == "localhost" || host == "127.0.0.1" {
            return "localhost".to_string();
        }
        let state = self.state.lock().await;
        state
            .servers
            .values()
            .find(|h| h.ip == host || h.id == host)
            .map(|h| h.id.clone())
            .unwrap_or_default()
    }

    async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        for standin in state.standins.values() {
            standin.failed();
        }
        state.standins.clear();
        let servers: Vec<Arc<Host>> = state
            .servers
            .drain()
            .filter(|(id, _)| id != "localhost")
            .map(|(_, h)| h)
            .collect();
        drop(state);
        for host in servers {
            if let Err(e) = host.destroy().await {
                tracing::warn!(host = %host.id, error = %e, "could not destroy server");
            }
        }
        if let Err(e) = self.provider.tear_down().await {
            tracing::warn!(error = %e, "cloud teardown failed");
        }
    }
}

/// Find an executable the way the shell would.
fn lookup_path(exe: &str) -> Option<PathBuf> {
    if exe.contains('/') {
        let path = PathBuf::from(exe);
        return path.exists().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(exe))
        .find(|candidate| candidate.exists())
}
