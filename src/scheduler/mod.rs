//! Resource-aware command dispatch.
//!
//! The server tells the scheduler how many runners each requirement class
//! needs via `schedule`; the scheduler keeps that desired state and starts
//! executions whenever its backend says capacity exists. Backends answer
//! three questions: can this requirement ever be met (`req_check`), how many
//! copies could start right now (`can_count`), and actually run one
//! (`run_cmd`). The local backend answers for this host alone; the cloud
//! backend extends it with spawned servers.

pub mod cloud;
pub mod local;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::Result;
use crate::job::Requirements;

#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    /// Err(Impossible) when the requirement exceeds what this backend could
    /// ever provide.
    async fn req_check(&self, req: &Requirements) -> Result<()>;

    /// How many commands with this requirement could start right now.
    async fn can_count(&self, req: &Requirements) -> u64;

    /// Run the command somewhere suitable, blocking until it finishes. An
    /// error means the command could not be started; a command that starts
    /// and fails is not an error here.
    async fn run_cmd(&self, cmd: &str, req: &Requirements) -> Result<()>;

    /// Map a host name or address, as reported by a runner, to the backend's
    /// identifier for it. Empty when unknown.
    async fn host_to_id(&self, host: &str) -> String;

    /// Tear down anything the backend created.
    async fn cleanup(&self);
}

struct CmdSlot {
    req: Requirements,
    desired: u64,
    running: u64,
}

#[derive(Default)]
struct SchedState {
    slots: HashMap<String, CmdSlot>,
}

pub struct Scheduler {
    backend: Arc<dyn SchedulerBackend>,
    state: Mutex<SchedState>,
    wake: Arc<Notify>,
}

impl Scheduler {
    /// Create the scheduler and spawn its dispatch loop. The loop stops when
    /// the scheduler is dropped.
    pub fn new(backend: Arc<dyn SchedulerBackend>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            backend,
            state: Mutex::new(SchedState::default()),
            wake: Arc::new(Notify::new()),
        });
        let weak = Arc::downgrade(&scheduler);
        let wake = scheduler.wake.clone();
        tokio::spawn(async move {
            dispatch_loop(weak, wake).await;
        });
        scheduler
    }

    /// Declare that `cmd` should be running `count` times. Replaces any
    /// previous count for the same command; zero forgets it. Each execution
    /// that completes satisfies one of the count.
    pub async fn schedule(&self, cmd: &str, req: &Requirements, count: u64) -> Result<()> {
        self.backend.req_check(req).await?;
        {
            let mut state = self.state.lock().await;
            if count == 0 {
                if let Some(slot) = state.slots.get_mut(cmd) {
                    slot.desired = 0;
                    if slot.running == 0 {
                        state.slots.remove(cmd);
                    }
                }
            } else {
                let slot = state.slots.entry(cmd.to_string()).or_insert_with(|| CmdSlot {
                    req: req.clone(),
                    desired: 0,
                    running: 0,
                });
                slot.desired = count;
                slot.req = req.clone();
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Whether any scheduling or execution is still outstanding.
    pub async fn busy(&self) -> bool {
        let state = self.state.lock().await;
        state.slots.values().any(|s| s.desired > 0 || s.running > 0)
    }

    pub async fn host_to_id(&self, host: &str) -> String {
        self.backend.host_to_id(host).await
    }

    pub async fn cleanup(&self) {
        self.backend.cleanup().await;
    }

    /// Start as many queued executions as current capacity allows.
    async fn process_queue(self: &Arc<Self>) {
        let mut to_run = Vec::new();
        {
            let mut state = self.state.lock().await;
            let cmds: Vec<String> = state.slots.keys().cloned().collect();
            for cmd in cmds {
                let (need, req) = {
                    let slot = &state.slots[&cmd];
                    (slot.desired.saturating_sub(slot.running), slot.req.clone())
                };
                if need == 0 {
                    continue;
                }
                let can = self.backend.can_count(&req).await;
                let n = need.min(can);
                if n == 0 {
                    continue;
                }
                state.slots.get_mut(&cmd).unwrap().running += n;
                for _ in 0..n {
                    to_run.push((cmd.clone(), req.clone()));
                }
            }
        }

        for (cmd, req) in to_run {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.backend.run_cmd(&cmd, &req).await {
                    tracing::warn!(cmd = %cmd, error = %e, "could not dispatch command");
                }
                {
                    let mut state = this.state.lock().await;
                    if let Some(slot) = state.slots.get_mut(&cmd) {
                        slot.running -= 1;
                        slot.desired = slot.desired.saturating_sub(1);
                        if slot.desired == 0 && slot.running == 0 {
                            state.slots.remove(&cmd);
                        }
                    }
                }
                // freed capacity may let another queued execution start
                this.wake.notify_one();
            });
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // unparks the dispatch loop so it can observe the dropped handle
        self.wake.notify_one();
    }
}

async fn dispatch_loop(scheduler: Weak<Scheduler>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        scheduler.process_queue().await;
    }
}
