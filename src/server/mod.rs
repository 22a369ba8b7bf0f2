//! The request server: one TCP listener, one dispatcher task.
//!
//! Connections decode framed requests and forward them, each with a one-shot
//! reply channel, into the dispatcher's queue. The dispatcher executes each
//! method to completion before taking the next, so all queue and store
//! mutations are serialised; the only waits that escape it are blocked
//! reserves, which poll on their own task using the queue's locking.

mod handlers;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::error::{DroverError, ErrorToken, Result};
use crate::job::{JobState, Requirements};
use crate::protocol::{self, ClientRequest, ServerInfo, ServerResponse, ServerStats};
use crate::queue::{Queue, QueueConfig, QueueEvent, TtrAction};
use crate::scheduler::{Scheduler, SchedulerBackend};
use crate::storage::Store;

/// Why the server stopped; `block` reports this to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A shutdown request or drain completion.
    Stop,
    /// SIGTERM.
    Term,
    /// SIGINT.
    Int,
}

impl StopReason {
    pub fn token(&self) -> ErrorToken {
        match self {
            StopReason::Stop => ErrorToken::ClosedStop,
            StopReason::Term => ErrorToken::ClosedTerm,
            StopReason::Int => ErrorToken::ClosedInt,
        }
    }
}

/// One job-state transition, fanned out to status observers. Sent once with
/// rep group `+all+` and once with the job's own rep group.
#[derive(Debug, Clone)]
pub struct JStateCount {
    pub rep_group: String,
    pub from: JobState,
    pub to: JobState,
    pub count: usize,
}

pub(crate) struct Shared {
    pub cfg: ManagerConfig,
    pub info: ServerInfo,
    pub store: Store,
    pub scheduler: Arc<Scheduler>,
    pub status_tx: broadcast::Sender<JStateCount>,
    pub drain: AtomicBool,
    pub stopping: AtomicBool,
    stop_reason: StdMutex<Option<StopReason>>,
    pub shutdown: CancellationToken,
}

impl Shared {
    /// Begin shutdown for the given reason. First caller wins.
    pub fn stop(&self, reason: StopReason) {
        let mut slot = self.stop_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn reason(&self) -> StopReason {
        self.stop_reason.lock().unwrap().unwrap_or(StopReason::Stop)
    }

    pub fn broadcast(&self, rep_group: &str, from: JobState, to: JobState) {
        let _ = self.status_tx.send(JStateCount {
            rep_group: "+all+".to_string(),
            from,
            to,
            count: 1,
        });
        if !rep_group.is_empty() {
            let _ = self.status_tx.send(JStateCount {
                rep_group: rep_group.to_string(),
                from,
                to,
                count: 1,
            });
        }
    }
}

struct Dispatch {
    req: ClientRequest,
    reply: oneshot::Sender<ServerResponse>,
}

/// Per-scheduler-group accounting: the requirement profile and how many
/// items currently demand a runner (ready + reserved/running).
pub(crate) struct GroupState {
    pub req: Requirements,
    pub count: i64,
}

pub(crate) struct DispatcherState {
    pub queues: HashMap<String, Arc<Queue>>,
    pub groups: HashMap<(String, String), GroupState>,
    /// rep group -> live job keys, per queue, for getbr lookups.
    pub rpl: HashMap<(String, String), HashSet<String>>,
    pub kill_runners: bool,
    pub event_tx: UnboundedSender<QueueEvent>,
}

impl DispatcherState {
    fn group_count(&self, queue: &str, group: &str) -> i64 {
        self.groups
            .get(&(queue.to_string(), group.to_string()))
            .map(|g| g.count)
            .unwrap_or(0)
    }
}

/// A cloneable handle that can stop the server from another task, e.g. a
/// signal listener.
#[derive(Clone)]
pub struct Stopper(Arc<Shared>);

impl Stopper {
    pub fn stop(&self, reason: StopReason) {
        self.0.stop(reason);
    }
}

pub struct Server {
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<Option<StopReason>>,
    addr: std::net::SocketAddr,
}

impl Server {
    /// Bind the listener, open the store, recover any persisted jobs, and
    /// start serving.
    pub async fn serve(cfg: ManagerConfig, backend: Arc<dyn SchedulerBackend>) -> Result<Server> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;
        let addr = listener.local_addr()?;
        let store = Store::open(&cfg.db_file)?;
        let scheduler = Scheduler::new(backend);
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let info = ServerInfo {
            addr: format!("{}:{}", host, addr.port()),
            host,
            port: addr.port(),
            pid: std::process::id(),
            deployment: cfg.deployment.clone(),
        };

        let (status_tx, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            cfg,
            info,
            store,
            scheduler,
            status_tx,
            drain: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop_reason: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let (req_tx, req_rx) = mpsc::channel::<Dispatch>(128);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<QueueEvent>();
        let (stop_tx, stop_rx) = watch::channel(None);

        // the dispatcher owns all mutable server state
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                dispatcher(shared, req_rx, event_rx, event_tx, stop_tx).await;
            });
        }

        // accept loop
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                accept_loop(listener, shared, req_tx).await;
            });
        }

        tracing::info!(addr = %addr, "server listening");
        Ok(Server {
            shared,
            stop_rx,
            addr,
        })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn server_info(&self) -> ServerInfo {
        self.shared.info.clone()
    }

    /// Subscribe to job state-change broadcasts.
    pub fn status_events(&self) -> broadcast::Receiver<JStateCount> {
        self.shared.status_tx.subscribe()
    }

    /// Stop accepting new work but let what's running finish; the server
    /// stops once everything has drained.
    pub fn drain(&self) {
        self.shared.drain.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self, reason: StopReason) {
        self.shared.stop(reason);
    }

    pub fn stopper(&self) -> Stopper {
        Stopper(self.shared.clone())
    }

    /// Wait until the server has stopped, reporting why.
    pub async fn block(&mut self) -> StopReason {
        loop {
            if let Some(reason) = *self.stop_rx.borrow() {
                return reason;
            }
            if self.stop_rx.changed().await.is_err() {
                return StopReason::Stop;
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, req_tx: mpsc::Sender<Dispatch>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(peer = %peer, "client connected");
                let shared = shared.clone();
                let req_tx = req_tx.clone();
                tokio::spawn(async move {
                    connection(stream, shared, req_tx).await;
                });
            }
        }
    }
}

/// Read framed requests off one connection and relay replies back, one at a
/// time.
async fn connection(
    stream: tokio::net::TcpStream,
    shared: Arc<Shared>,
    req_tx: mpsc::Sender<Dispatch>,
) {
    let mut framed = protocol::frame(stream);
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            frame = framed.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "connection read failed");
                return;
            }
            None => return,
        };
        let req: ClientRequest = match protocol::decode(&bytes) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(error = %e, "could not decode request");
                let resp = ServerResponse {
                    err: ErrorToken::BadRequest.as_str().to_string(),
                    ..Default::default()
                };
                if send_response(&mut framed, &resp).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if req_tx
            .send(Dispatch {
                req,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            // dispatcher gone; server is stopping
            let resp = ServerResponse {
                err: ErrorToken::ClosedStop.as_str().to_string(),
                ..Default::default()
            };
            let _ = send_response(&mut framed, &resp).await;
            return;
        }
        let resp = match reply_rx.await {
            Ok(resp) => resp,
            Err(_) => ServerResponse {
                err: ErrorToken::InternalError.as_str().to_string(),
                ..Default::default()
            },
        };
        if send_response(&mut framed, &resp).await.is_err() {
            return;
        }
    }
}

async fn send_response(
    framed: &mut protocol::FramedStream,
    resp: &ServerResponse,
) -> Result<()> {
    let bytes = protocol::encode(resp)?;
    framed.send(bytes).await.map_err(DroverError::from)?;
    Ok(())
}

async fn dispatcher(
    shared: Arc<Shared>,
    mut req_rx: mpsc::Receiver<Dispatch>,
    mut event_rx: UnboundedReceiver<QueueEvent>,
    event_tx: UnboundedSender<QueueEvent>,
    stop_tx: watch::Sender<Option<StopReason>>,
) {
    let mut state = DispatcherState {
        queues: HashMap::new(),
        groups: HashMap::new(),
        rpl: HashMap::new(),
        kill_runners: false,
        event_tx,
    };

    if let Err(e) = handlers::recover_jobs(&shared, &mut state) {
        tracing::error!(error = %e, "could not recover persisted jobs");
    }

    let mut drain_tick = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            event = event_rx.recv() => {
                if let Some(event) = event {
                    handle_event(&shared, &mut state, event).await;
                }
            }
            dispatch = req_rx.recv() => {
                let Some(dispatch) = dispatch else { break };
                handlers::handle(&shared, &mut state, dispatch.req, dispatch.reply).await;
            }
            _ = drain_tick.tick(), if shared.drain.load(Ordering::SeqCst) => {
                let active: usize = state
                    .queues
                    .values()
                    .map(|q| {
                        let s = q.stats();
                        s.ready + s.running + s.delayed
                    })
                    .sum();
                if active == 0 && !shared.scheduler.busy().await {
                    shared.stop(StopReason::Stop);
                }
            }
        }
    }

    // shutdown: stop runners, drop queues, tear down anything we spawned
    state.kill_runners = true;
    for queue in state.queues.values() {
        queue.destroy();
    }
    shared.scheduler.cleanup().await;
    let reason = shared.reason();
    tracing::info!(reason = ?reason, "server stopped");
    let _ = stop_tx.send(Some(reason));
}

/// Items demand a runner while ready or reserved; group counts track exactly
/// that set, so runner dispatch follows the queue.
fn counted(state: JobState) -> bool {
    matches!(
        state,
        JobState::Ready | JobState::Reserved | JobState::Running | JobState::Lost
    )
}

async fn handle_event(shared: &Arc<Shared>, state: &mut DispatcherState, event: QueueEvent) {
    shared.broadcast(&event.rep_group, event.from, event.to);

    let delta = i64::from(counted(event.to)) - i64::from(counted(event.from));
    if delta == 0 || event.scheduler_group.is_empty() {
        return;
    }
    let key = (event.queue.clone(), event.scheduler_group.clone());
    let Some(group) = state.groups.get_mut(&key) else {
        return;
    };
    group.count = (group.count + delta).max(0);
    let count = group.count;
    let req = group.req.clone();
    if count == 0 {
        state.groups.remove(&key);
    }

    if shared.cfg.runner_cmd.is_empty() {
        return;
    }
    let cmd = shared
        .cfg
        .runner_cmd
        .replace("{queue}", &event.queue)
        .replace("{group}", &event.scheduler_group);
    match shared.scheduler.schedule(&cmd, &req, count as u64).await {
        Ok(()) => {}
        Err(DroverError::Impossible(detail)) => {
            tracing::warn!(group = %event.scheduler_group, detail, "requirements cannot be met; jobs will wait");
        }
        Err(e) => {
            tracing::warn!(group = %event.scheduler_group, error = %e, "could not schedule runners");
        }
    }
}

pub(crate) fn queue_config(cfg: &ManagerConfig) -> QueueConfig {
    QueueConfig {
        ttr: cfg.ttr,
        release_delay: cfg.release_delay,
        ttr_action: TtrAction::MarkLost {
            bury_after: cfg.lost_after_ttr_bury,
        },
    }
}

pub(crate) fn server_stats(shared: &Shared, state: &DispatcherState) -> ServerStats {
    let mut stats = ServerStats {
        server_info: shared.info.clone(),
        ..Default::default()
    };
    for queue in state.queues.values() {
        let qs = queue.stats();
        stats.delayed += qs.delayed;
        stats.ready += qs.ready;
        stats.running += qs.running;
        stats.buried += qs.buried;
    }
    stats
}
