//! Request method implementations.
//!
//! Each handler returns either a response or an error pair: the coarse token
//! the client sees, and the detail the operator log gets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ErrorToken, Result};
use crate::job::{Job, JobState};
use crate::protocol::{ClientRequest, Method, ServerResponse};
use crate::queue::{Item, ItemState, Queue, QueueError};

use super::{queue_config, server_stats, DispatcherState, GroupState, Shared, StopReason};

type MethodError = (ErrorToken, String);

enum Reply {
    Now(ServerResponse),
    /// The handler took ownership of the reply channel (blocked reserve).
    Deferred,
}

fn ok() -> std::result::Result<Reply, MethodError> {
    Ok(Reply::Now(ServerResponse::default()))
}

fn respond(resp: ServerResponse) -> std::result::Result<Reply, MethodError> {
    Ok(Reply::Now(resp))
}

fn fail(token: ErrorToken, detail: impl Into<String>) -> std::result::Result<Reply, MethodError> {
    Err((token, detail.into()))
}

pub(crate) async fn handle(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: ClientRequest,
    reply: oneshot::Sender<ServerResponse>,
) {
    let mut reply = Some(reply);
    let outcome = dispatch(shared, state, &req, &mut reply).await;
    let resp = match outcome {
        Ok(Reply::Now(resp)) => resp,
        Ok(Reply::Deferred) => return,
        Err((token, detail)) => {
            let key = req.job.as_ref().map(|j| j.key()).unwrap_or_default();
            tracing::warn!(
                queue = %req.queue,
                method = %req.method,
                job = %key,
                detail,
                "request failed"
            );
            ServerResponse {
                err: token.as_str().to_string(),
                ..Default::default()
            }
        }
    };
    if let Some(reply) = reply.take() {
        let _ = reply.send(resp);
    }
}

async fn dispatch(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: &ClientRequest,
    reply: &mut Option<oneshot::Sender<ServerResponse>>,
) -> std::result::Result<Reply, MethodError> {
    // advisory only: stops accidental use of someone else's manager
    if req.user.is_empty() || !shared.cfg.allowed_users.iter().any(|u| u == &req.user) {
        return fail(
            ErrorToken::WrongUser,
            format!(
                "user {} denied access (only {:?} allowed)",
                req.user, shared.cfg.allowed_users
            ),
        );
    }
    if shared.stopping.load(std::sync::atomic::Ordering::SeqCst) {
        return fail(ErrorToken::ClosedStop, "the server has been stopped");
    }

    let q = get_or_create_queue(shared, state, &req.queue);

    match req.method {
        Method::Ping => ok(),
        Method::SStats => respond(ServerResponse {
            s_stats: Some(server_stats(shared, state)),
            ..Default::default()
        }),
        Method::Backup => match shared.store.backup() {
            Ok(bytes) => respond(ServerResponse {
                db: Some(bytes),
                ..Default::default()
            }),
            Err(e) => fail(ErrorToken::InternalError, e.to_string()),
        },
        Method::Drain => {
            shared.drain.store(true, std::sync::atomic::Ordering::SeqCst);
            respond(ServerResponse {
                s_stats: Some(server_stats(shared, state)),
                ..Default::default()
            })
        }
        Method::Shutdown => {
            shared.stop(StopReason::Stop);
            ok()
        }
        Method::Add => add(shared, state, req, &q),
        Method::Reserve => reserve(shared, state, req, &q, reply),
        Method::JStart => jstart(shared, req, &q).await,
        Method::JTouch => jtouch(shared, state, req, &q),
        Method::JEnd => jend(shared, req, &q),
        Method::JArchive => jarchive(shared, state, req, &q),
        Method::JRelease => jrelease(req, &q),
        Method::JBury => jbury(shared, req, &q),
        Method::JKick => jkick(req, &q),
        Method::JDel => jdel(shared, state, req, &q),
        Method::JKill => jkill(req, &q),
        Method::GetByCmds => get_by_cmds(shared, req, &q),
        Method::GetByRepGroup => get_by_rep_group(shared, state, req, &q),
        Method::GetInCurrent => get_in_current(shared, req, &q),
    }
}

fn get_or_create_queue(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    name: &str,
) -> Arc<Queue> {
    if let Some(q) = state.queues.get(name) {
        return q.clone();
    }
    let q = Queue::new(name, queue_config(&shared.cfg), state.event_tx.clone());
    state.queues.insert(name.to_string(), q.clone());
    q
}

/// The common preamble of the j* methods: the request names a job, its item
/// must be in the run sub-queue, and the caller must hold its reservation.
fn getij(req: &ClientRequest, q: &Queue) -> std::result::Result<Item, MethodError> {
    let Some(job) = &req.job else {
        return Err((ErrorToken::BadRequest, "a job is required".to_string()));
    };
    let key = job.key();
    let item = match q.get(&key) {
        Ok(item) if item.state == ItemState::Run => item,
        Ok(_) | Err(QueueError::NotFound) => {
            return Err((
                ErrorToken::BadJob,
                format!("job [{key}] is not in the run queue"),
            ))
        }
        Err(e) => return Err((ErrorToken::QueueClosed, e.to_string())),
    };
    let reserved_by = item.job.lock().unwrap().reserved_by;
    if reserved_by != Some(req.client_id) {
        return Err((
            ErrorToken::MustReserve,
            format!("job [{key}] is reserved by another client"),
        ));
    }
    Ok(item)
}

/// A copy of the job for the client, with derived state and, on request, its
/// stored stdout/stderr and environment filled in.
fn item_to_job(shared: &Shared, item: &Item, get_std: bool, get_env: bool) -> Job {
    let mut job = item.job.lock().unwrap().clone();
    job.state = match item.state {
        ItemState::Delay => JobState::Delayed,
        ItemState::Ready => JobState::Ready,
        ItemState::Bury => JobState::Buried,
        ItemState::Dependent => JobState::Dependent,
        ItemState::Run => {
            if job.lost {
                JobState::Lost
            } else if job.start_time.is_some() {
                JobState::Running
            } else {
                JobState::Reserved
            }
        }
    };
    populate_std_env(shared, &mut job, get_std, get_env);
    job
}

fn populate_std_env(shared: &Shared, job: &mut Job, get_std: bool, get_env: bool) {
    if get_std && ((job.exited && job.exitcode != 0) || job.state == JobState::Buried) {
        if let Ok((stdout, stderr)) = shared.store.retrieve_job_std(&job.key()) {
            job.std_out = stdout;
            job.std_err = stderr;
        }
    }
    if get_env {
        if let Ok(env) = shared.store.retrieve_env(&job.env_key) {
            job.env = env;
        }
    }
}

fn add(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    if shared.drain.load(std::sync::atomic::Ordering::SeqCst) {
        return fail(ErrorToken::ClosedStop, "server is draining");
    }
    let (Some(env), Some(jobs)) = (&req.env, &req.jobs) else {
        return fail(ErrorToken::BadRequest, "add needs jobs and an environment");
    };
    let env_key = shared
        .store
        .store_env(env)
        .map_err(|e| (ErrorToken::DbError, e.to_string()))?;

    let mut added = 0;
    let mut dups = 0;
    let mut already_complete = 0;
    let mut to_add: Vec<(String, Job)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for job in jobs {
        let mut job = job.clone();
        job.queue = req.queue.clone();
        job.env_key = env_key.clone();
        job.until_buried = u32::from(job.retries) + 1;
        job.scheduler_group = job.requirements.stringify();
        job.state = JobState::Unknown;
        job.reserved_by = None;
        let key = job.key();
        if seen.contains(&key) || q.get(&key).is_ok() {
            dups += 1;
            continue;
        }
        if !req.ignore_complete
            && shared
                .store
                .job_completed_before(&key)
                .map_err(|e| (ErrorToken::DbError, e.to_string()))?
        {
            already_complete += 1;
            continue;
        }
        seen.insert(key.clone());
        to_add.push((key, job));
    }

    // make the batch durable before the queue learns about any of it
    shared
        .store
        .store_live_jobs(to_add.iter().map(|(k, j)| (k.as_str(), j)))
        .map_err(|e| (ErrorToken::DbError, e.to_string()))?;

    for (key, job) in to_add {
        let group = job.scheduler_group.clone();
        let priority = job.priority;
        let dep_groups = job.dep_groups.clone();
        let deps: Vec<String> = job
            .dependencies
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        let rep_group = job.rep_group.clone();
        let requirements = job.requirements.clone();

        state
            .groups
            .entry((req.queue.clone(), group.clone()))
            .or_insert_with(|| GroupState {
                req: requirements,
                count: 0,
            });

        match q.add(
            &key,
            Arc::new(Mutex::new(job)),
            priority,
            &group,
            dep_groups,
            deps,
        ) {
            Ok(_) => {
                state
                    .rpl
                    .entry((req.queue.clone(), rep_group))
                    .or_default()
                    .insert(key);
                added += 1;
            }
            Err(QueueError::AlreadyExists) => {
                dups += 1;
                let _ = shared.store.delete_live_job(&key);
            }
            Err(e) => return fail(ErrorToken::InternalError, e.to_string()),
        }
    }

    respond(ServerResponse {
        added,
        existed: dups + already_complete,
        ..Default::default()
    })
}

fn reserve(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: &ClientRequest,
    q: &Arc<Queue>,
    reply: &mut Option<oneshot::Sender<ServerResponse>>,
) -> std::result::Result<Reply, MethodError> {
    if req.client_id.is_nil() {
        return fail(ErrorToken::BadRequest, "reserve needs a client id");
    }
    if shared.drain.load(std::sync::atomic::Ordering::SeqCst) {
        // draining: act as if nothing were ready
        return ok();
    }

    let group = req
        .scheduler_group
        .as_deref()
        .filter(|g| !g.is_empty())
        .map(|g| g.to_string());

    // a runner's first reserve for a group we no longer want workers on is
    // turned away, so it exits instead of waiting out its timeout
    if let Some(g) = &group {
        if req.first_reserve
            && !shared.cfg.runner_cmd.is_empty()
            && state.group_count(&req.queue, g) == 0
        {
            return ok();
        }
    }

    match q.reserve(group.as_deref()) {
        Ok(item) => respond(finish_reserve(shared, q, item, req.client_id)),
        Err(QueueError::NothingReady) => {
            if req.timeout.is_zero() {
                return ok();
            }
            // poll on a separate task so the dispatcher is free; the poll
            // uses the queue's own locking
            let reply = reply
                .take()
                .expect("reserve reply channel already consumed");
            let shared = shared.clone();
            let q = q.clone();
            let client_id = req.client_id;
            let timeout = req.timeout;
            tokio::spawn(async move {
                let deadline = Instant::now() + timeout;
                let mut ticker = tokio::time::interval(shared.cfg.reserve_ticker);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                let resp = loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            // timed out: no job and no error
                            break ServerResponse::default();
                        }
                        _ = ticker.tick() => {
                            if shared.drain.load(std::sync::atomic::Ordering::SeqCst) {
                                break ServerResponse::default();
                            }
                            match q.reserve(group.as_deref()) {
                                Ok(item) => break finish_reserve(&shared, &q, item, client_id),
                                Err(QueueError::NothingReady) => continue,
                                Err(QueueError::QueueClosed) => {
                                    break ServerResponse {
                                        err: ErrorToken::QueueClosed.as_str().to_string(),
                                        ..Default::default()
                                    };
                                }
                                Err(_) => {
                                    break ServerResponse {
                                        err: ErrorToken::InternalError.as_str().to_string(),
                                        ..Default::default()
                                    };
                                }
                            }
                        }
                    }
                };
                let _ = reply.send(resp);
            });
            Ok(Reply::Deferred)
        }
        Err(QueueError::QueueClosed) => fail(ErrorToken::QueueClosed, "queue closed"),
        Err(e) => fail(ErrorToken::InternalError, e.to_string()),
    }
}

/// Clean up any stale execution state so the client gets a fresh job, and
/// hand it over with its environment attached.
fn finish_reserve(shared: &Shared, q: &Queue, item: Item, client_id: Uuid) -> ServerResponse {
    {
        let mut job = item.job.lock().unwrap();
        job.reserved_by = Some(client_id);
        job.exited = false;
        job.pid = None;
        job.host.clear();
        job.host_id.clear();
        job.host_ip.clear();
        job.start_time = None;
        job.end_time = None;
        job.peak_ram_mb = 0;
        job.exitcode = -1;
        job.lost = false;
        job.kill_called = false;
    }
    let _ = q.set_delay(&item.key, shared.cfg.release_delay);
    let job = item_to_job(shared, &item, false, true);
    ServerResponse {
        job: Some(job),
        ..Default::default()
    }
}

async fn jstart(
    shared: &Arc<Shared>,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let item = getij(req, q)?;
    let cr_job = req.job.as_ref().expect("getij checked");
    if cr_job.pid.is_none() || cr_job.host.is_empty() {
        return fail(ErrorToken::BadRequest, "jstart needs a pid and a host");
    }
    let host_id = shared.scheduler.host_to_id(&cr_job.host).await;
    let mut job = item.job.lock().unwrap();
    job.host = cr_job.host.clone();
    job.host_id = host_id;
    job.host_ip = cr_job.host_ip.clone();
    job.pid = cr_job.pid;
    job.start_time = Some(chrono::Utc::now());
    job.end_time = None;
    job.attempts += 1;
    job.kill_called = false;
    job.lost = false;
    ok()
}

fn jtouch(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let item = getij(req, q)?;
    let (mut kill_called, lost, rep_group) = {
        let job = item.job.lock().unwrap();
        (job.kill_called, job.lost, job.rep_group.clone())
    };
    if !kill_called {
        kill_called = state.kill_runners;
    }
    if !kill_called {
        q.touch(&item.key)
            .map_err(|e| (ErrorToken::InternalError, e.to_string()))?;
        if lost {
            {
                let mut job = item.job.lock().unwrap();
                job.lost = false;
                job.end_time = None;
            }
            // the queue saw no transition, so report lost -> running here
            shared.broadcast(&rep_group, JobState::Lost, JobState::Running);
        }
    }
    respond(ServerResponse {
        kill_called,
        ..Default::default()
    })
}

fn jend(
    shared: &Arc<Shared>,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let item = getij(req, q)?;
    let cr_job = req.job.as_ref().expect("getij checked");
    let snapshot = {
        let mut job = item.job.lock().unwrap();
        job.exited = true;
        job.exitcode = cr_job.exitcode;
        job.peak_ram_mb = cr_job.peak_ram_mb;
        job.cpu_time = cr_job.cpu_time;
        job.end_time = Some(chrono::Utc::now());
        job.actual_cwd = cr_job.actual_cwd.clone();
        job.clone()
    };
    shared
        .store
        .update_job_after_exit(&snapshot, &cr_job.std_out, &cr_job.std_err, false)
        .map_err(|e| (ErrorToken::DbError, e.to_string()))?;
    ok()
}

fn jarchive(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let item = getij(req, q)?;
    // getij confirmed the item is in the run queue; the job must also have
    // been through jend cleanly
    let (key, snapshot, rep_group) = {
        let mut job = item.job.lock().unwrap();
        if !job.exited
            || job.exitcode != 0
            || job.start_time.is_none()
            || job.end_time.is_none()
        {
            return fail(
                ErrorToken::BadRequest,
                "only cleanly exited jobs can be archived",
            );
        }
        job.state = JobState::Complete;
        job.fail_reason.clear();
        job.reserved_by = None;
        (job.key(), job.clone(), job.rep_group.clone())
    };
    shared
        .store
        .archive_job(&key, &snapshot)
        .map_err(|e| (ErrorToken::DbError, e.to_string()))?;
    q.remove(&key, JobState::Complete)
        .map_err(|e| (ErrorToken::InternalError, e.to_string()))?;
    if let Some(keys) = state.rpl.get_mut(&(req.queue.clone(), rep_group)) {
        keys.remove(&key);
    }
    ok()
}

fn jrelease(req: &ClientRequest, q: &Arc<Queue>) -> std::result::Result<Reply, MethodError> {
    let item = getij(req, q)?;
    let cr_job = req.job.as_ref().expect("getij checked");
    let until_buried = {
        let mut job = item.job.lock().unwrap();
        job.fail_reason = cr_job.fail_reason.clone();
        // only a job a client actually started counts against its retries
        if job.start_time.is_some() {
            job.until_buried = job.until_buried.saturating_sub(1);
        }
        job.reserved_by = None;
        job.until_buried
    };
    if until_buried == 0 {
        q.bury(&item.key)
            .map_err(|e| (ErrorToken::InternalError, e.to_string()))?;
    } else {
        q.release(&item.key)
            .map_err(|e| (ErrorToken::InternalError, e.to_string()))?;
    }
    ok()
}

fn jbury(
    shared: &Arc<Shared>,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let item = getij(req, q)?;
    let cr_job = req.job.as_ref().expect("getij checked");
    let snapshot = {
        let mut job = item.job.lock().unwrap();
        job.fail_reason = cr_job.fail_reason.clone();
        job.reserved_by = None;
        job.clone()
    };
    q.bury(&item.key)
        .map_err(|e| (ErrorToken::InternalError, e.to_string()))?;
    if !cr_job.std_err.is_empty() {
        if let Err(e) =
            shared
                .store
                .update_job_after_exit(&snapshot, &cr_job.std_out, &cr_job.std_err, true)
        {
            tracing::warn!(job = %item.key, error = %e, "could not store stdio for buried job");
        }
    }
    ok()
}

fn jkick(req: &ClientRequest, q: &Arc<Queue>) -> std::result::Result<Reply, MethodError> {
    let Some(keys) = &req.keys else {
        return fail(ErrorToken::BadRequest, "jkick needs keys");
    };
    // unlike the other j* methods, the caller needn't hold the reservation
    let mut kicked = 0;
    for key in keys {
        let Ok(item) = q.get(key) else { continue };
        if item.state != ItemState::Bury {
            continue;
        }
        if q.kick(key).is_ok() {
            let mut job = item.job.lock().unwrap();
            job.until_buried = u32::from(job.retries) + 1;
            kicked += 1;
        }
    }
    respond(ServerResponse {
        existed: kicked,
        ..Default::default()
    })
}

fn jdel(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let Some(keys) = &req.keys else {
        return fail(ErrorToken::BadRequest, "jdel needs keys");
    };
    let mut deleted = 0;
    for key in keys {
        let Ok(item) = q.get(key) else { continue };
        if item.state != ItemState::Bury {
            continue;
        }
        // removing a depended-on job would count as satisfying the
        // dependency and let downstream jobs start
        match q.has_dependents(key) {
            Ok(false) => {}
            _ => continue,
        }
        if q.remove(key, JobState::Unknown).is_ok() {
            deleted += 1;
            let rep_group = item.job.lock().unwrap().rep_group.clone();
            if let Some(keys) = state.rpl.get_mut(&(req.queue.clone(), rep_group)) {
                keys.remove(key);
            }
            if let Err(e) = shared.store.delete_live_job(key) {
                tracing::warn!(job = %key, error = %e, "could not delete job record");
            }
        }
    }
    respond(ServerResponse {
        existed: deleted,
        ..Default::default()
    })
}

fn jkill(req: &ClientRequest, q: &Arc<Queue>) -> std::result::Result<Reply, MethodError> {
    let Some(keys) = &req.keys else {
        return fail(ErrorToken::BadRequest, "jkill needs keys");
    };
    // only flags the jobs; the runner acts on it at its next jtouch
    let mut killable = 0;
    for key in keys {
        let Ok(item) = q.get(key) else { continue };
        if item.state != ItemState::Run {
            continue;
        }
        item.job.lock().unwrap().kill_called = true;
        killable += 1;
    }
    respond(ServerResponse {
        existed: killable,
        ..Default::default()
    })
}

fn get_by_cmds(
    shared: &Arc<Shared>,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let Some(keys) = &req.keys else {
        return fail(ErrorToken::BadRequest, "getbc needs keys");
    };
    let mut jobs = Vec::new();
    for key in keys {
        if let Ok(item) = q.get(key) {
            jobs.push(item_to_job(shared, &item, req.get_std, req.get_env));
            continue;
        }
        match shared.store.retrieve_complete_job(key) {
            Ok(Some(mut job)) => {
                job.state = JobState::Complete;
                populate_std_env(shared, &mut job, req.get_std, req.get_env);
                jobs.push(job);
            }
            Ok(None) => {}
            Err(e) => return fail(ErrorToken::DbError, e.to_string()),
        }
    }
    respond(ServerResponse {
        jobs: (!jobs.is_empty()).then_some(jobs),
        ..Default::default()
    })
}

fn get_by_rep_group(
    shared: &Arc<Shared>,
    state: &mut DispatcherState,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let rep_group = match &req.job {
        Some(job) if !job.rep_group.is_empty() => job.rep_group.clone(),
        _ => return fail(ErrorToken::BadRequest, "getbr needs a rep group"),
    };
    let mut jobs = Vec::new();
    if let Some(keys) = state.rpl.get(&(req.queue.clone(), rep_group.clone())) {
        for key in keys {
            if let Ok(item) = q.get(key) {
                jobs.push(item_to_job(shared, &item, req.get_std, req.get_env));
            }
        }
    }
    match shared.store.complete_jobs_by_rep_group(&rep_group, 0) {
        Ok(complete) => {
            for mut job in complete {
                job.state = JobState::Complete;
                populate_std_env(shared, &mut job, req.get_std, req.get_env);
                jobs.push(job);
            }
        }
        Err(e) => return fail(ErrorToken::DbError, e.to_string()),
    }
    filter_and_limit(&mut jobs, req);
    respond(ServerResponse {
        jobs: (!jobs.is_empty()).then_some(jobs),
        ..Default::default()
    })
}

fn get_in_current(
    shared: &Arc<Shared>,
    req: &ClientRequest,
    q: &Arc<Queue>,
) -> std::result::Result<Reply, MethodError> {
    let mut jobs: Vec<Job> = q
        .all_items()
        .iter()
        .map(|item| item_to_job(shared, item, req.get_std, req.get_env))
        .collect();
    filter_and_limit(&mut jobs, req);
    respond(ServerResponse {
        jobs: (!jobs.is_empty()).then_some(jobs),
        ..Default::default()
    })
}

fn filter_and_limit(jobs: &mut Vec<Job>, req: &ClientRequest) {
    if let Some(want) = req.state {
        jobs.retain(|j| j.state == want);
    }
    if req.limit > 0 && jobs.len() > req.limit {
        jobs.truncate(req.limit);
    }
}

/// Put persisted incomplete jobs back into their queues after a restart.
/// Providers are added before their dependents so dependency holds are
/// re-established.
pub(crate) fn recover_jobs(shared: &Arc<Shared>, state: &mut DispatcherState) -> Result<()> {
    let mut jobs = shared.store.live_jobs()?;
    if jobs.is_empty() {
        return Ok(());
    }
    for job in &mut jobs {
        job.reserved_by = None;
        job.lost = false;
        job.kill_called = false;
        job.pid = None;
        job.state = JobState::Unknown;
    }

    // keys and dep groups not yet re-added to a queue
    let mut pending_keys: HashSet<String> = jobs.iter().map(|j| j.key()).collect();
    let mut group_providers: HashMap<String, usize> = HashMap::new();
    for job in &jobs {
        for g in &job.dep_groups {
            *group_providers.entry(g.clone()).or_default() += 1;
        }
    }

    // providers first, so queue.add sees them live and re-establishes the
    // dependency holds
    let mut pending = jobs;
    let mut recovered = 0usize;
    while !pending.is_empty() {
        let mut progressed = false;
        let mut rest = Vec::new();
        for job in pending {
            let blocked = job.dependencies.iter().any(|d| {
                let name = d.name();
                pending_keys.contains(name) || group_providers.get(name).copied().unwrap_or(0) > 0
            });
            if blocked {
                rest.push(job);
                continue;
            }
            progressed = true;
            pending_keys.remove(&job.key());
            for g in &job.dep_groups {
                if let Some(n) = group_providers.get_mut(g) {
                    *n = n.saturating_sub(1);
                }
            }
            recover_one(shared, state, job);
            recovered += 1;
        }
        if !progressed {
            // dependency cycle or dangling reference; recover the rest as-is
            for job in rest.drain(..) {
                recover_one(shared, state, job);
                recovered += 1;
            }
        }
        pending = rest;
    }
    tracing::info!(count = recovered, "recovered persisted jobs");
    Ok(())
}

fn recover_one(shared: &Arc<Shared>, state: &mut DispatcherState, job: Job) {
    let queue_name = if job.queue.is_empty() {
        "cmds".to_string()
    } else {
        job.queue.clone()
    };
    let q = get_or_create_queue(shared, state, &queue_name);
    let key = job.key();
    let group = job.scheduler_group.clone();
    let priority = job.priority;
    let dep_groups = job.dep_groups.clone();
    let deps: Vec<String> = job
        .dependencies
        .iter()
        .map(|d| d.name().to_string())
        .collect();
    let rep_group = job.rep_group.clone();
    state
        .groups
        .entry((queue_name.clone(), group.clone()))
        .or_insert_with(|| GroupState {
            req: job.requirements.clone(),
            count: 0,
        });
    match q.add(
        &key,
        Arc::new(Mutex::new(job)),
        priority,
        &group,
        dep_groups,
        deps,
    ) {
        Ok(_) => {
            state
                .rpl
                .entry((queue_name, rep_group))
                .or_default()
                .insert(key);
        }
        Err(e) => {
            tracing::warn!(job = %key, error = %e, "could not requeue recovered job");
        }
    }
}
