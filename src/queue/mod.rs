//! A named, multi-sub-queue state machine for job items.
//!
//! Items move between delay, ready, run, bury and dependency sub-queues on
//! explicit calls or deadline expiry. A background task per queue handles the
//! deadlines; it is woken whenever an earlier deadline may have appeared.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::job::{Job, JobState};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("nothing ready")]
    NothingReady,
    #[error("queue closed")]
    QueueClosed,
}

/// Which sub-queue an item is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Delay,
    Ready,
    Run,
    Bury,
    Dependent,
}

/// What happens when a reserved item's TTR expires without a touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtrAction {
    /// Move the item back through the delay sub-queue.
    Release,
    /// Mark the job lost but leave the item in the run sub-queue; if
    /// `bury_after` is set and the job is never touched again, bury it.
    MarkLost { bury_after: Option<Duration> },
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub ttr: Duration,
    pub release_delay: Duration,
    pub ttr_action: TtrAction,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttr: Duration::from_secs(60),
            release_delay: Duration::from_secs(30),
            ttr_action: TtrAction::MarkLost { bury_after: None },
        }
    }
}

/// A state transition, as observed by the server for status broadcasting and
/// scheduler-group accounting. `from` is `Unknown` for newly added items.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub queue: String,
    pub key: String,
    pub rep_group: String,
    pub scheduler_group: String,
    pub from: JobState,
    pub to: JobState,
}

/// A point-in-time view of an item handed out by `get`/`reserve`.
#[derive(Clone, Debug)]
pub struct Item {
    pub key: String,
    pub job: Arc<Mutex<Job>>,
    pub state: ItemState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub delayed: usize,
    pub ready: usize,
    pub running: usize,
    pub buried: usize,
    pub dependent: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.delayed + self.ready + self.running + self.buried + self.dependent
    }
}

/// Outcome of `remove`: dependents whose last unresolved dependency this
/// removal satisfied, now moved to ready.
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub readied: Vec<String>,
}

// Ready ordering: higher priority first, insertion order within a priority.
type ReadyRank = (u8, u64);

struct Entry {
    job: Arc<Mutex<Job>>,
    state: ItemState,
    priority: u8,
    group: String,
    seq: u64,
    release_delay: Duration,
    delay_until: Option<Instant>,
    run_deadline: Option<Instant>,
    dep_groups: Vec<String>,
    unresolved: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    seq: u64,
    items: HashMap<String, Entry>,
    delay: BTreeMap<(Instant, u64), String>,
    ready_all: BTreeMap<ReadyRank, String>,
    ready_by_group: HashMap<String, BTreeMap<ReadyRank, String>>,
    run_deadlines: BTreeMap<(Instant, u64), String>,
    lost_deadlines: BTreeMap<(Instant, u64), String>,
    // dependency name (job key or dep group) -> keys of waiting items
    dep_index: HashMap<String, HashSet<String>>,
    // dep group name -> keys of live items contributing to it
    group_members: HashMap<String, HashSet<String>>,
}

pub struct Queue {
    name: String,
    cfg: QueueConfig,
    inner: Mutex<Inner>,
    wake: Arc<Notify>,
    events: UnboundedSender<QueueEvent>,
}

impl Queue {
    /// Create a queue and spawn its deadline task. The task stops when the
    /// queue is destroyed or the last reference to it is dropped.
    pub fn new(
        name: impl Into<String>,
        cfg: QueueConfig,
        events: UnboundedSender<QueueEvent>,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner::default()),
            wake: Arc::new(Notify::new()),
            events,
        });
        let weak = Arc::downgrade(&queue);
        let wake = queue.wake.clone();
        tokio::spawn(async move {
            deadline_task(weak, wake).await;
        });
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an item for `job`. Dependency names with a live referent (a queued
    /// job key, or a dependency group that still has live members) hold the
    /// item in the dependency sub-queue; the rest are considered already
    /// satisfied. Returns the state the item landed in.
    pub fn add(
        &self,
        key: &str,
        job: Arc<Mutex<Job>>,
        priority: u8,
        group: &str,
        dep_groups: Vec<String>,
        deps: Vec<String>,
    ) -> Result<JobState, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        if inner.items.contains_key(key) {
            return Err(QueueError::AlreadyExists);
        }

        let unresolved: HashSet<String> = deps
            .into_iter()
            .filter(|name| {
                inner.items.contains_key(name)
                    || inner.group_members.get(name).is_some_and(|m| !m.is_empty())
            })
            .collect();

        let seq = inner.seq;
        inner.seq += 1;
        for g in &dep_groups {
            inner
                .group_members
                .entry(g.clone())
                .or_default()
                .insert(key.to_string());
        }

        let state = if unresolved.is_empty() {
            inner.ready_all.insert((255 - priority, seq), key.to_string());
            inner
                .ready_by_group
                .entry(group.to_string())
                .or_default()
                .insert((255 - priority, seq), key.to_string());
            ItemState::Ready
        } else {
            for name in &unresolved {
                inner
                    .dep_index
                    .entry(name.clone())
                    .or_default()
                    .insert(key.to_string());
            }
            ItemState::Dependent
        };

        inner.items.insert(
            key.to_string(),
            Entry {
                job,
                state,
                priority,
                group: group.to_string(),
                seq,
                release_delay: self.cfg.release_delay,
                delay_until: None,
                run_deadline: None,
                dep_groups,
                unresolved,
            },
        );

        let to = match state {
            ItemState::Ready => JobState::Ready,
            _ => JobState::Dependent,
        };
        self.emit(&inner, key, JobState::Unknown, to);
        Ok(to)
    }

    pub fn get(&self, key: &str) -> Result<Item, QueueError> {
        let inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        let entry = inner.items.get(key).ok_or(QueueError::NotFound)?;
        Ok(Item {
            key: key.to_string(),
            job: entry.job.clone(),
            state: entry.state,
        })
    }

    /// Pop the highest-priority ready item, optionally restricted to one
    /// scheduler group, and move it to the run sub-queue with a fresh TTR.
    /// Never blocks: an empty ready sub-queue is `NothingReady`.
    pub fn reserve(&self, group: Option<&str>) -> Result<Item, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }

        let rank = match group {
            Some(g) => inner
                .ready_by_group
                .get(g)
                .and_then(|m| m.first_key_value())
                .map(|(rank, _)| *rank),
            None => inner.ready_all.first_key_value().map(|(rank, _)| *rank),
        };
        let rank = rank.ok_or(QueueError::NothingReady)?;
        let key = inner.ready_all.remove(&rank).ok_or(QueueError::NothingReady)?;

        let group_name = inner.items[&key].group.clone();
        if let Some(m) = inner.ready_by_group.get_mut(&group_name) {
            m.remove(&rank);
            if m.is_empty() {
                inner.ready_by_group.remove(&group_name);
            }
        }

        let deadline = Instant::now() + self.cfg.ttr;
        let (seq, job) = {
            let entry = inner.items.get_mut(&key).unwrap();
            entry.state = ItemState::Run;
            entry.run_deadline = Some(deadline);
            (entry.seq, entry.job.clone())
        };
        inner.run_deadlines.insert((deadline, seq), key.clone());

        self.emit(&inner, &key, JobState::Ready, JobState::Reserved);
        self.wake.notify_one();
        Ok(Item {
            key,
            job,
            state: ItemState::Run,
        })
    }

    /// Renew the TTR of a running item. Clears any lost deadline.
    pub fn touch(&self, key: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        let entry = inner.items.get(key).ok_or(QueueError::NotFound)?;
        if entry.state != ItemState::Run {
            return Err(QueueError::NotFound);
        }
        let seq = entry.seq;
        let old = entry.run_deadline;
        let deadline = Instant::now() + self.cfg.ttr;
        if let Some(old) = old {
            inner.run_deadlines.remove(&(old, seq));
        }
        inner.lost_deadlines.retain(|_, k| k.as_str() != key);
        let entry = inner.items.get_mut(key).unwrap();
        entry.run_deadline = Some(deadline);
        inner.run_deadlines.insert((deadline, seq), key.to_string());
        self.wake.notify_one();
        Ok(())
    }

    /// Move a running item into the delay sub-queue, to come ready again
    /// after its per-item release delay.
    pub fn release(&self, key: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        let entry = inner.items.get(key).ok_or(QueueError::NotFound)?;
        if entry.state != ItemState::Run {
            return Err(QueueError::NotFound);
        }
        let from = self.job_state_of(entry);
        let delay = entry.release_delay;
        self.detach_locked(&mut inner, key);
        if delay.is_zero() {
            self.push_ready_locked(&mut inner, key);
            self.emit(&inner, key, from, JobState::Ready);
        } else {
            let until = Instant::now() + delay;
            let entry = inner.items.get_mut(key).unwrap();
            entry.state = ItemState::Delay;
            entry.delay_until = Some(until);
            let seq = entry.seq;
            inner.delay.insert((until, seq), key.to_string());
            self.emit(&inner, key, from, JobState::Delayed);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Move a running or delayed item to the bury sub-queue.
    pub fn bury(&self, key: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        let entry = inner.items.get(key).ok_or(QueueError::NotFound)?;
        if entry.state != ItemState::Run && entry.state != ItemState::Delay {
            return Err(QueueError::NotFound);
        }
        let from = self.job_state_of(entry);
        self.detach_locked(&mut inner, key);
        inner.items.get_mut(key).unwrap().state = ItemState::Bury;
        self.emit(&inner, key, from, JobState::Buried);
        Ok(())
    }

    /// Move a buried item back to ready.
    pub fn kick(&self, key: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        let entry = inner.items.get(key).ok_or(QueueError::NotFound)?;
        if entry.state != ItemState::Bury {
            return Err(QueueError::NotFound);
        }
        self.push_ready_locked(&mut inner, key);
        self.emit(&inner, key, JobState::Buried, JobState::Ready);
        Ok(())
    }

    /// Remove an item from whichever sub-queue holds it, reporting the
    /// removal as a transition to `to` (complete for archival, unknown for
    /// deletion). Dependents waiting on this item's key, or on a dependency
    /// group it was the last live member of, have those names resolved; any
    /// that become fully resolved move to ready and are returned.
    pub fn remove(&self, key: &str, to: JobState) -> Result<RemoveOutcome, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        if !inner.items.contains_key(key) {
            return Err(QueueError::NotFound);
        }
        let from = self.job_state_of(&inner.items[key]);
        self.emit(&inner, key, from, to);
        self.detach_locked(&mut inner, key);
        let entry = inner.items.remove(key).unwrap();

        // un-index this item's own unresolved dependencies
        for name in &entry.unresolved {
            if let Some(waiters) = inner.dep_index.get_mut(name) {
                waiters.remove(key);
                if waiters.is_empty() {
                    inner.dep_index.remove(name);
                }
            }
        }

        // names satisfied by this removal: the key itself, plus any dep
        // group it was the last live member of
        let mut resolved = vec![key.to_string()];
        for g in &entry.dep_groups {
            if let Some(members) = inner.group_members.get_mut(g) {
                members.remove(key);
                if members.is_empty() {
                    inner.group_members.remove(g);
                    resolved.push(g.clone());
                }
            }
        }

        let mut outcome = RemoveOutcome::default();
        for name in resolved {
            let Some(waiters) = inner.dep_index.remove(&name) else {
                continue;
            };
            for waiter in waiters {
                let Some(w) = inner.items.get_mut(&waiter) else {
                    continue;
                };
                w.unresolved.remove(&name);
                if w.unresolved.is_empty() && w.state == ItemState::Dependent {
                    self.push_ready_locked(&mut inner, &waiter);
                    self.emit(&inner, &waiter, JobState::Dependent, JobState::Ready);
                    outcome.readied.push(waiter);
                }
            }
        }
        Ok(outcome)
    }

    /// Whether any queued item still depends on this item's key or on a
    /// dependency group it contributes to.
    pub fn has_dependents(&self, key: &str) -> Result<bool, QueueError> {
        let inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        let entry = inner.items.get(key).ok_or(QueueError::NotFound)?;
        if inner.dep_index.get(key).is_some_and(|w| !w.is_empty()) {
            return Ok(true);
        }
        Ok(entry
            .dep_groups
            .iter()
            .any(|g| inner.dep_index.get(g).is_some_and(|w| !w.is_empty())))
    }

    /// Set the delay an item will use the next time it is released.
    pub fn set_delay(&self, key: &str, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueError::QueueClosed);
        }
        let entry = inner.items.get_mut(key).ok_or(QueueError::NotFound)?;
        entry.release_delay = delay;
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = QueueStats::default();
        for entry in inner.items.values() {
            match entry.state {
                ItemState::Delay => stats.delayed += 1,
                ItemState::Ready => stats.ready += 1,
                ItemState::Run => stats.running += 1,
                ItemState::Bury => stats.buried += 1,
                ItemState::Dependent => stats.dependent += 1,
            }
        }
        stats
    }

    /// Snapshot of every live item, in no particular order.
    pub fn all_items(&self) -> Vec<Item> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .iter()
            .map(|(key, entry)| Item {
                key: key.clone(),
                job: entry.job.clone(),
                state: entry.state,
            })
            .collect()
    }

    /// Terminal state: drops all items; every subsequent operation returns
    /// `QueueClosed`.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.items.clear();
        inner.delay.clear();
        inner.ready_all.clear();
        inner.ready_by_group.clear();
        inner.run_deadlines.clear();
        inner.lost_deadlines.clear();
        inner.dep_index.clear();
        inner.group_members.clear();
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    // --- internals ---

    /// Remove the item's presence from delay/ready/run indexes (not from
    /// `items`), leaving its state to be set by the caller.
    fn detach_locked(&self, inner: &mut Inner, key: &str) {
        let entry = inner.items.get(key).unwrap();
        let seq = entry.seq;
        let rank = (255 - entry.priority, seq);
        let group = entry.group.clone();
        match entry.state {
            ItemState::Delay => {
                if let Some(until) = entry.delay_until {
                    inner.delay.remove(&(until, seq));
                }
            }
            ItemState::Ready => {
                inner.ready_all.remove(&rank);
                if let Some(m) = inner.ready_by_group.get_mut(&group) {
                    m.remove(&rank);
                    if m.is_empty() {
                        inner.ready_by_group.remove(&group);
                    }
                }
            }
            ItemState::Run => {
                if let Some(deadline) = entry.run_deadline {
                    inner.run_deadlines.remove(&(deadline, seq));
                }
                inner.lost_deadlines.retain(|_, k| k.as_str() != key);
            }
            ItemState::Bury | ItemState::Dependent => {}
        }
        let entry = inner.items.get_mut(key).unwrap();
        entry.delay_until = None;
        entry.run_deadline = None;
    }

    fn push_ready_locked(&self, inner: &mut Inner, key: &str) {
        let entry = inner.items.get_mut(key).unwrap();
        entry.state = ItemState::Ready;
        let rank = (255 - entry.priority, entry.seq);
        let group = entry.group.clone();
        inner.ready_all.insert(rank, key.to_string());
        inner
            .ready_by_group
            .entry(group)
            .or_default()
            .insert(rank, key.to_string());
    }

    /// The job-level state an item maps to, distinguishing reserved, running
    /// and lost for items in the run sub-queue.
    fn job_state_of(&self, entry: &Entry) -> JobState {
        match entry.state {
            ItemState::Delay => JobState::Delayed,
            ItemState::Ready => JobState::Ready,
            ItemState::Bury => JobState::Buried,
            ItemState::Dependent => JobState::Dependent,
            ItemState::Run => {
                let job = entry.job.lock().unwrap();
                if job.lost {
                    JobState::Lost
                } else if job.start_time.is_some() {
                    JobState::Running
                } else {
                    JobState::Reserved
                }
            }
        }
    }

    fn emit(&self, inner: &Inner, key: &str, from: JobState, to: JobState) {
        let entry = match inner.items.get(key) {
            Some(e) => e,
            None => return,
        };
        let (rep_group, scheduler_group) = {
            let job = entry.job.lock().unwrap();
            (job.rep_group.clone(), job.scheduler_group.clone())
        };
        let _ = self.events.send(QueueEvent {
            queue: self.name.clone(),
            key: key.to_string(),
            rep_group,
            scheduler_group,
            from,
            to,
        });
    }

    /// Process expired deadlines; returns the next wakeup instant, or None
    /// when the queue has been destroyed.
    fn process_deadlines(&self) -> Option<Instant> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return None;
        }
        let now = Instant::now();

        // delay expiries -> ready
        while let Some((&(until, _), _)) = inner.delay.first_key_value() {
            if until > now {
                break;
            }
            let (_, key) = inner.delay.pop_first().unwrap();
            if inner.items.get(&key).map(|e| e.state) == Some(ItemState::Delay) {
                self.push_ready_locked(&mut inner, &key);
                self.emit(&inner, &key, JobState::Delayed, JobState::Ready);
            }
        }

        // TTR expiries
        while let Some((&(deadline, _), _)) = inner.run_deadlines.first_key_value() {
            if deadline > now {
                break;
            }
            let (_, key) = inner.run_deadlines.pop_first().unwrap();
            let Some(entry) = inner.items.get(&key) else {
                continue;
            };
            if entry.state != ItemState::Run {
                continue;
            }
            match self.cfg.ttr_action {
                TtrAction::Release => {
                    let from = self.job_state_of(entry);
                    let delay = entry.release_delay;
                    {
                        let mut job = entry.job.lock().unwrap();
                        job.reserved_by = None;
                    }
                    let entry = inner.items.get_mut(&key).unwrap();
                    entry.run_deadline = None;
                    if delay.is_zero() {
                        self.push_ready_locked(&mut inner, &key);
                        self.emit(&inner, &key, from, JobState::Ready);
                    } else {
                        let until = now + delay;
                        let entry = inner.items.get_mut(&key).unwrap();
                        entry.state = ItemState::Delay;
                        entry.delay_until = Some(until);
                        let seq = entry.seq;
                        inner.delay.insert((until, seq), key.clone());
                        self.emit(&inner, &key, from, JobState::Delayed);
                    }
                }
                TtrAction::MarkLost { bury_after } => {
                    let from = self.job_state_of(entry);
                    let seq = entry.seq;
                    {
                        let mut job = entry.job.lock().unwrap();
                        job.lost = true;
                        job.end_time = Some(chrono::Utc::now());
                    }
                    inner.items.get_mut(&key).unwrap().run_deadline = None;
                    if let Some(grace) = bury_after {
                        inner.lost_deadlines.insert((now + grace, seq), key.clone());
                    }
                    self.emit(&inner, &key, from, JobState::Lost);
                }
            }
        }

        // lost-grace expiries -> bury
        while let Some((&(deadline, _), _)) = inner.lost_deadlines.first_key_value() {
            if deadline > now {
                break;
            }
            let (_, key) = inner.lost_deadlines.pop_first().unwrap();
            let Some(entry) = inner.items.get(&key) else {
                continue;
            };
            if entry.state != ItemState::Run || !entry.job.lock().unwrap().lost {
                continue;
            }
            {
                let mut job = entry.job.lock().unwrap();
                job.reserved_by = None;
            }
            self.detach_locked(&mut inner, &key);
            inner.items.get_mut(&key).unwrap().state = ItemState::Bury;
            self.emit(&inner, &key, JobState::Lost, JobState::Buried);
        }

        let next = [
            inner.delay.first_key_value().map(|(&(t, _), _)| t),
            inner.run_deadlines.first_key_value().map(|(&(t, _), _)| t),
            inner.lost_deadlines.first_key_value().map(|(&(t, _), _)| t),
        ]
        .into_iter()
        .flatten()
        .min();
        Some(next.unwrap_or_else(|| now + Duration::from_secs(3600)))
    }
}

async fn deadline_task(queue: Weak<Queue>, wake: Arc<Notify>) {
    loop {
        let next = {
            let Some(queue) = queue.upgrade() else { return };
            match queue.process_deadlines() {
                Some(next) => next,
                None => return,
            }
        };
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            _ = wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Requirements;

    fn job(cmd: &str) -> Arc<Mutex<Job>> {
        Arc::new(Mutex::new(Job::new(cmd, "/tmp", Requirements::default())))
    }

    fn queue(cfg: QueueConfig) -> Arc<Queue> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Queue::new("test", cfg, tx)
    }

    #[tokio::test]
    async fn add_then_reserve_orders_by_priority_then_fifo() {
        let q = queue(QueueConfig::default());
        q.add("low1", job("a"), 1, "g", vec![], vec![]).unwrap();
        q.add("high", job("b"), 9, "g", vec![], vec![]).unwrap();
        q.add("low2", job("c"), 1, "g", vec![], vec![]).unwrap();

        assert_eq!(q.reserve(None).unwrap().key, "high");
        assert_eq!(q.reserve(None).unwrap().key, "low1");
        assert_eq!(q.reserve(None).unwrap().key, "low2");
        assert_eq!(q.reserve(None).unwrap_err(), QueueError::NothingReady);
    }

    #[tokio::test]
    async fn reserve_filters_by_scheduler_group() {
        let q = queue(QueueConfig::default());
        q.add("a", job("a"), 0, "small", vec![], vec![]).unwrap();
        q.add("b", job("b"), 0, "big", vec![], vec![]).unwrap();

        assert_eq!(q.reserve(Some("big")).unwrap().key, "b");
        assert_eq!(
            q.reserve(Some("big")).unwrap_err(),
            QueueError::NothingReady
        );
        assert_eq!(q.reserve(Some("small")).unwrap().key, "a");
    }

    #[tokio::test]
    async fn duplicate_add_rejected() {
        let q = queue(QueueConfig::default());
        q.add("k", job("a"), 0, "g", vec![], vec![]).unwrap();
        assert_eq!(
            q.add("k", job("a"), 0, "g", vec![], vec![]).unwrap_err(),
            QueueError::AlreadyExists
        );
    }

    #[tokio::test]
    async fn release_delays_then_readies() {
        let cfg = QueueConfig {
            release_delay: Duration::from_millis(30),
            ..Default::default()
        };
        let q = queue(cfg);
        q.add("k", job("a"), 0, "g", vec![], vec![]).unwrap();
        q.reserve(None).unwrap();
        q.release("k").unwrap();
        assert_eq!(q.stats().delayed, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(q.stats().delayed, 0);
        assert_eq!(q.stats().ready, 1);
    }

    #[tokio::test]
    async fn ttr_expiry_marks_lost_but_stays_running() {
        let cfg = QueueConfig {
            ttr: Duration::from_millis(30),
            ttr_action: TtrAction::MarkLost { bury_after: None },
            ..Default::default()
        };
        let q = queue(cfg);
        q.add("k", job("a"), 0, "g", vec![], vec![]).unwrap();
        let item = q.reserve(None).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(q.stats().running, 1);
        assert!(item.job.lock().unwrap().lost);

        // a touch revives it
        q.touch("k").unwrap();
        assert_eq!(q.stats().running, 1);
    }

    #[tokio::test]
    async fn ttr_expiry_with_bury_grace() {
        let cfg = QueueConfig {
            ttr: Duration::from_millis(20),
            ttr_action: TtrAction::MarkLost {
                bury_after: Some(Duration::from_millis(30)),
            },
            ..Default::default()
        };
        let q = queue(cfg);
        q.add("k", job("a"), 0, "g", vec![], vec![]).unwrap();
        q.reserve(None).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(q.stats().buried, 1);
    }

    #[tokio::test]
    async fn dependencies_hold_until_provider_removed() {
        let q = queue(QueueConfig::default());
        let a = job("a");
        a.lock().unwrap().dep_groups = vec!["pre".to_string()];
        q.add("a", a, 0, "g", vec!["pre".to_string()], vec![]).unwrap();
        q.add("b", job("b"), 0, "g", vec![], vec!["pre".to_string()])
            .unwrap();
        assert_eq!(q.stats().dependent, 1);
        assert!(q.has_dependents("a").unwrap());

        let outcome = q.remove("a", JobState::Complete).unwrap();
        assert_eq!(outcome.readied, vec!["b".to_string()]);
        assert_eq!(q.stats().dependent, 0);
        assert_eq!(q.stats().ready, 1);
    }

    #[tokio::test]
    async fn dependency_on_absent_name_is_satisfied() {
        let q = queue(QueueConfig::default());
        q.add("b", job("b"), 0, "g", vec![], vec!["gone".to_string()])
            .unwrap();
        assert_eq!(q.stats().ready, 1);
    }

    #[tokio::test]
    async fn bury_and_kick_round_trip() {
        let q = queue(QueueConfig::default());
        q.add("k", job("a"), 0, "g", vec![], vec![]).unwrap();
        q.reserve(None).unwrap();
        q.bury("k").unwrap();
        assert_eq!(q.stats().buried, 1);
        q.kick("k").unwrap();
        assert_eq!(q.stats().ready, 1);
    }

    #[tokio::test]
    async fn destroy_closes_all_operations() {
        let q = queue(QueueConfig::default());
        q.add("k", job("a"), 0, "g", vec![], vec![]).unwrap();
        q.destroy();
        assert_eq!(
            q.add("x", job("x"), 0, "g", vec![], vec![]).unwrap_err(),
            QueueError::QueueClosed
        );
        assert_eq!(q.get("k").unwrap_err(), QueueError::QueueClosed);
        assert_eq!(q.reserve(None).unwrap_err(), QueueError::QueueClosed);
    }
}
