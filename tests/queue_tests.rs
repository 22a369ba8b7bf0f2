//! Queue behaviour that the server relies on: ordering, grouping, delays,
//! TTR policy and the transition event stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use drover::job::{Job, JobState, Requirements};
use drover::queue::{Queue, QueueConfig, QueueError, TtrAction};

fn job(cmd: &str) -> Arc<Mutex<Job>> {
    Arc::new(Mutex::new(Job::new(
        cmd,
        "/tmp",
        Requirements::new(100, Duration::from_secs(60), 1, 0),
    )))
}

fn make_queue(
    cfg: QueueConfig,
) -> (
    Arc<Queue>,
    tokio::sync::mpsc::UnboundedReceiver<drover::queue::QueueEvent>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (Queue::new("q", cfg, tx), rx)
}

#[tokio::test]
async fn ready_order_is_priority_then_insertion() {
    let (q, _rx) = make_queue(QueueConfig::default());
    q.add("a", job("a"), 0, "g", vec![], vec![]).unwrap();
    q.add("b", job("b"), 200, "g", vec![], vec![]).unwrap();
    q.add("c", job("c"), 200, "g", vec![], vec![]).unwrap();
    q.add("d", job("d"), 100, "g", vec![], vec![]).unwrap();

    let order: Vec<String> = (0..4).map(|_| q.reserve(None).unwrap().key).collect();
    assert_eq!(order, ["b", "c", "d", "a"]);
}

#[tokio::test]
async fn kick_returns_to_fifo_position_by_insertion() {
    let (q, _rx) = make_queue(QueueConfig::default());
    q.add("a", job("a"), 0, "g", vec![], vec![]).unwrap();
    q.add("b", job("b"), 0, "g", vec![], vec![]).unwrap();

    // bury the earlier item, kick it back: it still comes out first because
    // insertion order is preserved
    q.reserve(None).unwrap();
    q.bury("a").unwrap();
    q.kick("a").unwrap();
    assert_eq!(q.reserve(None).unwrap().key, "a");
    assert_eq!(q.reserve(None).unwrap().key, "b");
}

#[tokio::test]
async fn set_delay_controls_release() {
    let cfg = QueueConfig {
        release_delay: Duration::from_secs(30),
        ..Default::default()
    };
    let (q, _rx) = make_queue(cfg);
    q.add("k", job("k"), 0, "g", vec![], vec![]).unwrap();
    q.reserve(None).unwrap();
    q.set_delay("k", Duration::ZERO).unwrap();
    q.release("k").unwrap();
    // a zero delay goes straight back to ready
    assert_eq!(q.stats().ready, 1);
}

#[tokio::test]
async fn ttr_release_mode_requeues_through_delay() {
    let cfg = QueueConfig {
        ttr: Duration::from_millis(30),
        release_delay: Duration::from_millis(30),
        ttr_action: TtrAction::Release,
    };
    let (q, _rx) = make_queue(cfg);
    q.add("k", job("k"), 0, "g", vec![], vec![]).unwrap();
    q.reserve(None).unwrap();
    assert_eq!(q.stats().running, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(q.stats().running, 0);
    assert_eq!(q.stats().ready, 1);
}

#[tokio::test]
async fn chained_dependencies_resolve_one_level_at_a_time() {
    let (q, _rx) = make_queue(QueueConfig::default());
    let a = job("a");
    a.lock().unwrap().dep_groups = vec!["one".to_string()];
    let b = job("b");
    b.lock().unwrap().dep_groups = vec!["two".to_string()];
    q.add("a", a, 0, "g", vec!["one".to_string()], vec![]).unwrap();
    q.add("b", b, 0, "g", vec!["two".to_string()], vec!["one".to_string()])
        .unwrap();
    q.add("c", job("c"), 0, "g", vec![], vec!["two".to_string()])
        .unwrap();
    assert_eq!(q.stats().dependent, 2);

    let outcome = q.remove("a", JobState::Complete).unwrap();
    assert_eq!(outcome.readied, vec!["b".to_string()]);
    assert_eq!(q.stats().dependent, 1);

    let outcome = q.remove("b", JobState::Complete).unwrap();
    assert_eq!(outcome.readied, vec!["c".to_string()]);
    assert_eq!(q.stats().dependent, 0);
}

#[tokio::test]
async fn dependency_on_two_group_members_needs_both() {
    let (q, _rx) = make_queue(QueueConfig::default());
    let a1 = job("a1");
    a1.lock().unwrap().dep_groups = vec!["pre".to_string()];
    let a2 = job("a2");
    a2.lock().unwrap().dep_groups = vec!["pre".to_string()];
    q.add("a1", a1, 0, "g", vec!["pre".to_string()], vec![]).unwrap();
    q.add("a2", a2, 0, "g", vec!["pre".to_string()], vec![]).unwrap();
    q.add("b", job("b"), 0, "g", vec![], vec!["pre".to_string()])
        .unwrap();

    let outcome = q.remove("a1", JobState::Complete).unwrap();
    assert!(outcome.readied.is_empty());
    assert_eq!(q.stats().dependent, 1);

    let outcome = q.remove("a2", JobState::Complete).unwrap();
    assert_eq!(outcome.readied, vec!["b".to_string()]);
}

#[tokio::test]
async fn touch_only_works_in_run_queue() {
    let (q, _rx) = make_queue(QueueConfig::default());
    q.add("k", job("k"), 0, "g", vec![], vec![]).unwrap();
    assert_eq!(q.touch("k").unwrap_err(), QueueError::NotFound);
    q.reserve(None).unwrap();
    q.touch("k").unwrap();
}

#[tokio::test]
async fn transition_events_carry_from_and_to() {
    let (q, mut rx) = make_queue(QueueConfig {
        release_delay: Duration::from_millis(20),
        ..Default::default()
    });
    q.add("k", job("k"), 0, "g", vec![], vec![]).unwrap();
    q.reserve(None).unwrap();
    q.release("k").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut transitions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        transitions.push((event.from, event.to));
    }
    assert_eq!(
        transitions,
        vec![
            (JobState::Unknown, JobState::Ready),
            (JobState::Ready, JobState::Reserved),
            (JobState::Reserved, JobState::Delayed),
            (JobState::Delayed, JobState::Ready),
        ]
    );
}

#[tokio::test]
async fn delay_expiry_wakes_promptly() {
    let cfg = QueueConfig {
        release_delay: Duration::from_millis(25),
        ..Default::default()
    };
    let (q, _rx) = make_queue(cfg);
    q.add("k", job("k"), 0, "g", vec![], vec![]).unwrap();
    q.reserve(None).unwrap();
    q.release("k").unwrap();

    let start = tokio::time::Instant::now();
    loop {
        if q.stats().ready == 1 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "delay expiry took too long"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
