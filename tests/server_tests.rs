mod test_harness;

use std::time::Duration;

use drover::error::{DroverError, ErrorToken};
use drover::job::{Dependency, JobState};
use drover::server::StopReason;
use drover::storage::Store;

use test_harness::{assert_eventually, echo_job, start_manager, start_manager_with, test_env};

/// The full happy path: add, reserve, start, touch, end, archive.
#[tokio::test]
async fn test_add_reserve_complete() {
    let m = start_manager().await;
    let mut client = m.client().await;

    let job = echo_job("hi");
    let key = job.key();
    let (added, existed) = client
        .add_jobs(vec![job], test_env(), false)
        .await
        .unwrap();
    assert_eq!((added, existed), (1, 0));
    assert_eq!(client.server_stats().await.unwrap().ready, 1);

    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(reserved.key(), key);
    assert_eq!(reserved.state, JobState::Reserved);
    assert_eq!(client.server_stats().await.unwrap().ready, 0);

    client
        .started(&mut reserved, 42, "localhost", "127.0.0.1")
        .await
        .unwrap();
    assert!(!client.touch(&reserved).await.unwrap());
    client
        .ended(&mut reserved, 0, 10, 0.1, b"hi\n".to_vec(), Vec::new())
        .await
        .unwrap();
    client.archive(&reserved).await.unwrap();

    let stats = client.server_stats().await.unwrap();
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.running, 0);

    let jobs = client
        .jobs_by_keys(vec![key.clone()], false, false)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Complete);
    assert_eq!(jobs[0].exitcode, 0);
}

/// Jobs with the same cmd and significant cwd are deduplicated.
#[tokio::test]
async fn test_deduplication() {
    let m = start_manager().await;
    let mut client = m.client().await;

    let job = echo_job("dup");
    let (added, existed) = client
        .add_jobs(vec![job.clone(), job.clone()], test_env(), false)
        .await
        .unwrap();
    assert_eq!((added, existed), (1, 1));
    assert_eq!(client.server_stats().await.unwrap().ready, 1);

    // a repeat submission leaves the state identical
    let (added, existed) = client.add_jobs(vec![job], test_env(), false).await.unwrap();
    assert_eq!((added, existed), (0, 1));
    assert_eq!(client.server_stats().await.unwrap().ready, 1);
}

/// An archived job is only re-acceptable with ignore_complete.
#[tokio::test]
async fn test_resubmit_after_complete() {
    let m = start_manager().await;
    let mut client = m.client().await;

    let job = echo_job("again");
    client
        .add_jobs(vec![job.clone()], test_env(), false)
        .await
        .unwrap();
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();
    client
        .ended(&mut reserved, 0, 0, 0.0, Vec::new(), Vec::new())
        .await
        .unwrap();
    client.archive(&reserved).await.unwrap();

    let (added, existed) = client
        .add_jobs(vec![job.clone()], test_env(), false)
        .await
        .unwrap();
    assert_eq!((added, existed), (0, 1));

    let (added, existed) = client.add_jobs(vec![job], test_env(), true).await.unwrap();
    assert_eq!((added, existed), (1, 0));
}

/// A job depending on a dep group becomes ready the moment the group's last
/// member completes.
#[tokio::test]
async fn test_dependency_resolution() {
    let m = start_manager().await;
    let mut client = m.client().await;

    let mut a = echo_job("first");
    a.dep_groups = vec!["pre".to_string()];
    let mut b = echo_job("second");
    b.dependencies = vec![Dependency::DepGroup("pre".to_string())];
    let b_key = b.key();

    client
        .add_jobs(vec![a, b], test_env(), false)
        .await
        .unwrap();
    let dependent = client
        .jobs_current(0, Some(JobState::Dependent))
        .await
        .unwrap();
    assert_eq!(dependent.len(), 1);
    assert_eq!(dependent[0].key(), b_key);

    // only A is reservable
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(reserved.cmd, "echo first");
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();
    client
        .ended(&mut reserved, 0, 0, 0.0, Vec::new(), Vec::new())
        .await
        .unwrap();
    client.archive(&reserved).await.unwrap();

    let ready = client.jobs_current(0, Some(JobState::Ready)).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].key(), b_key);
}

/// Retries exhaust through delayed retries into burial; kick resurrects.
#[tokio::test]
async fn test_bury_and_kick() {
    let m = start_manager().await;
    let mut client = m.client().await;

    let job = echo_job("flaky").with_retries(1);
    let key = job.key();
    client.add_jobs(vec![job], test_env(), false).await.unwrap();

    // first failed attempt -> delayed
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();
    client.release(&mut reserved, "boom").await.unwrap();
    assert_eq!(client.server_stats().await.unwrap().delayed, 1);

    // past the release delay it comes ready again
    assert_eventually(
        || async {
            let mut c = m.client().await;
            c.server_stats().await.unwrap().ready == 1
        },
        Duration::from_secs(2),
        "released job never came ready",
    )
    .await;

    // second failed attempt -> buried
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 2, "localhost", "127.0.0.1")
        .await
        .unwrap();
    client.release(&mut reserved, "boom again").await.unwrap();
    assert_eq!(client.server_stats().await.unwrap().buried, 1);
    assert!(client.reserve(Duration::ZERO).await.unwrap().is_none());

    // kick resets the remaining attempts to retries + 1
    assert_eq!(client.kick(vec![key.clone()]).await.unwrap(), 1);
    let jobs = client.jobs_by_keys(vec![key], false, false).await.unwrap();
    assert_eq!(jobs[0].state, JobState::Ready);
    assert_eq!(jobs[0].until_buried, 2);
}

/// jkill only flags the job; the runner finds out at its next touch.
#[tokio::test]
async fn test_kill_propagation() {
    let m = start_manager().await;
    let mut client = m.client().await;

    let job = echo_job("victim");
    let key = job.key();
    client.add_jobs(vec![job], test_env(), false).await.unwrap();
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 7, "localhost", "127.0.0.1")
        .await
        .unwrap();

    assert_eq!(client.kill(vec![key]).await.unwrap(), 1);
    assert!(client.touch(&reserved).await.unwrap());
}

/// An unknown user is turned away before anything else happens.
#[tokio::test]
async fn test_wrong_user() {
    let m = start_manager().await;
    let err = m.client_as("mallory").await.err().unwrap();
    assert!(matches!(
        err,
        DroverError::Server(ErrorToken::WrongUser)
    ));
}

/// Only the reserving client may drive a job's lifecycle.
#[tokio::test]
async fn test_must_reserve() {
    let m = start_manager().await;
    let mut c1 = m.client().await;
    let mut c2 = m.client().await;

    client_add_one(&mut c1).await;
    let reserved = c1.reserve(Duration::ZERO).await.unwrap().unwrap();

    let err = c2.touch(&reserved).await.err().unwrap();
    assert!(matches!(
        err,
        DroverError::Server(ErrorToken::MustReserve)
    ));
}

async fn client_add_one(client: &mut drover::client::Client) {
    client
        .add_jobs(vec![echo_job("one")], test_env(), false)
        .await
        .unwrap();
}

/// Archiving needs a clean jend first, and a released job can't be archived.
#[tokio::test]
async fn test_archive_preconditions() {
    let m = start_manager().await;
    let mut client = m.client().await;

    client_add_one(&mut client).await;
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();

    // no jend yet
    let err = client.archive(&reserved).await.err().unwrap();
    assert!(matches!(
        err,
        DroverError::Server(ErrorToken::BadRequest)
    ));

    // after release the item is out of the run queue
    client.release(&mut reserved, "").await.unwrap();
    let err = client.archive(&reserved).await.err().unwrap();
    assert!(matches!(err, DroverError::Server(ErrorToken::BadJob)));
}

/// reserve with a zero timeout returns immediately empty; with a timeout it
/// waits for work to appear.
#[tokio::test]
async fn test_reserve_blocking() {
    let m = start_manager().await;
    let mut client = m.client().await;

    assert!(client.reserve(Duration::ZERO).await.unwrap().is_none());

    let addr = m.addr.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut c = drover::client::Client::connect(
            &addr,
            "cmds",
            test_harness::TEST_USER,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        c.add_jobs(vec![echo_job("late")], test_env(), false)
            .await
            .unwrap();
    });

    let got = client.reserve(Duration::from_secs(3)).await.unwrap();
    assert!(got.is_some());
}

/// A reserved job goes lost when its TTR lapses untouched, and a touch
/// revives it.
#[tokio::test]
async fn test_ttr_lost_and_revival() {
    let m = start_manager().await;
    let mut client = m.client().await;

    client_add_one(&mut client).await;
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();
    let key = reserved.key();

    assert_eventually(
        || async {
            let mut c = m.client().await;
            let jobs = c
                .jobs_by_keys(vec![key.clone()], false, false)
                .await
                .unwrap();
            jobs[0].state == JobState::Lost
        },
        Duration::from_secs(2),
        "untouched job never went lost",
    )
    .await;

    // still works from the reserving client, and revives the job
    assert!(!client.touch(&reserved).await.unwrap());
    let jobs = client
        .jobs_by_keys(vec![key.clone()], false, false)
        .await
        .unwrap();
    assert_eq!(jobs[0].state, JobState::Running);
}

/// Jobs are retrievable by rep group, live or archived.
#[tokio::test]
async fn test_get_by_rep_group() {
    let m = start_manager().await;
    let mut client = m.client().await;

    let a = echo_job("r1").with_rep_group("batch");
    let b = echo_job("r2").with_rep_group("batch");
    client
        .add_jobs(vec![a, b], test_env(), false)
        .await
        .unwrap();
    assert_eq!(client.jobs_by_rep_group("batch", 0, None).await.unwrap().len(), 2);

    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();
    client
        .ended(&mut reserved, 0, 0, 0.0, Vec::new(), Vec::new())
        .await
        .unwrap();
    client.archive(&reserved).await.unwrap();

    let jobs = client.jobs_by_rep_group("batch", 0, None).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().any(|j| j.state == JobState::Complete));
}

/// Failed jobs keep their stderr in the store, fetchable with get_std.
#[tokio::test]
async fn test_failed_job_keeps_stdio() {
    let m = start_manager().await;
    let mut client = m.client().await;

    client_add_one(&mut client).await;
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    let key = reserved.key();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();
    client
        .ended(&mut reserved, 1, 0, 0.0, Vec::new(), b"it broke\n".to_vec())
        .await
        .unwrap();
    client.release(&mut reserved, "nonzero exit").await.unwrap();

    let jobs = client.jobs_by_keys(vec![key], true, false).await.unwrap();
    assert_eq!(jobs[0].std_err, b"it broke\n");
    assert_eq!(jobs[0].fail_reason, "nonzero exit");
}

/// backup produces bytes that open as a store with identical contents.
#[tokio::test]
async fn test_backup_round_trip() {
    let m = start_manager().await;
    let mut client = m.client().await;

    client
        .add_jobs(vec![echo_job("keep me")], test_env(), false)
        .await
        .unwrap();
    let bytes = client.backup().await.unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("restored.db");
    std::fs::write(&path, bytes).unwrap();
    let restored = Store::open(&path).unwrap();
    let jobs = restored.live_jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].cmd, "echo keep me");
}

/// Draining refuses new adds, lets the in-flight job finish, then stops.
#[tokio::test]
async fn test_drain() {
    let mut m = start_manager().await;
    let mut client = m.client().await;

    client_add_one(&mut client).await;
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();

    client.drain().await.unwrap();
    let err = client
        .add_jobs(vec![echo_job("too late")], test_env(), false)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        DroverError::Server(ErrorToken::ClosedStop)
    ));
    assert!(client.reserve(Duration::ZERO).await.unwrap().is_none());

    client
        .ended(&mut reserved, 0, 0, 0.0, Vec::new(), Vec::new())
        .await
        .unwrap();
    client.archive(&reserved).await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), m.server.block())
        .await
        .expect("server did not stop after drain completed");
    assert_eq!(reason, StopReason::Stop);
}

/// shutdown stops the server; block reports it.
#[tokio::test]
async fn test_shutdown() {
    let mut m = start_manager().await;
    let mut client = m.client().await;
    client.shutdown().await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), m.server.block())
        .await
        .expect("server did not stop after shutdown request");
    assert_eq!(reason, StopReason::Stop);
}

/// State transitions are broadcast in the order they happened.
#[tokio::test]
async fn test_status_broadcast_order() {
    let m = start_manager().await;
    let mut events = m.server.status_events();
    let mut client = m.client().await;

    client_add_one(&mut client).await;
    let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    client
        .started(&mut reserved, 1, "localhost", "127.0.0.1")
        .await
        .unwrap();
    client
        .ended(&mut reserved, 0, 0, 0.0, Vec::new(), Vec::new())
        .await
        .unwrap();
    client.archive(&reserved).await.unwrap();

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while seen.len() < 3 {
        let event = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => event.unwrap(),
        };
        if event.rep_group == "+all+" {
            seen.push((event.from, event.to));
        }
    }
    assert_eq!(
        seen,
        vec![
            (JobState::Unknown, JobState::Ready),
            (JobState::Ready, JobState::Reserved),
            (JobState::Running, JobState::Complete),
        ]
    );
}

/// A runner's first reserve for a group with no outstanding work is turned
/// away at once rather than waiting out its timeout.
#[tokio::test]
async fn test_first_reserve_gating() {
    let m = start_manager_with(|cfg| {
        cfg.runner_cmd = "true".to_string();
    })
    .await;
    let mut client = m.client().await;

    let started = tokio::time::Instant::now();
    let got = client
        .reserve_in_group("no-such-group", true, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(got.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
}
