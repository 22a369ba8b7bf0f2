mod test_harness;

use std::time::Duration;

use drover::job::{Dependency, JobState};
use drover::server::StopReason;

use test_harness::{echo_job, start_manager_in, test_env};

/// Jobs survive a manager restart, dependency holds included.
#[tokio::test]
async fn test_restart_recovers_live_jobs() {
    let dir = tempfile::TempDir::new().unwrap();

    let b_key;
    {
        let mut m = start_manager_in(dir.path(), |_| {}).await;
        let mut client = m.client().await;

        let mut a = echo_job("provider").with_rep_group("r");
        a.dep_groups = vec!["stage1".to_string()];
        let mut b = echo_job("dependent").with_rep_group("r");
        b.dependencies = vec![Dependency::DepGroup("stage1".to_string())];
        b_key = b.key();
        client
            .add_jobs(vec![a, b], test_env(), false)
            .await
            .unwrap();

        m.server.stop(StopReason::Stop);
        m.server.block().await;
    }

    let m = start_manager_in(dir.path(), |_| {}).await;
    let mut client = m.client().await;

    let jobs = client.jobs_current(0, None).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let dependent: Vec<_> = jobs
        .iter()
        .filter(|j| j.state == JobState::Dependent)
        .collect();
    assert_eq!(dependent.len(), 1);
    assert_eq!(dependent[0].key(), b_key);

    // the recovered provider is reservable, and its environment survived
    let reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(reserved.cmd, "echo provider");
    assert_eq!(reserved.env, test_env());
}

/// A reservation does not survive a restart: the job comes back ready for
/// any client.
#[tokio::test]
async fn test_restart_clears_reservations() {
    let dir = tempfile::TempDir::new().unwrap();

    {
        let mut m = start_manager_in(dir.path(), |_| {}).await;
        let mut client = m.client().await;
        client
            .add_jobs(vec![echo_job("mid-flight")], test_env(), false)
            .await
            .unwrap();
        let mut reserved = client.reserve(Duration::ZERO).await.unwrap().unwrap();
        client
            .started(&mut reserved, 9, "localhost", "127.0.0.1")
            .await
            .unwrap();

        m.server.stop(StopReason::Stop);
        m.server.block().await;
    }

    let m = start_manager_in(dir.path(), |_| {}).await;
    let mut client = m.client().await;
    let stats = client.server_stats().await.unwrap();
    assert_eq!(stats.ready, 1);
    assert!(client.reserve(Duration::ZERO).await.unwrap().is_some());
}

/// Archived jobs stay archived across restarts.
#[tokio::test]
async fn test_restart_keeps_archive() {
    let dir = tempfile::TempDir::new().unwrap();
    let key;

    {
        let mut m = start_manager_in(dir.path(), |_| {}).await;
        let mut client = m.client().await;
        let job = echo_job("done");
        key = job.key();
        client.add_jobs(vec![job], test_env(), false).await.unwrap();
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

        m.server.stop(StopReason::Stop);
        m.server.block().await;
    }

    let m = start_manager_in(dir.path(), |_| {}).await;
    let mut client = m.client().await;
    assert_eq!(client.server_stats().await.unwrap().ready, 0);
    let jobs = client
        .jobs_by_keys(vec![key.clone()], false, false)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Complete);

    // and it still dedups new submissions
    let (added, existed) = client
        .add_jobs(vec![echo_job("done")], test_env(), false)
        .await
        .unwrap();
    assert_eq!((added, existed), (0, 1));
}
