//! Test harness for manager integration tests.
//!
//! Provides a server started on an ephemeral port with a temporary store and
//! fast queue timings, plus connected clients and polling assertions.
#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use drover::client::Client;
use drover::config::ManagerConfig;
use drover::error::Result;
use drover::job::{Job, Requirements};
use drover::scheduler::local::LocalBackend;
use drover::server::Server;

pub const TEST_USER: &str = "tester";

pub struct TestManager {
    pub server: Server,
    pub addr: String,
    pub cfg: ManagerConfig,
    _dir: Option<TempDir>,
}

/// Start a manager with fast timings suitable for tests.
pub async fn start_manager() -> TestManager {
    start_manager_with(|_| {}).await
}

pub async fn start_manager_with(tweak: impl FnOnce(&mut ManagerConfig)) -> TestManager {
    let dir = TempDir::new().unwrap();
    let mut manager = start_manager_in(dir.path(), tweak).await;
    manager._dir = Some(dir);
    manager
}

/// Start a manager whose state lives in `dir`, which outlives the manager;
/// used by restart/recovery tests.
pub async fn start_manager_in(
    dir: &Path,
    tweak: impl FnOnce(&mut ManagerConfig),
) -> TestManager {
    let mut cfg = ManagerConfig::new(0, dir.to_path_buf());
    cfg.allowed_users = vec![TEST_USER.to_string()];
    cfg.ttr = Duration::from_millis(300);
    cfg.release_delay = Duration::from_millis(50);
    cfg.reserve_ticker = Duration::from_millis(20);
    tweak(&mut cfg);

    let backend = Arc::new(LocalBackend::with_resources("bash", 8, 16000, 100));
    let server = Server::serve(cfg.clone(), backend).await.unwrap();
    let addr = format!("127.0.0.1:{}", server.addr().port());
    TestManager {
        server,
        addr,
        cfg,
        _dir: None,
    }
}

impl TestManager {
    pub async fn client(&self) -> Client {
        self.client_as(TEST_USER).await.unwrap()
    }

    pub async fn client_as(&self, user: &str) -> Result<Client> {
        Client::connect(&self.addr, "cmds", user, Duration::from_secs(2)).await
    }
}

/// A small job whose command is unique to `tag`.
pub fn echo_job(tag: &str) -> Job {
    Job::new(
        format!("echo {tag}"),
        "/tmp",
        Requirements::new(100, Duration::from_secs(60), 1, 0),
    )
}

pub fn test_env() -> Vec<u8> {
    b"PATH=/usr/bin:/bin".to_vec()
}

/// Poll `condition` every 50ms until it holds or `timeout` passes.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{}", message);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
