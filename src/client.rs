//! Typed client for the manager's wire protocol, used by the CLI, by
//! runners, and by the integration tests. One request is in flight at a time
//! per client, matching the server's request/reply framing.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DroverError, ErrorToken, Result};
use crate::job::{Job, JobState};
use crate::protocol::{
    self, ClientRequest, FramedStream, Method, ServerResponse, ServerStats,
};

pub struct Client {
    framed: FramedStream,
    queue: String,
    user: String,
    client_id: Uuid,
}

impl Client {
    /// Connect to a manager, retrying until `wait` has elapsed, and verify it
    /// answers a ping.
    pub async fn connect(
        addr: &str,
        queue: impl Into<String>,
        user: impl Into<String>,
        wait: Duration,
    ) -> Result<Client> {
        let deadline = Instant::now() + wait;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e.into());
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        let mut client = Client {
            framed: protocol::frame(stream),
            queue: queue.into(),
            user: user.into(),
            client_id: Uuid::new_v4(),
        };
        client.ping().await?;
        Ok(client)
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn base(&self, method: Method) -> ClientRequest {
        let mut req = ClientRequest::new(&self.queue, method, &self.user);
        req.client_id = self.client_id;
        req
    }

    async fn call(&mut self, req: ClientRequest) -> Result<ServerResponse> {
        self.framed.send(protocol::encode(&req)?).await?;
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| DroverError::Internal("connection closed by server".to_string()))??;
        let resp: ServerResponse = protocol::decode(&frame)?;
        if resp.err.is_empty() {
            Ok(resp)
        } else {
            match ErrorToken::parse(&resp.err) {
                Some(token) => Err(DroverError::Server(token)),
                None => Err(DroverError::Internal(resp.err)),
            }
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.call(self.base(Method::Ping)).await.map(|_| ())
    }

    pub async fn server_stats(&mut self) -> Result<ServerStats> {
        let resp = self.call(self.base(Method::SStats)).await?;
        resp.s_stats
            .ok_or_else(|| DroverError::Internal("sstats response had no stats".to_string()))
    }

    /// A consistent snapshot of the server's database.
    pub async fn backup(&mut self) -> Result<Vec<u8>> {
        let resp = self.call(self.base(Method::Backup)).await?;
        resp.db
            .ok_or_else(|| DroverError::Internal("backup response had no data".to_string()))
    }

    pub async fn drain(&mut self) -> Result<ServerStats> {
        let resp = self.call(self.base(Method::Drain)).await?;
        resp.s_stats
            .ok_or_else(|| DroverError::Internal("drain response had no stats".to_string()))
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.call(self.base(Method::Shutdown)).await.map(|_| ())
    }

    /// Submit jobs along with the environment they should execute under.
    /// Returns (added, existed).
    pub async fn add_jobs(
        &mut self,
        jobs: Vec<Job>,
        env: Vec<u8>,
        ignore_complete: bool,
    ) -> Result<(usize, usize)> {
        let mut req = self.base(Method::Add);
        req.jobs = Some(jobs);
        req.env = Some(env);
        req.ignore_complete = ignore_complete;
        let resp = self.call(req).await?;
        Ok((resp.added, resp.existed))
    }

    /// Take the next ready job, waiting up to `timeout` for one to appear.
    pub async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>> {
        let mut req = self.base(Method::Reserve);
        req.timeout = timeout;
        Ok(self.call(req).await?.job)
    }

    /// Like `reserve`, restricted to one scheduler group. Runners set
    /// `first_reserve` on their first call so a finished group turns them
    /// away immediately.
    pub async fn reserve_in_group(
        &mut self,
        group: &str,
        first_reserve: bool,
        timeout: Duration,
    ) -> Result<Option<Job>> {
        let mut req = self.base(Method::Reserve);
        req.scheduler_group = Some(group.to_string());
        req.first_reserve = first_reserve;
        req.timeout = timeout;
        Ok(self.call(req).await?.job)
    }

    /// Report that the job's command has started executing.
    pub async fn started(
        &mut self,
        job: &mut Job,
        pid: u32,
        host: &str,
        host_ip: &str,
    ) -> Result<()> {
        job.pid = Some(pid);
        job.host = host.to_string();
        job.host_ip = host_ip.to_string();
        let mut req = self.base(Method::JStart);
        req.job = Some(job.clone());
        self.call(req).await.map(|_| ())
    }

    /// Renew the reservation. A true return means kill was called: stop the
    /// command and bury the job instead of carrying on.
    pub async fn touch(&mut self, job: &Job) -> Result<bool> {
        let mut req = self.base(Method::JTouch);
        req.job = Some(job.clone());
        Ok(self.call(req).await?.kill_called)
    }

    /// Report the command's exit status and captured output.
    #[allow(clippy::too_many_arguments)]
    pub async fn ended(
        &mut self,
        job: &mut Job,
        exitcode: i32,
        peak_ram_mb: u64,
        cpu_time: f64,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    ) -> Result<()> {
        job.exitcode = exitcode;
        job.peak_ram_mb = peak_ram_mb;
        job.cpu_time = cpu_time;
        job.std_out = stdout;
        job.std_err = stderr;
        let mut req = self.base(Method::JEnd);
        req.job = Some(job.clone());
        self.call(req).await.map(|_| ())
    }

    /// Move a cleanly finished job to the archive.
    pub async fn archive(&mut self, job: &Job) -> Result<()> {
        let mut req = self.base(Method::JArchive);
        req.job = Some(job.clone());
        self.call(req).await.map(|_| ())
    }

    /// Give the job up for retry (or burial once its retries are spent).
    pub async fn release(&mut self, job: &mut Job, fail_reason: &str) -> Result<()> {
        job.fail_reason = fail_reason.to_string();
        let mut req = self.base(Method::JRelease);
        req.job = Some(job.clone());
        self.call(req).await.map(|_| ())
    }

    pub async fn bury(&mut self, job: &mut Job, fail_reason: &str) -> Result<()> {
        job.fail_reason = fail_reason.to_string();
        let mut req = self.base(Method::JBury);
        req.job = Some(job.clone());
        self.call(req).await.map(|_| ())
    }

    /// Un-bury jobs; returns how many were kicked.
    pub async fn kick(&mut self, keys: Vec<String>) -> Result<usize> {
        let mut req = self.base(Method::JKick);
        req.keys = Some(keys);
        Ok(self.call(req).await?.existed)
    }

    /// Delete buried jobs with no dependents; returns how many went.
    pub async fn delete(&mut self, keys: Vec<String>) -> Result<usize> {
        let mut req = self.base(Method::JDel);
        req.keys = Some(keys);
        Ok(self.call(req).await?.existed)
    }

    /// Flag running jobs for their runners to kill; returns how many were
    /// flagged.
    pub async fn kill(&mut self, keys: Vec<String>) -> Result<usize> {
        let mut req = self.base(Method::JKill);
        req.keys = Some(keys);
        Ok(self.call(req).await?.existed)
    }

    pub async fn jobs_by_keys(
        &mut self,
        keys: Vec<String>,
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let mut req = self.base(Method::GetByCmds);
        req.keys = Some(keys);
        req.get_std = get_std;
        req.get_env = get_env;
        Ok(self.call(req).await?.jobs.unwrap_or_default())
    }

    pub async fn jobs_by_rep_group(
        &mut self,
        rep_group: &str,
        limit: usize,
        state: Option<JobState>,
    ) -> Result<Vec<Job>> {
        let mut req = self.base(Method::GetByRepGroup);
        req.job = Some(Job {
            rep_group: rep_group.to_string(),
            ..Default::default()
        });
        req.limit = limit;
        req.state = state;
        Ok(self.call(req).await?.jobs.unwrap_or_default())
    }

    pub async fn jobs_current(
        &mut self,
        limit: usize,
        state: Option<JobState>,
    ) -> Result<Vec<Job>> {
        let mut req = self.base(Method::GetInCurrent);
        req.limit = limit;
        req.state = state;
        Ok(self.call(req).await?.jobs.unwrap_or_default())
    }
}
