//! SQLite-backed persistent store for job records and their blobs.
//!
//! One `(key BLOB PRIMARY KEY, value BLOB)` table per named bucket: `live`
//! holds incomplete jobs, `complete` holds archived ones, `envs` holds
//! content-addressed environment blobs, and `stdouts`/`stderrs` hold captured
//! output for failed or buried jobs. The server serialises all mutations; the
//! mutex here only makes the handle cloneable across tasks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{DroverError, Result};
use crate::job::{env_key, Job};

/// Output below this size from a successful command is not worth keeping.
const STD_KEEP_THRESHOLD: usize = 4096;

const BUCKETS: [&str; 5] = ["live", "complete", "envs", "stdouts", "stderrs"];

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

fn encode_job(job: &Job) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(job, bincode::config::standard())?)
}

fn decode_job(bytes: &[u8]) -> Result<Job> {
    let (job, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(job)
}

impl Store {
    /// Open (or create) the database and its buckets.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             PRAGMA synchronous=FULL;",
        )?;
        for bucket in BUCKETS {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {bucket} (
                    key   BLOB PRIMARY KEY,
                    value BLOB NOT NULL
                );"
            ))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Store environment variable bytes under their content hash. Idempotent:
    /// storing the same bytes twice yields the same key and one row.
    pub fn store_env(&self, env: &[u8]) -> Result<String> {
        let key = env_key(env);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO envs (key, value) VALUES (?1, ?2)",
            params![key.as_bytes(), env],
        )?;
        Ok(key)
    }

    /// Environment bytes for a key; empty when the key is unknown.
    pub fn retrieve_env(&self, key: &str) -> Result<Vec<u8>> {
        let conn = self.conn.lock().unwrap();
        let env: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM envs WHERE key = ?1",
                params![key.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(env.unwrap_or_default())
    }

    /// Persist one incomplete job.
    pub fn store_live_job(&self, key: &str, job: &Job) -> Result<()> {
        let bytes = encode_job(job)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO live (key, value) VALUES (?1, ?2)",
            params![key.as_bytes(), bytes],
        )?;
        Ok(())
    }

    /// Persist a batch of incomplete jobs in one transaction, so a crash
    /// mid-`add` leaves either all or none of them durable.
    pub fn store_live_jobs<'a>(&self, jobs: impl IntoIterator<Item = (&'a str, &'a Job)>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (key, job) in jobs {
            let bytes = encode_job(job)?;
            tx.execute(
                "INSERT OR REPLACE INTO live (key, value) VALUES (?1, ?2)",
                params![key.as_bytes(), bytes],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_live_job(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM live WHERE key = ?1", params![key.as_bytes()])?;
        Ok(())
    }

    /// Whether a job with this key already completed in the past.
    pub fn job_completed_before(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM complete WHERE key = ?1",
                params![key.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete_complete_job(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM complete WHERE key = ?1",
            params![key.as_bytes()],
        )?;
        Ok(())
    }

    /// Move a job from the live bucket to the complete bucket, atomically.
    /// This must return before the queue forgets the item, so a crash can
    /// never lose the record.
    pub fn archive_job(&self, key: &str, job: &Job) -> Result<()> {
        let bytes = encode_job(job)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM live WHERE key = ?1", params![key.as_bytes()])?;
        tx.execute(
            "INSERT OR REPLACE INTO complete (key, value) VALUES (?1, ?2)",
            params![key.as_bytes(), bytes],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn retrieve_complete_job(&self, key: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM complete WHERE key = ?1",
                params![key.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        bytes.map(|b| decode_job(&b)).transpose()
    }

    /// Archived jobs whose rep group matches, newest insertion order last.
    pub fn complete_jobs_by_rep_group(&self, rep_group: &str, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM complete")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut jobs = Vec::new();
        for row in rows {
            let job = decode_job(&row?)?;
            if job.rep_group == rep_group {
                jobs.push(job);
                if limit > 0 && jobs.len() >= limit {
                    break;
                }
            }
        }
        Ok(jobs)
    }

    /// All incomplete jobs, for queue recovery at startup.
    pub fn live_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM live")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(decode_job(&row?)?);
        }
        Ok(jobs)
    }

    /// Record a job's post-exit state. Stdout/stderr are only kept when they
    /// are likely to be wanted later: the command failed, the job is being
    /// buried, or the output is sizeable.
    pub fn update_job_after_exit(
        &self,
        job: &Job,
        stdout: &[u8],
        stderr: &[u8],
        burying: bool,
    ) -> Result<()> {
        let key = job.key();
        let bytes = encode_job(job)?;
        let keep = burying
            || job.exitcode != 0
            || stdout.len() > STD_KEEP_THRESHOLD
            || stderr.len() > STD_KEEP_THRESHOLD;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO live (key, value) VALUES (?1, ?2)",
            params![key.as_bytes(), bytes],
        )?;
        if keep {
            if !stdout.is_empty() {
                tx.execute(
                    "INSERT OR REPLACE INTO stdouts (key, value) VALUES (?1, ?2)",
                    params![key.as_bytes(), stdout],
                )?;
            }
            if !stderr.is_empty() {
                tx.execute(
                    "INSERT OR REPLACE INTO stderrs (key, value) VALUES (?1, ?2)",
                    params![key.as_bytes(), stderr],
                )?;
            }
        } else {
            tx.execute("DELETE FROM stdouts WHERE key = ?1", params![key.as_bytes()])?;
            tx.execute("DELETE FROM stderrs WHERE key = ?1", params![key.as_bytes()])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Captured stdout and stderr for a job; empty when nothing was kept.
    pub fn retrieve_job_std(&self, key: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let conn = self.conn.lock().unwrap();
        let stdout: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM stdouts WHERE key = ?1",
                params![key.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        let stderr: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM stderrs WHERE key = ?1",
                params![key.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok((stdout.unwrap_or_default(), stderr.unwrap_or_default()))
    }

    /// A consistent snapshot of the whole database as bytes, suitable for
    /// writing straight to a file and opening as a store.
    pub fn backup(&self) -> Result<Vec<u8>> {
        let staging = tempfile::Builder::new()
            .prefix("drover-backup")
            .tempdir()?;
        let target = staging.path().join("backup.db");
        let target_str = target
            .to_str()
            .ok_or_else(|| DroverError::Internal("non-utf8 backup path".to_string()))?
            .replace('\'', "''");
        {
            let conn = self.conn.lock().unwrap();
            conn.execute_batch(&format!("VACUUM INTO '{target_str}'"))?;
        }
        Ok(std::fs::read(&target)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
