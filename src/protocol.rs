//! Wire protocol: length-framed messages carrying bincode-encoded request
//! and response records. One request record shape serves every method; the
//! server dispatches on `method` and ignores fields the method doesn't use.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Job, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "sstats")]
    SStats,
    #[serde(rename = "backup")]
    Backup,
    #[serde(rename = "drain")]
    Drain,
    #[serde(rename = "shutdown")]
    Shutdown,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "reserve")]
    Reserve,
    #[serde(rename = "jstart")]
    JStart,
    #[serde(rename = "jtouch")]
    JTouch,
    #[serde(rename = "jend")]
    JEnd,
    #[serde(rename = "jarchive")]
    JArchive,
    #[serde(rename = "jrelease")]
    JRelease,
    #[serde(rename = "jbury")]
    JBury,
    #[serde(rename = "jkick")]
    JKick,
    #[serde(rename = "jdel")]
    JDel,
    #[serde(rename = "jkill")]
    JKill,
    #[serde(rename = "getbc")]
    GetByCmds,
    #[serde(rename = "getbr")]
    GetByRepGroup,
    #[serde(rename = "getin")]
    GetInCurrent,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Method::Ping => "ping",
            Method::SStats => "sstats",
            Method::Backup => "backup",
            Method::Drain => "drain",
            Method::Shutdown => "shutdown",
            Method::Add => "add",
            Method::Reserve => "reserve",
            Method::JStart => "jstart",
            Method::JTouch => "jtouch",
            Method::JEnd => "jend",
            Method::JArchive => "jarchive",
            Method::JRelease => "jrelease",
            Method::JBury => "jbury",
            Method::JKick => "jkick",
            Method::JDel => "jdel",
            Method::JKill => "jkill",
            Method::GetByCmds => "getbc",
            Method::GetByRepGroup => "getbr",
            Method::GetInCurrent => "getin",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub queue: String,
    pub method: Method,
    pub user: String,
    /// Identifies the reserving client; the zero UUID is rejected for
    /// reserve.
    pub client_id: Uuid,
    #[serde(default)]
    pub job: Option<Job>,
    #[serde(default)]
    pub jobs: Option<Vec<Job>>,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<u8>>,
    #[serde(default)]
    pub env_key: Option<String>,
    #[serde(default)]
    pub scheduler_group: Option<String>,
    /// Set on a runner's first reserve, so the server can turn away runners
    /// whose group has no work left.
    #[serde(default)]
    pub first_reserve: bool,
    /// How long reserve may wait for something to become ready.
    #[serde(default)]
    pub timeout: Duration,
    #[serde(default)]
    pub ignore_complete: bool,
    #[serde(default)]
    pub get_std: bool,
    #[serde(default)]
    pub get_env: bool,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub state: Option<JobState>,
}

impl ClientRequest {
    pub fn new(queue: impl Into<String>, method: Method, user: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            method,
            user: user.into(),
            client_id: Uuid::nil(),
            job: None,
            jobs: None,
            keys: None,
            env: None,
            env_key: None,
            scheduler_group: None,
            first_reserve: false,
            timeout: Duration::ZERO,
            ignore_complete: false,
            get_std: false,
            get_env: false,
            limit: 0,
            state: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerResponse {
    /// Empty on success; otherwise one of the stable error tokens.
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub s_stats: Option<ServerStats>,
    #[serde(default)]
    pub db: Option<Vec<u8>>,
    #[serde(default)]
    pub job: Option<Job>,
    #[serde(default)]
    pub jobs: Option<Vec<Job>>,
    #[serde(default)]
    pub added: usize,
    #[serde(default)]
    pub existed: usize,
    #[serde(default)]
    pub kill_called: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerInfo {
    pub addr: String,
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub deployment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerStats {
    pub server_info: ServerInfo,
    pub delayed: usize,
    pub ready: usize,
    pub running: usize,
    pub buried: usize,
}

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Backup responses carry a whole database, so frames are allowed to be far
/// larger than the codec's default.
const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

pub fn frame(stream: TcpStream) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    Ok(Bytes::from(bytes))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}
