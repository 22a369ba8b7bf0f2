use thiserror::Error;

/// Client-visible error tokens. These strings are part of the wire protocol
/// and must stay stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorToken {
    WrongUser,
    BadRequest,
    BadJob,
    DbError,
    InternalError,
    UnknownCommand,
    MustReserve,
    QueueClosed,
    ClosedStop,
    ClosedInt,
    ClosedTerm,
    NothingReady,
    Impossible,
}

impl ErrorToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorToken::WrongUser => "WrongUser",
            ErrorToken::BadRequest => "BadRequest",
            ErrorToken::BadJob => "BadJob",
            ErrorToken::DbError => "DBError",
            ErrorToken::InternalError => "InternalError",
            ErrorToken::UnknownCommand => "UnknownCommand",
            ErrorToken::MustReserve => "MustReserve",
            ErrorToken::QueueClosed => "QueueClosed",
            ErrorToken::ClosedStop => "ClosedStop",
            ErrorToken::ClosedInt => "ClosedInt",
            ErrorToken::ClosedTerm => "ClosedTerm",
            ErrorToken::NothingReady => "NothingReady",
            ErrorToken::Impossible => "Impossible",
        }
    }

    /// Parse a token out of a response's `err` string.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "WrongUser" => ErrorToken::WrongUser,
            "BadRequest" => ErrorToken::BadRequest,
            "BadJob" => ErrorToken::BadJob,
            "DBError" => ErrorToken::DbError,
            "InternalError" => ErrorToken::InternalError,
            "UnknownCommand" => ErrorToken::UnknownCommand,
            "MustReserve" => ErrorToken::MustReserve,
            "QueueClosed" => ErrorToken::QueueClosed,
            "ClosedStop" => ErrorToken::ClosedStop,
            "ClosedInt" => ErrorToken::ClosedInt,
            "ClosedTerm" => ErrorToken::ClosedTerm,
            "NothingReady" => ErrorToken::NothingReady,
            "Impossible" => ErrorToken::Impossible,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DroverError {
    /// A request failed; carries the context the operator log wants alongside
    /// the coarse token the client saw.
    #[error("queue {queue}, method {method}, job [{key}]: {detail}")]
    Request {
        queue: String,
        method: String,
        key: String,
        detail: String,
    },

    #[error("server replied {0}")]
    Server(ErrorToken),

    #[error("queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("cloud error: {0}")]
    Cloud(#[from] crate::cloud::CloudError),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request can never be satisfied: {0}")]
    Impossible(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::EncodeError> for DroverError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DroverError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DroverError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DroverError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DroverError>;
