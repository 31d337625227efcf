use crate::error::{RequestError, SessionError};
use serde::{Deserialize, Serialize};

/// Number of ranked keywords requested when the caller does not say otherwise.
pub const DEFAULT_TOP_N: u32 = 20;

fn default_top_n() -> u32 {
    DEFAULT_TOP_N
}

/// Body of `POST /aggregate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRequest {
    /// Absolute path of the text file. Only the worker opens it.
    pub file_path: String,
    pub keyword: String,
    #[serde(default = "default_top_n")]
    pub top_n: u32,
}

impl AggregateRequest {
    pub fn new(file_path: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            keyword: keyword.into(),
            top_n: DEFAULT_TOP_N,
        }
    }

    pub fn with_top_n(mut self, top_n: u32) -> Self {
        self.top_n = top_n;
        self
    }

    /// Reject requests the worker could never answer meaningfully.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.file_path.trim().is_empty() {
            return Err(RequestError::EmptyFilePath);
        }
        if self.keyword.trim().is_empty() {
            return Err(RequestError::EmptyKeyword);
        }
        if self.top_n == 0 {
            return Err(RequestError::ZeroTopN);
        }
        Ok(())
    }
}

/// One ranked entry of the tally. On the wire this is a `[word, count]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, u64)", into = "(String, u64)")]
pub struct KeywordCount {
    pub word: String,
    pub count: u64,
}

impl KeywordCount {
    pub fn new(word: impl Into<String>, count: u64) -> Self {
        Self {
            word: word.into(),
            count,
        }
    }
}

impl From<(String, u64)> for KeywordCount {
    fn from((word, count): (String, u64)) -> Self {
        Self { word, count }
    }
}

impl From<KeywordCount> for (String, u64) {
    fn from(k: KeywordCount) -> Self {
        (k.word, k.count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Progress,
    Done,
    Error,
}

/// One decoded record of the worker's response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub processed: u64,
    pub total: u64,
    /// Ordered by descending count, as ranked by the worker.
    pub keywords: Vec<KeywordCount>,
    pub message: Option<String>,
}

impl Frame {
    pub fn progress(processed: u64, total: u64, keywords: Vec<KeywordCount>) -> Self {
        Self {
            kind: FrameKind::Progress,
            processed,
            total,
            keywords,
            message: None,
        }
    }

    pub fn done(processed: u64, total: u64, keywords: Vec<KeywordCount>) -> Self {
        Self {
            kind: FrameKind::Done,
            processed,
            total,
            keywords,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Error,
            processed: 0,
            total: 0,
            keywords: Vec::new(),
            message: Some(message.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, FrameKind::Done | FrameKind::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// Externally visible counters of a session: the latest snapshot reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub processed: u64,
    pub total: u64,
    pub keywords: Vec<KeywordCount>,
}

impl Tally {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (self.processed as f64 / self.total as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }
}

/// Session updates routed to presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Progress(Tally),
    Completed(Tally),
    Failed {
        reason: SessionError,
        // Last snapshot seen before the failure, if any.
        last: Tally,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Progress(_))
    }
}

/// Final record of a session, printed in JSON mode and written by `--export-json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub finished_at_utc: String,
    pub file_path: String,
    pub keyword: String,
    pub top_n: u32,
    pub status: SessionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub processed: u64,
    pub total: u64,
    pub keywords: Vec<KeywordCount>,
}
