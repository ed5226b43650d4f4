//! Jobs as the worker sees them, and their wire payload.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Queue-assigned identifier for a scan job.
///
/// The id doubles as the name of the job's workspace directory, so it is
/// validated as a single path component before any filesystem work.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Wraps a raw queue id without validating it.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One blob to stage: its content key in object storage and where it lands
/// relative to the workspace root.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobFile {
    /// Object key of the blob.
    pub hash: String,
    /// Destination relative to the workspace root.
    pub path: String,
}

impl JobFile {
    /// File staged from `hash` to `path`.
    pub fn new(hash: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            path: path.into(),
        }
    }
}

/// Wire payload stored alongside a queued job id.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Files to stage, in payload order.
    #[serde(default)]
    pub files: Vec<JobFile>,
}

/// A unit of scan work as seen by the worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    /// Queue id; also names the workspace directory.
    pub id: JobId,
    /// Files to stage before the scan.
    pub files: Vec<JobFile>,
}

impl Job {
    /// Job with the given id and files.
    pub fn new(id: impl Into<JobId>, files: Vec<JobFile>) -> Self {
        Self {
            id: id.into(),
            files,
        }
    }

    /// Job built from a decoded wire payload.
    pub fn from_payload(id: JobId, payload: JobPayload) -> Self {
        Self {
            id,
            files: payload.files,
        }
    }

    /// Wire payload for enqueueing this job.
    pub fn payload(&self) -> JobPayload {
        JobPayload {
            files: self.files.clone(),
        }
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Proof of ownership handed out with each delivery. Queue backends that
/// lock jobs compare it before accepting a settlement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseToken {
    /// Fresh, time-ordered token.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job delivered to this worker together with its lease token.
#[derive(Clone, Debug)]
pub struct JobLease {
    /// The delivered job.
    pub job: Job,
    /// Token the settlement must present.
    pub token: LeaseToken,
}

impl JobLease {
    /// Lease with a fresh token, for queues that do not issue their own.
    pub fn new(job: Job) -> Self {
        Self {
            job,
            token: LeaseToken::new(),
        }
    }
}

/// Settlement value for a successful job: the scanner's raw stdout.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Scanner stdout, passed through untouched.
    pub result: String,
}

impl ScanReport {
    /// Report carrying `result` verbatim.
    pub fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_matches_queue_wire_format() {
        let raw = r#"{"files":[{"hash":"abc","path":"src/a.txt"}]}"#;
        let payload: JobPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.files, vec![JobFile::new("abc", "src/a.txt")]);

        let job = Job::from_payload(JobId::new("42"), payload);
        assert_eq!(job.id.as_str(), "42");
    }

    #[test]
    fn payload_without_files_is_empty() {
        let payload: JobPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.files.is_empty());
    }

    #[test]
    fn report_serializes_as_result_object() {
        let report = ScanReport::new(r#"{"files":[]}"#);
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"result":"{\"files\":[]}"}"#);
    }
}
