//! Rejection reasons for jobs.

use thiserror::Error;

use crate::{scan::ScanError, staging::StagingError, workspace::WorkspaceError};

/// Why a job was rejected. The `Display` output is what ends up as the
/// job's failure reason on the queue.
#[derive(Error, Debug)]
pub enum JobError {
    /// The payload could not be turned into a job.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The workspace could not be created.
    #[error("workspace: {0}")]
    Workspace(#[from] WorkspaceError),

    /// A blob could not be staged.
    #[error("staging: {0}")]
    Staging(#[from] StagingError),

    /// The scanner failed.
    #[error("scan: {0}")]
    Scan(#[from] ScanError),

    /// The job's task ended without producing an outcome.
    #[error("job aborted: {0}")]
    Aborted(String),
}

impl JobError {
    /// Rejection for a payload that failed to decode.
    pub fn malformed_payload(err: impl std::fmt::Display) -> Self {
        JobError::InvalidJob(format!("malformed payload: {err}"))
    }

    /// Short label for the stage the job failed in, used in log fields.
    pub fn phase(&self) -> &'static str {
        match self {
            JobError::InvalidJob(_) => "decode",
            JobError::Workspace(_) => "workspace",
            JobError::Staging(_) => "staging",
            JobError::Scan(_) => "scan",
            JobError::Aborted(_) => "worker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reason_names_the_phase() {
        let err = JobError::from(WorkspaceError::InvalidJobId("a/b".into()));
        assert_eq!(err.phase(), "workspace");
        assert_eq!(
            err.to_string(),
            r#"workspace: job id "a/b" is not usable as a directory name"#
        );

        let err = JobError::from(ScanError::ReportTooLarge { limit: 8 });
        assert_eq!(err.phase(), "scan");
        assert_eq!(err.to_string(), "scan: scanner report exceeded 8 bytes");
    }

    #[test]
    fn malformed_payload_is_an_invalid_job() {
        let decode = serde_json::from_str::<crate::job::JobPayload>("not json")
            .unwrap_err();
        let err = JobError::malformed_payload(&decode);
        assert_eq!(err.phase(), "decode");
        assert_eq!(
            err.to_string(),
            format!("invalid job: malformed payload: {decode}")
        );
    }
}
