//! Per-job scratch directories.
//!
//! A workspace lives at `<scratch_dir>/<job id>` from the moment staging
//! starts until the scan process has exited. [`Workspace::cleanup`] is the
//! normal way out; the drop guard only fires when a job unwinds before it
//! got there.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::job::JobId;

/// Workspace setup and path resolution failures.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// The job id is not a single plain path component.
    #[error("job id {0:?} is not usable as a directory name")]
    InvalidJobId(String),

    /// A relative path would resolve outside the workspace.
    #[error("path {path:?} escapes the workspace root")]
    UnsafePath {
        /// The rejected path as supplied.
        path: String,
    },

    /// Creating or removing a directory failed.
    #[error("workspace I/O failed for {}: {source}", path.display())]
    Io {
        /// Path being created or removed.
        path: PathBuf,
        /// Filesystem failure.
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Normalises a relative path taken from a job or an object key.
///
/// `.` segments are dropped; anything that could climb out of the root
/// (`..`, absolute paths, drive prefixes) or that normalises to nothing is
/// rejected.
pub fn safe_relative_path(raw: &str) -> Result<PathBuf, WorkspaceError> {
    let unsafe_path = || WorkspaceError::UnsafePath {
        path: raw.to_string(),
    };

    if raw.is_empty() || raw.contains('\0') {
        return Err(unsafe_path());
    }

    let mut normalised = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(segment) => normalised.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }

    if normalised.as_os_str().is_empty() {
        return Err(unsafe_path());
    }
    Ok(normalised)
}

/// A job id must name exactly one directory under the scratch root.
pub fn validate_job_id(id: &JobId) -> Result<(), WorkspaceError> {
    let mut components = Path::new(id.as_str()).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(segment)), None)
            if segment == id.as_str() && !id.as_str().contains('\0') =>
        {
            Ok(())
        }
        _ => Err(WorkspaceError::InvalidJobId(id.to_string())),
    }
}

/// A job's private scratch directory. Removed by [`Workspace::cleanup`],
/// or on drop if cleanup never ran.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    armed: bool,
}

impl Workspace {
    /// Creates an empty workspace for `job_id` under `scratch_dir`.
    ///
    /// A directory left behind by an earlier delivery of the same job is
    /// removed first so the new workspace always starts empty.
    pub async fn create(
        scratch_dir: &Path,
        job_id: &JobId,
    ) -> Result<Self, WorkspaceError> {
        validate_job_id(job_id)?;

        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|err| WorkspaceError::io(scratch_dir, err))?;

        let root = scratch_dir.join(job_id.as_str());
        match tokio::fs::try_exists(&root).await {
            Ok(true) => {
                warn!(
                    job_id = %job_id,
                    path = %root.display(),
                    "removing stale workspace from a previous delivery"
                );
                tokio::fs::remove_dir_all(&root)
                    .await
                    .map_err(|err| WorkspaceError::io(&root, err))?;
            }
            Ok(false) => {}
            Err(err) => return Err(WorkspaceError::io(&root, err)),
        }

        tokio::fs::create_dir(&root)
            .await
            .map_err(|err| WorkspaceError::io(&root, err))?;
        debug!(job_id = %job_id, path = %root.display(), "workspace created");

        Ok(Self { root, armed: true })
    }

    /// Root directory handed to the scanner.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolves a job-supplied relative path to its location inside the
    /// workspace.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        Ok(self.root.join(safe_relative_path(relative)?))
    }

    /// Recursively removes the workspace. A directory that is already gone
    /// counts as removed.
    pub async fn cleanup(mut self) -> Result<(), WorkspaceError> {
        self.armed = false;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(path = %self.root.display(), "workspace removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WorkspaceError::io(&self.root, err)),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Only reached when the owning job unwound before cleanup ran.
        if let Err(err) = std::fs::remove_dir_all(&self.root)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(
                path = %self.root.display(),
                error = %err,
                "failed to remove abandoned workspace"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_normalised() {
        assert_eq!(
            safe_relative_path("src/./lib/a.rs").unwrap(),
            PathBuf::from("src/lib/a.rs")
        );
        assert_eq!(
            safe_relative_path("a.txt").unwrap(),
            PathBuf::from("a.txt")
        );
    }

    #[test]
    fn escaping_paths_are_rejected() {
        for raw in ["", ".", "./", "../a", "a/../../b", "a/..", "/etc/passwd"] {
            assert!(
                matches!(
                    safe_relative_path(raw),
                    Err(WorkspaceError::UnsafePath { .. })
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn job_ids_must_be_single_components() {
        assert!(validate_job_id(&JobId::new("42")).is_ok());
        assert!(validate_job_id(&JobId::new("scan-7f3a")).is_ok());
        for raw in ["", ".", "..", "a/b", "/42", "42/"] {
            assert!(
                validate_job_id(&JobId::new(raw)).is_err(),
                "{raw:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn create_and_cleanup_round_trip() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("42"))
            .await
            .unwrap();
        let root = workspace.path().to_path_buf();
        assert_eq!(root, scratch.path().join("42"));
        assert!(root.is_dir());

        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("nested/file"), b"x").unwrap();

        workspace.cleanup().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn stale_workspace_is_replaced() {
        let scratch = tempfile::tempdir().unwrap();
        let stale = scratch.path().join("7");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("leftover"), b"old").unwrap();

        let workspace = Workspace::create(scratch.path(), &JobId::new("7"))
            .await
            .unwrap();
        assert!(!workspace.path().join("leftover").exists());
        workspace.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_an_armed_workspace_removes_it() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("9"))
            .await
            .unwrap();
        let root = workspace.path().to_path_buf();
        drop(workspace);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn resolve_rejects_traversal() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("1"))
            .await
            .unwrap();
        assert_eq!(
            workspace.resolve("dir/a.txt").unwrap(),
            workspace.path().join("dir/a.txt")
        );
        assert!(workspace.resolve("../escape").is_err());
        workspace.cleanup().await.unwrap();
    }
}
