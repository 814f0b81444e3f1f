// Submission staging: one private directory per submission under the submissions root

use crate::error::EngineError;
use crate::registry::LanguageProfile;
use crate::substrate::SUBMISSION_DIR;
use arbiter_common::types::Submission;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const STDIN_FILE: &str = "stdin";

/// A staged submission directory on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDir {
    pub path: PathBuf,
    pub source_file: String,
    pub has_stdin: bool,
}

impl WorkingDir {
    pub fn source_path(&self) -> PathBuf {
        self.path.join(&self.source_file)
    }

    pub fn stdin_path(&self) -> Option<PathBuf> {
        self.has_stdin.then(|| self.path.join(STDIN_FILE))
    }

    /// Source path as seen from inside the sandbox
    pub fn sandbox_source(&self) -> String {
        format!("{}/{}", SUBMISSION_DIR, self.source_file)
    }

    /// What the run phase reads as stdin inside the sandbox
    pub fn sandbox_stdin(&self) -> String {
        if self.has_stdin {
            format!("{}/{}", SUBMISSION_DIR, STDIN_FILE)
        } else {
            "/dev/null".to_string()
        }
    }
}

pub struct SubmissionMaterializer {
    root: PathBuf,
}

impl SubmissionMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the submissions root if missing.
    pub async fn prepare_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        set_mode(&self.root, 0o755).await
    }

    /// Write source (and stdin, if any) into `<root>/<submission id>`.
    ///
    /// The directory is created exclusively, so an id collision fails
    /// instead of sharing files. A failure after creation removes the
    /// partial directory.
    pub async fn stage(
        &self,
        submission: &Submission,
        profile: &LanguageProfile,
    ) -> Result<WorkingDir, EngineError> {
        let staging_error = |source: io::Error| EngineError::Staging {
            id: submission.id,
            source,
        };

        let dir = WorkingDir {
            path: self.root.join(submission.id.to_string()),
            source_file: profile.source_file_name(),
            has_stdin: submission.stdin.is_some(),
        };

        fs::create_dir(&dir.path).await.map_err(staging_error)?;

        if let Err(e) = write_files(&dir, submission).await {
            if let Err(cleanup) = fs::remove_dir_all(&dir.path).await {
                warn!(path = %dir.path.display(), error = %cleanup, "Failed to remove partially staged directory");
            }
            return Err(staging_error(e));
        }

        debug!(
            submission_id = %submission.id,
            path = %dir.path.display(),
            source_bytes = submission.source.len(),
            has_stdin = dir.has_stdin,
            "Submission staged"
        );
        Ok(dir)
    }

    /// Remove a staged directory. Removing an already-removed directory is a no-op.
    pub async fn cleanup(&self, dir: &WorkingDir) -> io::Result<()> {
        if !dir.path.starts_with(&self.root) || dir.path == self.root {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to remove {} outside the submissions root", dir.path.display()),
            ));
        }
        match fs::remove_dir_all(&dir.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove submission directories older than `ttl`.
    ///
    /// Only directories named by a submission id are considered.
    pub async fn sweep_expired(&self, ttl: Duration) -> io::Result<usize> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if Uuid::parse_str(name).is_err() {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified >= cutoff {
                continue;
            }

            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to sweep expired submission"),
            }
        }

        if removed > 0 {
            info!(removed, "Swept expired submission directories");
        }
        Ok(removed)
    }
}

async fn write_files(dir: &WorkingDir, submission: &Submission) -> io::Result<()> {
    set_mode(&dir.path, 0o755).await?;

    let source_path = dir.source_path();
    fs::write(&source_path, &submission.source).await?;
    set_mode(&source_path, 0o644).await?;

    if let (Some(stdin), Some(stdin_path)) = (&submission.stdin, dir.stdin_path()) {
        fs::write(&stdin_path, stdin).await?;
        set_mode(&stdin_path, 0o644).await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
