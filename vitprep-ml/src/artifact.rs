//! Artifact bookkeeping: digests for reports and staged publication.

use crate::error::PrepError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use vitprep_core::persistence::{promote, remove_if_exists, staging_path};

/// A file produced by a stage, as recorded in its report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

impl ArtifactInfo {
    pub fn from_path(path: &Path) -> Result<Self, PrepError> {
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: std::fs::metadata(path)?.len(),
            sha256: hash_file(path)?,
        })
    }
}

/// Compute the SHA-256 of a file without loading it whole.
pub fn hash_file(path: &Path) -> Result<String, PrepError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// An output being written under a staging name.
///
/// Dropping an uncommitted `StagedFile` deletes the staging file, so every
/// early return leaves only the previous final artifact (if any) behind.
#[derive(Debug)]
pub struct StagedFile {
    target: PathBuf,
    staging: PathBuf,
    committed: bool,
}

impl StagedFile {
    /// Prepare a staging path for `target`, clearing any stale one and
    /// creating the parent directory.
    pub fn new(target: &Path) -> io::Result<Self> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staging = staging_path(target);
        remove_if_exists(&staging)?;
        Ok(Self {
            target: target.to_path_buf(),
            staging,
            committed: false,
        })
    }

    /// Where the content is written before commit.
    pub fn path(&self) -> &Path {
        &self.staging
    }

    /// Rename the staging file onto the target.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        promote(&self.staging, &self.target)?;
        self.committed = true;
        Ok(self.target.clone())
    }

    /// Commit several files as a unit, in order.
    ///
    /// Nothing is renamed unless every staging file exists. Existing targets
    /// are set aside first; if a rename fails, the targets committed in this
    /// call are removed and the previous files restored. Put the file that
    /// references the others last so a crash between renames never leaves a
    /// new reference to missing data. A crash can still leave `.previous`
    /// copies next to the targets.
    pub fn commit_all(files: impl IntoIterator<Item = StagedFile>) -> io::Result<Vec<PathBuf>> {
        let files: Vec<StagedFile> = files.into_iter().collect();
        if let Some(missing) = files.iter().find(|f| !f.staging.is_file()) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("staged file {} is missing", missing.staging.display()),
            ));
        }

        let mut committed: Vec<(PathBuf, Option<PathBuf>)> = Vec::new();
        for file in files {
            let target = file.target.clone();
            let previous = match set_aside(&target) {
                Ok(previous) => previous,
                Err(e) => {
                    roll_back(&committed);
                    return Err(e);
                }
            };
            match file.commit() {
                Ok(_) => committed.push((target, previous)),
                Err(e) => {
                    // The target was not replaced; only a set-aside file needs restoring.
                    if previous.is_some() {
                        committed.push((target, previous));
                    }
                    roll_back(&committed);
                    return Err(e);
                }
            }
        }

        let mut targets = Vec::with_capacity(committed.len());
        for (target, previous) in committed {
            if let Some(previous) = previous {
                if let Err(e) = remove_if_exists(&previous) {
                    tracing::warn!(path = %previous.display(), error = %e, "Failed to remove previous file");
                }
            }
            targets.push(target);
        }
        Ok(targets)
    }
}

fn previous_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".previous");
    target.with_file_name(name)
}

/// Move an existing target out of the way, returning where it went.
fn set_aside(target: &Path) -> io::Result<Option<PathBuf>> {
    if !target.is_file() {
        return Ok(None);
    }
    let previous = previous_path(target);
    remove_if_exists(&previous)?;
    std::fs::rename(target, &previous)?;
    Ok(Some(previous))
}

/// Undo `commit_all` renames, newest first.
fn roll_back(committed: &[(PathBuf, Option<PathBuf>)]) {
    for (target, previous) in committed.iter().rev() {
        let result = match previous {
            Some(previous) => std::fs::rename(previous, target),
            None => remove_if_exists(target),
        };
        if let Err(e) = result {
            tracing::warn!(path = %target.display(), error = %e, "Failed to roll back commit");
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = remove_if_exists(&self.staging) {
                tracing::warn!(path = %self.staging.display(), error = %e, "Failed to remove staging file");
            }
        }
    }
}
