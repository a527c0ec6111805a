//! Placement of a completed artefact at its destinations.
//!
//! One downloaded file may serve several queued destinations. The
//! distributor spends at most one rename — reserved for the final target —
//! and copies for the rest, resolving name collisions per destination
//! policy. Errors are reported as transient (retry the destination later)
//! or persistent (drop it).

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::fs::{numbered_variant, FileSystem, FsError};

/// What to do when the target name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionResolution {
    /// Replace the existing file.
    Overwrite,
    /// Move the existing file aside as "name (old N).ext".
    RenameExistingToOldN,
    /// Place the new file as "name (N).ext".
    #[default]
    RenameNewWithN,
}

/// Placement failure, classified for the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributeError {
    Transient,
    Persistent,
    NameTooLong,
}

impl From<FsError> for DistributeError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Transient => DistributeError::Transient,
            FsError::Persistent => DistributeError::Persistent,
            FsError::NameTooLong => DistributeError::NameTooLong,
        }
    }
}

/// Distributes one source artefact to up to `targets_remaining` paths.
#[derive(Debug)]
pub struct FileDistributor {
    source: PathBuf,
    targets_remaining: usize,
    mtime: i64,
    /// Set once the source has been renamed away (no further placements).
    source_moved: bool,
}

impl FileDistributor {
    pub fn new(source: PathBuf, target_count: usize, mtime: i64) -> Self {
        Self {
            source,
            targets_remaining: target_count,
            mtime,
            source_moved: false,
        }
    }

    pub fn targets_remaining(&self) -> usize {
        self.targets_remaining
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    /// A destination dropped out (failed file or cancelled target).
    pub fn remove_target(&mut self) {
        self.targets_remaining = self.targets_remaining.saturating_sub(1);
    }

    /// Place the artefact at `target`, resolving collisions per policy.
    /// On success, `target` holds the path actually used (it may have
    /// gained a "(n)" suffix) and one target slot is consumed.
    pub fn distribute_to(
        &mut self,
        target: &mut PathBuf,
        fs: &mut dyn FileSystem,
        resolution: CollisionResolution,
    ) -> Result<(), DistributeError> {
        if self.source_moved {
            // the rename was spent; nothing left to copy from
            warn!(
                event = "distribute_after_move",
                source = %self.source.display(),
                "Source already moved away"
            );
            return Err(DistributeError::Persistent);
        }

        if fs.exists(target) {
            self.resolve_collision(target, fs, resolution)?;
        }

        let last_target = self.targets_remaining <= 1;
        if last_target {
            fs.rename(&self.source, target).map_err(DistributeError::from)?;
            self.source_moved = true;
        } else {
            fs.copy(&self.source, target).map_err(DistributeError::from)?;
        }
        // moves and copies are assumed to preserve the already-set mtime;
        // re-assert it for filesystems that do not
        let _ = fs.set_mtime(target, self.mtime);

        self.targets_remaining = self.targets_remaining.saturating_sub(1);
        debug!(
            event = "artefact_distributed",
            target = %target.display(),
            renamed = last_target,
            remaining = self.targets_remaining,
            "Artefact placed at destination"
        );
        Ok(())
    }

    fn resolve_collision(
        &self,
        target: &mut PathBuf,
        fs: &mut dyn FileSystem,
        resolution: CollisionResolution,
    ) -> Result<(), DistributeError> {
        match resolution {
            CollisionResolution::Overwrite => {
                fs.unlink(target).map_err(DistributeError::from)
            }
            CollisionResolution::RenameExistingToOldN => {
                let aside = free_variant(target, fs, "(old ")?;
                fs.rename(target, &aside).map_err(DistributeError::from)
            }
            CollisionResolution::RenameNewWithN => {
                *target = free_variant(target, fs, "(")?;
                Ok(())
            }
        }
    }
}

/// First "name (prefixN).ext" variant that does not exist yet.
fn free_variant(
    base: &Path,
    fs: &mut dyn FileSystem,
    prefix: &str,
) -> Result<PathBuf, DistributeError> {
    for n in 1..10_000u32 {
        let candidate = numbered_variant(base, n, prefix);
        if !fs.exists(&candidate) {
            return Ok(candidate);
        }
    }
    Err(DistributeError::Persistent)
}
