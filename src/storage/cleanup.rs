//! Removal of intermediate artifacts left behind by a run.

use super::ArtifactLayout;
use crate::error::{Result, SubmitError};
use std::fs;
use tracing::{debug, warn};

/// Delete the injection-value cache and pickled results of a run.
///
/// Absent directories are skipped. A path that exists but is not a
/// directory is left alone with a warning. Safe to call repeatedly.
pub fn remove_artifacts(layout: &ArtifactLayout, name: &str) -> Result<()> {
    for dir in layout.artifact_dirs(name) {
        if dir.is_dir() {
            debug!("Removing {}", dir.display());
            fs::remove_dir_all(&dir).map_err(SubmitError::storage(name, "removing artifacts"))?;
        } else if dir.exists() {
            warn!("Can not remove {}: it is not a directory", dir.display());
        } else {
            debug!("Nothing to remove at {}", dir.display());
        }
    }
    Ok(())
}
