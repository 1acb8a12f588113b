//! On-disk layout for serialized configurations and trial artifacts.
//!
//! Every path is derived from the run name, so two runs only collide
//! when they share a name. Concurrent submissions under one name are
//! last-writer-wins; callers must keep names unique.

pub mod cleanup;

use crate::error::{Result, SubmitError};
use crate::models::{trim_separator, AnalysisConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use cleanup::remove_artifacts;

const CONFIG_FILE: &str = "analysis_config.json";

/// Paths of everything a run writes under the storage root.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the serialized configuration of a run lives.
    pub fn analysis_config_path(&self, name: &str) -> PathBuf {
        self.root
            .join("analysis_configs")
            .join(trim_separator(name))
            .join(CONFIG_FILE)
    }

    /// Per-task pickled results.
    pub fn pickle_output_dir(&self, name: &str) -> PathBuf {
        self.root.join("pickles").join(trim_separator(name))
    }

    /// Cached injection values.
    pub fn injection_dir(&self, name: &str) -> PathBuf {
        self.root.join("injection_values").join(trim_separator(name))
    }

    /// The two directories cleanup removes for a run.
    pub fn artifact_dirs(&self, name: &str) -> [PathBuf; 2] {
        [self.pickle_output_dir(name), self.injection_dir(name)]
    }
}

/// Serialize a configuration to its run path and return that path.
pub fn write_analysis_config(layout: &ArtifactLayout, config: &AnalysisConfig) -> Result<PathBuf> {
    let path = layout.analysis_config_path(&config.name);
    const OPERATION: &str = "writing analysis configuration";
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(SubmitError::storage(&config.name, OPERATION))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(SubmitError::storage(&config.name, OPERATION))?;
    fs::write(&path, content).map_err(SubmitError::storage(&config.name, OPERATION))?;

    debug!("Wrote analysis config for {} to {}", config.name, path.display());
    Ok(path)
}

/// Read a configuration back from a serialized artifact.
pub fn load_analysis_config(path: &Path) -> Result<AnalysisConfig> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_paths_ignore_trailing_separator() {
        let layout = ArtifactLayout::new("/data");
        assert_eq!(
            layout.analysis_config_path("tde/"),
            layout.analysis_config_path("tde")
        );
        assert_eq!(
            layout.pickle_output_dir("analyses/tde/"),
            PathBuf::from("/data/pickles/analyses/tde")
        );
        assert_eq!(
            layout.injection_dir("x"),
            PathBuf::from("/data/injection_values/x")
        );
    }

    #[test]
    fn test_round_trip_through_artifact() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path());

        let mut config = AnalysisConfig::new("analyses/ccsn/");
        config.dataset = json!({"ps_tracks": "v004_p00"});
        config.catalogue = Some("catalogues/ccsn_IIn.npy".to_string());
        config.llh_dict = json!({"llh_name": "standard_matrix"});
        config.scale = 12.5;
        config.n_trials = 300;
        config.extra.insert("n_steps".to_string(), json!(10));

        let path = write_analysis_config(&layout, &config).unwrap();
        assert!(path.starts_with(dir.path()));

        let loaded = load_analysis_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_write_failure_names_the_run() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("not_a_dir");
        fs::write(&root, b"file").unwrap();
        let layout = ArtifactLayout::new(&root);

        let err = write_analysis_config(&layout, &AnalysisConfig::new("tde_run")).unwrap_err();
        match &err {
            SubmitError::Storage { name, operation, .. } => {
                assert_eq!(name, "tde_run");
                assert_eq!(*operation, "writing analysis configuration");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("'tde_run'"));
    }
}
