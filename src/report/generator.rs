//! Run summary generation.
//!
//! A finished `analyse` call is written out as a JSON record for
//! bookkeeping and printed as a short text summary for the user.

use crate::orchestrator::AnalyseOutcome;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

/// Generate the JSON run record.
pub fn generate_json_summary(outcome: &AnalyseOutcome) -> Result<String> {
    serde_json::to_string_pretty(outcome).map_err(Into::into)
}

/// Write the JSON run record to a file, creating parent directories.
pub fn write_json_summary(outcome: &AnalyseOutcome, path: &Path) -> Result<()> {
    let content = generate_json_summary(outcome)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    file.write_all(content.as_bytes())?;
    file.write_all(b"\n")?;

    Ok(())
}

/// Generate the human-readable summary printed at the end of a run.
pub fn generate_text_summary(outcome: &AnalyseOutcome) -> String {
    let mut output = String::new();

    output.push_str(&format!("Run: {}\n", outcome.name));
    output.push_str(&format!(
        "Backend: {} ({})\n",
        outcome.backend,
        if outcome.use_cluster { "cluster" } else { "local" }
    ));

    if let Some(ref state) = outcome.estimation {
        let method = state
            .method
            .map(|m| m.to_string())
            .unwrap_or_else(|| "none".to_string());
        output.push_str(&format!(
            "Scale guess ({}): sensitivity {}, discovery {}\n",
            method, state.guess.sensitivity, state.guess.discovery
        ));
        if state.iterations > 0 {
            output.push_str(&format!("Quick-injection rounds: {}\n", state.iterations));
        }
    } else {
        output.push_str("Scale guess: not estimated\n");
    }

    output.push_str(&format!(
        "Scale: {} -> {} ({} trials)\n",
        outcome.original_scale, outcome.submitted_scale, outcome.n_trials
    ));

    if let Some(job_id) = outcome.job_id {
        output.push_str(&format!(
            "Job: {}{}\n",
            job_id,
            if outcome.waited { " (finished)" } else { "" }
        ));
    }

    output.push_str(&format!("Duration: {:.1}s\n", outcome.duration_seconds));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::EstimationState;
    use crate::models::{EstimationMethod, JobId, ScaleGuess};
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_outcome() -> AnalyseOutcome {
        AnalyseOutcome {
            name: "analyses/tde/".to_string(),
            backend: "sge".to_string(),
            use_cluster: true,
            methods: vec![EstimationMethod::Asimov],
            want_discovery: true,
            estimation: Some(EstimationState {
                guess: ScaleGuess {
                    sensitivity: 6.0,
                    discovery: 20.0,
                },
                method: Some(EstimationMethod::Asimov),
                iterations: 0,
                converged: true,
            }),
            original_scale: 10.0,
            submitted_scale: 40.0,
            n_trials: 1000,
            job_id: Some(JobId(4242)),
            waited: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_seconds: 1.5,
        }
    }

    #[test]
    fn test_generate_json_summary() {
        let json = generate_json_summary(&create_test_outcome()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["name"], "analyses/tde/");
        assert_eq!(value["submitted_scale"], 40.0);
        assert_eq!(value["job_id"], 4242);
        assert_eq!(value["methods"][0], "asimov");
        assert_eq!(value["estimation"]["guess"]["discovery"], 20.0);
        assert!(value["started_at"].is_string());
    }

    #[test]
    fn test_write_json_summary_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("tde.json");
        write_json_summary(&create_test_outcome(), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"backend\": \"sge\""));
    }

    #[test]
    fn test_generate_text_summary() {
        let text = generate_text_summary(&create_test_outcome());
        assert!(text.contains("Backend: sge (cluster)"));
        assert!(text.contains("Scale guess (asimov): sensitivity 6, discovery 20"));
        assert!(text.contains("Scale: 10 -> 40 (1000 trials)"));
        assert!(text.contains("Job: 4242\n"));
        assert!(!text.contains("Quick-injection rounds"));
    }

    #[test]
    fn test_text_summary_without_estimation() {
        let mut outcome = create_test_outcome();
        outcome.estimation = None;
        outcome.job_id = None;
        outcome.use_cluster = false;
        outcome.backend = "local".to_string();

        let text = generate_text_summary(&outcome);
        assert!(text.contains("Backend: local (local)"));
        assert!(text.contains("not estimated"));
        assert!(!text.contains("Job:"));
    }
}
