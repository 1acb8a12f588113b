//! Data models shared by the backends, the estimator and the CLI.
//!
//! The analysis configuration is treated as an opaque value: the fields
//! the submission layer reads or rewrites are typed, everything else is
//! carried through untouched so it reaches the trial engine as written.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Workload kind whose background test statistic is not centred at zero.
pub const FIT_WEIGHTS_WORKLOAD: &str = "fit_weights";

const QUICK_INJECTION_SUFFIX: &str = "_quick_injection";

/// A single analysis unit, as handed to the trial engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Unique run name; also the filesystem key for all artifacts.
    pub name: String,
    /// Which minimisation workload the engine should run.
    #[serde(default = "default_workload")]
    pub mh_name: String,
    /// Dataset selection.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub dataset: Value,
    /// Catalogue reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalogue: Option<String>,
    /// Injection parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub inj_dict: Value,
    /// Likelihood parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub llh_dict: Value,
    /// Injection-strength multiplier.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Number of trials per scale step.
    #[serde(default = "default_n_trials")]
    pub n_trials: u64,
    /// Multiplier on the number of background trials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_ntrials_factor: Option<f64>,
    /// Everything else in the configuration, passed through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_workload() -> String {
    "fixed_weights".to_string()
}

fn default_scale() -> f64 {
    1.0
}

fn default_n_trials() -> u64 {
    100
}

impl AnalysisConfig {
    /// Creates a configuration with only a name set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mh_name: default_workload(),
            dataset: Value::Null,
            catalogue: None,
            inj_dict: Value::Null,
            llh_dict: Value::Null,
            scale: default_scale(),
            n_trials: default_n_trials(),
            background_ntrials_factor: None,
            extra: Map::new(),
        }
    }

    /// The run name without a trailing path separator.
    pub fn run_key(&self) -> &str {
        trim_separator(&self.name)
    }

    /// Name of the scratch run used by quick-injection estimation.
    ///
    /// Always derived from the parent name so cleanup can find it.
    pub fn quick_injection_name(&self) -> String {
        format!("{}{}", self.run_key(), QUICK_INJECTION_SUFFIX)
    }

    /// Whether the workload's background test-statistic median is zero.
    pub fn background_centered_at_zero(&self) -> bool {
        self.mh_name != FIT_WEIGHTS_WORKLOAD
    }
}

/// Strip one trailing `/` from a run name.
pub fn trim_separator(name: &str) -> &str {
    name.strip_suffix('/').unwrap_or(name)
}

/// How the injection scale is estimated before the full submission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum EstimationMethod {
    /// Closed-form estimate from the trial engine.
    Asimov,
    /// Iterative estimate from small local trial batches.
    QuickInjections,
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimationMethod::Asimov => write!(f, "asimov"),
            EstimationMethod::QuickInjections => write!(f, "quick-injections"),
        }
    }
}

/// Sensitivity and discovery scale guesses.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaleGuess {
    pub sensitivity: f64,
    pub discovery: f64,
}

impl ScaleGuess {
    /// Scale to submit: twice the relevant threshold guess.
    pub fn submission_scale(&self, want_discovery: bool) -> f64 {
        if want_discovery {
            self.discovery / 0.5
        } else {
            self.sensitivity / 0.5
        }
    }
}

/// Identifier of a job array, assigned by the cluster scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_injection_name_is_derived_from_parent() {
        let config = AnalysisConfig::new("analyses/tde/");
        assert_eq!(config.quick_injection_name(), "analyses/tde_quick_injection");

        let config = AnalysisConfig::new("ccsn");
        assert_eq!(config.quick_injection_name(), "ccsn_quick_injection");
    }

    #[test]
    fn test_fit_weights_is_not_centred() {
        let mut config = AnalysisConfig::new("x");
        assert!(config.background_centered_at_zero());
        config.mh_name = FIT_WEIGHTS_WORKLOAD.to_string();
        assert!(!config.background_centered_at_zero());
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let raw = r#"{
            "name": "flare",
            "mh_name": "flare",
            "dataset": {"ps_10_year": "v003"},
            "inj_dict": {"injection_energy_pdf": {"energy_pdf_name": "power_law", "gamma": 2.0}},
            "llh_dict": {"llh_name": "standard"},
            "scale": 3.5,
            "n_trials": 20,
            "time_pdf": {"time_pdf_name": "box"},
            "n_steps": 15
        }"#;
        let config: AnalysisConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.extra.get("n_steps"), Some(&Value::from(15)));

        let text = serde_json::to_string(&config).unwrap();
        let back: AnalysisConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_submission_scale() {
        let guess = ScaleGuess {
            sensitivity: 6.0,
            discovery: 20.0,
        };
        assert_eq!(guess.submission_scale(true), 40.0);
        assert_eq!(guess.submission_scale(false), 12.0);
    }

    #[test]
    fn test_estimation_method_serde_names() {
        let methods: Vec<EstimationMethod> =
            serde_json::from_str(r#"["asimov", "quick-injections"]"#).unwrap();
        assert_eq!(
            methods,
            vec![EstimationMethod::Asimov, EstimationMethod::QuickInjections]
        );
        assert_eq!(EstimationMethod::QuickInjections.to_string(), "quick-injections");
    }
}
