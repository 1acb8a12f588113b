//! Injection scale estimation.
//!
//! Two strategies feed the same [`EstimationState`]: a one-shot closed-form
//! guess from the trial engine, and an iterative loop of small local trial
//! batches whose results are fed back into the next guess.

use crate::backend::Backend;
use crate::engine::{ResultsAggregator, TrialEngine};
use crate::error::{Result, SubmitError};
use crate::models::{AnalysisConfig, EstimationMethod, ScaleGuess};
use crate::storage::remove_artifacts;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Sensitivity guess as a fraction of the closed-form discovery guess.
pub const ASIMOV_SENSITIVITY_FRACTION: f64 = 0.3;

/// Guesses accumulated while estimating; later strategies overwrite earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EstimationState {
    pub guess: ScaleGuess,
    pub method: Option<EstimationMethod>,
    /// Quick-injection rounds performed.
    pub iterations: usize,
    pub converged: bool,
}

/// Outcome of judging one quick-injection round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Estimates are usable.
    Accept,
    /// An estimate is negative or above the injected scale; retry higher.
    OutOfRange { next_guess: f64 },
    /// The injected scale was far above the discovery estimate; retry lower.
    Overshoot { next_guess: f64 },
}

/// Apply the convergence rules to one round's estimates.
pub fn judge(guess: f64, estimate: &ScaleGuess) -> Verdict {
    let out_of_range = [estimate.sensitivity, estimate.discovery]
        .iter()
        .any(|&g| g < 0.0 || g > guess);

    if out_of_range {
        Verdict::OutOfRange {
            next_guess: 1.5 * estimate.sensitivity.max(estimate.discovery),
        }
    } else if guess > 5.0 * estimate.discovery {
        Verdict::Overshoot {
            next_guess: 4.0 * estimate.discovery,
        }
    } else {
        Verdict::Accept
    }
}

/// Runs the estimation strategies against a trial engine and aggregator.
pub struct ScaleEstimator {
    engine: Arc<dyn TrialEngine>,
    aggregator: Arc<dyn ResultsAggregator>,
    max_iterations: Option<usize>,
    quick_trials: u64,
}

impl ScaleEstimator {
    pub fn new(engine: Arc<dyn TrialEngine>, aggregator: Arc<dyn ResultsAggregator>) -> Self {
        Self {
            engine,
            aggregator,
            max_iterations: Some(25),
            quick_trials: 10,
        }
    }

    /// Cap on quick-injection rounds; `None` loops until convergence.
    pub fn with_max_iterations(mut self, max_iterations: Option<usize>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_quick_trials(mut self, quick_trials: u64) -> Self {
        self.quick_trials = quick_trials.max(1);
        self
    }

    /// Closed-form estimate. Never iterates.
    pub async fn asimov(&self, config: &AnalysisConfig) -> Result<ScaleGuess> {
        let discovery = self
            .engine
            .guess_scale(config)
            .await
            .map_err(|e| SubmitError::engine(&config.name, "scale guess", e))?;
        if !discovery.is_finite() {
            return Err(SubmitError::engine(
                &config.name,
                "scale guess",
                anyhow::anyhow!("engine returned a non-finite scale ({})", discovery),
            ));
        }

        let guess = ScaleGuess {
            sensitivity: ASIMOV_SENSITIVITY_FRACTION * discovery,
            discovery,
        };
        info!(
            "Closed-form scale guess for {}: discovery {}, sensitivity {}",
            config.name, guess.discovery, guess.sensitivity
        );
        Ok(guess)
    }

    /// Scratch configuration for one quick-injection round.
    pub fn quick_injection_config(&self, config: &AnalysisConfig, guess: f64) -> AnalysisConfig {
        let mut sub = config.clone();
        sub.name = config.quick_injection_name();
        sub.n_trials = self.quick_trials;
        sub.background_ntrials_factor = Some(1.0);
        sub.scale = guess;
        sub
    }

    /// Iteratively refine the scale with small local runs.
    ///
    /// Each round runs on the backend's local pool, whatever the backend's
    /// submission target, and its scratch artifacts are removed before the
    /// next round or before returning.
    pub async fn quick_injections(
        &self,
        backend: &dyn Backend,
        config: &AnalysisConfig,
    ) -> Result<(ScaleGuess, usize)> {
        if !config.background_centered_at_zero() {
            return Err(SubmitError::config(
                &config.name,
                format!(
                    "quick injections need a background test statistic centred at zero, which the {} workload does not have",
                    config.mh_name
                ),
            ));
        }

        let mut guess = config.scale;
        let mut iterations = 0;
        loop {
            if let Some(cap) = self.max_iterations {
                if iterations >= cap {
                    return Err(SubmitError::NoConvergence {
                        name: config.name.clone(),
                        iterations,
                        last_guess: guess,
                    });
                }
            }
            iterations += 1;

            let sub = self.quick_injection_config(config, guess);
            info!(
                "Quick injections for {} (round {}): {} trials at scale {}",
                config.name, iterations, sub.n_trials, guess
            );

            let round = self.run_round(backend, &sub).await;
            remove_artifacts(backend.pool().layout(), &sub.name)?;
            let estimate = round?;

            match judge(guess, &estimate) {
                Verdict::Accept => {
                    info!("Scale guess successful. Adjusting injection scale.");
                    return Ok((estimate, iterations));
                }
                Verdict::OutOfRange { next_guess } => {
                    info!(
                        "Could not perform scale guess because at least one guess outside [0, {}]! Adjusting accordingly to {} and retry.",
                        guess, next_guess
                    );
                    guess = next_guess;
                }
                Verdict::Overshoot { next_guess } => {
                    info!(
                        "Could not perform scale guess because initial scale guess {} much larger than disc scale guess {}. Adjusting initial guess to {} and retry.",
                        guess, estimate.discovery, next_guess
                    );
                    guess = next_guess;
                }
            }
        }
    }

    async fn run_round(&self, backend: &dyn Backend, sub: &AnalysisConfig) -> Result<ScaleGuess> {
        backend.submit_local(sub).await?;

        let config_path = backend.pool().layout().analysis_config_path(&sub.name);
        let estimate = self
            .aggregator
            .estimate_scale(sub, &config_path)
            .await
            .map_err(|e| SubmitError::engine(&sub.name, "scale estimation", e))?;
        if !(estimate.sensitivity.is_finite() && estimate.discovery.is_finite()) {
            return Err(SubmitError::engine(
                &sub.name,
                "scale estimation",
                anyhow::anyhow!(
                    "aggregator returned non-finite scales (sensitivity {}, discovery {})",
                    estimate.sensitivity,
                    estimate.discovery
                ),
            ));
        }
        debug!(
            "Round estimate for {}: sensitivity {}, discovery {}",
            sub.name, estimate.sensitivity, estimate.discovery
        );
        Ok(estimate)
    }

    /// Run the requested methods in order, closed-form first.
    pub async fn estimate(
        &self,
        backend: &dyn Backend,
        config: &AnalysisConfig,
        methods: &[EstimationMethod],
    ) -> Result<Option<EstimationState>> {
        let mut methods = methods.to_vec();
        methods.sort();
        methods.dedup();

        let mut state: Option<EstimationState> = None;
        for method in methods {
            let next = match method {
                EstimationMethod::Asimov => EstimationState {
                    guess: self.asimov(config).await?,
                    method: Some(method),
                    iterations: state.map(|s| s.iterations).unwrap_or(0),
                    converged: true,
                },
                EstimationMethod::QuickInjections => {
                    let (guess, iterations) = self.quick_injections(backend, config).await?;
                    EstimationState {
                        guess,
                        method: Some(method),
                        iterations,
                        converged: true,
                    }
                }
            };
            state = Some(next);
        }
        Ok(state)
    }
}
