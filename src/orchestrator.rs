//! Independent restarts, best-run selection, and the hand-off to sampling.
//!
//! Each run draws a fresh random starting point from its own seeded
//! generator (`seed + run_index`), so a batch is reproducible whether the
//! runs execute on the rayon pool or sequentially.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::annotations::AnnotationMatrix;
use crate::error::ModelError;
use crate::models::{
    AnnotationModel, AnyModel, EmConfig, FitOptions, FitReport, InitOptions, ModelKind,
    ModelParameters,
};
use crate::optimize::NelderMeadConfig;
use crate::sampler::{PosteriorSamples, SamplerConfig};
use crate::store::{BestRunKey, BestRunStore, StoredBest};

// ---------------------------------------------------------------------
//  Config
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub model: ModelKind,
    pub number_of_runs: usize,
    /// MAP instead of MLE.
    pub use_priors: bool,
    /// Model A: estimate the agreement weights instead of deriving them.
    pub estimate_alphas_explicitly: bool,
    /// Model Bt: start class weights at the empirical class frequencies.
    pub use_omegas_for_init: bool,
    pub seed: u64,
    pub em: EmConfig,
    pub optimizer: NelderMeadConfig,
    /// Run restarts on the rayon pool.
    pub parallel: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::B,
            number_of_runs: 5,
            use_priors: true,
            estimate_alphas_explicitly: false,
            use_omegas_for_init: false,
            seed: 0,
            em: EmConfig::default(),
            optimizer: NelderMeadConfig::default(),
            parallel: true,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.number_of_runs == 0 {
            return Err(ModelError::InvalidConfig("number_of_runs must be >= 1".into()));
        }
        self.em.validate()?;
        self.optimizer.validate()
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            em: self.em.clone(),
            optimizer: self.optimizer.clone(),
        }
    }

    fn init_options(&self) -> InitOptions {
        InitOptions {
            estimate_alphas_explicitly: self.estimate_alphas_explicitly,
            use_omegas_for_init: self.use_omegas_for_init,
        }
    }
}

// ---------------------------------------------------------------------
//  Outcomes
// ---------------------------------------------------------------------

/// One restart. A failed run carries `log_likelihood = -inf` and an error.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub index: usize,
    pub seed: u64,
    pub log_likelihood: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ModelParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<FitReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BestSource {
    Batch,
    Store,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub runs: Vec<RunRecord>,
    /// Index of the winning run within `runs`; `None` once a stored record
    /// has replaced the batch best.
    pub best_index: Option<usize>,
    pub best_model: AnyModel,
    pub best_log_likelihood: f64,
    /// Whether the current best came from this batch or from a store.
    pub best_source: BestSource,
}

impl BatchOutcome {
    /// Log-likelihoods of all runs in index order.
    pub fn run_log_likelihoods(&self) -> Vec<f64> {
        self.runs.iter().map(|r| r.log_likelihood).collect()
    }

    /// The batch run that produced the current best, if it still is one.
    pub fn best_run(&self) -> Option<&RunRecord> {
        self.best_index.and_then(|i| self.runs.get(i))
    }

    pub fn failed_runs(&self) -> usize {
        self.runs.iter().filter(|r| !r.succeeded()).count()
    }

    /// Posterior draws around the current best estimate.
    pub fn sample_best<R: Rng + ?Sized>(
        &self,
        annotations: &AnnotationMatrix,
        config: &SamplerConfig,
        rng: &mut R,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<PosteriorSamples, ModelError> {
        self.best_model
            .sample_posterior_over_accuracy(annotations, config, rng, cancel_flag)
    }
}

/// What `reconcile_with_store` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    /// No earlier record, or the batch beat it; the batch best was written.
    Stored,
    /// The stored record is at least as good; the outcome now carries it.
    KeptStored,
    /// The store failed; the batch best stands and nothing was written.
    Unavailable,
}

// ---------------------------------------------------------------------
//  Orchestrator
// ---------------------------------------------------------------------

pub struct RunOrchestrator {
    config: FitConfig,
}

impl RunOrchestrator {
    pub fn new(config: FitConfig) -> Result<Self, ModelError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fit `number_of_runs` restarts and keep the highest log-likelihood.
    ///
    /// Individual run failures are recorded, not propagated; only a batch
    /// where every run fails is an error.
    pub fn run(
        &self,
        annotations: &AnnotationMatrix,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<BatchOutcome, ModelError> {
        annotations.ensure_fit_ready()?;
        let started = Instant::now();
        let n = self.config.number_of_runs;

        let attempt = |index: usize| self.run_one(index, annotations, cancel_flag);
        let results: Vec<(RunRecord, Option<AnyModel>)> = if self.config.parallel {
            (0..n).into_par_iter().map(attempt).collect()
        } else {
            (0..n).map(attempt).collect()
        };

        let mut runs = Vec::with_capacity(n);
        let mut best: Option<(usize, f64, AnyModel)> = None;
        for (record, model) in results {
            if let Some(model) = model {
                let better = best
                    .as_ref()
                    .map_or(true, |(_, ll, _)| record.log_likelihood > *ll);
                if better {
                    best = Some((record.index, record.log_likelihood, model));
                }
            }
            runs.push(record);
        }

        let Some((best_index, best_log_likelihood, best_model)) = best else {
            let first = runs
                .iter()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "no runs executed".to_string());
            return Err(ModelError::DegenerateData(format!(
                "all {n} runs failed; first failure: {first}"
            )));
        };

        info!(
            model = %self.config.model,
            runs = n,
            failed = runs.iter().filter(|r| !r.succeeded()).count(),
            best_index,
            best_log_likelihood,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(BatchOutcome {
            runs,
            best_index: Some(best_index),
            best_model,
            best_log_likelihood,
            best_source: BestSource::Batch,
        })
    }

    fn run_one(
        &self,
        index: usize,
        annotations: &AnnotationMatrix,
        cancel_flag: Option<&AtomicBool>,
    ) -> (RunRecord, Option<AnyModel>) {
        let seed = self.config.seed.wrapping_add(index as u64);
        let failed = |error: String| RunRecord {
            index,
            seed,
            log_likelihood: f64::NEG_INFINITY,
            parameters: None,
            report: None,
            error: Some(error),
        };

        if cancel_flag.is_some_and(|f| f.load(AtomicOrdering::Relaxed)) {
            return (failed("cancelled before start".to_string()), None);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let fitted = AnyModel::create_initial_state(
            self.config.model,
            annotations,
            self.config.init_options(),
            &mut rng,
        )
        .and_then(|mut model| {
            let report = model.fit(
                annotations,
                self.config.use_priors,
                &self.config.fit_options(),
                cancel_flag,
            )?;
            Ok((model, report))
        });

        match fitted {
            Ok((model, report)) if report.log_likelihood.is_finite() => {
                debug!(
                    run = index,
                    log_likelihood = report.log_likelihood,
                    iterations = report.iterations,
                    stop_reason = ?report.stop_reason,
                    "run finished"
                );
                let record = RunRecord {
                    index,
                    seed,
                    log_likelihood: report.log_likelihood,
                    parameters: Some(model.parameters()),
                    report: Some(report),
                    error: None,
                };
                (record, Some(model))
            }
            Ok((_, report)) => {
                warn!(run = index, log_likelihood = report.log_likelihood, "run produced a non-finite log-likelihood");
                (failed("non-finite log-likelihood".to_string()), None)
            }
            Err(e) => {
                warn!(run = index, error = %e, "run failed");
                (failed(e.to_string()), None)
            }
        }
    }

    /// Compare the batch best with the stored best for the same model,
    /// parameter count and dataset, and keep the higher log-likelihood.
    ///
    /// Store failures are logged and leave the outcome untouched.
    pub fn reconcile_with_store(
        &self,
        outcome: &mut BatchOutcome,
        annotations: &AnnotationMatrix,
        store: &dyn BestRunStore,
    ) -> Reconciliation {
        let key = BestRunKey::new(
            outcome.best_model.kind(),
            outcome.best_model.parameter_count(),
            &annotations.fingerprint(),
        );

        let stored = match store.get(&key) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "best-run store lookup failed");
                return Reconciliation::Unavailable;
            }
        };

        if let Some(stored) = stored {
            if stored.log_likelihood >= outcome.best_log_likelihood {
                match AnyModel::from_parameters(&stored.parameters) {
                    Ok(model) if model.kind() == key.model => {
                        info!(
                            stored = stored.log_likelihood,
                            batch = outcome.best_log_likelihood,
                            "stored best beats this batch"
                        );
                        outcome.best_model = model;
                        outcome.best_log_likelihood = stored.log_likelihood;
                        outcome.best_source = BestSource::Store;
                        outcome.best_index = None;
                        return Reconciliation::KeptStored;
                    }
                    Ok(_) => warn!("stored best has a different model kind; replacing it"),
                    Err(e) => warn!(error = %e, "stored best is invalid; replacing it"),
                }
            }
        }

        let record = StoredBest {
            log_likelihood: outcome.best_log_likelihood,
            parameters: outcome.best_model.parameters(),
            number_of_runs: self.config.number_of_runs,
        };
        match store.put(&key, &record) {
            Ok(()) => Reconciliation::Stored,
            Err(e) => {
                warn!(error = %e, "best-run store write failed");
                Reconciliation::Unavailable
            }
        }
    }
}
