//! Model Bt: one accuracy per annotator plus class weights.
//!
//! The true label is drawn from `[gamma..., 1 - sum(gamma)]`. Annotator `j`
//! reports it with probability `theta_j` and otherwise picks one of the other
//! `K-1` classes uniformly.

use std::sync::atomic::AtomicBool;

use rand::Rng;
use tracing::debug;

use super::{check_labels, check_shape, AnnotationModel, FitOptions, FitReport, ModelKind, ModelParameters};
use crate::annotations::{AnnotationMatrix, PatternCounts, MISSING};
use crate::error::ModelError;
use crate::numeric::{
    beta_ln_pdf, expit, log_sum_exp, logit, normalize, pivot_logits, safe_ln, sample_beta,
    sample_categorical, sample_dirichlet, softmax_with_pivot, PROB_FLOOR, SIMPLEX_TOL,
};
use crate::optimize::minimize_restarted;
use crate::sampler::{self, PosteriorSamples, PosteriorTarget, SamplerConfig};

/// Beta(2, 1) prior on accuracies: better than chance is more plausible.
const ACCURACY_PRIOR: (f64, f64) = (2.0, 1.0);
const RESTARTS: usize = 2;

#[derive(Debug, Clone)]
pub struct ModelBt {
    nclasses: usize,
    nannotators: usize,
    gamma: Vec<f64>,
    theta: Vec<f64>,
    fitted_with_priors: bool,
}

fn check_dims(nclasses: usize, nannotators: usize) -> Result<(), ModelError> {
    if nclasses < 2 {
        return Err(ModelError::InvalidDimension {
            what: "nclasses",
            value: nclasses,
        });
    }
    if nannotators == 0 {
        return Err(ModelError::InvalidDimension {
            what: "nannotators",
            value: 0,
        });
    }
    Ok(())
}

impl ModelBt {
    pub fn new(gamma: Vec<f64>, theta: Vec<f64>) -> Result<Self, ModelError> {
        let nclasses = gamma.len() + 1;
        check_dims(nclasses, theta.len())?;
        if gamma.iter().any(|g| !(0.0..=1.0).contains(g))
            || gamma.iter().sum::<f64>() > 1.0 + SIMPLEX_TOL
        {
            return Err(ModelError::InvalidParameters(
                "gamma entries must lie in [0, 1] and sum to at most 1".into(),
            ));
        }
        if theta.iter().any(|t| !(0.0..=1.0).contains(t)) {
            return Err(ModelError::InvalidParameters(
                "theta entries must lie in [0, 1]".into(),
            ));
        }
        Ok(Self {
            nclasses,
            nannotators: theta.len(),
            gamma,
            theta,
            fitted_with_priors: false,
        })
    }

    /// Class weights from a flat Dirichlet, accuracies from Beta(2, 1).
    pub fn create_initial_state<R: Rng + ?Sized>(
        nclasses: usize,
        nannotators: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        check_dims(nclasses, nannotators)?;
        let mut prior = sample_dirichlet(rng, &vec![1.0; nclasses]);
        prior.truncate(nclasses - 1);
        let theta = (0..nannotators)
            .map(|_| sample_beta(rng, ACCURACY_PRIOR.0, ACCURACY_PRIOR.1))
            .collect();
        Ok(Self {
            nclasses,
            nannotators,
            gamma: prior,
            theta,
            fitted_with_priors: false,
        })
    }

    /// Start the class weights at observed class frequencies.
    pub fn init_gamma_from_frequencies(&mut self, frequencies: &[f64]) -> Result<(), ModelError> {
        if frequencies.len() != self.nclasses {
            return Err(ModelError::shape(
                format!("{} frequencies", self.nclasses),
                format!("{} frequencies", frequencies.len()),
            ));
        }
        let mut f = frequencies.to_vec();
        normalize(&mut f);
        f.truncate(self.nclasses - 1);
        self.gamma = f;
        Ok(())
    }

    pub fn gamma(&self) -> &[f64] {
        &self.gamma
    }

    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    /// Full class prior `[gamma..., 1 - sum(gamma)]`.
    pub fn class_prior(&self) -> Vec<f64> {
        class_prior_of(&self.gamma)
    }

    fn check_data(&self, annotations: &AnnotationMatrix) -> Result<(), ModelError> {
        check_shape(annotations, self.nclasses, self.nannotators)
    }

    fn fit(
        &mut self,
        annotations: &AnnotationMatrix,
        use_priors: bool,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        options.optimizer.validate()?;
        self.check_data(annotations)?;
        annotations.ensure_fit_ready()?;
        let counts = annotations.pattern_counts();
        let k = self.nclasses;

        let mut x0 = pivot_logits(&self.class_prior());
        x0.extend(self.theta.iter().map(|&t| logit(t)));

        let unpack = |x: &[f64]| -> (Vec<f64>, Vec<f64>) {
            let mut prior = softmax_with_pivot(&x[..k - 1]);
            prior.truncate(k - 1);
            let theta = x[k - 1..].iter().map(|&z| expit(z)).collect();
            (prior, theta)
        };
        let objective = |x: &[f64]| {
            let (gamma, theta) = unpack(x);
            let mut value = log_likelihood_of(&gamma, &theta, k, &counts);
            if use_priors {
                value += accuracy_log_prior(&theta);
            }
            -value
        };
        let min = minimize_restarted(objective, &x0, &options.optimizer, RESTARTS, cancel_flag);
        if !min.value.is_finite() {
            return Err(ModelError::DegenerateData(
                "Model Bt objective is not finite at the starting point".into(),
            ));
        }

        let (gamma, theta) = unpack(&min.x);
        self.gamma = gamma;
        self.theta = theta;
        self.fitted_with_priors = use_priors;
        let log_likelihood = log_likelihood_of(&self.gamma, &self.theta, k, &counts);
        debug!(
            iterations = min.iterations,
            evaluations = min.evaluations,
            log_likelihood,
            "model Bt simplex search finished"
        );
        let report = FitReport {
            log_likelihood,
            objective: -min.value,
            iterations: min.iterations,
            stop_reason: min.stop_reason,
            trace: Vec::new(),
        };
        report.log_outcome(ModelKind::Bt);
        Ok(report)
    }
}

fn class_prior_of(gamma: &[f64]) -> Vec<f64> {
    let mut prior = gamma.to_vec();
    prior.push((1.0 - gamma.iter().sum::<f64>()).max(0.0));
    prior
}

fn accuracy_log_prior(theta: &[f64]) -> f64 {
    theta
        .iter()
        .map(|&t| beta_ln_pdf(t, ACCURACY_PRIOR.0, ACCURACY_PRIOR.1))
        .sum()
}

/// `ln P(x = m | true = l)` for one annotator.
fn report_ln(theta: f64, nclasses: usize, reported: usize, truth: usize) -> f64 {
    if reported == truth {
        safe_ln(theta)
    } else {
        safe_ln((1.0 - theta) / (nclasses - 1) as f64)
    }
}

fn class_log_joint(prior: &[f64], theta: &[f64], row: &[i32], out: &mut [f64]) {
    let k = prior.len();
    for (l, slot) in out.iter_mut().enumerate() {
        let mut acc = safe_ln(prior[l]);
        for (j, &x) in row.iter().enumerate() {
            if x != MISSING {
                acc += report_ln(theta[j], k, x as usize, l);
            }
        }
        *slot = acc;
    }
}

fn log_likelihood_of(gamma: &[f64], theta: &[f64], nclasses: usize, counts: &PatternCounts) -> f64 {
    let prior = class_prior_of(gamma);
    let mut joint = vec![0.0; nclasses];
    counts
        .iter()
        .map(|(row, count)| {
            class_log_joint(&prior, theta, row, &mut joint);
            count * log_sum_exp(&joint)
        })
        .sum()
}

impl AnnotationModel for ModelBt {
    fn kind(&self) -> ModelKind {
        ModelKind::Bt
    }

    fn nclasses(&self) -> usize {
        self.nclasses
    }

    fn nannotators(&self) -> usize {
        self.nannotators
    }

    fn log_likelihood(&self, annotations: &AnnotationMatrix) -> Result<f64, ModelError> {
        self.check_data(annotations)?;
        Ok(log_likelihood_of(
            &self.gamma,
            &self.theta,
            self.nclasses,
            &annotations.pattern_counts(),
        ))
    }

    fn log_prior(&self) -> f64 {
        accuracy_log_prior(&self.theta)
    }

    fn mle(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        self.fit(annotations, false, options, cancel_flag)
    }

    fn map(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        self.fit(annotations, true, options, cancel_flag)
    }

    fn generate_labels<R: Rng + ?Sized>(&self, nitems: usize, rng: &mut R) -> Vec<usize> {
        let prior = self.class_prior();
        (0..nitems).map(|_| sample_categorical(rng, &prior)).collect()
    }

    fn generate_annotations<R: Rng + ?Sized>(
        &self,
        labels: &[usize],
        rng: &mut R,
    ) -> Result<AnnotationMatrix, ModelError> {
        check_labels(labels, self.nclasses)?;
        let mut cells = Vec::with_capacity(labels.len() * self.nannotators);
        for &label in labels {
            for &t in &self.theta {
                let reported = if rng.gen::<f64>() < t {
                    label
                } else {
                    // Uniform over the other K-1 classes.
                    let other = rng.gen_range(0..self.nclasses - 1);
                    if other >= label {
                        other + 1
                    } else {
                        other
                    }
                };
                cells.push(reported as i32);
            }
        }
        AnnotationMatrix::from_cells(labels.len(), self.nannotators, self.nclasses, cells)
    }

    fn infer_labels(&self, annotations: &AnnotationMatrix) -> Result<Vec<Vec<f64>>, ModelError> {
        self.check_data(annotations)?;
        let prior = self.class_prior();
        let mut joint = vec![0.0; self.nclasses];
        Ok(annotations
            .rows()
            .map(|row| {
                class_log_joint(&prior, &self.theta, row, &mut joint);
                let norm = log_sum_exp(&joint);
                let mut posterior: Vec<f64> = joint.iter().map(|lj| (lj - norm).exp()).collect();
                normalize(&mut posterior);
                posterior
            })
            .collect())
    }

    fn sample_posterior_over_accuracy<R: Rng + ?Sized>(
        &self,
        annotations: &AnnotationMatrix,
        config: &SamplerConfig,
        rng: &mut R,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<PosteriorSamples, ModelError> {
        self.check_data(annotations)?;
        annotations.ensure_fit_ready()?;
        let target = AccuracyTarget {
            model: self,
            counts: annotations.pattern_counts(),
        };
        sampler::sample(&target, config, rng, cancel_flag)
    }

    fn parameters(&self) -> ModelParameters {
        ModelParameters::Bt {
            gamma: self.gamma.clone(),
            theta: self.theta.clone(),
        }
    }

    fn probability_rows(&self) -> Vec<Vec<f64>> {
        std::iter::once(self.class_prior())
            .chain(self.theta.iter().map(|&t| vec![t, 1.0 - t]))
            .collect()
    }

    fn parameter_count(&self) -> usize {
        self.nclasses - 1 + self.nannotators
    }
}

/// Accuracies only; class weights stay at the estimate.
struct AccuracyTarget<'a> {
    model: &'a ModelBt,
    counts: PatternCounts,
}

impl PosteriorTarget for AccuracyTarget<'_> {
    fn dimension(&self) -> usize {
        self.model.nannotators
    }

    fn names(&self) -> Vec<String> {
        (0..self.model.nannotators)
            .map(|j| format!("theta[{j}]"))
            .collect()
    }

    fn initial_state(&self) -> Vec<f64> {
        self.model
            .theta
            .iter()
            .map(|t| t.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR))
            .collect()
    }

    fn in_domain(&self, state: &[f64]) -> bool {
        state.iter().all(|&t| t > 0.0 && t < 1.0)
    }

    fn log_density(&self, state: &[f64]) -> f64 {
        let ll = log_likelihood_of(&self.model.gamma, state, self.model.nclasses, &self.counts);
        if self.model.fitted_with_priors {
            ll + accuracy_log_prior(state)
        } else {
            ll
        }
    }
}
