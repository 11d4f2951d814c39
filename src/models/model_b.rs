//! Model B: a full confusion matrix per annotator.
//!
//! Generative story per item: draw the true label `l ~ pi`, then every
//! annotator `j` reports `m ~ theta[j][l]`. Parameters are fitted with EM;
//! MAP adds Dirichlet pseudo-counts in the M-step.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use rand::Rng;
use tracing::debug;

use super::{check_labels, check_shape, AnnotationModel, FitOptions, FitReport, ModelKind, ModelParameters};
use crate::annotations::{AnnotationMatrix, PatternCounts, MISSING};
use crate::error::ModelError;
use crate::numeric::{
    is_distribution, log_sum_exp, normalize, safe_ln, sample_categorical, sample_dirichlet,
    PROB_FLOOR, SIMPLEX_TOL,
};
use crate::optimize::StopReason;
use crate::sampler::{self, PosteriorSamples, PosteriorTarget, SamplerConfig};

/// Off-diagonal decay of the default confusion-row prior, by class distance.
const DEFAULT_ALPHA_BY_DISTANCE: [f64; 4] = [16.0, 4.0, 2.0, 1.0];
const DEFAULT_BETA: f64 = 2.0;

/// Dirichlet priors: `beta` on `pi`, `alpha[k]` on every annotator's row `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBPriors {
    pub alpha: Vec<Vec<f64>>,
    pub beta: Vec<f64>,
}

impl ModelBPriors {
    /// Diagonal-heavy confusion prior, mildly informative class prior.
    pub fn default_for(nclasses: usize) -> Self {
        let alpha = (0..nclasses)
            .map(|k| {
                (0..nclasses)
                    .map(|m| DEFAULT_ALPHA_BY_DISTANCE[k.abs_diff(m).min(3)])
                    .collect()
            })
            .collect();
        Self {
            alpha,
            beta: vec![DEFAULT_BETA; nclasses],
        }
    }

    fn validate(&self, nclasses: usize) -> Result<(), ModelError> {
        let square = self.alpha.len() == nclasses && self.alpha.iter().all(|r| r.len() == nclasses);
        if !square || self.beta.len() != nclasses {
            return Err(ModelError::shape(
                format!("{nclasses}x{nclasses} alpha and {nclasses} beta"),
                format!("{} alpha rows and {} beta", self.alpha.len(), self.beta.len()),
            ));
        }
        let positive = self
            .alpha
            .iter()
            .flatten()
            .chain(self.beta.iter())
            .all(|&a| a > 0.0 && a.is_finite());
        if !positive {
            return Err(ModelError::InvalidParameters(
                "Dirichlet concentrations must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// `sum (a - 1) ln p`, skipping zero coefficients so that `0 * ln 0` stays 0.
///
/// A concentration below 1 reads `p` at no less than `PROB_FLOOR`: the
/// density is unbounded at the boundary and the MAP step parks such entries
/// on the floor.
fn dirichlet_log_kernel(p: &[f64], a: &[f64]) -> f64 {
    p.iter()
        .zip(a.iter())
        .filter(|(_, &a)| a != 1.0)
        .map(|(&p, &a)| {
            let ln_p = if a < 1.0 { p.max(PROB_FLOOR).ln() } else { safe_ln(p) };
            (a - 1.0) * ln_p
        })
        .sum()
}

/// M-step for one distribution: `max(count + a - 1, 0)` renormalized.
///
/// Entries pushed below zero by a sub-unit concentration are lifted to
/// `PROB_FLOOR`, so the row stays strictly inside the simplex and the
/// log-likelihood stays finite.
fn m_step_row(row: &mut [f64], counts: &[f64], prior: Option<&[f64]>) {
    let mut clamped = false;
    for (m, v) in row.iter_mut().enumerate() {
        let raw = counts[m] + prior.map_or(0.0, |a| a[m] - 1.0);
        clamped |= raw < 0.0;
        *v = raw.max(0.0);
    }
    normalize(row);
    if clamped {
        row.iter_mut().for_each(|v| *v = v.max(PROB_FLOOR));
        normalize(row);
    }
}

#[derive(Debug, Clone)]
pub struct ModelB {
    nclasses: usize,
    nannotators: usize,
    pi: Vec<f64>,
    /// `theta[j][k][m] = P(annotator j reports m | true class k)`.
    theta: Vec<Vec<Vec<f64>>>,
    priors: ModelBPriors,
    /// Whether the last fit was MAP; the sampler targets the same objective.
    fitted_with_priors: bool,
}

impl ModelB {
    /// Model with explicit parameters and the default priors.
    pub fn new(pi: Vec<f64>, theta: Vec<Vec<Vec<f64>>>) -> Result<Self, ModelError> {
        let nclasses = pi.len();
        let nannotators = theta.len();
        if nclasses == 0 {
            return Err(ModelError::InvalidDimension {
                what: "nclasses",
                value: 0,
            });
        }
        if nannotators == 0 {
            return Err(ModelError::InvalidDimension {
                what: "nannotators",
                value: 0,
            });
        }
        if !is_distribution(&pi, SIMPLEX_TOL) {
            return Err(ModelError::InvalidParameters("pi is not a distribution".into()));
        }
        for (j, annotator) in theta.iter().enumerate() {
            if annotator.len() != nclasses || annotator.iter().any(|r| r.len() != nclasses) {
                return Err(ModelError::shape(
                    format!("{nclasses}x{nclasses} confusion matrix"),
                    format!("annotator {j} with {} rows", annotator.len()),
                ));
            }
            if let Some(k) = annotator.iter().position(|r| !is_distribution(r, SIMPLEX_TOL)) {
                return Err(ModelError::InvalidParameters(format!(
                    "theta[{j}][{k}] is not a distribution"
                )));
            }
        }
        Ok(Self {
            nclasses,
            nannotators,
            pi,
            theta,
            priors: ModelBPriors::default_for(nclasses),
            fitted_with_priors: false,
        })
    }

    /// Replace the priors used by `map` and by the log prior.
    pub fn with_priors(mut self, priors: ModelBPriors) -> Result<Self, ModelError> {
        priors.validate(self.nclasses)?;
        self.priors = priors;
        Ok(self)
    }

    /// Random model drawn from `priors` (default priors when `None`).
    pub fn create_initial_state<R: Rng + ?Sized>(
        nclasses: usize,
        nannotators: usize,
        priors: Option<ModelBPriors>,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if nclasses == 0 {
            return Err(ModelError::InvalidDimension {
                what: "nclasses",
                value: 0,
            });
        }
        if nannotators == 0 {
            return Err(ModelError::InvalidDimension {
                what: "nannotators",
                value: 0,
            });
        }
        let priors = priors.unwrap_or_else(|| ModelBPriors::default_for(nclasses));
        priors.validate(nclasses)?;
        let pi = sample_dirichlet(rng, &priors.beta);
        let theta = (0..nannotators)
            .map(|_| {
                priors
                    .alpha
                    .iter()
                    .map(|row| sample_dirichlet(rng, row))
                    .collect()
            })
            .collect();
        Ok(Self {
            nclasses,
            nannotators,
            pi,
            theta,
            priors,
            fitted_with_priors: false,
        })
    }

    pub fn pi(&self) -> &[f64] {
        &self.pi
    }

    pub fn theta(&self) -> &[Vec<Vec<f64>>] {
        &self.theta
    }

    pub fn priors(&self) -> &ModelBPriors {
        &self.priors
    }

    fn check_data(&self, annotations: &AnnotationMatrix) -> Result<(), ModelError> {
        check_shape(annotations, self.nclasses, self.nannotators)
    }

    /// Per-class joint log-probability `ln pi_k + sum_j ln theta[j][k][x_j]`.
    fn class_log_joint(pi: &[f64], theta: &[Vec<Vec<f64>>], row: &[i32], out: &mut [f64]) {
        for (k, slot) in out.iter_mut().enumerate() {
            let mut acc = safe_ln(pi[k]);
            for (j, &x) in row.iter().enumerate() {
                if x != MISSING {
                    acc += safe_ln(theta[j][k][x as usize]);
                }
            }
            *slot = acc;
        }
    }

    fn pattern_log_likelihood(pi: &[f64], theta: &[Vec<Vec<f64>>], counts: &PatternCounts) -> f64 {
        let mut joint = vec![0.0; pi.len()];
        counts
            .iter()
            .map(|(row, count)| {
                Self::class_log_joint(pi, theta, row, &mut joint);
                count * log_sum_exp(&joint)
            })
            .sum()
    }

    fn log_prior_of(&self, pi: &[f64], theta: &[Vec<Vec<f64>>]) -> f64 {
        let mut lp = dirichlet_log_kernel(pi, &self.priors.beta);
        for annotator in theta {
            for (row, a) in annotator.iter().zip(self.priors.alpha.iter()) {
                lp += dirichlet_log_kernel(row, a);
            }
        }
        lp
    }

    fn objective(&self, counts: &PatternCounts, use_priors: bool) -> (f64, f64) {
        let ll = Self::pattern_log_likelihood(&self.pi, &self.theta, counts);
        let obj = if use_priors {
            ll + self.log_prior_of(&self.pi, &self.theta)
        } else {
            ll
        };
        (ll, obj)
    }

    /// Run EM to convergence. The objective is non-decreasing across epochs.
    fn em(
        &mut self,
        annotations: &AnnotationMatrix,
        use_priors: bool,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        options.em.validate()?;
        self.check_data(annotations)?;
        annotations.ensure_fit_ready()?;

        let k = self.nclasses;
        let counts = annotations.pattern_counts();
        let (mut ll, mut objective) = self.objective(&counts, use_priors);
        if !objective.is_finite() {
            return Err(ModelError::DegenerateData(
                "initial Model B state assigns zero probability to the data".into(),
            ));
        }
        let start_pi = self.pi.clone();
        let start_theta = self.theta.clone();
        let mut trace = vec![objective];
        let mut stop_reason = StopReason::MaxIterations;
        let mut epochs = 0;

        let mut joint = vec![0.0; k];
        let mut pi_acc = vec![0.0; k];
        let mut theta_acc = vec![vec![vec![0.0; k]; k]; self.nannotators];

        while epochs < options.em.max_epochs {
            if cancel_flag.is_some_and(|f| f.load(AtomicOrdering::Relaxed)) {
                stop_reason = StopReason::Cancelled;
                break;
            }
            epochs += 1;

            // E-step: posterior-weighted counts.
            pi_acc.iter_mut().for_each(|v| *v = 0.0);
            theta_acc
                .iter_mut()
                .flatten()
                .flatten()
                .for_each(|v| *v = 0.0);
            for (row, count) in counts.iter() {
                Self::class_log_joint(&self.pi, &self.theta, row, &mut joint);
                let norm = log_sum_exp(&joint);
                for (c, &lj) in joint.iter().enumerate() {
                    let w = count * (lj - norm).exp();
                    if w == 0.0 || !w.is_finite() {
                        continue;
                    }
                    pi_acc[c] += w;
                    for (j, &x) in row.iter().enumerate() {
                        if x != MISSING {
                            theta_acc[j][c][x as usize] += w;
                        }
                    }
                }
            }

            // M-step with optional Dirichlet pseudo-counts.
            let beta = use_priors.then_some(self.priors.beta.as_slice());
            m_step_row(&mut self.pi, &pi_acc, beta);
            for (annotator, acc) in self.theta.iter_mut().zip(theta_acc.iter()) {
                for (c, (row, acc_row)) in annotator.iter_mut().zip(acc.iter()).enumerate() {
                    let alpha = use_priors.then_some(self.priors.alpha[c].as_slice());
                    m_step_row(row, acc_row, alpha);
                }
            }

            let (next_ll, next_obj) = self.objective(&counts, use_priors);
            if !next_obj.is_finite() {
                self.pi = start_pi;
                self.theta = start_theta;
                return Err(ModelError::DegenerateData(format!(
                    "Model B EM objective became {next_obj} at epoch {epochs}"
                )));
            }
            trace.push(next_obj);
            debug!(epoch = epochs, objective = next_obj, "model B EM epoch");
            let delta = (next_obj - objective).abs();
            ll = next_ll;
            objective = next_obj;
            if delta < options.em.epsilon {
                stop_reason = StopReason::Converged;
                break;
            }
        }

        self.fitted_with_priors = use_priors;
        let report = FitReport {
            log_likelihood: ll,
            objective,
            iterations: epochs,
            stop_reason,
            trace,
        };
        report.log_outcome(ModelKind::B);
        Ok(report)
    }
}

impl AnnotationModel for ModelB {
    fn kind(&self) -> ModelKind {
        ModelKind::B
    }

    fn nclasses(&self) -> usize {
        self.nclasses
    }

    fn nannotators(&self) -> usize {
        self.nannotators
    }

    fn log_likelihood(&self, annotations: &AnnotationMatrix) -> Result<f64, ModelError> {
        self.check_data(annotations)?;
        Ok(Self::pattern_log_likelihood(
            &self.pi,
            &self.theta,
            &annotations.pattern_counts(),
        ))
    }

    fn log_prior(&self) -> f64 {
        self.log_prior_of(&self.pi, &self.theta)
    }

    fn mle(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        self.em(annotations, false, options, cancel_flag)
    }

    fn map(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        self.em(annotations, true, options, cancel_flag)
    }

    fn generate_labels<R: Rng + ?Sized>(&self, nitems: usize, rng: &mut R) -> Vec<usize> {
        (0..nitems).map(|_| sample_categorical(rng, &self.pi)).collect()
    }

    fn generate_annotations<R: Rng + ?Sized>(
        &self,
        labels: &[usize],
        rng: &mut R,
    ) -> Result<AnnotationMatrix, ModelError> {
        check_labels(labels, self.nclasses)?;
        let mut cells = Vec::with_capacity(labels.len() * self.nannotators);
        for &label in labels {
            for annotator in &self.theta {
                cells.push(sample_categorical(rng, &annotator[label]) as i32);
            }
        }
        AnnotationMatrix::from_cells(labels.len(), self.nannotators, self.nclasses, cells)
    }

    fn infer_labels(&self, annotations: &AnnotationMatrix) -> Result<Vec<Vec<f64>>, ModelError> {
        self.check_data(annotations)?;
        let mut joint = vec![0.0; self.nclasses];
        Ok(annotations
            .rows()
            .map(|row| {
                Self::class_log_joint(&self.pi, &self.theta, row, &mut joint);
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
        let target = ConfusionTarget {
            model: self,
            counts: annotations.pattern_counts(),
        };
        sampler::sample(&target, config, rng, cancel_flag)
    }

    fn parameters(&self) -> ModelParameters {
        ModelParameters::B {
            pi: self.pi.clone(),
            theta: self.theta.clone(),
        }
    }

    fn probability_rows(&self) -> Vec<Vec<f64>> {
        std::iter::once(self.pi.clone())
            .chain(self.theta.iter().flatten().cloned())
            .collect()
    }

    fn parameter_count(&self) -> usize {
        let free = self.nclasses - 1;
        free + self.nannotators * self.nclasses * free
    }
}

// ---------------------------------------------------------------------
//  Posterior target
// ---------------------------------------------------------------------

/// Confusion matrices with `pi` held at the estimate.
///
/// The chain moves on the first `K-1` entries of every row; the last entry
/// is `1 - sum`. Recorded draws are the full `J x K x K` tensor, flattened
/// annotator-major.
struct ConfusionTarget<'a> {
    model: &'a ModelB,
    counts: PatternCounts,
}

impl ConfusionTarget<'_> {
    fn free(&self) -> usize {
        self.model.nclasses - 1
    }

    fn expand(&self, state: &[f64]) -> Vec<Vec<Vec<f64>>> {
        let k = self.model.nclasses;
        let free = self.free();
        (0..self.model.nannotators)
            .map(|j| {
                (0..k)
                    .map(|c| {
                        let start = (j * k + c) * free;
                        let mut row = state[start..start + free].to_vec();
                        let rest = 1.0 - row.iter().sum::<f64>();
                        row.push(rest);
                        row
                    })
                    .collect()
            })
            .collect()
    }
}

impl PosteriorTarget for ConfusionTarget<'_> {
    fn dimension(&self) -> usize {
        self.model.nannotators * self.model.nclasses * self.free()
    }

    fn names(&self) -> Vec<String> {
        let k = self.model.nclasses;
        let mut names = Vec::with_capacity(self.model.nannotators * k * k);
        for j in 0..self.model.nannotators {
            for c in 0..k {
                for m in 0..k {
                    names.push(format!("theta[{j}][{c}][{m}]"));
                }
            }
        }
        names
    }

    fn initial_state(&self) -> Vec<f64> {
        let k = self.model.nclasses as f64;
        let mut state = Vec::with_capacity(self.dimension());
        for row in self.model.theta.iter().flatten() {
            // Pull boundary rows into the open simplex.
            let denom = 1.0 + k * PROB_FLOOR;
            state.extend(
                row[..row.len() - 1]
                    .iter()
                    .map(|v| (v + PROB_FLOOR) / denom),
            );
        }
        state
    }

    fn in_domain(&self, state: &[f64]) -> bool {
        let free = self.free();
        if free == 0 {
            return true;
        }
        state.chunks(free).all(|row| {
            row.iter().all(|&v| v > 0.0 && v < 1.0) && row.iter().sum::<f64>() < 1.0
        })
    }

    fn log_density(&self, state: &[f64]) -> f64 {
        let theta = self.expand(state);
        let ll = ModelB::pattern_log_likelihood(&self.model.pi, &theta, &self.counts);
        if self.model.fitted_with_priors {
            ll + self.model.log_prior_of(&self.model.pi, &theta)
        } else {
            ll
        }
    }

    fn record(&self, state: &[f64]) -> Vec<f64> {
        self.expand(state).into_iter().flatten().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prior_decays_with_class_distance() {
        let p = ModelBPriors::default_for(5);
        assert_eq!(p.alpha[0], vec![16.0, 4.0, 2.0, 1.0, 1.0]);
        assert_eq!(p.alpha[2], vec![2.0, 4.0, 16.0, 4.0, 2.0]);
        assert_eq!(p.beta, vec![2.0; 5]);
    }

    #[test]
    fn dirichlet_kernel_ignores_flat_coordinates() {
        assert_eq!(dirichlet_log_kernel(&[0.0, 1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(
            dirichlet_log_kernel(&[0.0, 1.0], &[2.0, 1.0]),
            f64::NEG_INFINITY
        );
        // Sub-unit concentrations stay finite on the boundary.
        let sparse = dirichlet_log_kernel(&[0.0, 1.0], &[0.5, 0.5]);
        assert!(sparse.is_finite() && sparse > 0.0);
    }

    #[test]
    fn m_step_row_floors_entries_clamped_by_sparse_prior() {
        let mut row = vec![0.0; 3];
        m_step_row(&mut row, &[10.0, 0.2, 0.0], Some(&[0.5, 0.5, 0.5]));
        assert!(is_distribution(&row, SIMPLEX_TOL));
        assert!(row.iter().all(|&v| v >= PROB_FLOOR * 0.5));
        assert!(row[0] > 0.99);

        let mut flat = vec![0.0; 2];
        m_step_row(&mut flat, &[3.0, 1.0], None);
        assert_eq!(flat, vec![0.75, 0.25]);
    }

    #[test]
    fn target_state_round_trips_through_expand() {
        let model = ModelB::new(
            vec![0.5, 0.5],
            vec![vec![vec![0.9, 0.1], vec![0.2, 0.8]]],
        )
        .unwrap();
        let data = AnnotationMatrix::new(vec![vec![0], vec![1]], 2).unwrap();
        let target = ConfusionTarget {
            model: &model,
            counts: data.pattern_counts(),
        };
        let start = target.initial_state();
        assert_eq!(start.len(), target.dimension());
        assert!(target.in_domain(&start));
        let recorded = target.record(&start);
        assert_eq!(recorded.len(), target.names().len());
        assert!((recorded[0] - 0.9).abs() < 1e-6);
        assert!((recorded[3] - 0.8).abs() < 1e-6);
        assert!(!target.in_domain(&[0.9, 1.2]));
    }
}
