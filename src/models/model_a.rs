//! Model A: per-annotator accuracy with structured errors.
//!
//! Every item is labelled by exactly three annotators. Each of them is
//! correct with probability `theta_j`. When at most one is wrong the
//! agreement pattern among the three values follows directly; when two or
//! three are wrong, the agreement weights `alpha` decide whether the wrong
//! annotators happen to agree:
//!
//! | index | situation | pattern |
//! |---|---|---|
//! | 0 | first correct, other two wrong and agreeing | `abb` |
//! | 1 | second correct, others wrong and agreeing | `aba` |
//! | 2 | third correct, others wrong and agreeing | `aab` |
//! | 3 | all wrong, all agreeing | `aaa` |
//! | 4, 5, 6 | all wrong, exactly one pair agreeing | `aab`, `aba`, `abb` |
//!
//! Pattern letters are then filled with classes drawn from the base rates
//! `omega` without replacement, in order of first appearance.

use std::sync::atomic::AtomicBool;

use rand::Rng;
use tracing::debug;

use super::{check_labels, check_shape, AnnotationModel, FitOptions, FitReport, ModelKind, ModelParameters};
use crate::annotations::{AnnotationMatrix, MISSING};
use crate::error::ModelError;
use crate::numeric::{
    beta_ln_pdf, expit, is_distribution, logit, normalize, pivot_logits, safe_ln, sample_beta,
    sample_categorical, sample_dirichlet, softmax_with_pivot, PROB_FLOOR, SIMPLEX_TOL,
};
use crate::optimize::minimize_restarted;
use crate::sampler::{self, PosteriorSamples, PosteriorTarget, SamplerConfig};

pub const ALPHA_LEN: usize = 7;
const ACCURACY_PRIOR: (f64, f64) = (2.0, 1.0);
const RESTARTS: usize = 2;
/// Annotators per item in the loop design.
const PER_ITEM: usize = 3;

/// Agreement pattern of three values, read left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Aaa,
    Aab,
    Aba,
    Abb,
    Abc,
}

impl Pattern {
    pub fn of(values: [usize; 3]) -> Self {
        let [x, y, z] = values;
        match (x == y, x == z, y == z) {
            (true, true, _) => Pattern::Aaa,
            (true, false, _) => Pattern::Aab,
            (false, true, _) => Pattern::Aba,
            (false, false, true) => Pattern::Abb,
            (false, false, false) => Pattern::Abc,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Distinct classes in order of first appearance.
    fn letters(self, values: [usize; 3]) -> Vec<usize> {
        match self {
            Pattern::Aaa => vec![values[0]],
            Pattern::Aab => vec![values[0], values[2]],
            Pattern::Aba | Pattern::Abb => vec![values[0], values[1]],
            Pattern::Abc => values.to_vec(),
        }
    }
}

/// One fully observed item: three annotators in index order and their values.
#[derive(Debug, Clone, Copy)]
struct Triplet {
    annotators: [usize; 3],
    values: [usize; 3],
}

fn triplet_of(row: &[i32]) -> Option<Triplet> {
    let mut annotators = [0usize; 3];
    let mut values = [0usize; 3];
    let mut n = 0;
    for (j, &x) in row.iter().enumerate() {
        if x == MISSING {
            continue;
        }
        if n == PER_ITEM {
            return None;
        }
        annotators[n] = j;
        values[n] = x as usize;
        n += 1;
    }
    (n == PER_ITEM).then_some(Triplet { annotators, values })
}

/// Unique triplets with multiplicities; rejects items outside the design.
fn triplets(annotations: &AnnotationMatrix) -> Result<Vec<(Triplet, f64)>, ModelError> {
    annotations
        .pattern_counts()
        .iter()
        .map(|(row, count)| {
            triplet_of(row).map(|t| (t, count)).ok_or_else(|| {
                ModelError::InvalidAnnotations(format!(
                    "Model A needs exactly {PER_ITEM} annotations per item, found a row with {}",
                    row.iter().filter(|&&x| x != MISSING).count()
                ))
            })
        })
        .collect()
}

/// Agreement weights induced by errors drawn proportionally to `omega`.
///
/// An annotator who is wrong about true class `l` reports `k != l` with
/// probability `omega_k / (1 - omega_l)`. For two classes two wrong
/// annotators always agree.
pub fn alphas_from_omega(omega: &[f64]) -> Vec<f64> {
    let (mut pair, mut all, mut one_pair, mut weight) = (0.0, 0.0, 0.0, 0.0);
    for (l, &wl) in omega.iter().enumerate() {
        let rest = 1.0 - wl;
        if wl <= 0.0 || rest <= 0.0 {
            continue;
        }
        weight += wl;
        for (k, &wk) in omega.iter().enumerate() {
            if k == l {
                continue;
            }
            let q = wk / rest;
            pair += wl * q * q;
            all += wl * q * q * q;
            one_pair += wl * q * q * (1.0 - q);
        }
    }
    if weight > 0.0 {
        pair /= weight;
        all /= weight;
        one_pair /= weight;
    }
    expand_alphas(pair, all, one_pair)
}

fn expand_alphas(pair: f64, all: f64, one_pair: f64) -> Vec<f64> {
    vec![pair, pair, pair, all, one_pair, one_pair, one_pair]
}

/// `P(pattern | correctness probabilities, alpha)` for the five patterns.
fn pattern_probabilities(t: [f64; 3], alpha: &[f64]) -> [f64; 5] {
    let [t1, t2, t3] = t;
    let (f1, f2, f3) = (1.0 - t1, 1.0 - t2, 1.0 - t3);
    let none = f1 * f2 * f3;
    let cii = t1 * f2 * f3;
    let ici = f1 * t2 * f3;
    let iic = f1 * f2 * t3;

    let aaa = t1 * t2 * t3 + none * alpha[3];
    let aab = t1 * t2 * f3 + iic * alpha[2] + none * alpha[4];
    let aba = t1 * f2 * t3 + ici * alpha[1] + none * alpha[5];
    let abb = f1 * t2 * t3 + cii * alpha[0] + none * alpha[6];
    let abc = cii * (1.0 - alpha[0])
        + ici * (1.0 - alpha[1])
        + iic * (1.0 - alpha[2])
        + none * (1.0 - alpha[3] - alpha[4] - alpha[5] - alpha[6]);
    [aaa, aab, aba, abb, abc.max(0.0)]
}

/// `ln P(values | pattern, omega)`: letters drawn from `omega` without replacement.
fn values_ln(omega: &[f64], letters: &[usize]) -> f64 {
    let mut remaining = 1.0;
    let mut acc = 0.0;
    for &c in letters {
        if remaining <= 0.0 {
            return f64::NEG_INFINITY;
        }
        acc += safe_ln(omega[c] / remaining);
        remaining -= omega[c];
    }
    acc
}

fn accuracy_log_prior(theta: &[f64]) -> f64 {
    theta
        .iter()
        .map(|&t| beta_ln_pdf(t, ACCURACY_PRIOR.0, ACCURACY_PRIOR.1))
        .sum()
}

fn pattern_log_likelihood(theta: &[f64], alpha: &[f64], data: &[(Triplet, f64)]) -> f64 {
    data.iter()
        .map(|(t, count)| {
            let [a, b, c] = t.annotators;
            let probs = pattern_probabilities([theta[a], theta[b], theta[c]], alpha);
            count * safe_ln(probs[Pattern::of(t.values).index()])
        })
        .sum()
}

fn values_log_likelihood(omega: &[f64], data: &[(Triplet, f64)]) -> f64 {
    data.iter()
        .map(|(t, count)| {
            let pattern = Pattern::of(t.values);
            count * values_ln(omega, &pattern.letters(t.values))
        })
        .sum()
}

/// Draw a class from `omega` avoiding `excluded`; `None` when nothing is left.
fn draw_excluding<R: Rng + ?Sized>(rng: &mut R, omega: &[f64], excluded: &[usize]) -> Option<usize> {
    let weights: Vec<f64> = omega
        .iter()
        .enumerate()
        .map(|(k, &w)| if excluded.contains(&k) { 0.0 } else { w })
        .collect();
    if weights.iter().all(|&w| w <= 0.0) {
        return None;
    }
    Some(sample_categorical(rng, &weights))
}

#[derive(Debug, Clone)]
pub struct ModelA {
    nclasses: usize,
    nannotators: usize,
    theta: Vec<f64>,
    omega: Vec<f64>,
    alpha: Vec<f64>,
    explicit_alphas: bool,
    fitted_with_priors: bool,
}

fn check_dims(nclasses: usize, nannotators: usize) -> Result<(), ModelError> {
    if nclasses < 2 {
        return Err(ModelError::InvalidDimension {
            what: "nclasses",
            value: nclasses,
        });
    }
    if nannotators < PER_ITEM {
        return Err(ModelError::InvalidDimension {
            what: "nannotators",
            value: nannotators,
        });
    }
    Ok(())
}

impl ModelA {
    pub fn new(
        theta: Vec<f64>,
        omega: Vec<f64>,
        alpha: Vec<f64>,
        explicit_alphas: bool,
    ) -> Result<Self, ModelError> {
        check_dims(omega.len(), theta.len())?;
        if !is_distribution(&omega, SIMPLEX_TOL) {
            return Err(ModelError::InvalidParameters("omega is not a distribution".into()));
        }
        if theta.iter().any(|t| !(0.0..=1.0).contains(t)) {
            return Err(ModelError::InvalidParameters(
                "theta entries must lie in [0, 1]".into(),
            ));
        }
        if alpha.len() != ALPHA_LEN {
            return Err(ModelError::shape(
                format!("{ALPHA_LEN} alpha weights"),
                format!("{} alpha weights", alpha.len()),
            ));
        }
        if alpha.iter().any(|a| !(0.0..=1.0).contains(a))
            || alpha[3..].iter().sum::<f64>() > 1.0 + SIMPLEX_TOL
        {
            return Err(ModelError::InvalidParameters(
                "alpha weights must lie in [0, 1] with alpha[3..7] summing to at most 1".into(),
            ));
        }
        Ok(Self {
            nclasses: omega.len(),
            nannotators: theta.len(),
            theta,
            omega,
            alpha,
            explicit_alphas,
            fitted_with_priors: false,
        })
    }

    /// Random model: accuracies from Beta(2, 1), base rates from a flat
    /// Dirichlet, and agreement weights either derived from the base rates or
    /// drawn at random when they are to be estimated.
    pub fn create_initial_state<R: Rng + ?Sized>(
        nclasses: usize,
        nannotators: usize,
        explicit_alphas: bool,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        check_dims(nclasses, nannotators)?;
        let theta = (0..nannotators)
            .map(|_| sample_beta(rng, ACCURACY_PRIOR.0, ACCURACY_PRIOR.1))
            .collect();
        let omega = sample_dirichlet(rng, &vec![1.0; nclasses]);
        let alpha = if explicit_alphas {
            let pair = rng.gen::<f64>();
            let triple = sample_dirichlet(rng, &[1.0, 1.0, 1.0]);
            expand_alphas(pair, triple[0], triple[1] / 3.0)
        } else {
            alphas_from_omega(&omega)
        };
        Ok(Self {
            nclasses,
            nannotators,
            theta,
            omega,
            alpha,
            explicit_alphas,
            fitted_with_priors: false,
        })
    }

    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    pub fn omega(&self) -> &[f64] {
        &self.omega
    }

    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    pub fn explicit_alphas(&self) -> bool {
        self.explicit_alphas
    }

    fn check_data(&self, annotations: &AnnotationMatrix) -> Result<(), ModelError> {
        check_shape(annotations, self.nclasses, self.nannotators)
    }

    /// `(pair, all, one_pair)` free agreement weights.
    fn free_alphas(&self) -> [f64; 3] {
        [self.alpha[0], self.alpha[3], self.alpha[4]]
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
        let data = triplets(annotations)?;

        // Committed together with theta only once the search succeeds.
        let omega = annotations.class_frequencies()?;
        let start_alpha = if self.explicit_alphas {
            self.alpha.clone()
        } else {
            alphas_from_omega(&omega)
        };
        let values_ll = values_log_likelihood(&omega, &data);
        let nannotators = self.nannotators;
        let explicit = self.explicit_alphas;

        let mut x0: Vec<f64> = self.theta.iter().map(|&t| logit(t)).collect();
        if explicit {
            let [pair, all, one_pair] = self.free_alphas();
            x0.push(logit(pair));
            let rest = (1.0 - all - 3.0 * one_pair).max(PROB_FLOOR);
            x0.extend(pivot_logits(&[all, 3.0 * one_pair, rest]));
        }

        let fixed_alpha = start_alpha;
        let unpack = |x: &[f64]| -> (Vec<f64>, Vec<f64>) {
            let theta = x[..nannotators].iter().map(|&z| expit(z)).collect();
            let alpha = if explicit {
                let tail = softmax_with_pivot(&x[nannotators + 1..]);
                expand_alphas(expit(x[nannotators]), tail[0], tail[1] / 3.0)
            } else {
                fixed_alpha.clone()
            };
            (theta, alpha)
        };
        let objective = |x: &[f64]| {
            let (theta, alpha) = unpack(x);
            let mut value = pattern_log_likelihood(&theta, &alpha, &data) + values_ll;
            if use_priors {
                value += accuracy_log_prior(&theta);
            }
            -value
        };
        let min = minimize_restarted(objective, &x0, &options.optimizer, RESTARTS, cancel_flag);
        if !min.value.is_finite() {
            return Err(ModelError::DegenerateData(
                "Model A objective is not finite at the starting point".into(),
            ));
        }

        let (theta, alpha) = unpack(&min.x);
        self.omega = omega;
        self.theta = theta;
        self.alpha = alpha;
        self.fitted_with_priors = use_priors;
        let log_likelihood = pattern_log_likelihood(&self.theta, &self.alpha, &data) + values_ll;
        debug!(
            iterations = min.iterations,
            evaluations = min.evaluations,
            log_likelihood,
            "model A simplex search finished"
        );
        let report = FitReport {
            log_likelihood,
            objective: -min.value,
            iterations: min.iterations,
            stop_reason: min.stop_reason,
            trace: Vec::new(),
        };
        report.log_outcome(ModelKind::A);
        Ok(report)
    }

    /// Values reported by three annotators for true label `label`.
    fn generate_triplet<R: Rng + ?Sized>(
        &self,
        annotators: [usize; 3],
        label: usize,
        rng: &mut R,
    ) -> [usize; 3] {
        let correct: Vec<bool> = annotators
            .iter()
            .map(|&j| rng.gen::<f64>() < self.theta[j])
            .collect();
        let wrong: Vec<usize> = (0..PER_ITEM).filter(|&p| !correct[p]).collect();
        let mut values = [label; 3];

        // Pattern among the wrong annotators, as letter assignments.
        let letters: Vec<usize> = match wrong.len() {
            0 => Vec::new(),
            1 => vec![0],
            2 => {
                if rng.gen::<f64>() < self.alpha[pair_index(&wrong)] {
                    vec![0, 0]
                } else {
                    vec![0, 1]
                }
            }
            _ => {
                let all = self.alpha[3];
                let one = [self.alpha[4], self.alpha[5], self.alpha[6]];
                let rest = (1.0 - all - one.iter().sum::<f64>()).max(0.0);
                match sample_categorical(rng, &[all, one[0], one[1], one[2], rest]) {
                    0 => vec![0, 0, 0],
                    1 => vec![0, 0, 1],
                    2 => vec![0, 1, 0],
                    3 => vec![0, 1, 1],
                    _ => vec![0, 1, 2],
                }
            }
        };

        // Fill letters with distinct wrong classes; collapse when classes run out.
        let mut classes: Vec<usize> = Vec::new();
        let mut excluded = vec![label];
        for (&p, &letter) in wrong.iter().zip(letters.iter()) {
            while classes.len() <= letter {
                match draw_excluding(rng, &self.omega, &excluded) {
                    Some(c) => {
                        classes.push(c);
                        excluded.push(c);
                    }
                    None => break,
                }
            }
            values[p] = classes
                .get(letter)
                .or_else(|| classes.last())
                .copied()
                .unwrap_or(label);
        }
        values
    }
}

/// Agreement weight index for two wrong annotators at `positions`.
fn pair_index(positions: &[usize]) -> usize {
    match positions {
        [1, 2] => 0,
        [0, 2] => 1,
        _ => 2,
    }
}

impl AnnotationModel for ModelA {
    fn kind(&self) -> ModelKind {
        ModelKind::A
    }

    fn nclasses(&self) -> usize {
        self.nclasses
    }

    fn nannotators(&self) -> usize {
        self.nannotators
    }

    fn log_likelihood(&self, annotations: &AnnotationMatrix) -> Result<f64, ModelError> {
        self.check_data(annotations)?;
        let data = triplets(annotations)?;
        Ok(pattern_log_likelihood(&self.theta, &self.alpha, &data)
            + values_log_likelihood(&self.omega, &data))
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
        (0..nitems).map(|_| sample_categorical(rng, &self.omega)).collect()
    }

    /// Loop design: item `i` goes to annotators `i, i+1, i+2` (mod J).
    fn generate_annotations<R: Rng + ?Sized>(
        &self,
        labels: &[usize],
        rng: &mut R,
    ) -> Result<AnnotationMatrix, ModelError> {
        check_labels(labels, self.nclasses)?;
        let j = self.nannotators;
        let mut cells = vec![MISSING; labels.len() * j];
        for (i, &label) in labels.iter().enumerate() {
            let mut annotators = [i % j, (i + 1) % j, (i + 2) % j];
            annotators.sort_unstable();
            let values = self.generate_triplet(annotators, label, rng);
            for (&a, &v) in annotators.iter().zip(values.iter()) {
                cells[i * j + a] = v as i32;
            }
        }
        AnnotationMatrix::from_cells(labels.len(), j, self.nclasses, cells)
    }

    /// Label posterior: the correct annotators report the true label, wrong
    /// ones any other class in proportion to `omega`.
    fn infer_labels(&self, annotations: &AnnotationMatrix) -> Result<Vec<Vec<f64>>, ModelError> {
        self.check_data(annotations)?;
        Ok(annotations
            .rows()
            .map(|row| {
                let mut posterior: Vec<f64> = (0..self.nclasses)
                    .map(|l| {
                        let rest = 1.0 - self.omega[l];
                        row.iter()
                            .enumerate()
                            .filter(|(_, &x)| x != MISSING)
                            .fold(self.omega[l], |acc, (j, &x)| {
                                let t = self.theta[j];
                                let p = if x as usize == l {
                                    t
                                } else if rest > 0.0 {
                                    (1.0 - t) * self.omega[x as usize] / rest
                                } else {
                                    0.0
                                };
                                acc * p
                            })
                    })
                    .collect();
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
        let data = triplets(annotations)?;
        let values_ll = values_log_likelihood(&self.omega, &data);
        let target = AccuracyTarget {
            model: self,
            data,
            values_ll,
        };
        sampler::sample(&target, config, rng, cancel_flag)
    }

    fn parameters(&self) -> ModelParameters {
        ModelParameters::A {
            theta: self.theta.clone(),
            omega: self.omega.clone(),
            alpha: self.alpha.clone(),
            explicit_alphas: self.explicit_alphas,
        }
    }

    fn probability_rows(&self) -> Vec<Vec<f64>> {
        let mut rows = vec![self.omega.clone()];
        rows.extend(self.theta.iter().map(|&t| vec![t, 1.0 - t]));
        rows.extend(self.alpha[..3].iter().map(|&a| vec![a, 1.0 - a]));
        let mut all_wrong = self.alpha[3..].to_vec();
        all_wrong.push(1.0 - all_wrong.iter().sum::<f64>());
        rows.push(all_wrong);
        rows
    }

    fn parameter_count(&self) -> usize {
        self.nannotators + if self.explicit_alphas { 3 } else { 0 }
    }
}

/// Accuracies, plus `(pair, all, one_pair)` when the agreement weights are free.
struct AccuracyTarget<'a> {
    model: &'a ModelA,
    data: Vec<(Triplet, f64)>,
    values_ll: f64,
}

impl AccuracyTarget<'_> {
    fn split<'s>(&self, state: &'s [f64]) -> (&'s [f64], Vec<f64>) {
        let (theta, free) = state.split_at(self.model.nannotators);
        let alpha = if self.model.explicit_alphas {
            expand_alphas(free[0], free[1], free[2])
        } else {
            self.model.alpha.clone()
        };
        (theta, alpha)
    }
}

impl PosteriorTarget for AccuracyTarget<'_> {
    fn dimension(&self) -> usize {
        self.model.parameter_count()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = (0..self.model.nannotators)
            .map(|j| format!("theta[{j}]"))
            .collect();
        if self.model.explicit_alphas {
            names.extend(["alpha_pair", "alpha_all", "alpha_one_pair"].map(String::from));
        }
        names
    }

    fn initial_state(&self) -> Vec<f64> {
        let mut state: Vec<f64> = self
            .model
            .theta
            .iter()
            .map(|t| t.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR))
            .collect();
        if self.model.explicit_alphas {
            let [pair, all, one_pair] = self.model.free_alphas();
            let denom = 1.0 + 3.0 * PROB_FLOOR;
            state.push(pair.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR));
            state.push((all + PROB_FLOOR) / denom);
            state.push((one_pair + PROB_FLOOR / 3.0) / denom);
        }
        state
    }

    fn in_domain(&self, state: &[f64]) -> bool {
        let (theta, free) = state.split_at(self.model.nannotators);
        let theta_ok = theta.iter().all(|&t| t > 0.0 && t < 1.0);
        if !self.model.explicit_alphas {
            return theta_ok;
        }
        theta_ok
            && free.iter().all(|&a| a > 0.0 && a < 1.0)
            && free[1] + 3.0 * free[2] < 1.0
    }

    fn log_density(&self, state: &[f64]) -> f64 {
        let (theta, alpha) = self.split(state);
        let ll = pattern_log_likelihood(theta, &alpha, &self.data) + self.values_ll;
        if self.model.fitted_with_priors {
            ll + accuracy_log_prior(theta)
        } else {
            ll
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_are_classified_left_to_right() {
        assert_eq!(Pattern::of([2, 2, 2]), Pattern::Aaa);
        assert_eq!(Pattern::of([2, 2, 0]), Pattern::Aab);
        assert_eq!(Pattern::of([2, 0, 2]), Pattern::Aba);
        assert_eq!(Pattern::of([0, 2, 2]), Pattern::Abb);
        assert_eq!(Pattern::of([0, 1, 2]), Pattern::Abc);
    }

    #[test]
    fn pattern_probabilities_sum_to_one() {
        let omega = [0.1, 0.2, 0.3, 0.4];
        let alpha = alphas_from_omega(&omega);
        for t in [[0.9, 0.8, 0.7], [0.1, 0.5, 0.99], [0.0, 0.0, 0.0]] {
            let p = pattern_probabilities(t, &alpha);
            assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12, "{p:?}");
            assert!(p.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn derived_alphas_for_two_classes_always_agree() {
        let alpha = alphas_from_omega(&[0.3, 0.7]);
        assert!((alpha[0] - 1.0).abs() < 1e-12);
        assert!((alpha[3] - 1.0).abs() < 1e-12);
        assert!(alpha[4].abs() < 1e-12);
    }

    #[test]
    fn derived_alphas_for_three_classes_exclude_three_way_disagreement() {
        let alpha = alphas_from_omega(&[0.2, 0.3, 0.5]);
        let three_wrong: f64 = alpha[3] + alpha[4] + alpha[5] + alpha[6];
        assert!((three_wrong - 1.0).abs() < 1e-12);
    }

    #[test]
    fn values_term_draws_without_replacement() {
        let omega = [0.5, 0.25, 0.25];
        let ln = values_ln(&omega, &[0, 1]);
        assert!((ln - (0.5_f64 * 0.5).ln()).abs() < 1e-12);
        let letters = Pattern::Aba.letters([2, 0, 2]);
        assert_eq!(letters, vec![2, 0]);
        assert_eq!(Pattern::Aab.letters([1, 1, 0]), vec![1, 0]);
    }

    #[test]
    fn triplet_requires_exactly_three_observations() {
        assert!(triplet_of(&[0, MISSING, 1, 1]).is_some());
        assert!(triplet_of(&[0, 1, 1, 1]).is_none());
        assert!(triplet_of(&[0, MISSING, MISSING, 1]).is_none());
    }
}
