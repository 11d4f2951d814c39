//! Adaptive random-walk Metropolis–Hastings.
//!
//! A run has three phases:
//!
//! 1. **Initialization**: the chain starts at the target's point estimate,
//!    the proposal scale starts at [`SamplerConfig::initial_step`].
//! 2. **Adaptation**: a [`StepSizeController`] watches windows of
//!    `adjust_step_every` iterations and rescales sigma towards the target
//!    rejection rate, until the rate is within tolerance or the
//!    `step_optimization_block_size` budget runs out.
//! 3. **Sampling**: `n_iterations` draws with sigma frozen.
//!
//! Proposals are isotropic Gaussian steps `x' = x + sigma * N(0, I)`. The
//! proposal is symmetric, so a move is accepted with probability
//! `min(1, exp(log p(x') - log p(x)))`. Proposals outside the target's domain
//! and proposals with a non-finite log-density are rejections.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ModelError;
use crate::optimize::StopReason;

/// Smallest and largest proposal scale the controller will use.
pub const MIN_STEP: f64 = 1e-6;
pub const MAX_STEP: f64 = 10.0;

/// Bounds on the multiplicative sigma update per window.
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

/// Histogram resolution used to locate the mode of a parameter's draws.
pub const MODE_BINS: usize = 50;

// ---------------------------------------------------------------------
//  Config
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of recorded draws in the sampling phase.
    pub n_iterations: usize,
    /// Desired fraction of rejected proposals.
    pub target_rejection_rate: f64,
    /// Adaptation stops once a window's rejection rate is this close to the target.
    pub rejection_rate_tolerance: f64,
    /// Iteration budget of the whole adaptation phase.
    pub step_optimization_block_size: usize,
    /// Window length between sigma adjustments.
    pub adjust_step_every: usize,
    pub initial_step: f64,
    /// Prepend the adaptation-phase draws to the returned samples.
    pub keep_adaptation_draws: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_iterations: 1_000,
            target_rejection_rate: 0.3,
            rejection_rate_tolerance: 0.2,
            step_optimization_block_size: 500,
            adjust_step_every: 100,
            initial_step: 0.01,
            keep_adaptation_draws: false,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.n_iterations == 0 {
            return Err(ModelError::InvalidConfig("n_iterations must be > 0".into()));
        }
        if !(self.target_rejection_rate > 0.0 && self.target_rejection_rate < 1.0) {
            return Err(ModelError::InvalidConfig(
                "target_rejection_rate must be in (0, 1)".into(),
            ));
        }
        if !(self.rejection_rate_tolerance > 0.0) {
            return Err(ModelError::InvalidConfig(
                "rejection_rate_tolerance must be > 0".into(),
            ));
        }
        if self.step_optimization_block_size == 0 || self.adjust_step_every == 0 {
            return Err(ModelError::InvalidConfig(
                "step_optimization_block_size and adjust_step_every must be > 0".into(),
            ));
        }
        if !(self.initial_step > 0.0 && self.initial_step.is_finite()) {
            return Err(ModelError::InvalidConfig(
                "initial_step must be positive and finite".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
//  Step-size state machine
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationPhase {
    Adapting,
    /// A window hit the target rejection rate within tolerance.
    Converged,
    /// The adaptation budget ran out; sampling proceeds with the last sigma.
    BudgetExhausted,
}

/// Multiplicative sigma update: grows when rejecting less than the target,
/// shrinks when rejecting more. A window without rejections grows sigma by
/// the maximum factor.
pub fn next_step_size(sigma: f64, rejection_rate: f64, target_rejection_rate: f64) -> f64 {
    let factor = if rejection_rate <= 0.0 {
        MAX_FACTOR
    } else {
        (target_rejection_rate / rejection_rate).clamp(MIN_FACTOR, MAX_FACTOR)
    };
    (sigma * factor).clamp(MIN_STEP, MAX_STEP)
}

/// Online controller for the proposal scale during adaptation.
#[derive(Debug, Clone)]
pub struct StepSizeController {
    sigma: f64,
    target: f64,
    tolerance: f64,
    window: usize,
    budget: usize,
    window_seen: usize,
    window_rejected: usize,
    iterations: usize,
    adjustments: usize,
    last_rejection_rate: Option<f64>,
    phase: AdaptationPhase,
}

impl StepSizeController {
    pub fn new(
        initial_sigma: f64,
        target_rejection_rate: f64,
        tolerance: f64,
        window: usize,
        budget: usize,
    ) -> Self {
        Self {
            sigma: initial_sigma.clamp(MIN_STEP, MAX_STEP),
            target: target_rejection_rate,
            tolerance,
            window: window.max(1),
            budget,
            window_seen: 0,
            window_rejected: 0,
            iterations: 0,
            adjustments: 0,
            last_rejection_rate: None,
            phase: if budget == 0 {
                AdaptationPhase::BudgetExhausted
            } else {
                AdaptationPhase::Adapting
            },
        }
    }

    pub fn from_config(cfg: &SamplerConfig) -> Self {
        Self::new(
            cfg.initial_step,
            cfg.target_rejection_rate,
            cfg.rejection_rate_tolerance,
            cfg.adjust_step_every,
            cfg.step_optimization_block_size,
        )
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn phase(&self) -> AdaptationPhase {
        self.phase
    }

    pub fn is_adapting(&self) -> bool {
        self.phase == AdaptationPhase::Adapting
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn last_rejection_rate(&self) -> Option<f64> {
        self.last_rejection_rate
    }

    /// Feed one proposal outcome. Returns the phase after the update; once
    /// the phase leaves `Adapting` further calls are no-ops.
    pub fn record(&mut self, accepted: bool) -> AdaptationPhase {
        if self.phase != AdaptationPhase::Adapting {
            return self.phase;
        }
        self.iterations += 1;
        self.window_seen += 1;
        if !accepted {
            self.window_rejected += 1;
        }

        if self.window_seen == self.window {
            let rate = self.window_rejected as f64 / self.window_seen as f64;
            self.last_rejection_rate = Some(rate);
            self.window_seen = 0;
            self.window_rejected = 0;
            if (rate - self.target).abs() <= self.tolerance {
                self.phase = AdaptationPhase::Converged;
                debug!(sigma = self.sigma, rejection_rate = rate, "step size converged");
                return self.phase;
            }
            let next = next_step_size(self.sigma, rate, self.target);
            debug!(
                sigma = self.sigma,
                next_sigma = next,
                rejection_rate = rate,
                "adjusting step size"
            );
            self.sigma = next;
            self.adjustments += 1;
        }

        if self.iterations >= self.budget {
            self.phase = AdaptationPhase::BudgetExhausted;
        }
        self.phase
    }

    pub fn summary(&self) -> AdaptationSummary {
        AdaptationSummary {
            phase: self.phase,
            iterations: self.iterations,
            adjustments: self.adjustments,
            last_rejection_rate: self.last_rejection_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationSummary {
    pub phase: AdaptationPhase,
    pub iterations: usize,
    pub adjustments: usize,
    pub last_rejection_rate: Option<f64>,
}

// ---------------------------------------------------------------------
//  Target and chain
// ---------------------------------------------------------------------

/// A log-density over a box-like parameter domain.
///
/// Models implement this for the accuracy-related sub-vector of their
/// parameters, holding everything else fixed at the point estimate.
pub trait PosteriorTarget {
    fn dimension(&self) -> usize;

    /// Names of the coordinates produced by [`PosteriorTarget::record`].
    fn names(&self) -> Vec<String>;

    /// Starting state; must lie inside the domain.
    fn initial_state(&self) -> Vec<f64>;

    fn in_domain(&self, state: &[f64]) -> bool;

    /// Unnormalized log-density; may be `-inf`.
    fn log_density(&self, state: &[f64]) -> f64;

    /// Map a chain state to the recorded sample layout.
    fn record(&self, state: &[f64]) -> Vec<f64> {
        state.to_vec()
    }
}

/// `min(1, exp(proposed - current))`, zero for a non-finite proposal.
pub fn acceptance_probability(current_log_density: f64, proposed_log_density: f64) -> f64 {
    if !proposed_log_density.is_finite() {
        return 0.0;
    }
    let delta = proposed_log_density - current_log_density;
    if delta.is_nan() {
        return 0.0;
    }
    if delta >= 0.0 {
        1.0
    } else {
        delta.exp()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub accepted: bool,
    pub acceptance_probability: f64,
}

/// Current state of a single Metropolis chain.
#[derive(Debug, Clone)]
pub struct Chain {
    state: Vec<f64>,
    log_density: f64,
    proposal: Vec<f64>,
}

impl Chain {
    pub fn start<T: PosteriorTarget + ?Sized>(target: &T) -> Result<Self, ModelError> {
        let state = target.initial_state();
        if state.len() != target.dimension() {
            return Err(ModelError::shape(
                format!("{} coordinates", target.dimension()),
                format!("{} coordinates", state.len()),
            ));
        }
        if !target.in_domain(&state) {
            return Err(ModelError::InvalidParameters(
                "sampler start point lies outside the parameter domain".into(),
            ));
        }
        let log_density = target.log_density(&state);
        if !log_density.is_finite() {
            return Err(ModelError::DegenerateData(
                "log-density at the point estimate is not finite".into(),
            ));
        }
        let proposal = vec![0.0; state.len()];
        Ok(Self {
            state,
            log_density,
            proposal,
        })
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn log_density(&self) -> f64 {
        self.log_density
    }

    /// One Metropolis transition with proposal scale `sigma`.
    pub fn step<T, R>(&mut self, target: &T, sigma: f64, rng: &mut R) -> Transition
    where
        T: PosteriorTarget + ?Sized,
        R: Rng + ?Sized,
    {
        for (p, x) in self.proposal.iter_mut().zip(self.state.iter()) {
            let z: f64 = rng.sample(StandardNormal);
            *p = x + sigma * z;
        }
        if !target.in_domain(&self.proposal) {
            return Transition {
                accepted: false,
                acceptance_probability: 0.0,
            };
        }
        let proposed = target.log_density(&self.proposal);
        let prob = acceptance_probability(self.log_density, proposed);
        let accepted = rng.gen::<f64>() < prob;
        if accepted {
            std::mem::swap(&mut self.state, &mut self.proposal);
            self.log_density = proposed;
        }
        Transition {
            accepted,
            acceptance_probability: prob,
        }
    }
}

// ---------------------------------------------------------------------
//  Driver
// ---------------------------------------------------------------------

/// Run adaptation then sampling against `target`.
pub fn sample<T, R>(
    target: &T,
    cfg: &SamplerConfig,
    rng: &mut R,
    cancel_flag: Option<&AtomicBool>,
) -> Result<PosteriorSamples, ModelError>
where
    T: PosteriorTarget + ?Sized,
    R: Rng + ?Sized,
{
    cfg.validate()?;
    let mut chain = Chain::start(target)?;
    let mut controller = StepSizeController::from_config(cfg);
    let cancelled = || cancel_flag.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed));

    let mut draws: Vec<Vec<f64>> = Vec::new();
    let mut stop_reason = StopReason::Completed;

    while controller.is_adapting() {
        if cancelled() {
            stop_reason = StopReason::Cancelled;
            break;
        }
        let transition = chain.step(target, controller.sigma(), rng);
        if cfg.keep_adaptation_draws {
            draws.push(target.record(chain.state()));
        }
        controller.record(transition.accepted);
    }
    let adaptation = controller.summary();
    let adaptation_draws = draws.len();
    if adaptation.phase == AdaptationPhase::BudgetExhausted {
        warn!(
            iterations = adaptation.iterations,
            last_rejection_rate = ?adaptation.last_rejection_rate,
            sigma = controller.sigma(),
            "step-size adaptation exhausted its budget; sampling with last step size"
        );
    }

    let sigma = controller.sigma();
    let mut accepted = 0usize;
    let mut proposed = 0usize;
    if stop_reason != StopReason::Cancelled {
        draws.reserve(cfg.n_iterations);
        for _ in 0..cfg.n_iterations {
            if cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            let transition = chain.step(target, sigma, rng);
            proposed += 1;
            if transition.accepted {
                accepted += 1;
            }
            draws.push(target.record(chain.state()));
        }
    }

    let acceptance_rate = if proposed > 0 {
        accepted as f64 / proposed as f64
    } else {
        0.0
    };
    debug!(
        draws = draws.len(),
        sigma,
        acceptance_rate,
        "posterior sampling finished"
    );

    Ok(PosteriorSamples {
        names: target.names(),
        draws,
        adaptation_draws,
        step_size: sigma,
        adaptation,
        acceptance_rate,
        stop_reason,
    })
}

// ---------------------------------------------------------------------
//  Samples
// ---------------------------------------------------------------------

/// Dependent posterior draws (a Markov chain, not i.i.d.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosteriorSamples {
    pub names: Vec<String>,
    pub draws: Vec<Vec<f64>>,
    /// Leading draws that came from the adaptation phase.
    pub adaptation_draws: usize,
    /// Final adapted proposal scale.
    pub step_size: f64,
    pub adaptation: AdaptationSummary,
    /// Acceptance rate of the sampling phase.
    pub acceptance_rate: f64,
    pub stop_reason: StopReason,
}

/// Shape of a reported credible interval.
///
/// A skewed posterior whose mode falls outside the equal-tailed interval is
/// reported as a one-sided bound instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    TwoSided,
    /// Mode below the interval: `P(x <= upper) = level`.
    UpperBound,
    /// Mode above the interval: `P(x >= lower) = level`.
    LowerBound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    /// Center of the fullest of [`MODE_BINS`] histogram bins.
    pub mode: f64,
    /// Sample skewness `m3 / m2^1.5`.
    pub skew: f64,
    pub interval: IntervalKind,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl ParameterSummary {
    /// Summarize one parameter's draws; `None` for an empty column or a
    /// level outside (0, 1).
    pub fn from_draws(
        name: impl Into<String>,
        values: &[f64],
        level: f64,
        bins: usize,
    ) -> Option<Self> {
        if values.is_empty() || !(level > 0.0 && level < 1.0) {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let m2 = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let m3 = sorted.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
        let std = if sorted.len() > 1 {
            (m2 * n / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        let skew = if m2 > 0.0 { m3 / m2.powf(1.5) } else { 0.0 };
        let mode = histogram_mode(&sorted, bins);

        let tail = (1.0 - level) / 2.0;
        let lo = quantile_sorted(&sorted, tail);
        let hi = quantile_sorted(&sorted, 1.0 - tail);
        let (interval, lower, upper) = if mode < lo {
            (IntervalKind::UpperBound, None, Some(quantile_sorted(&sorted, level)))
        } else if mode > hi {
            (IntervalKind::LowerBound, Some(quantile_sorted(&sorted, 1.0 - level)), None)
        } else {
            (IntervalKind::TwoSided, Some(lo), Some(hi))
        };

        Some(Self {
            name: name.into(),
            mean,
            std,
            median: median_sorted(&sorted),
            mode,
            skew,
            interval,
            lower,
            upper,
        })
    }
}

/// Empirical quantile of sorted values: the element at `floor(n * q)`.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    sorted[((n as f64 * q).floor() as usize).min(n - 1)]
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Center of the first fullest bin of an equal-width histogram over
/// `[min, max]`. The last bin is closed on the right.
fn histogram_mode(sorted: &[f64], bins: usize) -> f64 {
    let (min, max) = (sorted[0], sorted[sorted.len() - 1]);
    let bins = bins.max(1);
    if !(max > min) {
        return min;
    }
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in sorted {
        let b = (((v - min) / width).floor() as usize).min(bins - 1);
        counts[b] += 1;
    }
    let mut best = 0;
    for (b, &c) in counts.iter().enumerate() {
        if c > counts[best] {
            best = b;
        }
    }
    min + (best as f64 + 0.5) * width
}

impl PosteriorSamples {
    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Sampling-phase draws only.
    pub fn sampling_draws(&self) -> &[Vec<f64>] {
        &self.draws[self.adaptation_draws.min(self.draws.len())..]
    }

    pub fn column(&self, index: usize) -> Vec<f64> {
        self.sampling_draws()
            .iter()
            .filter_map(|d| d.get(index).copied())
            .collect()
    }

    pub fn mean(&self) -> Vec<f64> {
        let draws = self.sampling_draws();
        let dim = self.names.len();
        let mut mean = vec![0.0; dim];
        if draws.is_empty() {
            return mean;
        }
        for d in draws {
            for (m, v) in mean.iter_mut().zip(d.iter()) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= draws.len() as f64);
        mean
    }

    /// Equal-tailed empirical credible interval at `level` (e.g. 0.95).
    pub fn credible_interval(&self, index: usize, level: f64) -> Option<(f64, f64)> {
        let mut col = self.column(index);
        if col.is_empty() || !(level > 0.0 && level < 1.0) {
            return None;
        }
        col.sort_by(|a, b| a.total_cmp(b));
        let tail = (1.0 - level) / 2.0;
        Some((quantile_sorted(&col, tail), quantile_sorted(&col, 1.0 - tail)))
    }

    /// Per-parameter summaries of the sampling-phase draws. Parameters with
    /// no draws (a cancelled chain) are skipped.
    pub fn summary(&self, level: f64) -> Vec<ParameterSummary> {
        self.names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                ParameterSummary::from_draws(name.as_str(), &self.column(i), level, MODE_BINS)
            })
            .collect()
    }
}
