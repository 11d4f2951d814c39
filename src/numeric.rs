//! Pure numeric helpers shared by all model variants.
//!
//! Nothing here knows about annotators or items: simplex normalization,
//! logit transforms, log-sum-exp, and the handful of random draws the models
//! need (Dirichlet, Beta, categorical).

use rand::Rng;
use rand_distr::{Beta, Distribution, Gamma};
use statrs::function::beta::ln_beta;

/// Tolerance used when checking that a row is a probability distribution.
pub const SIMPLEX_TOL: f64 = 1e-7;

/// Smallest probability kept inside the open interval (0, 1).
pub const PROB_FLOOR: f64 = 1e-10;

/// Clamp negative entries to zero and rescale to sum to 1.
///
/// A row whose mass is zero (or not finite) becomes uniform. Returns `false`
/// when that fallback was taken.
pub fn normalize(row: &mut [f64]) -> bool {
    if row.is_empty() {
        return true;
    }
    for v in row.iter_mut() {
        if !v.is_finite() || *v < 0.0 {
            *v = 0.0;
        }
    }
    let total: f64 = row.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        let u = 1.0 / row.len() as f64;
        row.iter_mut().for_each(|v| *v = u);
        return false;
    }
    row.iter_mut().for_each(|v| *v /= total);
    true
}

/// Whether `row` is a distribution: non-negative entries summing to 1.
pub fn is_distribution(row: &[f64], tol: f64) -> bool {
    if row.is_empty() {
        return false;
    }
    let sum: f64 = row.iter().sum();
    row.iter().all(|v| v.is_finite() && *v >= 0.0) && (sum - 1.0).abs() <= tol
}

pub fn logit(p: f64) -> f64 {
    let p = p.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
    (p / (1.0 - p)).ln()
}

/// Inverse logit; stable for large |x|.
pub fn expit(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Softmax of `[z..., 0]`: maps K-1 unconstrained values to a K-simplex.
pub fn softmax_with_pivot(z: &[f64]) -> Vec<f64> {
    let max = z.iter().copied().fold(0.0_f64, f64::max);
    let mut out: Vec<f64> = z.iter().map(|v| (v - max).exp()).collect();
    out.push((-max).exp());
    let total: f64 = out.iter().sum();
    out.iter_mut().for_each(|v| *v /= total);
    out
}

/// Inverse of [`softmax_with_pivot`] for a strictly positive simplex point.
pub fn pivot_logits(p: &[f64]) -> Vec<f64> {
    let k = p.len();
    if k == 0 {
        return Vec::new();
    }
    let last = p[k - 1].max(PROB_FLOOR);
    p[..k - 1]
        .iter()
        .map(|v| (v.max(PROB_FLOOR) / last).ln())
        .collect()
}

pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let s: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + s.ln()
}

/// Natural log that maps 0 to `-inf` instead of producing NaN for negatives.
pub fn safe_ln(x: f64) -> f64 {
    if x > 0.0 {
        x.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Log density of Beta(a, b) at `x`; `-inf` outside (0, 1).
pub fn beta_ln_pdf(x: f64, a: f64, b: f64) -> f64 {
    if !(x > 0.0 && x < 1.0) {
        return f64::NEG_INFINITY;
    }
    (a - 1.0) * x.ln() + (b - 1.0) * (1.0 - x).ln() - ln_beta(a, b)
}

/// Draw from Dirichlet(alpha) through normalized Gamma variates.
pub fn sample_dirichlet<R: Rng + ?Sized>(rng: &mut R, alpha: &[f64]) -> Vec<f64> {
    let mut draws: Vec<f64> = alpha
        .iter()
        .map(|&a| match Gamma::new(a.max(PROB_FLOOR), 1.0) {
            Ok(g) => g.sample(rng),
            Err(_) => 0.0,
        })
        .collect();
    normalize(&mut draws);
    draws
}

/// Draw from Beta(a, b), falling back to the mean on invalid shape parameters.
pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, a: f64, b: f64) -> f64 {
    match Beta::new(a, b) {
        Ok(dist) => dist.sample(rng),
        Err(_) => a / (a + b),
    }
}

/// Draw an index with probability proportional to `probs`.
pub fn sample_categorical<R: Rng + ?Sized>(rng: &mut R, probs: &[f64]) -> usize {
    let total: f64 = probs.iter().filter(|p| **p > 0.0).sum();
    if probs.is_empty() {
        return 0;
    }
    if total <= 0.0 {
        return rng.gen_range(0..probs.len());
    }
    let u = rng.gen::<f64>() * total;
    let mut acc = 0.0;
    let mut last_positive = 0;
    for (k, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        acc += p;
        last_positive = k;
        if u < acc {
            return k;
        }
    }
    last_positive
}
