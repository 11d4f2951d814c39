//! Derivative-free minimization over an unconstrained parameter vector.
//!
//! Models A and Bt map their probability parameters through logit/softmax
//! transforms and minimize the negative log-likelihood here. The objective is
//! non-convex, so callers restart from several random points.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Why an iterative loop (EM, simplex search, sampler) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Tolerance reached.
    Converged,
    /// Iteration budget exhausted before the tolerance; the iterate is still usable.
    MaxIterations,
    /// The cancel flag was raised between iterations.
    Cancelled,
    /// The objective was not finite at the starting point.
    NonFinite,
    /// A fixed-length loop (the sampler) ran all of its iterations.
    Completed,
}

impl StopReason {
    pub fn is_converged(self) -> bool {
        matches!(self, StopReason::Converged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NelderMeadConfig {
    pub max_iterations: usize,
    /// Convergence when every vertex lies within this distance of the best one.
    pub xatol: f64,
    /// ...and every vertex value lies within this distance of the best value.
    pub fatol: f64,
    /// Edge length of the initial simplex, in unconstrained coordinates.
    pub initial_step: f64,
}

impl Default for NelderMeadConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5_000,
            xatol: 1e-5,
            fatol: 1e-6,
            initial_step: 0.5,
        }
    }
}

impl NelderMeadConfig {
    pub fn validate(&self) -> Result<(), crate::ModelError> {
        if self.max_iterations == 0 {
            return Err(crate::ModelError::InvalidConfig(
                "optimizer max_iterations must be > 0".into(),
            ));
        }
        if !(self.xatol > 0.0 && self.fatol > 0.0 && self.initial_step > 0.0) {
            return Err(crate::ModelError::InvalidConfig(
                "optimizer tolerances and initial_step must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Minimum {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub stop_reason: StopReason,
}

// Standard coefficients: reflection, expansion, contraction, shrink.
const ALPHA: f64 = 1.0;
const GAMMA: f64 = 2.0;
const RHO: f64 = 0.5;
const SIGMA: f64 = 0.5;

struct Counted<F> {
    f: F,
    evaluations: usize,
}

impl<F: FnMut(&[f64]) -> f64> Counted<F> {
    fn eval(&mut self, x: &DVector<f64>) -> f64 {
        self.evaluations += 1;
        let v = (self.f)(x.as_slice());
        // NaN would poison the vertex ordering.
        if v.is_nan() {
            f64::INFINITY
        } else {
            v
        }
    }
}

/// Minimize `f` from `x0` with the Nelder–Mead simplex method.
pub fn minimize<F>(
    f: F,
    x0: &[f64],
    cfg: &NelderMeadConfig,
    cancel_flag: Option<&AtomicBool>,
) -> Minimum
where
    F: FnMut(&[f64]) -> f64,
{
    let n = x0.len();
    let mut obj = Counted { f, evaluations: 0 };
    let start = DVector::from_column_slice(x0);
    let f0 = obj.eval(&start);

    if n == 0 || !f0.is_finite() {
        return Minimum {
            x: x0.to_vec(),
            value: f0,
            iterations: 0,
            evaluations: obj.evaluations,
            stop_reason: if f0.is_finite() {
                StopReason::Converged
            } else {
                StopReason::NonFinite
            },
        };
    }

    let mut simplex: Vec<(DVector<f64>, f64)> = Vec::with_capacity(n + 1);
    simplex.push((start.clone(), f0));
    for i in 0..n {
        let mut v = start.clone();
        v[i] += cfg.initial_step;
        let fv = obj.eval(&v);
        simplex.push((v, fv));
    }

    let mut iterations = 0;
    let stop_reason = loop {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

        let (best_x, best_f) = (&simplex[0].0, simplex[0].1);
        let x_spread = simplex[1..]
            .iter()
            .map(|(x, _)| (x - best_x).amax())
            .fold(0.0, f64::max);
        let f_spread = simplex[1..]
            .iter()
            .map(|(_, fx)| (fx - best_f).abs())
            .fold(0.0, f64::max);
        if x_spread <= cfg.xatol && f_spread <= cfg.fatol {
            break StopReason::Converged;
        }
        if iterations >= cfg.max_iterations {
            break StopReason::MaxIterations;
        }
        if let Some(flag) = cancel_flag {
            if flag.load(AtomicOrdering::Relaxed) {
                break StopReason::Cancelled;
            }
        }
        iterations += 1;

        let mut centroid = DVector::<f64>::zeros(n);
        for (x, _) in &simplex[..n] {
            centroid += x;
        }
        centroid /= n as f64;

        let worst_f = simplex[n].1;
        let second_worst_f = simplex[n - 1].1;

        let reflected = &centroid + (&centroid - &simplex[n].0) * ALPHA;
        let fr = obj.eval(&reflected);

        if fr < best_f {
            let expanded = &centroid + (&reflected - &centroid) * GAMMA;
            let fe = obj.eval(&expanded);
            simplex[n] = if fe < fr {
                (expanded, fe)
            } else {
                (reflected, fr)
            };
            continue;
        }
        if fr < second_worst_f {
            simplex[n] = (reflected, fr);
            continue;
        }

        let contracted = if fr < worst_f {
            // Outside contraction.
            let xc = &centroid + (&reflected - &centroid) * RHO;
            let fc = obj.eval(&xc);
            (fc <= fr).then_some((xc, fc))
        } else {
            // Inside contraction.
            let xc = &centroid + (&simplex[n].0 - &centroid) * RHO;
            let fc = obj.eval(&xc);
            (fc < worst_f).then_some((xc, fc))
        };

        match contracted {
            Some(vertex) => simplex[n] = vertex,
            None => {
                let anchor = simplex[0].0.clone();
                for vertex in simplex.iter_mut().skip(1) {
                    let shrunk = &anchor + (&vertex.0 - &anchor) * SIGMA;
                    let fs = obj.eval(&shrunk);
                    *vertex = (shrunk, fs);
                }
            }
        }
    };

    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    let (x, value) = simplex.swap_remove(0);
    Minimum {
        x: x.as_slice().to_vec(),
        value,
        iterations,
        evaluations: obj.evaluations,
        stop_reason,
    }
}

/// [`minimize`], restarted from its own result until a restart no longer
/// improves the value (at most `max_restarts` extra passes).
///
/// A collapsed simplex can report convergence away from a minimum; a fresh
/// simplex around the reported point either confirms it or moves on.
pub fn minimize_restarted<F>(
    mut f: F,
    x0: &[f64],
    cfg: &NelderMeadConfig,
    max_restarts: usize,
    cancel_flag: Option<&AtomicBool>,
) -> Minimum
where
    F: FnMut(&[f64]) -> f64,
{
    let mut best = minimize(&mut f, x0, cfg, cancel_flag);
    for _ in 0..max_restarts {
        if !best.stop_reason.is_converged() {
            break;
        }
        let next = minimize(&mut f, &best.x, cfg, cancel_flag);
        let improved = best.value - next.value > cfg.fatol;
        let (iterations, evaluations) = (
            best.iterations + next.iterations,
            best.evaluations + next.evaluations,
        );
        if next.value <= best.value {
            best = next;
        }
        best.iterations = iterations;
        best.evaluations = evaluations;
        if !improved {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_quadratic_minimum() {
        let target = [1.0, -2.0, 0.5, 3.0];
        let f = |x: &[f64]| {
            x.iter()
                .zip(target.iter())
                .enumerate()
                .map(|(i, (a, b))| (i as f64 + 1.0) * (a - b).powi(2))
                .sum::<f64>()
        };
        let min = minimize(f, &[0.0; 4], &NelderMeadConfig::default(), None);
        assert_eq!(min.stop_reason, StopReason::Converged);
        for (a, b) in min.x.iter().zip(target.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn finds_rosenbrock_valley_floor() {
        let f = |x: &[f64]| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2);
        let cfg = NelderMeadConfig {
            xatol: 1e-8,
            fatol: 1e-10,
            ..Default::default()
        };
        let min = minimize(f, &[-1.2, 1.0], &cfg, None);
        assert!((min.x[0] - 1.0).abs() < 1e-3);
        assert!((min.x[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn non_finite_start_is_reported() {
        let min = minimize(|_| f64::INFINITY, &[0.0, 0.0], &NelderMeadConfig::default(), None);
        assert_eq!(min.stop_reason, StopReason::NonFinite);
        assert_eq!(min.iterations, 0);
    }

    #[test]
    fn cancel_flag_stops_before_first_iteration() {
        let flag = AtomicBool::new(true);
        let min = minimize(
            |x: &[f64]| x[0] * x[0] + 1.0,
            &[3.0],
            &NelderMeadConfig::default(),
            Some(&flag),
        );
        assert_eq!(min.stop_reason, StopReason::Cancelled);
        assert_eq!(min.x, vec![3.0]);
    }

    #[test]
    fn restarts_never_worsen_the_value() {
        let f = |x: &[f64]| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2);
        let cfg = NelderMeadConfig::default();
        let single = minimize(f, &[-1.2, 1.0], &cfg, None);
        let restarted = minimize_restarted(f, &[-1.2, 1.0], &cfg, 3, None);
        assert!(restarted.value <= single.value);
        assert!(restarted.iterations >= single.iterations);
    }

    #[test]
    fn max_iterations_is_not_fatal() {
        let cfg = NelderMeadConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let min = minimize(|x: &[f64]| (x[0] - 10.0).powi(2), &[0.0], &cfg, None);
        assert_eq!(min.stop_reason, StopReason::MaxIterations);
        assert!(min.value < 100.0);
    }
}
