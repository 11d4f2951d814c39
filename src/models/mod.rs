//! Annotation model family.
//!
//! Three closed variants share one capability set ([`AnnotationModel`]):
//!
//! - [`ModelA`]: scalar accuracy per annotator, errors structured through
//!   class base rates (omega) and agreement weights (alpha). Triplet design.
//! - [`ModelB`]: full confusion matrix per annotator, fitted with EM.
//! - [`ModelBt`]: scalar accuracy per annotator plus class weights (gamma).
//!
//! [`AnyModel`] is the tagged union the orchestrator works with.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::annotations::AnnotationMatrix;
use crate::error::ModelError;
use crate::numeric::{is_distribution, SIMPLEX_TOL};
use crate::optimize::NelderMeadConfig;
use crate::sampler::{PosteriorSamples, SamplerConfig};

pub mod model_a;
pub mod model_b;
pub mod model_bt;

pub use crate::optimize::StopReason;
pub use model_a::ModelA;
pub use model_b::{ModelB, ModelBPriors};
pub use model_bt::ModelBt;

// ---------------------------------------------------------------------
//  Kinds and configuration
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    A,
    B,
    Bt,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::A => "a",
            ModelKind::B => "b",
            ModelKind::Bt => "bt",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(ModelKind::A),
            "b" => Ok(ModelKind::B),
            "bt" => Ok(ModelKind::Bt),
            other => Err(ModelError::InvalidConfig(format!(
                "unknown model '{other}' (expected a, b or bt)"
            ))),
        }
    }
}

/// Expectation–maximization settings (Model B).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    /// Stop once the objective changes by less than this between epochs.
    pub epsilon: f64,
    pub max_epochs: usize,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            max_epochs: 1_000,
        }
    }
}

impl EmConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if !(self.epsilon > 0.0) || self.max_epochs == 0 {
            return Err(ModelError::InvalidConfig(
                "EM epsilon and max_epochs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Per-call fitting settings. EM applies to Model B, the simplex search to A and Bt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub em: EmConfig,
    pub optimizer: NelderMeadConfig,
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), ModelError> {
        self.em.validate()?;
        self.optimizer.validate()
    }
}

/// Outcome of one `mle`/`map` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    /// Log-likelihood of the data at the returned parameters.
    pub log_likelihood: f64,
    /// Value that was maximized: log-likelihood, plus log prior for MAP.
    pub objective: f64,
    /// EM epochs or simplex iterations.
    pub iterations: usize,
    pub stop_reason: StopReason,
    /// Objective after each EM epoch (starting with the initial state).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<f64>,
}

impl FitReport {
    pub fn converged(&self) -> bool {
        self.stop_reason.is_converged()
    }

    pub(crate) fn log_outcome(&self, kind: ModelKind) {
        match self.stop_reason {
            StopReason::MaxIterations => warn!(
                model = %kind,
                iterations = self.iterations,
                log_likelihood = self.log_likelihood,
                "fit stopped at iteration budget before converging"
            ),
            StopReason::Cancelled => info!(model = %kind, iterations = self.iterations, "fit cancelled"),
            _ => {}
        }
    }
}

/// Serializable parameter snapshot of any variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ModelParameters {
    A {
        theta: Vec<f64>,
        omega: Vec<f64>,
        alpha: Vec<f64>,
        explicit_alphas: bool,
    },
    B {
        pi: Vec<f64>,
        theta: Vec<Vec<Vec<f64>>>,
    },
    Bt {
        gamma: Vec<f64>,
        theta: Vec<f64>,
    },
}

impl ModelParameters {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelParameters::A { .. } => ModelKind::A,
            ModelParameters::B { .. } => ModelKind::B,
            ModelParameters::Bt { .. } => ModelKind::Bt,
        }
    }
}

// ---------------------------------------------------------------------
//  Capability set
// ---------------------------------------------------------------------

/// Operations every model variant supports.
///
/// Construction (`create_initial_state`) is an associated function on each
/// variant because its dimensions differ; everything after that goes
/// through this trait.
pub trait AnnotationModel {
    fn kind(&self) -> ModelKind;

    fn nclasses(&self) -> usize;

    fn nannotators(&self) -> usize;

    /// Marginal log-likelihood of `annotations`, summing out the true label
    /// of each item. Missing cells contribute nothing.
    fn log_likelihood(&self, annotations: &AnnotationMatrix) -> Result<f64, ModelError>;

    /// Log prior density of the current parameters (up to a constant).
    fn log_prior(&self) -> f64;

    /// Maximum-likelihood fit, in place.
    fn mle(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError>;

    /// Maximum-a-posteriori fit under the variant's default priors, in place.
    fn map(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError>;

    /// Draw `nitems` true labels from the class prior.
    fn generate_labels<R: Rng + ?Sized>(&self, nitems: usize, rng: &mut R) -> Vec<usize>;

    /// Draw synthetic annotations given true labels.
    fn generate_annotations<R: Rng + ?Sized>(
        &self,
        labels: &[usize],
        rng: &mut R,
    ) -> Result<AnnotationMatrix, ModelError>;

    /// Posterior over the true label of each item.
    fn infer_labels(&self, annotations: &AnnotationMatrix) -> Result<Vec<Vec<f64>>, ModelError>;

    /// Metropolis–Hastings draws of the accuracy parameters around the
    /// current estimate. The model itself is not modified.
    fn sample_posterior_over_accuracy<R: Rng + ?Sized>(
        &self,
        annotations: &AnnotationMatrix,
        config: &SamplerConfig,
        rng: &mut R,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<PosteriorSamples, ModelError>;

    fn parameters(&self) -> ModelParameters;

    /// Every parameter row that must be a probability distribution. Scalar
    /// probabilities `p` are reported as `[p, 1 - p]`.
    fn probability_rows(&self) -> Vec<Vec<f64>>;

    fn satisfies_simplex_constraints(&self) -> bool {
        self.probability_rows()
            .iter()
            .all(|row| is_distribution(row, SIMPLEX_TOL))
    }

    /// Number of free scalar parameters; part of the stored-best key.
    fn parameter_count(&self) -> usize;
}

/// Shared shape check: model and data must agree on K and J.
pub(crate) fn check_shape(
    annotations: &AnnotationMatrix,
    nclasses: usize,
    nannotators: usize,
) -> Result<(), ModelError> {
    if annotations.nannotators() != nannotators {
        return Err(ModelError::shape(
            format!("{nannotators} annotators"),
            format!("{} annotators", annotations.nannotators()),
        ));
    }
    if annotations.nclasses() != nclasses {
        return Err(ModelError::shape(
            format!("{nclasses} classes"),
            format!("{} classes", annotations.nclasses()),
        ));
    }
    Ok(())
}

pub(crate) fn check_labels(labels: &[usize], nclasses: usize) -> Result<(), ModelError> {
    if labels.is_empty() {
        return Err(ModelError::InvalidDimension {
            what: "nitems",
            value: 0,
        });
    }
    if let Some(bad) = labels.iter().find(|&&l| l >= nclasses) {
        return Err(ModelError::InvalidAnnotations(format!(
            "label {bad} is outside [0, {}]",
            nclasses - 1
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------
//  Tagged union
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AnyModel {
    A(ModelA),
    B(ModelB),
    Bt(ModelBt),
}

macro_rules! dispatch {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            AnyModel::A($m) => $body,
            AnyModel::B($m) => $body,
            AnyModel::Bt($m) => $body,
        }
    };
}

/// Variant-specific knobs used when drawing a random starting point.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Model A: fit the three agreement weights instead of deriving them.
    pub estimate_alphas_explicitly: bool,
    /// Model Bt: start the class weights at the empirical class frequencies.
    pub use_omegas_for_init: bool,
}

impl AnyModel {
    /// Random starting point for `kind`, sized to `annotations`.
    pub fn create_initial_state<R: Rng + ?Sized>(
        kind: ModelKind,
        annotations: &AnnotationMatrix,
        init: InitOptions,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let k = annotations.nclasses();
        let j = annotations.nannotators();
        Ok(match kind {
            ModelKind::A => AnyModel::A(ModelA::create_initial_state(
                k,
                j,
                init.estimate_alphas_explicitly,
                rng,
            )?),
            ModelKind::B => AnyModel::B(ModelB::create_initial_state(k, j, None, rng)?),
            ModelKind::Bt => {
                let mut model = ModelBt::create_initial_state(k, j, rng)?;
                if init.use_omegas_for_init {
                    model.init_gamma_from_frequencies(&annotations.class_frequencies()?)?;
                }
                AnyModel::Bt(model)
            }
        })
    }

    /// Rebuild a model from a stored snapshot.
    pub fn from_parameters(params: &ModelParameters) -> Result<Self, ModelError> {
        Ok(match params {
            ModelParameters::A {
                theta,
                omega,
                alpha,
                explicit_alphas,
            } => AnyModel::A(ModelA::new(
                theta.clone(),
                omega.clone(),
                alpha.clone(),
                *explicit_alphas,
            )?),
            ModelParameters::B { pi, theta } => AnyModel::B(ModelB::new(pi.clone(), theta.clone())?),
            ModelParameters::Bt { gamma, theta } => {
                AnyModel::Bt(ModelBt::new(gamma.clone(), theta.clone())?)
            }
        })
    }

    /// `map` when `use_priors`, otherwise `mle`.
    pub fn fit(
        &mut self,
        annotations: &AnnotationMatrix,
        use_priors: bool,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        if use_priors {
            self.map(annotations, options, cancel_flag)
        } else {
            self.mle(annotations, options, cancel_flag)
        }
    }
}

impl AnnotationModel for AnyModel {
    fn kind(&self) -> ModelKind {
        dispatch!(self, m => m.kind())
    }

    fn nclasses(&self) -> usize {
        dispatch!(self, m => m.nclasses())
    }

    fn nannotators(&self) -> usize {
        dispatch!(self, m => m.nannotators())
    }

    fn log_likelihood(&self, annotations: &AnnotationMatrix) -> Result<f64, ModelError> {
        dispatch!(self, m => m.log_likelihood(annotations))
    }

    fn log_prior(&self) -> f64 {
        dispatch!(self, m => m.log_prior())
    }

    fn mle(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        dispatch!(self, m => m.mle(annotations, options, cancel_flag))
    }

    fn map(
        &mut self,
        annotations: &AnnotationMatrix,
        options: &FitOptions,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<FitReport, ModelError> {
        dispatch!(self, m => m.map(annotations, options, cancel_flag))
    }

    fn generate_labels<R: Rng + ?Sized>(&self, nitems: usize, rng: &mut R) -> Vec<usize> {
        dispatch!(self, m => m.generate_labels(nitems, rng))
    }

    fn generate_annotations<R: Rng + ?Sized>(
        &self,
        labels: &[usize],
        rng: &mut R,
    ) -> Result<AnnotationMatrix, ModelError> {
        dispatch!(self, m => m.generate_annotations(labels, rng))
    }

    fn infer_labels(&self, annotations: &AnnotationMatrix) -> Result<Vec<Vec<f64>>, ModelError> {
        dispatch!(self, m => m.infer_labels(annotations))
    }

    fn sample_posterior_over_accuracy<R: Rng + ?Sized>(
        &self,
        annotations: &AnnotationMatrix,
        config: &SamplerConfig,
        rng: &mut R,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<PosteriorSamples, ModelError> {
        dispatch!(self, m => m.sample_posterior_over_accuracy(annotations, config, rng, cancel_flag))
    }

    fn parameters(&self) -> ModelParameters {
        dispatch!(self, m => m.parameters())
    }

    fn probability_rows(&self) -> Vec<Vec<f64>> {
        dispatch!(self, m => m.probability_rows())
    }

    fn parameter_count(&self) -> usize {
        dispatch!(self, m => m.parameter_count())
    }
}
