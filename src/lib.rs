#![forbid(unsafe_code)]

//! # curation-harness
//!
//! Annotator reliability from noisy, incomplete multi-annotator labels.
//!
//! Three generative models explain how annotators report categorical labels
//! given an unobserved true class: Model A (scalar accuracies with
//! structured errors on a triplet design), Model B (a full confusion matrix
//! per annotator) and Model Bt (scalar accuracies with class weights). Each
//! is fitted by maximum likelihood or MAP from several random restarts, and
//! an adaptive Metropolis–Hastings sampler turns the winning point estimate
//! into credible intervals for the accuracy parameters.
//!
//! Data flow: [`AnnotationMatrix`] → [`RunOrchestrator::run`] →
//! [`BatchOutcome::sample_best`] → [`PosteriorSamples::summary`].

pub mod annotations;
pub mod error;
pub mod models;
pub mod numeric;
pub mod optimize;
pub mod orchestrator;
pub mod sampler;
pub mod store;

pub use annotations::{load_annotations, AnnotationMatrix, CodeMap, PatternCounts, MISSING};
pub use error::ModelError;
pub use models::{
    AnnotationModel, AnyModel, EmConfig, FitOptions, FitReport, InitOptions, ModelA, ModelB,
    ModelBPriors, ModelBt, ModelKind, ModelParameters, StopReason,
};
pub use optimize::NelderMeadConfig;
pub use orchestrator::{
    BatchOutcome, BestSource, FitConfig, Reconciliation, RunOrchestrator, RunRecord,
};
pub use sampler::{
    AdaptationPhase, IntervalKind, ParameterSummary, PosteriorSamples, PosteriorTarget,
    SamplerConfig, StepSizeController,
};
pub use store::{
    BestRunKey, BestRunStore, MemoryBestRunStore, SqliteBestRunStore, StoreError, StoredBest,
};
