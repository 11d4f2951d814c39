#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use curation_harness::sampler::{AdaptationSummary, ParameterSummary};
use curation_harness::{
    load_annotations, AnnotationModel, AnyModel, BestSource, FitConfig, ModelA, ModelB, ModelBt,
    ModelKind, ModelParameters, Reconciliation, RunOrchestrator, RunRecord, SamplerConfig,
    SqliteBestRunStore, MISSING,
};

#[derive(Parser)]
#[command(name = "curation", version, about = "Annotator reliability models and posterior sampling")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliModel {
    A,
    B,
    Bt,
}

impl From<CliModel> for ModelKind {
    fn from(value: CliModel) -> Self {
        match value {
            CliModel::A => ModelKind::A,
            CliModel::B => ModelKind::B,
            CliModel::Bt => ModelKind::Bt,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model to an annotation file and write a JSON report
    Fit {
        /// Whitespace- or comma-separated integer rows, one item per line
        #[arg(long)]
        input: PathBuf,
        #[arg(long, value_enum)]
        model: Option<CliModel>,
        /// Number of random restarts
        #[arg(long)]
        runs: Option<usize>,
        /// Maximum likelihood instead of MAP
        #[arg(long)]
        no_priors: bool,
        /// Model A: estimate agreement weights instead of deriving them
        #[arg(long)]
        explicit_alphas: bool,
        /// Model Bt: start class weights at observed class frequencies
        #[arg(long)]
        use_omegas: bool,
        /// Posterior draws of the accuracy parameters (0 disables sampling)
        #[arg(long)]
        samples: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// SQLite file holding the best run seen so far per model and dataset
        #[arg(long)]
        store: Option<PathBuf>,
        /// Raw value marking a missing annotation
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        missing: i64,
        /// TOML file with [fit] and [sampler] tables
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write every posterior draw (JSON) to this file
        #[arg(long)]
        samples_out: Option<PathBuf>,
        /// Credible interval level for posterior summaries
        #[arg(long, default_value_t = 0.95)]
        level: f64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Write synthetic annotations drawn from a random model
    Simulate {
        #[arg(long, value_enum, default_value = "b")]
        model: CliModel,
        #[arg(long)]
        classes: usize,
        #[arg(long)]
        annotators: usize,
        #[arg(long)]
        items: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        out: PathBuf,
        /// Also write the true labels, one per line
        #[arg(long)]
        labels_out: Option<PathBuf>,
    },
    /// Export the best-run store to JSONL
    StoreExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    fit: FitConfig,
    sampler: Option<SamplerConfig>,
}

fn load_config(path: Option<&Path>) -> Result<FileConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&raw)?)
        }
        None => Ok(FileConfig::default()),
    }
}

#[derive(Serialize)]
struct PosteriorReport {
    level: f64,
    draws: usize,
    step_size: f64,
    acceptance_rate: f64,
    adaptation: AdaptationSummary,
    parameters: Vec<ParameterSummary>,
}

#[derive(Serialize)]
struct FitOutput<'a> {
    model: ModelKind,
    nitems: usize,
    nannotators: usize,
    nclasses: usize,
    /// Raw code of each dense class index.
    codes: &'a [i64],
    #[serde(skip_serializing_if = "Option::is_none")]
    best_index: Option<usize>,
    best_log_likelihood: f64,
    best_source: BestSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    reconciliation: Option<Reconciliation>,
    parameters: ModelParameters,
    runs: &'a [RunRecord],
    #[serde(skip_serializing_if = "Option::is_none")]
    posterior: Option<PosteriorReport>,
    label_posteriors: Vec<Vec<f64>>,
}

fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Fit {
            input,
            model,
            runs,
            no_priors,
            explicit_alphas,
            use_omegas,
            samples,
            seed,
            store,
            missing,
            config,
            samples_out,
            level,
            out,
        } => {
            let file_config = load_config(config.as_deref())?;
            let mut fit = file_config.fit;
            if let Some(model) = model {
                fit.model = model.into();
            }
            if let Some(runs) = runs {
                fit.number_of_runs = runs;
            }
            if let Some(seed) = seed {
                fit.seed = seed;
            }
            if no_priors {
                fit.use_priors = false;
            }
            fit.estimate_alphas_explicitly |= explicit_alphas;
            fit.use_omegas_for_init |= use_omegas;

            let sampler = match (samples, file_config.sampler) {
                (Some(0), _) => None,
                (Some(n), cfg) => Some(SamplerConfig {
                    n_iterations: n,
                    ..cfg.unwrap_or_default()
                }),
                (None, cfg) => cfg,
            };
            if !(level > 0.0 && level < 1.0) {
                return Err("--level must be in (0, 1)".into());
            }
            if samples_out.is_some() && sampler.is_none() {
                return Err("--samples-out needs posterior sampling (--samples or [sampler])".into());
            }

            let reader = BufReader::new(File::open(&input)?);
            let (annotations, codes) = load_annotations(reader, missing)?;
            info!(
                items = annotations.nitems(),
                annotators = annotations.nannotators(),
                classes = annotations.nclasses(),
                "loaded annotations"
            );

            let orchestrator = RunOrchestrator::new(fit)?;
            let mut outcome = orchestrator.run(&annotations, None)?;

            let reconciliation = match store {
                Some(path) => {
                    let store = SqliteBestRunStore::new(path)?;
                    let _lock = store.lock_exclusive()?;
                    Some(orchestrator.reconcile_with_store(&mut outcome, &annotations, &store))
                }
                None => None,
            };

            let posterior = match sampler {
                Some(cfg) => {
                    let seed = orchestrator
                        .config()
                        .seed
                        .wrapping_add(orchestrator.config().number_of_runs as u64);
                    let mut rng = StdRng::seed_from_u64(seed);
                    let samples = outcome.sample_best(&annotations, &cfg, &mut rng, None)?;
                    if let Some(path) = &samples_out {
                        write_json(path, &samples)?;
                        info!(draws = samples.len(), path = %path.display(), "wrote posterior draws");
                    }
                    Some(PosteriorReport {
                        level,
                        draws: samples.len(),
                        step_size: samples.step_size,
                        acceptance_rate: samples.acceptance_rate,
                        adaptation: samples.adaptation.clone(),
                        parameters: samples.summary(level),
                    })
                }
                None => None,
            };

            let report = FitOutput {
                model: outcome.best_model.kind(),
                nitems: annotations.nitems(),
                nannotators: annotations.nannotators(),
                nclasses: annotations.nclasses(),
                codes: codes.values(),
                best_index: outcome.best_index,
                best_log_likelihood: outcome.best_log_likelihood,
                best_source: outcome.best_source,
                reconciliation,
                parameters: outcome.best_model.parameters(),
                runs: &outcome.runs,
                posterior,
                label_posteriors: outcome.best_model.infer_labels(&annotations)?,
            };
            write_json(&out, &report)?;
        }
        Commands::Simulate {
            model,
            classes,
            annotators,
            items,
            seed,
            out,
            labels_out,
        } => {
            let mut rng = StdRng::seed_from_u64(seed);
            let model = match model {
                CliModel::A => AnyModel::A(ModelA::create_initial_state(
                    classes, annotators, false, &mut rng,
                )?),
                CliModel::B => AnyModel::B(ModelB::create_initial_state(
                    classes, annotators, None, &mut rng,
                )?),
                CliModel::Bt => {
                    AnyModel::Bt(ModelBt::create_initial_state(classes, annotators, &mut rng)?)
                }
            };
            let labels = model.generate_labels(items, &mut rng);
            let annotations = model.generate_annotations(&labels, &mut rng)?;

            let mut file = BufWriter::new(File::create(out)?);
            for row in annotations.rows() {
                let line: Vec<String> = row
                    .iter()
                    .map(|&v| if v == MISSING { "-1".to_string() } else { v.to_string() })
                    .collect();
                writeln!(file, "{}", line.join(" "))?;
            }
            file.flush()?;

            if let Some(path) = labels_out {
                let mut file = BufWriter::new(File::create(path)?);
                for label in &labels {
                    writeln!(file, "{label}")?;
                }
                file.flush()?;
            }
            info!(items, annotators, classes, model = %model.kind(), "wrote synthetic annotations");
        }
        Commands::StoreExport { db, out } => {
            let path = db.unwrap_or_else(SqliteBestRunStore::default_path);
            let store = SqliteBestRunStore::new(path)?;
            let written = store.export_jsonl(out)?;
            info!(rows = written, "exported best-run store");
        }
    }

    Ok(())
}
