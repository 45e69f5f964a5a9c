use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use derelict_ensemble::{
    CancellationToken, EngineConfig, Metric, NoEvidence, RiskEngine, SatelliteEvidenceSource, StreetEvidenceSource,
    ZoneConfig,
};
use derelict_io::{
    ConfirmedReader, EvidenceReader, ExperimentName, LocationReader, ResultWriter, SampleReader, TableFeatures,
    TrainingArtifact, forest_path, read_training,
};
use derelict_rf::Forest;
use derelict_spatial::{SpatialIndex, ZoneLayout};

#[derive(Parser)]
#[command(name = "derelict")]
#[command(about = "Ensemble abandonment-risk scoring with spatially blocked validation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// RNG seed for reproducibility
    #[arg(long, default_value_t = 42, global = true)]
    seed: u64,

    /// Enable verbose (debug-level) logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Number of threads for parallel computation (defaults to all cores)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// JSON engine configuration; missing fields take their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MetricArg {
    F1,
    Auc,
}

/// How validation zones are drawn. Exactly one must be given.
#[derive(Args, Debug, Clone)]
struct ZoneArgs {
    /// Square grid cells of this edge length, in meters
    #[arg(long, conflicts_with = "kmeans_zones")]
    zone_cell_m: Option<f64>,

    /// Number of k-means blocks over the sample coordinates
    #[arg(long)]
    kmeans_zones: Option<usize>,
}

impl ZoneArgs {
    fn zone_config(&self) -> Result<ZoneConfig> {
        match (self.zone_cell_m, self.kmeans_zones) {
            (Some(cell_m), None) => Ok(ZoneConfig::Grid { cell_m }),
            (None, Some(k)) => Ok(ZoneConfig::KMeans { k }),
            _ => bail!("pass exactly one of --zone-cell-m or --kmeans-zones"),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Validate, search ensemble weights and fit the forest on labeled samples
    Train {
        /// CSV with id, lat, lon, abandoned and feature columns
        #[arg(long)]
        samples: PathBuf,

        /// Experiment name for output files (must match [a-zA-Z0-9_-]+)
        #[arg(long)]
        experiment: String,

        /// Output directory for result files
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        #[command(flatten)]
        zones: ZoneArgs,

        /// Training samples closer than this to a held-out zone are dropped, in meters
        #[arg(long)]
        buffer_m: f64,

        /// Number of spatial folds
        #[arg(long)]
        n_folds: Option<usize>,

        /// Validation metric
        #[arg(long, value_enum)]
        metric: Option<MetricArg>,

        /// Decision threshold for F1
        #[arg(long, default_value_t = 0.5)]
        threshold: f64,

        /// Number of trees in the forest
        #[arg(long)]
        n_trees: Option<usize>,
    },

    /// Score locations with a trained experiment
    Score {
        /// CSV with id, lat, lon and the training feature columns
        #[arg(long)]
        locations: PathBuf,

        /// CSV of confirmed-abandoned points (lat, lon, optional confirmed_at)
        #[arg(long)]
        confirmed: PathBuf,

        /// Directory holding the experiment's forest and training artifact
        #[arg(long)]
        model_dir: PathBuf,

        /// Experiment to load and to name the score file after
        #[arg(long)]
        experiment: String,

        /// CSV of imagery results; without it escalated locations stay at their base score
        #[arg(long)]
        evidence: Option<PathBuf>,

        /// Include per-location explanations in the score file
        #[arg(long, default_value_t = false)]
        explain: bool,

        /// Output directory for the score file (defaults to --model-dir)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

/// Stdout summary for the train command.
#[derive(Serialize)]
struct TrainOutput {
    experiment: String,
    run_id: String,
    n_samples: usize,
    weights: [f64; 3],
    metric: String,
    mean_metric: Option<f64>,
    uniform_metric: Option<f64>,
    fallback_reason: Option<String>,
    n_folds: usize,
}

/// Stdout summary for the score command.
#[derive(Serialize)]
struct ScoreOutput {
    experiment: String,
    run_id: String,
    n_locations: usize,
    n_escalated: usize,
    mean_final_confidence: f64,
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
    let config: EngineConfig =
        serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?;
    config.validate().context("config rejected")?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match (cli.verbose, cli.quiet) {
        (true, _) => "debug",
        (_, true) => "error",
        _ => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to configure thread pool")?;
        info!(threads, "thread pool configured");
    }

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Train {
            samples,
            experiment,
            output_dir,
            zones,
            buffer_m,
            n_folds,
            metric,
            threshold,
            n_trees,
        } => {
            let experiment_name = ExperimentName::new(experiment.clone())?;
            let zone_config = zones.zone_config()?;

            // 1. Apply command-line overrides
            config.scorers.forest = config.scorers.forest.clone().with_seed(cli.seed);
            if let Some(n_trees) = n_trees {
                config.scorers.forest = config.scorers.forest.clone().with_n_trees(n_trees);
            }
            config.validator = config.validator.clone().with_seed(cli.seed);
            if let Some(n_folds) = n_folds {
                config.validator = config.validator.clone().with_n_folds(n_folds);
            }
            if let Some(metric) = metric {
                let metric = match metric {
                    MetricArg::F1 => Metric::F1 { threshold },
                    MetricArg::Auc => Metric::Auc,
                };
                config.validator = config.validator.clone().with_metric(metric);
            }

            // 2. Read samples
            let samples = SampleReader::new(&samples)
                .read()
                .context("failed to read samples CSV")?;

            // 3. Train; features and evidence are not consulted until scoring
            let engine = RiskEngine::new(
                config,
                Arc::new(SpatialIndex::new()),
                Arc::new(TableFeatures::new()),
                Arc::new(NoEvidence),
                Arc::new(NoEvidence),
            )
            .context("invalid engine configuration")?;
            let outcome = engine
                .train(&samples, &zone_config, buffer_m, &CancellationToken::new())
                .context("training failed")?;
            if let Some(reason) = &outcome.convergence {
                warn!(%reason, "weight search fell back to uniform weights");
            }

            // 4. Persist the forest and the training artifact
            let writer = ResultWriter::new(&output_dir, experiment_name)?;
            outcome
                .forest
                .save(writer.forest_path())
                .context("failed to save forest")?;
            writer.write_training(&TrainingArtifact {
                experiment: experiment.clone(),
                weights: outcome.weights.clone(),
                report: outcome.report.clone(),
                config: engine.config().clone(),
                feature_importances: outcome.forest.ranked_importances(),
            })?;

            // 5. Print summary
            let output = TrainOutput {
                experiment,
                run_id: outcome.weights.run_id().to_string(),
                n_samples: samples.len(),
                weights: outcome.weights.as_array(),
                metric: outcome.report.metric.to_string(),
                mean_metric: outcome.report.mean_metric,
                uniform_metric: outcome.report.uniform_metric,
                fallback_reason: outcome.report.fallback_reason.clone(),
                n_folds: outcome.report.folds.len(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Command::Score {
            locations,
            confirmed,
            model_dir,
            experiment,
            evidence,
            explain,
            output_dir,
        } => {
            let experiment_name = ExperimentName::new(experiment.clone())?;

            // 1. Load the trained run
            let artifact = read_training(&model_dir, &experiment_name).context("failed to read training artifact")?;
            let forest = Forest::load(forest_path(&model_dir, &experiment_name)).context("failed to load forest")?;
            info!(
                n_trees = forest.n_trees(),
                n_features = forest.n_features(),
                run_id = %artifact.weights.run_id(),
                "model loaded"
            );
            let layout = if artifact.report.zones.is_empty() {
                None
            } else {
                Some(Arc::new(
                    ZoneLayout::from_zones(artifact.report.zones.clone()).context("invalid zones in artifact")?,
                ))
            };

            // 2. Read inputs
            let table = LocationReader::new(&locations)
                .read()
                .context("failed to read locations CSV")?;
            let confirmed = ConfirmedReader::new(&confirmed)
                .read()
                .context("failed to read confirmed CSV")?;
            let (satellite, street) = match evidence {
                Some(path) => {
                    let table = Arc::new(
                        EvidenceReader::new(&path)
                            .read()
                            .context("failed to read evidence CSV")?,
                    );
                    (
                        table.clone() as Arc<dyn SatelliteEvidenceSource>,
                        table as Arc<dyn StreetEvidenceSource>,
                    )
                }
                None => (
                    Arc::new(NoEvidence) as Arc<dyn SatelliteEvidenceSource>,
                    Arc::new(NoEvidence) as Arc<dyn StreetEvidenceSource>,
                ),
            };

            // 3. Assemble the engine; the command-line config wins over the stored one
            let engine_config = if cli.config.is_some() {
                config
            } else {
                artifact.config.clone()
            };
            let engine = RiskEngine::new(
                engine_config,
                Arc::new(SpatialIndex::new()),
                Arc::new(table.features),
                satellite,
                street,
            )
            .context("invalid engine configuration")?;
            engine.install(Arc::new(forest), artifact.weights.clone(), layout)?;
            engine.publish_confirmed(confirmed)?;

            // 4. Score
            let scores = engine.score(&table.requests).context("scoring failed")?;
            let explanations = if explain {
                Some(
                    scores
                        .iter()
                        .map(|s| engine.explain(&s.explanation_ref))
                        .collect::<Result<Vec<_>, _>>()?,
                )
            } else {
                None
            };
            let writer = ResultWriter::new(output_dir.as_deref().unwrap_or(&model_dir), experiment_name)?;
            writer.write_scores(&scores, explanations.as_deref())?;

            // 5. Print summary
            let n_escalated = scores.iter().filter(|s| s.stage_scores.len() > 1).count();
            let mean_final_confidence = if scores.is_empty() {
                0.0
            } else {
                scores.iter().map(|s| s.final_confidence).sum::<f64>() / scores.len() as f64
            };
            let output = ScoreOutput {
                experiment,
                run_id: artifact.weights.run_id().to_string(),
                n_locations: scores.len(),
                n_escalated,
                mean_final_confidence,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
