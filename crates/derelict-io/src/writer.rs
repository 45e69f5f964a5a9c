//! JSON artifacts for training runs and score batches.

use std::fs;
use std::path::{Path, PathBuf};

use derelict_ensemble::{EngineConfig, Explanation, ModelWeights, RiskScore, ValidationReport};
use derelict_rf::RankedFeature;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::IoError;
use crate::domain::ExperimentName;

/// Everything `score` needs from a training run besides the forest itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub experiment: String,
    pub weights: ModelWeights,
    pub report: ValidationReport,
    pub config: EngineConfig,
    pub feature_importances: Vec<RankedFeature>,
}

#[derive(Serialize)]
struct ScoresArtifact<'a> {
    experiment: &'a str,
    n_scores: usize,
    scores: &'a [RiskScore],
    #[serde(skip_serializing_if = "Option::is_none")]
    explanations: Option<&'a [Explanation]>,
}

fn training_path(dir: &Path, experiment: &ExperimentName) -> PathBuf {
    dir.join(format!("{}_training.json", experiment.as_str()))
}

/// Where `experiment`'s forest lives inside `dir`.
pub fn forest_path(dir: &Path, experiment: &ExperimentName) -> PathBuf {
    dir.join(format!("{}_forest.bin", experiment.as_str()))
}

/// Writes run artifacts into one directory.
///
/// Creates the output directory on construction if it does not exist.
/// Files are named `{experiment}_forest.bin`, `{experiment}_training.json`
/// and `{experiment}_scores.json`.
pub struct ResultWriter {
    output_dir: PathBuf,
    experiment: ExperimentName,
}

impl ResultWriter {
    /// # Errors
    ///
    /// Returns [`IoError::OutputDirCreate`] if the directory cannot be created.
    #[instrument(skip_all, fields(dir = %output_dir.display(), experiment = %experiment))]
    pub fn new(output_dir: &Path, experiment: ExperimentName) -> Result<Self, IoError> {
        fs::create_dir_all(output_dir).map_err(|e| IoError::OutputDirCreate {
            path: output_dir.to_path_buf(),
            source: e,
        })?;
        debug!("output directory ready");
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            experiment,
        })
    }

    /// Where the trained forest goes.
    pub fn forest_path(&self) -> PathBuf {
        forest_path(&self.output_dir, &self.experiment)
    }

    /// Write `{experiment}_training.json`.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Json`] if encoding fails or [`IoError::WriteFile`]
    /// if the file cannot be written.
    #[instrument(skip_all)]
    pub fn write_training(&self, artifact: &TrainingArtifact) -> Result<PathBuf, IoError> {
        let path = training_path(&self.output_dir, &self.experiment);
        self.write_json(&path, artifact)?;
        info!(path = %path.display(), run_id = %artifact.weights.run_id(), "training artifact written");
        Ok(path)
    }

    /// Write `{experiment}_scores.json`, with explanations when given.
    ///
    /// # Errors
    ///
    /// As [`ResultWriter::write_training`].
    #[instrument(skip_all, fields(n_scores = scores.len()))]
    pub fn write_scores(&self, scores: &[RiskScore], explanations: Option<&[Explanation]>) -> Result<PathBuf, IoError> {
        let path = self.output_dir.join(format!("{}_scores.json", self.experiment.as_str()));
        let artifact = ScoresArtifact {
            experiment: self.experiment.as_str(),
            n_scores: scores.len(),
            scores,
            explanations,
        };
        self.write_json(&path, &artifact)?;
        info!(path = %path.display(), "scores written");
        Ok(path)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), IoError> {
        let json = serde_json::to_string_pretty(value).map_err(|e| IoError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, json).map_err(|e| IoError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Load `{experiment}_training.json` from `dir`.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::FileNotFound`] | No artifact for this experiment |
/// | [`IoError::Json`] | Artifact is not valid JSON for this version |
#[instrument(skip_all, fields(dir = %dir.display(), experiment = %experiment))]
pub fn read_training(dir: &Path, experiment: &ExperimentName) -> Result<TrainingArtifact, IoError> {
    let path = training_path(dir, experiment);
    let text = fs::read_to_string(&path).map_err(|e| IoError::FileNotFound {
        path: path.clone(),
        source: e,
    })?;
    let artifact: TrainingArtifact =
        serde_json::from_str(&text).map_err(|e| IoError::Json { path: path.clone(), source: e })?;
    debug!(run_id = %artifact.weights.run_id(), "training artifact read");
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    use derelict_ensemble::Metric;

    fn artifact() -> TrainingArtifact {
        let run_id = Uuid::new_v4();
        TrainingArtifact {
            experiment: "unit".to_string(),
            weights: ModelWeights::new(0.5, 0.3, 0.2, run_id, Some(0.71)).unwrap(),
            report: ValidationReport {
                run_id,
                metric: Metric::F1 { threshold: 0.5 },
                buffer_radius_m: 250.0,
                folds: Vec::new(),
                mean_metric: Some(0.71),
                uniform_metric: Some(0.64),
                fallback_reason: None,
                zones: Vec::new(),
            },
            config: EngineConfig::default(),
            feature_importances: vec![RankedFeature {
                name: "vacancy_months".to_string(),
                index: 0,
                importance: 1.0,
                rank: 1,
            }],
        }
    }

    #[test]
    fn training_artifact_survives_a_reload() {
        let dir = TempDir::new().unwrap();
        let name = ExperimentName::new("unit".to_string()).unwrap();
        let writer = ResultWriter::new(dir.path(), name.clone()).unwrap();
        let expected = artifact();

        let path = writer.write_training(&expected).unwrap();
        assert!(path.ends_with("unit_training.json"));
        assert_eq!(read_training(dir.path(), &name).unwrap(), expected);
    }

    #[test]
    fn missing_artifact_is_file_not_found() {
        let dir = TempDir::new().unwrap();
        let name = ExperimentName::new("absent".to_string()).unwrap();
        assert!(matches!(read_training(dir.path(), &name), Err(IoError::FileNotFound { .. })));
    }

    #[test]
    fn corrupt_artifact_is_a_json_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken_training.json"), "{ not json").unwrap();
        let name = ExperimentName::new("broken".to_string()).unwrap();
        assert!(matches!(read_training(dir.path(), &name), Err(IoError::Json { .. })));
    }

    #[test]
    fn writer_creates_nested_output_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("runs").join("q3");
        let writer = ResultWriter::new(&nested, ExperimentName::new("q3".to_string()).unwrap()).unwrap();
        assert!(nested.is_dir());
        assert_eq!(writer.forest_path(), nested.join("q3_forest.bin"));
    }

    #[test]
    fn empty_score_batch_is_written() {
        let dir = TempDir::new().unwrap();
        let writer = ResultWriter::new(dir.path(), ExperimentName::new("empty".to_string()).unwrap()).unwrap();
        let path = writer.write_scores(&[], None).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["n_scores"], 0);
        assert!(json.get("explanations").is_none());
    }
}
