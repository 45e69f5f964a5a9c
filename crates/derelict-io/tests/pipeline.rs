//! End-to-end: CSV -> train -> artifacts on disk -> fresh engine -> score -> JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derelict_ensemble::{
    CancellationToken, EngineConfig, FunnelStage, RiskEngine, SatelliteEvidenceSource, StreetEvidenceSource,
    ZoneConfig,
};
use derelict_io::{
    ConfirmedReader, EvidenceReader, ExperimentName, IoError, LocationReader, ResultWriter, SampleReader,
    TrainingArtifact, read_training,
};
use derelict_rf::{Forest, ForestConfig};
use derelict_spatial::{SpatialIndex, ZoneLayout};
use tempfile::TempDir;

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scorers.forest = ForestConfig::new(20).unwrap().with_seed(7);
    config
}

fn engine(config: EngineConfig, features: derelict_io::TableFeatures, evidence: derelict_io::EvidenceTable) -> RiskEngine {
    let evidence = Arc::new(evidence);
    let satellite: Arc<dyn SatelliteEvidenceSource> = evidence.clone();
    let street: Arc<dyn StreetEvidenceSource> = evidence;
    RiskEngine::new(config, Arc::new(SpatialIndex::new()), Arc::new(features), satellite, street).unwrap()
}

#[test]
fn train_persist_reload_and_score() {
    // 1. Read inputs
    let samples = SampleReader::new(&fixture_path("samples_10x10.csv")).read().unwrap();
    assert_eq!(samples.len(), 100);
    let locations = LocationReader::new(&fixture_path("locations.csv")).read().unwrap();
    assert_eq!(locations.requests.len(), 6);
    let confirmed = ConfirmedReader::new(&fixture_path("confirmed.csv")).read().unwrap();
    assert_eq!(confirmed.len(), 14);

    // 2. Train and persist
    let dir = TempDir::new().unwrap();
    let experiment = ExperimentName::new("detroit_rt".into()).unwrap();
    let writer = ResultWriter::new(dir.path(), experiment.clone()).unwrap();

    let trainer = engine(config(), derelict_io::TableFeatures::new(), derelict_io::EvidenceTable::new());
    let outcome = trainer
        .train(&samples, &ZoneConfig::Grid { cell_m: 1000.0 }, 150.0, &CancellationToken::new())
        .unwrap();
    outcome.forest.save(writer.forest_path()).unwrap();
    writer
        .write_training(&TrainingArtifact {
            experiment: experiment.to_string(),
            weights: outcome.weights.clone(),
            report: outcome.report.clone(),
            config: trainer.config().clone(),
            feature_importances: outcome.forest.ranked_importances(),
        })
        .unwrap();

    // 3. Reload into a fresh engine
    let artifact = read_training(dir.path(), &experiment).unwrap();
    assert_eq!(artifact.weights.run_id(), outcome.weights.run_id());
    for (stored, trained) in artifact.weights.as_array().iter().zip(outcome.weights.as_array()) {
        assert!((stored - trained).abs() < 1e-12);
    }
    assert_eq!(artifact.feature_importances.len(), 3);
    let forest = Forest::load(writer.forest_path()).unwrap();
    let layout = ZoneLayout::from_zones(artifact.report.zones.clone()).unwrap();

    let evidence = EvidenceReader::new(&fixture_path("evidence.csv")).read().unwrap();
    let scorer = engine(artifact.config.clone(), locations.features, evidence);
    scorer
        .install(Arc::new(forest), artifact.weights.clone(), Some(Arc::new(layout)))
        .unwrap();
    scorer.publish_confirmed(confirmed).unwrap();

    // 4. Score and explain
    let scores = scorer.score(&locations.requests).unwrap();
    assert_eq!(scores.len(), 6);
    for (score, request) in scores.iter().zip(&locations.requests) {
        assert_eq!(score.location_id, request.id);
        assert_eq!(score.run_id, artifact.weights.run_id());
        assert!((0.0..=1.0).contains(&score.final_confidence));
        assert_eq!(score.stage_scores[0].stage, FunnelStage::Broad);
    }
    let explanations: Vec<_> = scores
        .iter()
        .map(|s| scorer.explain(&s.explanation_ref).unwrap())
        .collect();
    assert!(explanations.iter().all(|e| e.feature_note.is_none()));

    // 5. Write and read back the score file
    let path = writer.write_scores(&scores, Some(&explanations)).unwrap();
    let content: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(content["experiment"], "detroit_rt");
    assert_eq!(content["n_scores"].as_u64().unwrap(), 6);
    assert_eq!(content["scores"].as_array().unwrap().len(), 6);
    assert_eq!(content["explanations"].as_array().unwrap().len(), 6);
    assert_eq!(content["scores"][0]["location_id"], "L1");
}

#[test]
fn hotspot_locations_outscore_quiet_ones() {
    let samples = SampleReader::new(&fixture_path("samples_10x10.csv")).read().unwrap();
    let locations = LocationReader::new(&fixture_path("locations.csv")).read().unwrap();
    let confirmed = ConfirmedReader::new(&fixture_path("confirmed.csv")).read().unwrap();

    let engine = engine(config(), locations.features, derelict_io::EvidenceTable::new());
    engine
        .train(&samples, &ZoneConfig::KMeans { k: 6 }, 150.0, &CancellationToken::new())
        .unwrap();
    engine.publish_confirmed(confirmed).unwrap();

    let scores = engine.score(&locations.requests).unwrap();
    let base = |id: &str| {
        scores
            .iter()
            .find(|s| s.location_id == id)
            .map(|s| s.base_confidence)
            .unwrap()
    };
    // L1 sits inside the abandoned block, L3 and L6 far from it.
    assert!(base("L1") > base("L3"));
    assert!(base("L1") > base("L6"));
}

#[test]
fn jagged_fixture_fails() {
    let result = SampleReader::new(&fixture_path("jagged.csv")).read();
    assert!(matches!(result, Err(IoError::InconsistentRowLength { row_index: 1, .. })));
}

#[test]
fn bad_label_fixture_fails() {
    let result = SampleReader::new(&fixture_path("bad_label.csv")).read();
    assert!(matches!(result, Err(IoError::InvalidLabel { row_index: 1, ref raw, .. }) if raw == "maybe"));
}
