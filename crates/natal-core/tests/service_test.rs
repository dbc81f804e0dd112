use chrono::{NaiveDate, NaiveTime};
use natal_core::artifacts::{self, ArtifactPaths};
use natal_core::predict::{self, Confidence, TOP_FEATURES, TOP_PREDICTIONS};
use natal_core::{
    dataset, BirthFact, Body, BundledSample, Chart, ChartOracle, ChartPoint, ClassifierTrainer,
    FeatureRecordBuilder, ForestParams, MeanMotionOracle, ModelBundle, OracleError, PointId,
    PreparedDataset, RequestStage, ServiceContext, Sign, TrainerConfig,
};
use std::sync::Arc;

fn trained(dir: &std::path::Path) -> ArtifactPaths {
    let oracle = Arc::new(MeanMotionOracle);
    let people = dataset::clean(BundledSample::people_rows().unwrap()).unwrap();
    let builder = FeatureRecordBuilder::new(oracle);
    let records: Vec<_> = people
        .iter()
        .map(|p| builder.build(&p.birth_fact(), Some(p.occupation.clone())))
        .collect();
    let data = PreparedDataset::prepare(&records).unwrap();

    let config = TrainerConfig {
        forest: ForestParams {
            n_trees: 25,
            ..Default::default()
        },
        ..Default::default()
    };
    let (bundle, _) = ClassifierTrainer::new(config).train(&data).unwrap();

    let paths = ArtifactPaths::new(dir);
    bundle.save(&paths.model()).unwrap();
    artifacts::save_prepared(&paths.prepared(), &data).unwrap();
    paths
}

fn request() -> BirthFact {
    BirthFact::new("Visitor", NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(), 32.717, -117.15)
        .with_time(NaiveTime::from_hms_opt(10, 0, 0).unwrap())
}

#[test]
fn analysis_from_persisted_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let paths = trained(dir.path());
    let ctx = ServiceContext::load(&paths.model(), &paths.prepared(), Arc::new(MeanMotionOracle)).unwrap();

    let response = ctx.analyze(&request()).unwrap();
    assert_eq!(response.name, "Visitor");
    assert_eq!(response.predictions.len(), TOP_PREDICTIONS);
    assert!(response
        .predictions
        .windows(2)
        .all(|w| w[0].probability >= w[1].probability));
    for p in &response.predictions {
        assert_eq!(p.confidence, Confidence::from_probability(p.probability));
    }

    assert_eq!(ctx.predict(&request()).unwrap(), response.predictions);
    assert_eq!(response.feature_importance.most_influential.len(), TOP_FEATURES);
    assert_eq!(response.similar_profiles.len(), predict::TOP_SIMILAR);
    assert!(response
        .similar_profiles
        .windows(2)
        .all(|w| w[0].similarity >= w[1].similarity));
    assert!(response.similar_profiles.iter().all(|s| s.similarity <= 1.0));

    assert!(response.natal_chart.contains_key("Sun"));
    assert!(response.natal_chart.contains_key("MC"));
    assert_eq!(response.interpretation.key_factors.len(), 3);

    let json = serde_json::to_value(&response).unwrap();
    for key in ["natal_chart", "predictions", "interpretation", "feature_importance", "similar_profiles"] {
        assert!(json.get(key).is_some(), "{key}");
    }
}

#[test]
fn training_member_is_its_own_nearest_profile() {
    let dir = tempfile::tempdir().unwrap();
    let paths = trained(dir.path());
    let ctx = ServiceContext::load(&paths.model(), &paths.prepared(), Arc::new(MeanMotionOracle)).unwrap();
    let data = artifacts::load_prepared(&paths.prepared()).unwrap();

    let member = &data.rows[0];
    let similar = ctx.find_similar(&member.features);
    assert_eq!(similar[0].similarity, 1.0);
    assert_eq!(similar[0].profession, member.occupation);
}

#[test]
fn mismatched_prepared_table_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let paths = trained(dir.path());
    let bundle = ModelBundle::load(&paths.model()).unwrap();

    let mut data = artifacts::load_prepared(&paths.prepared()).unwrap();
    let mut names = data.schema.column_names();
    names.pop();
    data.schema = natal_core::EncodingSchema::from_column_names(&names).unwrap();
    assert!(ServiceContext::new(bundle, data, Arc::new(MeanMotionOracle)).is_err());
}

#[test]
fn unresolvable_request_still_scores() {
    let dir = tempfile::tempdir().unwrap();
    let paths = trained(dir.path());
    let ctx = ServiceContext::load(&paths.model(), &paths.prepared(), Arc::new(MeanMotionOracle)).unwrap();

    let ancient = BirthFact::new("Ancient", NaiveDate::from_ymd_opt(200, 1, 1).unwrap(), 10.0, 10.0);
    let response = ctx.analyze(&ancient).unwrap();
    assert!(!response.predictions.is_empty());
    assert!(response.interpretation.key_factors.is_empty());
    assert_eq!(response.natal_chart["Sun"]["sign"], "Unknown");
}

/// Places the Sun at a non-finite longitude.
struct CorruptOracle;

impl ChartOracle for CorruptOracle {
    fn cast(&self, _: &BirthFact) -> Result<Chart, OracleError> {
        Ok(Chart::new(vec![ChartPoint {
            point_id: PointId::Body(Body::Sun),
            sign: Some(Sign::Aries),
            house: Some(1),
            longitude: f64::NAN,
            aspects: Vec::new(),
        }]))
    }
}

#[test]
fn corrupt_chart_fails_at_chart_stage() {
    let dir = tempfile::tempdir().unwrap();
    let paths = trained(dir.path());
    let ctx = ServiceContext::load(&paths.model(), &paths.prepared(), Arc::new(CorruptOracle)).unwrap();

    let err = ctx.analyze(&request()).unwrap_err();
    assert_eq!(err.stage, RequestStage::ChartComputed);
    assert!(err.cause.contains("Sun"));
    assert_eq!(ctx.predict(&request()).unwrap_err().stage, RequestStage::ChartComputed);
}

#[test]
fn wrong_width_row_fails_at_scoring() {
    let dir = tempfile::tempdir().unwrap();
    let paths = trained(dir.path());
    let ctx = ServiceContext::load(&paths.model(), &paths.prepared(), Arc::new(MeanMotionOracle)).unwrap();

    let err = ctx.predict_row(&[0.0, 1.0]).unwrap_err();
    assert_eq!(err.stage, RequestStage::Scored);
}

#[test]
fn importances_are_rounded() {
    let dir = tempfile::tempdir().unwrap();
    let paths = trained(dir.path());
    let ctx = ServiceContext::load(&paths.model(), &paths.prepared(), Arc::new(MeanMotionOracle)).unwrap();

    let response = ctx.analyze(&request()).unwrap();
    for f in &response.feature_importance.most_influential {
        assert_eq!(f.importance, (f.importance * 10_000.0).round() / 10_000.0);
    }
}
