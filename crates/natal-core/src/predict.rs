//! Single-record inference: chart → features → frozen encoding → scores → response.
//!
//! A [`ServiceContext`] is built once from the persisted artifacts and shared read-only by
//! every request. Each request walks the stages in [`RequestStage`] order; a failure carries
//! the stage it was attempting.

use crate::artifacts::{self, ModelBundle};
use crate::chart::{BirthFact, Body, Chart, ChartOracle, PointId};
use crate::encoding::PreparedDataset;
use crate::error::{ArtifactError, PredictionError, RequestStage, ValidationError};
use crate::features::{FeatureRecord, FeatureRecordBuilder, FieldValue};
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

pub const TOP_PREDICTIONS: usize = 5;
pub const TOP_FEATURES: usize = 10;
pub const TOP_SIMILAR: usize = 5;
pub const DEFAULT_PERSON_NAME: &str = "User";

/// Fixed probability buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_probability(p: f64) -> Self {
        if p > 0.5 {
            Confidence::High
        } else if p > 0.2 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub profession: String,
    /// Rounded to four decimals.
    pub probability: f64,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfluentialFeature {
    pub feature: String,
    pub value: f64,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureImportance {
    pub most_influential: Vec<InfluentialFeature>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarProfile {
    pub name: String,
    pub profession: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interpretation {
    pub summary: String,
    pub key_factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPlacement {
    pub sign: String,
    pub house: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResponse {
    pub name: String,
    pub natal_chart: Map<String, Value>,
    pub predictions: Vec<Prediction>,
    pub interpretation: Interpretation,
    pub feature_importance: FeatureImportance,
    pub similar_profiles: Vec<SimilarProfile>,
}

/// `1 / (1 + d)`: 1.0 at distance zero, strictly decreasing.
pub fn similarity(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

// -----------------------------------------------------------------------------
// Request parsing
// -----------------------------------------------------------------------------

/// Validates an `/analyze` body into a birth fact. Numeric fields may be numbers or
/// numeric strings; the time accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_request(body: &Value) -> Result<BirthFact, ValidationError> {
    let birth_date = required(body, "birth_date")?;
    let birth_time = required(body, "birth_time")?;
    let latitude = required(body, "latitude")?;
    let longitude = required(body, "longitude")?;

    let birth_date = birth_date
        .as_str()
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        .ok_or_else(|| ValidationError::InvalidField {
            field: "birth_date",
            reason: "expected YYYY-MM-DD".into(),
        })?;
    let birth_time = birth_time
        .as_str()
        .map(str::trim)
        .and_then(|s| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
                .ok()
        })
        .ok_or_else(|| ValidationError::InvalidField {
            field: "birth_time",
            reason: "expected HH:MM".into(),
        })?;
    let latitude = coordinate(latitude, "latitude", 90.0)?;
    let longitude = coordinate(longitude, "longitude", 180.0)?;

    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_PERSON_NAME);

    Ok(BirthFact::new(name, birth_date, latitude, longitude).with_time(birth_time))
}

fn required<'a>(body: &'a Value, key: &'static str) -> Result<&'a Value, ValidationError> {
    match body.get(key) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(key)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::MissingField(key)),
        Some(v) => Ok(v),
    }
}

fn coordinate(value: &Value, field: &'static str, limit: f64) -> Result<f64, ValidationError> {
    let n = crate::features::number_cell(value).ok_or_else(|| ValidationError::InvalidField {
        field,
        reason: "expected a number".into(),
    })?;
    if n.abs() > limit {
        return Err(ValidationError::InvalidField {
            field,
            reason: format!("must be within ±{limit}"),
        });
    }
    Ok(n)
}

// -----------------------------------------------------------------------------
// Service context
// -----------------------------------------------------------------------------

/// Immutable inference state: model bundle, training profiles and the chart oracle.
pub struct ServiceContext {
    bundle: ModelBundle,
    profiles: PreparedDataset,
    builder: FeatureRecordBuilder,
}

impl ServiceContext {
    /// Binds a bundle to the prepared table it was trained from.
    pub fn new(
        bundle: ModelBundle,
        profiles: PreparedDataset,
        oracle: Arc<dyn ChartOracle>,
    ) -> Result<Self, ArtifactError> {
        bundle.validate()?;
        bundle.check_dataset(&profiles)?;
        Ok(Self {
            bundle,
            profiles,
            builder: FeatureRecordBuilder::new(oracle),
        })
    }

    pub fn load(
        model_path: &Path,
        prepared_path: &Path,
        oracle: Arc<dyn ChartOracle>,
    ) -> Result<Self, ArtifactError> {
        let bundle = ModelBundle::load(model_path)?;
        let profiles = artifacts::load_prepared(prepared_path)?;
        Self::new(bundle, profiles, oracle)
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    /// Encodes a record with the frozen schema, logging categories the schema drops.
    pub fn encode(&self, record: &FeatureRecord) -> Vec<f64> {
        let unseen = self.bundle.schema.unseen_categories(record);
        if !unseen.is_empty() {
            tracing::debug!(
                target: "natal::service",
                count = unseen.len(),
                "categories outside the training schema encoded as zeros"
            );
        }
        self.bundle.schema.transform(record)
    }

    /// Top predictions for an encoded row, most probable first.
    pub fn predict_row(&self, row: &[f64]) -> Result<Vec<Prediction>, PredictionError> {
        if row.len() != self.bundle.forest.n_features() {
            return Err(PredictionError::new(
                RequestStage::Scored,
                format!(
                    "row has {} features, model expects {}",
                    row.len(),
                    self.bundle.forest.n_features()
                ),
            ));
        }
        let proba = self.bundle.forest.predict_proba(row);
        let mut ranked: Vec<(usize, f64)> = proba.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        ranked
            .into_iter()
            .take(TOP_PREDICTIONS)
            .map(|(class, p)| {
                let label = self.bundle.labels.decode(class).ok_or_else(|| {
                    PredictionError::new(RequestStage::Scored, format!("class {class} has no label"))
                })?;
                Ok(Prediction {
                    profession: label.to_string(),
                    probability: round4(p),
                    confidence: Confidence::from_probability(p),
                })
            })
            .collect()
    }

    /// End-to-end prediction for a birth fact.
    pub fn predict(&self, fact: &BirthFact) -> Result<Vec<Prediction>, PredictionError> {
        let (_, row) = self.prepare_row(fact)?;
        self.predict_row(&row)
    }

    /// Runs the chart, feature and encoding stages for one request.
    fn prepare_row(&self, fact: &BirthFact) -> Result<(Chart, Vec<f64>), PredictionError> {
        let chart = self.builder.cast_or_degrade(fact);
        if let Some(point) = chart.points().iter().find(|p| !p.longitude.is_finite()) {
            return Err(PredictionError::new(
                RequestStage::ChartComputed,
                format!("{} has a non-finite longitude", point.point_id.as_str()),
            ));
        }
        reached(fact, RequestStage::ChartComputed);

        let record = FeatureRecordBuilder::from_chart(Some(fact.name.clone()), None, &chart);
        let non_finite = record
            .values()
            .iter()
            .any(|v| matches!(v, FieldValue::Number(n) if !n.is_finite()));
        if non_finite {
            return Err(PredictionError::new(
                RequestStage::FeaturesBuilt,
                "feature record contains non-finite values",
            ));
        }
        reached(fact, RequestStage::FeaturesBuilt);

        let row = self.encode(&record);
        if row.iter().any(|v| !v.is_finite()) {
            return Err(PredictionError::new(
                RequestStage::Encoded,
                "encoded row contains non-finite values",
            ));
        }
        reached(fact, RequestStage::Encoded);
        Ok((chart, row))
    }

    /// Features with the highest global importance, paired with this row's values.
    pub fn explain(&self, row: &[f64]) -> FeatureImportance {
        let importances = self.bundle.forest.feature_importances();
        let names = self.bundle.schema.column_names();
        let mut ranked: Vec<usize> = (0..importances.len()).collect();
        ranked.sort_by(|&a, &b| importances[b].total_cmp(&importances[a]).then(a.cmp(&b)));

        FeatureImportance {
            most_influential: ranked
                .into_iter()
                .take(TOP_FEATURES)
                .map(|i| InfluentialFeature {
                    feature: names.get(i).cloned().unwrap_or_default(),
                    value: row.get(i).copied().unwrap_or(0.0),
                    importance: round4(importances[i]),
                })
                .collect(),
        }
    }

    /// Nearest training profiles by Euclidean distance.
    pub fn find_similar(&self, row: &[f64]) -> Vec<SimilarProfile> {
        let mut scored: Vec<(f64, usize)> = self
            .profiles
            .rows
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let d = p
                    .features
                    .iter()
                    .zip(row)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt();
                (d, i)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        scored
            .into_iter()
            .take(TOP_SIMILAR)
            .map(|(d, i)| {
                let p = &self.profiles.rows[i];
                SimilarProfile {
                    name: p.name.clone(),
                    profession: p.occupation.clone(),
                    similarity: round4(similarity(d)),
                }
            })
            .collect()
    }

    /// Full analysis used by the HTTP gateway.
    pub fn analyze(&self, fact: &BirthFact) -> Result<AnalysisResponse, PredictionError> {
        reached(fact, RequestStage::Received);
        let (chart, row) = self.prepare_row(fact)?;
        let predictions = self.predict_row(&row)?;
        reached(fact, RequestStage::Scored);

        let response = AnalysisResponse {
            name: fact.name.clone(),
            natal_chart: natal_chart(&chart)
                .map_err(|e| PredictionError::new(RequestStage::Responded, e.to_string()))?,
            interpretation: interpret(&chart, &predictions),
            feature_importance: self.explain(&row),
            similar_profiles: self.find_similar(&row),
            predictions,
        };
        reached(fact, RequestStage::Responded);
        tracing::info!(
            target: "natal::service",
            name = %fact.name,
            top = response.predictions.first().map(|p| p.profession.as_str()).unwrap_or("-"),
            "analysis complete"
        );
        Ok(response)
    }
}

fn reached(fact: &BirthFact, stage: RequestStage) {
    tracing::debug!(target: "natal::service", name = %fact.name, %stage, "request stage");
}

fn natal_chart(chart: &Chart) -> Result<Map<String, Value>, serde_json::Error> {
    let mut out = Map::new();
    let points = Body::ALL
        .iter()
        .map(|b| PointId::Body(*b))
        .chain([PointId::Ascendant, PointId::Midheaven]);
    for id in points {
        let point = chart.resolve(id);
        let is_body = matches!(id, PointId::Body(_));
        let placement = ChartPlacement {
            sign: point
                .and_then(|p| p.sign)
                .map_or_else(|| crate::features::UNKNOWN_CATEGORY.to_string(), |s| s.to_string()),
            house: point.and_then(|p| p.house),
            element: is_body.then(|| point.and_then(|p| p.element()).map(|e| e.to_string())).flatten(),
            modality: is_body.then(|| point.and_then(|p| p.modality()).map(|m| m.to_string())).flatten(),
        };
        out.insert(id.as_str().to_string(), serde_json::to_value(placement)?);
    }
    Ok(out)
}

fn interpret(chart: &Chart, predictions: &[Prediction]) -> Interpretation {
    let summary = match predictions.first() {
        Some(top) => format!(
            "Based on the natal chart, the strongest vocational match is {} ({:.1}% probability, {} confidence).",
            top.profession,
            top.probability * 100.0,
            match top.confidence {
                Confidence::High => "high",
                Confidence::Medium => "medium",
                Confidence::Low => "low",
            }
        ),
        None => "No vocational match could be computed for this chart.".to_string(),
    };

    let mut key_factors = Vec::new();
    if let Some(sign) = chart.body(Body::Sun).and_then(|p| p.sign) {
        key_factors.push(format!("Sun in {sign} shapes the core identity and drive."));
    }
    if let Some(sign) = chart.body(Body::Moon).and_then(|p| p.sign) {
        key_factors.push(format!("Moon in {sign} colors the emotional needs at work."));
    }
    if let Some(sign) = chart.resolve(PointId::Midheaven).and_then(|p| p.sign) {
        key_factors.push(format!("Midheaven in {sign} points to the public vocation."));
    }

    Interpretation {
        summary,
        key_factors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confidence_buckets() {
        assert_eq!(Confidence::from_probability(0.51), Confidence::High);
        assert_eq!(Confidence::from_probability(0.5), Confidence::Medium);
        assert_eq!(Confidence::from_probability(0.21), Confidence::Medium);
        assert_eq!(Confidence::from_probability(0.2), Confidence::Low);
    }

    #[test]
    fn similarity_is_one_at_zero_and_decreasing() {
        assert_eq!(similarity(0.0), 1.0);
        let mut prev = similarity(0.0);
        for d in [0.1, 1.0, 2.5, 10.0, 1e6] {
            let s = similarity(d);
            assert!(s < prev);
            prev = s;
        }
    }

    #[test]
    fn request_requires_fields() {
        let body = json!({"birth_date": "1990-01-01", "birth_time": "10:00", "latitude": 1.0});
        assert_eq!(
            parse_request(&body),
            Err(ValidationError::MissingField("longitude"))
        );
        let body = json!({"birth_date": "", "birth_time": "10:00", "latitude": 1.0, "longitude": 2.0});
        assert_eq!(
            parse_request(&body),
            Err(ValidationError::MissingField("birth_date"))
        );
    }

    #[test]
    fn request_parses_strings_and_defaults_name() {
        let body = json!({
            "birth_date": "1990-05-17",
            "birth_time": "07:45:10",
            "latitude": "-23.55",
            "longitude": -46.63
        });
        let fact = parse_request(&body).unwrap();
        assert_eq!(fact.name, DEFAULT_PERSON_NAME);
        assert_eq!(fact.latitude, -23.55);
        assert_eq!(fact.birth_time, NaiveTime::from_hms_opt(7, 45, 10));
    }

    #[test]
    fn request_rejects_bad_values() {
        let body = json!({"birth_date": "17/05/1990", "birth_time": "10:00", "latitude": 1, "longitude": 2});
        assert!(matches!(
            parse_request(&body),
            Err(ValidationError::InvalidField { field: "birth_date", .. })
        ));
        let body = json!({"birth_date": "1990-05-17", "birth_time": "10:00", "latitude": 91, "longitude": 2});
        assert!(matches!(
            parse_request(&body),
            Err(ValidationError::InvalidField { field: "latitude", .. })
        ));
    }
}
