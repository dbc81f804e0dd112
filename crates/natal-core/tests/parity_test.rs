//! Train/serve parity of the feature encoding.

use chrono::{NaiveDate, NaiveTime};
use natal_core::encoding::Column;
use natal_core::features::{FieldKind, FieldValue, MISSING_DEGREE, UNKNOWN_CATEGORY};
use natal_core::{
    BirthFact, Body, Chart, ChartOracle, ClassifierTrainer, EncodingSchema, FeatureRecord,
    FeatureRecordBuilder, MeanMotionOracle, OracleError, PreparedDataset, TrainerConfig, LAYOUT,
};
use std::collections::BTreeMap;
use std::sync::Arc;

struct BrokenOracle;

impl ChartOracle for BrokenOracle {
    fn cast(&self, _: &BirthFact) -> Result<Chart, OracleError> {
        Err(OracleError::Computation("ephemeris unavailable".into()))
    }
}

fn san_diego() -> BirthFact {
    BirthFact::new(
        "Scenario A",
        NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
        32.717,
        -117.15,
    )
    .with_time(NaiveTime::from_hms_opt(10, 0, 0).unwrap())
}

fn fact(name: &str, y: i32, m: u32, d: u32, lat: f64, lon: f64) -> BirthFact {
    BirthFact::new(name, NaiveDate::from_ymd_opt(y, m, d).unwrap(), lat, lon)
        .with_time(NaiveTime::from_hms_opt(6 + (d % 12), 30, 0).unwrap())
}

fn builder() -> FeatureRecordBuilder {
    FeatureRecordBuilder::new(Arc::new(MeanMotionOracle))
}

fn labeled_batch() -> Vec<FeatureRecord> {
    let b = builder();
    let people = [
        (fact("a1", 1879, 3, 14, 48.4, 10.0), "Physicist"),
        (fact("a2", 1858, 4, 23, 54.3, 10.1), "Physicist"),
        (fact("a3", 1867, 11, 7, 52.2, 21.0), "Physicist"),
        (fact("b1", 1853, 3, 30, 51.6, 4.9), "Painter"),
        (fact("b2", 1881, 10, 25, 36.7, -4.4), "Painter"),
        (fact("b3", 1840, 11, 14, 48.9, 2.3), "Painter"),
        (fact("c1", 1770, 12, 16, 50.7, 7.1), "Composer"),
        (fact("c2", 1756, 1, 27, 47.8, 13.0), "Composer"),
        (fact("c3", 1685, 3, 21, 50.9, 10.3), "Composer"),
        (fact("d1", 1924, 6, 5, -33.9, 18.4), "Astronaut"),
    ];
    people
        .iter()
        .map(|(f, occ)| b.build(f, Some(occ.to_string())))
        .collect()
}

/// Column indices of each one-hot base, in schema order.
fn groups(schema: &EncodingSchema) -> BTreeMap<String, Vec<usize>> {
    let mut out: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, c) in schema.columns().iter().enumerate() {
        if let Column::OneHot { base, .. } = c {
            out.entry(base.clone()).or_default().push(i);
        }
    }
    out
}

#[test]
fn same_birth_fact_encodes_identically() {
    let records = labeled_batch();
    let (_, schema) = EncodingSchema::fit(&records);

    let first = schema.transform(&builder().build(&san_diego(), None));
    let second = schema.transform(&builder().build(&san_diego(), None));
    let a: Vec<u64> = first.iter().map(|v| v.to_bits()).collect();
    let b: Vec<u64> = second.iter().map(|v| v.to_bits()).collect();
    assert_eq!(a, b);
}

#[test]
fn width_is_constant_regardless_of_resolution() {
    let records = labeled_batch();
    let (matrix, schema) = EncodingSchema::fit(&records);
    assert!(matrix.iter().all(|row| row.len() == schema.width()));

    let polar = BirthFact::new("polar", NaiveDate::from_ymd_opt(1990, 6, 1).unwrap(), 78.2, 15.6);
    let broken = FeatureRecordBuilder::new(Arc::new(BrokenOracle)).build(&san_diego(), None);
    for record in [builder().build(&polar, None), broken, FeatureRecord::empty(None, None)] {
        assert_eq!(schema.transform(&record).len(), schema.width());
    }
}

#[test]
fn one_hot_groups_sum_to_one_or_zero() {
    let records = labeled_batch();
    let (matrix, schema) = EncodingSchema::fit(&records);
    let groups = groups(&schema);
    assert!(!groups.is_empty());

    for row in &matrix {
        for (base, cols) in &groups {
            let sum: f64 = cols.iter().map(|&i| row[i]).sum();
            assert_eq!(sum, 1.0, "group {base} of a fitted row");
        }
    }

    // A sign never seen at fit time leaves that group empty.
    let mut odd = records[0].clone();
    odd.set("sun_sign", FieldValue::Text("Ophiuchus".into()));
    let row = schema.transform(&odd);
    let sum: f64 = groups["sun_sign"].iter().map(|&i| row[i]).sum();
    assert_eq!(sum, 0.0);
    assert_eq!(
        schema.unseen_categories(&odd),
        vec![("sun_sign".to_string(), "Ophiuchus".to_string())]
    );
}

#[test]
fn scenario_resolved_chart_has_one_hot_per_group() {
    let record = builder().build(&san_diego(), None);
    for body in Body::ALL {
        let key = body.key();
        assert!(
            matches!(record.get(&format!("{key}_sign")), Some(FieldValue::Text(_))),
            "{key} sign"
        );
        assert!(
            matches!(record.get(&format!("{key}_house")), Some(FieldValue::Number(h)) if (1.0..=12.0).contains(h)),
            "{key} house"
        );
    }
    for angle in ["ascendant", "mc"] {
        assert!(matches!(record.get(&format!("{angle}_sign")), Some(FieldValue::Text(_))));
        assert!(matches!(record.get(&format!("{angle}_house")), Some(FieldValue::Number(_))));
    }

    let mut batch = labeled_batch();
    batch.push(record.clone());
    let (_, schema) = EncodingSchema::fit(&batch);
    let row = schema.transform(&record);
    for (base, cols) in groups(&schema) {
        let ones = cols.iter().filter(|&&i| row[i] == 1.0).count();
        assert_eq!(ones, 1, "group {base}");
    }
}

#[test]
fn scenario_failed_oracle_degrades_without_error() {
    let record = FeatureRecordBuilder::new(Arc::new(BrokenOracle)).build(&san_diego(), None);

    for (i, spec) in LAYOUT.fields().iter().enumerate() {
        match spec.kind {
            FieldKind::Category => assert_eq!(record.category_value(i), UNKNOWN_CATEGORY, "{}", spec.name),
            FieldKind::Degree => assert_eq!(record.numeric_value(i), MISSING_DEGREE, "{}", spec.name),
            _ => assert_eq!(record.numeric_value(i), 0.0, "{}", spec.name),
        }
    }
    assert_eq!(record.get("temperament_profile_primary"), Some(&FieldValue::Missing));
}

#[test]
fn scenario_singleton_class_shapes_schema_but_not_training() {
    let records = labeled_batch();
    let data = PreparedDataset::prepare(&records).unwrap();
    assert!(data.labels.encode("Astronaut").is_some());

    // The singleton's sun sign still has a column even though its row is not trained on.
    let astronaut = records.last().unwrap();
    let sun = LAYOUT.position("sun_sign").unwrap();
    let sign = astronaut.category_value(sun);
    assert!(data
        .schema
        .column_names()
        .contains(&format!("sun_sign_{sign}")));

    let config = TrainerConfig {
        forest: natal_core::ForestParams {
            n_trees: 15,
            ..Default::default()
        },
        ..Default::default()
    };
    let (bundle, report) = ClassifierTrainer::new(config).train(&data).unwrap();
    assert_eq!(report.dropped_classes, vec!["Astronaut".to_string()]);
    assert_eq!(report.n_train + report.n_test, records.len() - 1);
    assert_eq!(bundle.schema, data.schema);
    assert_eq!(bundle.labels.len(), 4);
}
