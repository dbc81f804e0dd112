//! Flat feature records built from a chart and its derived attributes.
//!
//! Every record shares one [`FeatureLayout`], so two records always expose the same field
//! names in the same order regardless of what the oracle managed to resolve. Records also
//! convert to and from ordered JSON rows, which is how feature tables travel between the
//! batch stages and the remote data source.

use crate::chart::{BirthFact, Body, Chart, ChartOracle, Element, PointId, Rulership};
use crate::derive::{AttributeDeriver, DerivedAttributeSet, Temperament};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One row of a tabular dataset, columns in insertion order.
pub type Row = Map<String, Value>;

/// Placeholder category for a missing categorical value.
pub const UNKNOWN_CATEGORY: &str = "Unknown";
/// Fill value for an unresolved degree; real degrees live in [0, 360).
pub const MISSING_DEGREE: f64 = -1.0;

/// How a field is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// One-hot encoded; missing becomes [`UNKNOWN_CATEGORY`].
    Category,
    /// 1..=12, missing becomes 0.
    House,
    /// [0, 360), missing becomes [`MISSING_DEGREE`].
    Degree,
    /// Non-negative tally, missing becomes 0.
    Count,
    /// Aspect descriptions, encoded as their count.
    AspectList,
}

impl FieldKind {
    pub fn is_categorical(self) -> bool {
        matches!(self, FieldKind::Category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// The fixed ordered field list shared by every feature record.
#[derive(Debug)]
pub struct FeatureLayout {
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
}

/// The layout used by every record in this crate.
pub static LAYOUT: Lazy<FeatureLayout> = Lazy::new(FeatureLayout::standard);

impl FeatureLayout {
    fn standard() -> Self {
        use FieldKind::*;
        let mut fields = Vec::new();
        let mut push = |name: String, kind: FieldKind| fields.push(FieldSpec { name, kind });

        for body in Body::ALL {
            let p = body.key();
            push(format!("{p}_sign"), Category);
            push(format!("{p}_house"), House);
            push(format!("{p}_element"), Category);
            push(format!("{p}_modality"), Category);
            push(format!("{p}_aspects"), AspectList);
            push(format!("{p}_degree"), Degree);
            push(format!("{p}_dispositor_traditional"), Category);
            push(format!("{p}_dispositor_modern"), Category);
            push(format!("{p}_temperament"), Category);
            push(format!("{p}_dispositor_traditional_temperament"), Category);
            push(format!("{p}_dispositor_modern_temperament"), Category);
            push(format!("{p}_dispositor_traditional_element"), Category);
            push(format!("{p}_dispositor_modern_element"), Category);
        }

        for angle in [PointId::Ascendant, PointId::Midheaven] {
            let p = angle.key();
            push(format!("{p}_sign"), Category);
            push(format!("{p}_house"), House);
            push(format!("{p}_degree"), Degree);
        }

        for t in Temperament::ALL {
            push(format!("temperament_{}_count", t.key()), Count);
        }
        for scheme in Rulership::ALL {
            for t in Temperament::ALL {
                push(
                    format!("temperament_{}_dispositor_{}_count", scheme.key(), t.key()),
                    Count,
                );
            }
        }
        for scheme in Rulership::ALL {
            for e in Element::ALL {
                push(
                    format!("element_{}_dispositor_{}_count", scheme.key(), e.key()),
                    Count,
                );
            }
        }
        for scheme in Rulership::ALL {
            push(
                format!("element_{}_dispositor_dominant", scheme.key()),
                Category,
            );
        }
        push("temperament_profile_primary".into(), Category);
        push("temperament_profile_primary_professions".into(), Category);
        push("temperament_profile_primary_challenges".into(), Category);

        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self { fields, index }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

// -----------------------------------------------------------------------------
// Feature values and records
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Missing,
    Text(String),
    Number(f64),
    Aspects(Vec<String>),
}

/// A named, flat feature record aligned with [`LAYOUT`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub name: Option<String>,
    /// Training label; absent at inference time.
    pub occupation: Option<String>,
    values: Vec<FieldValue>,
}

impl FeatureRecord {
    /// A record with every field missing.
    pub fn empty(name: Option<String>, occupation: Option<String>) -> Self {
        Self {
            name,
            occupation,
            values: vec![FieldValue::Missing; LAYOUT.len()],
        }
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        LAYOUT.position(field).map(|i| &self.values[i])
    }

    /// Sets a layout field; names outside the layout are ignored.
    pub fn set(&mut self, field: &str, value: FieldValue) {
        if let Some(i) = LAYOUT.position(field) {
            self.values[i] = value;
        }
    }

    fn set_text(&mut self, field: &str, value: Option<impl ToString>) {
        let v = value.map_or(FieldValue::Missing, |s| FieldValue::Text(s.to_string()));
        self.set(field, v);
    }

    fn set_number(&mut self, field: &str, value: Option<f64>) {
        self.set(field, value.map_or(FieldValue::Missing, FieldValue::Number));
    }

    /// Numeric encoding of field `i` with the kind-specific null fill.
    pub fn numeric_value(&self, i: usize) -> f64 {
        let kind = LAYOUT.fields[i].kind;
        match (&self.values[i], kind) {
            (FieldValue::Number(n), _) if n.is_finite() => *n,
            (FieldValue::Aspects(list), _) => list.len() as f64,
            (_, FieldKind::Degree) => MISSING_DEGREE,
            _ => 0.0,
        }
    }

    /// Categorical value of field `i` with [`UNKNOWN_CATEGORY`] fill.
    pub fn category_value(&self, i: usize) -> String {
        match &self.values[i] {
            FieldValue::Text(s) if !s.trim().is_empty() => s.clone(),
            FieldValue::Number(n) => format_number(*n),
            _ => UNKNOWN_CATEGORY.to_string(),
        }
    }

    /// Display value for a field: the category or the encoded number.
    pub fn display_value(&self, field: &str) -> Option<Value> {
        let i = LAYOUT.position(field)?;
        Some(if LAYOUT.fields[i].kind.is_categorical() {
            Value::String(self.category_value(i))
        } else {
            number_value(self.numeric_value(i))
        })
    }

    /// Ordered JSON row: `name`, `occupation`, then every layout field.
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("name".into(), opt_string(&self.name));
        row.insert("occupation".into(), opt_string(&self.occupation));
        for (spec, value) in LAYOUT.fields.iter().zip(&self.values) {
            let v = match value {
                FieldValue::Missing => Value::Null,
                FieldValue::Text(s) => Value::String(s.clone()),
                FieldValue::Number(n) => match spec.kind {
                    FieldKind::House | FieldKind::Count if n.fract() == 0.0 => {
                        Value::from(*n as i64)
                    }
                    _ => number_value(*n),
                },
                FieldValue::Aspects(list) => {
                    Value::Array(list.iter().cloned().map(Value::String).collect())
                }
            };
            row.insert(spec.name.clone(), v);
        }
        row
    }

    /// Reads a row produced locally or by the remote source. Unknown columns are ignored,
    /// absent columns are missing.
    pub fn from_row(row: &Row) -> Self {
        let mut record = Self::empty(text_cell(row.get("name")), text_cell(row.get("occupation")));
        for (i, spec) in LAYOUT.fields.iter().enumerate() {
            let cell = row.get(&spec.name).unwrap_or(&Value::Null);
            record.values[i] = match spec.kind {
                FieldKind::Category => match cell {
                    Value::String(s) if !s.trim().is_empty() => FieldValue::Text(s.clone()),
                    Value::Number(n) => n.as_f64().map_or(FieldValue::Missing, FieldValue::Number),
                    Value::Bool(b) => FieldValue::Text(b.to_string()),
                    _ => FieldValue::Missing,
                },
                FieldKind::AspectList => parse_aspects(cell),
                _ => number_cell(cell).map_or(FieldValue::Missing, FieldValue::Number),
            };
        }
        record
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value.as_ref().map_or(Value::Null, |s| Value::String(s.clone()))
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

pub(crate) fn text_cell(cell: Option<&Value>) -> Option<String> {
    match cell? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn number_cell(cell: &Value) -> Option<f64> {
    match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Aspect cells arrive as arrays, as serialized list strings (`"['Trine Mars']"` or
/// `"[\"Trine Mars\"]"`) or as a precomputed count.
fn parse_aspects(cell: &Value) -> FieldValue {
    match cell {
        Value::Array(items) => FieldValue::Aspects(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        Value::Number(n) => n.as_f64().map_or(FieldValue::Missing, FieldValue::Number),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
                return FieldValue::Aspects(list);
            }
            if let Ok(n) = trimmed.parse::<f64>() {
                return FieldValue::Number(n);
            }
            let inner = trimmed.trim_start_matches('[').trim_end_matches(']');
            FieldValue::Aspects(
                inner
                    .split(',')
                    .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
                    .filter(|item| !item.is_empty())
                    .collect(),
            )
        }
        _ => FieldValue::Missing,
    }
}

// -----------------------------------------------------------------------------
// Builder
// -----------------------------------------------------------------------------

/// Builds feature records from birth facts through a chart oracle.
#[derive(Clone)]
pub struct FeatureRecordBuilder {
    oracle: Arc<dyn ChartOracle>,
}

impl FeatureRecordBuilder {
    pub fn new(oracle: Arc<dyn ChartOracle>) -> Self {
        Self { oracle }
    }

    /// Casts the chart, degrading to an empty chart when the oracle fails.
    pub fn cast_or_degrade(&self, fact: &BirthFact) -> Chart {
        match self.oracle.cast(fact) {
            Ok(chart) => chart,
            Err(e) => {
                tracing::warn!(
                    target: "natal::features",
                    name = %fact.name,
                    error = %e,
                    "chart computation failed; record degraded to unknown values"
                );
                Chart::empty()
            }
        }
    }

    pub fn build(&self, fact: &BirthFact, occupation: Option<String>) -> FeatureRecord {
        let chart = self.cast_or_degrade(fact);
        Self::from_chart(Some(fact.name.clone()), occupation, &chart)
    }

    /// Builds every record of a batch. Oracle failures degrade single records only.
    pub fn build_batch<'a, I>(&self, facts: I) -> Vec<FeatureRecord>
    where
        I: IntoIterator<Item = (&'a BirthFact, Option<String>)>,
    {
        facts
            .into_iter()
            .map(|(fact, occupation)| self.build(fact, occupation))
            .collect()
    }

    pub fn from_chart(name: Option<String>, occupation: Option<String>, chart: &Chart) -> FeatureRecord {
        let derived = AttributeDeriver::derive(chart);
        let mut record = FeatureRecord::empty(name, occupation);

        for body in Body::ALL {
            let p = body.key();
            let point = chart.body(body);
            let d = derived.point(body);
            record.set_text(&format!("{p}_sign"), point.and_then(|c| c.sign));
            record.set_number(&format!("{p}_house"), point.and_then(|c| c.house).map(f64::from));
            record.set_text(&format!("{p}_element"), point.and_then(|c| c.element()));
            record.set_text(&format!("{p}_modality"), point.and_then(|c| c.modality()));
            record.set(
                &format!("{p}_aspects"),
                point.map_or(FieldValue::Missing, |c| FieldValue::Aspects(c.aspects.clone())),
            );
            record.set_number(&format!("{p}_degree"), point.map(|c| c.degree()));
            record.set_text(&format!("{p}_dispositor_traditional"), d.traditional.ruler);
            record.set_text(&format!("{p}_dispositor_modern"), d.modern.ruler);
            record.set_text(&format!("{p}_temperament"), d.temperament);
            record.set_text(
                &format!("{p}_dispositor_traditional_temperament"),
                d.traditional.temperament,
            );
            record.set_text(&format!("{p}_dispositor_modern_temperament"), d.modern.temperament);
            record.set_text(&format!("{p}_dispositor_traditional_element"), d.traditional.element);
            record.set_text(&format!("{p}_dispositor_modern_element"), d.modern.element);
        }

        for angle in [PointId::Ascendant, PointId::Midheaven] {
            let p = angle.key();
            let point = chart.resolve(angle);
            record.set_text(&format!("{p}_sign"), point.and_then(|c| c.sign));
            record.set_number(&format!("{p}_house"), point.and_then(|c| c.house).map(f64::from));
            record.set_number(&format!("{p}_degree"), point.map(|c| c.degree()));
        }

        Self::write_aggregates(&mut record, &derived);
        record
    }

    fn write_aggregates(record: &mut FeatureRecord, derived: &DerivedAttributeSet) {
        for t in Temperament::ALL {
            record.set_number(
                &format!("temperament_{}_count", t.key()),
                Some(f64::from(derived.temperament_counts.count(t.index()))),
            );
        }
        for scheme in Rulership::ALL {
            let temps = derived.dispositor_temperaments(scheme);
            for t in Temperament::ALL {
                record.set_number(
                    &format!("temperament_{}_dispositor_{}_count", scheme.key(), t.key()),
                    Some(f64::from(temps.count(t.index()))),
                );
            }
            let elements = derived.dispositor_elements(scheme);
            for e in Element::ALL {
                record.set_number(
                    &format!("element_{}_dispositor_{}_count", scheme.key(), e.key()),
                    Some(f64::from(elements.count(e.index()))),
                );
            }
            record.set_text(
                &format!("element_{}_dispositor_dominant", scheme.key()),
                derived.dominant_element(scheme),
            );
        }

        let profile = derived.primary_profile.as_ref();
        record.set_text("temperament_profile_primary", profile.map(|p| p.temperament));
        record.set_text(
            "temperament_profile_primary_professions",
            profile.map(|p| p.professions_joined()),
        );
        record.set_text(
            "temperament_profile_primary_challenges",
            profile.map(|p| p.challenges.clone()),
        );
    }
}
