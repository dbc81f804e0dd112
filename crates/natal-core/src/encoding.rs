//! Frozen-schema one-hot encoding shared by training and inference.
//!
//! [`EncodingSchema::fit`] derives the column list from a batch and then encodes that batch
//! through [`EncodingSchema::transform`], the same function the prediction service calls for
//! a single record. The schema is never extended after fitting: categories that were not
//! seen at fit time produce an all-zero group.

use crate::error::{ArtifactError, TrainingError};
use crate::features::{FeatureRecord, Row, LAYOUT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

/// One output column of the encoded matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Column {
    Numeric { field: String },
    OneHot { base: String, category: String },
}

impl Column {
    /// Column name: the field itself, or `{base}_{category}`.
    pub fn name(&self) -> String {
        match self {
            Column::Numeric { field } => field.clone(),
            Column::OneHot { base, category } => format!("{base}_{category}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SchemaDoc {
    columns: Vec<Column>,
}

/// Ordered, immutable column list plus lookup tables rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SchemaDoc", try_from = "SchemaDoc")]
pub struct EncodingSchema {
    columns: Vec<Column>,
    /// (layout index, column index)
    numeric: Vec<(usize, usize)>,
    /// layout index → category → column index
    one_hot: Vec<(usize, HashMap<String, usize>)>,
}

impl From<EncodingSchema> for SchemaDoc {
    fn from(schema: EncodingSchema) -> Self {
        SchemaDoc {
            columns: schema.columns,
        }
    }
}

impl TryFrom<SchemaDoc> for EncodingSchema {
    type Error = String;

    fn try_from(doc: SchemaDoc) -> Result<Self, Self::Error> {
        EncodingSchema::from_columns(doc.columns).map_err(|e| e.to_string())
    }
}

impl EncodingSchema {
    /// Validates columns against the feature layout and builds the lookup tables.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self, ArtifactError> {
        let mut numeric = Vec::new();
        let mut groups: Vec<(usize, HashMap<String, usize>)> = Vec::new();

        for (ci, column) in columns.iter().enumerate() {
            match column {
                Column::Numeric { field } => {
                    let li = LAYOUT
                        .position(field)
                        .filter(|&li| !LAYOUT.fields()[li].kind.is_categorical())
                        .ok_or_else(|| {
                            ArtifactError::Mismatch(format!("unknown numeric column {field}"))
                        })?;
                    numeric.push((li, ci));
                }
                Column::OneHot { base, category } => {
                    let li = LAYOUT
                        .position(base)
                        .filter(|&li| LAYOUT.fields()[li].kind.is_categorical())
                        .ok_or_else(|| {
                            ArtifactError::Mismatch(format!("unknown categorical base {base}"))
                        })?;
                    match groups.iter_mut().find(|(g, _)| *g == li) {
                        Some((_, map)) => {
                            if map.insert(category.clone(), ci).is_some() {
                                return Err(ArtifactError::Mismatch(format!(
                                    "duplicate column {}",
                                    column.name()
                                )));
                            }
                        }
                        None => groups.push((li, HashMap::from([(category.clone(), ci)]))),
                    }
                }
            }
        }

        Ok(Self {
            columns,
            numeric,
            one_hot: groups,
        })
    }

    /// Rebuilds a schema from bare column names, as found in a prepared table header.
    /// A name that is not a numeric field is attributed to the longest categorical base
    /// it extends.
    pub fn from_column_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ArtifactError> {
        let columns = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                Self::column_for(name)
                    .ok_or_else(|| ArtifactError::Mismatch(format!("unrecognized column {name}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_columns(columns)
    }

    /// Maps an encoded column name back onto the layout field it came from.
    fn column_for(name: &str) -> Option<Column> {
        let numeric = LAYOUT
            .position(name)
            .map(|li| !LAYOUT.fields()[li].kind.is_categorical())
            .unwrap_or(false);
        if numeric {
            return Some(Column::Numeric {
                field: name.to_string(),
            });
        }
        let base = LAYOUT
            .fields()
            .iter()
            .filter(|f| f.kind.is_categorical())
            .filter(|f| name.len() > f.name.len() + 1 && name.starts_with(&format!("{}_", f.name)))
            .max_by_key(|f| f.name.len())?;
        Some(Column::OneHot {
            base: base.name.clone(),
            category: name[base.name.len() + 1..].to_string(),
        })
    }

    /// Fits the schema on a batch and encodes the batch with it.
    ///
    /// Numeric fields come first in layout order, then each categorical field's categories
    /// in sorted order.
    pub fn fit(records: &[FeatureRecord]) -> (Vec<Vec<f64>>, Self) {
        let mut columns = Vec::new();
        let mut numeric = Vec::new();
        let mut one_hot = Vec::new();

        for (li, spec) in LAYOUT.fields().iter().enumerate() {
            if !spec.kind.is_categorical() {
                numeric.push((li, columns.len()));
                columns.push(Column::Numeric {
                    field: spec.name.clone(),
                });
            }
        }
        for (li, spec) in LAYOUT.fields().iter().enumerate() {
            if !spec.kind.is_categorical() {
                continue;
            }
            let categories: BTreeSet<String> =
                records.iter().map(|r| r.category_value(li)).collect();
            let mut lookup = HashMap::with_capacity(categories.len());
            for category in categories {
                lookup.insert(category.clone(), columns.len());
                columns.push(Column::OneHot {
                    base: spec.name.clone(),
                    category,
                });
            }
            one_hot.push((li, lookup));
        }

        let schema = Self {
            columns,
            numeric,
            one_hot,
        };
        tracing::info!(
            target: "natal::encoder",
            records = records.len(),
            columns = schema.width(),
            "encoding schema fitted"
        );
        let matrix = records.iter().map(|r| schema.transform(r)).collect();
        (matrix, schema)
    }

    /// Encodes one record against the frozen schema. Never adds columns.
    pub fn transform(&self, record: &FeatureRecord) -> Vec<f64> {
        let mut row = vec![0.0; self.columns.len()];
        for &(li, ci) in &self.numeric {
            row[ci] = record.numeric_value(li);
        }
        for (li, categories) in &self.one_hot {
            if let Some(&ci) = categories.get(&record.category_value(*li)) {
                row[ci] = 1.0;
            }
        }
        row
    }

    /// `(field, category)` pairs of the record that the schema has no column for.
    pub fn unseen_categories(&self, record: &FeatureRecord) -> Vec<(String, String)> {
        self.one_hot
            .iter()
            .filter_map(|(li, categories)| {
                let value = record.category_value(*li);
                (!categories.contains_key(&value))
                    .then(|| (LAYOUT.fields()[*li].name.clone(), value))
            })
            .collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(Column::name).collect()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// SHA-256 over the ordered column names; identifies a schema across artifacts.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for name in self.column_names() {
            hasher.update(name.as_bytes());
            hasher.update(b"\n");
        }
        let mut out = String::with_capacity(64);
        for byte in hasher.finalize() {
            let _ = write!(out, "{:02x}", byte);
        }
        out
    }
}

// -----------------------------------------------------------------------------
// Labels
// -----------------------------------------------------------------------------

/// Sorted distinct occupations; the position of a label is its encoded class.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMapping {
    labels: Vec<String>,
}

impl LabelMapping {
    pub fn fit<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = labels.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self {
            labels: set.into_iter().collect(),
        }
    }

    /// Labels must be strictly ascending for [`LabelMapping::encode`] to find them.
    pub fn check(&self) -> Result<(), ArtifactError> {
        match self.labels.windows(2).find(|w| w[0] >= w[1]) {
            Some(w) if w[0] == w[1] => Err(ArtifactError::Mismatch(format!("duplicate label {}", w[0]))),
            Some(w) => Err(ArtifactError::Mismatch(format!(
                "labels out of order: {} before {}",
                w[0], w[1]
            ))),
            None => Ok(()),
        }
    }

    pub fn encode(&self, label: &str) -> Option<usize> {
        self.labels.binary_search_by(|l| l.as_str().cmp(label)).ok()
    }

    pub fn decode(&self, class: usize) -> Option<&str> {
        self.labels.get(class).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Prepared dataset
// -----------------------------------------------------------------------------

/// One encoded training example.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub name: String,
    pub occupation: String,
    pub class: usize,
    pub features: Vec<f64>,
}

/// Encoded training matrix bound to the schema and labels that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDataset {
    pub schema: EncodingSchema,
    pub labels: LabelMapping,
    pub rows: Vec<PreparedRow>,
}

impl PreparedDataset {
    /// Drops unlabeled records, fits labels and schema, and encodes the batch.
    pub fn prepare(records: &[FeatureRecord]) -> Result<Self, TrainingError> {
        let labeled: Vec<&FeatureRecord> = records
            .iter()
            .filter(|r| r.occupation.as_deref().is_some_and(|o| !o.trim().is_empty()))
            .collect();
        let dropped = records.len() - labeled.len();
        if dropped > 0 {
            tracing::warn!(target: "natal::encoder", dropped, "records without occupation dropped");
        }
        if labeled.is_empty() {
            return Err(TrainingError::InsufficientData(
                "no labeled feature records".into(),
            ));
        }

        let owned: Vec<FeatureRecord> = labeled.into_iter().cloned().collect();
        let labels = LabelMapping::fit(owned.iter().filter_map(|r| r.occupation.as_deref()));
        let (matrix, schema) = EncodingSchema::fit(&owned);

        let rows = owned
            .iter()
            .zip(matrix)
            .filter_map(|(record, features)| {
                let occupation = record.occupation.clone()?;
                let class = labels.encode(&occupation)?;
                Some(PreparedRow {
                    name: record.name.clone().unwrap_or_default(),
                    occupation,
                    class,
                    features,
                })
            })
            .collect();

        Ok(Self {
            schema,
            labels,
            rows,
        })
    }

    /// Flat table form: `name`, `occupation`, `occupation_encoded`, then one cell per column.
    pub fn to_rows(&self) -> Vec<Row> {
        let names = self.schema.column_names();
        self.rows
            .iter()
            .map(|r| {
                let mut row = Row::new();
                row.insert("name".into(), Value::String(r.name.clone()));
                row.insert("occupation".into(), Value::String(r.occupation.clone()));
                row.insert("occupation_encoded".into(), Value::from(r.class));
                for (name, v) in names.iter().zip(&r.features) {
                    row.insert(
                        name.clone(),
                        serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
                    );
                }
                row
            })
            .collect()
    }

    /// Reads a flat prepared table. The schema is inferred from the header of the first
    /// row and labels are refitted from the occupation column. Columns that do not map onto
    /// the feature layout are skipped.
    pub fn from_rows(rows: &[Row]) -> Result<Self, ArtifactError> {
        const META: [&str; 3] = ["name", "occupation", "occupation_encoded"];
        let first = rows
            .first()
            .ok_or_else(|| ArtifactError::Mismatch("empty prepared table".into()))?;
        let (names, extra): (Vec<&str>, Vec<&str>) = first
            .keys()
            .map(String::as_str)
            .filter(|k| !META.contains(k))
            .partition(|k| EncodingSchema::column_for(k).is_some());
        if !extra.is_empty() {
            tracing::warn!(target: "natal::encoder", columns = ?extra, "ignoring columns outside the feature layout");
        }
        let schema = EncodingSchema::from_column_names(&names)?;

        let labels = LabelMapping::fit(
            rows.iter()
                .filter_map(|r| r.get("occupation").and_then(Value::as_str)),
        );

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(occupation) = row.get("occupation").and_then(Value::as_str) else {
                continue;
            };
            let class = labels
                .encode(occupation)
                .ok_or_else(|| ArtifactError::Mismatch(format!("unknown label {occupation}")))?;
            let features = names
                .iter()
                .map(|n| row.get(*n).and_then(crate::features::number_cell).unwrap_or(0.0))
                .collect();
            out.push(PreparedRow {
                name: row
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                occupation: occupation.to_string(),
                class,
                features,
            });
        }

        Ok(Self {
            schema,
            labels,
            rows: out,
        })
    }

    pub fn matrix(&self) -> Vec<Vec<f64>> {
        self.rows.iter().map(|r| r.features.clone()).collect()
    }

    pub fn targets(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.class).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FieldValue, UNKNOWN_CATEGORY};

    fn record(occupation: &str, sun: Option<&str>, house: Option<f64>) -> FeatureRecord {
        let mut r = FeatureRecord::empty(Some(format!("p-{occupation}")), Some(occupation.into()));
        if let Some(s) = sun {
            r.set("sun_sign", FieldValue::Text(s.into()));
        }
        if let Some(h) = house {
            r.set("sun_house", FieldValue::Number(h));
        }
        r
    }

    #[test]
    fn fit_orders_numeric_then_sorted_categories() {
        let records = vec![
            record("Painter", Some("Leo"), Some(5.0)),
            record("Poet", Some("Aries"), None),
        ];
        let (matrix, schema) = EncodingSchema::fit(&records);
        let names = schema.column_names();
        assert_eq!(names[0], "sun_house");
        let aries = names.iter().position(|n| n == "sun_sign_Aries").unwrap();
        let leo = names.iter().position(|n| n == "sun_sign_Leo").unwrap();
        assert_eq!(leo, aries + 1);
        assert!(names.iter().any(|n| n == &format!("moon_sign_{UNKNOWN_CATEGORY}")));
        assert_eq!(matrix[0][0], 5.0);
        assert_eq!(matrix[1][0], 0.0);
        assert_eq!(matrix[0][leo], 1.0);
        assert_eq!(matrix[0][aries], 0.0);
    }

    #[test]
    fn unseen_category_zeroes_group() {
        let (_, schema) = EncodingSchema::fit(&[record("Painter", Some("Leo"), None)]);
        let probe = record("x", Some("Virgo"), None);
        let row = schema.transform(&probe);
        assert_eq!(row.len(), schema.width());
        let group: f64 = schema
            .columns()
            .iter()
            .zip(&row)
            .filter(|(c, _)| matches!(c, Column::OneHot { base, .. } if base == "sun_sign"))
            .map(|(_, v)| v)
            .sum();
        assert_eq!(group, 0.0);
        assert_eq!(
            schema.unseen_categories(&probe),
            vec![("sun_sign".to_string(), "Virgo".to_string())]
        );
    }

    #[test]
    fn column_names_rebuild_same_schema() {
        let (_, schema) = EncodingSchema::fit(&[
            record("Painter", Some("Leo"), Some(1.0)),
            record("Poet", Some("Pisces"), Some(2.0)),
        ]);
        let rebuilt = EncodingSchema::from_column_names(&schema.column_names()).unwrap();
        assert_eq!(rebuilt, schema);
        assert_eq!(rebuilt.fingerprint(), schema.fingerprint());
    }

    #[test]
    fn longest_base_wins_for_dispositor_columns() {
        let schema = EncodingSchema::from_column_names(&[
            "sun_dispositor_traditional_temperament_Choleric",
            "sun_dispositor_traditional_Mars",
        ])
        .unwrap();
        assert_eq!(
            schema.columns()[0],
            Column::OneHot {
                base: "sun_dispositor_traditional_temperament".into(),
                category: "Choleric".into()
            }
        );
        assert_eq!(
            schema.columns()[1],
            Column::OneHot {
                base: "sun_dispositor_traditional".into(),
                category: "Mars".into()
            }
        );
    }

    #[test]
    fn schema_serde_rejects_foreign_columns() {
        let json = r#"{"columns":[{"kind":"numeric","field":"not_a_field"}]}"#;
        assert!(serde_json::from_str::<EncodingSchema>(json).is_err());
    }

    #[test]
    fn labels_are_sorted_and_dense() {
        let labels = LabelMapping::fit(["Poet", "Actor", "Poet", "Engineer"]);
        assert_eq!(labels.labels(), &["Actor", "Engineer", "Poet"]);
        assert_eq!(labels.encode("Poet"), Some(2));
        assert_eq!(labels.decode(0), Some("Actor"));
        assert_eq!(labels.encode("Chef"), None);
    }

    #[test]
    fn prepared_rows_round_trip_through_table_form() {
        let prepared = PreparedDataset::prepare(&[
            record("Painter", Some("Leo"), Some(3.0)),
            record("Poet", Some("Aries"), Some(7.0)),
            FeatureRecord::empty(Some("nobody".into()), None),
        ])
        .unwrap();
        assert_eq!(prepared.rows.len(), 2);
        let restored = PreparedDataset::from_rows(&prepared.to_rows()).unwrap();
        assert_eq!(restored, prepared);
    }

    #[test]
    fn extra_store_columns_are_ignored() {
        let prepared = PreparedDataset::prepare(&[
            record("Painter", Some("Leo"), Some(3.0)),
            record("Poet", Some("Aries"), Some(7.0)),
        ])
        .unwrap();
        let rows: Vec<Row> = prepared
            .to_rows()
            .into_iter()
            .enumerate()
            .map(|(i, mut row)| {
                row.insert("id".into(), Value::from(i));
                row
            })
            .collect();
        let restored = PreparedDataset::from_rows(&rows).unwrap();
        assert_eq!(restored, prepared);
    }

    #[test]
    fn label_check_catches_order_and_duplicates() {
        LabelMapping::fit(["b", "a"]).check().unwrap();
        let unsorted: LabelMapping = serde_json::from_str(r#"["b","a"]"#).unwrap();
        assert!(unsorted.check().is_err());
        let duplicated: LabelMapping = serde_json::from_str(r#"["a","a"]"#).unwrap();
        assert!(duplicated.check().is_err());
    }
}
