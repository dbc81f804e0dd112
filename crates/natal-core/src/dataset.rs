//! People tables: column aliasing, cleaning and reduction ahead of feature building.

use crate::chart::BirthFact;
use crate::error::{DataError, DataResult};
use crate::features::{number_cell, text_cell, Row};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Columns every cleaned people row carries.
pub const REQUIRED_COLUMNS: [&str; 6] = [
    "name",
    "occupation",
    "birthdate",
    "bplace_name",
    "bplace_lat",
    "bplace_lon",
];

/// Alternate spellings accepted from upstream tables, as (alias, canonical).
pub const COLUMN_ALIASES: [(&str, &str); 8] = [
    ("birth_date", "birthdate"),
    ("birth_place", "bplace_name"),
    ("birthplace", "bplace_name"),
    ("birthplace_name", "bplace_name"),
    ("latitude", "bplace_lat"),
    ("lat", "bplace_lat"),
    ("longitude", "bplace_lon"),
    ("lon", "bplace_lon"),
];

/// Default row cap of the reduced table.
pub const MAX_RECORDS: usize = 1000;

/// One cleaned person with a parsed birth date and birthplace coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub name: String,
    pub occupation: String,
    pub birthdate: NaiveDate,
    pub bplace_name: String,
    pub bplace_lat: f64,
    pub bplace_lon: f64,
}

impl PersonRecord {
    /// Parses a row with canonical column names. `None` when any required value is
    /// null, blank or unparseable.
    pub fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            name: text_cell(row.get("name"))?,
            occupation: text_cell(row.get("occupation"))?,
            birthdate: parse_birth_date(&text_cell(row.get("birthdate"))?)?,
            bplace_name: text_cell(row.get("bplace_name"))?,
            bplace_lat: row.get("bplace_lat").and_then(number_cell)?,
            bplace_lon: row.get("bplace_lon").and_then(number_cell)?,
        })
    }

    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Row::new(),
        }
    }

    /// Birth fact for batch feature building; the time of day is unknown and left at noon.
    pub fn birth_fact(&self) -> BirthFact {
        BirthFact::new(self.name.clone(), self.birthdate, self.bplace_lat, self.bplace_lon)
    }
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time (`T…` or ` …`).
pub fn parse_birth_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let date_part = value
        .split(|c| c == 'T' || c == ' ')
        .next()
        .unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Copies alias columns onto their canonical name when the canonical one is absent.
pub fn apply_aliases(row: &mut Row) {
    for (alias, canonical) in COLUMN_ALIASES {
        if !row.contains_key(canonical) {
            if let Some(v) = row.get(alias).cloned() {
                row.insert(canonical.to_string(), v);
            }
        }
    }
}

/// Required columns absent from every row of the table.
pub fn missing_columns(rows: &[Row]) -> Vec<&'static str> {
    REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !rows.iter().any(|r| r.contains_key(*c)))
        .collect()
}

/// Aliases, checks required columns, then drops rows with null values or bad dates.
pub fn clean(mut rows: Vec<Row>) -> DataResult<Vec<PersonRecord>> {
    rows.iter_mut().for_each(apply_aliases);
    let missing = missing_columns(&rows);
    if !missing.is_empty() {
        return Err(DataError::Malformed {
            source_name: "people table".into(),
            reason: format!("missing required columns: {}", missing.join(", ")),
        });
    }

    let total = rows.len();
    let cleaned: Vec<PersonRecord> = rows.iter().filter_map(PersonRecord::from_row).collect();
    tracing::info!(
        target: "natal::data",
        total,
        kept = cleaned.len(),
        dropped = total - cleaned.len(),
        "people table cleaned"
    );
    Ok(cleaned)
}

/// First `limit` records, in table order.
pub fn reduce(mut records: Vec<PersonRecord>, limit: usize) -> Vec<PersonRecord> {
    records.truncate(limit);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn aliases_fill_canonical_columns() {
        let rows = vec![row(json!({
            "name": "Marie Curie",
            "occupation": "Physicist",
            "birth_date": "1867-11-07",
            "birthplace": "Warsaw",
            "lat": 52.23,
            "longitude": "21.01"
        }))];
        let people = clean(rows).unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].bplace_name, "Warsaw");
        assert_eq!(people[0].bplace_lon, 21.01);
        assert_eq!(people[0].birthdate, NaiveDate::from_ymd_opt(1867, 11, 7).unwrap());
    }

    #[test]
    fn incomplete_rows_are_dropped() {
        let rows = vec![
            row(json!({"name": "A", "occupation": "Poet", "birthdate": "1900-01-01",
                       "bplace_name": "X", "bplace_lat": 1.0, "bplace_lon": 2.0})),
            row(json!({"name": "B", "occupation": null, "birthdate": "1900-01-01",
                       "bplace_name": "X", "bplace_lat": 1.0, "bplace_lon": 2.0})),
            row(json!({"name": "C", "occupation": "Poet", "birthdate": "not a date",
                       "bplace_name": "X", "bplace_lat": 1.0, "bplace_lon": 2.0})),
        ];
        let people = clean(rows).unwrap();
        assert_eq!(people.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn missing_column_is_malformed() {
        let rows = vec![row(json!({"name": "A", "occupation": "Poet"}))];
        assert!(matches!(clean(rows), Err(DataError::Malformed { .. })));
    }

    #[test]
    fn dates_with_time_suffix_parse() {
        assert_eq!(
            parse_birth_date("1955-02-24T19:15:00"),
            NaiveDate::from_ymd_opt(1955, 2, 24)
        );
        assert_eq!(parse_birth_date("1955-02-24 07:00"), NaiveDate::from_ymd_opt(1955, 2, 24));
        assert_eq!(parse_birth_date("24/02/1955"), None);
    }

    #[test]
    fn reduce_keeps_head() {
        let p = PersonRecord {
            name: "n".into(),
            occupation: "o".into(),
            birthdate: NaiveDate::from_ymd_opt(1950, 1, 1).unwrap(),
            bplace_name: "x".into(),
            bplace_lat: 0.0,
            bplace_lon: 0.0,
        };
        assert_eq!(reduce(vec![p.clone(); 5], 3).len(), 3);
        assert_eq!(reduce(vec![p; 2], MAX_RECORDS).len(), 2);
    }
}
