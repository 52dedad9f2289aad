use crate::domain::FieldValue;
use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_DATE_COLUMN: &str = "BidDate";

/// One row of the historical bid dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalRow {
    pub event_date: NaiveDate,
    fields: BTreeMap<String, FieldValue>,
}

impl HistoricalRow {
    pub fn new(event_date: NaiveDate) -> Self {
        Self {
            event_date,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(FieldValue::as_number)
    }

    pub fn has_column(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Flat JSON object with the event date under `date_column`.
    pub fn to_json(&self, date_column: &str) -> Value {
        let mut obj = Map::with_capacity(self.fields.len() + 1);
        obj.insert(
            date_column.to_string(),
            Value::String(self.event_date.format("%Y-%m-%d").to_string()),
        );
        for (k, v) in &self.fields {
            // Undefined numbers serialize as null rather than NaN.
            let v = match v {
                FieldValue::Number(n) if !n.is_finite() => Value::Null,
                other => serde_json::to_value(other).unwrap_or(Value::Null),
            };
            obj.insert(k.clone(), v);
        }
        Value::Object(obj)
    }
}

pub fn parse_event_date(raw: &str) -> anyhow::Result<NaiveDate> {
    let s = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.date_naive());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.date());
    }
    bail!("unrecognized date: {raw}")
}

/// Parses a JSON array of flat objects and returns rows sorted by event date.
pub fn parse_history(json: &str, date_column: &str) -> anyhow::Result<Vec<HistoricalRow>> {
    let raw: Vec<BTreeMap<String, FieldValue>> =
        serde_json::from_str(json).context("history is not a JSON array of flat objects")?;

    let mut rows = Vec::with_capacity(raw.len());
    for (idx, mut fields) in raw.into_iter().enumerate() {
        let date = match fields.remove(date_column) {
            Some(FieldValue::Text(s)) => parse_event_date(&s)
                .with_context(|| format!("row {idx}: invalid {date_column}"))?,
            _ => bail!("row {idx}: missing {date_column}"),
        };
        rows.push(HistoricalRow {
            event_date: date,
            fields,
        });
    }

    rows.sort_by_key(|r| r.event_date);
    Ok(rows)
}

pub fn load_history(path: &Path, date_column: &str) -> anyhow::Result<Vec<HistoricalRow>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("data file not found: {}", path.display()))?;
    let rows = parse_history(&json, date_column)?;
    tracing::info!(path = %path.display(), rows = rows.len(), "loaded history");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_sorts_by_date() {
        let json = json!([
            {"BidDate": "2023-03-01", "BidAmount": 30.0, "Location": "NY"},
            {"BidDate": "2023-01-01T00:00:00Z", "BidAmount": 10.0, "Location": "NY"},
            {"BidDate": "2023-02-01 12:30:00", "BidAmount": 20.0, "Location": null},
        ])
        .to_string();

        let rows = parse_history(&json, DEFAULT_DATE_COLUMN).unwrap();
        let amounts: Vec<f64> = rows.iter().filter_map(|r| r.number("BidAmount")).collect();
        assert_eq!(amounts, vec![10.0, 20.0, 30.0]);
        assert!(rows[1].get("Location").is_none());
        assert!(rows[1].has_column("Location"));
    }

    #[test]
    fn boolean_outcomes_load_as_numbers() {
        let json = json!([
            {"BidDate": "2023-01-01", "WinStatus": true},
            {"BidDate": "2023-01-02", "WinStatus": false},
        ])
        .to_string();

        let rows = parse_history(&json, DEFAULT_DATE_COLUMN).unwrap();
        let wins: Vec<Option<f64>> = rows.iter().map(|r| r.number("WinStatus")).collect();
        assert_eq!(wins, vec![Some(1.0), Some(0.0)]);
    }

    #[test]
    fn rejects_rows_without_date() {
        let json = json!([{"BidAmount": 1.0}]).to_string();
        assert!(parse_history(&json, DEFAULT_DATE_COLUMN).is_err());

        let json = json!([{"BidDate": "yesterday"}]).to_string();
        assert!(parse_history(&json, DEFAULT_DATE_COLUMN).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_history(Path::new("/nonexistent/history.json"), DEFAULT_DATE_COLUMN)
            .unwrap_err();
        assert!(err.to_string().contains("data file not found"));
    }

    #[test]
    fn to_json_writes_date_and_nulls() {
        let row = HistoricalRow::new(NaiveDate::from_ymd_opt(2023, 1, 15).unwrap())
            .with("lag", FieldValue::Null)
            .with("x", 1.5);
        assert_eq!(
            row.to_json("BidDate"),
            json!({"BidDate": "2023-01-15", "lag": null, "x": 1.5})
        );
    }
}
