use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single raw field value as it arrives from JSON. Booleans read as 1 / 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        WireValue::deserialize(deserializer).map(FieldValue::from)
    }
}

impl From<WireValue> for FieldValue {
    fn from(v: WireValue) -> Self {
        match v {
            WireValue::Null => FieldValue::Null,
            WireValue::Bool(b) => FieldValue::from(b),
            WireValue::Number(n) => FieldValue::Number(n),
            WireValue::Text(s) => FieldValue::Text(s),
        }
    }
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric coercion: numbers pass through, strings are parsed after trimming.
    /// Anything that does not yield a finite number is undefined.
    pub fn as_number(&self) -> Option<f64> {
        let v = match self {
            FieldValue::Null => return None,
            FieldValue::Number(n) => *n,
            FieldValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        v.is_finite().then_some(v)
    }

    /// String form used for categorical lookups. Integral numbers render without a
    /// fractional part so `12345` and `"12345"` hit the same category.
    pub fn category(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            FieldValue::Number(n) => Some(n.to_string()),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Number(if v { 1.0 } else { 0.0 })
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Number(v as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Flat key -> value mapping describing one opportunity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpportunityRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl OpportunityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Raw lookup; `Some(FieldValue::Null)` means the key is present but null.
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Lookup that treats explicit nulls as absent.
    pub fn value(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(FieldValue::as_number)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, FieldValue)> for OpportunityRecord {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
