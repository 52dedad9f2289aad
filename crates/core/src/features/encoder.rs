use crate::domain::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Category used for null or absent values. Training encodes missing values under the
/// same key, so it usually has its own statistic.
pub const MISSING_CATEGORY: &str = "MISSING";

/// Value returned for categories never seen during training.
pub const DEFAULT_UNSEEN_FALLBACK: f64 = 0.0;

/// Immutable category -> statistic lookup for one categorical feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderMap {
    values: BTreeMap<String, f64>,
    #[serde(default = "default_fallback")]
    fallback: f64,
}

fn default_fallback() -> f64 {
    DEFAULT_UNSEEN_FALLBACK
}

impl EncoderMap {
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self {
            values,
            fallback: DEFAULT_UNSEEN_FALLBACK,
        }
    }

    pub fn with_fallback(mut self, fallback: f64) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn fallback(&self) -> f64 {
        self.fallback
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Never fails: missing values map to `MISSING_CATEGORY`, unseen categories to the
    /// fallback.
    pub fn encode(&self, value: Option<&FieldValue>) -> f64 {
        let category = value.and_then(FieldValue::category);
        let key = category.as_deref().unwrap_or(MISSING_CATEGORY);
        self.values.get(key).copied().unwrap_or(self.fallback)
    }

    pub fn is_known(&self, category: &str) -> bool {
        self.values.contains_key(category)
    }
}

impl FromIterator<(String, f64)> for EncoderMap {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Encoders keyed by feature name.
pub type CategoricalEncoders = BTreeMap<String, EncoderMap>;

#[cfg(test)]
mod tests {
    use super::*;

    fn market_encoder() -> EncoderMap {
        [
            ("Urban".to_string(), 0.42),
            ("Rural".to_string(), 0.17),
            (MISSING_CATEGORY.to_string(), 0.05),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn known_category_uses_statistic() {
        let enc = market_encoder();
        assert_eq!(enc.encode(Some(&FieldValue::from("Urban"))), 0.42);
    }

    #[test]
    fn null_and_absent_use_missing_sentinel() {
        let enc = market_encoder();
        assert_eq!(enc.encode(None), 0.05);
        assert_eq!(enc.encode(Some(&FieldValue::Null)), 0.05);
    }

    #[test]
    fn unseen_category_uses_fallback() {
        let enc = market_encoder();
        assert_eq!(enc.encode(Some(&FieldValue::from("Suburban"))), DEFAULT_UNSEEN_FALLBACK);

        let enc = enc.with_fallback(-1.0);
        assert_eq!(enc.encode(Some(&FieldValue::from("Suburban"))), -1.0);
    }

    #[test]
    fn missing_without_sentinel_entry_falls_back() {
        let enc: EncoderMap = [("A".to_string(), 1.0)].into_iter().collect();
        assert_eq!(enc.encode(None), DEFAULT_UNSEEN_FALLBACK);
    }

    #[test]
    fn deserializes_without_explicit_fallback() {
        let enc: EncoderMap =
            serde_json::from_value(serde_json::json!({"values": {"A": 2.0}})).unwrap();
        assert_eq!(enc.fallback(), DEFAULT_UNSEEN_FALLBACK);
        assert!(enc.is_known("A"));
    }
}
