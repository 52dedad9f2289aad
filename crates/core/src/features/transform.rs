use crate::domain::{FieldValue, OpportunityRecord};
use crate::error::{BidError, Result};
use crate::features::encoder::CategoricalEncoders;
use std::collections::BTreeMap;

pub const DEFAULT_REQUIRED_FIELD: &str = "ZipCode";
/// Field holding the opportunity's current fee; also the key of the global median fee.
pub const CURRENT_FEE_FIELD: &str = "median_BidFee";
/// Most recent fee seen for the opportunity's group.
pub const LAST_FEE_FIELD: &str = "lag_1";

/// Feature name -> median computed at training time.
pub type TrainMedians = BTreeMap<String, f64>;

/// What to do with a feature that is still undefined after coercion and has no median.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MissingMedianPolicy {
    Fail,
    Default(f64),
}

/// Model input, aligned with the artifact feature list.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

/// Values that shadow record fields during a transform. The record itself is untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldOverrides(BTreeMap<String, FieldValue>);

impl FieldOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }
}

#[derive(Debug, Clone)]
pub struct FeatureTransformer {
    features: Vec<String>,
    encoders: CategoricalEncoders,
    medians: TrainMedians,
    required_fields: Vec<String>,
    fee_fields: Vec<String>,
    missing_median: MissingMedianPolicy,
}

impl FeatureTransformer {
    pub fn new(
        features: Vec<String>,
        encoders: CategoricalEncoders,
        medians: TrainMedians,
    ) -> Self {
        Self {
            features,
            encoders,
            medians,
            required_fields: vec![DEFAULT_REQUIRED_FIELD.to_string()],
            fee_fields: vec![CURRENT_FEE_FIELD.to_string(), LAST_FEE_FIELD.to_string()],
            missing_median: MissingMedianPolicy::Fail,
        }
    }

    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }

    pub fn with_fee_fields(mut self, fields: Vec<String>) -> Self {
        self.fee_fields = fields;
        self
    }

    pub fn with_missing_median_policy(mut self, policy: MissingMedianPolicy) -> Self {
        self.missing_median = policy;
        self
    }

    pub fn feature_list(&self) -> &[String] {
        &self.features
    }

    pub fn encoders(&self) -> &CategoricalEncoders {
        &self.encoders
    }

    pub fn medians(&self) -> &TrainMedians {
        &self.medians
    }

    pub fn missing_median_policy(&self) -> MissingMedianPolicy {
        self.missing_median
    }

    /// Categorical features in feature-list order.
    pub fn categorical_features(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| self.encoders.contains_key(f.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Non-categorical features that would hit the missing-median policy if undefined.
    pub fn features_without_median(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| !self.encoders.contains_key(f.as_str()))
            .filter(|f| !self.medians.get(f.as_str()).is_some_and(|m| m.is_finite()))
            .map(String::as_str)
            .collect()
    }

    /// Overrides that inject a hypothetical fee into every fee-bearing field.
    pub fn fee_overrides(&self, fee: f64) -> FieldOverrides {
        self.fee_fields
            .iter()
            .fold(FieldOverrides::new(), |acc, f| acc.set(f.clone(), fee))
    }

    pub fn validate(&self, record: &OpportunityRecord) -> Result<()> {
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|f| !record.has_value(f))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BidError::Validation(format!(
                "missing required field(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Number of declared features that carry a non-null value in the record.
    pub fn features_present(&self, record: &OpportunityRecord) -> usize {
        self.features.iter().filter(|f| record.has_value(f)).count()
    }

    pub fn transform(
        &self,
        record: &OpportunityRecord,
        overrides: Option<&FieldOverrides>,
    ) -> Result<FeatureVector> {
        self.validate(record)?;

        let mut out = Vec::with_capacity(self.features.len());
        for name in &self.features {
            let raw = overrides
                .and_then(|o| o.get(name))
                .or_else(|| record.get(name));

            let value = match self.encoders.get(name) {
                Some(encoder) => Some(encoder.encode(raw)),
                None => raw.and_then(FieldValue::as_number),
            };

            let value = match value {
                Some(v) if v.is_finite() => v,
                _ => self.impute(name)?,
            };
            out.push(value);
        }

        Ok(FeatureVector(out))
    }

    fn impute(&self, feature: &str) -> Result<f64> {
        if let Some(m) = self.medians.get(feature).copied().filter(|m| m.is_finite()) {
            return Ok(m);
        }
        match self.missing_median {
            MissingMedianPolicy::Default(v) => Ok(v),
            MissingMedianPolicy::Fail => Err(BidError::Config(format!(
                "feature `{feature}` is undefined and has no training median"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::encoder::{EncoderMap, MISSING_CATEGORY};

    fn transformer() -> FeatureTransformer {
        let mut encoders = CategoricalEncoders::new();
        encoders.insert(
            "Market".to_string(),
            [
                ("Urban".to_string(), 0.6),
                (MISSING_CATEGORY.to_string(), 0.2),
            ]
            .into_iter()
            .collect::<EncoderMap>(),
        );

        let medians: TrainMedians = [
            ("DistanceInMiles".to_string(), 12.0),
            (CURRENT_FEE_FIELD.to_string(), 2500.0),
            (LAST_FEE_FIELD.to_string(), 2400.0),
        ]
        .into_iter()
        .collect();

        FeatureTransformer::new(
            vec![
                "DistanceInMiles".to_string(),
                "Market".to_string(),
                CURRENT_FEE_FIELD.to_string(),
                LAST_FEE_FIELD.to_string(),
            ],
            encoders,
            medians,
        )
    }

    #[test]
    fn rejects_record_without_required_field() {
        let t = transformer();
        let err = t.transform(&OpportunityRecord::new(), None).unwrap_err();
        assert!(matches!(err, BidError::Validation(_)));

        let null_zip = OpportunityRecord::new().with("ZipCode", FieldValue::Null);
        assert!(t.transform(&null_zip, None).is_err());
    }

    #[test]
    fn encodes_coerces_and_imputes_in_feature_order() {
        let t = transformer();
        let record = OpportunityRecord::new()
            .with("ZipCode", "12345")
            .with("DistanceInMiles", "7.5")
            .with("Market", "Urban")
            .with(LAST_FEE_FIELD, "not a number");

        let x = t.transform(&record, None).unwrap();
        assert_eq!(x.as_slice(), &[7.5, 0.6, 2500.0, 2400.0]);
    }

    #[test]
    fn missing_category_uses_sentinel() {
        let t = transformer();
        let record = OpportunityRecord::new().with("ZipCode", "12345");
        let x = t.transform(&record, None).unwrap();
        assert_eq!(x.as_slice()[1], 0.2);
    }

    #[test]
    fn fee_override_shadows_fields_without_mutating_record() {
        let t = transformer();
        let record = OpportunityRecord::new()
            .with("ZipCode", "12345")
            .with(CURRENT_FEE_FIELD, 1000.0);
        let before = record.clone();

        let overrides = t.fee_overrides(3000.0);
        let x = t.transform(&record, Some(&overrides)).unwrap();

        assert_eq!(&x.as_slice()[2..], &[3000.0, 3000.0]);
        assert_eq!(record, before);
    }

    #[test]
    fn missing_median_fails_fast_by_default() {
        let t = FeatureTransformer::new(
            vec!["Unseen".to_string()],
            CategoricalEncoders::new(),
            TrainMedians::new(),
        );
        let record = OpportunityRecord::new().with("ZipCode", "1");

        assert_eq!(t.features_without_median(), vec!["Unseen"]);
        assert!(matches!(
            t.transform(&record, None).unwrap_err(),
            BidError::Config(_)
        ));

        let t = t.with_missing_median_policy(MissingMedianPolicy::Default(0.0));
        assert_eq!(t.transform(&record, None).unwrap().as_slice(), &[0.0]);
    }

    #[test]
    fn counts_present_features() {
        let t = transformer();
        let record = OpportunityRecord::new()
            .with("ZipCode", "12345")
            .with("Market", "Urban")
            .with("DistanceInMiles", FieldValue::Null);
        assert_eq!(t.features_present(&record), 1);
        assert_eq!(t.categorical_features(), vec!["Market"]);
    }
}
