//! Opaque predictor seams plus the linear models shipped in artifact bundles.

use crate::error::{BidError, Result};
use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};

/// Predicts the probability that a bid described by the feature vector wins.
/// Implementations must tolerate concurrent read-only calls.
pub trait ProbabilityModel: Send + Sync {
    fn name(&self) -> &str;

    fn n_features(&self) -> usize;

    fn predict_proba(&self, x: &FeatureVector) -> Result<f64>;
}

/// Predicts a numeric value (e.g. the expected bid fee) for a feature vector.
pub trait ValueModel: Send + Sync {
    fn name(&self) -> &str;

    fn n_features(&self) -> usize;

    fn predict_value(&self, x: &FeatureVector) -> Result<f64>;
}

/// Win probability tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum WinProbability {
    Predicted(f64),
    Fallback { value: f64, reason: String },
}

impl WinProbability {
    pub fn value(&self) -> f64 {
        match self {
            WinProbability::Predicted(p) => *p,
            WinProbability::Fallback { value, .. } => *value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, WinProbability::Fallback { .. })
    }
}

/// Runs the model and clips its output to [0, 1]. Errors and non-finite outputs become
/// `Fallback` with the given probability.
pub fn win_probability(
    model: &dyn ProbabilityModel,
    x: &FeatureVector,
    fallback: f64,
) -> WinProbability {
    match model.predict_proba(x) {
        Ok(p) if p.is_finite() => WinProbability::Predicted(p.clamp(0.0, 1.0)),
        Ok(p) => WinProbability::Fallback {
            value: fallback,
            reason: format!("{} returned non-finite probability {p}", model.name()),
        },
        Err(err) => WinProbability::Fallback {
            value: fallback,
            reason: err.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    /// Plain linear regression.
    Linear,
    /// Logistic regression; output is a probability.
    Logistic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    #[serde(rename = "kind")]
    pub link: Link,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    pub fn logistic(intercept: f64, coefficients: Vec<f64>) -> Self {
        Self {
            link: Link::Logistic,
            intercept,
            coefficients,
        }
    }

    pub fn linear(intercept: f64, coefficients: Vec<f64>) -> Self {
        Self {
            link: Link::Linear,
            intercept,
            coefficients,
        }
    }

    fn score(&self, x: &FeatureVector) -> Result<f64> {
        if x.len() != self.coefficients.len() {
            return Err(BidError::Prediction(format!(
                "feature vector has {} values, model expects {}",
                x.len(),
                self.coefficients.len()
            )));
        }
        let z = self
            .coefficients
            .iter()
            .zip(x.as_slice())
            .fold(self.intercept, |acc, (w, v)| acc + w * v);
        Ok(match self.link {
            Link::Linear => z,
            Link::Logistic => sigmoid(z),
        })
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

impl ProbabilityModel for LinearModel {
    fn name(&self) -> &str {
        match self.link {
            Link::Linear => "linear",
            Link::Logistic => "logistic",
        }
    }

    fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    fn predict_proba(&self, x: &FeatureVector) -> Result<f64> {
        self.score(x)
    }
}

impl ValueModel for LinearModel {
    fn name(&self) -> &str {
        ProbabilityModel::name(self)
    }

    fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    fn predict_value(&self, x: &FeatureVector) -> Result<f64> {
        self.score(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OpportunityRecord;
    use crate::features::{CategoricalEncoders, FeatureTransformer, TrainMedians};
    use serde_json::json;

    fn vector(values: &[f64]) -> FeatureVector {
        let names: Vec<String> = (0..values.len()).map(|i| format!("f{i}")).collect();
        let record = names
            .iter()
            .zip(values)
            .fold(OpportunityRecord::new().with("ZipCode", "1"), |r, (n, v)| {
                r.with(n.clone(), *v)
            });
        FeatureTransformer::new(names, CategoricalEncoders::new(), TrainMedians::new())
            .transform(&record, None)
            .unwrap()
    }

    struct Broken;

    impl ProbabilityModel for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn n_features(&self) -> usize {
            1
        }

        fn predict_proba(&self, _x: &FeatureVector) -> Result<f64> {
            Err(BidError::Prediction("model exploded".into()))
        }
    }

    #[test]
    fn logistic_output_is_a_probability() {
        let m = LinearModel::logistic(0.0, vec![1.0]);
        assert_eq!(m.predict_proba(&vector(&[0.0])).unwrap(), 0.5);
        let p = m.predict_proba(&vector(&[-800.0])).unwrap();
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn dimension_mismatch_is_a_prediction_error() {
        let m = LinearModel::linear(1.0, vec![1.0, 2.0]);
        assert!(matches!(
            m.predict_value(&vector(&[1.0])).unwrap_err(),
            BidError::Prediction(_)
        ));
    }

    #[test]
    fn linear_probability_is_clipped() {
        let m = LinearModel::linear(0.0, vec![1.0]);
        assert_eq!(win_probability(&m, &vector(&[3.0]), 0.1), WinProbability::Predicted(1.0));
        assert_eq!(win_probability(&m, &vector(&[-3.0]), 0.1), WinProbability::Predicted(0.0));
    }

    #[test]
    fn failure_is_tagged_as_fallback() {
        let p = win_probability(&Broken, &vector(&[1.0]), 0.1);
        assert!(p.is_fallback());
        assert_eq!(p.value(), 0.1);
    }

    #[test]
    fn deserializes_bundle_shape() {
        let m: LinearModel = serde_json::from_value(json!({
            "kind": "logistic",
            "intercept": -1.0,
            "coefficients": [0.5, 0.25],
        }))
        .unwrap();
        assert_eq!(m.link, Link::Logistic);
        assert_eq!(ProbabilityModel::n_features(&m), 2);
    }
}
