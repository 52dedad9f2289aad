use serde::{Deserialize, Serialize};

/// One evaluated point of the fee grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeCandidate {
    pub fee: f64,
    pub win_prob: f64,
    pub expected_value: f64,
    /// Set when the probability is the fallback value rather than a model output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub model_type: String,
    pub features_present: usize,
    pub total_features: usize,
    #[serde(default)]
    pub fallback_candidates: usize,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub best_fee: f64,
    pub best_prob: f64,
    pub best_ev: f64,
    /// Ascending by fee.
    pub fee_curve: Vec<FeeCandidate>,
    pub diagnostics: Diagnostics,
}

impl Recommendation {
    pub fn is_degraded(&self) -> bool {
        self.diagnostics.fallback_candidates > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fallback_flag_only_serialized_when_set() {
        let genuine = FeeCandidate {
            fee: 100.0,
            win_prob: 0.5,
            expected_value: 50.0,
            fallback: false,
        };
        let degraded = FeeCandidate {
            fallback: true,
            ..genuine.clone()
        };

        assert_eq!(
            serde_json::to_value(&genuine).unwrap(),
            json!({"fee": 100.0, "win_prob": 0.5, "expected_value": 50.0})
        );
        assert_eq!(serde_json::to_value(&degraded).unwrap()["fallback"], json!(true));
    }
}
