//! Expected-value grid search over candidate fees.

use crate::domain::{Diagnostics, FeeCandidate, OpportunityRecord, Recommendation};
use crate::error::{BidError, Result};
use crate::features::transform::CURRENT_FEE_FIELD;
use crate::features::FeatureTransformer;
use crate::model::{win_probability, ProbabilityModel, ValueModel, WinProbability};

pub const DEFAULT_RANGE_FRACTION: f64 = 0.2;
pub const DEFAULT_STEPS: usize = 60;
/// Upper bound on grid size accepted from callers.
pub const MAX_STEPS: usize = 10_000;
pub const DEFAULT_FALLBACK_PROBABILITY: f64 = 0.1;
pub const DEFAULT_FEATURE_WARNING_RATIO: f64 = 0.8;

pub const MODEL_TYPE_CLASSIFIER: &str = "classifier";
pub const MODEL_TYPE_REGRESSOR_FALLBACK: &str = "regressor_fallback";

const SPARSE_FEATURES_WARNING: &str = "Many features missing; predictions may be less reliable";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridParams {
    /// Half-width of the grid relative to the baseline fee, in (0, 1).
    pub range_fraction: f64,
    pub steps: usize,
    /// Probability used when the model cannot produce one.
    pub fallback_probability: f64,
    /// Below this share of declared features present, diagnostics carry a warning.
    pub feature_warning_ratio: f64,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            range_fraction: DEFAULT_RANGE_FRACTION,
            steps: DEFAULT_STEPS,
            fallback_probability: DEFAULT_FALLBACK_PROBABILITY,
            feature_warning_ratio: DEFAULT_FEATURE_WARNING_RATIO,
        }
    }
}

impl GridParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.range_fraction > 0.0 && self.range_fraction < 1.0) {
            return Err(BidError::Validation(format!(
                "range fraction must be in (0, 1) (got {})",
                self.range_fraction
            )));
        }
        if !(2..=MAX_STEPS).contains(&self.steps) {
            return Err(BidError::Validation(format!(
                "steps must be in [2, {MAX_STEPS}] (got {})",
                self.steps
            )));
        }
        if !(0.0..=1.0).contains(&self.fallback_probability) {
            return Err(BidError::Config(format!(
                "fallback probability must be in [0, 1] (got {})",
                self.fallback_probability
            )));
        }
        Ok(())
    }
}

/// Current fee on the record if positive, otherwise the global median fee from training.
pub fn baseline_fee(record: &OpportunityRecord, transformer: &FeatureTransformer) -> Result<f64> {
    if let Some(fee) = record.number(CURRENT_FEE_FIELD).filter(|f| *f > 0.0) {
        return Ok(fee);
    }

    match transformer.medians().get(CURRENT_FEE_FIELD).copied() {
        Some(median) if median.is_finite() && median > 0.0 => Ok(median),
        _ => Err(BidError::Optimization(
            "no positive current fee on the record and no positive global median fee".into(),
        )),
    }
}

/// `steps` evenly spaced values from `low` to `high`, both endpoints exact.
pub fn fee_grid(low: f64, high: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![low],
        _ => {
            let last = steps - 1;
            (0..steps)
                .map(|i| {
                    if i == last {
                        high
                    } else {
                        low + (high - low) * (i as f64) / (last as f64)
                    }
                })
                .collect()
        }
    }
}

/// Highest expected value wins; among equal expected values the lowest fee wins.
/// Independent of the order of `curve`.
pub fn select_best(curve: &[FeeCandidate]) -> Option<&FeeCandidate> {
    curve.iter().fold(None, |best, c| match best {
        Some(b) if !is_better(c, b) => Some(b),
        _ => Some(c),
    })
}

fn is_better(candidate: &FeeCandidate, incumbent: &FeeCandidate) -> bool {
    candidate.expected_value > incumbent.expected_value
        || (candidate.expected_value == incumbent.expected_value && candidate.fee < incumbent.fee)
}

pub fn optimize(
    record: &OpportunityRecord,
    transformer: &FeatureTransformer,
    model: Option<&dyn ProbabilityModel>,
    params: &GridParams,
) -> Result<Recommendation> {
    params.validate()?;
    transformer.validate(record)?;

    let baseline = baseline_fee(record, transformer)?;
    let low = baseline * (1.0 - params.range_fraction);
    let high = baseline * (1.0 + params.range_fraction);
    if !(low.is_finite() && high.is_finite() && low < high) {
        return Err(BidError::Optimization(format!(
            "baseline fee {baseline} does not yield a usable grid [{low}, {high}]"
        )));
    }
    let grid = fee_grid(low, high, params.steps);

    let mut curve = Vec::with_capacity(grid.len());
    let mut first_fallback_reason: Option<String> = None;
    for fee in grid {
        let overrides = transformer.fee_overrides(fee);
        let x = transformer.transform(record, Some(&overrides))?;

        let prob = match model {
            Some(m) => win_probability(m, &x, params.fallback_probability),
            None => WinProbability::Fallback {
                value: params.fallback_probability,
                reason: "no classifier loaded".into(),
            },
        };
        if let WinProbability::Fallback { reason, .. } = &prob {
            if first_fallback_reason.is_none() {
                first_fallback_reason = Some(reason.clone());
            }
        }

        let p = prob.value();
        curve.push(FeeCandidate {
            fee,
            win_prob: p,
            expected_value: p * fee,
            fallback: prob.is_fallback(),
        });
    }

    let fallback_candidates = curve.iter().filter(|c| c.fallback).count();
    if let Some(reason) = &first_fallback_reason {
        tracing::warn!(
            fallback_candidates,
            steps = params.steps,
            reason = %reason,
            "win probability fell back for some candidates"
        );
    }

    let total_features = transformer.feature_list().len();
    let features_present = transformer.features_present(record);

    let mut warnings = Vec::new();
    if (features_present as f64) < (total_features as f64) * params.feature_warning_ratio {
        warnings.push(SPARSE_FEATURES_WARNING.to_string());
    }
    if model.is_some() && fallback_candidates > 0 {
        warnings.push(format!(
            "{fallback_candidates} of {} candidates used the fallback probability",
            curve.len()
        ));
    }

    let best = select_best(&curve)
        .cloned()
        .ok_or_else(|| BidError::Optimization("fee grid is empty".into()))?;

    let model_type = if model.is_some() {
        MODEL_TYPE_CLASSIFIER
    } else {
        MODEL_TYPE_REGRESSOR_FALLBACK
    };

    tracing::debug!(
        baseline,
        best_fee = best.fee,
        best_ev = best.expected_value,
        model_type,
        "fee grid evaluated"
    );

    Ok(Recommendation {
        best_fee: best.fee,
        best_prob: best.win_prob,
        best_ev: best.expected_value,
        fee_curve: curve,
        diagnostics: Diagnostics {
            model_type: model_type.to_string(),
            features_present,
            total_features,
            fallback_candidates,
            warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
        },
    })
}

/// Single-point prediction for a record as submitted, without a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub win_probability: WinProbability,
    pub predicted_fee: Option<f64>,
}

pub fn score(
    record: &OpportunityRecord,
    transformer: &FeatureTransformer,
    classifier: Option<&dyn ProbabilityModel>,
    regressor: Option<&dyn ValueModel>,
    fallback_probability: f64,
) -> Result<Score> {
    let x = transformer.transform(record, None)?;

    let win_probability = match classifier {
        Some(m) => win_probability(m, &x, fallback_probability),
        None => WinProbability::Fallback {
            value: fallback_probability,
            reason: "no classifier loaded".into(),
        },
    };
    let predicted_fee = regressor.map(|m| m.predict_value(&x)).transpose()?;

    Ok(Score {
        win_probability,
        predicted_fee,
    })
}
