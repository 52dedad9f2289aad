//! Artifact bundle loading and the process-wide read-only snapshot.

use crate::domain::{OpportunityRecord, Recommendation};
use crate::error::{BidError, Result};
use crate::features::{CategoricalEncoders, FeatureTransformer, MissingMedianPolicy, TrainMedians};
use crate::model::{LinearModel, ProbabilityModel, ValueModel};
use crate::optimize::{
    self, GridParams, Score, MODEL_TYPE_CLASSIFIER, MODEL_TYPE_REGRESSOR_FALLBACK,
};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_ARTIFACTS_PATH: &str = "models/bid_recommendation_artifacts.json";

/// On-disk form of the trained artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    #[serde(default)]
    pub version: Option<String>,
    /// Model feature order. Never reordered.
    pub features: Vec<String>,
    #[serde(default)]
    pub encoders: CategoricalEncoders,
    pub train_medians: TrainMedians,
    #[serde(default)]
    pub classifier: Option<LinearModel>,
    #[serde(default)]
    pub regressor: Option<LinearModel>,
}

impl ArtifactBundle {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BidError::artifact_load(path, format!("unreadable: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| BidError::artifact_load(path, format!("invalid bundle: {e}")))
    }

    /// Structural checks that would otherwise surface as per-request failures.
    pub fn validate(&self, missing_median: MissingMedianPolicy) -> std::result::Result<(), String> {
        if self.features.is_empty() {
            return Err("feature list is empty".into());
        }

        let mut seen = BTreeSet::new();
        if let Some(dup) = self.features.iter().find(|f| !seen.insert(f.as_str())) {
            return Err(format!("duplicate feature `{dup}`"));
        }

        for (role, model) in [("classifier", &self.classifier), ("regressor", &self.regressor)] {
            if let Some(m) = model {
                if m.coefficients.len() != self.features.len() {
                    return Err(format!(
                        "{role} has {} coefficients for {} features",
                        m.coefficients.len(),
                        self.features.len()
                    ));
                }
            }
        }

        if missing_median == MissingMedianPolicy::Fail {
            let without: Vec<&str> = self
                .features
                .iter()
                .filter(|f| !self.encoders.contains_key(f.as_str()))
                .filter(|f| !self.train_medians.get(f.as_str()).is_some_and(|m| m.is_finite()))
                .map(String::as_str)
                .collect();
            if !without.is_empty() {
                return Err(format!(
                    "no training median for feature(s): {}",
                    without.join(", ")
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArtifactOptions {
    /// Replaces every encoder's unseen-category fallback when set.
    pub encoder_fallback: Option<f64>,
    pub missing_median: MissingMedianPolicy,
}

impl Default for ArtifactOptions {
    fn default() -> Self {
        Self {
            encoder_fallback: None,
            missing_median: MissingMedianPolicy::Fail,
        }
    }
}

/// A loaded, validated artifact set. Immutable once built.
pub struct Artifacts {
    pub version: Option<String>,
    pub source: PathBuf,
    transformer: FeatureTransformer,
    classifier: Option<Arc<dyn ProbabilityModel>>,
    regressor: Option<Arc<dyn ValueModel>>,
}

impl std::fmt::Debug for Artifacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifacts")
            .field("version", &self.version)
            .field("source", &self.source)
            .field("features", &self.transformer.feature_list().len())
            .field("model_type", &self.model_type())
            .finish()
    }
}

impl Artifacts {
    pub fn from_bundle(
        bundle: ArtifactBundle,
        source: &Path,
        opts: ArtifactOptions,
    ) -> Result<Self> {
        bundle
            .validate(opts.missing_median)
            .map_err(|detail| BidError::artifact_load(source, detail))?;

        let ArtifactBundle {
            version,
            features,
            mut encoders,
            train_medians,
            classifier,
            regressor,
        } = bundle;

        if let Some(fallback) = opts.encoder_fallback {
            for encoder in encoders.values_mut() {
                *encoder = encoder.clone().with_fallback(fallback);
            }
        }

        let transformer = FeatureTransformer::new(features, encoders, train_medians)
            .with_missing_median_policy(opts.missing_median);

        Ok(Self {
            version,
            source: source.to_path_buf(),
            transformer,
            classifier: classifier.map(|m| Arc::new(m) as Arc<dyn ProbabilityModel>),
            regressor: regressor.map(|m| Arc::new(m) as Arc<dyn ValueModel>),
        })
    }

    pub fn load(path: &Path, opts: ArtifactOptions) -> Result<Self> {
        let bundle = ArtifactBundle::load(path)?;
        let artifacts = Self::from_bundle(bundle, path, opts)?;
        tracing::info!(
            path = %path.display(),
            version = artifacts.version.as_deref().unwrap_or("unversioned"),
            features = artifacts.transformer.feature_list().len(),
            model_type = artifacts.model_type(),
            "artifacts loaded"
        );
        Ok(artifacts)
    }

    pub fn transformer(&self) -> &FeatureTransformer {
        &self.transformer
    }

    pub fn classifier(&self) -> Option<&dyn ProbabilityModel> {
        self.classifier.as_deref()
    }

    pub fn regressor(&self) -> Option<&dyn ValueModel> {
        self.regressor.as_deref()
    }

    pub fn model_type(&self) -> &'static str {
        if self.classifier.is_some() {
            MODEL_TYPE_CLASSIFIER
        } else {
            MODEL_TYPE_REGRESSOR_FALLBACK
        }
    }

    pub fn optimize(
        &self,
        record: &OpportunityRecord,
        params: &GridParams,
    ) -> Result<Recommendation> {
        optimize::optimize(record, &self.transformer, self.classifier(), params)
    }

    pub fn score(&self, record: &OpportunityRecord, fallback_probability: f64) -> Result<Score> {
        optimize::score(
            record,
            &self.transformer,
            self.classifier(),
            self.regressor(),
            fallback_probability,
        )
    }
}

/// Current artifact snapshot. Readers get an `Arc` and keep a consistent set for the
/// whole request even if a reload swaps in a new one meanwhile.
pub struct ArtifactStore {
    current: ArcSwap<Artifacts>,
}

impl ArtifactStore {
    pub fn new(artifacts: Artifacts) -> Self {
        Self {
            current: ArcSwap::from_pointee(artifacts),
        }
    }

    pub fn snapshot(&self) -> Arc<Artifacts> {
        self.current.load_full()
    }

    pub fn replace(&self, artifacts: Artifacts) -> Arc<Artifacts> {
        let next = Arc::new(artifacts);
        self.current.store(Arc::clone(&next));
        next
    }

    /// Loads a fresh set and swaps it in. On failure the current set stays active.
    pub fn reload_from(&self, path: &Path, opts: ArtifactOptions) -> Result<Arc<Artifacts>> {
        match Artifacts::load(path, opts) {
            Ok(artifacts) => Ok(self.replace(artifacts)),
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "artifact reload failed; keeping current set"
                );
                Err(err)
            }
        }
    }
}
