use std::path::PathBuf;

/// Failure modes of the recommendation core.
///
/// `Validation` and `Optimization` reject a single request. `ArtifactLoad` is fatal at
/// startup. `Prediction` never escapes the optimizer: it is recovered per candidate and
/// reported through diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum BidError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("failed to load artifacts from {}: {detail}", path.display())]
    ArtifactLoad { path: PathBuf, detail: String },

    #[error("prediction failed: {0}")]
    Prediction(String),

    #[error("optimization failed: {0}")]
    Optimization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BidError {
    /// Stable identifier used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            BidError::Validation(_) => "validation_error",
            BidError::ArtifactLoad { .. } => "artifact_load_error",
            BidError::Prediction(_) => "prediction_error",
            BidError::Optimization(_) => "optimization_error",
            BidError::Config(_) => "config_error",
        }
    }

    pub(crate) fn artifact_load(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        BidError::ArtifactLoad {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(BidError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(
            BidError::artifact_load("/tmp/a.json", "missing").kind(),
            "artifact_load_error"
        );
        assert_eq!(BidError::Optimization("x".into()).kind(), "optimization_error");
    }

    #[test]
    fn artifact_load_message_names_path() {
        let err = BidError::artifact_load("/models/bundle.json", "not found");
        assert_eq!(
            err.to_string(),
            "failed to load artifacts from /models/bundle.json: not found"
        );
    }
}
