pub mod artifacts;
pub mod domain;
pub mod error;
pub mod external;
pub mod features;
pub mod model;
pub mod optimize;
pub mod storage;
pub mod timeseries;

pub use error::{BidError, Result};

pub mod config {
    use crate::artifacts::{ArtifactOptions, DEFAULT_ARTIFACTS_PATH};
    use crate::features::MissingMedianPolicy;
    use crate::optimize::GridParams;
    use anyhow::Context;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub artifacts_path: String,
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub fred_api_key: Option<String>,
        pub fred_base_url: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                artifacts_path: std::env::var("ARTIFACTS_PATH")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_ARTIFACTS_PATH.to_string()),
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                fred_api_key: std::env::var("FRED_API_KEY").ok(),
                fred_base_url: std::env::var("FRED_BASE_URL").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_fred_api_key(&self) -> anyhow::Result<&str> {
            self.fred_api_key
                .as_deref()
                .context("FRED_API_KEY is required")
        }
    }

    /// Grid and inference policy knobs. Unparseable values fall back to defaults.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct OptimizerSettings {
        pub grid: GridParams,
        pub artifacts: ArtifactOptions,
    }

    impl Default for OptimizerSettings {
        fn default() -> Self {
            Self {
                grid: GridParams::default(),
                artifacts: ArtifactOptions::default(),
            }
        }
    }

    impl OptimizerSettings {
        pub fn from_env() -> anyhow::Result<Self> {
            let mut out = Self::default();

            if let Some(v) = env_parse::<f64>("OPTIMIZER_RANGE_FRACTION") {
                out.grid.range_fraction = v;
            }
            if let Some(v) = env_parse::<usize>("OPTIMIZER_STEPS") {
                out.grid.steps = v;
            }
            if let Some(v) = env_parse::<f64>("FALLBACK_PROBABILITY") {
                out.grid.fallback_probability = v;
            }
            if let Some(v) = env_parse::<f64>("FEATURE_WARNING_RATIO") {
                out.grid.feature_warning_ratio = v;
            }
            out.artifacts.encoder_fallback = env_parse::<f64>("ENCODER_FALLBACK");
            if let Some(v) = env_parse::<f64>("MISSING_MEDIAN_DEFAULT") {
                out.artifacts.missing_median = MissingMedianPolicy::Default(v);
            }

            out.grid
                .validate()
                .context("invalid optimizer settings in environment")?;
            Ok(out)
        }
    }

    fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
        std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
    }
}
