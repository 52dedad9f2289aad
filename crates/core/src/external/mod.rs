pub mod cache;
pub mod fred;
pub mod series;

pub use series::{ExternalSeries, Observation};

use chrono::NaiveDate;

#[async_trait::async_trait]
pub trait ExternalSeriesSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn fetch_series(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> anyhow::Result<ExternalSeries>;
}
