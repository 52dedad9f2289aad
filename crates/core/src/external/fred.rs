use crate::config::Settings;
use crate::external::{ExternalSeries, ExternalSeriesSource, Observation};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.stlouisfed.org";
const OBSERVATIONS_PATH: &str = "/fred/series/observations";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationsResponse {
    pub observations: Vec<RawObservation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawObservation {
    pub date: NaiveDate,
    /// FRED sends values as strings and uses "." for missing.
    pub value: String,
}

/// Missing (".") and unparseable values are dropped.
pub fn into_series(series_id: &str, resp: ObservationsResponse) -> ExternalSeries {
    let observations = resp
        .observations
        .into_iter()
        .filter_map(|o| {
            let value = o.value.trim().parse::<f64>().ok()?;
            Some(Observation {
                date: o.date,
                value,
            })
        })
        .collect();
    ExternalSeries::new(series_id, observations)
}

#[derive(Debug, Clone)]
pub struct FredClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retries: u32,
}

impl FredClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings.require_fred_api_key()?.to_string();
        let base_url = settings
            .fred_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let timeout_secs = std::env::var("FRED_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("FRED_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES)
            .max(1);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build FRED http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            retries,
        })
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), OBSERVATIONS_PATH)
    }

    async fn fetch_once(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<ObservationsResponse> {
        let mut query = vec![
            ("series_id", series_id.to_string()),
            ("api_key", self.api_key.clone()),
            ("file_type", "json".to_string()),
        ];
        if let Some(start) = start {
            query.push(("observation_start", start.to_string()));
        }
        if let Some(end) = end {
            query.push(("observation_end", end.to_string()));
        }

        let res = self
            .http
            .get(self.url())
            .query(&query)
            .send()
            .await
            .context("FRED request failed")?;

        let status = res.status();
        let text = res.text().await.context("failed to read FRED response")?;
        if !status.is_success() {
            anyhow::bail!("FRED HTTP {status}: {text}");
        }

        serde_json::from_str::<ObservationsResponse>(&text)
            .with_context(|| format!("unexpected FRED response for {series_id}"))
    }
}

#[async_trait::async_trait]
impl ExternalSeriesSource for FredClient {
    fn source_name(&self) -> &'static str {
        "fred"
    }

    async fn fetch_series(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<ExternalSeries> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(series_id, start, end).await {
                Ok(resp) => {
                    let series = into_series(series_id, resp);
                    tracing::info!(series_id, observations = series.len(), "fetched FRED series");
                    return Ok(series);
                }
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        series_id,
                        attempt,
                        ?backoff,
                        error = %err,
                        "FRED fetch failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
