use anyhow::Context;
use bidfee_core::config::Settings;
use bidfee_core::external::cache::{load_cached, save_cached};
use bidfee_core::external::fred::FredClient;
use bidfee_core::external::{ExternalSeries, ExternalSeriesSource};
use bidfee_core::timeseries::{load_history, TimeSeriesFeatureBuilder};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub data_path: PathBuf,
    pub output: PathBuf,
    pub date_column: String,
    pub fred_series: Vec<String>,
    pub fred_cache: Option<PathBuf>,
}

/// Empty argument lists keep the builder defaults.
pub fn builder_from_args(
    group_keys: Vec<String>,
    targets: Vec<String>,
    windows: Vec<usize>,
    lags: Vec<usize>,
    win_column: Option<String>,
    no_win_rate: bool,
) -> TimeSeriesFeatureBuilder {
    let mut builder = TimeSeriesFeatureBuilder::default();
    if !group_keys.is_empty() {
        builder.group_keys = group_keys;
    }
    if !targets.is_empty() {
        builder.target_columns = targets;
    }
    if !windows.is_empty() {
        builder.windows = windows;
    }
    if !lags.is_empty() {
        builder.lag_steps = lags;
    }
    if win_column.is_some() {
        builder.win_column = win_column;
    }
    if no_win_rate {
        builder.win_column = None;
    }
    builder
}

/// Cached series first; ids missing from the cache come from `source` when one is available.
/// Series that cannot be obtained are skipped.
pub async fn resolve_series(
    wanted: &[String],
    cache: Option<&Path>,
    source: Option<&dyn ExternalSeriesSource>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> anyhow::Result<Vec<ExternalSeries>> {
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let cached = match cache {
        Some(path) => load_cached(path)?.unwrap_or_default(),
        None => Vec::new(),
    };

    let mut out = Vec::with_capacity(wanted.len());
    let mut fetched_any = false;
    for id in wanted {
        if let Some(series) = cached.iter().find(|s| &s.series_id == id) {
            out.push(series.clone());
            continue;
        }
        let Some(source) = source else {
            tracing::warn!(series_id = %id, "series not cached and no source configured; skipped");
            continue;
        };
        match source.fetch_series(id, start, end).await {
            Ok(series) => {
                fetched_any = true;
                out.push(series);
            }
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::warn!(
                    series_id = %id,
                    source = source.source_name(),
                    error = %err,
                    "series fetch failed; skipped"
                );
            }
        }
    }

    if fetched_any {
        if let Some(path) = cache {
            let mut merged = cached;
            for series in &out {
                merged.retain(|s| s.series_id != series.series_id);
                merged.push(series.clone());
            }
            save_cached(path, &merged)?;
        }
    }

    Ok(out)
}

pub async fn build_features(
    opts: &BuildOptions,
    builder: &TimeSeriesFeatureBuilder,
    settings: &Settings,
) -> anyhow::Result<()> {
    let rows = load_history(&opts.data_path, &opts.date_column)?;
    let start = rows.first().map(|r| r.event_date);
    let end = rows.last().map(|r| r.event_date);

    let client = if opts.fred_series.is_empty() {
        None
    } else {
        match FredClient::from_settings(settings) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "FRED client unavailable; using cached series only");
                None
            }
        }
    };

    let external = resolve_series(
        &opts.fred_series,
        opts.fred_cache.as_deref(),
        client.as_ref().map(|c| c as &dyn ExternalSeriesSource),
        start,
        end,
    )
    .await?;

    let dataset = builder.build(rows, &external)?;
    write_rows(&opts.output, &dataset.rows, &opts.date_column)?;

    tracing::info!(
        output = %opts.output.display(),
        rows = dataset.rows.len(),
        added_columns = dataset.added_columns.len(),
        "feature dataset written"
    );
    Ok(())
}

fn write_rows(
    path: &Path,
    rows: &[bidfee_core::timeseries::HistoricalRow],
    date_column: &str,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json: Vec<serde_json::Value> = rows.iter().map(|r| r.to_json(date_column)).collect();
    let text = serde_json::to_string_pretty(&json).context("serialize feature rows failed")?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

pub async fn fetch_series(
    settings: &Settings,
    series: &[String],
    cache: &Path,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let client = FredClient::from_settings(settings)?;

    let mut fetched = Vec::with_capacity(series.len());
    for id in series {
        fetched.push(client.fetch_series(id, start, end).await?);
    }

    let mut merged = load_cached(cache)?.unwrap_or_default();
    for s in &fetched {
        merged.retain(|c| c.series_id != s.series_id);
        merged.push(s.clone());
    }
    save_cached(cache, &merged)?;

    tracing::info!(cache = %cache.display(), series = fetched.len(), "series cache updated");
    Ok(())
}
