use anyhow::Context;
use bidfee_core::artifacts::Artifacts;
use bidfee_core::config::OptimizerSettings;
use bidfee_core::domain::{OpportunityRecord, Recommendation};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct Outcome {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    /// Set when the recommendation was computed but could not be stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OutcomeError {
    pub kind: &'static str,
    pub message: String,
}

/// Accepts a single record object or an array of them.
pub fn parse_records(json: &str) -> anyhow::Result<Vec<OpportunityRecord>> {
    let value: serde_json::Value = serde_json::from_str(json).context("input is not valid JSON")?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                serde_json::from_value(v)
                    .with_context(|| format!("record {i} is not a flat object"))
            })
            .collect(),
        other => Ok(vec![
            serde_json::from_value(other).context("record is not a flat object")?
        ]),
    }
}

/// Failing records are reported in the output; they do not stop the batch.
pub fn recommend_all(
    artifacts: &Artifacts,
    records: &[OpportunityRecord],
    optimizer: &OptimizerSettings,
) -> Vec<Outcome> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| match artifacts.optimize(record, &optimizer.grid) {
            Ok(rec) => Outcome {
                index,
                recommendation_id: None,
                recommendation: Some(rec),
                error: None,
                persist_error: None,
            },
            Err(err) => {
                tracing::warn!(index, kind = err.kind(), error = %err, "record rejected");
                Outcome {
                    index,
                    recommendation_id: None,
                    recommendation: None,
                    error: Some(OutcomeError {
                        kind: err.kind(),
                        message: err.to_string(),
                    }),
                    persist_error: None,
                }
            }
        })
        .collect()
}

/// Stores every computed recommendation. A failed write is recorded on its outcome and the
/// batch carries on.
pub async fn persist_outcomes<F, Fut>(outcomes: &mut [Outcome], mut persist: F)
where
    F: FnMut(usize, Recommendation) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<uuid::Uuid>>,
{
    for outcome in outcomes.iter_mut() {
        let Some(rec) = &outcome.recommendation else {
            continue;
        };
        match persist(outcome.index, rec.clone()).await {
            Ok(id) => outcome.recommendation_id = Some(id),
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(
                    index = outcome.index,
                    error = %err,
                    "persisting recommendation failed"
                );
                outcome.persist_error = Some(format!("{err:#}"));
            }
        }
    }
}

pub async fn run(
    input: &Path,
    artifacts_path: &Path,
    optimizer: &OptimizerSettings,
    pool: Option<&sqlx::PgPool>,
) -> anyhow::Result<Vec<Outcome>> {
    let artifacts = Artifacts::load(artifacts_path, optimizer.artifacts)?;

    let json = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let records = parse_records(&json)?;

    let mut outcomes = recommend_all(&artifacts, &records, optimizer);

    if let Some(pool) = pool {
        let records = &records;
        let version = artifacts.version.as_deref();
        persist_outcomes(&mut outcomes, |index, rec| async move {
            bidfee_core::storage::recommendations::persist_recommendation(
                pool,
                &records[index],
                &rec,
                version,
            )
            .await
        })
        .await;
    }

    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    let persist_failed = outcomes.iter().filter(|o| o.persist_error.is_some()).count();
    tracing::info!(
        records = records.len(),
        failed,
        persist_failed,
        persisted = pool.is_some(),
        "batch recommendation finished"
    );
    Ok(outcomes)
}
