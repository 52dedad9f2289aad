use crate::domain::{Diagnostics, FeeCandidate, OpportunityRecord, Recommendation};
use crate::features::transform::DEFAULT_REQUIRED_FIELD;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

const CURVE_INSERT_BATCH: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct StoredRecommendation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub artifacts_version: Option<String>,
    pub record: serde_json::Value,
    pub recommendation: Recommendation,
}

fn to_i32(n: usize, what: &str) -> anyhow::Result<i32> {
    i32::try_from(n).with_context(|| format!("{what} out of range: {n}"))
}

pub async fn persist_recommendation(
    pool: &sqlx::PgPool,
    record: &OpportunityRecord,
    recommendation: &Recommendation,
    artifacts_version: Option<&str>,
) -> anyhow::Result<Uuid> {
    anyhow::ensure!(
        !recommendation.fee_curve.is_empty(),
        "recommendation must carry a fee curve"
    );

    let id = Uuid::new_v4();
    let diag = &recommendation.diagnostics;
    let record_json = serde_json::to_value(record).context("serialize record failed")?;
    let zip_code = record
        .value(DEFAULT_REQUIRED_FIELD)
        .and_then(|v| v.category());

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    sqlx::query(
        "INSERT INTO fee_recommendations \
         (id, zip_code, artifacts_version, model_type, best_fee, best_prob, best_ev, \
          features_present, total_features, fallback_candidates, warning, record) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .persistent(false)
    .bind(id)
    .bind(zip_code)
    .bind(artifacts_version)
    .bind(&diag.model_type)
    .bind(recommendation.best_fee)
    .bind(recommendation.best_prob)
    .bind(recommendation.best_ev)
    .bind(to_i32(diag.features_present, "features_present")?)
    .bind(to_i32(diag.total_features, "total_features")?)
    .bind(to_i32(diag.fallback_candidates, "fallback_candidates")?)
    .bind(&diag.warning)
    .bind(record_json)
    .execute(&mut *tx)
    .await
    .context("insert fee_recommendations failed")?;

    let indexed: Vec<(i32, &FeeCandidate)> = recommendation
        .fee_curve
        .iter()
        .enumerate()
        .map(|(i, c)| Ok((to_i32(i, "curve index")?, c)))
        .collect::<anyhow::Result<_>>()?;

    for chunk in indexed.chunks(CURVE_INSERT_BATCH) {
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO fee_curve_points \
             (recommendation_id, idx, fee, win_prob, expected_value, fallback) ",
        );
        qb.push_values(chunk, |mut b, (idx, c)| {
            b.push_bind(id)
                .push_bind(*idx)
                .push_bind(c.fee)
                .push_bind(c.win_prob)
                .push_bind(c.expected_value)
                .push_bind(c.fallback);
        });
        qb.build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch insert fee_curve_points failed")?;
    }

    tx.commit().await.context("commit transaction failed")?;

    tracing::debug!(%id, points = recommendation.fee_curve.len(), "persisted recommendation");
    Ok(id)
}

pub async fn fetch_recommendation(
    pool: &sqlx::PgPool,
    id: Uuid,
) -> anyhow::Result<Option<StoredRecommendation>> {
    let row = sqlx::query_as::<
        _,
        (
            DateTime<Utc>,
            Option<String>,
            String,
            f64,
            f64,
            f64,
            i32,
            i32,
            i32,
            Option<String>,
            serde_json::Value,
        ),
    >(
        "SELECT created_at, artifacts_version, model_type, best_fee, best_prob, best_ev, \
                features_present, total_features, fallback_candidates, warning, record \
         FROM fee_recommendations \
         WHERE id = $1",
    )
    .persistent(false)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("select fee_recommendations failed")?;

    let Some((
        created_at,
        artifacts_version,
        model_type,
        best_fee,
        best_prob,
        best_ev,
        features_present,
        total_features,
        fallback_candidates,
        warning,
        record,
    )) = row
    else {
        return Ok(None);
    };

    let points = sqlx::query_as::<_, (f64, f64, f64, bool)>(
        "SELECT fee, win_prob, expected_value, fallback \
         FROM fee_curve_points \
         WHERE recommendation_id = $1 \
         ORDER BY idx ASC",
    )
    .persistent(false)
    .bind(id)
    .fetch_all(pool)
    .await
    .context("select fee_curve_points failed")?;

    let fee_curve = points
        .into_iter()
        .map(|(fee, win_prob, expected_value, fallback)| FeeCandidate {
            fee,
            win_prob,
            expected_value,
            fallback,
        })
        .collect();

    Ok(Some(StoredRecommendation {
        id,
        created_at,
        artifacts_version,
        record,
        recommendation: Recommendation {
            best_fee,
            best_prob,
            best_ev,
            fee_curve,
            diagnostics: Diagnostics {
                model_type,
                features_present: features_present.max(0) as usize,
                total_features: total_features.max(0) as usize,
                fallback_candidates: fallback_candidates.max(0) as usize,
                warning,
            },
        },
    }))
}
