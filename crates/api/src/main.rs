use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use bidfee_core::artifacts::{ArtifactStore, Artifacts};
use bidfee_core::config::{OptimizerSettings, Settings};
use bidfee_core::domain::{OpportunityRecord, Recommendation};
use bidfee_core::storage::recommendations::{
    fetch_recommendation, persist_recommendation, StoredRecommendation,
};
use bidfee_core::BidError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let optimizer = OptimizerSettings::from_env()?;

    let artifacts_path = std::path::PathBuf::from(&settings.artifacts_path);
    let artifacts = match Artifacts::load(&artifacts_path, optimizer.artifacts) {
        Ok(a) => a,
        Err(e) => {
            let err = anyhow::Error::new(e);
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "artifacts failed to load; refusing to start");
            return Err(err);
        }
    };

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match bidfee_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(
                        error = %e,
                        "db migrations failed; starting API in degraded mode"
                    );
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                "DATABASE_URL missing; recommendations will not be persisted"
            );
            None
        }
    };

    let state = AppState {
        store: Arc::new(ArtifactStore::new(artifacts)),
        artifacts_path: Arc::new(artifacts_path),
        optimizer,
        pool,
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health))
        .route("/model-info", get(model_info))
        .route("/predict", post(predict))
        .route("/optimize", post(optimize))
        .route("/score", post(score))
        .route("/artifacts/reload", post(reload_artifacts))
        .route("/recommendations/:id", get(get_recommendation))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    store: Arc<ArtifactStore>,
    artifacts_path: Arc<std::path::PathBuf>,
    optimizer: OptimizerSettings,
    pool: Option<PgPool>,
}

/// Error body: `{kind, message}`.
#[derive(Debug)]
enum ApiError {
    Core(BidError),
    Unavailable(&'static str),
    NotFound,
    Internal(anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl From<BidError> for ApiError {
    fn from(e: BidError) -> Self {
        ApiError::Core(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(BidError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Core(BidError::Optimization(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Core(BidError::ArtifactLoad { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Core(BidError::Prediction(_) | BidError::Config(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Core(e) => ErrorBody {
                kind: e.kind(),
                message: e.to_string(),
            },
            ApiError::Unavailable(what) => ErrorBody {
                kind: "unavailable",
                message: format!("{what} unavailable"),
            },
            ApiError::NotFound => ErrorBody {
                kind: "not_found",
                message: "not found".to_string(),
            },
            ApiError::Internal(e) => ErrorBody {
                kind: "internal_error",
                message: format!("{e:#}"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            match &self {
                ApiError::Internal(e) => {
                    sentry_anyhow::capture_anyhow(e);
                }
                ApiError::Core(e) => {
                    sentry::capture_error(e);
                }
                _ => {}
            }
        }
        (status, Json(self.body())).into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    models_loaded: bool,
    database: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let artifacts = state.store.snapshot();
    Json(HealthResponse {
        status: "ok",
        models_loaded: artifacts.classifier().is_some(),
        database: state.pool.is_some(),
    })
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    version: Option<String>,
    model_type: &'static str,
    n_features: usize,
    features: Vec<String>,
    categorical_features: Vec<String>,
    has_regressor: bool,
}

async fn model_info(State(state): State<AppState>) -> Json<ModelInfo> {
    let artifacts = state.store.snapshot();
    let transformer = artifacts.transformer();
    Json(ModelInfo {
        version: artifacts.version.clone(),
        model_type: artifacts.model_type(),
        n_features: transformer.feature_list().len(),
        features: transformer.feature_list().to_vec(),
        categorical_features: transformer
            .categorical_features()
            .into_iter()
            .map(str::to_string)
            .collect(),
        has_regressor: artifacts.regressor().is_some(),
    })
}

#[derive(Debug, Serialize)]
struct RecommendationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    recommendation_id: Option<Uuid>,
    #[serde(flatten)]
    recommendation: Recommendation,
}

async fn predict(
    State(state): State<AppState>,
    Json(record): Json<OpportunityRecord>,
) -> Result<Json<RecommendationResponse>, ApiError> {
    recommend(&state, record, None, None).await
}

#[derive(Debug, Default, Deserialize)]
struct OptimizeQuery {
    pct_range: Option<f64>,
    n_steps: Option<usize>,
}

async fn optimize(
    State(state): State<AppState>,
    Query(q): Query<OptimizeQuery>,
    Json(record): Json<OpportunityRecord>,
) -> Result<Json<RecommendationResponse>, ApiError> {
    recommend(&state, record, q.pct_range, q.n_steps).await
}

async fn recommend(
    state: &AppState,
    record: OpportunityRecord,
    range_fraction: Option<f64>,
    steps: Option<usize>,
) -> Result<Json<RecommendationResponse>, ApiError> {
    let artifacts = state.store.snapshot();

    let mut params = state.optimizer.grid;
    if let Some(r) = range_fraction {
        params.range_fraction = r;
    }
    if let Some(n) = steps {
        params.steps = n;
    }

    let (record, recommendation) = {
        let artifacts = Arc::clone(&artifacts);
        tokio::task::spawn_blocking(move || {
            let rec = artifacts.optimize(&record, &params);
            (record, rec)
        })
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("optimize task failed")))?
    };
    let recommendation = recommendation?;

    tracing::info!(
        best_fee = recommendation.best_fee,
        best_ev = recommendation.best_ev,
        model_type = %recommendation.diagnostics.model_type,
        fallback_candidates = recommendation.diagnostics.fallback_candidates,
        "recommendation computed"
    );

    let recommendation_id = match &state.pool {
        Some(pool) => match persist_recommendation(
            pool,
            &record,
            &recommendation,
            artifacts.version.as_deref(),
        )
        .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                sentry_anyhow::capture_anyhow(&e);
                tracing::error!(error = %e, "persisting recommendation failed");
                None
            }
        },
        None => None,
    };

    Ok(Json(RecommendationResponse {
        recommendation_id,
        recommendation,
    }))
}

#[derive(Debug, Serialize)]
struct ScoreResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    predicted_fee: Option<f64>,
    win_probability: f64,
    fallback: bool,
    timestamp: DateTime<Utc>,
}

async fn score(
    State(state): State<AppState>,
    Json(record): Json<OpportunityRecord>,
) -> Result<Json<ScoreResponse>, ApiError> {
    let artifacts = state.store.snapshot();
    let scored = artifacts.score(&record, state.optimizer.grid.fallback_probability)?;

    Ok(Json(ScoreResponse {
        predicted_fee: scored.predicted_fee,
        win_probability: scored.win_probability.value(),
        fallback: scored.win_probability.is_fallback(),
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    version: Option<String>,
    model_type: &'static str,
    n_features: usize,
}

async fn reload_artifacts(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let store = Arc::clone(&state.store);
    let path = Arc::clone(&state.artifacts_path);
    let opts = state.optimizer.artifacts;

    let artifacts = tokio::task::spawn_blocking(move || store.reload_from(&path, opts))
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("reload task failed")))??;

    Ok(Json(ReloadResponse {
        version: artifacts.version.clone(),
        model_type: artifacts.model_type(),
        n_features: artifacts.transformer().feature_list().len(),
    }))
}

async fn get_recommendation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StoredRecommendation>, ApiError> {
    let Some(pool) = &state.pool else {
        return Err(ApiError::Unavailable("database"));
    };

    let stored = fetch_recommendation(pool, id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(stored))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
