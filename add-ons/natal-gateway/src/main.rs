//! natal-gateway: HTTP front of the occupation model.
//!
//! `GET /health` reports whether a model is loaded; `POST /analyze` scores one birth record.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | NATAL_CONFIG | config/natal.toml | Config file |
//! | NATAL_HOST / NATAL_PORT | 127.0.0.1 / 8000 | Bind address |
//! | NATAL_MODEL_PATH | <data_dir>/model.json | Model bundle from `natal-pipeline train` |
//! | NATAL_PREPARED_PATH | <data_dir>/prepared.jsonl | Training table for similar profiles |
//! | RUST_LOG | info | Log filter |

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use natal_core::predict::{self, AnalysisResponse};
use natal_core::{GatewayConfig, MeanMotionOracle, ServiceContext};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    /// `None` when no model could be loaded at startup.
    context: Option<Arc<ServiceContext>>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .with_state(Arc::new(state))
        .layer(cors)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "model_loaded": state.context.is_some(),
    }))
}

/// POST /analyze: validate, cast the chart, encode with the frozen schema, score.
async fn analyze(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let Json(body) = body.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;
    let fact = predict::parse_request(&body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let Some(context) = state.context.clone() else {
        return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "model not loaded"));
    };

    let response = tokio::task::spawn_blocking(move || context.analyze(&fact))
        .await
        .map_err(|e| {
            tracing::error!(target: "natal::service", error = %e, "analysis task failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "analysis task failed")
        })?
        .map_err(|e| {
            tracing::error!(target: "natal::service", stage = %e.stage, error = %e, "analysis failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string(), "stage": e.stage })),
            )
        })?;
    Ok(Json(response))
}

fn load_context(config: &GatewayConfig) -> Option<Arc<ServiceContext>> {
    let model = config.model_path();
    let prepared = config.prepared_path();
    match ServiceContext::load(&model, &prepared, Arc::new(MeanMotionOracle)) {
        Ok(ctx) => Some(Arc::new(ctx)),
        Err(e) => {
            tracing::warn!(
                target: "natal::service",
                model = %model.display(),
                prepared = %prepared.display(),
                error = %e,
                "model not loaded; /analyze will answer 503 (run `natal-pipeline run` first)"
            );
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load(None)?;
    let app = build_app(AppState {
        context: load_context(&config),
    });

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(target: "natal::service", %addr, "natal gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use natal_core::{
        dataset, BundledSample, ClassifierTrainer, FeatureRecordBuilder, ForestParams,
        PreparedDataset, TrainerConfig,
    };
    use tower::ServiceExt;

    fn trained_state() -> AppState {
        let oracle = Arc::new(MeanMotionOracle);
        let people = dataset::clean(BundledSample::people_rows().unwrap()).unwrap();
        let builder = FeatureRecordBuilder::new(oracle.clone());
        let records: Vec<_> = people
            .iter()
            .map(|p| builder.build(&p.birth_fact(), Some(p.occupation.clone())))
            .collect();
        let data = PreparedDataset::prepare(&records).unwrap();
        let config = TrainerConfig {
            forest: ForestParams {
                n_trees: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let (bundle, _) = ClassifierTrainer::new(config).train(&data).unwrap();
        AppState {
            context: Some(Arc::new(ServiceContext::new(bundle, data, oracle).unwrap())),
        }
    }

    async fn post_json(app: Router, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/analyze")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    const SAN_DIEGO: &str =
        r#"{"name":"Ada","birth_date":"2000-01-01","birth_time":"10:00","latitude":32.717,"longitude":-117.15}"#;

    #[tokio::test]
    async fn health_reports_model_state() {
        let app = build_app(AppState { context: None });
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["model_loaded"], false);
    }

    #[tokio::test]
    async fn analyze_returns_full_response() {
        let (status, json) = post_json(build_app(trained_state()), SAN_DIEGO).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["name"], "Ada");
        assert_eq!(json["predictions"].as_array().unwrap().len(), 5);
        assert!(json["predictions"][0]["confidence"].is_string());
        assert!(json["natal_chart"]["Sun"]["sign"].is_string());
        assert_eq!(
            json["feature_importance"]["most_influential"].as_array().unwrap().len(),
            10
        );
        assert_eq!(json["similar_profiles"].as_array().unwrap().len(), 5);
        assert!(json["interpretation"]["summary"].is_string());
    }

    #[tokio::test]
    async fn missing_field_is_a_client_error() {
        let body = r#"{"birth_date":"2000-01-01","birth_time":"10:00","latitude":32.7}"#;
        let (status, json) = post_json(build_app(trained_state()), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("longitude"));
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let (status, json) = post_json(build_app(AppState { context: None }), "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn no_model_is_unavailable() {
        let (status, json) = post_json(build_app(AppState { context: None }), SAN_DIEGO).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "model not loaded");
    }
}
