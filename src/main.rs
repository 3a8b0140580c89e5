mod batched_engine;
mod bert_engine;
mod config;
mod engine;
mod error;
mod types;

use askama::Template;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use axum::Form;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use batched_engine::BatchedEngineWrapper;
use bert_engine::{BertEmotionEngine, BertEngineConfig};
use config::{BatchConfig, Config};
use engine::Engine;
use error::ServiceError;
use types::{ClassificationRequest, ClassificationResponse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,maum=debug".into()),
        )
        .init();

    let config = Config::parse();
    tracing::info!("Starting emotion service with config: {:?}", config);

    // Validate that either model_id or model_path is provided
    if config.model_id.is_none() && config.model_path.is_none() {
        anyhow::bail!("Either --model-id or --model-path must be provided");
    }

    let batch_config = BatchConfig::from(&config);

    let engine_config = BertEngineConfig {
        model_id: config.model_id.clone(),
        model_path: config.model_path.clone(),
        revision: config.model_revision.clone(),
        use_pth: config.use_pth,
        cpu: config.cpu_only,
        max_sequence_length: config.max_sequence_length,
    };

    tracing::info!("Loading BERT emotion model...");
    // Any load failure is fatal here; the listener never binds without a model.
    let bert_engine = BertEmotionEngine::new(engine_config)
        .await
        .map_err(ServiceError::ModelUnavailable)?;
    tracing::info!("Model loaded successfully");

    let (engine, processor) = BatchedEngineWrapper::new(batch_config.clone(), bert_engine);
    tracing::info!("Batch engine wrapper created");

    // Spawn background task to process batches
    tokio::spawn(async move {
        tracing::info!("Starting batch processor");
        if let Err(e) = processor.run_forever().await {
            tracing::error!("Batch processor error: {}", e);
        }
    });

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/predict", post(predict_handler))
        .route("/classify", post(classify_handler))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(Arc::new(engine)));

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());
    tracing::info!(
        "Batch size: {}, Tick duration: {:?}",
        batch_config.batch_size,
        batch_config.tick_duration
    );

    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    engine: Arc<dyn Engine + Send + Sync>,
}

impl AppState {
    fn new(engine: Arc<dyn Engine + Send + Sync>) -> Self {
        Self { engine }
    }
}

#[derive(Template)]
#[template(path = "diary.html")]
struct DiaryTemplate;

#[derive(Template)]
#[template(path = "result.html")]
struct ResultTemplate<'a> {
    emotion: &'a str,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate<'a> {
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictForm {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClassifyBody {
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn render<T: Template>(template: &T, status: StatusCode) -> Response {
    match template.render() {
        Ok(body) => (status, Html(body)).into_response(),
        Err(err) => {
            tracing::error!("Template rendering failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Validates the text field and runs a single classification through the
/// shared engine. A missing field never reaches the engine.
async fn classify_text(
    state: &AppState,
    text: Option<String>,
) -> Result<ClassificationResponse, ServiceError> {
    let text = text.ok_or(ServiceError::InvalidInput)?;
    state
        .engine
        .classify(ClassificationRequest { text })
        .await
        .map_err(ServiceError::Inference)
}

async fn index_handler() -> Response {
    render(&DiaryTemplate, StatusCode::OK)
}

#[tracing::instrument(skip(state, form))]
async fn predict_handler(State(state): State<AppState>, Form(form): Form<PredictForm>) -> Response {
    counter!("classification_requests_total").increment(1);

    match classify_text(&state, form.text).await {
        Ok(response) => render(
            &ResultTemplate {
                emotion: response.label.display_name(),
            },
            StatusCode::OK,
        ),
        Err(err) => {
            tracing::error!(error = %err, "Classification failed");
            render(
                &ErrorTemplate {
                    message: &err.to_string(),
                },
                err.status(),
            )
        }
    }
}

#[tracing::instrument(skip(state, body))]
async fn classify_handler(
    State(state): State<AppState>,
    Json(body): Json<ClassifyBody>,
) -> Result<Json<ClassificationResponse>, (StatusCode, Json<ErrorBody>)> {
    counter!("classification_requests_total").increment(1);

    match classify_text(&state, body.text).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            tracing::error!(error = %err, "Classification failed");
            Err((
                err.status(),
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            ))
        }
    }
}
