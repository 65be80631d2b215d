//! Core library for PharmaGuard's ingestion service.  This module wires the
//! upload stager, field normalisation and lazily resolved analysis pipeline
//! into the HTTP handlers.  Everything a request creates on disk is removed
//! before its response is sent.

mod config;
pub mod normalize;
pub mod pipeline;
pub mod staging;

pub use config::{parse_cors_origins, AppConfig, CorsOrigins};

use axum::extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::normalize::{normalize_drugs, parse_enable_flag, NormalizeError};
use crate::pipeline::{
    PipelineError, PipelineJob, PipelineLoader, PipelineResolver, ResolveError,
};
use crate::staging::{StageError, StagedFile, Stager};

/// Suffix every accepted upload must carry, compared case-insensitively.
pub const VCF_SUFFIX: &str = ".vcf";

/// Largest accepted text form field.  The request body limit is disabled for
/// uploads, so text parts are bounded here instead.
pub const MAX_TEXT_FIELD_BYTES: usize = 1024 * 1024;

/// Body of every non-success response.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Every way a `/predict` request can fail, each mapped to one status code.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Only .vcf files are supported")]
    UnsupportedFileType,
    #[error("vcf_file field is required")]
    MissingFile,
    #[error("Invalid multipart payload: {0}")]
    InvalidMultipart(String),
    #[error("Form field {field} exceeds limit of {limit} bytes")]
    FieldTooLarge { field: String, limit: usize },
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Unavailable(#[from] ResolveError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl PredictError {
    pub fn status(&self) -> StatusCode {
        match self {
            PredictError::UnsupportedFileType
            | PredictError::InvalidMultipart(_)
            | PredictError::Normalize(_) => StatusCode::BAD_REQUEST,
            PredictError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            PredictError::Stage(StageError::TooLarge { .. }) | PredictError::FieldTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            PredictError::Stage(_) | PredictError::Pipeline(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PredictError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Client-facing message.  Staging I/O failures stay generic; the cause is
    /// only logged.
    pub fn detail(&self) -> String {
        match self {
            PredictError::Stage(StageError::TooLarge { limit }) => {
                format!("Upload exceeds limit of {} bytes", limit)
            }
            PredictError::Stage(_) => "Failed to stage upload".to_string(),
            PredictError::Unavailable(err) => format!(
                "Pipeline import failed: {}. Install native dependencies (cyvcf2/htslib) or run in WSL/Linux.",
                err
            ),
            PredictError::Pipeline(err) => format!("Pipeline execution failed: {}", err),
            other => other.to_string(),
        }
    }

    fn outcome(&self) -> Outcome {
        match self {
            PredictError::Stage(StageError::TooLarge { .. }) | PredictError::FieldTooLarge { .. } => {
                Outcome::TooLarge
            }
            PredictError::Stage(_) => Outcome::StagingError,
            PredictError::Unavailable(_) => Outcome::Unavailable,
            PredictError::Pipeline(_) => Outcome::PipelineError,
            _ => Outcome::Validation,
        }
    }
}

impl IntoResponse for PredictError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "predict request failed");
        } else {
            tracing::info!(status = status.as_u16(), error = %self, "predict request rejected");
        }
        (
            status,
            Json(ErrorResponse {
                detail: self.detail(),
            }),
        )
            .into_response()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    Validation,
    TooLarge,
    StagingError,
    Unavailable,
    PipelineError,
}

/// Process-wide counters exposed on `/metrics`.
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub success_total: AtomicU64,
    pub validation_errors_total: AtomicU64,
    pub too_large_total: AtomicU64,
    pub staging_errors_total: AtomicU64,
    pub unavailable_total: AtomicU64,
    pub pipeline_errors_total: AtomicU64,
    pub staged_bytes_total: AtomicU64,
    // Pipeline latency histogram: upper bounds (ms) and per-bucket counts
    pub hist_buckets: Vec<u64>,
    pub hist_counts: Vec<AtomicU64>,
    pub hist_sum_ms: AtomicU64,
    pub hist_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let buckets: Vec<u64> = vec![50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000, 60000];
        Self {
            requests_total: AtomicU64::new(0),
            success_total: AtomicU64::new(0),
            validation_errors_total: AtomicU64::new(0),
            too_large_total: AtomicU64::new(0),
            staging_errors_total: AtomicU64::new(0),
            unavailable_total: AtomicU64::new(0),
            pipeline_errors_total: AtomicU64::new(0),
            staged_bytes_total: AtomicU64::new(0),
            hist_counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_buckets: buckets,
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
        }
    }

    fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.success_total,
            Outcome::Validation => &self.validation_errors_total,
            Outcome::TooLarge => &self.too_large_total,
            Outcome::StagingError => &self.staging_errors_total,
            Outcome::Unavailable => &self.unavailable_total,
            Outcome::PipelineError => &self.pipeline_errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_pipeline_ms(&self, ms: u64) {
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        // find first bucket >= value
        for (idx, ub) in self.hist_buckets.iter().enumerate() {
            if ms <= *ub {
                self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state shared across handlers.  The pipeline loader is the
/// only mutable state that outlives a request.
#[derive(Clone)]
pub struct AppState {
    pub stager: Stager,
    pub loader: Arc<PipelineLoader>,
    pub cors_origins: CorsOrigins,
    pub metrics: Arc<Metrics>,
    pub process_start_instant: Instant,
}

impl AppState {
    /// Build state around an explicit resolver.
    pub fn new(config: &AppConfig, resolver: Arc<dyn PipelineResolver>) -> Self {
        if !config.staging_dir.is_dir() {
            tracing::warn!(
                dir = %config.staging_dir.display(),
                "staging directory does not exist; uploads will fail until it is created"
            );
        }
        Self {
            stager: Stager::new(config.staging_dir.clone(), config.max_upload_bytes),
            loader: Arc::new(PipelineLoader::new(resolver)),
            cors_origins: config.cors_origins.clone(),
            metrics: Arc::new(Metrics::new()),
            process_start_instant: Instant::now(),
        }
    }

    /// Build state using the pipeline target named by `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let resolver = config.pipeline.resolver(config.probe_timeout);
        Self::new(config, resolver)
    }
}

/// Build state from environment variables.  See [`AppConfig::from_env`] for
/// the variables read.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        staging_dir = %config.staging_dir.display(),
        max_upload_bytes = ?config.max_upload_bytes,
        pipeline = ?config.pipeline,
        "configuration loaded"
    );
    Ok(AppState::from_config(&config))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);
    Router::new()
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .route("/metrics", get(metrics_handler))
        // Upload size is enforced by the stager, not by buffering limits.
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &CorsOrigins) -> CorsLayer {
    match origins {
        CorsOrigins::Any => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        // Credentials cannot be combined with wildcards, so mirror instead.
        CorsOrigins::List(list) => CorsLayer::new()
            .allow_origin(AllowOrigin::list(list.iter().cloned()))
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true),
    }
}

/// Liveness endpoint.  Never touches the pipeline.
async fn health_handler() -> axum::response::Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

/// Text fields of the `/predict` form, kept raw until the upload is staged.
#[derive(Debug, Default)]
struct PredictForm {
    drugs: Option<String>,
    patient_id: Option<String>,
    enable_llm: Option<String>,
}

/// Handler for `/predict`.  The staged upload is released on every path
/// out of [`predict`]; if this future is dropped instead, dropping the
/// [`StagedFile`] removes it.
async fn predict_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> axum::response::Response {
    let start = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let mut staged: Option<StagedFile> = None;
    let result = match multipart {
        Ok(multipart) => predict(&state, multipart, &mut staged).await,
        Err(rejection) => Err(PredictError::InvalidMultipart(rejection.body_text())),
    };
    if let Some(file) = staged.take() {
        file.release();
    }

    let outcome = match &result {
        Ok(_) => Outcome::Success,
        Err(err) => err.outcome(),
    };
    state.metrics.record_outcome(outcome);
    tracing::info!(
        outcome = ?outcome,
        latency_ms = start.elapsed().as_millis() as u64,
        "predict request finished"
    );

    match result {
        Ok(results) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "success", "results": results })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn predict(
    state: &AppState,
    mut multipart: Multipart,
    staged: &mut Option<StagedFile>,
) -> Result<serde_json::Value, PredictError> {
    let mut form = PredictForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PredictError::InvalidMultipart(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "vcf_file" => {
                if staged.is_some() {
                    tracing::warn!("ignoring additional vcf_file part");
                    continue;
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                if !has_vcf_suffix(&file_name) {
                    return Err(PredictError::UnsupportedFileType);
                }
                let file = state.stager.stage(field, VCF_SUFFIX).await?;
                state
                    .metrics
                    .staged_bytes_total
                    .fetch_add(file.size(), Ordering::Relaxed);
                tracing::debug!(upload = %file_name, bytes = file.size(), "upload staged");
                *staged = Some(file);
            }
            "drugs" => form.drugs = Some(read_text(field, &name).await?),
            "patient_id" => form.patient_id = Some(read_text(field, &name).await?),
            "enable_llm" => form.enable_llm = Some(read_text(field, &name).await?),
            other => tracing::debug!(field = %other, "ignoring unknown form field"),
        }
    }
    let vcf_path = match staged.as_ref() {
        Some(file) => file.path().to_path_buf(),
        None => return Err(PredictError::MissingFile),
    };

    let drugs = normalize_drugs(form.drugs.as_deref())?;
    let enable_llm = parse_enable_flag(form.enable_llm.as_deref());
    let pipeline = state.loader.resolve().await?;

    let job = PipelineJob {
        vcf_path,
        drugs,
        patient_id: form.patient_id,
        enable_llm,
    };
    tracing::debug!(
        pipeline = %pipeline.name(),
        drug_count = job.drugs.len(),
        enable_llm,
        "delegating to pipeline"
    );
    let pipeline_start = Instant::now();
    let results = pipeline.run(&job).await;
    state
        .metrics
        .observe_pipeline_ms(pipeline_start.elapsed().as_millis() as u64);
    results.map_err(PredictError::from)
}

/// Buffer a text part, refusing anything over [`MAX_TEXT_FIELD_BYTES`].
async fn read_text(
    mut field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, PredictError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| PredictError::InvalidMultipart(e.body_text()))?
    {
        if buf.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(PredictError::FieldTooLarge {
                field: name.to_string(),
                limit: MAX_TEXT_FIELD_BYTES,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    String::from_utf8(buf)
        .map_err(|_| PredictError::InvalidMultipart(format!("field {} is not valid UTF-8", name)))
}

/// Case-insensitive check for the `.vcf` suffix.
pub fn has_vcf_suffix(file_name: &str) -> bool {
    file_name.to_lowercase().ends_with(VCF_SUFFIX)
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut buf = String::new();
    use std::fmt::Write as _;
    let m = &state.metrics;
    let counters: [(&str, &str, &AtomicU64); 8] = [
        ("pharmaguard_requests_total", "Total predict requests received", &m.requests_total),
        ("pharmaguard_success_total", "Predict requests answered with pipeline results", &m.success_total),
        ("pharmaguard_validation_errors_total", "Predict requests rejected as malformed", &m.validation_errors_total),
        ("pharmaguard_upload_too_large_total", "Uploads rejected for exceeding the size limit", &m.too_large_total),
        ("pharmaguard_staging_errors_total", "Uploads that could not be staged", &m.staging_errors_total),
        ("pharmaguard_pipeline_unavailable_total", "Requests failed because the pipeline could not be resolved", &m.unavailable_total),
        ("pharmaguard_pipeline_errors_total", "Requests failed inside the pipeline", &m.pipeline_errors_total),
        ("pharmaguard_staged_bytes_total", "Bytes written to staged uploads", &m.staged_bytes_total),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value.load(Ordering::Relaxed)).ok();
    }
    // Histogram
    writeln!(
        &mut buf,
        "# HELP pharmaguard_pipeline_latency_ms Pipeline run latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE pharmaguard_pipeline_latency_ms histogram").ok();
    let count = m.hist_count.load(Ordering::Relaxed);
    let mut cumulative: u64 = 0;
    for (i, ub) in m.hist_buckets.iter().enumerate() {
        cumulative += m.hist_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "pharmaguard_pipeline_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "pharmaguard_pipeline_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(
        &mut buf,
        "pharmaguard_pipeline_latency_ms_sum {}",
        m.hist_sum_ms.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(&mut buf, "pharmaguard_pipeline_latency_ms_count {}", count).ok();
    writeln!(
        &mut buf,
        "# HELP pharmaguard_pipeline_resolved Whether the pipeline entry point has been resolved\n# TYPE pharmaguard_pipeline_resolved gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "pharmaguard_pipeline_resolved {}",
        u8::from(state.loader.is_resolved())
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP pharmaguard_build_info Build information\n# TYPE pharmaguard_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "pharmaguard_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP pharmaguard_process_uptime_seconds Process uptime seconds\n# TYPE pharmaguard_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "pharmaguard_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
