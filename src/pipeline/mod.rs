//! Access to the external analysis pipeline.
//!
//! The pipeline itself (genotype parsing, drug-gene matching, report
//! generation) lives outside this service.  Two collaborators are supported:
//! a remote HTTP service ([`http::HttpPipeline`]) and a local executable
//! ([`command::CommandPipeline`]).  Either may be missing from a deployment, so
//! the service resolves it lazily through a [`PipelineLoader`] on first use
//! instead of at startup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::normalize::DrugList;

pub mod command;
pub mod http;

use self::command::CommandPipelineResolver;
use self::http::HttpPipelineResolver;

/// Executable used when neither `PIPELINE_URL` nor `PIPELINE_COMMAND` is set.
pub const DEFAULT_PIPELINE_COMMAND: &str = "pharmaguard-pipeline";

/// Inputs forwarded to the pipeline for one request.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub vcf_path: PathBuf,
    pub drugs: DrugList,
    pub patient_id: Option<String>,
    pub enable_llm: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("pipeline executable '{0}' not found")]
    NotFound(String),
    #[error("pipeline service at {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("{0}")]
    Other(String),
}

/// Failures raised while the pipeline runs.  These are reported to the
/// client as-is; the service does not interpret them.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("request to pipeline failed: {0}")]
    Transport(String),
    #[error("pipeline responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to launch pipeline: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("pipeline exited with {}: {stderr}", describe_exit(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("pipeline produced invalid output: {0}")]
    InvalidOutput(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// A resolved pipeline entry point accepting multi-drug jobs.
#[async_trait::async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, job: &PipelineJob) -> Result<serde_json::Value, PipelineError>;
}

/// Locates a pipeline.  Called again after every failed attempt, so
/// implementations must be side-effect free on failure.
#[async_trait::async_trait]
pub trait PipelineResolver: Send + Sync {
    async fn resolve(&self) -> Result<Arc<dyn Pipeline>, ResolveError>;
}

/// Where the pipeline lives, as selected by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineTarget {
    Http { base_url: String },
    Command { program: String },
}

impl PipelineTarget {
    pub fn resolver(&self, probe_timeout: Duration) -> Arc<dyn PipelineResolver> {
        match self {
            PipelineTarget::Http { base_url } => {
                Arc::new(HttpPipelineResolver::new(base_url.clone(), probe_timeout))
            }
            PipelineTarget::Command { program } => {
                Arc::new(CommandPipelineResolver::new(program.clone()))
            }
        }
    }
}

/// Lazily resolved, process-wide pipeline handle.
///
/// Success is cached for the life of the loader.  Failure is not: the next
/// call tries again, so installing a missing dependency takes effect without
/// a restart.  Concurrent first callers are serialised by the cell and all
/// observe the same handle.
pub struct PipelineLoader {
    resolver: Arc<dyn PipelineResolver>,
    handle: OnceCell<Arc<dyn Pipeline>>,
}

impl PipelineLoader {
    pub fn new(resolver: Arc<dyn PipelineResolver>) -> Self {
        Self {
            resolver,
            handle: OnceCell::new(),
        }
    }

    pub async fn resolve(&self) -> Result<Arc<dyn Pipeline>, ResolveError> {
        let handle = self
            .handle
            .get_or_try_init(|| async {
                match self.resolver.resolve().await {
                    Ok(pipeline) => {
                        tracing::info!(pipeline = %pipeline.name(), "pipeline resolved");
                        Ok(pipeline)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "pipeline resolution failed; will retry on next request");
                        Err(err)
                    }
                }
            })
            .await?;
        Ok(handle.clone())
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.initialized()
    }
}

impl std::fmt::Debug for PipelineLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLoader")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
