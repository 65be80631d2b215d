use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::{Pipeline, PipelineError, PipelineJob, PipelineResolver, ResolveError};

/// Resolves a pipeline exposed over HTTP by probing `GET {base}/health`.
pub struct HttpPipelineResolver {
    base_url: String,
    probe_timeout: Duration,
}

impl HttpPipelineResolver {
    pub fn new(base_url: String, probe_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout,
        }
    }

    fn unreachable(&self, reason: impl ToString) -> ResolveError {
        ResolveError::Unreachable {
            url: self.base_url.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl PipelineResolver for HttpPipelineResolver {
    async fn resolve(&self) -> Result<Arc<dyn Pipeline>, ResolveError> {
        // No overall timeout on the client: pipeline runs may be long and are
        // bounded by the caller's connection instead.
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ResolveError::Other(format!("failed to build http client: {}", e)))?;
        let probe = format!("{}/health", self.base_url);
        let resp = client
            .get(&probe)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !resp.status().is_success() {
            return Err(self.unreachable(format!("health probe returned {}", resp.status())));
        }
        tracing::debug!(url = %self.base_url, "pipeline service healthy");
        Ok(Arc::new(HttpPipeline {
            base_url: self.base_url.clone(),
            client,
        }))
    }
}

/// Forwards jobs as JSON to `POST {base}/run` and returns the response body.
pub struct HttpPipeline {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest<'a> {
    vcf_path: String,
    drugs: &'a [String],
    patient_id: Option<&'a str>,
    enable_llm: bool,
}

#[async_trait::async_trait]
impl Pipeline for HttpPipeline {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn run(&self, job: &PipelineJob) -> Result<serde_json::Value, PipelineError> {
        let body = RunRequest {
            vcf_path: job.vcf_path.to_string_lossy().into_owned(),
            drugs: job.drugs.as_slice(),
            patient_id: job.patient_id.as_deref(),
            enable_llm: job.enable_llm,
        };
        let resp = self
            .client
            .post(format!("{}/run", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| PipelineError::InvalidOutput(e.to_string()))
    }
}
