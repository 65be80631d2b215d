#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use pharmaguard::pipeline::{
    Pipeline, PipelineError, PipelineJob, PipelineResolver, PipelineTarget, ResolveError,
};
use pharmaguard::{AppConfig, CorsOrigins};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

pub const BOUNDARY: &str = "pharmaguard-test-boundary";

pub const SAMPLE_VCF: &[u8] =
    b"##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\n22\t42128945\trs3892097\tC\tT\n";

/// Hand-built multipart/form-data body.
pub struct FormBuilder {
    body: Vec<u8>,
}

impl FormBuilder {
    pub fn new() -> Self {
        Self { body: Vec::new() }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, name, file_name
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn vcf(self, file_name: &str) -> Self {
        self.file("vcf_file", file_name, SAMPLE_VCF)
    }

    pub fn content_type() -> String {
        format!("multipart/form-data; boundary={}", BOUNDARY)
    }

    pub fn build(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        self.body
    }

    pub fn request(self) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/predict")
            .header("content-type", Self::content_type())
            .body(Body::from(self.build()))
            .unwrap()
    }
}

pub async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn staged_entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

pub fn test_config(staging_dir: &Path) -> AppConfig {
    AppConfig {
        cors_origins: CorsOrigins::Any,
        staging_dir: staging_dir.to_path_buf(),
        max_upload_bytes: None,
        pipeline: PipelineTarget::Command {
            program: "pharmaguard-pipeline-unused".into(),
        },
        probe_timeout: Duration::from_millis(200),
    }
}

/// What the recording pipeline saw for one job.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub vcf_path: PathBuf,
    pub file_existed: bool,
    pub contents: Vec<u8>,
    pub drugs: Vec<String>,
    pub patient_id: Option<String>,
    pub enable_llm: bool,
}

/// Pipeline that records each job and answers with one report per drug.
pub struct RecordingPipeline {
    pub runs: Mutex<Vec<RunRecord>>,
    pub fail: AtomicBool,
    pub delay: Duration,
}

impl RecordingPipeline {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay,
        })
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Pipeline for RecordingPipeline {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self, job: &PipelineJob) -> Result<serde_json::Value, PipelineError> {
        let contents = std::fs::read(&job.vcf_path).unwrap_or_default();
        self.runs.lock().unwrap().push(RunRecord {
            vcf_path: job.vcf_path.clone(),
            file_existed: job.vcf_path.exists(),
            contents,
            drugs: job.drugs.as_slice().to_vec(),
            patient_id: job.patient_id.clone(),
            enable_llm: job.enable_llm,
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::Exit {
                code: Some(1),
                stderr: "KeyError: 'CYP2D6'".into(),
            });
        }
        let reports: Vec<_> = job
            .drugs
            .iter()
            .map(|d| serde_json::json!({ "drug": d, "risk_assessment": { "risk_label": "Safe" } }))
            .collect();
        Ok(serde_json::Value::Array(reports))
    }
}

/// Resolver whose availability can be flipped at runtime.
pub struct ToggleResolver {
    pub available: AtomicBool,
    pub attempts: AtomicUsize,
    pub pipeline: Arc<RecordingPipeline>,
}

impl ToggleResolver {
    pub fn new(available: bool, pipeline: Arc<RecordingPipeline>) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(available),
            attempts: AtomicUsize::new(0),
            pipeline,
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PipelineResolver for ToggleResolver {
    async fn resolve(&self) -> Result<Arc<dyn Pipeline>, ResolveError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(self.pipeline.clone())
        } else {
            Err(ResolveError::Other(
                "No module named 'cyvcf2'".to_string(),
            ))
        }
    }
}
