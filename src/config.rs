use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::http::HeaderValue;

use crate::pipeline::{PipelineTarget, DEFAULT_PIPELINE_COMMAND};

/// Allowed cross-origin request sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOrigins {
    Any,
    List(Vec<HeaderValue>),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cors_origins: CorsOrigins,
    pub staging_dir: PathBuf,
    pub max_upload_bytes: Option<u64>,
    pub pipeline: PipelineTarget,
    pub probe_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let cors_origins = parse_cors_origins(env::var("CORS_ORIGINS").ok().as_deref())?;

        let staging_dir = env::var_os("PHARMAGUARD_STAGING_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        let max_upload_bytes = parse_optional_u64("PHARMAGUARD_MAX_UPLOAD_BYTES")?;

        let pipeline = match non_empty_var("PIPELINE_URL") {
            Some(base_url) => PipelineTarget::Http { base_url },
            None => PipelineTarget::Command {
                program: non_empty_var("PIPELINE_COMMAND")
                    .unwrap_or_else(|| DEFAULT_PIPELINE_COMMAND.to_string()),
            },
        };

        let probe_timeout =
            Duration::from_millis(parse_optional_u64("PIPELINE_PROBE_TIMEOUT_MS")?.unwrap_or(2000));

        Ok(Self {
            cors_origins,
            staging_dir,
            max_upload_bytes,
            pipeline,
            probe_timeout,
        })
    }
}

/// Unset, blank or wildcard input allows every origin.
pub fn parse_cors_origins(raw: Option<&str>) -> Result<CorsOrigins> {
    let entries: Vec<&str> = raw
        .unwrap_or("")
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if entries.is_empty() || entries.contains(&"*") {
        return Ok(CorsOrigins::Any);
    }
    entries
        .into_iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| anyhow!("CORS_ORIGINS contains an invalid origin '{}'", origin))
        })
        .collect::<Result<Vec<_>>>()
        .map(CorsOrigins::List)
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Blank or unset is `None`; zero is rejected along with non-numbers.
fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => match value.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(anyhow!("{} must be a positive integer", var)),
        },
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
