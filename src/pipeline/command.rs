use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use super::{Pipeline, PipelineError, PipelineJob, PipelineResolver, ResolveError};

/// Resolves a pipeline shipped as a local executable.  A name containing a
/// path separator must point at an existing file; a bare name is searched on
/// `PATH` at resolution time, so installing it later is picked up.
pub struct CommandPipelineResolver {
    program: String,
}

impl CommandPipelineResolver {
    pub fn new(program: String) -> Self {
        Self { program }
    }
}

#[async_trait::async_trait]
impl PipelineResolver for CommandPipelineResolver {
    async fn resolve(&self) -> Result<Arc<dyn Pipeline>, ResolveError> {
        let program = self.program.clone();
        let located = tokio::task::spawn_blocking(move || locate(&program))
            .await
            .map_err(|e| ResolveError::Other(e.to_string()))?;
        match located {
            Some(path) => Ok(Arc::new(CommandPipeline { program: path })),
            None => Err(ResolveError::NotFound(self.program.clone())),
        }
    }
}

fn locate(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs the pipeline executable once per job and parses its stdout as JSON.
///
/// Invocation: `<program> --vcf <path> --drugs <json array> [--patient-id <id>]
/// --enable-llm <true|false>`.
pub struct CommandPipeline {
    program: PathBuf,
}

impl CommandPipeline {
    fn command(&self, job: &PipelineJob) -> Result<Command, PipelineError> {
        let drugs = serde_json::to_string(&job.drugs)
            .map_err(|e| PipelineError::InvalidOutput(e.to_string()))?;
        let mut cmd = Command::new(&self.program);
        cmd.arg("--vcf").arg(&job.vcf_path).arg("--drugs").arg(drugs);
        if let Some(patient) = &job.patient_id {
            cmd.arg("--patient-id").arg(patient);
        }
        cmd.arg("--enable-llm")
            .arg(if job.enable_llm { "true" } else { "false" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A dropped request future must not leave the child running.
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait::async_trait]
impl Pipeline for CommandPipeline {
    fn name(&self) -> &str {
        self.program.to_str().unwrap_or("pipeline")
    }

    async fn run(&self, job: &PipelineJob) -> Result<serde_json::Value, PipelineError> {
        let output = self.command(job)?.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Exit {
                code: output.status.code(),
                stderr: stderr.lines().last().unwrap_or("unknown error").to_string(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| PipelineError::InvalidOutput(e.to_string()))
    }
}
