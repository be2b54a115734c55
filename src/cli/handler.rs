//! Job handler that runs an external program per job.

use std::io::ErrorKind;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::scheduler::{Job, JobHandler, ProgressReporter};

/// Longest stderr tail carried into a job's error message.
const MAX_STDERR_CHARS: usize = 2000;

/// Runs `program args...` for every job.
///
/// The job payload is written to the child's stdin as JSON, and the job's
/// identity is exported as `FRAMEFLOW_JOB_ID`, `FRAMEFLOW_QUEUE_TYPE`,
/// `FRAMEFLOW_TEAM_ID` and `FRAMEFLOW_SESSION_ID` (empty when unset). A
/// non-zero exit fails the attempt. The child is killed if the attempt is
/// abandoned, e.g. on job timeout.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds a handler from a full command line, program first.
    pub fn from_command_line(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("No command given for the worker to run"))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn execute(&self, job: &Job, progress: &ProgressReporter) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&job.payload)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("FRAMEFLOW_JOB_ID", &job.job_id)
            .env("FRAMEFLOW_QUEUE_TYPE", &job.queue_type)
            .env("FRAMEFLOW_TEAM_ID", &job.team_id)
            .env("FRAMEFLOW_SESSION_ID", job.session_id.as_deref().unwrap_or(""))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;

        if let Err(e) = progress.report(0, format!("running {}", self.program)).await {
            warn!(job_id = %job.job_id, error = %e, "Failed to report job start");
        }

        if let Some(mut stdin) = child.stdin.take() {
            // A child that never reads its input closes the pipe early.
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != ErrorKind::BrokenPipe {
                    return Err(e).context("Failed to write job payload");
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        if output.status.success() {
            debug!(
                job_id = %job.job_id,
                stdout_bytes = output.stdout.len(),
                "Command finished"
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(MAX_STDERR_CHARS.saturating_sub(1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        anyhow::bail!(
            "'{}' exited with {}: {}",
            self.program,
            output.status,
            &stderr[tail_start..]
        )
    }
}
