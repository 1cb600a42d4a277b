//! Runs a subprocess as a task.
//!
//! - working directory: the job's working directory
//! - stdout lines go to the task log at `info`, stderr lines at `warning`
//! - a stdout line `PROGRESS <fraction>` is turned into a progress report
//! - cancellation kills the child

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::typed::{Handler, TaskParams};
use super::TaskContext;
use crate::domain::LogLevel;
use crate::error::ExecutionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandParams {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandParams {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl TaskParams for CommandParams {
    const KIND: &'static str = "command";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

const PROGRESS_PREFIX: &str = "PROGRESS ";

fn relay(ctx: &TaskContext, level: LogLevel, line: String) {
    if let Some(fraction) = line
        .strip_prefix(PROGRESS_PREFIX)
        .and_then(|rest| rest.trim().parse::<f64>().ok())
    {
        ctx.report_progress(fraction, None);
    } else {
        ctx.log(level, line);
    }
}

#[async_trait]
impl Handler<CommandParams> for CommandExecutor {
    async fn handle(&self, params: CommandParams, ctx: TaskContext) -> Result<serde_json::Value, ExecutionError> {
        tracing::info!(
            job_id = %ctx.job_id(),
            task_id = %ctx.task_id(),
            program = %params.program,
            args = ?params.args,
            "spawning command"
        );

        let mut child = Command::new(&params.program)
            .args(&params.args)
            .envs(&params.env)
            .current_dir(ctx.work_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::failed(format!("cannot spawn {}: {e}", params.program)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let drive = async {
            let mut out = stdout.map(|s| BufReader::new(s).lines());
            let mut err = stderr.map(|s| BufReader::new(s).lines());
            while out.is_some() || err.is_some() {
                tokio::select! {
                    line = async { out.as_mut()?.next_line().await.ok().flatten() }, if out.is_some() => {
                        match line {
                            Some(line) => relay(&ctx, LogLevel::Info, line),
                            None => out = None,
                        }
                    }
                    line = async { err.as_mut()?.next_line().await.ok().flatten() }, if err.is_some() => {
                        match line {
                            Some(line) => relay(&ctx, LogLevel::Warning, line),
                            None => err = None,
                        }
                    }
                }
            }
            child.wait().await
        };

        let finished = tokio::select! {
            status = drive => Some(status),
            _ = ctx.cancelled() => None,
        };

        let Some(status) = finished else {
            if let Err(e) = child.start_kill() {
                tracing::warn!(task_id = %ctx.task_id(), error = %e, "kill failed");
            }
            let _ = child.wait().await;
            return Err(ExecutionError::Cancelled);
        };

        let status = status.map_err(|e| ExecutionError::failed(format!("wait failed: {e}")))?;
        match status.code() {
            Some(0) => Ok(json!({ "exit_code": 0 })),
            Some(code) => Err(ExecutionError::failed(format!(
                "{} exited with status {code}",
                params.program
            ))),
            None => Err(ExecutionError::failed(format!(
                "{} terminated by signal",
                params.program
            ))),
        }
    }
}
