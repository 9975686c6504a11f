use log::{debug, error, info};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::ProcessorCommand;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("worker pool is shut down")]
    PoolClosed,
}

/// Captured output of a successful run
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Runs the external processing command with bounded concurrency
///
/// At most `workers` commands run at once; further callers wait for a slot.
/// There is no cancellation: once a run has a slot it is awaited to the end
/// (or to the optional timeout, which kills the child).
pub struct Processor {
    command: ProcessorCommand,
    permits: Arc<Semaphore>,
    workers: usize,
    timeout: Option<Duration>,
    template_candidates: Vec<PathBuf>,
}

impl Processor {
    pub fn new(
        command: ProcessorCommand,
        workers: usize,
        timeout: Option<Duration>,
        template_candidates: Vec<PathBuf>,
    ) -> Self {
        let workers = workers.max(1);
        Processor {
            command,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            timeout,
            template_candidates,
        }
    }

    /// Free slots right now
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Arguments with `{input}`, `{output_dir}` and `{template}` filled in
    ///
    /// `{template}` becomes the first template candidate that exists, or the
    /// first candidate when none does so the command can report the path.
    pub fn render_args(&self, input: &Path, output_dir: &Path) -> Vec<OsString> {
        let template = self
            .template_candidates
            .iter()
            .find(|path| path.exists())
            .or_else(|| self.template_candidates.first())
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        let input_str = input.to_string_lossy();
        let output_str = output_dir.to_string_lossy();

        let mut has_input = false;
        let mut args: Vec<OsString> = self
            .command
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{input}") {
                    has_input = true;
                }
                OsString::from(
                    arg.replace("{input}", &input_str)
                        .replace("{output_dir}", &output_str)
                        .replace("{template}", &template),
                )
            })
            .collect();
        if !has_input {
            args.push(input.as_os_str().to_owned());
        }
        args
    }

    /// Run the command against one saved input and wait for it to exit
    ///
    /// # Arguments
    /// * `input` - Path of the saved upload
    /// * `output_dir` - Directory the command is expected to write its result into
    ///
    /// # Returns
    /// * `Result<CommandOutput, ProcessError>` - Captured output, or why the run failed
    pub async fn run(&self, input: &Path, output_dir: &Path) -> Result<CommandOutput, ProcessError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProcessError::PoolClosed)?;

        let program = self.command.program.clone();
        let args = self.render_args(input, output_dir);
        info!("Running {} {:?}", program, args);

        let started = Instant::now();
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = match self.timeout {
            Some(after) => match tokio::time::timeout(after, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    error!("{} timed out after {:?}", program, after);
                    return Err(ProcessError::Timeout { program, after });
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let elapsed = started.elapsed();

        if !output.status.success() {
            error!(
                "{} failed ({}) after {:?}\nstdout: {}\nstderr: {}",
                program,
                output.status,
                elapsed,
                stdout.trim(),
                stderr.trim()
            );
            return Err(ProcessError::Exit {
                program,
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!("{} finished in {:?}: {}", program, elapsed, stdout.trim());
        Ok(CommandOutput {
            stdout,
            stderr,
            elapsed,
        })
    }
}
