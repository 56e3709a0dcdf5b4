//! Subprocess pipelines.
//!
//! An ordered, non-empty list of stages is started with stage i's stdout
//! piped into stage i+1's stdin. Every stage's stderr is drained by a
//! background task into the job log under the stage's module tag. The
//! pipeline is the single owner of its children: `wait_all` resolves once
//! every stage has exited, and `shutdown` signals every still-running stage
//! before waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use common::{JobLog, Module};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to start {stage}: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stage {stage} exited with status {status}")]
    StageFailed { stage: String, status: i32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One stage of a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub program: String,
    pub args: Vec<String>,
    /// tag for the stage's stderr records in the job log
    pub module: Module,
}

impl StageSpec {
    pub fn new(program: impl Into<String>, module: Module) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            module,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Short name used in diagnostics.
    fn name(&self) -> String {
        std::path::Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Where the pipeline's outer ends go.
enum Endpoints {
    /// last stage's stdout is exposed as a reader
    Reader,
    /// first stage's stdin is exposed as a writer
    Writer,
    /// no exposed ends; first stdin comes from `stdin_file` or null
    Detached {
        stdin_file: Option<std::fs::File>,
    },
}

pub struct Pipeline {
    children: Vec<(String, Child)>,
    drains: Vec<tokio::task::JoinHandle<()>>,
    sentinel_seen: Arc<AtomicBool>,
}

/// Start a pipeline whose last stage's stdout is returned as a reader.
pub fn reader(
    stages: &[StageSpec],
    log: Option<Arc<JobLog>>,
    sentinel: Option<&str>,
) -> Result<(Pipeline, ChildStdout), PipelineError> {
    let (pipeline, _, stdout) = spawn(stages, Endpoints::Reader, log, sentinel)?;
    Ok((pipeline, stdout.expect("reader pipeline exposes stdout")))
}

/// Start a pipeline whose first stage's stdin is returned as a writer.
/// Dropping the writer closes the chain's upstream end.
pub fn writer(
    stages: &[StageSpec],
    log: Option<Arc<JobLog>>,
) -> Result<(Pipeline, ChildStdin), PipelineError> {
    let (pipeline, stdin, _) = spawn(stages, Endpoints::Writer, log, None)?;
    Ok((pipeline, stdin.expect("writer pipeline exposes stdin")))
}

/// Start a pipeline with no exposed ends (prepare, in-place decompress).
pub fn detached(
    stages: &[StageSpec],
    log: Option<Arc<JobLog>>,
    sentinel: Option<&str>,
) -> Result<Pipeline, PipelineError> {
    let (pipeline, _, _) = spawn(stages, Endpoints::Detached { stdin_file: None }, log, sentinel)?;
    Ok(pipeline)
}

/// Start a pipeline reading its first stage's stdin from an open file
/// (the qpress spill path).
pub fn detached_from_file(
    stages: &[StageSpec],
    stdin_file: std::fs::File,
    log: Option<Arc<JobLog>>,
) -> Result<Pipeline, PipelineError> {
    let endpoints = Endpoints::Detached {
        stdin_file: Some(stdin_file),
    };
    let (pipeline, _, _) = spawn(stages, endpoints, log, None)?;
    Ok(pipeline)
}

fn spawn(
    stages: &[StageSpec],
    endpoints: Endpoints,
    log: Option<Arc<JobLog>>,
    sentinel: Option<&str>,
) -> Result<(Pipeline, Option<ChildStdin>, Option<ChildStdout>), PipelineError> {
    assert!(!stages.is_empty(), "a pipeline needs at least one stage");
    let shell_line = stages
        .iter()
        .map(StageSpec::display)
        .collect::<Vec<_>>()
        .join(" | ");
    tracing::info!("running: {shell_line}");
    if let Some(log) = &log {
        log.write(stages[0].module, &format!("running: {shell_line}"));
    }
    let sentinel_seen = Arc::new(AtomicBool::new(false));
    let mut children: Vec<(String, Child)> = Vec::with_capacity(stages.len());
    let mut drains = Vec::with_capacity(stages.len());
    let mut upstream: Option<ChildStdout> = None;
    let mut first_stdin = None;
    let expose_reader = matches!(endpoints, Endpoints::Reader);
    let expose_writer = matches!(endpoints, Endpoints::Writer);
    let mut stdin_file = match endpoints {
        Endpoints::Detached { stdin_file } => stdin_file,
        _ => None,
    };
    let last = stages.len() - 1;
    for (index, stage) in stages.iter().enumerate() {
        let mut command = Command::new(&stage.program);
        command.args(&stage.args);
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);
        if index == 0 {
            if expose_writer {
                command.stdin(std::process::Stdio::piped());
            } else if let Some(file) = stdin_file.take() {
                command.stdin(std::process::Stdio::from(file));
            } else {
                command.stdin(std::process::Stdio::null());
            }
        } else {
            let pipe = upstream.take().expect("previous stage left its stdout");
            command.stdin(std::process::Stdio::from(pipe.into_owned_fd()?));
        }
        if index < last || expose_reader {
            command.stdout(std::process::Stdio::piped());
        } else {
            command.stdout(std::process::Stdio::null());
        }
        let mut child = command.spawn().map_err(|source| PipelineError::Spawn {
            stage: stage.name(),
            source,
        })?;
        if index == 0 && expose_writer {
            first_stdin = child.stdin.take();
        }
        upstream = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain_stderr(
                stderr,
                stage.module,
                log.clone(),
                sentinel.map(str::to_owned),
                sentinel_seen.clone(),
            ));
        }
        children.push((stage.name(), child));
    }
    let pipeline = Pipeline {
        children,
        drains,
        sentinel_seen,
    };
    Ok((pipeline, first_stdin, upstream))
}

fn drain_stderr(
    stderr: tokio::process::ChildStderr,
    module: Module,
    log: Option<Arc<JobLog>>,
    sentinel: Option<String>,
    sentinel_seen: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("[{module}] {line}");
            if let Some(log) = &log {
                log.write(module, &line);
            }
            if let Some(sentinel) = &sentinel {
                if line.contains(sentinel.as_str()) {
                    sentinel_seen.store(true, Ordering::SeqCst);
                }
            }
        }
    })
}

impl Pipeline {
    /// Whether any stage's stderr contained the configured sentinel. Only
    /// meaningful after [`Pipeline::wait_all`] has joined the drains.
    pub fn sentinel_seen(&self) -> bool {
        self.sentinel_seen.load(Ordering::SeqCst)
    }

    /// Wait for every stage. Succeeds only if every stage exited with
    /// status zero; the first failure (in stage order) is the one reported.
    pub async fn wait_all(&mut self) -> Result<(), PipelineError> {
        let mut first_failure = None;
        for (name, child) in &mut self.children {
            let status = child.wait().await?;
            if status.success() {
                tracing::debug!("{name} exited cleanly");
            } else {
                let code = status.code().unwrap_or(-1);
                tracing::warn!("{name} exited with status {code}");
                if first_failure.is_none() {
                    first_failure = Some(PipelineError::StageFailed {
                        stage: name.clone(),
                        status: code,
                    });
                }
            }
        }
        for drain in self.drains.drain(..) {
            let _ = drain.await;
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Signal every still-running stage, then wait on all of them.
    /// Best-effort; exit statuses are not inspected.
    pub async fn shutdown(&mut self) {
        for (name, child) in &mut self.children {
            if let Err(error) = child.start_kill() {
                tracing::debug!("terminating {name}: {error}");
            }
        }
        for (_, child) in &mut self.children {
            let _ = child.wait().await;
        }
        for drain in self.drains.drain(..) {
            let _ = drain.await;
        }
    }
}
