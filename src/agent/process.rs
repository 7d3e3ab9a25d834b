//! External coding-agent processes
//!
//! Spawns a process that reports progress as NDJSON on stdout, streams the
//! output through a `ProcessOutputParser`, and kills the process when it runs
//! past its timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::streaming::ProcessOutputParser;

/// What to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Claude CLI in streaming JSON mode, optionally resuming a session
    pub fn claude(prompt: &str, resume: Option<&str>) -> Self {
        let mut spec = Self::new("claude")
            .arg("-p")
            .arg(prompt)
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json");
        if let Some(session_id) = resume {
            spec = spec.arg("--resume").arg(session_id);
        }
        spec
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSummary {
    pub session_id: Option<String>,
    pub total_cost: f64,
    pub assistant_messages: usize,
    /// Text of the last `result` message, if any
    pub result: Option<String>,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Reading process output failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),
}

pub struct CodingAgentProcess {
    spec: ProcessSpec,
}

impl CodingAgentProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Run to completion, feeding stdout through `parser`
    ///
    /// The parser is closed before returning, so any attached handler has
    /// seen every message by then.
    pub async fn run(&self, mut parser: ProcessOutputParser) -> Result<ProcessSummary, ProcessError> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;
        info!("Spawned {} (pid {:?})", self.spec.program, child.id());

        if let Some(stderr) = child.stderr.take() {
            let program = self.spec.program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("{} stderr: {}", program, line);
                }
            });
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout not captured"))?;

        let mut result = None;
        let run = tokio::time::timeout(self.spec.timeout, async {
            let mut buf = vec![0u8; 8192];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                for message in parser.feed_bytes(&buf[..n]).await {
                    if message.kind == "result" {
                        result = message.text();
                    }
                }
            }
            // The process is done; a final line without newline still counts
            for message in parser.flush().await {
                if message.kind == "result" {
                    result = message.text();
                }
            }
            child.wait().await
        })
        .await;

        let status = match run {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                parser.close().await;
                return Err(ProcessError::Io(e));
            }
            Err(_) => {
                warn!("{} timed out after {:?}, killing", self.spec.program, self.spec.timeout);
                let _ = child.kill().await;
                parser.close().await;
                return Err(ProcessError::Timeout(self.spec.timeout));
            }
        };

        let summary = ProcessSummary {
            session_id: parser.session_id().map(str::to_string),
            total_cost: parser.total_cost(),
            assistant_messages: parser.message_count(),
            result,
            exit_code: status.code(),
            success: status.success(),
            duration: started.elapsed(),
        };
        parser.close().await;

        info!(
            "{} exited with {:?} after {:?} (cost ${:.4})",
            self.spec.program, summary.exit_code, summary.duration, summary.total_cost
        );
        Ok(summary)
    }
}
