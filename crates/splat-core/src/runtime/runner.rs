use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long to wait for stdout/stderr to reach EOF once the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running tool: {0}")]
    Io(#[from] std::io::Error),
}

/// Program plus argument template.
///
/// Arguments may contain the placeholders `{input}`, `{input_dir}` and
/// `{output_dir}`, substituted per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from a whitespace-separated argument template.
    pub fn from_template(program: impl Into<String>, template: &str) -> Self {
        Self::new(program, template.split_whitespace())
    }

    fn render(&self, input: &Path, output_dir: &Path) -> Vec<String> {
        let input_dir = input.parent().unwrap_or_else(|| Path::new("."));
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input_dir}", &input_dir.to_string_lossy())
                    .replace("{output_dir}", &output_dir.to_string_lossy())
                    .replace("{input}", &input.to_string_lossy())
            })
            .collect()
    }
}

impl Default for ToolCommand {
    /// `sharp predict -i {input_dir} -o {output_dir}`
    fn default() -> Self {
        Self::from_template("sharp", "predict -i {input_dir} -o {output_dir}")
    }
}

/// How the tool invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The process was killed by a signal it did not receive from us.
    Signalled,
    /// Wall-clock bound hit; the process group was killed.
    TimedOut,
    /// Caller requested termination; the process group was killed.
    Cancelled,
}

/// Result of one tool invocation. Exit codes are reported, not judged.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub termination: Termination,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub elapsed: Duration,
}

impl ToolRun {
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// Spawns the external generation tool with a hard wall-clock bound.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    command: ToolCommand,
    tail_bytes: usize,
}

impl ToolRunner {
    pub fn new(command: ToolCommand, tail_bytes: usize) -> Self {
        Self {
            command,
            tail_bytes,
        }
    }

    pub fn command(&self) -> &ToolCommand {
        &self.command
    }

    /// Run the tool once against `input`, writing into `output_dir`.
    ///
    /// Returns when the process exits, `timeout` elapses, or `cancel` turns
    /// `true`; in the latter two cases the whole process group is killed.
    /// Files under `output_dir` are left in place on every path.
    pub async fn run(
        &self,
        input: &Path,
        output_dir: &Path,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ToolRun, RunnerError> {
        tokio::fs::create_dir_all(output_dir).await?;

        let mut command = Command::new(&self.command.program);
        command
            .args(self.command.render(input, output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        let mut guard = ProcessGuard::new(child);
        info!(
            program = %self.command.program,
            pid = ?guard.pid,
            input = %input.display(),
            "tool started"
        );

        let stdout = Arc::new(Mutex::new(TailBuffer::new(self.tail_bytes)));
        let stderr = Arc::new(Mutex::new(TailBuffer::new(self.tail_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = guard.child.stdout.take() {
            readers.push(tokio::spawn(drain(pipe, Arc::clone(&stdout))));
        }
        if let Some(pipe) = guard.child.stderr.take() {
            readers.push(tokio::spawn(drain(pipe, Arc::clone(&stderr))));
        }

        let termination = tokio::select! {
            status = guard.wait() => classify(status?),
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    pid = ?guard.pid,
                    timeout_secs = timeout.as_secs_f64(),
                    "tool timed out; killing"
                );
                guard.kill().await;
                Termination::TimedOut
            }
            _ = cancelled(&mut cancel) => {
                info!(pid = ?guard.pid, "tool cancelled; killing");
                guard.kill().await;
                Termination::Cancelled
            }
        };
        let elapsed = started.elapsed();
        // Leftover grandchildren would keep the pipes open.
        guard.kill_group();

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                abort.abort();
                debug!("output pipe still open after exit; tail may be incomplete");
            }
        }

        info!(?termination, elapsed_ms = elapsed.as_millis(), "tool finished");
        Ok(ToolRun {
            termination,
            stdout_tail: lock_to_string(&stdout),
            stderr_tail: lock_to_string(&stderr),
            elapsed,
        })
    }
}

fn classify(status: ExitStatus) -> Termination {
    match status.code() {
        Some(code) => Termination::Exited(code),
        None => Termination::Signalled,
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}

/// Owns a spawned child and its process group.
///
/// Dropping a guard whose leader was never reaped kills the group, so the tool
/// never outlives the future that started it, whichever way that future ends.
struct ProcessGuard {
    child: Child,
    pid: Option<u32>,
    reaped: bool,
}

impl ProcessGuard {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            reaped: false,
        }
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(status)
    }

    async fn kill(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "kill after group signal");
        }
        self.reaped = true;
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
            // SAFETY: killpg has no memory-safety preconditions; ESRCH for an
            // already empty group is expected and ignored.
            unsafe {
                libc::killpg(pid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        // Once the leader is reaped its pgid may belong to another tool.
        if !self.reaped {
            self.kill_group();
            let _ = self.child.start_kill();
        }
    }
}

/// Keeps only the last `cap` bytes written to it.
#[derive(Debug)]
struct TailBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            cap,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.cap == 0 {
            return;
        }
        let chunk = &chunk[chunk.len().saturating_sub(self.cap)..];
        self.buf.extend(chunk);
        let overflow = self.buf.len().saturating_sub(self.cap);
        self.buf.drain(..overflow);
    }

    fn to_string_lossy(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn lock_to_string(tail: &Mutex<TailBuffer>) -> String {
    tail.lock()
        .map(|t| t.to_string_lossy())
        .unwrap_or_default()
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, tail: Arc<Mutex<TailBuffer>>) {
    let mut chunk = vec![0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut t) = tail.lock() {
                    t.push(&chunk[..n]);
                }
            }
        }
    }
}
