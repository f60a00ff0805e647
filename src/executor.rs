//! Live-task execution: pipe-mode and PTY-mode zsh spawning, output
//! streaming, cooperative yield, poll, send, and kill.
//!
//! Every submission registers a `LiveTask` and starts a background
//! collector that drains child output with short bounded reads, enforces
//! the wall-clock timeout, and performs terminal bookkeeping: pipestatus
//! extraction, observation recording in A.L.A.N., and NEVERHANG updates.
//! The submitting call sleeps for `yield_after` and returns whatever
//! snapshot exists at that point; the client polls, sends input, or kills
//! until the task reaches a terminal state, after which one final
//! snapshot is emitted and the task leaves the registry.

use crate::alan::{self, Alan, Insight, InsightLevel};
use crate::config::Config;
use crate::error::ToolError;
use crate::fingerprint;
use crate::neverhang::CircuitBreaker;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Marker emitted by the shell wrapper between command output and the
/// per-segment exit codes. Stripped from everything the client sees.
pub const PIPESTATUS_SENTINEL: &str = "__ZSH_TOOL_PIPESTATUS__";

/// Bounded-read poll interval for collectors.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a terminal reap waits for the child before giving up.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Max characters of a command shown in task listings.
const LIST_PREVIEW_CHARS: usize = 50;

/// Lifecycle state of a live task. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Timeout,
    Killed,
    Error,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

/// How the child was spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Pipe,
    Pty,
}

/// Where `send` input goes.
enum TaskInput {
    Pipe(tokio::process::ChildStdin),
    Pty(pty_process::OwnedWritePty),
}

struct TaskState {
    buffer: String,
    read_pos: usize,
    status: TaskStatus,
    exit_code: Option<i32>,
    pipestatus: Option<Vec<i32>>,
    error: Option<String>,
    input: Option<TaskInput>,
    child: Option<tokio::process::Child>,
}

/// One supervised command execution.
pub struct LiveTask {
    task_id: String,
    command: String,
    fingerprint: String,
    mode: ExecMode,
    started_at: Instant,
    timeout_s: u64,
    state: Mutex<TaskState>,
    /// Collector abort handle, retained so a kill cancels it deterministically.
    collector: Mutex<Option<AbortHandle>>,
}

/// Client-facing view of a task at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub command: String,
    pub status: TaskStatus,
    pub elapsed_seconds: f64,
    /// Output delta since the previous snapshot, sentinel-free.
    pub output: String,
    /// Characters withheld by per-snapshot truncation (0 = none).
    pub truncated_chars: usize,
    pub has_stdin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipestatus: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One row of `zsh_tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub command: String,
    pub status: TaskStatus,
    pub mode: ExecMode,
    pub elapsed_seconds: f64,
    pub output_bytes: usize,
}

/// The execution supervisor. Holds the live-task registry and the two
/// observability subsystems, both injected so tests can isolate them.
#[derive(Clone)]
pub struct Executor {
    config: Config,
    alan: Arc<Alan>,
    breaker: Arc<CircuitBreaker>,
    tasks: Arc<Mutex<HashMap<String, Arc<LiveTask>>>>,
}

impl Executor {
    #[must_use]
    pub fn new(config: Config, alan: Arc<Alan>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            alan,
            breaker,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn alan(&self) -> &Arc<Alan> {
        &self.alan
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Submit a command, yield after the configured interval, and return
    /// the first snapshot along with A.L.A.N. insights.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<u64>,
        yield_after: Option<f64>,
        pty: bool,
    ) -> Result<(TaskSnapshot, Vec<Insight>), ToolError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ToolError::Validation("command must not be empty".into()));
        }

        let timeout_s = self.config.clamp_timeout(timeout);
        let yield_after = yield_after
            .unwrap_or(self.config.yield_after_default)
            .clamp(0.0, timeout_s as f64);

        let mut insights = self.alan.get_insights(command, timeout_s);

        let (allowed, message) = self.breaker.should_allow();
        if !allowed {
            return Err(ToolError::CircuitOpen(
                message.unwrap_or_else(|| "NEVERHANG: circuit open".into()),
            ));
        }
        if let Some(message) = message {
            insights.push((InsightLevel::Warning, message));
        }

        let task = self.spawn_task(command, timeout_s, pty).await?;
        let task_id = task.task_id.clone();
        self.tasks.lock().await.insert(task_id.clone(), task);

        tokio::time::sleep(Duration::from_secs_f64(yield_after)).await;

        let (snapshot, mut post) = self.poll(&task_id).await?;
        insights.append(&mut post);
        Ok((snapshot, insights))
    }

    /// Snapshot the output delta of a task. On a terminal status the task
    /// is removed from the registry after this snapshot, and
    /// post-execution insights are attached.
    pub async fn poll(&self, task_id: &str) -> Result<(TaskSnapshot, Vec<Insight>), ToolError> {
        let task = self
            .tasks
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTask(task_id.to_string()))?;

        let (snapshot, post_insights, terminal) = {
            let mut st = task.state.lock().await;
            let (visible, _) = extract_pipestatus(&st.buffer);
            let running = st.status == TaskStatus::Running;
            let safe_len = safe_visible_len(&visible, running);
            let start = st.read_pos.min(safe_len);
            let delta_full = &visible[start..safe_len];

            let (delta_bytes, truncated_chars) =
                truncate_at_chars(delta_full, self.config.truncate_output_at);
            let delta = delta_full[..delta_bytes].to_string();
            st.read_pos = start + delta_bytes;

            let terminal = st.status.is_terminal() && truncated_chars == 0;
            let snapshot = TaskSnapshot {
                task_id: task.task_id.clone(),
                command: task.command.clone(),
                status: st.status,
                elapsed_seconds: task.started_at.elapsed().as_secs_f64(),
                output: delta,
                truncated_chars,
                has_stdin: st.input.is_some(),
                exit_code: st.exit_code,
                pipestatus: st.pipestatus.clone(),
                error: st.error.clone(),
            };
            let post_insights = if st.status.is_terminal() {
                alan::get_post_insights(
                    &task.command,
                    st.pipestatus.as_deref().unwrap_or(&[]),
                    &visible,
                )
            } else {
                Vec::new()
            };
            (snapshot, post_insights, terminal)
        };

        if terminal {
            self.tasks.lock().await.remove(task_id);
        }
        Ok((snapshot, post_insights))
    }

    /// Write input to a running task's stdin (pipe) or PTY master.
    /// A trailing newline is appended when missing.
    pub async fn send(&self, task_id: &str, input: &str) -> Result<(), ToolError> {
        let task = self
            .tasks
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTask(task_id.to_string()))?;

        let mut st = task.state.lock().await;
        if st.status != TaskStatus::Running {
            return Err(ToolError::NotRunning(task_id.to_string()));
        }
        let mut data = input.to_string();
        if !data.ends_with('\n') {
            data.push('\n');
        }
        match st.input.as_mut() {
            Some(TaskInput::Pipe(stdin)) => {
                stdin
                    .write_all(data.as_bytes())
                    .await
                    .map_err(|e| ToolError::IoFailure(format!("stdin write: {e}")))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| ToolError::IoFailure(format!("stdin flush: {e}")))?;
            }
            Some(TaskInput::Pty(writer)) => {
                writer
                    .write_all(data.as_bytes())
                    .await
                    .map_err(|e| ToolError::IoFailure(format!("pty write: {e}")))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| ToolError::IoFailure(format!("pty flush: {e}")))?;
            }
            None => return Err(ToolError::IoFailure("task has no input handle".into())),
        }
        Ok(())
    }

    /// Forcefully kill a running task's process group. The task stays in
    /// the registry until its final snapshot is polled.
    pub async fn kill(&self, task_id: &str) -> Result<(), ToolError> {
        let task = self
            .tasks
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTask(task_id.to_string()))?;

        {
            let mut st = task.state.lock().await;
            if st.status != TaskStatus::Running {
                return Err(ToolError::NotRunning(task_id.to_string()));
            }
            st.status = TaskStatus::Killed;
            st.input = None;
            if let Some(child) = st.child.as_mut() {
                if let Err(e) = kill_task_group(child) {
                    tracing::warn!(task_id = %task_id, error = %e, "kill failed, aborting child handle");
                    let _ = child.start_kill();
                }
                match task.mode {
                    ExecMode::Pipe => {
                        let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
                    }
                    ExecMode::Pty => {
                        let _ = child.try_wait();
                    }
                }
            }
            st.child = None;
        }

        if let Some(handle) = task.collector.lock().await.take() {
            handle.abort();
        }
        tracing::info!(task_id = %task_id, "task killed");
        Ok(())
    }

    /// The live registry with command previews.
    pub async fn list_tasks(&self) -> Vec<TaskSummary> {
        let tasks: Vec<Arc<LiveTask>> = self.tasks.lock().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let st = task.state.lock().await;
            summaries.push(TaskSummary {
                task_id: task.task_id.clone(),
                command: task.command.chars().take(LIST_PREVIEW_CHARS).collect(),
                status: st.status,
                mode: task.mode,
                elapsed_seconds: task.started_at.elapsed().as_secs_f64(),
                output_bytes: st.buffer.len(),
            });
        }
        summaries
    }

    /// Number of live tasks (for health checks).
    pub async fn active_tasks(&self) -> usize {
        self.tasks.lock().await.len()
    }

    async fn spawn_task(
        &self,
        command: &str,
        timeout_s: u64,
        pty: bool,
    ) -> Result<Arc<LiveTask>, ToolError> {
        let task_id = new_task_id();
        let wrapped = wrap_command(command);

        let mut stderr_reader = None;
        let (child, input, reader, mode): (
            tokio::process::Child,
            TaskInput,
            Box<dyn AsyncRead + Send + Unpin>,
            ExecMode,
        ) = if pty {
            let (master, pts) = pty_process::open()
                .map_err(|e| ToolError::SpawnFailure(format!("pty open: {e}")))?;
            master
                .resize(pty_process::Size::new(24, 80))
                .map_err(|e| ToolError::SpawnFailure(format!("pty resize: {e}")))?;
            let mut cmd = pty_process::Command::new("/bin/zsh").arg("-c").arg(&wrapped);
            let spawned = cmd
                .spawn(pts)
                .map_err(|e| ToolError::SpawnFailure(format!("zsh on pty: {e}")))?;
            let (read_pty, write_pty) = master.into_split();
            (
                spawned,
                TaskInput::Pty(write_pty),
                Box::new(read_pty),
                ExecMode::Pty,
            )
        } else {
            let mut cmd = tokio::process::Command::new("/bin/zsh");
            cmd.arg("-c").arg(&wrapped);
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.kill_on_drop(true);
            // Detach the shell into its own session so one SIGKILL to the
            // group id reaches every descendant.
            // SAFETY: the closure runs in the forked child before exec;
            // setsid is async-signal-safe.
            unsafe {
                cmd.pre_exec(|| match nix::unistd::setsid() {
                    Ok(_) => Ok(()),
                    Err(errno) => Err(std::io::Error::from_raw_os_error(errno as i32)),
                });
            }
            let mut spawned = cmd
                .spawn()
                .map_err(|e| ToolError::SpawnFailure(e.to_string()))?;
            let stdin = spawned
                .stdin
                .take()
                .ok_or_else(|| ToolError::SpawnFailure("stdin not piped".into()))?;
            let stdout = spawned
                .stdout
                .take()
                .ok_or_else(|| ToolError::SpawnFailure("stdout not piped".into()))?;
            stderr_reader = spawned.stderr.take();
            (
                spawned,
                TaskInput::Pipe(stdin),
                Box::new(stdout),
                ExecMode::Pipe,
            )
        };

        tracing::info!(task_id = %task_id, mode = ?mode, timeout_s, command = %command, "spawned");

        let task = Arc::new(LiveTask {
            task_id,
            command: command.to_string(),
            fingerprint: fingerprint::fingerprint(command),
            mode,
            started_at: Instant::now(),
            timeout_s,
            state: Mutex::new(TaskState {
                buffer: String::new(),
                read_pos: 0,
                status: TaskStatus::Running,
                exit_code: None,
                pipestatus: None,
                error: None,
                input: Some(input),
                child: Some(child),
            }),
            collector: Mutex::new(None),
        });

        // The shell's own stderr (parse errors) arrives out of band in
        // pipe mode; command stderr is already merged by the wrapper.
        if let Some(stderr) = stderr_reader {
            let task_for_stderr = task.clone();
            tokio::spawn(async move {
                drain_into_buffer(stderr, task_for_stderr).await;
            });
        }

        let collector = tokio::spawn(run_collector(
            task.clone(),
            reader,
            self.alan.clone(),
            self.breaker.clone(),
        ));
        *task.collector.lock().await = Some(collector.abort_handle());

        // Supervise the collector: a panic transitions the task to ERROR
        // and is surfaced on the next snapshot. An abort (kill) is not an
        // error.
        let supervised = task.clone();
        tokio::spawn(async move {
            if let Err(join_err) = collector.await
                && join_err.is_panic()
            {
                let mut st = supervised.state.lock().await;
                if st.status == TaskStatus::Running {
                    st.status = TaskStatus::Error;
                    st.error = Some(format!("collector failed: {join_err}"));
                    st.input = None;
                    if let Some(mut child) = st.child.take() {
                        let _ = child.start_kill();
                    }
                }
            }
        });

        Ok(task)
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Drain child output with bounded reads, enforce the timeout, and do the
/// terminal bookkeeping: pipestatus extraction, NEVERHANG update, and one
/// A.L.A.N. observation (completions and timeouts only; a kill is an
/// operator action, not a command outcome).
async fn run_collector(
    task: Arc<LiveTask>,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    alan: Arc<Alan>,
    breaker: Arc<CircuitBreaker>,
) {
    let mut buf = [0u8; 4096];
    let timeout = Duration::from_secs(task.timeout_s);

    loop {
        let mut eof = false;
        let mut idle = false;
        match tokio::time::timeout(READ_POLL_INTERVAL, reader.read(&mut buf)).await {
            Ok(Ok(0)) => eof = true,
            Ok(Ok(n)) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                task.state.lock().await.buffer.push_str(&chunk);
            }
            // A PTY master reads EIO once the child side is gone.
            Ok(Err(_)) => eof = true,
            Err(_) => idle = true,
        }

        if task.state.lock().await.status != TaskStatus::Running {
            return;
        }

        if eof {
            finish_exit(&task, &alan, &breaker).await;
            return;
        }

        if task.started_at.elapsed() >= timeout {
            finish_timeout(&task, &alan, &breaker).await;
            return;
        }

        // No data this round: the child may have exited without an EOF
        // reaching us yet (seen with reused PTY descriptors).
        if idle {
            let exited = {
                let mut st = task.state.lock().await;
                match st.child.as_mut() {
                    Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                    None => true,
                }
            };
            if exited {
                // Pick up anything written between the read timeout and
                // the exit check before closing out.
                while let Ok(Ok(n)) =
                    tokio::time::timeout(READ_POLL_INTERVAL, reader.read(&mut buf)).await
                {
                    if n == 0 {
                        break;
                    }
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    task.state.lock().await.buffer.push_str(&chunk);
                }
                finish_exit(&task, &alan, &breaker).await;
                return;
            }
        }
    }
}

async fn drain_into_buffer(mut reader: tokio::process::ChildStderr, task: Arc<LiveTask>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                task.state.lock().await.buffer.push_str(&chunk);
            }
        }
    }
}

/// Terminal transition for a child that exited on its own.
async fn finish_exit(task: &Arc<LiveTask>, alan: &Alan, breaker: &CircuitBreaker) {
    let (output, pipestatus, exit_code) = {
        let mut st = task.state.lock().await;
        let exit_code = match st.child.as_mut() {
            Some(child) => match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => status.code().unwrap_or(-1),
                _ => -1,
            },
            None => -1,
        };
        st.child = None;
        st.input = None;

        let (clean, codes) = extract_pipestatus(&st.buffer);
        st.buffer = clean.clone();
        let pipestatus = codes.unwrap_or_else(|| vec![exit_code]);
        st.exit_code = Some(exit_code);
        st.pipestatus = Some(pipestatus.clone());
        st.status = TaskStatus::Completed;
        (clean, pipestatus, exit_code)
    };

    let duration_ms = task.started_at.elapsed().as_millis() as u64;
    tracing::info!(
        task_id = %task.task_id,
        exit_code,
        duration_ms,
        pipestatus = ?pipestatus,
        "completed"
    );

    breaker.record_success();
    let snippet = crate::output::strip_ansi(&output);
    alan.record(
        &task.command,
        exit_code,
        duration_ms,
        false,
        Some(&snippet),
        None,
        &pipestatus,
    );
}

/// Terminal transition for a child that outlived its timeout.
async fn finish_timeout(task: &Arc<LiveTask>, alan: &Alan, breaker: &CircuitBreaker) {
    let output = {
        let mut st = task.state.lock().await;
        if let Some(child) = st.child.as_mut() {
            if kill_task_group(child).is_err() {
                let _ = child.start_kill();
            }
            let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
        }
        st.child = None;
        st.input = None;

        let (clean, _) = extract_pipestatus(&st.buffer);
        st.buffer = clean.clone();
        st.exit_code = Some(-1);
        st.pipestatus = Some(vec![-1]);
        st.status = TaskStatus::Timeout;
        clean
    };

    let duration_ms = task.started_at.elapsed().as_millis() as u64;
    tracing::warn!(
        task_id = %task.task_id,
        timeout_s = task.timeout_s,
        "timed out, killed process group"
    );

    breaker.record_timeout(&task.fingerprint);
    let snippet = crate::output::strip_ansi(&output);
    alan.record(
        &task.command,
        -1,
        duration_ms,
        true,
        Some(&snippet),
        None,
        &[-1],
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wrap a command so zsh emits the sentinel pipestatus line after it and
/// exits with the final segment's code. The forced leading newline keeps
/// extraction robust when the command prints no trailing newline.
fn wrap_command(command: &str) -> String {
    format!(
        "{{\n{command}\n}} 2>&1\n\
         __zt_ps=\"${{pipestatus[*]}}\"\n\
         printf '\\n{PIPESTATUS_SENTINEL} %s\\n' \"$__zt_ps\"\n\
         exit \"${{__zt_ps##* }}\"\n"
    )
}

/// Split the sentinel line out of a raw buffer. Returns the buffer with
/// the marker (and the newline that forced it onto its own line) removed,
/// plus the parsed codes when the marker was present. Tolerates PTY CRLF
/// translation and a marker that is not the final content.
pub fn extract_pipestatus(buffer: &str) -> (String, Option<Vec<i32>>) {
    let Some(idx) = buffer.rfind(PIPESTATUS_SENTINEL) else {
        return (buffer.to_string(), None);
    };
    let after = &buffer[idx + PIPESTATUS_SENTINEL.len()..];
    let line_end = after.find('\n').map(|p| p + 1).unwrap_or(after.len());
    let codes: Vec<i32> = after[..line_end]
        .split_whitespace()
        .filter_map(|tok| tok.parse().ok())
        .collect();

    let mut head = &buffer[..idx];
    if let Some(stripped) = head.strip_suffix("\r\n") {
        head = stripped;
    } else if let Some(stripped) = head.strip_suffix('\n') {
        head = stripped;
    }
    let clean = format!("{head}{}", &after[line_end..]);
    let codes = if codes.is_empty() { None } else { Some(codes) };
    (clean, codes)
}

/// While a task is running, withhold a trailing line fragment that could
/// be the beginning of the sentinel so it is never shown to the client.
fn safe_visible_len(visible: &str, running: bool) -> usize {
    if !running {
        return visible.len();
    }
    let tail_start = visible.rfind('\n').map(|p| p + 1).unwrap_or(0);
    let tail = visible[tail_start..].trim_start_matches('\r');
    if !tail.is_empty() && PIPESTATUS_SENTINEL.starts_with(tail) {
        tail_start
    } else {
        visible.len()
    }
}

/// Byte length of the first `max_chars` characters, plus how many
/// characters fall beyond the cap.
fn truncate_at_chars(s: &str, max_chars: usize) -> (usize, usize) {
    let mut count = 0usize;
    for (i, _) in s.char_indices() {
        if count == max_chars {
            return (i, s[i..].chars().count());
        }
        count += 1;
    }
    (s.len(), 0)
}

/// SIGKILL the task's whole process group. Both spawn paths make the
/// shell a session leader, so the group id equals its PID.
fn kill_task_group(child: &tokio::process::Child) -> Result<(), String> {
    let Some(pid) = child.id() else {
        return Err("child already reaped, nothing to signal".to_string());
    };
    let group = nix::unistd::Pid::from_raw(pid as i32);
    nix::sys::signal::killpg(group, nix::sys::signal::Signal::SIGKILL)
        .map_err(|errno| format!("killpg({group}): {errno}"))
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
