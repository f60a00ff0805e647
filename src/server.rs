//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `ZshToolServer` with MCP tools for:
//! - Supervised execution: `zsh`, `zsh_poll`, `zsh_send`, `zsh_kill`,
//!   `zsh_tasks`
//! - Health and learning: `zsh_health`, `zsh_alan_stats`, `zsh_alan_query`,
//!   `zsh_neverhang_status`, `zsh_neverhang_reset`

use crate::alan::Alan;
use crate::config::Config;
use crate::error::ToolError;
use crate::executor::Executor;
use crate::neverhang::CircuitBreaker;
use crate::output;
use crate::store::Store;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `zsh` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ZshParams {
    /// The shell command to execute (passed to /bin/zsh -c).
    pub command: String,
    /// Maximum execution time in seconds. Defaults to 120, capped at 600.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Seconds to wait before yielding a snapshot. Defaults to 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yield_after: Option<f64>,
    /// Short human-readable description of the command (logged only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Run on a pseudo-terminal so the command sees isatty()=true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty: Option<bool>,
}

/// Parameters for the `zsh_poll` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct PollParams {
    /// ID of the task to snapshot.
    pub task_id: String,
}

/// Parameters for the `zsh_send` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SendParams {
    /// ID of the task to write to.
    pub task_id: String,
    /// Text to write to the task's stdin; a newline is appended if missing.
    pub input: String,
}

/// Parameters for the `zsh_kill` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct KillParams {
    /// ID of the task to kill.
    pub task_id: String,
}

/// Parameters for the `zsh_alan_query` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct AlanQueryParams {
    /// Command to look up pattern statistics for.
    pub command: String,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The zsh-tool MCP server.
///
/// Holds the [`Executor`] (live tasks plus the injected A.L.A.N. and
/// NEVERHANG instances).
#[derive(Clone)]
pub struct ZshToolServer {
    executor: Executor,
    tool_router: ToolRouter<ZshToolServer>,
}

impl ZshToolServer {
    /// Create a server instance backed by the store at the configured path.
    pub fn new(config: Config) -> Result<Self, ToolError> {
        let store = Store::open(&config.alan_db_path)?;
        let alan = Arc::new(Alan::new(store, config.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            config.neverhang_failure_threshold,
            config.neverhang_recovery_timeout,
            config.neverhang_sample_window,
        ));
        Ok(Self::with_components(config, alan, breaker))
    }

    /// Create a server instance around pre-built subsystems (tests use
    /// this to point A.L.A.N. at a temporary store).
    #[must_use]
    pub fn with_components(config: Config, alan: Arc<Alan>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            executor: Executor::new(config, alan, breaker),
            tool_router: Self::tool_router(),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Surface a [`ToolError`] as a `{"success": false, "error"}` value.
fn err_result(err: &ToolError) -> Result<CallToolResult, McpError> {
    let json = serde_json::json!({
        "success": false,
        "error": err.to_string(),
    });
    Ok(CallToolResult::error(vec![Content::text(
        serde_json::to_string_pretty(&json).unwrap_or_else(|_| err.to_string()),
    )]))
}

#[tool_router]
impl ZshToolServer {
    #[tool(
        description = "Execute a command under /bin/zsh with supervision. Yields a task snapshot after yield_after seconds (default 2): output so far plus a status line. If the task is still RUNNING, use zsh_poll to stream more output, zsh_send for interactive input, zsh_kill to stop it. Captures per-pipeline-segment exit codes (pipestatus), enforces the timeout (default 120s, max 600s), and annotates results with A.L.A.N. insights (pattern reliability, timeout risk, masked pipe failures, option tables for repeatedly failing commands). Set pty=true for commands that need a real terminal. Submission is blocked while the NEVERHANG circuit is open after repeated hangs."
    )]
    async fn zsh(
        &self,
        Parameters(params): Parameters<ZshParams>,
    ) -> Result<CallToolResult, McpError> {
        if let Some(description) = &params.description {
            tracing::info!(command = %params.command, description = %description, "zsh");
        } else {
            tracing::info!(command = %params.command, "zsh");
        }

        match self
            .executor
            .execute(
                &params.command,
                params.timeout,
                params.yield_after,
                params.pty.unwrap_or(false),
            )
            .await
        {
            Ok((snapshot, insights)) => {
                tracing::info!(
                    task_id = %snapshot.task_id,
                    status = ?snapshot.status,
                    "zsh yielded"
                );
                Ok(CallToolResult::success(vec![Content::text(
                    output::render_snapshot(&snapshot, &insights),
                )]))
            }
            Err(e) => err_result(&e),
        }
    }

    #[tool(
        description = "Snapshot a running or finished task: the output delta since the last snapshot, status, elapsed time, and (once terminal) exit code and pipestatus. A terminal snapshot removes the task from the registry."
    )]
    async fn zsh_poll(
        &self,
        Parameters(params): Parameters<PollParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.executor.poll(&params.task_id).await {
            Ok((snapshot, insights)) => Ok(CallToolResult::success(vec![Content::text(
                output::render_snapshot(&snapshot, &insights),
            )])),
            Err(e) => err_result(&e),
        }
    }

    #[tool(
        description = "Write input to a RUNNING task's stdin (pipe mode) or terminal (PTY mode). A trailing newline is appended if missing. Use for interactive prompts (confirmations, passwords, REPLs)."
    )]
    async fn zsh_send(
        &self,
        Parameters(params): Parameters<SendParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.executor.send(&params.task_id, &params.input).await {
            Ok(()) => json_content(&serde_json::json!({
                "success": true,
                "message": format!("input sent to task {}", params.task_id),
            })),
            Err(e) => err_result(&e),
        }
    }

    #[tool(
        description = "Forcefully kill a RUNNING task's process group. The task's final snapshot stays available via zsh_poll until retrieved."
    )]
    async fn zsh_kill(
        &self,
        Parameters(params): Parameters<KillParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(task_id = %params.task_id, "zsh_kill");
        match self.executor.kill(&params.task_id).await {
            Ok(()) => json_content(&serde_json::json!({
                "success": true,
                "message": format!("task {} killed", params.task_id),
            })),
            Err(e) => err_result(&e),
        }
    }

    #[tool(
        description = "List all live tasks with their ID, command preview, status, elapsed time, and buffered output size."
    )]
    async fn zsh_tasks(&self) -> Result<CallToolResult, McpError> {
        let tasks = self.executor.list_tasks().await;
        json_content(&serde_json::json!({
            "count": tasks.len(),
            "tasks": tasks,
        }))
    }

    #[tool(
        description = "Service health: NEVERHANG circuit state, A.L.A.N. store summary, and active task count."
    )]
    async fn zsh_health(&self) -> Result<CallToolResult, McpError> {
        json_content(&serde_json::json!({
            "status": "healthy",
            "neverhang": self.executor.breaker().status(),
            "alan": self.executor.alan().stats(),
            "active_tasks": self.executor.active_tasks().await,
        }))
    }

    #[tool(
        description = "Aggregate A.L.A.N. statistics: total learned patterns, total observations, session id, and last prune time."
    )]
    async fn zsh_alan_stats(&self) -> Result<CallToolResult, McpError> {
        json_content(&self.executor.alan().stats())
    }

    #[tool(
        description = "Pattern statistics for one command: decayed observation counts, success and timeout rates, durations, and the current streak for its template."
    )]
    async fn zsh_alan_query(
        &self,
        Parameters(params): Parameters<AlanQueryParams>,
    ) -> Result<CallToolResult, McpError> {
        let alan = self.executor.alan();
        let stats = alan.get_pattern_stats(&params.command);
        let streak = alan.get_streak(&params.command);
        let mut value = serde_json::to_value(&stats)
            .map_err(|e| McpError::internal_error(format!("serialize stats: {e}"), None))?;
        value["streak"] = serde_json::to_value(&streak)
            .map_err(|e| McpError::internal_error(format!("serialize streak: {e}"), None))?;
        json_content(&value)
    }

    #[tool(description = "Full NEVERHANG circuit breaker state.")]
    async fn zsh_neverhang_status(&self) -> Result<CallToolResult, McpError> {
        json_content(&self.executor.breaker().status())
    }

    #[tool(description = "Reset the NEVERHANG circuit breaker to CLOSED, clearing failure history.")]
    async fn zsh_neverhang_reset(&self) -> Result<CallToolResult, McpError> {
        self.executor.breaker().reset();
        tracing::info!("NEVERHANG reset");
        json_content(&serde_json::json!({
            "success": true,
            "message": "circuit reset to closed",
        }))
    }
}

#[tool_handler]
impl ServerHandler for ZshToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "zsh-tool".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "zsh-tool runs shell commands under /bin/zsh with supervision.\n\n\
                 EXECUTION: the zsh tool yields a snapshot after yield_after seconds \
                 (default 2). A RUNNING snapshot means the command is still going: \
                 zsh_poll streams further output, zsh_send writes to stdin, zsh_kill \
                 stops the task. Set pty=true for programs that need a real terminal. \
                 Every command captures pipestatus -- one exit code per pipeline \
                 segment -- so failures masked by a succeeding tail are surfaced.\n\n\
                 NEVERHANG: after repeated command timeouts the circuit opens and \
                 submissions are blocked until a recovery window passes (or \
                 zsh_neverhang_reset). zsh_neverhang_status shows the state.\n\n\
                 A.L.A.N.: every execution is recorded in a time-decayed store. \
                 Snapshots carry insights: pattern reliability, likely timeouts, \
                 streaks, benign non-zero exits, and harvested option tables for \
                 commands that keep failing. zsh_alan_query inspects one pattern, \
                 zsh_alan_stats the whole store, zsh_health everything at once."
                    .to_string(),
            ),
        }
    }
}
