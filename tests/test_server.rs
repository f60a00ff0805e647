//! Integration tests for the MCP server tools via duplex transport.
//!
//! Uses `tokio::io::duplex` to create an in-process transport, connects a
//! test client to the zsh-tool server, and exercises the tools through
//! the MCP protocol. Execution tests spawn real zsh processes and return
//! early when no zsh is installed.

use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;
use std::sync::Arc;
use zsh_tool::alan::Alan;
use zsh_tool::config::Config;
use zsh_tool::neverhang::CircuitBreaker;
use zsh_tool::server::ZshToolServer;
use zsh_tool::store::Store;

fn zsh_available() -> bool {
    std::path::Path::new("/bin/zsh").exists()
}

/// Minimal test client that implements ClientHandler with defaults.
#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

/// Helper: start a server+client pair connected via duplex transport,
/// with the store in a temporary directory.
async fn setup() -> (
    tempfile::TempDir,
    rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut config = Config::default();
    config.alan_db_path = dir.path().join("alan.db");

    let store = Store::open(&config.alan_db_path).expect("open store");
    let alan = Arc::new(Alan::new(store, config.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        config.neverhang_failure_threshold,
        config.neverhang_recovery_timeout,
        config.neverhang_sample_window,
    ));
    let server = ZshToolServer::with_components(config, alan, breaker);

    let (server_transport, client_transport) = tokio::io::duplex(65536);
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient::default();
    (dir, client.serve(client_transport).await.unwrap())
}

/// Helper: call a tool and return the text content, parsed as JSON when
/// possible (snapshot text stays a plain string).
async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> Value {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };

    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text))
}

// ---------------------------------------------------------------------------
// zsh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_zsh_echo_snapshot() {
    if !zsh_available() {
        return;
    }
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh",
        serde_json::json!({"command": "echo hello_world", "yield_after": 1.5}),
    )
    .await;

    let text = result.as_str().expect("snapshot is text");
    assert!(text.contains("hello_world"));
    assert!(text.contains("COMPLETED"));
    assert!(text.contains("exit=0"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_zsh_failed_command_snapshot() {
    if !zsh_available() {
        return;
    }
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh",
        serde_json::json!({"command": "exit 3", "yield_after": 1.5}),
    )
    .await;

    let text = result.as_str().expect("snapshot is text");
    assert!(text.contains("FAILED"));
    assert!(text.contains("exit=3"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_zsh_pipeline_masking_warning() {
    if !zsh_available() {
        return;
    }
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh",
        serde_json::json!({"command": "false | echo ok", "yield_after": 1.5}),
    )
    .await;

    let text = result.as_str().expect("snapshot is text");
    assert!(text.contains("pipestatus=[1,0]"));
    assert!(text.contains("pipe segment 1"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_zsh_empty_command_error() {
    let (_dir, client) = setup().await;
    let result = call_tool(&client, "zsh", serde_json::json!({"command": "  "})).await;

    assert_eq!(result["success"], false);
    assert!(result["error"].as_str().unwrap().contains("command"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_zsh_running_then_poll() {
    if !zsh_available() {
        return;
    }
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh",
        serde_json::json!({"command": "sleep 1.2; echo done_late", "yield_after": 0.3}),
    )
    .await;

    let text = result.as_str().expect("snapshot is text").to_string();
    assert!(text.contains("RUNNING"));
    let task_id = text
        .split("task_id=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .expect("task id in snapshot")
        .to_string();

    // Poll until the task finishes.
    let mut final_text = String::new();
    for _ in 0..30 {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let polled = call_tool(
            &client,
            "zsh_poll",
            serde_json::json!({"task_id": task_id}),
        )
        .await;
        let polled_text = polled.as_str().unwrap_or_default().to_string();
        if polled_text.contains("COMPLETED") || polled_text.contains("FAILED") {
            final_text = polled_text;
            break;
        }
    }
    assert!(final_text.contains("done_late"));
    assert!(final_text.contains("COMPLETED"));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// zsh_poll / zsh_send / zsh_kill error paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_poll_unknown_task() {
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh_poll",
        serde_json::json!({"task_id": "nonexistent"}),
    )
    .await;

    assert_eq!(result["success"], false);
    assert!(result["error"].as_str().unwrap().contains("unknown task"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_send_unknown_task() {
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh_send",
        serde_json::json!({"task_id": "nonexistent", "input": "test"}),
    )
    .await;

    assert_eq!(result["success"], false);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_kill_unknown_task() {
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh_kill",
        serde_json::json!({"task_id": "nonexistent"}),
    )
    .await;

    assert_eq!(result["success"], false);

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// zsh_tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tasks_empty() {
    let (_dir, client) = setup().await;
    let result = call_tool(&client, "zsh_tasks", serde_json::json!({})).await;

    assert_eq!(result["count"], 0);
    assert!(result["tasks"].as_array().unwrap().is_empty());

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_tasks_lists_running_task() {
    if !zsh_available() {
        return;
    }
    let (_dir, client) = setup().await;
    call_tool(
        &client,
        "zsh",
        serde_json::json!({"command": "sleep 10", "yield_after": 0.3}),
    )
    .await;

    let result = call_tool(&client, "zsh_tasks", serde_json::json!({})).await;
    assert_eq!(result["count"], 1);
    let tasks = result["tasks"].as_array().unwrap();
    assert_eq!(tasks[0]["status"], "running");
    assert!(tasks[0]["command"].as_str().unwrap().contains("sleep"));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// zsh_health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_shape() {
    let (_dir, client) = setup().await;
    let result = call_tool(&client, "zsh_health", serde_json::json!({})).await;

    assert_eq!(result["status"], "healthy");
    assert_eq!(result["neverhang"]["state"], "closed");
    assert!(result["alan"]["total_patterns"].is_u64());
    assert_eq!(result["active_tasks"], 0);

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// zsh_alan_stats / zsh_alan_query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_alan_stats_shape() {
    let (_dir, client) = setup().await;
    let result = call_tool(&client, "zsh_alan_stats", serde_json::json!({})).await;

    assert!(result["total_patterns"].is_u64());
    assert!(result["total_observations"].is_u64());
    assert!(result["session_id"].is_string());

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_alan_query_unknown_command() {
    let (_dir, client) = setup().await;
    let result = call_tool(
        &client,
        "zsh_alan_query",
        serde_json::json!({"command": "completely_unknown_cmd_xyz"}),
    )
    .await;

    assert_eq!(result["known"], false);
    assert_eq!(result["streak"]["has_streak"], false);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_alan_query_after_execution() {
    if !zsh_available() {
        return;
    }
    let (_dir, client) = setup().await;
    call_tool(
        &client,
        "zsh",
        serde_json::json!({"command": "echo learn_me", "yield_after": 1.5}),
    )
    .await;

    let result = call_tool(
        &client,
        "zsh_alan_query",
        serde_json::json!({"command": "echo learn_me"}),
    )
    .await;

    assert_eq!(result["known"], true);
    assert!(result["observations"].as_u64().unwrap() >= 1);
    assert!(result["success_rate"].as_f64().unwrap() > 0.9);

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// zsh_neverhang_status / zsh_neverhang_reset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_neverhang_status_shape() {
    let (_dir, client) = setup().await;
    let result = call_tool(&client, "zsh_neverhang_status", serde_json::json!({})).await;

    assert_eq!(result["state"], "closed");
    assert_eq!(result["failures_in_window"], 0);
    assert!(result["failure_threshold"].is_u64());

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_neverhang_reset() {
    let (_dir, client) = setup().await;
    let result = call_tool(&client, "zsh_neverhang_reset", serde_json::json!({})).await;

    assert_eq!(result["success"], true);

    let status = call_tool(&client, "zsh_neverhang_status", serde_json::json!({})).await;
    assert_eq!(status["state"], "closed");

    client.cancel().await.unwrap();
}
