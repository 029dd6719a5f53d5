#![allow(dead_code)]

use std::error::Error;
use std::path::PathBuf;

use rmcp::ServiceExt;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParams, CallToolResult, RawContent};
use rmcp::service::{Peer, RoleClient, ServiceError};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use tokio::process::Command;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub const RESTART_MARKER: &str = "Restarting GeoScript Groovy";

/// Mimics groovysh: `groovy:000> ` prompt, `===> ` result echo, NetCDF chatter on stderr,
/// `image/png;base64,` lines, a SIGINT trap, and a crash on demand.
pub const STAND_IN_SCRIPT: &str = r#"trap 'printf "Interrupted\n"' INT
while :; do
  printf 'groovy:000> '
  IFS= read -r line || exit 0
  case "$line" in
    crash) printf 'fatal: repl crashed\n'; exit 3 ;;
    nap) sleep 30 ;;
    warn) printf "NetCDF-4 C library not present; using fallback\n" >&2 ;;
    plot) printf 'image/png;base64,iVBORw0KGgo=\n' ;;
    badplot) printf 'image/png;base64,@@not-base64@@\n' ;;
    nothing) printf '===> null\n' ;;
    '') ;;
    *) printf '===> %s\n' "$line" ;;
  esac
done
"#;

pub fn stand_in_args() -> Vec<String> {
    [
        "--command",
        "sh",
        "--arg",
        "-c",
        "--arg",
        STAND_IN_SCRIPT,
        "--prompt",
        "groovy:",
        "--language-version",
        "1.0",
        "--startup-timeout-secs",
        "10",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

#[derive(Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

pub struct McpTestSession {
    service: rmcp::service::RunningService<RoleClient, TestClient>,
    server_pid: Option<u32>,
}

impl McpTestSession {
    pub fn server_info(&self) -> Option<&rmcp::model::ServerInfo> {
        self.service.peer_info()
    }

    pub fn peer(&self) -> Peer<RoleClient> {
        self.service.peer().clone()
    }

    pub async fn list_tool_names(&self) -> TestResult<Vec<String>> {
        let tools = self.service.list_all_tools().await?;
        let mut names: Vec<String> = tools.into_iter().map(|tool| tool.name.to_string()).collect();
        names.sort();
        Ok(names)
    }

    pub async fn call_tool_raw(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ServiceError> {
        call_tool_on(&self.service, tool, arguments).await
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> TestResult<CallToolResult> {
        Ok(self.call_tool_raw(tool, arguments).await?)
    }

    pub async fn execute(&self, code: &str) -> TestResult<CallToolResult> {
        self.call_tool("execute", serde_json::json!({ "code": code }))
            .await
    }

    pub async fn cancel(self) -> TestResult<()> {
        self.service.cancel().await?;
        if let Some(pid) = self.server_pid {
            terminate_process_tree(pid);
        }
        Ok(())
    }
}

pub async fn call_tool_on(
    peer: &Peer<RoleClient>,
    tool: &str,
    arguments: Value,
) -> Result<CallToolResult, ServiceError> {
    let arguments = match arguments {
        Value::Object(map) => Some(map),
        _ => None,
    };
    peer.call_tool(CallToolRequestParams {
        meta: None,
        name: tool.to_string().into(),
        arguments,
        task: None,
    })
    .await
}

/// Text contents joined with newlines.
pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|item| match &item.raw {
            RawContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn result_images(result: &CallToolResult) -> Vec<(String, String)> {
    result
        .content
        .iter()
        .filter_map(|item| match &item.raw {
            RawContent::Image(image) => Some((image.mime_type.clone(), image.data.clone())),
            _ => None,
        })
        .collect()
}

/// One line per content item, for snapshots.
pub fn render_result(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .map(|item| match &item.raw {
            RawContent::Text(text) => format!("text: {:?}", text.text),
            RawContent::Image(image) => {
                format!("image: {} ({} bytes)", image.mime_type, image.data.len())
            }
            _ => "other".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn spawn_server() -> TestResult<McpTestSession> {
    spawn_server_with_args_and_env(stand_in_args(), Vec::new()).await
}

pub async fn spawn_server_with_extra_args(extra: &[&str]) -> TestResult<McpTestSession> {
    let mut args = stand_in_args();
    args.extend(extra.iter().map(|arg| arg.to_string()));
    spawn_server_with_args_and_env(args, Vec::new()).await
}

pub async fn spawn_server_with_args_and_env(
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
) -> TestResult<McpTestSession> {
    let exe = resolve_server_path()?;
    let transport = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        cmd.env_remove("GEOSCRIPT_KERNEL_COMMAND");
        cmd.env_remove("GEOSCRIPT_KERNEL_DEBUG_EVENTS_DIR");
        cmd.args(&args);
        for (key, value) in &env_vars {
            cmd.env(key, value);
        }
    }))?;

    let server_pid = transport.id();
    let service = TestClient.serve(transport).await?;
    Ok(McpTestSession {
        service,
        server_pid,
    })
}

pub fn resolve_server_path() -> TestResult<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_geoscript-kernel") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("geoscript-kernel");
    if cfg!(windows) {
        path.set_extension("exe");
    }

    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate geoscript-kernel test binary".into())
    }
}

#[cfg(unix)]
fn terminate_process_tree(pid: u32) {
    let pid_str = pid.to_string();
    let _ = std::process::Command::new("pkill")
        .args(["-TERM", "-P", &pid_str])
        .status();
    unsafe {
        let _ = libc::kill(pid as i32, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_millis(200));
    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    if alive {
        unsafe {
            let _ = libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn terminate_process_tree(_pid: u32) {}
