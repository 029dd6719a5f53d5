use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorData as McpError, ProtocolVersion, ServerCapabilities,
    ServerInfo,
};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};

mod response;

use self::response::{execute_reply_to_contents, finalize_batch};

use crate::config::SessionConfig;
use crate::kernel_protocol::{CollectingSink, ExecuteRequest, KernelInfo};
use crate::session::Session;
use crate::signals::InterruptHandle;

const SERVER_INSTRUCTIONS: &str = "A persistent GeoScript Groovy shell. Use `execute` to run code, \
`interrupt` to stop a long-running execution, and `restart` for a clean session.";

#[derive(Clone)]
struct SharedServer {
    session: Arc<Mutex<Session>>,
    // Cloned out of the session so `interrupt` never waits on the session lock.
    interrupt: InterruptHandle,
    kernel_info: Arc<KernelInfo>,
}

impl SharedServer {
    fn new(session: Session, kernel_info: KernelInfo) -> Self {
        let interrupt = session.interrupt_handle();
        Self {
            session: Arc::new(Mutex::new(session)),
            interrupt,
            kernel_info: Arc::new(kernel_info),
        }
    }

    async fn run_session<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&mut Session) -> T + Send + 'static,
        T: Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut session)
        })
        .await
        .map_err(|err| McpError::internal_error(err.to_string(), None))
    }

    async fn run_execute(&self, request: ExecuteRequest) -> Result<CallToolResult, McpError> {
        crate::event_log::log_lazy("tool_call_begin", || {
            json!({
                "tool": "execute",
                "code": request.code.clone(),
                "silent": request.silent,
                "store_history": request.store_history,
            })
        });
        let submitted = self.interrupt.mark();
        let outcome = self
            .run_session(move |session| {
                let mut sink = CollectingSink::default();
                let reply = session.execute_submitted_at(&request, submitted, &mut sink);
                (reply, sink.events)
            })
            .await;
        let (reply, events) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                log_tool_error("execute", &err);
                return Err(err);
            }
        };
        let result = finalize_batch(execute_reply_to_contents(&reply, events));
        crate::event_log::log_lazy("tool_call_end", || {
            let serialized = serde_json::to_value(&result)
                .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
            json!({
                "tool": "execute",
                "status": reply.status.as_str(),
                "execution_count": reply.execution_count,
                "result": serialized,
            })
        });
        Ok(result)
    }

    async fn run_restart(&self) -> Result<CallToolResult, McpError> {
        crate::event_log::log_lazy("tool_call_begin", || json!({"tool": "restart"}));
        let outcome = self
            .run_session(|session| {
                session
                    .restart()
                    .map(|()| session.spawn_count())
                    .map_err(|err| err.to_string())
            })
            .await;
        let text = match outcome {
            Ok(Ok(spawn_count)) => format!("GeoScript Groovy restarted (spawn_count={spawn_count})"),
            Ok(Err(err)) => {
                eprintln!("restart failed: {err}");
                format!("restart failed: {err}")
            }
            Err(err) => {
                log_tool_error("restart", &err);
                return Err(err);
            }
        };
        crate::event_log::log_lazy("tool_call_end", || {
            json!({
                "tool": "restart",
                "result": text.clone(),
            })
        });
        Ok(finalize_batch(vec![Content::text(text)]))
    }
}

fn log_tool_error(tool: &str, err: &McpError) {
    crate::event_log::log_lazy("tool_call_error", || {
        json!({
            "tool": tool,
            "error": err.to_string(),
        })
    });
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        instructions: Some(SERVER_INSTRUCTIONS.to_string()),
        ..ServerInfo::default()
    }
}

#[derive(Clone)]
struct KernelServer {
    shared: SharedServer,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl KernelServer {
    fn new(session: Session, kernel_info: KernelInfo) -> Self {
        Self {
            shared: SharedServer::new(session, kernel_info),
            tool_router: Self::tool_router(),
        }
    }

    fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.shared.session)
    }

    #[doc = include_str!("../docs/tool-descriptions/execute_tool.md")]
    #[tool(name = "execute")]
    async fn execute(&self, params: Parameters<ExecuteArgs>) -> Result<CallToolResult, McpError> {
        let ExecuteArgs {
            code,
            silent,
            store_history,
        } = params.0;
        let request = ExecuteRequest::new(code)
            .silent(silent.unwrap_or(false))
            .store_history(store_history.unwrap_or(true));
        self.shared.run_execute(request).await
    }

    #[doc = include_str!("../docs/tool-descriptions/interrupt_tool.md")]
    #[tool(name = "interrupt")]
    async fn interrupt(&self, _params: Parameters<NoArgs>) -> Result<CallToolResult, McpError> {
        self.shared.interrupt.request();
        crate::event_log::log("interrupt_requested", json!({"source": "tool"}));
        Ok(finalize_batch(vec![Content::text("interrupt requested")]))
    }

    #[doc = include_str!("../docs/tool-descriptions/restart_tool.md")]
    #[tool(name = "restart")]
    async fn restart(&self, _params: Parameters<NoArgs>) -> Result<CallToolResult, McpError> {
        self.shared.run_restart().await
    }

    #[doc = include_str!("../docs/tool-descriptions/kernel_info_tool.md")]
    #[tool(name = "kernel_info")]
    async fn kernel_info(&self, _params: Parameters<NoArgs>) -> Result<CallToolResult, McpError> {
        let text = serde_json::to_string_pretty(self.shared.kernel_info.as_ref())
            .map_err(|err| McpError::internal_error(err.to_string(), None))?;
        Ok(finalize_batch(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for KernelServer {
    fn get_info(&self) -> ServerInfo {
        server_info()
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct ExecuteArgs {
    code: String,
    #[serde(default)]
    silent: Option<bool>,
    #[serde(default)]
    store_history: Option<bool>,
}

#[derive(Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

/// Spawns the shell and reads its banner. Either failing is fatal for the server.
fn start_session(config: SessionConfig) -> Result<(Session, KernelInfo), String> {
    let launch = config.launch.display();
    let mut session = Session::start(config).map_err(|err| err.to_string())?;
    let banner = session
        .banner()
        .map_err(|err| format!("failed to read {launch} version: {err}"))?;
    let kernel_info = KernelInfo::new(
        banner.text.clone(),
        Some(banner.language_version.clone()),
    );
    Ok((session, kernel_info))
}

pub async fn run(config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("starting geoscript-kernel server");
    crate::event_log::log(
        "server_run_begin",
        json!({
            "command": config.launch.display(),
        }),
    );
    let (session, kernel_info) = tokio::task::spawn_blocking(move || start_session(config))
        .await?
        .inspect_err(|err| {
            crate::event_log::log("session_start_error", json!({"error": err}));
        })?;
    let service = KernelServer::new(session, kernel_info);
    let shutdown_session = service.session();

    crate::event_log::log("server_listen_begin", json!({}));
    let result: Result<(), Box<dyn std::error::Error>> = async {
        let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;
        running
            .waiting()
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
    .await;

    tokio::task::spawn_blocking(move || {
        let mut session = shutdown_session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        session.shutdown();
    })
    .await?;
    match &result {
        Ok(()) => crate::event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => crate::event_log::log(
            "server_listen_end",
            json!({
                "status": "error",
                "error": err.to_string(),
            }),
        ),
    }
    result
}
