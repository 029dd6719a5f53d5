#![cfg(unix)]

mod common;

use std::process::{Command, Stdio};

use common::{RESTART_MARKER, TestResult, result_text};
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn crash_restarts_the_repl_transparently() -> TestResult<()> {
    let session = common::spawn_server().await?;
    session.execute("x = 1").await?;

    let result = session.execute("crash").await?;
    let text = result_text(&result);
    assert!(text.contains("fatal: repl crashed"), "got {text:?}");
    assert!(text.ends_with(RESTART_MARKER), "got {text:?}");
    assert!(!text.contains("status:"), "crash recovery is not an error: {text:?}");

    let result = session.execute("after crash").await?;
    assert_eq!(result_text(&result), "after crash");
    session.cancel().await
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_timeout_restarts_the_repl() -> TestResult<()> {
    let session = common::spawn_server_with_extra_args(&["--execute-timeout-secs", "0.5"]).await?;
    let result = session.execute("nap").await?;
    assert!(result_text(&result).ends_with(RESTART_MARKER));

    let result = session.execute("fresh").await?;
    assert_eq!(result_text(&result), "fresh");
    session.cancel().await
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_tool_spawns_a_new_repl() -> TestResult<()> {
    let session = common::spawn_server().await?;
    session.execute("x = 1").await?;
    let result = session.call_tool("restart", json!({})).await?;
    assert_eq!(
        result_text(&result),
        "GeoScript Groovy restarted (spawn_count=2)"
    );
    let result = session.execute("y").await?;
    assert_eq!(result_text(&result), "y");
    session.cancel().await
}

#[test]
fn missing_program_is_fatal_at_startup() -> TestResult<()> {
    let exe = common::resolve_server_path()?;
    let output = Command::new(exe)
        .args([
            "--command",
            "/nonexistent/geoscript-groovysh",
            "--language-version",
            "1.0",
        ])
        .env_remove("GEOSCRIPT_KERNEL_DEBUG_EVENTS_DIR")
        .stdin(Stdio::null())
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to start /nonexistent/geoscript-groovysh"),
        "got {stderr:?}"
    );
    Ok(())
}

#[test]
fn repl_that_never_prompts_is_fatal_at_startup() -> TestResult<()> {
    let exe = common::resolve_server_path()?;
    let output = Command::new(exe)
        .args([
            "--command",
            "sh",
            "--arg",
            "-c",
            "--arg",
            "echo booting; sleep 30",
            "--startup-timeout-secs",
            "0.5",
            "--language-version",
            "1.0",
        ])
        .env_remove("GEOSCRIPT_KERNEL_DEBUG_EVENTS_DIR")
        .stdin(Stdio::null())
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("repl startup failed"), "got {stderr:?}");
    assert!(stderr.contains("booting"), "got {stderr:?}");
    Ok(())
}
