#![cfg(unix)]

mod common;

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use common::{RESTART_MARKER, TestResult};

fn run_debug_repl(input: &str) -> TestResult<std::process::Output> {
    let exe = common::resolve_server_path()?;
    let mut child = Command::new(exe)
        .arg("--debug-repl")
        .args(common::stand_in_args())
        .env("GEOSCRIPT_KERNEL_REPL_IMAGES", "0")
        .env_remove("GEOSCRIPT_KERNEL_DEBUG_EVENTS_DIR")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let mut stdin = child.stdin.take().ok_or("missing stdin")?;
    stdin.write_all(input.as_bytes())?;
    drop(stdin);

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });
    let output = rx
        .recv_timeout(Duration::from_secs(30))
        .map_err(|_| "debug repl did not exit after stdin closed")??;
    Ok(output)
}

#[test]
fn debug_repl_runs_a_scripted_session() -> TestResult<()> {
    let output = run_debug_repl("1 + 2\nplot\nINFO\nmulti \\\nline\ncrash\nafter\n")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {stderr}");

    assert!(stdout.starts_with("1 + 2\n"), "stdout: {stdout:?}");
    assert!(stdout.contains("\"mimetype\": \"text/groovy\""), "stdout: {stdout:?}");
    assert!(stdout.contains("multi\nline\n"), "stdout: {stdout:?}");
    assert!(stdout.contains(RESTART_MARKER), "stdout: {stdout:?}");
    assert!(stdout.ends_with("after\n"), "stdout: {stdout:?}");

    assert!(stderr.contains("debug repl:"), "stderr: {stderr:?}");
    assert!(stderr.contains("geoscript> "), "stderr: {stderr:?}");
    assert!(
        stderr.contains("[geoscript-kernel] image mime=image/png bytes=12"),
        "stderr: {stderr:?}"
    );
    Ok(())
}

#[test]
fn restart_command_reports_the_new_spawn() -> TestResult<()> {
    let output = run_debug_repl("RESTART\nx\n")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("[geoscript-kernel] restarted (spawn_count=2)"),
        "stderr: {stderr:?}"
    );
    assert_eq!(stdout, "x\n");
    Ok(())
}
