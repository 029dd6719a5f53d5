#[cfg(target_family = "unix")]
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use regex::bytes::Regex;

use crate::config::LaunchCommand;
use crate::signals::{InterruptHandle, SigintDefaultGuard};

#[cfg(target_family = "unix")]
use std::os::unix::process::CommandExt;
#[cfg(target_family = "unix")]
use sysinfo::{Pid, ProcessesToUpdate, System};

pub const INTERRUPT_RESYNC_TIMEOUT: Duration = Duration::from_secs(30);
const PROMPT_POLL_SLICE: Duration = Duration::from_millis(50);
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);
const TERM_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug)]
pub enum DriverError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    InvalidPrompt(regex::Error),
    Startup(String),
    ProcessEof {
        partial: String,
    },
    /// The partial output stays buffered; `ReplDriver::interrupt` collects it.
    Interrupted,
    Timeout {
        timeout: Duration,
        partial: String,
    },
    Io {
        source: std::io::Error,
        partial: String,
    },
    EmptyInput,
}

impl DriverError {
    /// Output the child produced before the turn failed, if the error carries any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            DriverError::ProcessEof { partial }
            | DriverError::Timeout { partial, .. }
            | DriverError::Io { partial, .. } => Some(partial.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Spawn { program, source } => {
                write!(f, "failed to start {program}: {source}")
            }
            DriverError::InvalidPrompt(err) => write!(f, "invalid prompt pattern: {err}"),
            DriverError::Startup(message) => write!(f, "repl startup failed: {message}"),
            DriverError::ProcessEof { .. } => write!(f, "repl closed its output before prompting"),
            DriverError::Interrupted => write!(f, "interrupted while waiting for the repl"),
            DriverError::Timeout { timeout, .. } => write!(
                f,
                "no prompt from the repl after {} ms",
                timeout.as_millis()
            ),
            DriverError::Io { source, .. } => write!(f, "repl io error: {source}"),
            DriverError::EmptyInput => write!(f, "no input given"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Spawn { source, .. } => Some(source),
            DriverError::InvalidPrompt(err) => Some(err),
            DriverError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io {
            source: err,
            partial: String::new(),
        }
    }
}

/// One child REPL, kept in lockstep with its prompt.
///
/// stdout and stderr share a single pipe so diagnostics stay in order with results, the
/// same way they would on a terminal.
pub struct ReplDriver {
    child: Child,
    stdin: Option<ChildStdin>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    prompt: Regex,
    pending: Vec<u8>,
    interrupted_output: String,
    interrupt: InterruptHandle,
    turns: u64,
    exit_status: Option<ExitStatus>,
}

impl ReplDriver {
    pub fn start(
        launch: &LaunchCommand,
        prompt_pattern: &str,
        init_script: &str,
        startup_timeout: Duration,
        interrupt: InterruptHandle,
    ) -> Result<Self, DriverError> {
        let prompt = Regex::new(prompt_pattern).map_err(DriverError::InvalidPrompt)?;
        let (mut child, output) = spawn_child(launch)?;
        let stdin = child.stdin.take();
        let (output_tx, output_rx) = mpsc::channel();
        spawn_output_reader(output, output_tx);

        let mut driver = Self {
            child,
            stdin,
            output_rx,
            prompt,
            pending: Vec::new(),
            interrupted_output: String::new(),
            interrupt,
            turns: 0,
            exit_status: None,
        };
        if let Err(err) = driver.prime(init_script, startup_timeout) {
            let message = match err.partial_output().map(str::trim) {
                Some(partial) if !partial.is_empty() => format!("{err}\n{partial}"),
                _ => err.to_string(),
            };
            driver.kill();
            return Err(DriverError::Startup(message));
        }
        Ok(driver)
    }

    fn prime(&mut self, init_script: &str, startup_timeout: Duration) -> Result<(), DriverError> {
        self.expect_prompt(Some(startup_timeout), false)?;
        if !init_script.trim().is_empty() {
            self.submit_lines(init_script, Some(startup_timeout), false)?;
        }
        Ok(())
    }

    /// Sends `text` one line at a time and returns what the child printed before each
    /// following prompt.
    pub fn submit(&mut self, text: &str, timeout: Option<Duration>) -> Result<String, DriverError> {
        self.submit_lines(text, timeout, true)
    }

    fn submit_lines(
        &mut self,
        text: &str,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<String, DriverError> {
        let lines = split_submission(text);
        if lines.is_empty() {
            return Err(DriverError::EmptyInput);
        }
        self.interrupted_output.clear();

        let mut output = String::new();
        for line in lines {
            if let Err(err) = self.write_line(line) {
                if is_closed_pipe(&err) {
                    output.push_str(&self.drain_after_exit());
                    return Err(DriverError::ProcessEof { partial: output });
                }
                return Err(DriverError::Io {
                    source: err,
                    partial: output,
                });
            }
            match self.expect_prompt(timeout, interruptible) {
                Ok(before) => output.push_str(&before),
                Err(DriverError::Interrupted) => {
                    self.interrupted_output = output;
                    return Err(DriverError::Interrupted);
                }
                Err(DriverError::ProcessEof { partial }) => {
                    output.push_str(&partial);
                    return Err(DriverError::ProcessEof { partial: output });
                }
                Err(DriverError::Timeout { timeout, partial }) => {
                    output.push_str(&partial);
                    return Err(DriverError::Timeout {
                        timeout,
                        partial: output,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        self.turns = self.turns.saturating_add(1);
        Ok(output)
    }

    /// Delivers SIGINT to the child's process group and reads up to the prompt it prints
    /// afterwards, so the next `submit` starts in sync.
    pub fn interrupt(&mut self) -> Result<String, DriverError> {
        self.send_signal_to_group(SignalKind::Interrupt)?;
        let resync = self.expect_prompt(Some(INTERRUPT_RESYNC_TIMEOUT), false);
        self.interrupt.clear();
        let mut output = std::mem::take(&mut self.interrupted_output);
        match resync {
            Ok(before) => {
                output.push_str(&before);
                Ok(output)
            }
            Err(DriverError::ProcessEof { partial }) => {
                output.push_str(&partial);
                Err(DriverError::ProcessEof { partial: output })
            }
            Err(DriverError::Timeout { timeout, partial }) => {
                output.push_str(&partial);
                Err(DriverError::Timeout {
                    timeout,
                    partial: output,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Completed submissions, the init script included.
    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn exit_description(&mut self) -> Option<String> {
        if self.is_alive() {
            return None;
        }
        self.exit_status.as_ref().map(format_exit_status)
    }

    fn expect_prompt(
        &mut self,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<String, DriverError> {
        // A limit too large to add to `now` waits like no limit at all.
        let deadline = timeout
            .and_then(|limit| Instant::now().checked_add(limit).map(|at| (limit, at)));
        loop {
            if let Some(found) = self.prompt.find(&self.pending) {
                let before = String::from_utf8_lossy(&self.pending[..found.start()]).into_owned();
                let end = found.end();
                self.pending.drain(..end);
                return Ok(before);
            }
            if interruptible && self.interrupt.take() {
                return Err(DriverError::Interrupted);
            }
            let slice = match deadline {
                Some((limit, deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::Timeout {
                            timeout: limit,
                            partial: self.take_pending(),
                        });
                    }
                    deadline.saturating_duration_since(now).min(PROMPT_POLL_SLICE)
                }
                None => PROMPT_POLL_SLICE,
            };
            match self.output_rx.recv_timeout(slice) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = self.is_alive();
                    return Err(DriverError::ProcessEof {
                        partial: self.take_pending(),
                    });
                }
            }
        }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "repl stdin already closed",
            ));
        };
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    fn drain_after_exit(&mut self) -> String {
        let deadline = Instant::now() + EXIT_DRAIN_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.output_rx.recv_timeout(remaining.min(PROMPT_POLL_SLICE)) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = self.is_alive();
        self.take_pending()
    }

    fn take_pending(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    /// Closes stdin and gives the child `timeout` to exit before escalating to SIGTERM and
    /// then SIGKILL.
    pub fn shutdown(mut self, timeout: Duration) {
        self.stdin.take();
        if self.wait_for_exit(timeout) {
            return;
        }
        if self.send_signal_to_group(SignalKind::Terminate).is_err() {
            #[cfg(target_family = "unix")]
            self.kill_process_tree_scan(libc::SIGTERM);
        }
        if self.wait_for_exit(TERM_GRACE) {
            return;
        }
        self.kill();
    }

    pub fn kill(&mut self) {
        self.stdin.take();
        if !self.is_alive() {
            return;
        }
        if self.send_signal_to_group(SignalKind::Kill).is_err() {
            #[cfg(target_family = "unix")]
            self.kill_process_tree_scan(libc::SIGKILL);
            let _ = self.child.kill();
        }
        if let Ok(status) = self.child.wait() {
            self.exit_status = Some(status);
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if !self.is_alive() {
                return true;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(target_family = "unix")]
    fn send_signal_to_group(&self, kind: SignalKind) -> Result<(), DriverError> {
        let signal = match kind {
            SignalKind::Interrupt => libc::SIGINT,
            SignalKind::Terminate => libc::SIGTERM,
            SignalKind::Kill => libc::SIGKILL,
        };
        let pid = self.child.id() as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        // Group already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err.into())
    }

    #[cfg(not(target_family = "unix"))]
    fn send_signal_to_group(&mut self, kind: SignalKind) -> Result<(), DriverError> {
        match kind {
            SignalKind::Interrupt => Ok(()),
            SignalKind::Terminate | SignalKind::Kill => {
                self.child.kill()?;
                Ok(())
            }
        }
    }

    #[cfg(target_family = "unix")]
    fn kill_process_tree_scan(&self, signal: i32) {
        let root = Pid::from_u32(self.child.id());
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut stack = vec![root];
        let mut seen: HashSet<Pid> = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(kids) = children.get(&current) {
                stack.extend(kids.iter().filter(|kid| !seen.contains(kid)));
            }
        }

        for pid in seen {
            let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
        }
    }
}

impl Drop for ReplDriver {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Clone, Copy)]
enum SignalKind {
    Interrupt,
    Terminate,
    Kill,
}

fn spawn_child(launch: &LaunchCommand) -> Result<(Child, std::io::PipeReader), DriverError> {
    let spawn_error = |source: std::io::Error| DriverError::Spawn {
        program: launch.program.clone(),
        source,
    };
    let (output, output_writer) = std::io::pipe().map_err(spawn_error)?;
    let stderr_writer = output_writer.try_clone().map_err(spawn_error)?;

    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .stdin(Stdio::piped())
        .stdout(output_writer)
        .stderr(stderr_writer);
    #[cfg(target_family = "unix")]
    unsafe {
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let _sigint = SigintDefaultGuard::acquire().map_err(spawn_error)?;
    let child = command.spawn().map_err(spawn_error)?;
    // `command` still owns the parent's copies of the write end; dropping it lets the
    // reader see EOF once the child exits.
    drop(command);
    Ok((child, output))
}

fn spawn_output_reader<R>(mut stream: R, output_tx: mpsc::Sender<Vec<u8>>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

/// Splits like a line-oriented terminal would: a trailing terminator submits one more
/// (empty) line.
fn split_submission(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.lines().collect();
    if text.ends_with('\n') {
        lines.push("");
    }
    lines
}

fn is_closed_pipe(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

fn format_exit_status(status: &ExitStatus) -> String {
    #[cfg(target_family = "unix")]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(status) {
        return format!("repl exited with signal {signal}");
    }
    match status.code() {
        Some(code) => format!("repl exited with status {code}"),
        None => "repl exited with unknown status".to_string(),
    }
}
