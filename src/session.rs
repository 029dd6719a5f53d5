use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::json;

use crate::classify::{ImageLine, classify_output};
use crate::config::SessionConfig;
use crate::diagnostics::{StartupSpan, startup_log};
use crate::event_log;
use crate::init_script;
use crate::kernel_protocol::{
    ExecuteReply, ExecuteRequest, ImagePayload, KernelEvent, OutputSink, ReplyStatus,
};
use crate::repl_driver::{DriverError, ReplDriver};
use crate::signals::{InterruptHandle, InterruptMark};
use crate::version::{Banner, VersionError};

pub const RESTART_MARKER: &str = "Restarting GeoScript Groovy";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// One groovysh child and the bookkeeping around it.
///
/// The driver is `None` only after a restart failed; the next execution retries the spawn.
pub struct Session {
    config: SessionConfig,
    init_script: String,
    driver: Option<ReplDriver>,
    interrupt: InterruptHandle,
    execution_count: u64,
    spawn_count: u64,
    banner: Option<Banner>,
}

impl Session {
    pub fn start(config: SessionConfig) -> Result<Self, DriverError> {
        let init_script = init_script::render(&config.init);
        let mut session = Self {
            config,
            init_script,
            driver: None,
            interrupt: InterruptHandle::new(),
            execution_count: 0,
            spawn_count: 0,
            banner: None,
        };
        let driver = session.spawn_driver("startup")?;
        session.driver = Some(driver);
        Ok(session)
    }

    pub fn execute(&mut self, request: &ExecuteRequest, sink: &mut dyn OutputSink) -> ExecuteReply {
        let submitted = self.interrupt.mark();
        self.execute_submitted_at(request, submitted, sink)
    }

    /// Runs `request`, keeping interrupts requested after `submitted` even if they arrived
    /// while the caller was still waiting for the session.
    pub fn execute_submitted_at(
        &mut self,
        request: &ExecuteRequest,
        submitted: InterruptMark,
        sink: &mut dyn OutputSink,
    ) -> ExecuteReply {
        if request.code.trim().is_empty() {
            return ExecuteReply {
                status: ReplyStatus::Ok,
                execution_count: self.execution_count,
                text: String::new(),
                images: Vec::new(),
            };
        }

        if let Err(err) = self.ensure_driver() {
            let reply = ExecuteReply {
                status: ReplyStatus::Error,
                execution_count: self.execution_count,
                text: err.to_string(),
                images: Vec::new(),
            };
            if !request.silent {
                sink.publish(KernelEvent::stderr(reply.text.clone()));
            }
            return reply;
        }

        self.interrupt.clear_before(submitted);
        if request.store_history {
            self.execution_count = self.execution_count.saturating_add(1);
        }
        let execution_count = self.execution_count;
        let started = Instant::now();
        event_log::log_lazy("execute_begin", || {
            json!({
                "execution_count": execution_count,
                "code_bytes": request.code.len(),
                "silent": request.silent,
            })
        });

        let outcome = match self.driver.as_mut() {
            Some(driver) => driver.submit(&request.code, self.config.execute_timeout),
            None => Err(DriverError::ProcessEof {
                partial: String::new(),
            }),
        };
        let (status, text, images) = match outcome {
            Ok(raw) => {
                let classified = classify_output(&raw, &self.config.filters);
                let text = classified.text();
                let images = classified.images.into_iter().map(image_payload).collect();
                (ReplyStatus::Ok, text, images)
            }
            Err(DriverError::EmptyInput) => (ReplyStatus::Ok, String::new(), Vec::new()),
            Err(DriverError::Interrupted) => {
                let (status, text) = self.finish_interrupt();
                (status, text, Vec::new())
            }
            Err(err) => {
                let partial = err.partial_output().unwrap_or_default().to_string();
                let (status, text) = self.recover(partial, &err);
                (status, text, Vec::new())
            }
        };

        let reply = ExecuteReply {
            status,
            execution_count,
            text,
            images,
        };
        let driver_turns = self.driver.as_ref().map(ReplDriver::turns);
        if !request.silent {
            publish(&reply, sink);
        }
        event_log::log_lazy("execute_end", || {
            json!({
                "execution_count": execution_count,
                "status": reply.status.as_str(),
                "text_bytes": reply.text.len(),
                "images": reply.images.len(),
                "driver_turns": driver_turns,
                "elapsed_ms": started.elapsed().as_millis(),
            })
        });
        reply
    }

    /// Replaces the child with a fresh one. The execution counter is kept.
    pub fn restart(&mut self) -> Result<(), DriverError> {
        if let Some(driver) = self.driver.take() {
            driver.shutdown(SHUTDOWN_TIMEOUT);
        }
        let driver = self.spawn_driver("user")?;
        self.driver = Some(driver);
        Ok(())
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn banner(&mut self) -> Result<&Banner, VersionError> {
        let banner = match self.banner.take() {
            Some(banner) => banner,
            None => {
                let banner = match self.config.language_version.as_deref() {
                    Some(version) => Banner::fixed(version),
                    None => Banner::probe(&self.config.launch)?,
                };
                startup_log(format!("banner: {}", banner.language_version));
                banner
            }
        };
        Ok(self.banner.insert(banner))
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }

    pub fn is_alive(&mut self) -> bool {
        self.driver.as_mut().is_some_and(ReplDriver::is_alive)
    }

    pub fn shutdown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.shutdown(SHUTDOWN_TIMEOUT);
        }
    }

    fn ensure_driver(&mut self) -> Result<(), DriverError> {
        if self.driver.is_some() {
            return Ok(());
        }
        let driver = self.spawn_driver("retry")?;
        self.driver = Some(driver);
        Ok(())
    }

    fn finish_interrupt(&mut self) -> (ReplyStatus, String) {
        event_log::log(
            "interrupt_delivered",
            json!({"execution_count": self.execution_count}),
        );
        let resync = match self.driver.as_mut() {
            Some(driver) => driver.interrupt(),
            None => return (ReplyStatus::Abort, String::new()),
        };
        match resync {
            Ok(partial) => (ReplyStatus::Abort, partial),
            Err(err) => {
                let partial = err.partial_output().unwrap_or_default().to_string();
                let (status, text) = self.recover(partial, &err);
                let status = match status {
                    ReplyStatus::Ok => ReplyStatus::Abort,
                    other => other,
                };
                (status, text)
            }
        }
    }

    /// Restarts after the child died or fell out of step with its prompt.
    fn recover(&mut self, partial: String, cause: &DriverError) -> (ReplyStatus, String) {
        let exit = self
            .driver
            .as_mut()
            .and_then(ReplDriver::exit_description);
        event_log::log(
            "session_restart",
            json!({
                "reason": cause.to_string(),
                "exit": exit,
                "spawn_count": self.spawn_count,
            }),
        );
        if let Some(mut driver) = self.driver.take() {
            driver.kill();
        }

        let mut text = partial;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(RESTART_MARKER);

        match self.spawn_driver("recover") {
            Ok(driver) => {
                self.driver = Some(driver);
                (ReplyStatus::Ok, text)
            }
            Err(err) => {
                text.push('\n');
                text.push_str(&format!("failed to restart: {err}"));
                (ReplyStatus::Error, text)
            }
        }
    }

    fn spawn_driver(&mut self, reason: &str) -> Result<ReplDriver, DriverError> {
        let span = StartupSpan::begin(format!(
            "spawn {} ({reason})",
            self.config.launch.display()
        ));
        let result = ReplDriver::start(
            &self.config.launch,
            &self.config.prompt_pattern,
            &self.init_script,
            self.config.startup_timeout,
            self.interrupt.clone(),
        );
        match result {
            Ok(driver) => {
                self.spawn_count = self.spawn_count.saturating_add(1);
                event_log::log(
                    "session_start",
                    json!({
                        "reason": reason,
                        "pid": driver.pid(),
                        "spawn_count": self.spawn_count,
                        "elapsed_ms": span.elapsed_ms(),
                    }),
                );
                span.finish(format!("pid={}", driver.pid()));
                Ok(driver)
            }
            Err(err) => {
                span.fail(&err);
                event_log::log(
                    "session_start_failed",
                    json!({"reason": reason, "error": err.to_string()}),
                );
                Err(err)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn image_payload(image: ImageLine) -> ImagePayload {
    ImagePayload {
        mime_type: image.mime_type,
        data: image.payload,
    }
}

fn publish(reply: &ExecuteReply, sink: &mut dyn OutputSink) {
    if !reply.text.is_empty() {
        sink.publish(KernelEvent::stdout(reply.text.clone()));
    }
    for image in &reply.images {
        match base64::engine::general_purpose::STANDARD.decode(image.data.as_bytes()) {
            Ok(_) => sink.publish(KernelEvent::DisplayData {
                mime_type: image.mime_type.clone(),
                data: image.data.clone(),
            }),
            Err(err) => {
                event_log::log(
                    "image_payload_rejected",
                    json!({
                        "mime_type": image.mime_type,
                        "payload_bytes": image.data.len(),
                        "error": err.to_string(),
                    }),
                );
                sink.publish(KernelEvent::stderr(format!(
                    "malformed {} payload ({} bytes): {err}",
                    image.mime_type,
                    image.data.len()
                )));
            }
        }
    }
}
