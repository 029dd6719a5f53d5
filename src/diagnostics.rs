use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

const TRACE_ENV: &str = "GEOSCRIPT_KERNEL_DEBUG_STARTUP";
const TRACE_FILE_ENV: &str = "GEOSCRIPT_KERNEL_DEBUG_STARTUP_FILE";
const TRACE_FILE_DEFAULT: &str = "geoscript-kernel-startup.log";

static TRACE: OnceLock<Option<StartupTrace>> = OnceLock::new();

/// Plain-text trace of process startup and REPL spawns. The JVM behind groovysh takes
/// seconds to come up, and this is where that time shows.
struct StartupTrace {
    file: Mutex<File>,
    epoch: Instant,
}

impl StartupTrace {
    fn open() -> Option<Self> {
        let path = trace_target(
            std::env::var_os(TRACE_ENV),
            std::env::var_os(TRACE_FILE_ENV),
        )?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()?;
        Some(Self {
            file: Mutex::new(file),
            epoch: Instant::now(),
        })
    }

    fn write(&self, message: &str) {
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        let _ = writeln!(
            file,
            "[geoscript-kernel +{:>6}ms] {message}",
            self.epoch.elapsed().as_millis()
        );
        let _ = file.flush();
    }
}

/// Either variable turns the trace on; the file one also picks where it goes.
fn trace_target(enabled: Option<OsString>, file: Option<OsString>) -> Option<PathBuf> {
    let set = |value: &Option<OsString>| {
        value
            .as_ref()
            .is_some_and(|value| !value.to_string_lossy().trim().is_empty())
    };
    if set(&file) {
        return file.map(PathBuf::from);
    }
    set(&enabled).then(|| PathBuf::from(TRACE_FILE_DEFAULT))
}

fn trace() -> Option<&'static StartupTrace> {
    TRACE.get_or_init(StartupTrace::open).as_ref()
}

pub fn startup_log(message: impl AsRef<str>) {
    if let Some(trace) = trace() {
        trace.write(message.as_ref());
    }
}

/// A timed startup step. Logs on creation and again when finished or failed.
pub struct StartupSpan {
    label: String,
    started: Instant,
}

impl StartupSpan {
    pub fn begin(label: impl Into<String>) -> Self {
        let label = label.into();
        startup_log(format!("{label}: begin"));
        Self {
            label,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    pub fn finish(self, detail: impl AsRef<str>) {
        startup_log(format!(
            "{}: done in {}ms ({})",
            self.label,
            self.elapsed_ms(),
            detail.as_ref()
        ));
    }

    pub fn fail(self, err: &dyn std::error::Error) {
        startup_log(format!(
            "{}: failed after {}ms: {err}",
            self.label,
            self.elapsed_ms()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_stays_off_without_either_variable() {
        assert_eq!(trace_target(None, None), None);
        assert_eq!(trace_target(Some(" ".into()), Some("".into())), None);
    }

    #[test]
    fn explicit_file_wins_over_the_default() {
        assert_eq!(
            trace_target(Some("1".into()), None),
            Some(PathBuf::from(TRACE_FILE_DEFAULT))
        );
        assert_eq!(
            trace_target(None, Some("/tmp/kernel-trace.log".into())),
            Some(PathBuf::from("/tmp/kernel-trace.log"))
        );
    }
}
