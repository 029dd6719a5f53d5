use std::time::Duration;

pub const COMMAND_ENV: &str = "GEOSCRIPT_KERNEL_COMMAND";

pub const DEFAULT_PROGRAM: &str = "geoscript-groovysh";
const DEFAULT_ARGS: &[&str] = &["--terminal=none"];
pub const DEFAULT_PROMPT: &str = "groovy:";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_IMAGE_SIZE: u32 = 200;

const DEFAULT_ECHO_PREFIX: &str = "===> ";
const DEFAULT_NULL_MARKER: &str = "null";

// Native library load chatter from GeoTools' NetCDF plugin.
pub const DEFAULT_BENIGN_WARNINGS: &[&str] = &[
    "NetCDF-4 C library not present",
    "Unable to load library 'netcdf'",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

impl Default for LaunchCommand {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROGRAM,
            DEFAULT_ARGS.iter().map(|arg| arg.to_string()).collect(),
        )
    }
}

/// What the line classifier throws away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFilters {
    pub echo_prefix: String,
    pub null_marker: String,
    pub benign_prefixes: Vec<String>,
}

impl Default for OutputFilters {
    fn default() -> Self {
        Self {
            echo_prefix: DEFAULT_ECHO_PREFIX.to_string(),
            null_marker: DEFAULT_NULL_MARKER.to_string(),
            benign_prefixes: DEFAULT_BENIGN_WARNINGS
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
        }
    }
}

/// Process-wide settings of the child that the init script applies once per spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOptions {
    pub force_xy: bool,
    pub silence_logging: bool,
    pub image_size: u32,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            force_xy: true,
            silence_logging: true,
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub launch: LaunchCommand,
    /// Regular expression matched against the child's output to find the prompt.
    pub prompt_pattern: String,
    pub init: InitOptions,
    pub filters: OutputFilters,
    pub startup_timeout: Duration,
    /// `None` waits for the child indefinitely.
    pub execute_timeout: Option<Duration>,
    /// Skips the `--version` probe when set.
    pub language_version: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            launch: LaunchCommand::default(),
            prompt_pattern: regex::escape(DEFAULT_PROMPT),
            init: InitOptions::default(),
            filters: OutputFilters::default(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            execute_timeout: None,
            language_version: None,
        }
    }
}

pub fn program_from_env() -> Option<String> {
    let value = std::env::var(COMMAND_ENV).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn parse_timeout_secs(raw: &str, flag: &str) -> Result<Duration, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid {flag} value: {raw} (expected seconds)"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!(
            "invalid {flag} value: {raw} (expected a positive number of seconds)"
        ));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|_| format!("invalid {flag} value: {raw} (too many seconds)"))
}
