use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::LaunchCommand;

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"version (\d+(\.\d+)+)").unwrap_or_else(|err| panic!("version pattern: {err}"))
});

#[derive(Debug)]
pub enum VersionError {
    Io { program: String, source: std::io::Error },
    NoMatch { output: String },
}

impl std::fmt::Display for VersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionError::Io { program, source } => {
                write!(f, "failed to run {program} --version: {source}")
            }
            VersionError::NoMatch { output } => {
                write!(f, "no version number in banner: {:?}", output.trim())
            }
        }
    }
}

impl std::error::Error for VersionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VersionError::Io { source, .. } => Some(source),
            VersionError::NoMatch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub text: String,
    pub language_version: String,
}

impl Banner {
    pub fn parse(text: impl Into<String>) -> Result<Self, VersionError> {
        let text = text.into();
        let Some(found) = VERSION_PATTERN.captures(&text).and_then(|caps| caps.get(1)) else {
            return Err(VersionError::NoMatch { output: text });
        };
        let language_version = found.as_str().to_string();
        Ok(Self {
            text,
            language_version,
        })
    }

    pub fn fixed(language_version: impl Into<String>) -> Self {
        let language_version = language_version.into();
        Self {
            text: format!("GeoScript Groovy Shell version {language_version}"),
            language_version,
        }
    }

    /// Runs `<program> --version` in a separate, short-lived process.
    pub fn probe(launch: &LaunchCommand) -> Result<Self, VersionError> {
        let output = Command::new(&launch.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|source| VersionError::Io {
                program: launch.program.clone(),
                source,
            })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !VERSION_PATTERN.is_match(&text) {
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Self::parse(text)
    }
}
