mod classify;
mod config;
mod debug_repl;
mod diagnostics;
mod event_log;
mod init_script;
mod kernel_protocol;
mod repl_driver;
mod server;
mod session;
mod signals;
#[cfg(test)]
mod test_support;
mod version;

use std::path::PathBuf;

use crate::config::{LaunchCommand, SessionConfig, parse_timeout_secs, program_from_env};

struct CliOptions {
    session: SessionConfig,
    debug_repl: bool,
    debug_events_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // groovysh and the MCP transport both write to pipes; a closed reader should surface as
    // an EPIPE error instead of killing the kernel.
    ignore_sigpipe();
    crate::diagnostics::startup_log("main: entry");

    let args = std::env::args_os()
        .skip(1)
        .map(|arg| {
            arg.into_string()
                .map_err(|arg| format!("argument is not valid UTF-8: {}", arg.to_string_lossy()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let options = parse_cli_args(args)?;
    event_log::initialize(
        options.debug_events_dir,
        event_log::StartupContext {
            mode: if options.debug_repl {
                "debug_repl".to_string()
            } else {
                "server".to_string()
            },
            command: options.session.launch.display(),
            prompt_pattern: options.session.prompt_pattern.clone(),
            debug_repl: options.debug_repl,
        },
    )?;
    if options.debug_repl {
        crate::diagnostics::startup_log("main: debug repl mode");
        return debug_repl::run(options.session);
    }
    crate::diagnostics::startup_log("main: server mode");
    server::run(options.session).await
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args(args: Vec<String>) -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new(args);
    let mut session = SessionConfig::default();
    let mut program = program_from_env();
    let mut launch_args: Option<Vec<String>> = None;
    let mut extra_warnings = Vec::new();
    let mut default_warnings = true;
    let mut debug_repl = false;
    let mut debug_events_dir = None;

    while let Some(arg) = parser.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
            _ => (arg.clone(), None),
        };
        match flag.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--command" => {
                program = Some(parser.value(&flag, inline)?);
            }
            "--arg" => {
                launch_args
                    .get_or_insert_with(Vec::new)
                    .push(parser.value(&flag, inline)?);
            }
            "--prompt" => {
                session.prompt_pattern = parser.value(&flag, inline)?;
            }
            "--benign-warning" => {
                extra_warnings.push(parser.value(&flag, inline)?);
            }
            "--no-default-warnings" => {
                default_warnings = false;
            }
            "--no-force-xy" => {
                session.init.force_xy = false;
            }
            "--keep-logging" => {
                session.init.silence_logging = false;
            }
            "--image-size" => {
                let value = parser.value(&flag, inline)?;
                session.init.image_size = parse_image_size(&value)?;
            }
            "--startup-timeout-secs" => {
                let value = parser.value(&flag, inline)?;
                session.startup_timeout = parse_timeout_secs(&value, &flag)?;
            }
            "--execute-timeout-secs" => {
                let value = parser.value(&flag, inline)?;
                session.execute_timeout = Some(parse_timeout_secs(&value, &flag)?);
            }
            "--language-version" => {
                session.language_version = Some(parser.value(&flag, inline)?);
            }
            "--debug-repl" => {
                debug_repl = true;
            }
            "--debug-events-dir" => {
                debug_events_dir = Some(PathBuf::from(parser.value(&flag, inline)?));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    // A custom program without `--arg` gets no arguments; the default keeps `--terminal=none`.
    session.launch = match (program, launch_args) {
        (None, None) => LaunchCommand::default(),
        (None, Some(args)) => LaunchCommand::new(config::DEFAULT_PROGRAM, args),
        (Some(program), args) => LaunchCommand::new(program, args.unwrap_or_default()),
    };
    if !default_warnings {
        session.filters.benign_prefixes.clear();
    }
    session.filters.benign_prefixes.extend(extra_warnings);
    regex::bytes::Regex::new(&session.prompt_pattern)
        .map_err(|err| format!("invalid --prompt pattern: {err}"))?;

    Ok(CliOptions {
        session,
        debug_repl,
        debug_events_dir,
    })
}

fn parse_image_size(raw: &str) -> Result<u32, String> {
    match raw.trim().parse::<u32>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(format!("invalid --image-size value: {raw} (expected pixels)")),
    }
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new(args: Vec<String>) -> Self {
        Self { args, index: 0 }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    /// The value of `flag`, taken from `--flag=value` or from the next argument.
    fn value(&mut self, flag: &str, inline: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
        let value = match inline {
            Some(value) => value,
            None => self
                .next()
                .ok_or_else(|| format!("missing value for {flag}"))?,
        };
        if value.trim().is_empty() {
            return Err(format!("missing value for {flag}").into());
        }
        Ok(value)
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
geoscript-kernel [--debug-repl] [--command <program>] [--arg <value>]... [--prompt <regex>] [--language-version <v>]\n\n\
--command: REPL program (default: geoscript-groovysh; env {command_env})\n\
--arg: argument for the program (repeatable; default: --terminal=none)\n\
--prompt: regular expression that marks the REPL prompt (default: groovy:)\n\
--benign-warning: drop output lines starting with this prefix (repeatable)\n\
--no-default-warnings: do not drop the built-in NetCDF library warnings\n\
--no-force-xy: keep the GeoTools default axis order\n\
--keep-logging: leave java.util.logging enabled in the REPL\n\
--image-size: pixel size of images drawn by display() (default: {image_size})\n\
--startup-timeout-secs: wait this long for the first prompt (default: {startup_secs})\n\
--execute-timeout-secs: restart the REPL when one execution runs longer (default: unbounded)\n\
--language-version: report this Groovy version instead of probing `<program> --version`\n\
--debug-repl: run an interactive debug REPL over the terminal instead of the MCP server\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: {events_env})",
        command_env = config::COMMAND_ENV,
        image_size = config::DEFAULT_IMAGE_SIZE,
        startup_secs = config::DEFAULT_STARTUP_TIMEOUT.as_secs(),
        events_env = event_log::DEBUG_EVENTS_DIR_ENV,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse(args: &[&str]) -> CliOptions {
        parse_cli_args(args.iter().map(|arg| arg.to_string()).collect()).expect("parse args")
    }

    fn parse_err(args: &[&str]) -> String {
        match parse_cli_args(args.iter().map(|arg| arg.to_string()).collect()) {
            Ok(_) => panic!("expected {args:?} to be rejected"),
            Err(err) => err.to_string(),
        }
    }

    #[test]
    fn custom_command_takes_repeatable_args_in_both_forms() {
        let options = parse(&["--command", "sh", "--arg", "-c", "--arg=echo hi"]);
        assert_eq!(options.session.launch.program, "sh");
        assert_eq!(options.session.launch.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn custom_command_without_args_runs_bare() {
        let options = parse(&["--command=/opt/geoscript/bin/geoscript-groovysh"]);
        assert!(options.session.launch.args.is_empty());
    }

    #[test]
    fn benign_warnings_extend_or_replace_defaults() {
        let options = parse(&["--benign-warning", "SLF4J:"]);
        assert_eq!(options.session.filters.benign_prefixes.len(), 3);
        let options = parse(&["--no-default-warnings", "--benign-warning", "SLF4J:"]);
        assert_eq!(options.session.filters.benign_prefixes, vec!["SLF4J:"]);
    }

    #[test]
    fn init_and_timeout_flags_apply() {
        let options = parse(&[
            "--no-force-xy",
            "--keep-logging",
            "--image-size",
            "512",
            "--execute-timeout-secs=2.5",
            "--language-version",
            "1.0",
            "--debug-repl",
        ]);
        assert!(!options.session.init.force_xy);
        assert!(!options.session.init.silence_logging);
        assert_eq!(options.session.init.image_size, 512);
        assert_eq!(
            options.session.execute_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(options.session.language_version.as_deref(), Some("1.0"));
        assert!(options.debug_repl);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse_err(&["--prompt", "groovy:("]).contains("invalid --prompt"));
        assert!(parse_err(&["--arg"]).contains("missing value for --arg"));
        assert!(parse_err(&["--image-size", "0"]).contains("--image-size"));
        assert!(parse_err(&["--frobnicate"]).contains("unknown argument"));
    }
}
