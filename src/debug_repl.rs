use std::env;
use std::io::{self, BufRead, Write};

use crate::config::SessionConfig;
use crate::kernel_protocol::{ExecuteRequest, KernelEvent, KernelInfo, OutputSink, ReplyStatus, StreamName};
use crate::session::Session;
use crate::signals;

const IMAGES_ENV: &str = "GEOSCRIPT_KERNEL_REPL_IMAGES";
const PRIMARY_PROMPT: &str = "geoscript> ";
const CONTINUATION_PROMPT: &str = "      ... ";

pub(crate) fn run(config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    let image_support = detect_image_support();
    eprintln!(
        "debug repl: end a line with \\ to continue it | commands: RESTART, INFO | Ctrl-C interrupts | Ctrl-D to exit | images={}",
        if image_support { "kitty" } else { "off" }
    );
    signals::install_sigint_forwarding()?;

    let mut session = Session::start(config)?;
    let banner = session.banner()?;
    let kernel_info = KernelInfo::new(banner.text.clone(), Some(banner.language_version.clone()));
    eprintln!("{}", kernel_info.banner.trim_end());

    let stdin = io::stdin();
    let mut stdin = stdin.lock();
    let mut sink = TerminalSink::new(image_support);

    loop {
        let Some(line) = read_line(&mut stdin, PRIMARY_PROMPT)? else {
            break;
        };

        if is_exact_command(&line, "RESTART") {
            match session.restart() {
                Ok(()) => eprintln!("[geoscript-kernel] restarted (spawn_count={})", session.spawn_count()),
                Err(err) => eprintln!("[geoscript-kernel] restart failed: {err}"),
            }
            continue;
        }
        if is_exact_command(&line, "INFO") {
            println!("{}", serde_json::to_string_pretty(&kernel_info)?);
            continue;
        }

        let (chunk, mut more) = split_continuation(&line);
        let mut code = chunk;
        while more {
            let Some(next) = read_line(&mut stdin, CONTINUATION_PROMPT)? else {
                return Err("EOF reached while reading a continued line".into());
            };
            let (chunk, next_more) = split_continuation(&next);
            code.push('\n');
            code.push_str(&chunk);
            more = next_more;
        }

        let reply = session.execute(&ExecuteRequest::new(code), &mut sink);
        sink.finish()?;
        if reply.status != ReplyStatus::Ok {
            eprintln!(
                "[geoscript-kernel] status: {} (execution_count={})",
                reply.status.as_str(),
                reply.execution_count
            );
        }
        if !session.is_alive() {
            eprintln!("[geoscript-kernel] repl is not running; the next input retries the spawn");
        }
    }

    session.shutdown();
    Ok(())
}

/// Writes events to the terminal as they are published.
struct TerminalSink {
    image_support: bool,
    error: Option<io::Error>,
}

impl TerminalSink {
    fn new(image_support: bool) -> Self {
        Self {
            image_support,
            error: None,
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        io::stderr().flush()?;
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn render(&self, event: KernelEvent) -> io::Result<()> {
        let mut stdout = io::stdout();
        let mut stderr = io::stderr();
        match event {
            KernelEvent::Stream {
                name: StreamName::Stdout,
                text,
            } => writeln!(stdout, "{text}"),
            KernelEvent::Stream {
                name: StreamName::Stderr,
                text,
            } => writeln!(stderr, "{text}"),
            KernelEvent::DisplayData { mime_type, data } => {
                if self.image_support && write_kitty_image(&mut stdout, &data, &mime_type)? {
                    return Ok(());
                }
                writeln!(
                    stderr,
                    "[geoscript-kernel] image mime={mime_type} bytes={}",
                    data.len()
                )
            }
        }
    }
}

impl OutputSink for TerminalSink {
    fn publish(&mut self, event: KernelEvent) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.render(event) {
            self.error = Some(err);
        }
    }
}

fn read_line(reader: &mut impl BufRead, prompt: &str) -> io::Result<Option<String>> {
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn is_exact_command(line: &str, command: &str) -> bool {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    trimmed == command
}

/// Strips the line ending; a trailing backslash asks for another line.
fn split_continuation(line: &str) -> (String, bool) {
    let body = line.trim_end_matches(['\n', '\r']);
    match body.strip_suffix('\\') {
        Some(prefix) => (prefix.to_string(), true),
        None => (body.to_string(), false),
    }
}

fn detect_image_support() -> bool {
    if let Ok(value) = env::var(IMAGES_ENV) {
        return is_truthy(&value);
    }
    let term = env::var("TERM").unwrap_or_default().to_lowercase();
    if term.contains("xterm-kitty") {
        return true;
    }
    if env::var_os("KITTY_WINDOW_ID").is_some() {
        return true;
    }
    let term_program = env::var("TERM_PROGRAM").unwrap_or_default().to_lowercase();
    matches!(term_program.as_str(), "ghostty" | "wezterm" | "iterm.app")
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "kitty"
    )
}

fn write_kitty_image(stdout: &mut impl Write, data: &str, mime_type: &str) -> io::Result<bool> {
    let format = match mime_type.trim().to_lowercase().as_str() {
        "image/png" => 100,
        _ => return Ok(false),
    };
    const CHUNK: usize = 4096;
    let bytes = data.as_bytes();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + CHUNK).min(bytes.len());
        let more = u8::from(end < bytes.len());
        if offset == 0 {
            write!(stdout, "\x1b_Gf={format},a=T,m={more};")?;
        } else {
            write!(stdout, "\x1b_Gm={more};")?;
        }
        stdout.write_all(&bytes[offset..end])?;
        stdout.write_all(b"\x1b\\")?;
        offset = end;
    }
    stdout.write_all(b"\n")?;
    Ok(true)
}
