use crate::config::OutputFilters;

const IMAGE_PREFIX: &str = "image/";
const BASE64_MARKER: &str = ";base64,";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLine {
    pub mime_type: String,
    /// Everything after `;base64,`, untouched.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    Text(String),
    Image(ImageLine),
    Discard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedOutput {
    pub text_lines: Vec<String>,
    pub images: Vec<ImageLine>,
}

impl ClassifiedOutput {
    pub fn text(&self) -> String {
        self.text_lines.join("\n")
    }
}

pub fn classify_line(line: &str, filters: &OutputFilters) -> LineClass {
    let line = strip_prompt_artifacts(line, &filters.echo_prefix).trim();
    if line.is_empty() || line == filters.null_marker {
        return LineClass::Discard;
    }
    if let Some(image) = parse_image_line(line) {
        return LineClass::Image(image);
    }
    if filters
        .benign_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && line.starts_with(prefix.as_str()))
    {
        return LineClass::Discard;
    }
    LineClass::Text(line.to_string())
}

pub fn classify_output(raw: &str, filters: &OutputFilters) -> ClassifiedOutput {
    let mut output = ClassifiedOutput::default();
    for line in raw.lines() {
        match classify_line(line, filters) {
            LineClass::Text(text) => output.text_lines.push(text),
            LineClass::Image(image) => output.images.push(image),
            LineClass::Discard => {}
        }
    }
    output
}

// groovysh echoes results as `===> value` and continuation prompts leave `001>` behind.
fn strip_prompt_artifacts<'a>(mut line: &'a str, echo_prefix: &str) -> &'a str {
    loop {
        let trimmed = line.trim_start();
        if !echo_prefix.is_empty() {
            if let Some(rest) = trimmed.strip_prefix(echo_prefix) {
                line = rest;
                continue;
            }
        }
        if let Some(rest) = strip_numeric_prompt(trimmed) {
            line = rest;
            continue;
        }
        return line;
    }
}

fn strip_numeric_prompt(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    if bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b'>' {
        return Some(&line[4..]);
    }
    None
}

fn parse_image_line(line: &str) -> Option<ImageLine> {
    let rest = line.strip_prefix(IMAGE_PREFIX)?;
    let marker = rest.find(BASE64_MARKER)?;
    let subtype = &rest[..marker];
    if subtype.is_empty()
        || !subtype
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
    {
        return None;
    }
    Some(ImageLine {
        mime_type: format!("{IMAGE_PREFIX}{subtype}"),
        payload: rest[marker + BASE64_MARKER.len()..].to_string(),
    })
}
