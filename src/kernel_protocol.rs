use serde::{Deserialize, Serialize};

pub const IMPLEMENTATION_NAME: &str = "geoscript-kernel";
pub const IMPLEMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Abort,
    Error,
}

impl ReplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Abort => "abort",
            ReplyStatus::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    /// Base64 text exactly as the REPL printed it.
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    pub execution_count: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImagePayload>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_store_history")]
    pub store_history: bool,
}

fn default_store_history() -> bool {
    true
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
        }
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn store_history(mut self, store_history: bool) -> Self {
        self.store_history = store_history;
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    Stream { name: StreamName, text: String },
    DisplayData { mime_type: String, data: String },
}

impl KernelEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        KernelEvent::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        KernelEvent::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }
}

/// Receives the events an execution publishes, in order, before its reply is returned.
pub trait OutputSink {
    fn publish(&mut self, event: KernelEvent);
}

#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<KernelEvent>,
}

impl OutputSink for CollectingSink {
    fn publish(&mut self, event: KernelEvent) {
        self.events.push(event);
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LanguageInfo {
    pub name: &'static str,
    pub codemirror_mode: &'static str,
    pub mimetype: &'static str,
    pub file_extension: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl LanguageInfo {
    pub fn groovy(version: Option<String>) -> Self {
        Self {
            name: "groovy",
            codemirror_mode: "groovy",
            mimetype: "text/groovy",
            file_extension: ".groovy",
            version,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub implementation: &'static str,
    pub implementation_version: &'static str,
    pub language_info: LanguageInfo,
    pub banner: String,
}

impl KernelInfo {
    pub fn new(banner: String, language_version: Option<String>) -> Self {
        Self {
            implementation: IMPLEMENTATION_NAME,
            implementation_version: IMPLEMENTATION_VERSION,
            language_info: LanguageInfo::groovy(language_version),
            banner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_defaults_to_storing_history() {
        let request: ExecuteRequest =
            serde_json::from_str(r#"{"code":"1 + 1"}"#).expect("parse request");
        assert_eq!(request, ExecuteRequest::new("1 + 1"));
        assert!(request.store_history);
        assert!(!request.silent);
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let value = serde_json::to_value(KernelEvent::stderr("oops")).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "stream", "name": "stderr", "text": "oops"})
        );
    }

    #[test]
    fn kernel_info_reports_groovy_language() {
        let info = KernelInfo::new("Groovy Shell version 2.4.15".to_string(), Some("2.4.15".into()));
        let value = serde_json::to_value(&info).expect("serialize");
        assert_eq!(value["language_info"]["mimetype"], "text/groovy");
        assert_eq!(value["language_info"]["file_extension"], ".groovy");
        assert_eq!(value["language_info"]["version"], "2.4.15");
        assert_eq!(value["implementation"], "geoscript-kernel");
    }
}
