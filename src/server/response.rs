use rmcp::model::{AnnotateAble, CallToolResult, Content, Meta, RawContent, RawImageContent};
use serde_json::json;

use crate::kernel_protocol::{ExecuteReply, KernelEvent, ReplyStatus, StreamName};

/// Turns what an execution published into tool content, in publication order.
pub(crate) fn execute_reply_to_contents(
    reply: &ExecuteReply,
    events: Vec<KernelEvent>,
) -> Vec<Content> {
    let mut contents: Vec<Content> = events
        .into_iter()
        .map(|event| match event {
            KernelEvent::Stream {
                name: StreamName::Stdout,
                text,
            } => Content::text(text),
            KernelEvent::Stream {
                name: StreamName::Stderr,
                text,
            } => Content::text(format!("[stderr] {text}")),
            KernelEvent::DisplayData { mime_type, data } => {
                content_image_with_meta(data, mime_type, reply.execution_count)
            }
        })
        .collect();
    if reply.status != ReplyStatus::Ok {
        contents.push(Content::text(status_line(reply)));
    }
    contents
}

pub(crate) fn finalize_batch(mut contents: Vec<Content>) -> CallToolResult {
    ensure_nonempty_contents(&mut contents);
    // Kernel failures are reported in the content, never as MCP tool errors.
    CallToolResult::success(contents)
}

pub(crate) fn status_line(reply: &ExecuteReply) -> String {
    format!(
        "[geoscript-kernel] status: {} (execution_count={})",
        reply.status.as_str(),
        reply.execution_count
    )
}

fn ensure_nonempty_contents(contents: &mut Vec<Content>) {
    if contents.is_empty() {
        contents.push(Content::text(String::new()));
    }
}

fn content_image_with_meta(data: String, mime_type: String, execution_count: u64) -> Content {
    let mut meta = Meta::new();
    meta.0.insert(
        "geoscriptKernel".to_string(),
        json!({
            "executionCount": execution_count,
        }),
    );
    RawContent::Image(RawImageContent {
        data,
        mime_type,
        meta: Some(meta),
    })
    .no_annotation()
}
