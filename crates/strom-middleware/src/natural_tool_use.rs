// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Natural tool-use parser: makes a text-only model behave like a native
//! tool-calling model.
//!
//! The streaming scanner watches the text stream for
//! `<tool_call name="NAME">…</tool_call>` blocks, emits only the prefix text
//! that can no longer be part of a tag, holds back ambiguous tails, and
//! turns each complete block into a `ToolsCall` message.  Bodies are fenced
//! or raw JSON, optionally validated against the tool's parameter schema; a
//! configured fallback agent repairs payloads that fail.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use strom_agent::{
    Agent, CancelToken, GenerateOptions, InvocationContext, MessageStream, Middleware,
    PipelineError, ResponseFormat, Result, StreamingAgent, StreamingMiddleware,
};
use strom_message::{FunctionContract, Message, MessageBody, Role, ToolCall};

/// External JSON-Schema validation collaborator.  The core only needs a
/// verdict; schema semantics live outside.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &Value, instance: &Value) -> std::result::Result<(), String>;
}

pub struct NaturalToolUseMiddleware {
    contracts: Arc<Vec<FunctionContract>>,
    validator: Option<Arc<dyn SchemaValidator>>,
    fallback: Option<Arc<dyn Agent>>,
    /// Prompt injection happens once per instance; instantiate per request
    /// when serving concurrent calls through one chain.
    first_invocation: AtomicBool,
}

impl NaturalToolUseMiddleware {
    pub fn new(contracts: Vec<FunctionContract>) -> Self {
        Self {
            contracts: Arc::new(contracts),
            validator: None,
            fallback: None,
            first_invocation: AtomicBool::new(true),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Agent>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// First call only: render the tool contracts into a `# Tool Calls`
    /// section on the system message and take over the tool interface.
    fn inject_prompt(&self, ctx: &mut InvocationContext) {
        if !self.first_invocation.swap(false, Ordering::SeqCst) {
            return;
        }
        let section = render_tool_section(&self.contracts);
        let existing = ctx
            .messages
            .iter_mut()
            .find(|m| m.role == Role::System && matches!(m.body, MessageBody::Text { .. }));
        match existing {
            Some(sys) => {
                if let MessageBody::Text { text } = &mut sys.body {
                    text.push_str("\n\n");
                    text.push_str(&section);
                }
            }
            None => ctx.messages.insert(0, Message::system(section)),
        }
        if ctx.options.functions.take().is_some() {
            debug!("cleared options.functions: natural tool use owns the tool interface");
        }
    }

    fn shared(&self, cancel: &CancelToken) -> ChunkProcessor {
        ChunkProcessor {
            contracts: Arc::clone(&self.contracts),
            validator: self.validator.clone(),
            fallback: self.fallback.clone(),
            cancel: cancel.clone(),
        }
    }
}

#[async_trait]
impl Middleware for NaturalToolUseMiddleware {
    fn name(&self) -> &str {
        "natural_tool_use"
    }

    async fn invoke(
        &self,
        mut ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        self.inject_prompt(&mut ctx);
        let replies = inner.generate(&ctx.messages, &ctx.options, cancel).await?;
        let processor = self.shared(cancel);

        let mut out = Vec::with_capacity(replies.len());
        for m in replies {
            let text = match &m.body {
                MessageBody::Text { text } => text.clone(),
                _ => {
                    out.push(m);
                    continue;
                }
            };
            let chunks = parse_complete(&text);
            if !chunks.iter().any(|c| matches!(c, Chunk::ToolCall { .. })) {
                out.push(m);
                continue;
            }
            for chunk in chunks {
                match chunk {
                    Chunk::Text(t) => {
                        if !t.is_empty() {
                            let mut piece = m.clone();
                            piece.body = MessageBody::Text { text: t };
                            out.push(piece);
                        }
                    }
                    Chunk::ToolCall { name, body } => {
                        out.push(processor.process(&name, &body).await?);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamingMiddleware for NaturalToolUseMiddleware {
    async fn invoke_stream(
        &self,
        mut ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        self.inject_prompt(&mut ctx);
        let stream = inner
            .generate_stream(&ctx.messages, &ctx.options, cancel)
            .await?;
        Ok(scan_stream(stream, self.shared(cancel)))
    }
}

// ─── Wire format ──────────────────────────────────────────────────────────────

fn tool_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<tool_call\s+name="([^"']+)"\s*>(.*?)</tool_call>"#)
            .expect("static regex")
    })
}

fn fenced_json_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("static regex"))
}

#[derive(Debug, PartialEq)]
enum Chunk {
    Text(String),
    ToolCall { name: String, body: String },
}

/// Split `buffer` into text and complete tool-call chunks.  Trailing text
/// after the last call is included as a final text chunk.
fn parse_complete(buffer: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut cursor = 0;
    for caps in tool_call_regex().captures_iter(buffer) {
        let whole = caps.get(0).expect("match");
        if whole.start() > cursor {
            chunks.push(Chunk::Text(buffer[cursor..whole.start()].to_string()));
        }
        chunks.push(Chunk::ToolCall {
            name: caps[1].to_string(),
            body: caps[2].to_string(),
        });
        cursor = whole.end();
    }
    if cursor < buffer.len() {
        chunks.push(Chunk::Text(buffer[cursor..].to_string()));
    }
    chunks
}

/// Length of the prefix of `buffer` that cannot be part of an in-flight
/// tool-call tag.  Everything from the returned index on must stay
/// buffered.
fn safe_prefix_len(buffer: &str) -> usize {
    let mut unsafe_start = buffer.len();

    // An opening tag with no closing tag after it poisons everything from
    // its position on.  Complete calls were already consumed by the caller,
    // so any full `<tool_call` occurrence here is unterminated.
    if let Some(pos) = buffer.find("<tool_call") {
        unsafe_start = unsafe_start.min(pos);
    }

    // A buffer tail that is a strict prefix of an opening or closing tag
    // might grow into one.
    for pattern in ["<tool_call", "</tool_call"] {
        for k in 1..=pattern.len() {
            if buffer.ends_with(&pattern[..k]) {
                unsafe_start = unsafe_start.min(buffer.len() - k);
            }
        }
    }
    unsafe_start
}

/// Outcome of JSON extraction from a tool-call body.
fn extract_json(body: &str) -> std::result::Result<String, String> {
    if let Some(caps) = fenced_json_regex().captures(body) {
        let content = caps[1].to_string();
        return match serde_json::from_str::<Value>(&content) {
            Ok(_) => Ok(content),
            Err(e) => Err(format!("fenced block is not valid JSON: {e}")),
        };
    }
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(_) => Ok(trimmed.to_string()),
            Err(e) => Err(format!("body is not valid JSON: {e}")),
        };
    }
    Err("no JSON payload found in tool call body".to_string())
}

// ─── Chunk processing & fallback repair ───────────────────────────────────────

/// The per-call machinery shared by the streaming and non-streaming paths.
struct ChunkProcessor {
    contracts: Arc<Vec<FunctionContract>>,
    validator: Option<Arc<dyn SchemaValidator>>,
    fallback: Option<Arc<dyn Agent>>,
    cancel: CancelToken,
}

impl ChunkProcessor {
    fn contract(&self, name: &str) -> Option<&FunctionContract> {
        self.contracts.iter().find(|c| c.name == name)
    }

    /// Turn one `(name, body)` block into a `ToolsCall` message, repairing
    /// through the fallback agent when extraction or validation fails.
    async fn process(&self, name: &str, body: &str) -> Result<Message> {
        let direct = self.try_direct(name, body);
        match direct {
            Ok(args) => Ok(tools_call_message(name, args)),
            Err(reason) => {
                if self.fallback.is_none() {
                    return Err(PipelineError::tool_use_parsing(format!(
                        "tool call '{name}': {reason}"
                    )));
                }
                warn!(tool = %name, reason = %reason, "repairing tool call via fallback agent");
                let args = self.repair(name, body).await?;
                Ok(tools_call_message(name, args))
            }
        }
    }

    /// Happy path: extract JSON and validate against the schema.
    fn try_direct(&self, name: &str, body: &str) -> std::result::Result<String, String> {
        let args = extract_json(body)?;
        self.validate_args(name, &args)?;
        Ok(args)
    }

    fn validate_args(&self, name: &str, args: &str) -> std::result::Result<(), String> {
        let (Some(contract), Some(validator)) = (self.contract(name), &self.validator) else {
            return Ok(());
        };
        let instance: Value =
            serde_json::from_str(args).map_err(|e| format!("arguments are not JSON: {e}"))?;
        validator
            .validate(&contract.parameters_schema(), &instance)
            .map_err(|e| format!("schema validation failed: {e}"))
    }

    /// Fallback repair.  Path A uses structured output against the
    /// contract's schema; path B is a free-form rewrite prompt.  Both emit
    /// the repaired call with role Assistant.
    async fn repair(&self, name: &str, raw: &str) -> Result<String> {
        let fallback = self.fallback.as_ref().expect("caller checked fallback");

        if let Some(contract) = self.contract(name) {
            let schema = contract.parameters_schema();
            match self
                .repair_structured(fallback.as_ref(), name, raw, schema)
                .await
            {
                Ok(args) => return Ok(args),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(tool = %name, error = %e, "structured repair failed, trying legacy path");
                }
            }
        }
        self.repair_legacy(fallback.as_ref(), name, raw).await
    }

    async fn repair_structured(
        &self,
        fallback: &dyn Agent,
        name: &str,
        raw: &str,
        schema: Value,
    ) -> Result<String> {
        let options = GenerateOptions::default().with_response_format(
            ResponseFormat::json_schema(format!("{name}_parameters"), true, schema),
        );
        let prompt = format!(
            "Extract and fix the parameters for the {name} function call from the following \
             content. Return only valid JSON that matches the expected schema:\n\n{raw}"
        );
        let replies = fallback
            .generate(&[Message::user(prompt)], &options, &self.cancel)
            .await?;
        let text = first_text(&replies).ok_or_else(|| {
            PipelineError::tool_use_parsing("structured repair returned no text reply")
        })?;
        let args = extract_json(text)
            .map_err(|e| PipelineError::tool_use_parsing(format!("structured repair: {e}")))?;
        self.validate_args(name, &args)
            .map_err(PipelineError::tool_use_parsing)?;
        Ok(args)
    }

    async fn repair_legacy(
        &self,
        fallback: &dyn Agent,
        name: &str,
        raw: &str,
    ) -> Result<String> {
        let prompt = format!(
            "Rewrite the following reply as a valid function call JSON for {name}. \
             Extract the intent and parameters:\n\n{raw}"
        );
        let replies = fallback
            .generate(&[Message::user(prompt)], &GenerateOptions::default(), &self.cancel)
            .await
            .map_err(|e| match e {
                PipelineError::Cancelled => PipelineError::Cancelled,
                other => {
                    PipelineError::tool_use_parsing(format!("legacy repair failed: {other}"))
                }
            })?;
        let text = first_text(&replies).ok_or_else(|| {
            PipelineError::tool_use_parsing("legacy repair returned no text reply")
        })?;
        let args = extract_json(text)
            .map_err(|e| PipelineError::tool_use_parsing(format!("legacy repair: {e}")))?;
        self.validate_args(name, &args)
            .map_err(PipelineError::tool_use_parsing)?;
        Ok(args)
    }
}

fn first_text(replies: &[Message]) -> Option<&str> {
    replies.iter().find_map(|m| match &m.body {
        MessageBody::Text { text } if !text.is_empty() => Some(text.as_str()),
        _ => None,
    })
}

fn tools_call_message(name: &str, args: String) -> Message {
    Message::tool_calls(vec![ToolCall {
        function_name: name.to_string(),
        function_args: args,
        index: None,
        tool_call_id: Some(Uuid::new_v4().to_string()),
        tool_call_idx: None,
    }])
}

fn render_tool_section(contracts: &[FunctionContract]) -> String {
    let mut out = String::from(
        "# Tool Calls\n\n\
         When you need to call a tool, emit a block of exactly this shape in \
         your reply:\n\n\
         <tool_call name=\"TOOL_NAME\">\n\
         { \"parameter\": \"value\" }\n\
         </tool_call>\n\n\
         The body must be JSON matching the tool's parameter schema. \
         Available tools:\n\n",
    );
    for c in contracts {
        out.push_str(&c.to_markdown());
        out.push('\n');
    }
    out
}

// ─── Streaming scanner ────────────────────────────────────────────────────────

struct ScanState {
    inner: MessageStream,
    processor: ChunkProcessor,
    buffer: String,
    pending: VecDeque<Message>,
    template: Option<Message>,
    queue: VecDeque<Message>,
    /// Error to surface after the queue drains.
    error: Option<PipelineError>,
    done: bool,
}

fn scan_stream(inner: MessageStream, processor: ChunkProcessor) -> MessageStream {
    let state = ScanState {
        inner,
        processor,
        buffer: String::new(),
        pending: VecDeque::new(),
        template: None,
        queue: VecDeque::new(),
        error: None,
        done: false,
    };
    Box::pin(futures::stream::unfold(state, |mut s| async move {
        loop {
            if let Some(m) = s.queue.pop_front() {
                return Some((Ok(m), s));
            }
            if let Some(e) = s.error.take() {
                s.done = true;
                return Some((Err(e), s));
            }
            if s.done {
                return None;
            }
            match s.inner.next().await {
                None => {
                    s.done = true;
                    s.flush_pending();
                }
                Some(Err(e)) => {
                    // Abort: flush whatever text was held back, then
                    // propagate the failure.
                    s.flush_pending();
                    s.error = Some(e);
                }
                Some(Ok(msg)) => s.process(msg).await,
            }
        }
    }))
}

impl ScanState {
    async fn process(&mut self, msg: Message) {
        let text = match &msg.body {
            MessageBody::TextUpdate { text, .. } => text.clone(),
            _ => {
                self.queue.push_back(msg);
                return;
            }
        };

        if self.template.is_none() {
            self.template = Some(msg.clone());
        }
        self.buffer.push_str(&text);
        self.pending.push_back(msg);

        let chunks = parse_complete(&self.buffer);
        if chunks.iter().any(|c| matches!(c, Chunk::ToolCall { .. })) {
            let template = self.template.clone().expect("set above");
            for chunk in chunks {
                match chunk {
                    Chunk::Text(t) => {
                        if !t.is_empty() {
                            self.queue.push_back(text_update_like(&template, t));
                        }
                    }
                    Chunk::ToolCall { name, body } => {
                        match self.processor.process(&name, &body).await {
                            Ok(m) => self.queue.push_back(m),
                            Err(e) => {
                                self.error = Some(e);
                                self.buffer.clear();
                                self.pending.clear();
                                self.template = None;
                                return;
                            }
                        }
                    }
                }
            }
            self.buffer.clear();
            self.pending.clear();
            self.template = None;
            return;
        }

        // No complete call yet: emit the prefix that cannot be part of a
        // tag.  Updates are never split, so only whole leading updates that
        // fit inside the safe prefix go out.
        let safe_len = safe_prefix_len(&self.buffer);
        let mut emitted = 0;
        while let Some(front) = self.pending.front() {
            let len = match &front.body {
                MessageBody::TextUpdate { text, .. } => text.len(),
                _ => 0,
            };
            if emitted + len > safe_len {
                break;
            }
            emitted += len;
            let m = self.pending.pop_front().expect("front checked");
            self.queue.push_back(m);
        }
        self.buffer.drain(..emitted);
        if self.pending.is_empty() {
            self.template = None;
        }
    }

    fn flush_pending(&mut self) {
        while let Some(m) = self.pending.pop_front() {
            self.queue.push_back(m);
        }
        self.buffer.clear();
        self.template = None;
    }
}

fn text_update_like(template: &Message, text: String) -> Message {
    let mut m = template.clone();
    let is_thinking = match &template.body {
        MessageBody::TextUpdate { is_thinking, .. } => *is_thinking,
        _ => false,
    };
    m.body = MessageBody::TextUpdate { text, is_thinking };
    m
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strom_agent::mock::ScriptedAgent;
    use strom_agent::stream_from_messages;

    fn add_contract() -> FunctionContract {
        FunctionContract::new("add", "Adds two numbers").with_parameter(
            strom_message::ParameterContract::new(
                "a",
                serde_json::json!({"type": "number"}),
                true,
            ),
        )
    }

    fn middleware() -> NaturalToolUseMiddleware {
        NaturalToolUseMiddleware::new(vec![add_contract()])
    }

    async fn scan(mw: &NaturalToolUseMiddleware, updates: Vec<&str>) -> Vec<Message> {
        let msgs: Vec<Message> = updates.into_iter().map(Message::text_update).collect();
        let processor = mw.shared(&CancelToken::none());
        scan_stream(stream_from_messages(msgs), processor)
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    // ── Pure parsing ──────────────────────────────────────────────────────────

    #[test]
    fn parse_complete_extracts_calls_and_text() {
        let chunks =
            parse_complete("Hello <tool_call name=\"add\">{\"a\":1}</tool_call> done");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], Chunk::Text("Hello ".into()));
        assert_eq!(
            chunks[1],
            Chunk::ToolCall {
                name: "add".into(),
                body: "{\"a\":1}".into()
            }
        );
        assert_eq!(chunks[2], Chunk::Text(" done".into()));
    }

    #[test]
    fn parse_complete_handles_multiline_bodies() {
        let text = "<tool_call name=\"add\">\n```json\n{\"a\": 1}\n```\n</tool_call>";
        let chunks = parse_complete(text);
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Chunk::ToolCall { name, .. } if name == "add"));
    }

    #[test]
    fn safe_prefix_holds_back_partial_tags() {
        assert_eq!(safe_prefix_len("hello"), 5);
        assert_eq!(safe_prefix_len("hi <tool_"), 3);
        assert_eq!(safe_prefix_len("hi <"), 3);
        assert_eq!(safe_prefix_len("text </tool_call"), 5);
        // Full opening tag without a closing tag: everything from the tag on
        // is unsafe.
        assert_eq!(safe_prefix_len("ab <tool_call name=\"x\">{"), 3);
    }

    #[test]
    fn extract_json_prefers_fenced_block() {
        assert_eq!(
            extract_json("```json\n{\"a\":1}\n```").unwrap(),
            "{\"a\":1}"
        );
        assert_eq!(extract_json("```\n[1,2]\n```").unwrap(), "[1,2]");
        assert_eq!(extract_json("  {\"a\": 2} ").unwrap(), "{\"a\": 2}");
        assert!(extract_json("no json here").is_err());
        assert!(extract_json("{broken").is_err());
    }

    // ── Streaming scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn complete_call_in_one_chunk() {
        // Text before and after a complete call, all in a single update.
        let mw = middleware();
        let out = scan(
            &mw,
            vec!["Hello <tool_call name=\"add\">{\"a\":1,\"b\":2}</tool_call> done"],
        )
        .await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_text(), Some("Hello "));
        assert!(matches!(out[0].body, MessageBody::TextUpdate { .. }));
        let calls = out[1].tool_calls_slice().expect("tools call");
        assert_eq!(calls[0].function_name, "add");
        assert_eq!(calls[0].function_args, "{\"a\":1,\"b\":2}");
        assert!(calls[0].tool_call_id.is_some(), "fresh id assigned");
        assert_eq!(out[1].role, Role::Assistant);
        assert_eq!(out[2].as_text(), Some(" done"));
    }

    #[tokio::test]
    async fn call_split_across_updates() {
        // Nothing but safe prefix may be emitted until the closing tag.
        let mw = middleware();
        let out = scan(
            &mw,
            vec![
                "Hi <tool_",
                "call name=\"add\">",
                "{\"a\":1",
                ",\"b\":2}</tool_call>!",
            ],
        )
        .await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_text(), Some("Hi "));
        let calls = out[1].tool_calls_slice().expect("tools call");
        assert_eq!(calls[0].function_name, "add");
        assert_eq!(calls[0].function_args, "{\"a\":1,\"b\":2}");
        assert_eq!(out[2].as_text(), Some("!"));
    }

    #[tokio::test]
    async fn safe_text_flows_while_tag_is_ambiguous() {
        let mw = middleware();
        let out = scan(&mw, vec!["plain text ", "more <tool_"]).await;
        // The first update flows immediately.  The second straddles the
        // safe boundary ("more " is safe, "<tool_" is not) and updates are
        // never split, so it is held back whole and flushed at stream end.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_text(), Some("plain text "));
        let total: String = out.iter().filter_map(|m| m.as_text()).collect();
        assert_eq!(total, "plain text more <tool_");
    }

    #[tokio::test]
    async fn unterminated_tag_flushes_at_end_of_stream() {
        let mw = middleware();
        let out = scan(&mw, vec!["x <tool_call name=\"add\">{\"a\":"]).await;
        // Never completed: the raw update is flushed verbatim at stream end.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_text(), Some("x <tool_call name=\"add\">{\"a\":"));
    }

    #[tokio::test]
    async fn updates_are_never_split_when_flushing_safe_text() {
        let mw = middleware();
        // One update whose text straddles the safe boundary: "abc <to" —
        // safe prefix is "abc " but the update cannot be split, so nothing
        // is emitted until the ambiguity resolves.
        let out = scan(&mw, vec!["abc <to", "ol_call name=\"add\">{}</tool_call>"]).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_text(), Some("abc "));
        assert!(out[1].tool_calls_slice().is_some());
    }

    #[tokio::test]
    async fn parse_error_without_fallback_surfaces_tool_use_error() {
        let mw = middleware();
        let msgs = vec![Message::text_update(
            "<tool_call name=\"add\">not json at all</tool_call>",
        )];
        let processor = mw.shared(&CancelToken::none());
        let items: Vec<_> = scan_stream(stream_from_messages(msgs), processor)
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(PipelineError::ToolUseParsing(_))
        ));
    }

    #[tokio::test]
    async fn non_text_messages_pass_through_unscanned() {
        let mw = middleware();
        let msgs = vec![
            Message::usage(strom_message::Usage::new(1, 1)),
            Message::text_update("hello"),
        ];
        let processor = mw.shared(&CancelToken::none());
        let out: Vec<Message> = scan_stream(stream_from_messages(msgs), processor)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out[0].body.kind(), "usage");
        assert_eq!(out[1].as_text(), Some("hello"));
    }

    // ── Fallback repair ───────────────────────────────────────────────────────

    struct AcceptAll;
    impl SchemaValidator for AcceptAll {
        fn validate(&self, _s: &Value, _i: &Value) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    struct RejectAll;
    impl SchemaValidator for RejectAll {
        fn validate(&self, _s: &Value, _i: &Value) -> std::result::Result<(), String> {
            Err("computer says no".into())
        }
    }

    #[tokio::test]
    async fn fallback_repairs_invalid_body() {
        let fallback = Arc::new(ScriptedAgent::always_text("{\"a\": 1}"));
        let mw = middleware()
            .with_validator(Arc::new(AcceptAll))
            .with_fallback(fallback.clone());
        let out = scan(
            &mw,
            vec!["<tool_call name=\"add\">a equals one</tool_call>"],
        )
        .await;
        assert_eq!(out.len(), 1);
        let calls = out[0].tool_calls_slice().expect("repaired call");
        assert_eq!(calls[0].function_args, "{\"a\": 1}");
        assert_eq!(out[0].role, Role::Assistant);

        // Structured path: the repair request carried the schema format.
        let (_, options) = fallback.last_request.lock().unwrap().clone().unwrap();
        match options.response_format {
            Some(ResponseFormat::JsonSchema { json_schema }) => {
                assert_eq!(json_schema.name, "add_parameters");
                assert!(json_schema.strict);
            }
            other => panic!("expected schema response format, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fallback_legacy_path_used_for_unknown_tool() {
        // No contract for "mystery": structured repair is skipped and the
        // legacy rewrite prompt is used directly.
        let fallback = Arc::new(ScriptedAgent::always_text("{\"x\": true}"));
        let mw = NaturalToolUseMiddleware::new(vec![]).with_fallback(fallback.clone());
        let out = scan(
            &mw,
            vec!["<tool_call name=\"mystery\">do the thing</tool_call>"],
        )
        .await;
        let calls = out[0].tool_calls_slice().expect("repaired call");
        assert_eq!(calls[0].function_name, "mystery");
        let (seen, options) = fallback.last_request.lock().unwrap().clone().unwrap();
        assert!(seen[0]
            .as_text()
            .unwrap()
            .starts_with("Rewrite the following reply as a valid function call JSON"));
        assert!(options.response_format.is_none());
    }

    #[tokio::test]
    async fn fallback_failure_surfaces_tool_use_error() {
        // Fallback returns garbage both times → ToolUseParsing.
        let fallback = Arc::new(ScriptedAgent::always_text("still not json"));
        let mw = middleware()
            .with_validator(Arc::new(RejectAll))
            .with_fallback(fallback);
        let msgs = vec![Message::text_update(
            "<tool_call name=\"add\">{\"a\":1}</tool_call>",
        )];
        let processor = mw.shared(&CancelToken::none());
        let items: Vec<_> = scan_stream(stream_from_messages(msgs), processor)
            .collect()
            .await;
        assert!(matches!(
            items.last().unwrap(),
            Err(PipelineError::ToolUseParsing(_))
        ));
    }

    // ── Prompt injection ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_invocation_injects_tool_section_and_clears_functions() {
        let inner = ScriptedAgent::new(vec![vec![Message::text("ok")], vec![Message::text("ok")]]);
        let mw = middleware();
        let options = GenerateOptions::default().with_functions(vec![add_contract()]);
        let ctx = InvocationContext::new(vec![Message::system("Base prompt")], options.clone());
        mw.invoke(ctx, &inner, &CancelToken::none()).await.unwrap();

        let (seen, seen_options) = inner.last_request.lock().unwrap().clone().unwrap();
        let sys = seen[0].as_text().unwrap();
        assert!(sys.starts_with("Base prompt"));
        assert!(sys.contains("# Tool Calls"));
        assert!(sys.contains("## add"));
        assert!(seen_options.functions.is_none(), "functions cleared");

        // Second invocation: untouched.
        let ctx2 = InvocationContext::new(vec![Message::system("Base prompt")], options);
        mw.invoke(ctx2, &inner, &CancelToken::none()).await.unwrap();
        let (seen2, seen_options2) = inner.last_request.lock().unwrap().clone().unwrap();
        assert!(!seen2[0].as_text().unwrap().contains("# Tool Calls"));
        assert!(seen_options2.functions.is_some());
    }

    #[tokio::test]
    async fn missing_system_message_gets_inserted() {
        let inner = ScriptedAgent::new(vec![vec![Message::text("ok")]]);
        let mw = middleware();
        let ctx = InvocationContext::new(vec![Message::user("hi")], GenerateOptions::default());
        mw.invoke(ctx, &inner, &CancelToken::none()).await.unwrap();
        let (seen, _) = inner.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen[0].role, Role::System);
        assert!(seen[0].as_text().unwrap().contains("# Tool Calls"));
        assert_eq!(seen[1].role, Role::User);
    }

    // ── Non-streaming parsing ─────────────────────────────────────────────────

    #[tokio::test]
    async fn non_streaming_reply_is_parsed_in_order() {
        let inner = ScriptedAgent::new(vec![vec![Message::text(
            "Intro <tool_call name=\"add\">{\"a\":1,\"b\":2}</tool_call> outro",
        )]]);
        let mw = middleware();
        let ctx = InvocationContext::new(vec![Message::user("go")], GenerateOptions::default());
        let out = mw.invoke(ctx, &inner, &CancelToken::none()).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_text(), Some("Intro "));
        assert!(matches!(out[0].body, MessageBody::Text { .. }));
        assert!(out[1].tool_calls_slice().is_some());
        assert_eq!(out[2].as_text(), Some(" outro"));
    }
}
