// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Roles ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Visibility of a reasoning block.
///
/// `Plain` reasoning may be shown to the end user; `Hidden` reasoning is
/// chain-of-thought the provider asked to keep out of user-facing output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningVisibility {
    #[default]
    Plain,
    Hidden,
}

// ─── Tool-call payloads ───────────────────────────────────────────────────────

/// A single, complete tool invocation requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function_name: String,
    /// JSON-encoded argument object.
    pub function_args: String,
    /// Parallel-tool-call slot index assigned by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Position of this call within the plural message that carried it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_idx: Option<u32>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            function_name: name.into(),
            function_args: args.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }
}

/// A partial, streaming increment toward a complete tool call.
///
/// Field semantics: `function_args` is a *fragment* to append, not the full
/// argument text.  `function_name` / `tool_call_id` are usually only present
/// on the first delta of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default)]
    pub function_args: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_idx: Option<u32>,
    /// JSON-path level mutations derived from this fragment, filled in by the
    /// fragment-update middleware.  Empty unless that middleware ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_fragment_updates: Vec<JsonFragmentUpdate>,
}

impl ToolCallUpdate {
    pub fn fragment(args: impl Into<String>) -> Self {
        Self {
            function_args: args.into(),
            ..Self::default()
        }
    }

    pub fn opening(
        id: impl Into<String>,
        name: impl Into<String>,
        index: u32,
    ) -> Self {
        Self {
            function_name: Some(name.into()),
            tool_call_id: Some(id.into()),
            index: Some(index),
            ..Self::default()
        }
    }

    /// The identity string used to decide whether two updates belong to the
    /// same in-flight tool call: id wins, then index, then `"unknown"`.
    pub fn identity(&self) -> String {
        if let Some(id) = &self.tool_call_id {
            return id.clone();
        }
        if let Some(idx) = self.index {
            return idx.to_string();
        }
        "unknown".to_string()
    }
}

/// A JSON-path-level mutation observed while scanning streamed tool-call
/// arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonFragmentUpdate {
    /// Dotted path from the argument root, e.g. `"location.city"` or
    /// `"items[2].name"`.  Empty string for the root value itself.
    pub path: String,
    pub kind: JsonFragmentKind,
    /// Payload for value-bearing kinds: the appended text for
    /// `PartialString`, the full literal for `CompleteValue`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonFragmentKind {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    /// A chunk of a string value that is still being streamed.
    PartialString,
    /// A scalar (string, number, bool, null) that is now complete.
    CompleteValue,
}

/// A single content block inside a tool result (text or image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { image_data: String },
}

/// The outcome of executing one tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_blocks: Option<Vec<ContentBlock>>,
}

impl ToolCallResult {
    pub fn new(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(id.into()),
            result: result.into(),
            content_blocks: None,
        }
    }
}

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Token accounting for one turn or one accumulated stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Provider-specific counters (cache reads, reasoning tokens, …).
    /// Numeric values are summed pairwise on merge; others keep the latest.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            extra: Map::new(),
        }
    }

    /// Fold `other` into `self`.  Token counts add; `extra` entries add when
    /// both sides are numbers, otherwise the incoming value wins.
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        for (k, v) in &other.extra {
            match (self.extra.get(k).and_then(Value::as_u64), v.as_u64()) {
                (Some(a), Some(b)) => {
                    self.extra.insert(k.clone(), Value::from(a + b));
                }
                _ => {
                    self.extra.insert(k.clone(), v.clone());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.total_tokens == 0
            && self.extra.is_empty()
    }
}

// ─── The message union ────────────────────────────────────────────────────────

/// Payload of a [`Message`].  Closed set; middleware matches exhaustively so
/// a new variant is a compile error everywhere it matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// A complete text chunk.
    Text { text: String },
    /// An incremental delta of a larger text message.
    TextUpdate {
        text: String,
        #[serde(default)]
        is_thinking: bool,
    },
    Reasoning {
        text: String,
        #[serde(default)]
        visibility: ReasoningVisibility,
    },
    ReasoningUpdate {
        text: String,
        #[serde(default)]
        visibility: ReasoningVisibility,
    },
    Image { image_data: String },
    /// Singular complete tool call.
    ToolCall(ToolCall),
    /// Plural complete tool calls, as the provider emitted them.
    ToolsCall { tool_calls: Vec<ToolCall> },
    /// Singular tool-call delta.
    ToolCallUpdate(ToolCallUpdate),
    /// Plural tool-call deltas.
    ToolsCallUpdate { tool_call_updates: Vec<ToolCallUpdate> },
    ToolCallResult(ToolCallResult),
    ToolsCallResult { results: Vec<ToolCallResult> },
    /// Paired view: every call matched with its result (by id, or by position
    /// when ids are absent).
    ToolsCallAggregate {
        calls: Vec<ToolCall>,
        results: Vec<ToolCallResult>,
    },
    /// Ordered bundle of singular messages sharing one `generation_id`.
    Composite { messages: Vec<Message> },
    Usage(Usage),
    /// System-role context injection carrying the current todo state.
    TodoContext { todo_context: String },
}

impl MessageBody {
    /// The serialized `type` discriminator for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::TextUpdate { .. } => "text_update",
            Self::Reasoning { .. } => "reasoning",
            Self::ReasoningUpdate { .. } => "reasoning_update",
            Self::Image { .. } => "image",
            Self::ToolCall(_) => "tool_call",
            Self::ToolsCall { .. } => "tools_call",
            Self::ToolCallUpdate(_) => "tool_call_update",
            Self::ToolsCallUpdate { .. } => "tools_call_update",
            Self::ToolCallResult(_) => "tool_call_result",
            Self::ToolsCallResult { .. } => "tools_call_result",
            Self::ToolsCallAggregate { .. } => "tools_call_aggregate",
            Self::Composite { .. } => "composite",
            Self::Usage(_) => "usage",
            Self::TodoContext { .. } => "todo_context",
        }
    }
}

/// A single message flowing through the pipeline.
///
/// The envelope carries correlation and ordering fields shared by every
/// variant; `body` is the tagged payload.  Messages are immutable values —
/// middleware produces new ones rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_order_idx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_idx: Option<u32>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn new(role: Role, body: MessageBody) -> Self {
        Self {
            role,
            from_agent: None,
            generation_id: None,
            thread_id: None,
            run_id: None,
            parent_run_id: None,
            metadata: None,
            message_order_idx: None,
            chunk_idx: None,
            body,
        }
    }

    // ── Constructors ──────────────────────────────────────────────────────────

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageBody::Text { text: text.into() })
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageBody::Text { text: text.into() })
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, MessageBody::Text { text: text.into() })
    }

    pub fn text_update(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::TextUpdate {
                text: text.into(),
                is_thinking: false,
            },
        )
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::Reasoning {
                text: text.into(),
                visibility: ReasoningVisibility::Plain,
            },
        )
    }

    pub fn reasoning_update(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::ReasoningUpdate {
                text: text.into(),
                visibility: ReasoningVisibility::Plain,
            },
        )
    }

    pub fn image(image_data: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::Image {
                image_data: image_data.into(),
            },
        )
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::new(Role::Assistant, MessageBody::ToolsCall { tool_calls: calls })
    }

    pub fn tool_call_updates(updates: Vec<ToolCallUpdate>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::ToolsCallUpdate {
                tool_call_updates: updates,
            },
        )
    }

    pub fn tool_results(results: Vec<ToolCallResult>) -> Self {
        Self::new(Role::Tool, MessageBody::ToolsCallResult { results })
    }

    pub fn aggregate(calls: Vec<ToolCall>, results: Vec<ToolCallResult>) -> Self {
        Self::new(
            Role::Assistant,
            MessageBody::ToolsCallAggregate { calls, results },
        )
    }

    pub fn composite(messages: Vec<Message>) -> Self {
        Self::new(Role::Assistant, MessageBody::Composite { messages })
    }

    pub fn usage(usage: Usage) -> Self {
        Self::new(Role::Assistant, MessageBody::Usage(usage))
    }

    pub fn todo_context(text: impl Into<String>) -> Self {
        Self::new(
            Role::System,
            MessageBody::TodoContext {
                todo_context: text.into(),
            },
        )
    }

    // ── Envelope setters (builder style) ──────────────────────────────────────

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_from_agent(mut self, from_agent: impl Into<String>) -> Self {
        self.from_agent = Some(from_agent.into());
        self
    }

    pub fn with_generation_id(mut self, id: impl Into<String>) -> Self {
        self.generation_id = Some(id.into());
        self
    }

    pub fn with_thread_id(mut self, id: impl Into<String>) -> Self {
        self.thread_id = Some(id.into());
        self
    }

    pub fn with_run_id(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.message_order_idx = Some(order);
        self
    }

    pub fn with_chunk(mut self, chunk: u32) -> Self {
        self.chunk_idx = Some(chunk);
        self
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Copy the correlation fields (`generation_id`, `thread_id`, `run_id`,
    /// `parent_run_id`, `from_agent`) from `other` onto `self`.
    ///
    /// Ordering fields are intentionally NOT copied: they describe a position
    /// in a stream and must be assigned by the ordering middleware.
    pub fn with_header_from(mut self, other: &Message) -> Self {
        self.generation_id = other.generation_id.clone();
        self.thread_id = other.thread_id.clone();
        self.run_id = other.run_id.clone();
        self.parent_run_id = other.parent_run_id.clone();
        self.from_agent = other.from_agent.clone();
        self
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// Text payload for `Text` / `TextUpdate` bodies.
    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { text } | MessageBody::TextUpdate { text, .. } => Some(text),
            _ => None,
        }
    }

    /// The plural tool calls carried by a `ToolsCall` body.
    pub fn tool_calls_slice(&self) -> Option<&[ToolCall]> {
        match &self.body {
            MessageBody::ToolsCall { tool_calls } => Some(tool_calls),
            _ => None,
        }
    }

    pub fn is_update(&self) -> bool {
        matches!(
            self.body,
            MessageBody::TextUpdate { .. }
                | MessageBody::ReasoningUpdate { .. }
                | MessageBody::ToolCallUpdate(_)
                | MessageBody::ToolsCallUpdate { .. }
        )
    }

    /// True for a `TextUpdate` whose text is empty (candidate for dropping
    /// after usage extraction).
    pub fn is_empty_text_update(&self) -> bool {
        matches!(&self.body, MessageBody::TextUpdate { text, .. } if text.is_empty())
    }

    /// Remove a `"usage"` entry from metadata and decode it.
    ///
    /// Providers sometimes piggyback usage on an otherwise-empty text delta;
    /// the joiner and function-call middleware extract it here before
    /// dropping the carrier message.
    pub fn take_usage_metadata(&mut self) -> Option<Usage> {
        let meta = self.metadata.as_mut()?;
        let raw = meta.remove("usage")?;
        if meta.is_empty() {
            self.metadata = None;
        }
        serde_json::from_value(raw).ok()
    }
}

// ─── Aggregate pairing check ──────────────────────────────────────────────────

/// Verify the aggregate invariant: every call in `calls` has a result — by
/// `tool_call_id` when ids are present, by position otherwise.
pub fn aggregate_is_paired(calls: &[ToolCall], results: &[ToolCallResult]) -> bool {
    calls.iter().enumerate().all(|(i, call)| match &call.tool_call_id {
        Some(id) => results
            .iter()
            .any(|r| r.tool_call_id.as_deref() == Some(id.as_str())),
        None => i < results.len(),
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_constructor_sets_role_and_payload() {
        let m = Message::text("hello");
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn user_and_system_constructors() {
        assert_eq!(Message::user("q").role, Role::User);
        assert_eq!(Message::system("s").role, Role::System);
    }

    #[test]
    fn tool_results_constructor_uses_tool_role() {
        let m = Message::tool_results(vec![ToolCallResult::new("t1", "ok")]);
        assert_eq!(m.role, Role::Tool);
    }

    #[test]
    fn header_copy_preserves_correlation_not_ordering() {
        let src = Message::text("a")
            .with_generation_id("g1")
            .with_thread_id("th")
            .with_order(7)
            .with_chunk(3);
        let dst = Message::text("b").with_header_from(&src);
        assert_eq!(dst.generation_id.as_deref(), Some("g1"));
        assert_eq!(dst.thread_id.as_deref(), Some("th"));
        assert!(dst.message_order_idx.is_none());
        assert!(dst.chunk_idx.is_none());
    }

    #[test]
    fn serializes_with_type_discriminator() {
        let m = Message::text("hi").with_generation_id("g");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["generation_id"], "g");
        assert_eq!(json["role"], "assistant");
    }

    #[test]
    fn round_trips_through_json() {
        let m = Message::tool_calls(vec![
            ToolCall::new("add", r#"{"a":1}"#).with_id("t1").with_index(0)
        ])
        .with_generation_id("g")
        .with_order(2);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn tool_call_update_round_trip_keeps_fragments() {
        let mut u = ToolCallUpdate::opening("t1", "add", 0);
        u.json_fragment_updates.push(JsonFragmentUpdate {
            path: "a".into(),
            kind: JsonFragmentKind::CompleteValue,
            value: Some("1".into()),
        });
        let m = Message::tool_call_updates(vec![u.clone()]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back.body {
            MessageBody::ToolsCallUpdate { tool_call_updates } => {
                assert_eq!(tool_call_updates, vec![u]);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn update_identity_prefers_id_then_index() {
        let by_id = ToolCallUpdate {
            tool_call_id: Some("abc".into()),
            index: Some(4),
            ..Default::default()
        };
        assert_eq!(by_id.identity(), "abc");
        let by_index = ToolCallUpdate {
            index: Some(4),
            ..Default::default()
        };
        assert_eq!(by_index.identity(), "4");
        assert_eq!(ToolCallUpdate::default().identity(), "unknown");
    }

    #[test]
    fn usage_merge_sums_counts_and_numeric_extras() {
        let mut a = Usage::new(10, 5);
        a.extra.insert("cache_read".into(), Value::from(3u64));
        let mut b = Usage::new(1, 2);
        b.extra.insert("cache_read".into(), Value::from(4u64));
        b.extra.insert("model".into(), Value::from("m1"));
        a.merge(&b);
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 7);
        assert_eq!(a.total_tokens, 18);
        assert_eq!(a.extra["cache_read"], Value::from(7u64));
        assert_eq!(a.extra["model"], Value::from("m1"));
    }

    #[test]
    fn take_usage_metadata_extracts_and_clears() {
        let mut m = Message::text_update("").with_metadata_entry(
            "usage",
            serde_json::json!({"input_tokens": 3, "output_tokens": 4, "total_tokens": 7}),
        );
        assert!(m.is_empty_text_update());
        let usage = m.take_usage_metadata().expect("usage present");
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.total_tokens, 7);
        assert!(m.metadata.is_none(), "empty metadata map is dropped");
        assert!(m.take_usage_metadata().is_none());
    }

    #[test]
    fn aggregate_pairing_by_id() {
        let calls = vec![
            ToolCall::new("a", "{}").with_id("t1"),
            ToolCall::new("b", "{}").with_id("t2"),
        ];
        let results = vec![
            ToolCallResult::new("t2", "r2"),
            ToolCallResult::new("t1", "r1"),
        ];
        assert!(aggregate_is_paired(&calls, &results));
        assert!(!aggregate_is_paired(&calls, &results[..1].to_vec()));
    }

    #[test]
    fn aggregate_pairing_positional_without_ids() {
        let calls = vec![ToolCall::new("a", "{}"), ToolCall::new("b", "{}")];
        let one = vec![ToolCallResult {
            tool_call_id: None,
            result: "r".into(),
            content_blocks: None,
        }];
        assert!(!aggregate_is_paired(&calls, &one));
        let two = vec![one[0].clone(), one[0].clone()];
        assert!(aggregate_is_paired(&calls, &two));
    }

    #[test]
    fn empty_optionals_are_omitted_from_json() {
        let json = serde_json::to_string(&Message::text("x")).unwrap();
        assert!(!json.contains("generation_id"));
        assert!(!json.contains("metadata"));
        assert!(!json.contains("chunk_idx"));
    }

    #[test]
    fn content_block_tagging() {
        let b = ContentBlock::Image {
            image_data: "data:image/png;base64,AA".into(),
        };
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["type"], "image");
    }
}
