// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Mutable accumulators that turn streams of update messages into completed
//! messages.
//!
//! Each builder is owned exclusively by the middleware driving one stream,
//! emits a completed [`Message`] on finalize, and is then dropped.  The
//! soundness contract: concatenating the payloads of all updates fed to a
//! builder equals the payload of the finalized message.

use crate::types::{
    Message, MessageBody, ReasoningVisibility, ToolCall, ToolCallUpdate, Usage,
};

/// Strip the per-chunk index from a template envelope; the completed message
/// describes the whole run, not one chunk.
fn completed_envelope(template: &Message) -> Message {
    let mut m = template.clone();
    m.chunk_idx = None;
    m
}

// ─── Text / reasoning ─────────────────────────────────────────────────────────

/// Accumulates `TextUpdate` deltas into one completed `Text` message.
pub struct TextBuilder {
    template: Message,
    text: String,
}

impl TextBuilder {
    /// Start from the first update of a run.  The update's envelope becomes
    /// the template for the completed message.
    pub fn new(first: &Message) -> Self {
        let mut b = Self {
            template: first.clone(),
            text: String::new(),
        };
        b.push(first);
        b
    }

    pub fn push(&mut self, update: &Message) {
        if let MessageBody::TextUpdate { text, .. } = &update.body {
            self.text.push_str(text);
        }
    }

    pub fn finalize(self) -> Message {
        let mut m = completed_envelope(&self.template);
        m.body = MessageBody::Text { text: self.text };
        m
    }
}

/// Accumulates `ReasoningUpdate` deltas into one completed `Reasoning`
/// message.  The visibility of the first update wins.
pub struct ReasoningBuilder {
    template: Message,
    text: String,
    visibility: ReasoningVisibility,
}

impl ReasoningBuilder {
    pub fn new(first: &Message) -> Self {
        let visibility = match &first.body {
            MessageBody::ReasoningUpdate { visibility, .. } => *visibility,
            _ => ReasoningVisibility::Plain,
        };
        let mut b = Self {
            template: first.clone(),
            text: String::new(),
            visibility,
        };
        b.push(first);
        b
    }

    pub fn push(&mut self, update: &Message) {
        if let MessageBody::ReasoningUpdate { text, .. } = &update.body {
            self.text.push_str(text);
        }
    }

    pub fn finalize(self) -> Message {
        let mut m = completed_envelope(&self.template);
        m.body = MessageBody::Reasoning {
            text: self.text,
            visibility: self.visibility,
        };
        m
    }
}

// ─── Tool calls ───────────────────────────────────────────────────────────────

/// Accumulates the deltas of a *single* tool call.
pub struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    args: String,
    index: Option<u32>,
    identity: String,
    template: Message,
}

impl ToolCallBuilder {
    /// Start from the first singular `ToolCallUpdate` message of a run.
    pub fn new(first: &Message, update: &ToolCallUpdate) -> Self {
        let mut b = Self {
            id: None,
            name: None,
            args: String::new(),
            index: None,
            identity: update.identity(),
            template: first.clone(),
        };
        b.merge(update);
        b
    }

    /// True when `update` belongs to the same in-flight call.
    pub fn accepts(&self, update: &ToolCallUpdate) -> bool {
        self.identity == update.identity()
    }

    pub fn merge(&mut self, update: &ToolCallUpdate) {
        if let Some(name) = &update.function_name {
            if !name.is_empty() {
                self.name = Some(name.clone());
            }
        }
        if let Some(id) = &update.tool_call_id {
            if !id.is_empty() {
                self.id = Some(id.clone());
            }
        }
        if update.index.is_some() {
            self.index = update.index;
        }
        self.args.push_str(&update.function_args);
    }

    pub fn build_call(&self) -> ToolCall {
        ToolCall {
            function_name: self.name.clone().unwrap_or_default(),
            function_args: self.args.clone(),
            index: self.index,
            tool_call_id: self.id.clone(),
            tool_call_idx: None,
        }
    }

    pub fn finalize(self) -> Message {
        let call = self.build_call();
        let mut m = completed_envelope(&self.template);
        m.body = MessageBody::ToolCall(call);
        m
    }
}

/// Callback invoked when a tool call inside a [`ToolsCallBuilder`] becomes
/// complete enough to act on (its id is known and its argument stream has
/// moved on to the next call or the builder is finalizing).
pub type CallReadyFn = Box<dyn FnMut(ToolCall) + Send>;

struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    args: String,
    index: Option<u32>,
    fired: bool,
}

impl PendingCall {
    fn as_call(&self, position: u32) -> ToolCall {
        ToolCall {
            function_name: self.name.clone().unwrap_or_default(),
            function_args: self.args.clone(),
            index: self.index,
            tool_call_id: self.id.clone(),
            tool_call_idx: Some(position),
        }
    }
}

/// Accumulates plural `ToolsCallUpdate` deltas into one completed
/// `ToolsCall` message, firing [`CallReadyFn`] for each call as it completes
/// so callers can start executing it while later calls are still streaming.
///
/// A call is considered complete when a delta arrives for a *different*
/// call (providers stream one call's arguments contiguously) or when the
/// builder finalizes.  Calls without an id never fire; the aggregation layer
/// executes those synchronously at finalize time.
pub struct ToolsCallBuilder {
    entries: Vec<PendingCall>,
    on_call_ready: Option<CallReadyFn>,
    template: Option<Message>,
}

impl ToolsCallBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            on_call_ready: None,
            template: None,
        }
    }

    pub fn with_call_ready(mut self, f: CallReadyFn) -> Self {
        self.on_call_ready = Some(f);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feed one update message (plural or singular) into the builder.
    pub fn add_message(&mut self, message: &Message) {
        if self.template.is_none() {
            self.template = Some(message.clone());
        }
        match &message.body {
            MessageBody::ToolsCallUpdate { tool_call_updates } => {
                for u in tool_call_updates {
                    self.add(u);
                }
            }
            MessageBody::ToolCallUpdate(u) => self.add(u),
            _ => {}
        }
    }

    pub fn add(&mut self, update: &ToolCallUpdate) {
        let slot = self.route(update);
        let e = &mut self.entries[slot];
        if let Some(name) = &update.function_name {
            if !name.is_empty() {
                e.name = Some(name.clone());
            }
        }
        if let Some(id) = &update.tool_call_id {
            if !id.is_empty() {
                e.id = Some(id.clone());
            }
        }
        if update.index.is_some() {
            e.index = update.index;
        }
        e.args.push_str(&update.function_args);
    }

    /// Find (or create) the entry this update belongs to.  Creating a new
    /// entry means every earlier entry's argument stream is done, so they
    /// fire their ready callback.
    fn route(&mut self, update: &ToolCallUpdate) -> usize {
        if let Some(id) = &update.tool_call_id {
            if let Some(i) = self
                .entries
                .iter()
                .position(|e| e.id.as_deref() == Some(id.as_str()))
            {
                return i;
            }
        } else if let Some(idx) = update.index {
            if let Some(i) = self.entries.iter().position(|e| e.index == Some(idx)) {
                return i;
            }
        } else if !self.entries.is_empty() {
            // Anonymous continuation fragment: belongs to the latest call.
            return self.entries.len() - 1;
        }

        self.fire_ready_up_to(self.entries.len());
        self.entries.push(PendingCall {
            id: None,
            name: None,
            args: String::new(),
            index: update.index,
            fired: false,
        });
        self.entries.len() - 1
    }

    fn fire_ready_up_to(&mut self, end: usize) {
        let Some(cb) = self.on_call_ready.as_mut() else {
            return;
        };
        for (pos, e) in self.entries[..end].iter_mut().enumerate() {
            if !e.fired && e.id.is_some() {
                e.fired = true;
                cb(e.as_call(pos as u32));
            }
        }
    }

    /// Finalize: fire any remaining ready callbacks and emit the completed
    /// plural message.  Returns `None` when no updates were ever added.
    pub fn finalize(mut self) -> Option<Message> {
        if self.entries.is_empty() {
            return None;
        }
        self.fire_ready_up_to(self.entries.len());
        let calls: Vec<ToolCall> = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| e.as_call(pos as u32))
            .collect();
        let mut m = self
            .template
            .map(|t| completed_envelope(&t))
            .unwrap_or_else(|| Message::tool_calls(vec![]));
        m.body = MessageBody::ToolsCall { tool_calls: calls };
        Some(m)
    }
}

impl Default for ToolsCallBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Accumulates usage from explicit `Usage` messages and from usage metadata
/// carried on other messages; summarized once at stream end.
#[derive(Default)]
pub struct UsageAccumulator {
    usage: Usage,
    seen: bool,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, usage: &Usage) {
        self.usage.merge(usage);
        self.seen = true;
    }

    /// Pull usage out of a message if it carries any: a `Usage` body is
    /// consumed whole, and a `"usage"` metadata entry is extracted from any
    /// other variant.  Returns true when the message *was* a `Usage` body
    /// (meaning the caller should not forward it).
    pub fn absorb(&mut self, message: &mut Message) -> bool {
        if let MessageBody::Usage(u) = &message.body {
            let u = u.clone();
            self.add(&u);
            return true;
        }
        if let Some(u) = message.take_usage_metadata() {
            self.add(&u);
        }
        false
    }

    pub fn has_usage(&self) -> bool {
        self.seen
    }

    /// Emit the summary message, carrying the correlation header of
    /// `template` when one is given.
    pub fn finalize(self, template: Option<&Message>) -> Option<Message> {
        if !self.seen {
            return None;
        }
        let mut m = Message::usage(self.usage);
        if let Some(t) = template {
            m = m.with_header_from(t);
        }
        Some(m)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
