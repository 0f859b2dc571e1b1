// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message transformation: the bidirectional bridge between the provider
//! view (plural aggregates) and the application view (ordered singulars).
//!
//! Upstream (request), singular tool calls and results are reassembled into
//! plural messages, aggregates, and composites.  Downstream (reply), plural
//! messages are expanded into singulars and every message receives a dense
//! `message_order_idx` (and `chunk_idx` for updates) per generation.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures::StreamExt;

use strom_agent::{
    Agent, CancelToken, InvocationContext, MessageStream, Middleware, PipelineError, Result,
    StreamingAgent, StreamingMiddleware,
};
use strom_message::{Message, MessageBody};

pub struct MessageTransformMiddleware;

impl MessageTransformMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MessageTransformMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for MessageTransformMiddleware {
    fn name(&self) -> &str {
        "message_transform"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let upstream = reconstruct_aggregates(ctx.messages);
        let replies = inner.generate(&upstream, &ctx.options, cancel).await?;
        let mut indexer = OrderIndexer::new();
        let mut out = Vec::with_capacity(replies.len());
        for m in replies {
            out.extend(indexer.process(m)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamingMiddleware for MessageTransformMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let upstream = reconstruct_aggregates(ctx.messages);
        let stream = inner
            .generate_stream(&upstream, &ctx.options, cancel)
            .await?;
        Ok(index_stream(stream))
    }
}

// ─── Downstream: ordering assignment ──────────────────────────────────────────

#[derive(Default)]
struct GenState {
    next_order: u32,
    current_order: u32,
    next_chunk: u32,
    current_identity: Option<String>,
}

/// Assigns dense `message_order_idx` / `chunk_idx` per generation and
/// expands plural messages into singulars.
pub struct OrderIndexer {
    generations: HashMap<Option<String>, GenState>,
}

impl OrderIndexer {
    pub fn new() -> Self {
        Self {
            generations: HashMap::new(),
        }
    }

    /// Transform one provider message into its indexed singular form(s).
    pub fn process(&mut self, message: Message) -> Result<Vec<Message>> {
        let state = self
            .generations
            .entry(message.generation_id.clone())
            .or_default();

        let out = match message.body {
            MessageBody::Composite { .. } => {
                return Err(PipelineError::InvariantViolated(
                    "composite message in downstream path".into(),
                ));
            }
            MessageBody::ToolsCallAggregate { .. } => {
                return Err(PipelineError::InvariantViolated(
                    "aggregate message in downstream path".into(),
                ));
            }

            // Plural variants expand; each element gets its own order index.
            MessageBody::ToolsCall { ref tool_calls } => {
                let calls = tool_calls.clone();
                let template = message.clone();
                calls
                    .into_iter()
                    .map(|c| {
                        let mut m = template.clone();
                        m.body = MessageBody::ToolCall(c);
                        Self::stamp_completed(state, m)
                    })
                    .collect()
            }
            MessageBody::ToolsCallResult { ref results } => {
                let results = results.clone();
                let template = message.clone();
                results
                    .into_iter()
                    .map(|r| {
                        let mut m = template.clone();
                        m.body = MessageBody::ToolCallResult(r);
                        Self::stamp_completed(state, m)
                    })
                    .collect()
            }
            MessageBody::ToolsCallUpdate {
                ref tool_call_updates,
            } => {
                let updates = tool_call_updates.clone();
                let template = message.clone();
                updates
                    .into_iter()
                    .map(|u| {
                        let identity = format!("tool_call_update_{}", u.identity());
                        let mut m = template.clone();
                        m.body = MessageBody::ToolCallUpdate(u);
                        Self::stamp_update(state, m, identity)
                    })
                    .collect()
            }

            // Singular updates.
            MessageBody::TextUpdate { .. } => {
                vec![Self::stamp_update(state, message, "text_update".into())]
            }
            MessageBody::ReasoningUpdate { .. } => {
                vec![Self::stamp_update(state, message, "reasoning_update".into())]
            }
            MessageBody::ToolCallUpdate(ref u) => {
                let identity = format!("tool_call_update_{}", u.identity());
                vec![Self::stamp_update(state, message, identity)]
            }

            // Everything else is a completed singular variant.
            _ => vec![Self::stamp_completed(state, message)],
        };
        Ok(out)
    }

    fn stamp_completed(state: &mut GenState, mut m: Message) -> Message {
        m.message_order_idx = Some(state.next_order);
        m.chunk_idx = None;
        state.next_order += 1;
        state.next_chunk = 0;
        state.current_identity = None;
        m
    }

    fn stamp_update(state: &mut GenState, mut m: Message, identity: String) -> Message {
        if state.current_identity.as_deref() != Some(identity.as_str()) {
            state.current_identity = Some(identity);
            state.current_order = state.next_order;
            state.next_order += 1;
            state.next_chunk = 0;
        }
        m.message_order_idx = Some(state.current_order);
        m.chunk_idx = Some(state.next_chunk);
        state.next_chunk += 1;
        m
    }
}

impl Default for OrderIndexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply [`OrderIndexer`] lazily over a reply stream.  An invariant
/// violation surfaces as a single error, after which the stream ends.
pub fn index_stream(inner: MessageStream) -> MessageStream {
    struct State {
        inner: MessageStream,
        indexer: OrderIndexer,
        queue: VecDeque<Message>,
        done: bool,
    }
    let state = State {
        inner,
        indexer: OrderIndexer::new(),
        queue: VecDeque::new(),
        done: false,
    };
    Box::pin(futures::stream::unfold(state, |mut s| async move {
        loop {
            if let Some(m) = s.queue.pop_front() {
                return Some((Ok(m), s));
            }
            if s.done {
                return None;
            }
            match s.inner.next().await {
                None => return None,
                Some(Err(e)) => return Some((Err(e), s)),
                Some(Ok(msg)) => match s.indexer.process(msg) {
                    Ok(expanded) => s.queue.extend(expanded),
                    Err(e) => {
                        s.done = true;
                        return Some((Err(e), s));
                    }
                },
            }
        }
    }))
}

// ─── Upstream: aggregate reconstruction ───────────────────────────────────────

/// Rebuild the provider view of an ordered message list: consecutive
/// messages sharing a `generation_id` group together, singular tool calls
/// and results merge into plural messages, call/result pairs become
/// aggregates, and remaining multi-message groups collapse into composites.
pub fn reconstruct_aggregates(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    while let Some(first) = iter.next() {
        let gen = first.generation_id.clone();
        if gen.is_none() {
            out.push(first);
            continue;
        }
        let mut group = vec![first];
        while iter
            .peek()
            .is_some_and(|m| m.generation_id == gen)
        {
            group.push(iter.next().unwrap());
        }
        out.extend(process_group(group));
    }
    out
}

enum Slot {
    Message(Message),
    MergedCalls,
    MergedResults,
}

fn process_group(mut group: Vec<Message>) -> Vec<Message> {
    // Sort by order index; messages without one sort last, stably.
    group.sort_by_key(|m| m.message_order_idx.map(u64::from).unwrap_or(u64::MAX));

    let mut calls = Vec::new();
    let mut results = Vec::new();
    let mut calls_template: Option<Message> = None;
    let mut results_template: Option<Message> = None;
    let mut slots: Vec<Slot> = Vec::new();

    for m in group {
        match m.body {
            MessageBody::ToolCall(ref c) => {
                let c = c.clone();
                if calls_template.is_none() {
                    calls_template = Some(m);
                    slots.push(Slot::MergedCalls);
                }
                calls.push(c);
            }
            MessageBody::ToolCallResult(ref r) => {
                let r = r.clone();
                if results_template.is_none() {
                    results_template = Some(m);
                    slots.push(Slot::MergedResults);
                }
                results.push(r);
            }
            _ => slots.push(Slot::Message(m)),
        }
    }

    let mut rebuilt: Vec<Message> = slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Message(m) => m,
            Slot::MergedCalls => {
                let mut m = calls_template.clone().expect("template recorded");
                m.chunk_idx = None;
                m.body = MessageBody::ToolsCall {
                    tool_calls: std::mem::take(&mut calls),
                };
                m
            }
            Slot::MergedResults => {
                let mut m = results_template.clone().expect("template recorded");
                m.chunk_idx = None;
                m.body = MessageBody::ToolsCallResult {
                    results: std::mem::take(&mut results),
                };
                m
            }
        })
        .collect();

    // A lone ToolsCall followed by its ToolsCallResult pairs into an
    // aggregate.
    if rebuilt.len() == 2
        && matches!(rebuilt[0].body, MessageBody::ToolsCall { .. })
        && matches!(rebuilt[1].body, MessageBody::ToolsCallResult { .. })
    {
        let results_msg = rebuilt.pop().expect("two messages");
        let calls_msg = rebuilt.pop().expect("two messages");
        let calls = match calls_msg.body.clone() {
            MessageBody::ToolsCall { tool_calls } => tool_calls,
            _ => unreachable!(),
        };
        let results = match results_msg.body {
            MessageBody::ToolsCallResult { results } => results,
            _ => unreachable!(),
        };
        let mut aggregate = calls_msg;
        aggregate.message_order_idx = None;
        aggregate.body = MessageBody::ToolsCallAggregate { calls, results };
        return vec![aggregate];
    }

    if rebuilt.len() > 1 {
        let mut composite = Message::composite(rebuilt.clone()).with_header_from(&rebuilt[0]);
        composite.role = rebuilt[0].role;
        return vec![composite];
    }
    rebuilt
}

// ─── Tests ────────────────────────────────────────────────────────────────────
