// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message update joiner: coalesces per-chunk update messages into completed
//! messages while still passing the raw updates through to the consumer.
//!
//! A single active builder is tracked at a time.  A message of a different
//! variant — or a tool-call update with a different identity than the
//! current builder's — finalizes the builder before the new message is
//! processed.  Usage is accumulated separately and appended once at stream
//! end.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;

use strom_agent::{
    Agent, CancelToken, InvocationContext, MessageStream, Middleware, Result, StreamingAgent,
    StreamingMiddleware,
};
use strom_message::{
    Message, MessageBody, ReasoningBuilder, TextBuilder, ToolCallBuilder, ToolsCallBuilder,
    UsageAccumulator,
};

pub struct UpdateJoinerMiddleware;

impl UpdateJoinerMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UpdateJoinerMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for UpdateJoinerMiddleware {
    fn name(&self) -> &str {
        "update_joiner"
    }

    /// Non-streaming replies are already complete; forward unchanged.
    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        inner.generate(&ctx.messages, &ctx.options, cancel).await
    }
}

#[async_trait]
impl StreamingMiddleware for UpdateJoinerMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let stream = inner
            .generate_stream(&ctx.messages, &ctx.options, cancel)
            .await?;
        Ok(join_stream(stream))
    }
}

// ─── Joining state machine ────────────────────────────────────────────────────

enum ActiveBuilder {
    Idle,
    Text(TextBuilder),
    Reasoning(ReasoningBuilder),
    ToolCall(ToolCallBuilder),
    ToolsCall(ToolsCallBuilder),
}

struct JoinState {
    inner: MessageStream,
    builder: ActiveBuilder,
    usage: UsageAccumulator,
    /// Envelope template for the final usage summary.
    last_seen: Option<Message>,
    queue: VecDeque<Message>,
    done: bool,
}

/// Wrap `inner` with the joining state machine.
pub fn join_stream(inner: MessageStream) -> MessageStream {
    let state = JoinState {
        inner,
        builder: ActiveBuilder::Idle,
        usage: UsageAccumulator::new(),
        last_seen: None,
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
                Some(Ok(msg)) => s.process(msg),
                Some(Err(e)) => return Some((Err(e), s)),
                None => {
                    s.done = true;
                    s.flush_builder();
                    let template = s.last_seen.take();
                    if let Some(summary) =
                        std::mem::take(&mut s.usage).finalize(template.as_ref())
                    {
                        s.queue.push_back(summary);
                    }
                }
            }
        }
    }))
}

impl JoinState {
    fn process(&mut self, mut msg: Message) {
        self.last_seen = Some(msg.clone());

        // Empty text updates are dropped once any usage metadata they carry
        // has been extracted.
        if msg.is_empty_text_update() {
            if let Some(u) = msg.take_usage_metadata() {
                self.usage.add(&u);
            }
            return;
        }

        // Usage bodies are absorbed into the end-of-stream summary.
        if let MessageBody::Usage(u) = &msg.body {
            let u = u.clone();
            self.flush_builder();
            self.usage.add(&u);
            return;
        }

        match &msg.body {
            MessageBody::TextUpdate { .. } => {
                match &mut self.builder {
                    ActiveBuilder::Text(b) => b.push(&msg),
                    _ => {
                        self.flush_builder();
                        self.builder = ActiveBuilder::Text(TextBuilder::new(&msg));
                    }
                }
                self.queue.push_back(msg);
            }
            MessageBody::ReasoningUpdate { .. } => {
                match &mut self.builder {
                    ActiveBuilder::Reasoning(b) => b.push(&msg),
                    _ => {
                        self.flush_builder();
                        self.builder = ActiveBuilder::Reasoning(ReasoningBuilder::new(&msg));
                    }
                }
                self.queue.push_back(msg);
            }
            MessageBody::ToolCallUpdate(update) => {
                let update = update.clone();
                match &mut self.builder {
                    ActiveBuilder::ToolCall(b) if b.accepts(&update) => b.merge(&update),
                    _ => {
                        self.flush_builder();
                        self.builder =
                            ActiveBuilder::ToolCall(ToolCallBuilder::new(&msg, &update));
                    }
                }
                self.queue.push_back(msg);
            }
            MessageBody::ToolsCallUpdate { .. } => {
                match &mut self.builder {
                    ActiveBuilder::ToolsCall(b) => b.add_message(&msg),
                    _ => {
                        self.flush_builder();
                        let mut b = ToolsCallBuilder::new();
                        b.add_message(&msg);
                        self.builder = ActiveBuilder::ToolsCall(b);
                    }
                }
                self.queue.push_back(msg);
            }
            _ => {
                // Completed variant: close out whatever was accumulating,
                // then forward.
                self.flush_builder();
                self.queue.push_back(msg);
            }
        }
    }

    /// Finalize the active builder, queueing its completed message.
    fn flush_builder(&mut self) {
        match std::mem::replace(&mut self.builder, ActiveBuilder::Idle) {
            ActiveBuilder::Idle => {}
            ActiveBuilder::Text(b) => self.queue.push_back(b.finalize()),
            ActiveBuilder::Reasoning(b) => self.queue.push_back(b.finalize()),
            ActiveBuilder::ToolCall(b) => self.queue.push_back(b.finalize()),
            ActiveBuilder::ToolsCall(b) => {
                if let Some(m) = b.finalize() {
                    self.queue.push_back(m);
                }
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strom_agent::stream_from_messages;
    use strom_message::{ToolCallUpdate, Usage};

    async fn run(messages: Vec<Message>) -> Vec<Message> {
        let joined = join_stream(stream_from_messages(messages));
        joined.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn text_updates_pass_through_and_join() {
        let out = run(vec![
            Message::text_update("Hel").with_generation_id("g"),
            Message::text_update("lo").with_generation_id("g"),
        ])
        .await;
        // Two raw updates, then one completed Text.
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0].body, MessageBody::TextUpdate { .. }));
        assert!(matches!(out[1].body, MessageBody::TextUpdate { .. }));
        assert_eq!(out[2].as_text(), Some("Hello"));
        assert!(matches!(out[2].body, MessageBody::Text { .. }));
    }

    #[tokio::test]
    async fn variant_switch_finalizes_previous_builder() {
        let out = run(vec![
            Message::text_update("abc"),
            Message::reasoning_update("think"),
        ])
        .await;
        // update, completed Text (flushed by the variant switch), update,
        // completed Reasoning (flushed at end of stream).
        assert_eq!(out.len(), 4);
        assert!(matches!(out[0].body, MessageBody::TextUpdate { .. }));
        assert_eq!(out[1].as_text(), Some("abc"));
        assert!(matches!(out[2].body, MessageBody::ReasoningUpdate { .. }));
        match &out[3].body {
            MessageBody::Reasoning { text, .. } => assert_eq!(text, "think"),
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_message_between_runs_flushes() {
        let out = run(vec![
            Message::text_update("a"),
            Message::text("standalone"),
            Message::text_update("b"),
        ])
        .await;
        let kinds: Vec<&str> = out.iter().map(|m| m.body.kind()).collect();
        assert_eq!(
            kinds,
            vec!["text_update", "text", "text", "text_update", "text"]
        );
        assert_eq!(out[1].as_text(), Some("a"), "first run joined");
        assert_eq!(out[2].as_text(), Some("standalone"));
        assert_eq!(out[4].as_text(), Some("b"), "second run joined at end");
    }

    #[tokio::test]
    async fn singular_tool_call_updates_join_per_identity() {
        let m1 = Message::new(
            strom_message::Role::Assistant,
            MessageBody::ToolCallUpdate(ToolCallUpdate::opening("t1", "add", 0)),
        );
        let m2 = Message::new(
            strom_message::Role::Assistant,
            MessageBody::ToolCallUpdate(ToolCallUpdate {
                tool_call_id: Some("t1".into()),
                function_args: r#"{"a":1}"#.into(),
                ..Default::default()
            }),
        );
        let m3 = Message::new(
            strom_message::Role::Assistant,
            MessageBody::ToolCallUpdate(ToolCallUpdate::opening("t2", "mul", 1)),
        );
        let out = run(vec![m1, m2, m3]).await;
        // u1, u2, completed(t1) [identity switch], u3, completed(t2) [eos]
        assert_eq!(out.len(), 5);
        match &out[2].body {
            MessageBody::ToolCall(c) => {
                assert_eq!(c.tool_call_id.as_deref(), Some("t1"));
                assert_eq!(c.function_args, r#"{"a":1}"#);
            }
            other => panic!("expected completed tool call, got {other:?}"),
        }
        match &out[4].body {
            MessageBody::ToolCall(c) => assert_eq!(c.tool_call_id.as_deref(), Some("t2")),
            other => panic!("expected completed tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plural_updates_join_into_tools_call() {
        let u1 = Message::tool_call_updates(vec![ToolCallUpdate::opening("t1", "add", 0)]);
        let u2 = Message::tool_call_updates(vec![ToolCallUpdate {
            index: Some(0),
            function_args: "{}".into(),
            ..Default::default()
        }]);
        let out = run(vec![u1, u2]).await;
        assert_eq!(out.len(), 3);
        let calls = out[2].tool_calls_slice().expect("completed plural");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "add");
        assert_eq!(calls[0].function_args, "{}");
    }

    #[tokio::test]
    async fn usage_messages_are_summarized_at_end() {
        let out = run(vec![
            Message::usage(Usage::new(1, 2)),
            Message::text_update("x"),
            Message::usage(Usage::new(3, 4)),
        ])
        .await;
        // update, completed text, single summary usage
        let kinds: Vec<&str> = out.iter().map(|m| m.body.kind()).collect();
        assert_eq!(kinds, vec!["text_update", "text", "usage"]);
        match &out[2].body {
            MessageBody::Usage(u) => {
                assert_eq!(u.input_tokens, 4);
                assert_eq!(u.output_tokens, 6);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_text_update_with_usage_is_dropped_but_counted() {
        let carrier = Message::text_update("").with_metadata_entry(
            "usage",
            serde_json::json!({"input_tokens": 5, "output_tokens": 5, "total_tokens": 10}),
        );
        let out = run(vec![Message::text_update("hi"), carrier]).await;
        let kinds: Vec<&str> = out.iter().map(|m| m.body.kind()).collect();
        assert_eq!(kinds, vec!["text_update", "text", "usage"]);
        match &out[2].body {
            MessageBody::Usage(u) => assert_eq!(u.total_tokens, 10),
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_empty_text_update_is_dropped() {
        let out = run(vec![Message::text_update("")]).await;
        assert!(out.is_empty());
    }
}
