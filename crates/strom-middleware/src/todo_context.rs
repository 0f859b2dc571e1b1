// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use strom_agent::{
    Agent, CancelToken, InvocationContext, MessageStream, Middleware, Result, StreamingAgent,
    StreamingMiddleware,
};
use strom_message::Message;

/// Appends a system-role todo-context message produced by a closure, when
/// the closure yields non-empty content.
pub struct TodoContextMiddleware {
    supplier: Box<dyn Fn() -> String + Send + Sync>,
}

impl TodoContextMiddleware {
    pub fn new(supplier: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            supplier: Box::new(supplier),
        }
    }

    fn extend(&self, ctx: &InvocationContext) -> Vec<Message> {
        let mut messages = ctx.messages.clone();
        let todo = (self.supplier)();
        if !todo.is_empty() {
            messages.push(Message::todo_context(todo));
        }
        messages
    }
}

#[async_trait]
impl Middleware for TodoContextMiddleware {
    fn name(&self) -> &str {
        "todo_context"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let messages = self.extend(&ctx);
        inner.generate(&messages, &ctx.options, cancel).await
    }
}

#[async_trait]
impl StreamingMiddleware for TodoContextMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let messages = self.extend(&ctx);
        inner.generate_stream(&messages, &ctx.options, cancel).await
    }
}
