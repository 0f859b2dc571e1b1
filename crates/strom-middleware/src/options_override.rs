// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use strom_agent::{
    Agent, CancelToken, GenerateOptions, InvocationContext, MessageStream, Middleware, Result,
    StreamingAgent, StreamingMiddleware,
};
use strom_message::Message;

/// Merges a pre-configured options block into every call: the caller's
/// options are the base, the configured overrides win.
pub struct OptionsOverrideMiddleware {
    overrides: GenerateOptions,
}

impl OptionsOverrideMiddleware {
    pub fn new(overrides: GenerateOptions) -> Self {
        Self { overrides }
    }

    fn apply(&self, ctx: &InvocationContext) -> GenerateOptions {
        ctx.options.merged_with(&self.overrides)
    }
}

#[async_trait]
impl Middleware for OptionsOverrideMiddleware {
    fn name(&self) -> &str {
        "options_override"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let options = self.apply(&ctx);
        inner.generate(&ctx.messages, &options, cancel).await
    }
}

#[async_trait]
impl StreamingMiddleware for OptionsOverrideMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let options = self.apply(&ctx);
        inner.generate_stream(&ctx.messages, &options, cancel).await
    }
}
