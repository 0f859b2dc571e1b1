// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model fallback: route a call to an ordered list of candidate agents for
//! the requested model id, falling through on failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use strom_agent::{
    stream_from_messages, Agent, CancelToken, InvocationContext, MessageStream, Middleware,
    PipelineError, Result, StreamingAgent, StreamingMiddleware,
};
use strom_message::Message;

/// A fallback candidate.  Agents without streaming support are adapted to a
/// lazy stream on the streaming path.
#[derive(Clone)]
pub enum FallbackRoute {
    Streaming(Arc<dyn StreamingAgent>),
    NonStreaming(Arc<dyn Agent>),
}

impl FallbackRoute {
    async fn generate(
        &self,
        messages: &[Message],
        options: &strom_agent::GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        match self {
            Self::Streaming(a) => a.generate(messages, options, cancel).await,
            Self::NonStreaming(a) => a.generate(messages, options, cancel).await,
        }
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &strom_agent::GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        match self {
            Self::Streaming(a) => a.generate_stream(messages, options, cancel).await,
            Self::NonStreaming(a) => {
                let replies = a.generate(messages, options, cancel).await?;
                Ok(stream_from_messages(replies))
            }
        }
    }
}

pub struct ModelFallbackMiddleware {
    routes: HashMap<String, Vec<FallbackRoute>>,
    default_route: Option<FallbackRoute>,
    try_default_last: bool,
}

impl ModelFallbackMiddleware {
    pub fn new(routes: HashMap<String, Vec<FallbackRoute>>) -> Self {
        Self {
            routes,
            default_route: None,
            try_default_last: false,
        }
    }

    pub fn with_default(mut self, route: FallbackRoute) -> Self {
        self.default_route = Some(route);
        self.try_default_last = true;
        self
    }

    fn candidates(&self, ctx: &InvocationContext) -> Vec<FallbackRoute> {
        let mut out: Vec<FallbackRoute> = ctx
            .options
            .model_id
            .as_deref()
            .and_then(|id| self.routes.get(id))
            .cloned()
            .unwrap_or_default();
        if self.try_default_last {
            if let Some(d) = &self.default_route {
                out.push(d.clone());
            }
        }
        out
    }
}

#[async_trait]
impl Middleware for ModelFallbackMiddleware {
    fn name(&self) -> &str {
        "model_fallback"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let candidates = self.candidates(&ctx);
        if candidates.is_empty() {
            return inner.generate(&ctx.messages, &ctx.options, cancel).await;
        }
        let mut first_error: Option<PipelineError> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            match candidate.generate(&ctx.messages, &ctx.options, cancel).await {
                Ok(replies) => return Ok(replies),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(candidate = i, error = %e, "fallback candidate failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.expect("non-empty candidate list"))
    }
}

#[async_trait]
impl StreamingMiddleware for ModelFallbackMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let candidates = self.candidates(&ctx);
        if candidates.is_empty() {
            return inner
                .generate_stream(&ctx.messages, &ctx.options, cancel)
                .await;
        }
        let mut first_error: Option<PipelineError> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            match candidate
                .generate_stream(&ctx.messages, &ctx.options, cancel)
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(candidate = i, error = %e, "fallback candidate failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.expect("non-empty candidate list"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use strom_agent::mock::{FailingAgent, ScriptedAgent};
    use strom_agent::GenerateOptions;

    fn ctx_for(model: &str) -> InvocationContext {
        InvocationContext::new(
            vec![Message::user("q")],
            GenerateOptions::default().with_model(model),
        )
    }

    #[tokio::test]
    async fn first_healthy_candidate_wins() {
        let mut routes = HashMap::new();
        routes.insert(
            "m".to_string(),
            vec![
                FallbackRoute::Streaming(Arc::new(FailingAgent::new("down"))),
                FallbackRoute::Streaming(Arc::new(ScriptedAgent::always_text("backup"))),
            ],
        );
        let mw = ModelFallbackMiddleware::new(routes);
        let inner = ScriptedAgent::always_text("inner");
        let out = mw
            .invoke(ctx_for("m"), &inner, &CancelToken::none())
            .await
            .unwrap();
        assert_eq!(out[0].as_text(), Some("backup"));
    }

    #[tokio::test]
    async fn unmapped_model_goes_to_inner_agent() {
        let mw = ModelFallbackMiddleware::new(HashMap::new());
        let inner = ScriptedAgent::always_text("inner");
        let out = mw
            .invoke(ctx_for("unknown"), &inner, &CancelToken::none())
            .await
            .unwrap();
        assert_eq!(out[0].as_text(), Some("inner"));
    }

    #[tokio::test]
    async fn all_failed_rethrows_first_error() {
        let mut routes = HashMap::new();
        routes.insert(
            "m".to_string(),
            vec![
                FallbackRoute::Streaming(Arc::new(FailingAgent::new("first boom"))),
                FallbackRoute::Streaming(Arc::new(FailingAgent::new("second boom"))),
            ],
        );
        let mw = ModelFallbackMiddleware::new(routes);
        let inner = ScriptedAgent::always_text("inner");
        let err = mw
            .invoke(ctx_for("m"), &inner, &CancelToken::none())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("first boom"));
    }

    #[tokio::test]
    async fn default_is_tried_last() {
        let mut routes = HashMap::new();
        routes.insert(
            "m".to_string(),
            vec![FallbackRoute::Streaming(Arc::new(FailingAgent::new(
                "down",
            )))],
        );
        let mw = ModelFallbackMiddleware::new(routes).with_default(FallbackRoute::Streaming(
            Arc::new(ScriptedAgent::always_text("default")),
        ));
        let inner = ScriptedAgent::always_text("inner");
        let out = mw
            .invoke(ctx_for("m"), &inner, &CancelToken::none())
            .await
            .unwrap();
        assert_eq!(out[0].as_text(), Some("default"));
    }

    #[tokio::test]
    async fn non_streaming_candidate_is_adapted_on_streaming_path() {
        struct GenerateOnly;
        #[async_trait]
        impl Agent for GenerateOnly {
            async fn generate(
                &self,
                _m: &[Message],
                _o: &strom_agent::GenerateOptions,
                _c: &CancelToken,
            ) -> Result<Vec<Message>> {
                Ok(vec![Message::text("adapted")])
            }
        }

        let mut routes = HashMap::new();
        routes.insert(
            "m".to_string(),
            vec![FallbackRoute::NonStreaming(Arc::new(GenerateOnly))],
        );
        let mw = ModelFallbackMiddleware::new(routes);
        let inner = ScriptedAgent::always_text("inner");
        let out: Vec<Message> = mw
            .invoke_stream(ctx_for("m"), &inner, &CancelToken::none())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out[0].as_text(), Some("adapted"));
    }
}
