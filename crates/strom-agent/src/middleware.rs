// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Middleware composition.
//!
//! A middleware wraps an inner agent and becomes an agent itself, so chains
//! are built leaves-first: `agent.with(m1).with(m2)` puts `m2` outermost —
//! it sees the request first and the reply stream last.
//!
//! Contract for streaming middleware: never fabricate a stream out of thin
//! air.  Obtain the inner stream and either yield items through or build a
//! new lazy stream that pulls from it, forwarding cancellation on every
//! pull.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::{error, warn};

use strom_message::Message;

use crate::{
    agent::{Agent, MessageStream, StreamingAgent},
    cancel::CancelToken,
    error::{PipelineError, Result},
    options::GenerateOptions,
};

/// The request half of one call: what the middleware may inspect and rewrite
/// before involving the inner agent.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub messages: Vec<Message>,
    pub options: GenerateOptions,
}

impl InvocationContext {
    pub fn new(messages: Vec<Message>, options: GenerateOptions) -> Self {
        Self { messages, options }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name shown in stall diagnostics and logs.
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait StreamingMiddleware: Middleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream>;
}

// ─── Wrapping ─────────────────────────────────────────────────────────────────

/// An agent formed by wrapping `middleware` around `inner`.
pub struct MiddlewareAgent {
    inner: Arc<dyn StreamingAgent>,
    middleware: Arc<dyn StreamingMiddleware>,
}

impl MiddlewareAgent {
    pub fn new(inner: Arc<dyn StreamingAgent>, middleware: Arc<dyn StreamingMiddleware>) -> Self {
        Self { inner, middleware }
    }
}

#[async_trait]
impl Agent for MiddlewareAgent {
    fn name(&self) -> &str {
        self.middleware.name()
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        cancel.check()?;
        let ctx = InvocationContext::new(messages.to_vec(), options.clone());
        self.middleware
            .invoke(ctx, self.inner.as_ref(), cancel)
            .await
    }
}

#[async_trait]
impl StreamingAgent for MiddlewareAgent {
    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        cancel.check()?;
        let ctx = InvocationContext::new(messages.to_vec(), options.clone());
        let stream = self
            .middleware
            .invoke_stream(ctx, self.inner.as_ref(), cancel)
            .await?;
        Ok(monitor_stream(self.middleware.name().to_string(), stream))
    }
}

/// Chain-building sugar: `agent.with(m1).with(m2)`.
pub trait WithMiddleware {
    fn with(self, middleware: Arc<dyn StreamingMiddleware>) -> Arc<dyn StreamingAgent>;
}

impl WithMiddleware for Arc<dyn StreamingAgent> {
    fn with(self, middleware: Arc<dyn StreamingMiddleware>) -> Arc<dyn StreamingAgent> {
        Arc::new(MiddlewareAgent::new(self, middleware))
    }
}

// ─── Cancellation guard ───────────────────────────────────────────────────────

/// Wrap a stream so a fired cancel token surfaces as a single
/// `Err(Cancelled)` at the next pull; nothing is emitted afterwards.
pub fn cancel_guard(inner: MessageStream, cancel: CancelToken) -> MessageStream {
    Box::pin(futures::stream::unfold(
        (inner, cancel, false),
        |(mut inner, cancel, done)| async move {
            if done {
                return None;
            }
            if cancel.is_cancelled() {
                return Some((Err(PipelineError::Cancelled), (inner, cancel, true)));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Some((Err(PipelineError::Cancelled), (inner, cancel, true)))
                }
                item = inner.next() => match item {
                    Some(item) => Some((item, (inner, cancel, false))),
                    None => None,
                },
            }
        },
    ))
}

// ─── Stall monitor ────────────────────────────────────────────────────────────

const STALL_WARN_AFTER: Duration = Duration::from_secs(15);
const STALL_ERROR_AFTER: Duration = Duration::from_secs(30);

/// Wrap a reply stream with a watchdog that logs when the producer stalls
/// between yields.  Diagnostic only: no timeout error is injected.
pub fn monitor_stream(middleware: String, inner: MessageStream) -> MessageStream {
    let last_yield = Arc::new(Mutex::new(Instant::now()));
    let watchdog = tokio::spawn(stall_watchdog(middleware, Arc::clone(&last_yield)));
    Box::pin(MonitoredStream {
        inner,
        last_yield,
        watchdog,
    })
}

async fn stall_watchdog(middleware: String, last_yield: Arc<Mutex<Instant>>) {
    let mut warned = false;
    let mut errored = false;
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let idle = last_yield.lock().unwrap().elapsed();
        if idle >= STALL_ERROR_AFTER {
            if !errored {
                errored = true;
                error!(middleware = %middleware, idle_secs = idle.as_secs(),
                    "stream stalled between yields");
            }
        } else if idle >= STALL_WARN_AFTER {
            if !warned {
                warned = true;
                warn!(middleware = %middleware, idle_secs = idle.as_secs(),
                    "stream slow between yields");
            }
        } else {
            warned = false;
            errored = false;
        }
    }
}

struct MonitoredStream {
    inner: MessageStream,
    last_yield: Arc<Mutex<Instant>>,
    watchdog: tokio::task::JoinHandle<()>,
}

impl Stream for MonitoredStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.as_mut().poll_next(cx);
        if polled.is_ready() {
            *self.last_yield.lock().unwrap() = Instant::now();
        }
        polled
    }
}

impl Drop for MonitoredStream {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::stream_from_messages;
    use crate::cancel::CancelSource;

    struct Leaf;

    #[async_trait]
    impl Agent for Leaf {
        fn name(&self) -> &str {
            "leaf"
        }
        async fn generate(
            &self,
            _messages: &[Message],
            _options: &GenerateOptions,
            _cancel: &CancelToken,
        ) -> Result<Vec<Message>> {
            Ok(vec![Message::text("leaf")])
        }
    }

    #[async_trait]
    impl StreamingAgent for Leaf {
        async fn generate_stream(
            &self,
            _messages: &[Message],
            _options: &GenerateOptions,
            _cancel: &CancelToken,
        ) -> Result<MessageStream> {
            Ok(stream_from_messages(vec![Message::text("leaf")]))
        }
    }

    /// Middleware that prepends its tag to the first reply text.
    struct Tagger(&'static str);

    #[async_trait]
    impl Middleware for Tagger {
        fn name(&self) -> &str {
            self.0
        }
        async fn invoke(
            &self,
            ctx: InvocationContext,
            inner: &dyn Agent,
            cancel: &CancelToken,
        ) -> Result<Vec<Message>> {
            let replies = inner.generate(&ctx.messages, &ctx.options, cancel).await?;
            Ok(replies
                .into_iter()
                .map(|m| {
                    let text = m.as_text().unwrap_or_default();
                    Message::text(format!("{}:{}", self.0, text))
                })
                .collect())
        }
    }

    #[async_trait]
    impl StreamingMiddleware for Tagger {
        async fn invoke_stream(
            &self,
            ctx: InvocationContext,
            inner: &dyn StreamingAgent,
            cancel: &CancelToken,
        ) -> Result<MessageStream> {
            let tag = self.0;
            let stream = inner
                .generate_stream(&ctx.messages, &ctx.options, cancel)
                .await?;
            Ok(Box::pin(stream.map(move |item| {
                item.map(|m| {
                    let text = m.as_text().unwrap_or_default().to_string();
                    Message::text(format!("{tag}:{text}"))
                })
            })))
        }
    }

    #[tokio::test]
    async fn composition_is_right_associative() {
        let agent: Arc<dyn StreamingAgent> = Arc::new(Leaf);
        let chained = agent
            .with(Arc::new(Tagger("m1")))
            .with(Arc::new(Tagger("m2")));
        let replies = chained
            .generate(&[], &GenerateOptions::default(), &CancelToken::none())
            .await
            .unwrap();
        // m2 outermost: it wraps m1's output.
        assert_eq!(replies[0].as_text(), Some("m2:m1:leaf"));
    }

    #[tokio::test]
    async fn streaming_composition_transforms_each_item() {
        let agent: Arc<dyn StreamingAgent> = Arc::new(Leaf);
        let chained = agent.with(Arc::new(Tagger("s")));
        let mut stream = chained
            .generate_stream(&[], &GenerateOptions::default(), &CancelToken::none())
            .await
            .unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap().as_text(),
            Some("s:leaf")
        );
    }

    #[tokio::test]
    async fn wrapped_generate_fails_fast_when_already_cancelled() {
        let (src, token) = CancelSource::new();
        src.cancel();
        let agent: Arc<dyn StreamingAgent> = Arc::new(Leaf);
        let chained = agent.with(Arc::new(Tagger("m")));
        let err = chained
            .generate(&[], &GenerateOptions::default(), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_guard_emits_single_cancelled_error() {
        let (src, token) = CancelSource::new();
        // A stream that never ends on its own.
        let pending = Box::pin(futures::stream::pending::<Result<Message>>());
        let mut guarded = cancel_guard(pending, token);
        src.cancel();
        match guarded.next().await {
            Some(Err(PipelineError::Cancelled)) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert!(guarded.next().await.is_none(), "nothing after cancel");
    }

    #[tokio::test]
    async fn cancel_guard_passes_items_through() {
        let (_src, token) = CancelSource::new();
        let inner = stream_from_messages(vec![Message::text("a"), Message::text("b")]);
        let mut guarded = cancel_guard(inner, token);
        assert_eq!(guarded.next().await.unwrap().unwrap().as_text(), Some("a"));
        assert_eq!(guarded.next().await.unwrap().unwrap().as_text(), Some("b"));
        assert!(guarded.next().await.is_none());
    }
}
