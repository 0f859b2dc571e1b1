// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use strom_message::Message;

use crate::{cancel::CancelToken, error::Result, options::GenerateOptions};

/// A lazily-pulled, possibly unbounded reply stream.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// A provider of model replies: maps a message list plus options to a
/// bounded reply list.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str {
        "agent"
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>>;
}

/// An agent that can additionally produce its reply as a lazy stream.
#[async_trait]
pub trait StreamingAgent: Agent {
    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<MessageStream>;
}

/// Adapt a bounded reply list into the lazy-stream shape.
///
/// Used when a streaming call lands on an agent that only implements the
/// non-streaming half (e.g. a fallback candidate).
pub fn stream_from_messages(messages: Vec<Message>) -> MessageStream {
    Box::pin(futures::stream::iter(messages.into_iter().map(Ok)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_from_messages_yields_in_order() {
        let mut s = stream_from_messages(vec![Message::text("a"), Message::text("b")]);
        assert_eq!(s.next().await.unwrap().unwrap().as_text(), Some("a"));
        assert_eq!(s.next().await.unwrap().unwrap().as_text(), Some("b"));
        assert!(s.next().await.is_none());
    }
}
