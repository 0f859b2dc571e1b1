// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Caching middleware: fingerprint-keyed memoization of whole replies.
//!
//! The key is `base64(sha256(canonical_json({messages, options})))` using
//! the shared canonical serializer, so the same logical request always
//! hashes identically.  Inner failures surface to the consumer and nothing
//! is stored for them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::StreamExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::warn;

use strom_agent::{
    Agent, CancelToken, GenerateOptions, InvocationContext, MessageStream, Middleware, Result,
    StreamingAgent, StreamingMiddleware,
};
use strom_message::{canonical_string, Message};

/// Replay cadence on the streaming path, to keep cached replies looking
/// like a live stream to downstream consumers.
const REPLAY_DELAY: Duration = Duration::from_millis(20);

/// External key-value collaborator.  Implementations must be safe for
/// concurrent get/set.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
}

/// In-process store used by tests and small deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// Stable request fingerprint.
pub fn fingerprint(messages: &[Message], options: &GenerateOptions) -> String {
    let canonical = canonical_string(&json!({
        "messages": messages,
        "options": options,
    }))
    .expect("messages and options serialize");
    let digest = Sha256::digest(canonical.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

pub struct CachingMiddleware {
    store: Arc<dyn KvStore>,
}

impl CachingMiddleware {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn lookup(&self, key: &str) -> Option<Vec<Message>> {
        match self.store.get(key).await {
            Ok(Some(serialized)) => match serde_json::from_str::<Vec<Message>>(&serialized) {
                Ok(messages) => Some(messages),
                Err(e) => {
                    warn!(key = %key, error = %e, "cache entry failed to deserialize; ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache get failed; treating as miss");
                None
            }
        }
    }

    async fn store_reply(&self, key: &str, messages: &[Message]) {
        let serialized = match serde_json::to_string(messages) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "reply failed to serialize for cache");
                return;
            }
        };
        if let Err(e) = self.store.set(key, serialized).await {
            warn!(key = %key, error = %e, "cache set failed");
        }
    }
}

#[async_trait]
impl Middleware for CachingMiddleware {
    fn name(&self) -> &str {
        "cache"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let key = fingerprint(&ctx.messages, &ctx.options);
        if let Some(cached) = self.lookup(&key).await {
            return Ok(cached);
        }
        let replies = inner.generate(&ctx.messages, &ctx.options, cancel).await?;
        self.store_reply(&key, &replies).await;
        Ok(replies)
    }
}

#[async_trait]
impl StreamingMiddleware for CachingMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let key = fingerprint(&ctx.messages, &ctx.options);
        if let Some(cached) = self.lookup(&key).await {
            return Ok(Box::pin(futures::stream::unfold(
                cached.into_iter(),
                |mut iter| async move {
                    let m = iter.next()?;
                    tokio::time::sleep(REPLAY_DELAY).await;
                    Some((Ok(m), iter))
                },
            )));
        }

        let stream = inner
            .generate_stream(&ctx.messages, &ctx.options, cancel)
            .await?;
        let store = Arc::clone(&self.store);

        struct State {
            inner: MessageStream,
            store: Arc<dyn KvStore>,
            key: String,
            buffered: Vec<Message>,
            failed: bool,
        }
        let state = State {
            inner: stream,
            store,
            key,
            buffered: Vec::new(),
            failed: false,
        };
        Ok(Box::pin(futures::stream::unfold(state, |mut s| async move {
            match s.inner.next().await {
                Some(Ok(m)) => {
                    s.buffered.push(m.clone());
                    Some((Ok(m), s))
                }
                Some(Err(e)) => {
                    s.failed = true;
                    Some((Err(e), s))
                }
                None => {
                    if !s.failed {
                        let serialized = serde_json::to_string(&s.buffered);
                        match serialized {
                            Ok(serialized) => {
                                if let Err(e) = s.store.set(&s.key, serialized).await {
                                    warn!(key = %s.key, error = %e, "cache set failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "reply failed to serialize for cache"),
                        }
                    }
                    None
                }
            }
        })))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
