// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fire-and-forget persistence of outbound messages.
//!
//! Repositories are external collaborators; writes happen on detached tasks
//! so the reply stream never blocks on storage.  Every failure except
//! cancellation is logged and swallowed — losing an in-flight write on
//! shutdown is acceptable, breaking the stream is not.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use strom_agent::{
    Agent, CancelToken, InvocationContext, MessageStream, Middleware, Result, StreamingAgent,
    StreamingMiddleware,
};
use strom_message::Message;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub title: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub message_json: String,
    pub timestamp_ms: i64,
    pub message_type: String,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: SessionRecord) -> anyhow::Result<()>;
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<SessionRecord>>;
    async fn update(&self, session: SessionRecord) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: MessageRecord) -> anyhow::Result<()>;
}

/// In-process repository used by tests.
#[derive(Default)]
pub struct MemoryMessageRepository {
    records: RwLock<Vec<MessageRecord>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<MessageRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, message: MessageRecord) -> anyhow::Result<()> {
        self.records.write().await.push(message);
        Ok(())
    }
}

/// In-process session repository used by tests.
#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: SessionRecord) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update(&self, session: SessionRecord) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }
}

pub struct PersistenceMiddleware {
    repository: Arc<dyn MessageRepository>,
    session_id: String,
}

impl PersistenceMiddleware {
    pub fn new(repository: Arc<dyn MessageRepository>, session_id: impl Into<String>) -> Self {
        Self {
            repository,
            session_id: session_id.into(),
        }
    }

    /// Mirror one outbound message to storage on a detached task.
    fn persist(&self, message: &Message, cancel: &CancelToken) {
        let message_json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "message failed to serialize for persistence");
                return;
            }
        };
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            message_json,
            timestamp_ms: Utc::now().timestamp_millis(),
            message_type: message.body.kind().to_string(),
        };
        let repository = Arc::clone(&self.repository);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = repository.create(record) => {
                    if let Err(e) = result {
                        warn!(error = %e, "message persistence failed; dropping record");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Middleware for PersistenceMiddleware {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let replies = inner.generate(&ctx.messages, &ctx.options, cancel).await?;
        for m in &replies {
            self.persist(m, cancel);
        }
        Ok(replies)
    }
}

#[async_trait]
impl StreamingMiddleware for PersistenceMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let stream = inner
            .generate_stream(&ctx.messages, &ctx.options, cancel)
            .await?;
        let mw = PersistenceMiddleware {
            repository: Arc::clone(&self.repository),
            session_id: self.session_id.clone(),
        };
        let cancel = cancel.clone();
        Ok(Box::pin(stream.map(move |item| {
            if let Ok(m) = &item {
                mw.persist(m, &cancel);
            }
            item
        })))
    }
}
