// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted test doubles.
//!
//! A [`ScriptedAgent`] pops the next reply script on each call, so tests can
//! specify exact message sequences — including tool calls and update runs —
//! without a live provider.  The last request seen is recorded so tests can
//! assert on what a middleware actually sent inward.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use strom_message::Message;

use crate::{
    agent::{stream_from_messages, Agent, MessageStream, StreamingAgent},
    cancel::CancelToken,
    error::{PipelineError, Result},
    options::GenerateOptions,
};

pub struct ScriptedAgent {
    scripts: Mutex<VecDeque<Vec<Message>>>,
    /// Reply used once the scripts are exhausted.  `None` → empty reply.
    fallback: Option<Vec<Message>>,
    name: String,
    /// The most recent `(messages, options)` this agent received.
    pub last_request: Arc<Mutex<Option<(Vec<Message>, GenerateOptions)>>>,
}

impl ScriptedAgent {
    /// The outer `Vec` is the ordered list of calls; each inner `Vec` is the
    /// reply (or reply stream) for that call.
    pub fn new(scripts: Vec<Vec<Message>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback: None,
            name: "scripted".into(),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: agent that always answers with a single text message.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let mut agent = Self::new(vec![]);
        agent.name = "scripted-always".into();
        let text = reply.into();
        agent.fallback = Some(vec![Message::text(text)]);
        agent
    }

    fn next_script(&self) -> Vec<Message> {
        if let Some(script) = self.scripts.lock().unwrap().pop_front() {
            return script;
        }
        self.fallback.clone().unwrap_or_default()
    }

    fn record(&self, messages: &[Message], options: &GenerateOptions) {
        *self.last_request.lock().unwrap() = Some((messages.to_vec(), options.clone()));
    }
}

impl ScriptedAgent {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        cancel.check()?;
        self.record(messages, options);
        Ok(self.next_script())
    }
}

#[async_trait]
impl StreamingAgent for ScriptedAgent {
    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        cancel.check()?;
        self.record(messages, options);
        Ok(stream_from_messages(self.next_script()))
    }
}

/// Agent that always fails with a provider error.  Used by fallback tests.
pub struct FailingAgent {
    pub message: String,
}

impl FailingAgent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(
        &self,
        _messages: &[Message],
        _options: &GenerateOptions,
        _cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        Err(PipelineError::Provider(anyhow::anyhow!(
            "{}",
            self.message
        )))
    }
}

#[async_trait]
impl StreamingAgent for FailingAgent {
    async fn generate_stream(
        &self,
        _messages: &[Message],
        _options: &GenerateOptions,
        _cancel: &CancelToken,
    ) -> Result<MessageStream> {
        Err(PipelineError::Provider(anyhow::anyhow!(
            "{}",
            self.message
        )))
    }
}
