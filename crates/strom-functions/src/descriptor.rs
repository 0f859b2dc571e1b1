// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use strom_message::{FunctionContract, ToolCallResult};

/// What a handler may return: plain JSON text, or a full result carrying
/// content blocks (the multi-modal shape).  The executor stamps the
/// `tool_call_id` onto the latter.
#[derive(Debug, Clone)]
pub enum HandlerOutput {
    Text(String),
    Result(ToolCallResult),
}

impl From<String> for HandlerOutput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for HandlerOutput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<serde_json::Value> for HandlerOutput {
    fn from(v: serde_json::Value) -> Self {
        Self::Text(v.to_string())
    }
}

/// A function implementation: JSON argument text in, output future back.
pub type FunctionHandler =
    dyn Fn(String) -> BoxFuture<'static, anyhow::Result<HandlerOutput>> + Send + Sync;

/// Build an `Arc<FunctionHandler>` from an async closure.
pub fn handler<F, Fut, O>(f: F) -> Arc<FunctionHandler>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<O>> + Send + 'static,
    O: Into<HandlerOutput> + 'static,
{
    Arc::new(move |args| {
        let fut = f(args);
        Box::pin(async move { fut.await.map(Into::into) })
    })
}

/// Registered name → handler, built once at startup and read-only afterwards.
pub type FunctionMap = BTreeMap<String, Arc<FunctionHandler>>;

/// A contract plus its implementation plus provenance.
#[derive(Clone)]
pub struct FunctionDescriptor {
    pub contract: FunctionContract,
    pub handler: Arc<FunctionHandler>,
    pub provider_name: String,
    pub is_stateful: bool,
}

impl FunctionDescriptor {
    pub fn new(
        contract: FunctionContract,
        handler: Arc<FunctionHandler>,
        provider_name: impl Into<String>,
    ) -> Self {
        Self {
            contract,
            handler,
            provider_name: provider_name.into(),
            is_stateful: false,
        }
    }

    /// Grouping key for conflict resolution: `"{class}-{name}"` when the
    /// contract belongs to a class, else the bare name.
    pub fn key(&self) -> String {
        match &self.contract.class_name {
            Some(class) => format!("{class}-{}", self.contract.name),
            None => self.contract.name.clone(),
        }
    }
}

impl std::fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("key", &self.key())
            .field("provider_name", &self.provider_name)
            .field("is_stateful", &self.is_stateful)
            .finish()
    }
}

/// A source of function descriptors (an MCP server, a built-in tool set, …).
/// Lower `priority` sorts first during registry collection.
pub struct FunctionProvider {
    pub provider_name: String,
    pub priority: i32,
    pub descriptors: Vec<FunctionDescriptor>,
}

impl FunctionProvider {
    pub fn new(provider_name: impl Into<String>, priority: i32) -> Self {
        Self {
            provider_name: provider_name.into(),
            priority,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, mut descriptor: FunctionDescriptor) -> Self {
        descriptor.provider_name = self.provider_name.clone();
        self.descriptors.push(descriptor);
        self
    }
}
