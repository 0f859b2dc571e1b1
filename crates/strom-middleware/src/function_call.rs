// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Function-call middleware: injects contracts into the options, executes
//! tool calls the model requests, and aggregates calls with their results.
//!
//! On the streaming path execution is speculative: each call starts running
//! as soon as its argument stream completes, while later calls are still
//! being streamed.  Results are assembled in call order at finalize time, so
//! the consumer sees one `ToolsCallAggregate` regardless of completion
//! order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::warn;

use strom_agent::{
    Agent, CancelToken, InvocationContext, MessageStream, Middleware, PipelineError, Result,
    StreamingAgent, StreamingMiddleware,
};
use strom_functions::{execute_call, execute_tools, FunctionMap, ToolCallObserver};
use strom_message::{
    FunctionContract, Message, MessageBody, ToolCallResult, ToolsCallBuilder, Usage,
};

type PendingMap = Arc<Mutex<HashMap<String, JoinHandle<Result<ToolCallResult>>>>>;

pub struct FunctionCallMiddleware {
    contracts: Vec<FunctionContract>,
    functions: Arc<FunctionMap>,
    observer: Option<Arc<dyn ToolCallObserver>>,
}

impl FunctionCallMiddleware {
    /// Every declared contract must have a handler in the map.
    pub fn new(contracts: Vec<FunctionContract>, functions: FunctionMap) -> Result<Self> {
        for c in &contracts {
            if !functions.contains_key(&c.name) {
                return Err(PipelineError::ArgumentInvalid(format!(
                    "contract '{}' has no function map entry",
                    c.name
                )));
            }
        }
        Ok(Self {
            contracts,
            functions: Arc::new(functions),
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ToolCallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Pre-execution short-circuit: when the caller's last message already
    /// carries tool calls, execute them and skip the inner agent entirely.
    async fn short_circuit(
        &self,
        ctx: &InvocationContext,
        cancel: &CancelToken,
    ) -> Result<Option<Message>> {
        let Some(last) = ctx.messages.last() else {
            return Ok(None);
        };
        match last.tool_calls_slice() {
            Some(calls) if !calls.is_empty() => {
                let result = execute_tools(
                    last,
                    &self.functions,
                    self.observer.as_deref(),
                    cancel,
                )
                .await?;
                Ok(Some(result))
            }
            _ => Ok(None),
        }
    }

    fn options_with_functions(&self, ctx: &InvocationContext) -> strom_agent::GenerateOptions {
        let mut options = ctx.options.clone();
        options.add_functions(&self.contracts);
        options
    }

    /// Execute a complete `ToolsCall` reply and pair it with its results.
    async fn aggregate_complete(
        &self,
        calls_msg: &Message,
        cancel: &CancelToken,
    ) -> Result<Message> {
        let result_msg =
            execute_tools(calls_msg, &self.functions, self.observer.as_deref(), cancel).await?;
        let calls = calls_msg
            .tool_calls_slice()
            .expect("caller checked ToolsCall")
            .to_vec();
        let results = match result_msg.body {
            MessageBody::ToolsCallResult { results } => results,
            _ => unreachable!("executor returns ToolsCallResult"),
        };
        Ok(Message::aggregate(calls, results).with_header_from(calls_msg))
    }
}

#[async_trait]
impl Middleware for FunctionCallMiddleware {
    fn name(&self) -> &str {
        "function_call"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        if let Some(result) = self.short_circuit(&ctx, cancel).await? {
            return Ok(vec![result]);
        }

        let options = self.options_with_functions(&ctx);
        let replies = inner.generate(&ctx.messages, &options, cancel).await?;

        let mut usage: Option<Usage> = None;
        let mut out = Vec::with_capacity(replies.len());
        for mut m in replies {
            let carried_usage = m.take_usage_metadata();
            if let Some(u) = &carried_usage {
                usage.get_or_insert_with(Usage::default).merge(u);
            }
            let is_empty_text =
                matches!(&m.body, MessageBody::Text { text } if text.is_empty());
            if is_empty_text && carried_usage.is_some() {
                continue;
            }
            let has_calls = m
                .tool_calls_slice()
                .is_some_and(|calls| !calls.is_empty());
            if has_calls {
                out.push(self.aggregate_complete(&m, cancel).await?);
            } else {
                out.push(m);
            }
        }
        if let Some(u) = usage {
            out.push(Message::usage(u));
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamingMiddleware for FunctionCallMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        if let Some(result) = self.short_circuit(&ctx, cancel).await? {
            return Ok(strom_agent::stream_from_messages(vec![result]));
        }

        let options = self.options_with_functions(&ctx);
        let stream = inner
            .generate_stream(&ctx.messages, &options, cancel)
            .await?;

        let state = StreamState {
            inner: stream,
            builder: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            functions: Arc::clone(&self.functions),
            observer: self.observer.clone(),
            cancel: cancel.clone(),
            queue: VecDeque::new(),
            done: false,
        };
        Ok(Box::pin(futures::stream::unfold(state, |mut s| async move {
            loop {
                if let Some(m) = s.queue.pop_front() {
                    return Some((Ok(m), s));
                }
                if s.done {
                    return None;
                }
                match s.inner.next().await {
                    None => {
                        s.done = true;
                        if let Err(e) = s.finalize_builder().await {
                            return Some((Err(e), s));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), s)),
                    Some(Ok(msg)) => {
                        if let Err(e) = s.process(msg).await {
                            s.done = true;
                            return Some((Err(e), s));
                        }
                    }
                }
            }
        })))
    }
}

struct StreamState {
    inner: MessageStream,
    builder: Option<ToolsCallBuilder>,
    pending: PendingMap,
    functions: Arc<FunctionMap>,
    observer: Option<Arc<dyn ToolCallObserver>>,
    cancel: CancelToken,
    queue: VecDeque<Message>,
    done: bool,
}

impl StreamState {
    async fn process(&mut self, msg: Message) -> Result<()> {
        match &msg.body {
            // Plural deltas from the provider, or singular ones after the
            // transform layer expanded them — the builder handles both.
            MessageBody::ToolsCallUpdate { .. } | MessageBody::ToolCallUpdate(_) => {
                self.ensure_builder().add_message(&msg);
                self.queue.push_back(msg);
                Ok(())
            }
            _ => {
                // A non-update after a run of updates closes the builder.
                self.finalize_builder().await?;
                let has_calls = msg
                    .tool_calls_slice()
                    .is_some_and(|calls| !calls.is_empty());
                if has_calls {
                    // Complete tool calls arriving mid-stream (e.g. from the
                    // natural tool-use parser) execute right away.
                    let aggregate = self.aggregate_now(&msg).await?;
                    self.queue.push_back(aggregate);
                } else {
                    self.queue.push_back(msg);
                }
                Ok(())
            }
        }
    }

    fn ensure_builder(&mut self) -> &mut ToolsCallBuilder {
        if self.builder.is_none() {
            let pending = Arc::clone(&self.pending);
            let functions = Arc::clone(&self.functions);
            let observer = self.observer.clone();
            let cancel = self.cancel.clone();
            self.builder = Some(ToolsCallBuilder::new().with_call_ready(Box::new(
                move |call| {
                    let Some(id) = call.tool_call_id.clone() else {
                        return;
                    };
                    let functions = Arc::clone(&functions);
                    let observer = observer.clone();
                    let cancel = cancel.clone();
                    let handle = tokio::spawn(async move {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                            r = execute_call(&call, &functions, observer.as_deref()) => Ok(r),
                        }
                    });
                    pending.lock().unwrap().insert(id, handle);
                },
            )));
        }
        self.builder.as_mut().expect("just created")
    }

    /// Close the update builder: assemble results in call order, preferring
    /// the speculative tasks, and queue one aggregate message.
    async fn finalize_builder(&mut self) -> Result<()> {
        let Some(builder) = self.builder.take() else {
            return Ok(());
        };
        let Some(calls_msg) = builder.finalize() else {
            return Ok(());
        };
        let calls = calls_msg
            .tool_calls_slice()
            .expect("builder emits ToolsCall")
            .to_vec();

        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            self.cancel.check()?;
            let handle = call
                .tool_call_id
                .as_ref()
                .and_then(|id| self.pending.lock().unwrap().remove(id));
            let result = match handle {
                Some(handle) => match handle.await {
                    Ok(Ok(result)) => result,
                    Ok(Err(PipelineError::Cancelled)) => return Err(PipelineError::Cancelled),
                    Ok(Err(e)) => failed_result(call.tool_call_id.clone(), &e.to_string()),
                    Err(join_err) => {
                        warn!(error = %join_err, "speculative tool task panicked");
                        failed_result(call.tool_call_id.clone(), &join_err.to_string())
                    }
                },
                // No speculative task (no id, or never fired): execute now.
                None => {
                    execute_call(call, &self.functions, self.observer.as_deref()).await
                }
            };
            results.push(result);
        }

        self.queue
            .push_back(Message::aggregate(calls, results).with_header_from(&calls_msg));
        Ok(())
    }

    async fn aggregate_now(&mut self, calls_msg: &Message) -> Result<Message> {
        let result_msg = execute_tools(
            calls_msg,
            &self.functions,
            self.observer.as_deref(),
            &self.cancel,
        )
        .await?;
        let calls = calls_msg
            .tool_calls_slice()
            .expect("caller checked ToolsCall")
            .to_vec();
        let results = match result_msg.body {
            MessageBody::ToolsCallResult { results } => results,
            _ => unreachable!("executor returns ToolsCallResult"),
        };
        Ok(Message::aggregate(calls, results).with_header_from(calls_msg))
    }
}

fn failed_result(id: Option<String>, message: &str) -> ToolCallResult {
    ToolCallResult {
        tool_call_id: id,
        result: format!("Tool call failed: {message}"),
        content_blocks: None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
