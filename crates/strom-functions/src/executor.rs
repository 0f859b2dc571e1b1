// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stateless execution of a set of tool calls against a function map.
//!
//! Calls run concurrently; results come back in input order.  A failing
//! handler never fails the batch — its failure text becomes the result.

use async_trait::async_trait;
use tracing::{debug, warn};

use strom_agent::{CancelToken, PipelineError, Result};
use strom_message::{Message, ToolCall, ToolCallResult};

use crate::descriptor::{FunctionMap, HandlerOutput};

/// Observer for tool-call lifecycle events.
///
/// For each call the sequence is strictly `started` → (`error`?) →
/// `result_available`; `result_available` always fires exactly once, with an
/// error-bearing result when execution failed.
#[async_trait]
pub trait ToolCallObserver: Send + Sync {
    async fn on_tool_call_started(&self, _id: &str, _name: &str, _args: &str) {}
    async fn on_tool_result_available(&self, _id: &str, _result: &ToolCallResult) {}
    async fn on_tool_call_error(&self, _id: &str, _name: &str, _error_text: &str) {}
}

/// Execute one tool call and notify the observer.
pub async fn execute_call(
    call: &ToolCall,
    functions: &FunctionMap,
    observer: Option<&dyn ToolCallObserver>,
) -> ToolCallResult {
    let id = call.tool_call_id.clone().unwrap_or_default();
    let name = call.function_name.as_str();
    if let Some(obs) = observer {
        obs.on_tool_call_started(&id, name, &call.function_args).await;
    }

    let result = match functions.get(name) {
        None => {
            let available: Vec<&str> = functions.keys().map(String::as_str).collect();
            let text = format!(
                "Function '{name}' is not available. Available functions: {}",
                available.join(", ")
            );
            warn!(function = %name, "tool call for unknown function");
            if let Some(obs) = observer {
                obs.on_tool_call_error(&id, name, &text).await;
            }
            ToolCallResult::new(id.clone(), text)
        }
        Some(handler) => match handler(call.function_args.clone()).await {
            Ok(HandlerOutput::Text(text)) => {
                debug!(function = %name, "tool call succeeded");
                ToolCallResult::new(id.clone(), text)
            }
            Ok(HandlerOutput::Result(mut full)) => {
                full.tool_call_id = Some(id.clone());
                full
            }
            Err(e) => {
                let text = format!("Error executing function: {e}");
                warn!(function = %name, error = %e, "tool call failed");
                if let Some(obs) = observer {
                    obs.on_tool_call_error(&id, name, &text).await;
                }
                ToolCallResult::new(id.clone(), text)
            }
        },
    };

    if let Some(obs) = observer {
        obs.on_tool_result_available(&id, &result).await;
    }
    result
}

/// Execute every call in a `ToolsCall` message and return one
/// `ToolsCallResult` message.
///
/// Results are in the order of the input call sequence regardless of which
/// handler finishes first.  The correlation header of the input carries over
/// to the output; role is `Tool` and `from_agent` the empty string.
pub async fn execute_tools(
    calls_message: &Message,
    functions: &FunctionMap,
    observer: Option<&dyn ToolCallObserver>,
    cancel: &CancelToken,
) -> Result<Message> {
    let calls = calls_message
        .tool_calls_slice()
        .ok_or_else(|| PipelineError::ArgumentInvalid("expected a ToolsCall message".into()))?;
    cancel.check()?;

    let futures: Vec<_> = calls
        .iter()
        .map(|call| execute_call(call, functions, observer))
        .collect();
    let joined = futures::future::join_all(futures);

    let results = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        results = joined => results,
    };

    Ok(Message::tool_results(results)
        .with_header_from(calls_message)
        .with_from_agent(""))
}
