// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent and middleware abstractions: the bidirectional interception model
//! every strom middleware builds on.

mod agent;
mod cancel;
mod error;
mod middleware;
pub mod mock;
mod options;

pub use agent::{stream_from_messages, Agent, MessageStream, StreamingAgent};
pub use cancel::{CancelSource, CancelToken};
pub use error::{PipelineError, Result};
pub use middleware::{
    cancel_guard, monitor_stream, InvocationContext, Middleware, MiddlewareAgent,
    StreamingMiddleware, WithMiddleware,
};
pub use options::{GenerateOptions, JsonSchemaConfig, ResponseFormat};
