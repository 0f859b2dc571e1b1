// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! strom — a composable streaming middleware pipeline for language-model
//! agents.
//!
//! A chain is built leaves-first around a provider-backed
//! [`agent::StreamingAgent`]; every middleware wraps the chain built so far
//! and becomes an agent itself:
//!
//! ```ignore
//! let chain = provider
//!     .with(Arc::new(ModelFallbackMiddleware::new(routes)))
//!     .with(Arc::new(MessageTransformMiddleware::new()))
//!     .with(Arc::new(NaturalToolUseMiddleware::new(contracts.clone())))
//!     .with(Arc::new(FunctionCallMiddleware::new(contracts, handlers)?))
//!     .with(Arc::new(UpdateJoinerMiddleware::new()))
//!     .with(Arc::new(CachingMiddleware::new(store)));
//! let stream = chain.generate_stream(&messages, &options, &cancel).await?;
//! ```
//!
//! Requests flow outermost-first; replies stream back through the same
//! chain in reverse, each middleware transforming or aggregating as they
//! pass.

pub use strom_agent as agent;
pub use strom_functions as functions;
pub use strom_message as message;
pub use strom_middleware as middleware;

/// The commonly-needed surface in one import.
pub mod prelude {
    pub use strom_agent::{
        cancel_guard, stream_from_messages, Agent, CancelSource, CancelToken, GenerateOptions,
        InvocationContext, MessageStream, Middleware, PipelineError, ResponseFormat, Result,
        StreamingAgent, StreamingMiddleware, WithMiddleware,
    };
    pub use strom_functions::{
        execute_tools, handler, ConflictResolution, FunctionDescriptor, FunctionFilter,
        FunctionMap, FunctionProvider, FunctionRegistry, HandlerOutput, ToolCallObserver,
    };
    pub use strom_message::{
        ContentBlock, FunctionContract, JsonFragmentKind, JsonFragmentUpdate, Message,
        MessageBody, ParameterContract, ReasoningVisibility, Role, ToolCall, ToolCallResult,
        ToolCallUpdate, Usage,
    };
    pub use strom_middleware::{
        CachingMiddleware, FallbackRoute, FunctionCallMiddleware, JsonFragmentUpdateMiddleware,
        KvStore, MemoryKvStore, MessageTransformMiddleware, ModelFallbackMiddleware,
        NaturalToolUseMiddleware, OptionsOverrideMiddleware, PersistenceMiddleware,
        SchemaValidator, TodoContextMiddleware, UpdateJoinerMiddleware,
    };
}
