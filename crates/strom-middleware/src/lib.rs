// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The strom middleware set: tool-call orchestration, natural tool-use
//! parsing, stream joining and re-indexing, caching, and the cross-cutting
//! utility interceptors.

mod cache;
mod function_call;
mod json_fragments;
mod model_fallback;
mod natural_tool_use;
mod options_override;
mod persist;
mod todo_context;
mod transform;
mod update_joiner;

pub use cache::{fingerprint, CachingMiddleware, KvStore, MemoryKvStore};
pub use function_call::FunctionCallMiddleware;
pub use json_fragments::{JsonFragmentGenerator, JsonFragmentUpdateMiddleware};
pub use model_fallback::{FallbackRoute, ModelFallbackMiddleware};
pub use natural_tool_use::{NaturalToolUseMiddleware, SchemaValidator};
pub use options_override::OptionsOverrideMiddleware;
pub use persist::{
    MemoryMessageRepository, MemorySessionRepository, MessageRecord, MessageRepository,
    PersistenceMiddleware, SessionRecord, SessionRepository,
};
pub use todo_context::TodoContextMiddleware;
pub use transform::{
    index_stream, reconstruct_aggregates, MessageTransformMiddleware, OrderIndexer,
};
pub use update_joiner::{join_stream, UpdateJoinerMiddleware};
