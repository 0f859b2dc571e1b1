// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message algebra for the strom pipeline: the closed set of message
//! variants, the builders that coalesce streamed updates, and the canonical
//! serializer shared by caching and persistence.

mod builders;
mod canonical;
mod contract;
mod types;

pub use builders::{
    CallReadyFn, ReasoningBuilder, TextBuilder, ToolCallBuilder, ToolsCallBuilder,
    UsageAccumulator,
};
pub use canonical::canonical_string;
pub use contract::{FunctionContract, ParameterContract};
pub use types::{
    aggregate_is_paired, ContentBlock, JsonFragmentKind, JsonFragmentUpdate, Message,
    MessageBody, ReasoningVisibility, Role, ToolCall, ToolCallResult, ToolCallUpdate, Usage,
};
