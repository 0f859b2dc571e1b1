// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Function model and registry: descriptors, the tool-call executor, and
//! conflict/collision resolution across providers.

mod descriptor;
mod executor;
mod registry;
pub mod sanitize;

pub use descriptor::{
    handler, FunctionDescriptor, FunctionHandler, FunctionMap, FunctionProvider, HandlerOutput,
};
pub use executor::{execute_call, execute_tools, ToolCallObserver};
pub use registry::{
    BuiltRegistry, ConflictHandler, ConflictResolution, FilterDecision, FunctionFilter,
    FunctionRegistry, RegistryError,
};
