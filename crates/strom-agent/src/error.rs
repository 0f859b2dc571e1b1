// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Failure taxonomy for the pipeline.
///
/// Tool execution failures are deliberately absent: they surface as error
/// text inside a `ToolCallResult`, never as an error value, so a failing
/// tool does not abort the stream it belongs to.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Cooperative abort.  Always propagates; middleware must never convert
    /// it into another kind.
    #[error("operation cancelled")]
    Cancelled,

    /// Programmer error — an aggregate/composite message reached a path that
    /// only accepts singular variants, or similar contract breakage.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// Null/empty required input, contract without a handler, and similar
    /// caller mistakes.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    /// The natural tool-use parser could not produce a valid call and no
    /// fallback succeeded.  Inner failures are folded into the message.
    #[error("tool-use parsing failed: {0}")]
    ToolUseParsing(String),

    /// Any failure reported by an inner agent; passed through except where a
    /// middleware explicitly catches it (caching stores nothing, model
    /// fallback tries the next candidate).
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

impl PipelineError {
    /// Wrap an arbitrary failure as a tool-use parsing error, preserving the
    /// inner description.
    pub fn tool_use_parsing(message: impl Into<String>) -> Self {
        Self::ToolUseParsing(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
