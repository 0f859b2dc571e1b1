// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strom_message::FunctionContract;

/// JSON Schema configuration for structured outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchemaConfig {
    /// Name for the schema (used for reference).
    pub name: String,
    /// Whether to strictly enforce the schema.
    #[serde(default)]
    pub strict: bool,
    /// The actual JSON Schema definition.
    pub schema: Value,
}

/// Response format requested from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { json_schema: JsonSchemaConfig },
}

impl ResponseFormat {
    pub fn text() -> Self {
        Self::Text
    }

    pub fn json_object() -> Self {
        Self::JsonObject
    }

    pub fn json_schema(name: impl Into<String>, strict: bool, schema: Value) -> Self {
        Self::JsonSchema {
            json_schema: JsonSchemaConfig {
                name: name.into(),
                strict,
                schema,
            },
        }
    }
}

/// Options accompanying one generate call.
///
/// Provider-specific knobs that the core does not interpret travel in
/// `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionContract>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl GenerateOptions {
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_functions(mut self, functions: Vec<FunctionContract>) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Merge `overrides` on top of `self`: any field the override sets wins,
    /// `extra` merges key-wise (override entries win), and `functions` are
    /// unioned by name with override contracts replacing same-named ones.
    pub fn merged_with(&self, overrides: &GenerateOptions) -> GenerateOptions {
        let mut out = self.clone();
        if overrides.model_id.is_some() {
            out.model_id = overrides.model_id.clone();
        }
        if overrides.thread_id.is_some() {
            out.thread_id = overrides.thread_id.clone();
        }
        if overrides.run_id.is_some() {
            out.run_id = overrides.run_id.clone();
        }
        if overrides.response_format.is_some() {
            out.response_format = overrides.response_format.clone();
        }
        if overrides.temperature.is_some() {
            out.temperature = overrides.temperature;
        }
        if overrides.max_tokens.is_some() {
            out.max_tokens = overrides.max_tokens;
        }
        if let Some(fns) = &overrides.functions {
            out.functions = Some(union_functions(out.functions.take(), fns));
        }
        for (k, v) in &overrides.extra {
            out.extra.insert(k.clone(), v.clone());
        }
        out
    }

    /// Union `additional` contracts into `options.functions`, keeping
    /// existing same-named contracts (first writer wins).
    pub fn add_functions(&mut self, additional: &[FunctionContract]) {
        let mut merged = self.functions.take().unwrap_or_default();
        for contract in additional {
            if !merged.iter().any(|c| c.name == contract.name) {
                merged.push(contract.clone());
            }
        }
        self.functions = Some(merged);
    }
}

fn union_functions(
    base: Option<Vec<FunctionContract>>,
    overrides: &[FunctionContract],
) -> Vec<FunctionContract> {
    let mut out = base.unwrap_or_default();
    for contract in overrides {
        if let Some(existing) = out.iter_mut().find(|c| c.name == contract.name) {
            *existing = contract.clone();
        } else {
            out.push(contract.clone());
        }
    }
    out
}
