// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical JSON rendering.
//!
//! One shared, deterministic serialization is used wherever messages are
//! hashed or persisted: object keys are emitted in sorted order at every
//! nesting level, so the same logical input always produces the same bytes.

use serde::Serialize;
use serde_json::{Map, Value};

/// Serialize `value` to canonical JSON text (recursively key-sorted).
pub fn canonical_string<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let v = serde_json::to_value(value)?;
    Ok(sort_value(v).to_string())
}

fn sort_value(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> = map
                .into_iter()
                .map(|(k, v)| (k, sort_value(v)))
                .collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}
