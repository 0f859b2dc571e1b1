// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Function-name sanitization.
//!
//! Registered names must match `^[A-Za-z0-9_-]{1,64}$`; prefixes match
//! `^[A-Za-z0-9_-]{1,32}$`.  The separator between prefix and name is `-`.

/// Maximum length of a registered function name.
pub const MAX_NAME_LEN: usize = 64;
/// Length beyond which a prefix draws a warning.
pub const MAX_PREFIX_LEN: usize = 32;

const FALLBACK_NAME: &str = "sanitized_function";

/// True when `name` already satisfies the registered-name grammar.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// True when `prefix` satisfies the prefix grammar.
pub fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= MAX_PREFIX_LEN
        && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Force `raw` into the registered-name grammar:
/// - characters outside `[A-Za-z0-9_-]` become `_`
/// - runs of `_` collapse to one
/// - a leading digit gets a `_` prefix
/// - an empty result becomes `"sanitized_function"`
/// - the result is truncated to 64 characters
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for c in raw.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '-' {
            last_was_underscore = false;
            c
        } else {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
            '_'
        };
        out.push(mapped);
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if out.is_empty() || out.chars().all(|c| c == '_') {
        out = FALLBACK_NAME.to_string();
    }
    out.truncate(MAX_NAME_LEN);
    out
}

/// Sanitize a collision prefix.  Same rules as names but the caller is
/// responsible for warning when the result exceeds [`MAX_PREFIX_LEN`].
pub fn sanitize_prefix(raw: &str) -> String {
    let mut p = sanitize_name(raw);
    p.truncate(MAX_NAME_LEN);
    p
}

/// Join a sanitized prefix and name with `-`, keeping the total within the
/// 64-character budget by trimming the name tail.
pub fn prefixed_name(prefix: &str, name: &str) -> String {
    let mut joined = format!("{prefix}-{name}");
    joined.truncate(MAX_NAME_LEN);
    joined
}
