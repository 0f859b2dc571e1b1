// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Function registry: turns a set of providers into a filtered, deconflicted
//! function set.
//!
//! `build()` runs five phases: collect → filter → resolve conflicts →
//! detect collisions / prefix → emit.  The registry is configured
//! single-threaded at startup and treated as read-only afterwards.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use strom_message::FunctionContract;

use crate::descriptor::{FunctionDescriptor, FunctionMap, FunctionProvider};
use crate::sanitize::{
    is_valid_prefix, prefixed_name, sanitize_name, sanitize_prefix, MAX_PREFIX_LEN,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("conflicting descriptors for key '{0}' and resolution policy forbids a winner")]
    Conflict(String),
    #[error("invalid registry configuration: {0}")]
    InvalidConfiguration(String),
}

/// How to pick a winner when several descriptors share one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Refuse to build.
    #[default]
    Throw,
    TakeFirst,
    TakeLast,
    /// Prefer descriptors whose contract has `class_name` set (functions
    /// sourced from a structured tool server).
    PreferMcp,
    /// Prefer descriptors without `class_name`.
    PreferNatural,
    /// Only explicitly-registered descriptors may win; anything else throws.
    RequireExplicit,
}

/// Custom tie-breaker: given the key and the conflicting descriptors (in
/// collection order), return the index of the winner.
pub type ConflictHandler = dyn Fn(&str, &[FunctionDescriptor]) -> usize + Send + Sync;

/// Filtering configuration.  Patterns support `*` and `?` wildcards and are
/// matched against the descriptor key.
#[derive(Debug, Clone, Default)]
pub struct FunctionFilter {
    pub enabled: bool,
    /// Providers whose descriptors are dropped wholesale.
    pub disabled_providers: Vec<String>,
    /// Per-provider block patterns.
    pub provider_block_lists: HashMap<String, Vec<String>>,
    /// Per-provider allow patterns (when present, everything else from that
    /// provider is rejected).
    pub provider_allow_lists: HashMap<String, Vec<String>>,
    pub global_block_list: Vec<String>,
    pub global_allow_list: Vec<String>,
}

/// One rejected descriptor and why.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub key: String,
    pub provider: String,
    pub reason: String,
}

/// Output of a successful `build()`.
pub struct BuiltRegistry {
    /// Final contracts, in deterministic collection order, renamed where
    /// collision prefixing applied.
    pub contracts: Vec<FunctionContract>,
    /// Registered name → handler.
    pub handlers: FunctionMap,
    /// Descriptors rejected by filtering, with reasons.
    pub rejected: Vec<FilterDecision>,
}

impl std::fmt::Debug for BuiltRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltRegistry")
            .field("contracts", &self.contracts)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("rejected", &self.rejected)
            .finish()
    }
}

pub struct FunctionRegistry {
    providers: Vec<FunctionProvider>,
    explicit: Vec<FunctionDescriptor>,
    filter: Option<FunctionFilter>,
    conflict_resolution: ConflictResolution,
    conflict_handler: Option<Box<ConflictHandler>>,
    use_prefix_only_for_collisions: bool,
    custom_prefix: Option<String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            explicit: Vec::new(),
            filter: None,
            conflict_resolution: ConflictResolution::default(),
            conflict_handler: None,
            use_prefix_only_for_collisions: true,
            custom_prefix: None,
        }
    }

    pub fn add_provider(mut self, provider: FunctionProvider) -> Self {
        self.providers.push(provider);
        self
    }

    /// Register a descriptor directly.  Explicit descriptors always win
    /// conflicts against provider-sourced ones.
    pub fn add_function(mut self, descriptor: FunctionDescriptor) -> Self {
        self.explicit.push(descriptor);
        self
    }

    pub fn with_filter(mut self, filter: FunctionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    pub fn with_conflict_handler(mut self, handler: Box<ConflictHandler>) -> Self {
        self.conflict_handler = Some(handler);
        self
    }

    /// When false, *every* registered name is prefixed with its provider
    /// name (or the custom prefix), not only colliding ones.
    pub fn use_prefix_only_for_collisions(mut self, only_collisions: bool) -> Self {
        self.use_prefix_only_for_collisions = only_collisions;
        self
    }

    pub fn with_custom_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.custom_prefix = Some(prefix.into());
        self
    }

    /// Dry-run: list configuration issues without building.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if let Some(prefix) = &self.custom_prefix {
            if !is_valid_prefix(prefix) {
                issues.push(format!(
                    "custom prefix '{prefix}' does not match ^[A-Za-z0-9_-]{{1,{MAX_PREFIX_LEN}}}$"
                ));
            }
        }
        if !self.use_prefix_only_for_collisions && self.custom_prefix.is_none() {
            for p in &self.providers {
                if !is_valid_prefix(&p.provider_name) {
                    issues.push(format!(
                        "provider name '{}' is not usable as a prefix when prefixing all functions",
                        p.provider_name
                    ));
                }
            }
        }
        issues
    }

    pub fn build(&self) -> Result<BuiltRegistry, RegistryError> {
        // Phase 1: collect in deterministic order — providers by ascending
        // priority (stable), then explicit descriptors.
        let mut provider_order: Vec<&FunctionProvider> = self.providers.iter().collect();
        provider_order.sort_by_key(|p| p.priority);
        let mut collected: Vec<(FunctionDescriptor, bool)> = Vec::new();
        for provider in provider_order {
            for d in &provider.descriptors {
                collected.push((d.clone(), false));
            }
        }
        for d in &self.explicit {
            collected.push((d.clone(), true));
        }

        // Phase 2: filtering.
        let mut rejected = Vec::new();
        let surviving: Vec<(FunctionDescriptor, bool)> = match &self.filter {
            Some(filter) if filter.enabled => {
                let mut keep = Vec::new();
                for (d, explicit) in collected {
                    match filter_reason(filter, &d) {
                        Some(reason) => rejected.push(FilterDecision {
                            key: d.key(),
                            provider: d.provider_name.clone(),
                            reason,
                        }),
                        None => keep.push((d, explicit)),
                    }
                }
                keep
            }
            _ => collected,
        };

        // Phase 3: conflict resolution, preserving first-seen order.
        //
        // Groups normally form on the descriptor key.  PreferMcp and
        // PreferNatural arbitrate between classed and natural variants of
        // the same *name* — which by construction have different keys — so
        // those two policies group by contract name instead.
        let group_by_name = matches!(
            self.conflict_resolution,
            ConflictResolution::PreferMcp | ConflictResolution::PreferNatural
        );
        let mut group_index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<(FunctionDescriptor, bool)>)> = Vec::new();
        for (d, explicit) in surviving {
            let key = if group_by_name {
                d.contract.name.clone()
            } else {
                d.key()
            };
            match group_index.get(&key) {
                Some(&i) => groups[i].1.push((d, explicit)),
                None => {
                    group_index.insert(key.clone(), groups.len());
                    groups.push((key, vec![(d, explicit)]));
                }
            }
        }

        let mut resolved: Vec<FunctionDescriptor> = Vec::new();
        for (key, group) in groups {
            if group.len() == 1 {
                resolved.push(group.into_iter().next().unwrap().0);
                continue;
            }
            resolved.push(self.resolve_group(&key, group)?);
        }

        // Phase 4: collision detection by contract name.
        let mut name_counts: HashMap<&str, usize> = HashMap::new();
        for d in &resolved {
            *name_counts.entry(d.contract.name.as_str()).or_insert(0) += 1;
        }

        let mut contracts = Vec::with_capacity(resolved.len());
        let mut handlers = FunctionMap::new();
        for d in &resolved {
            let base = sanitize_name(&d.contract.name);
            let collides = name_counts[d.contract.name.as_str()] > 1;
            let registered = if collides || !self.use_prefix_only_for_collisions {
                let raw_prefix = self
                    .custom_prefix
                    .clone()
                    .unwrap_or_else(|| d.provider_name.clone());
                let prefix = sanitize_prefix(&raw_prefix);
                if prefix.len() > MAX_PREFIX_LEN {
                    warn!(prefix = %prefix, "collision prefix exceeds {MAX_PREFIX_LEN} characters");
                }
                prefixed_name(&prefix, &base)
            } else {
                base
            };

            let mut contract = d.contract.clone();
            contract.name = registered.clone();
            contracts.push(contract);
            handlers.insert(registered, d.handler.clone());
        }

        Ok(BuiltRegistry {
            contracts,
            handlers,
            rejected,
        })
    }

    fn resolve_group(
        &self,
        key: &str,
        group: Vec<(FunctionDescriptor, bool)>,
    ) -> Result<FunctionDescriptor, RegistryError> {
        // Explicit descriptors always win; the last-registered explicit one
        // takes precedence among themselves.
        if let Some((d, _)) = group.iter().rev().find(|(_, explicit)| *explicit) {
            return Ok(d.clone());
        }

        let descriptors: Vec<FunctionDescriptor> =
            group.into_iter().map(|(d, _)| d).collect();
        if let Some(handler) = &self.conflict_handler {
            let i = handler(key, &descriptors).min(descriptors.len() - 1);
            return Ok(descriptors[i].clone());
        }

        let chosen = match self.conflict_resolution {
            ConflictResolution::Throw | ConflictResolution::RequireExplicit => {
                return Err(RegistryError::Conflict(key.to_string()));
            }
            ConflictResolution::TakeFirst => descriptors.first(),
            ConflictResolution::TakeLast => descriptors.last(),
            ConflictResolution::PreferMcp => descriptors
                .iter()
                .find(|d| d.contract.class_name.is_some())
                .or_else(|| descriptors.first()),
            ConflictResolution::PreferNatural => descriptors
                .iter()
                .find(|d| d.contract.class_name.is_none())
                .or_else(|| descriptors.first()),
        };
        Ok(chosen.expect("non-empty group").clone())
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Filtering helpers ────────────────────────────────────────────────────────

/// Returns the rejection reason, or `None` when the descriptor survives.
/// Order: provider-disabled → provider block → provider allow → global block
/// → global allow.
fn filter_reason(filter: &FunctionFilter, d: &FunctionDescriptor) -> Option<String> {
    let key = d.key();
    if filter
        .disabled_providers
        .iter()
        .any(|p| p == &d.provider_name)
    {
        return Some(format!("provider '{}' is disabled", d.provider_name));
    }
    if let Some(patterns) = filter.provider_block_lists.get(&d.provider_name) {
        if let Some(p) = first_match(patterns, &key) {
            return Some(format!("blocked by provider pattern '{p}'"));
        }
    }
    if let Some(patterns) = filter.provider_allow_lists.get(&d.provider_name) {
        if first_match(patterns, &key).is_none() {
            return Some(format!(
                "not on provider '{}' allow list",
                d.provider_name
            ));
        }
    }
    if let Some(p) = first_match(&filter.global_block_list, &key) {
        return Some(format!("blocked by global pattern '{p}'"));
    }
    if !filter.global_allow_list.is_empty()
        && first_match(&filter.global_allow_list, &key).is_none()
    {
        return Some("not on global allow list".to_string());
    }
    None
}

fn first_match<'a>(patterns: &'a [String], key: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| wildcard_matches(p, key))
        .map(String::as_str)
}

/// `*` matches any run, `?` a single character; everything else is literal.
fn wildcard_matches(pattern: &str, key: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map(|r| r.is_match(key)).unwrap_or(false)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{handler, HandlerOutput};
    use std::sync::Arc;

    fn noop() -> Arc<crate::descriptor::FunctionHandler> {
        handler(|_args| async move { Ok(HandlerOutput::Text("{}".into())) })
    }

    fn descriptor(name: &str) -> FunctionDescriptor {
        FunctionDescriptor::new(FunctionContract::new(name, ""), noop(), "unset")
    }

    fn mcp_descriptor(name: &str, class: &str) -> FunctionDescriptor {
        FunctionDescriptor::new(
            FunctionContract::new(name, "").with_class_name(class),
            noop(),
            "unset",
        )
    }

    fn provider(name: &str, priority: i32, descriptors: Vec<FunctionDescriptor>) -> FunctionProvider {
        descriptors
            .into_iter()
            .fold(FunctionProvider::new(name, priority), |p, d| {
                p.with_descriptor(d)
            })
    }

    #[test]
    fn providers_collect_by_ascending_priority() {
        let built = FunctionRegistry::new()
            .add_provider(provider("late", 20, vec![descriptor("b")]))
            .add_provider(provider("early", 10, vec![descriptor("a")]))
            .build()
            .unwrap();
        let names: Vec<&str> = built.contracts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn prefer_mcp_resolves_classed_vs_natural_by_name() {
        // Provider A exposes a classed `foo`, provider B a natural one.
        // PreferMcp groups them by name and the classed descriptor wins,
        // registered without any collision prefix.
        let built = FunctionRegistry::new()
            .add_provider(provider("a", 10, vec![mcp_descriptor("foo", "mcp")]))
            .add_provider(provider("b", 20, vec![descriptor("foo")]))
            .with_conflict_resolution(ConflictResolution::PreferMcp)
            .build()
            .unwrap();
        assert_eq!(built.contracts.len(), 1);
        assert_eq!(built.contracts[0].name, "foo");
        assert_eq!(built.contracts[0].class_name.as_deref(), Some("mcp"));
    }

    #[test]
    fn prefer_natural_resolves_to_unclassed_descriptor() {
        let built = FunctionRegistry::new()
            .add_provider(provider("a", 10, vec![mcp_descriptor("foo", "mcp")]))
            .add_provider(provider("b", 20, vec![descriptor("foo")]))
            .with_conflict_resolution(ConflictResolution::PreferNatural)
            .build()
            .unwrap();
        assert_eq!(built.contracts.len(), 1);
        assert!(built.contracts[0].class_name.is_none());
    }

    #[test]
    fn prefer_mcp_falls_back_to_first_when_nobody_is_classed() {
        let built = FunctionRegistry::new()
            .add_provider(provider("a", 10, vec![descriptor("foo")]))
            .add_provider(provider("b", 20, vec![descriptor("foo")]))
            .with_conflict_resolution(ConflictResolution::PreferMcp)
            .build()
            .unwrap();
        assert_eq!(built.contracts.len(), 1);
        assert_eq!(built.handlers.len(), 1);
    }

    #[test]
    fn throw_policy_rejects_conflicts() {
        let err = FunctionRegistry::new()
            .add_provider(provider("a", 10, vec![descriptor("foo")]))
            .add_provider(provider("b", 20, vec![descriptor("foo")]))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(k) if k == "foo"));
    }

    #[test]
    fn explicit_descriptor_beats_providers_under_any_policy() {
        let mut exp = descriptor("foo");
        exp.contract.description = "explicit".into();
        let built = FunctionRegistry::new()
            .add_provider(provider("a", 10, vec![descriptor("foo")]))
            .add_function(exp)
            .with_conflict_resolution(ConflictResolution::RequireExplicit)
            .build()
            .unwrap();
        assert_eq!(built.contracts.len(), 1);
        assert_eq!(built.contracts[0].description, "explicit");
    }

    #[test]
    fn conflict_handler_picks_winner() {
        let built = FunctionRegistry::new()
            .add_provider(provider("a", 10, vec![descriptor("foo")]))
            .add_provider(provider("b", 20, vec![descriptor("foo")]))
            .with_conflict_handler(Box::new(|_key, group| group.len() - 1))
            .build()
            .unwrap();
        assert_eq!(built.contracts.len(), 1);
    }

    #[test]
    fn collision_prefixes_only_colliding_names() {
        // Classed vs natural 'foo' have different keys, so both survive
        // resolution and collide on the registered name.
        let built = FunctionRegistry::new()
            .add_provider(provider("provA", 10, vec![mcp_descriptor("foo", "srv")]))
            .add_provider(provider("provB", 20, vec![descriptor("foo"), descriptor("bar")]))
            .build()
            .unwrap();
        let names: Vec<&str> = built.contracts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["provA-foo", "provB-foo", "bar"]);
        assert!(built.handlers.contains_key("provA-foo"));
        assert!(built.handlers.contains_key("provB-foo"));
        assert!(built.handlers.contains_key("bar"));
    }

    #[test]
    fn prefix_all_when_configured() {
        let built = FunctionRegistry::new()
            .add_provider(provider("p1", 10, vec![descriptor("a"), descriptor("b")]))
            .use_prefix_only_for_collisions(false)
            .build()
            .unwrap();
        let names: Vec<&str> = built.contracts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["p1-a", "p1-b"]);
    }

    #[test]
    fn custom_prefix_overrides_provider_name() {
        let built = FunctionRegistry::new()
            .add_provider(provider("p1", 10, vec![descriptor("a")]))
            .use_prefix_only_for_collisions(false)
            .with_custom_prefix("mine")
            .build()
            .unwrap();
        assert_eq!(built.contracts[0].name, "mine-a");
    }

    #[test]
    fn names_are_sanitized_on_registration() {
        let built = FunctionRegistry::new()
            .add_provider(provider("p one", 10, vec![descriptor("my tool!")]))
            .use_prefix_only_for_collisions(false)
            .build()
            .unwrap();
        assert_eq!(built.contracts[0].name, "p_one-my_tool_");
        assert!(built.handlers.contains_key("p_one-my_tool_"));
    }

    #[test]
    fn filtering_runs_in_documented_order() {
        let mut filter = FunctionFilter {
            enabled: true,
            ..Default::default()
        };
        filter.disabled_providers.push("dead".into());
        filter
            .provider_block_lists
            .insert("p".into(), vec!["secret_*".into()]);
        filter
            .provider_allow_lists
            .insert("p".into(), vec!["tool_?".into()]);
        filter.global_block_list.push("tool_x".into());

        let built = FunctionRegistry::new()
            .add_provider(provider("dead", 5, vec![descriptor("anything")]))
            .add_provider(provider(
                "p",
                10,
                vec![
                    descriptor("secret_key"),
                    descriptor("tool_a"),
                    descriptor("tool_x"),
                    descriptor("other"),
                ],
            ))
            .with_filter(filter)
            .build()
            .unwrap();

        let names: Vec<&str> = built.contracts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tool_a"]);
        let reasons: Vec<&str> = built.rejected.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(built.rejected.len(), 4);
        assert!(reasons[0].contains("disabled"));
        assert!(reasons[1].contains("provider pattern"));
        assert!(reasons.iter().any(|r| r.contains("allow list")));
        assert!(reasons.iter().any(|r| r.contains("global pattern")));
    }

    #[test]
    fn disabled_filter_is_a_no_op() {
        let filter = FunctionFilter {
            enabled: false,
            global_block_list: vec!["*".into()],
            ..Default::default()
        };
        let built = FunctionRegistry::new()
            .add_provider(provider("p", 10, vec![descriptor("a")]))
            .with_filter(filter)
            .build()
            .unwrap();
        assert_eq!(built.contracts.len(), 1);
    }

    #[test]
    fn build_is_deterministic() {
        let make = || {
            FunctionRegistry::new()
                .add_provider(provider("b", 20, vec![descriptor("x"), descriptor("y")]))
                .add_provider(provider("a", 10, vec![descriptor("z")]))
                .with_conflict_resolution(ConflictResolution::TakeFirst)
                .build()
                .unwrap()
        };
        let one: Vec<String> = make().contracts.into_iter().map(|c| c.name).collect();
        let two: Vec<String> = make().contracts.into_iter().map(|c| c.name).collect();
        assert_eq!(one, two);
        assert_eq!(one, vec!["z", "x", "y"]);
    }

    #[test]
    fn validate_reports_bad_custom_prefix() {
        let issues = FunctionRegistry::new()
            .with_custom_prefix("has space")
            .validate();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("custom prefix"));
    }

    #[test]
    fn validate_reports_unusable_provider_names_when_prefixing_all() {
        let issues = FunctionRegistry::new()
            .add_provider(provider("bad name!", 10, vec![descriptor("a")]))
            .use_prefix_only_for_collisions(false)
            .validate();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("bad name!"));
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_matches("get_*", "get_weather"));
        assert!(wildcard_matches("tool_?", "tool_a"));
        assert!(!wildcard_matches("tool_?", "tool_ab"));
        assert!(wildcard_matches("*", "anything"));
        assert!(!wildcard_matches("get_*", "fetch_weather"));
    }
}
