// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON fragment updates: enrich streamed tool-call deltas with
//! JSON-path-level events produced by an incremental scanner.
//!
//! One generator is kept per in-flight tool call (keyed by id, then index,
//! then function name) so interleaved deltas from parallel calls do not
//! corrupt each other's parse state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use strom_agent::{
    Agent, CancelToken, InvocationContext, MessageStream, Middleware, Result, StreamingAgent,
    StreamingMiddleware,
};
use strom_message::{JsonFragmentKind, JsonFragmentUpdate, Message, MessageBody, ToolCallUpdate};

// ─── Incremental scanner ──────────────────────────────────────────────────────

enum Frame {
    Object { key: Option<String> },
    Array { index: usize },
}

enum Lex {
    /// Expecting a value.
    Value,
    /// Inside an object, expecting a key or `}`.
    KeyOrEnd,
    InKey { buf: String, escape: bool },
    /// Key read, expecting `:`.
    AfterKey,
    InString { buf: String, escape: bool },
    InScalar { buf: String },
    /// Value finished, expecting `,` or a closer.
    AfterValue,
}

/// Incremental JSON tokenizer that turns argument fragments into path-level
/// mutation events.  Feeding is cheap and never fails: malformed input
/// simply stops producing events.
pub struct JsonFragmentGenerator {
    frames: Vec<Frame>,
    lex: Lex,
    /// Text appended to the current string value during this feed.
    chunk: String,
}

impl JsonFragmentGenerator {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            lex: Lex::Value,
            chunk: String::new(),
        }
    }

    /// Dotted path of the value position currently being read.
    fn current_path(&self) -> String {
        let mut out = String::new();
        for f in &self.frames {
            match f {
                Frame::Object { key: Some(k) } => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(k);
                }
                Frame::Object { key: None } => {}
                Frame::Array { index } => {
                    out.push_str(&format!("[{index}]"));
                }
            }
        }
        out
    }

    /// A value at the current position is complete: forget the key that
    /// addressed it.  Array indices bump on `,`, not here.
    fn value_done(&mut self) {
        if let Some(Frame::Object { key }) = self.frames.last_mut() {
            *key = None;
        }
        self.lex = Lex::AfterValue;
    }

    fn close_container(&mut self, events: &mut Vec<JsonFragmentUpdate>) {
        let kind = match self.frames.pop() {
            Some(Frame::Object { .. }) => JsonFragmentKind::EndObject,
            Some(Frame::Array { .. }) => JsonFragmentKind::EndArray,
            None => return,
        };
        events.push(JsonFragmentUpdate {
            path: self.current_path(),
            kind,
            value: None,
        });
        self.value_done();
    }

    /// Process one fragment of argument text and return the events it
    /// produced.
    pub fn feed(&mut self, fragment: &str) -> Vec<JsonFragmentUpdate> {
        let mut events = Vec::new();
        for c in fragment.chars() {
            self.step(c, &mut events);
        }
        // A string still open at the end of the fragment reports the text
        // appended so far.
        if matches!(self.lex, Lex::InString { .. }) && !self.chunk.is_empty() {
            events.push(JsonFragmentUpdate {
                path: self.current_path(),
                kind: JsonFragmentKind::PartialString,
                value: Some(std::mem::take(&mut self.chunk)),
            });
        }
        events
    }

    fn step(&mut self, c: char, events: &mut Vec<JsonFragmentUpdate>) {
        match &mut self.lex {
            Lex::Value => match c {
                c if c.is_whitespace() => {}
                '{' => {
                    events.push(JsonFragmentUpdate {
                        path: self.current_path(),
                        kind: JsonFragmentKind::StartObject,
                        value: None,
                    });
                    self.frames.push(Frame::Object { key: None });
                    self.lex = Lex::KeyOrEnd;
                }
                '[' => {
                    events.push(JsonFragmentUpdate {
                        path: self.current_path(),
                        kind: JsonFragmentKind::StartArray,
                        value: None,
                    });
                    self.frames.push(Frame::Array { index: 0 });
                    self.lex = Lex::Value;
                }
                ']' => self.close_container(events),
                '"' => {
                    self.chunk.clear();
                    self.lex = Lex::InString {
                        buf: String::new(),
                        escape: false,
                    };
                }
                other => {
                    self.lex = Lex::InScalar {
                        buf: other.to_string(),
                    };
                }
            },
            Lex::KeyOrEnd => match c {
                c if c.is_whitespace() => {}
                '"' => {
                    self.lex = Lex::InKey {
                        buf: String::new(),
                        escape: false,
                    };
                }
                '}' => self.close_container(events),
                _ => {}
            },
            Lex::InKey { buf, escape } => {
                if *escape {
                    buf.push('\\');
                    buf.push(c);
                    *escape = false;
                } else if c == '\\' {
                    *escape = true;
                } else if c == '"' {
                    let key = std::mem::take(buf);
                    if let Some(Frame::Object { key: slot }) = self.frames.last_mut() {
                        *slot = Some(key);
                    }
                    self.lex = Lex::AfterKey;
                } else {
                    buf.push(c);
                }
            }
            Lex::AfterKey => {
                if c == ':' {
                    self.lex = Lex::Value;
                }
            }
            Lex::InString { buf, escape } => {
                if *escape {
                    buf.push('\\');
                    buf.push(c);
                    self.chunk.push('\\');
                    self.chunk.push(c);
                    *escape = false;
                } else if c == '\\' {
                    *escape = true;
                } else if c == '"' {
                    let value = std::mem::take(buf);
                    self.chunk.clear();
                    events.push(JsonFragmentUpdate {
                        path: self.current_path(),
                        kind: JsonFragmentKind::CompleteValue,
                        value: Some(value),
                    });
                    self.value_done();
                } else {
                    buf.push(c);
                    self.chunk.push(c);
                }
            }
            Lex::InScalar { buf } => {
                if c == ',' || c == '}' || c == ']' || c.is_whitespace() {
                    let value = std::mem::take(buf);
                    events.push(JsonFragmentUpdate {
                        path: self.current_path(),
                        kind: JsonFragmentKind::CompleteValue,
                        value: Some(value),
                    });
                    self.value_done();
                    // Reprocess the delimiter in the AfterValue state.
                    self.step(c, events);
                } else {
                    buf.push(c);
                }
            }
            Lex::AfterValue => match c {
                c if c.is_whitespace() => {}
                ',' => match self.frames.last_mut() {
                    Some(Frame::Array { index }) => {
                        *index += 1;
                        self.lex = Lex::Value;
                    }
                    Some(Frame::Object { .. }) => {
                        self.lex = Lex::KeyOrEnd;
                    }
                    None => {}
                },
                '}' | ']' => self.close_container(events),
                _ => {}
            },
        }
    }
}

impl Default for JsonFragmentGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Middleware ───────────────────────────────────────────────────────────────

pub struct JsonFragmentUpdateMiddleware {
    generators: Arc<Mutex<HashMap<String, JsonFragmentGenerator>>>,
}

impl JsonFragmentUpdateMiddleware {
    pub fn new() -> Self {
        Self {
            generators: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drop all per-call parse state.
    pub fn reset(&self) {
        self.generators.lock().unwrap().clear();
    }

    fn generator_key(update: &ToolCallUpdate) -> String {
        if let Some(id) = &update.tool_call_id {
            return format!("id:{id}");
        }
        if let Some(index) = update.index {
            return format!("index:{index}");
        }
        format!(
            "name:{}",
            update.function_name.as_deref().unwrap_or("unknown")
        )
    }

    fn enrich(
        generators: &Mutex<HashMap<String, JsonFragmentGenerator>>,
        mut message: Message,
    ) -> Message {
        if let MessageBody::ToolsCallUpdate { tool_call_updates } = &mut message.body {
            let mut map = generators.lock().unwrap();
            for update in tool_call_updates.iter_mut() {
                let key = Self::generator_key(update);
                let generator = map.entry(key).or_default();
                update.json_fragment_updates = generator.feed(&update.function_args);
            }
        }
        message
    }
}

impl Default for JsonFragmentUpdateMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for JsonFragmentUpdateMiddleware {
    fn name(&self) -> &str {
        "json_fragment_update"
    }

    async fn invoke(
        &self,
        ctx: InvocationContext,
        inner: &dyn Agent,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        let replies = inner.generate(&ctx.messages, &ctx.options, cancel).await?;
        Ok(replies
            .into_iter()
            .map(|m| Self::enrich(&self.generators, m))
            .collect())
    }
}

#[async_trait]
impl StreamingMiddleware for JsonFragmentUpdateMiddleware {
    async fn invoke_stream(
        &self,
        ctx: InvocationContext,
        inner: &dyn StreamingAgent,
        cancel: &CancelToken,
    ) -> Result<MessageStream> {
        let stream = inner
            .generate_stream(&ctx.messages, &ctx.options, cancel)
            .await?;
        let generators = Arc::clone(&self.generators);
        Ok(Box::pin(futures::stream::unfold(
            (stream, generators),
            |(mut stream, generators)| async move {
                let item = stream.next().await?;
                let item = item.map(|m| Self::enrich(&generators, m));
                Some((item, (stream, generators)))
            },
        )))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
