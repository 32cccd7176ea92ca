//! Message headers and trace-context propagation.
//!
//! Trace context travels as a W3C-style `traceparent` header value so spans
//! on both sides of the bus can be joined by the observability layer.

use std::collections::HashMap;
use uuid::Uuid;

pub const TRACEPARENT_HEADER: &str = "traceparent";

/// String key/value headers attached to every bus message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An opaque trace context carried across the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// `00-<trace-id>-<span-id>-01` in the W3C traceparent layout.
    pub traceparent: String,
}

impl TraceContext {
    /// Start a fresh trace rooted at this process.
    pub fn new() -> Self {
        let trace_id = Uuid::new_v4().simple().to_string();
        let span_seed = Uuid::new_v4().simple().to_string();
        Self { traceparent: format!("00-{}-{}-01", trace_id, &span_seed[..16]) }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the trace context into outgoing message headers.
pub fn inject_trace_context(ctx: &TraceContext, headers: &mut Headers) {
    headers.insert(TRACEPARENT_HEADER, ctx.traceparent.clone());
}

/// Read the trace context from incoming message headers, if present.
pub fn extract_trace_context(headers: &Headers) -> Option<TraceContext> {
    headers
        .get(TRACEPARENT_HEADER)
        .map(|v| TraceContext { traceparent: v.to_owned() })
}
