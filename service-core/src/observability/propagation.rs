//! W3C trace context propagation for outbound service calls.
//!
//! Upstream collaborators (order workflow, telco gateway) are plain HTTP APIs, so
//! the current span's context travels as `traceparent` plus our `x-request-id`.

use opentelemetry::trace::TraceContextExt;
use reqwest::header::HeaderMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Format the current span as a `traceparent` value, if it belongs to a valid trace.
pub fn current_traceparent() -> Option<String> {
    let context = Span::current().context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if !span_context.is_valid() {
        return None;
    }

    Some(format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    ))
}

/// Add `traceparent` (when tracing is active) and an optional request id.
pub fn inject_trace_headers(headers: &mut HeaderMap, request_id: Option<&str>) {
    if let Some(traceparent) = current_traceparent()
        && let Ok(value) = traceparent.parse()
    {
        headers.insert(TRACEPARENT_HEADER, value);
    }

    if let Some(id) = request_id
        && let Ok(value) = id.parse()
    {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

/// Request builders that carry the caller's trace context.
pub trait TracedClientExt {
    fn traced_get(&self, url: &str) -> reqwest::RequestBuilder;
    fn traced_post(&self, url: &str) -> reqwest::RequestBuilder;
}

fn traced_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let request_id = uuid::Uuid::new_v4().to_string();
    inject_trace_headers(&mut headers, Some(&request_id));
    headers
}

impl TracedClientExt for reqwest::Client {
    fn traced_get(&self, url: &str) -> reqwest::RequestBuilder {
        self.get(url).headers(traced_headers())
    }

    fn traced_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.post(url).headers(traced_headers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_traceparent_without_active_span() {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, None);
        assert!(headers.get(TRACEPARENT_HEADER).is_none());
    }

    #[test]
    fn request_id_is_injected() {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, Some("abc-123"));
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "abc-123");
    }
}
