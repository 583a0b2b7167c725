use http::{HeaderMap, HeaderName, HeaderValue, Request};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
};
use tracing::{field::Empty, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::correlation::{self, REQUEST_ID_HEADER};

/// Injects the current [`opentelemetry::Context`] and the current request ID
/// into outbound [`Request`] headers, so the next hop joins the same trace and
/// logs under the same request ID.
pub fn inject_opentelemetry_context_into_request<T>(request: &mut Request<T>) -> &mut Request<T> {
    let context = Span::current().context();

    global::get_text_map_propagator(|injector| {
        injector.inject_context(&context, &mut HeaderInjector::new(request.headers_mut()))
    });

    let request_id = correlation::current_request_id();
    if !request_id.is_empty() && !request.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            request.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }

    request
}

/// Constructs a [`opentelemetry::Context`] from [`Request`] headers
/// and assigns it as parent of the returned request [`Span`].
///
/// The span declares a `request.id` field so the request ID can be attached
/// later, see [`correlation::attach_request_id`].
#[track_caller]
pub fn extract_opentelemetry_context_from_request<T>(request: &Request<T>) -> Span {
    let context = global::get_text_map_propagator(|extractor| {
        extractor.extract(&HeaderExtractor::new(request.headers()))
    });

    let span = tracing::info_span!(
        "request",
        http.method = %request.method(),
        http.target = %request.uri(),
        request.id = Empty,
    );
    span.set_parent(context);

    span
}

// "traceparent" => https://www.w3.org/TR/trace-context/#trace-context-http-headers-format

/// Injector used via opentelemetry propagator to tell the extractor how to
/// insert the "traceparent" header value. Will basically insert a
/// "traceparent" string value "{version}-{trace_id}-{span_id}-{trace_flags}"
/// of the spans context into the headers. Listeners can then re-hydrate the
/// context to add additional spans to the same trace.
struct HeaderInjector<'a> {
    headers: &'a mut HeaderMap,
}

impl<'a> HeaderInjector<'a> {
    pub fn new(headers: &'a mut HeaderMap) -> Self {
        HeaderInjector { headers }
    }
}

impl<'a> Injector for HeaderInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(key) = key.parse::<HeaderName>() else {
            tracing::debug!(%key, "failed to parse header name");
            return;
        };
        let Ok(value) = value.parse() else {
            tracing::debug!(%value, "failed to parse header value");
            return;
        };
        self.headers.insert(key, value);
    }
}

struct HeaderExtractor<'a> {
    headers: &'a HeaderMap,
}

impl<'a> HeaderExtractor<'a> {
    pub fn new(headers: &'a HeaderMap) -> Self {
        HeaderExtractor { headers }
    }
}

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|h| h.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|s| s.as_str()).collect()
    }
}
