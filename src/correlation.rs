//! Correlation state for a single request.
//!
//! The middleware resolves a [`CorrelationIds`] triple once per request and
//! binds a [`Logger`] carrying it. The resulting [`Correlation`] is reachable
//! two ways:
//!
//! - request-scoped, from the request [`Extensions`] (handlers holding the
//!   request): [`get_logger`], [`get_trace_id`], [`get_span_id`],
//!   [`get_request_id`];
//! - context-scoped, from a task-local installed around the handler future
//!   (service and repository code without the request):
//!   [`current_logger`], [`current_trace_id`], [`current_span_id`],
//!   [`current_request_id`].
//!
//! Every accessor degrades to an empty string or to [`logger::fallback`].

use std::future::Future;

use http::{Extensions, HeaderMap};
use opentelemetry::trace::TraceContextExt;
use serde::Serialize;
use tokio::task::futures::TaskLocalFuture;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::logger::{self, Logger};

/// Conventional request ID header.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Span field receiving the request ID.
pub const REQUEST_ID_ATTRIBUTE: &str = "request.id";

tokio::task_local! {
    static CURRENT: Correlation;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationIds {
    pub request_id: String,
    pub trace_id: String,
    pub span_id: String,
}

/// Resolved identifiers plus the logger bound to them.
#[derive(Debug, Clone)]
pub struct Correlation {
    ids: CorrelationIds,
    logger: Logger,
}

impl Correlation {
    pub fn ids(&self) -> &CorrelationIds {
        &self.ids
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

/// Source of the active trace/span identifier pair.
pub trait TraceContextSource: Send + Sync + 'static {
    /// Returns `(trace_id, span_id)` when `span` has a valid span context.
    fn span_ids(&self, span: &Span) -> Option<(String, String)>;
}

/// Reads the OpenTelemetry span context attached to a `tracing` span.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenTelemetrySource;

impl TraceContextSource for OpenTelemetrySource {
    fn span_ids(&self, span: &Span) -> Option<(String, String)> {
        let context = span.context();
        let otel_span = context.span();
        let span_context = otel_span.span_context();
        if !span_context.is_valid() {
            return None;
        }

        Some((
            span_context.trace_id().to_string(),
            span_context.span_id().to_string(),
        ))
    }
}

/// Request ID from the outbound response when one is available, then from
/// the inbound request, else empty.
pub fn resolve_request_id(request: &HeaderMap, response: Option<&HeaderMap>) -> String {
    response
        .and_then(header_value)
        .or_else(|| header_value(request))
        .unwrap_or_default()
}

fn header_value(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn resolve(
    request: &HeaderMap,
    response: Option<&HeaderMap>,
    span: &Span,
    source: &dyn TraceContextSource,
) -> CorrelationIds {
    let (trace_id, span_id) = source.span_ids(span).unwrap_or_default();

    CorrelationIds {
        request_id: resolve_request_id(request, response),
        trace_id,
        span_id,
    }
}

pub fn bind(ids: CorrelationIds, base: &Logger) -> Correlation {
    let logger = base.with_correlation(ids.clone());
    Correlation { ids, logger }
}

/// Records the request ID on `span` when it has a valid span context.
/// Returns whether the attribute was written.
///
/// `tracing` only records declared fields, so the span must have been
/// created with a `request.id` slot (see
/// [`crate::http_injector::extract_opentelemetry_context_from_request`]);
/// otherwise nothing is written and `false` is returned.
pub fn attach_request_id(span: &Span, source: &dyn TraceContextSource, request_id: &str) -> bool {
    if span.field(REQUEST_ID_ATTRIBUTE).is_none() || source.span_ids(span).is_none() {
        return false;
    }
    span.record(REQUEST_ID_ATTRIBUTE, request_id);
    true
}

/// Wraps `future` so it runs with `correlation` as the context-scoped value.
pub fn scope<F: Future>(correlation: Correlation, future: F) -> TaskLocalFuture<Correlation, F> {
    CURRENT.scope(correlation, future)
}

/// Synchronous counterpart of [`scope`].
pub fn sync_scope<T>(correlation: Correlation, f: impl FnOnce() -> T) -> T {
    CURRENT.sync_scope(correlation, f)
}

pub fn get(extensions: &Extensions) -> Option<&Correlation> {
    extensions.get::<Correlation>()
}

pub fn get_logger(extensions: &Extensions) -> Logger {
    get(extensions)
        .map(|correlation| correlation.logger.clone())
        .unwrap_or_else(logger::fallback)
}

pub fn get_trace_id(extensions: &Extensions) -> String {
    get(extensions)
        .map(|correlation| correlation.ids.trace_id.clone())
        .unwrap_or_default()
}

pub fn get_span_id(extensions: &Extensions) -> String {
    get(extensions)
        .map(|correlation| correlation.ids.span_id.clone())
        .unwrap_or_default()
}

pub fn get_request_id(extensions: &Extensions) -> String {
    get(extensions)
        .map(|correlation| correlation.ids.request_id.clone())
        .unwrap_or_default()
}

pub fn current() -> Option<Correlation> {
    CURRENT.try_with(Clone::clone).ok()
}

pub fn current_logger() -> Logger {
    CURRENT
        .try_with(|correlation| correlation.logger.clone())
        .unwrap_or_else(|_| logger::fallback())
}

pub fn current_trace_id() -> String {
    CURRENT
        .try_with(|correlation| correlation.ids.trace_id.clone())
        .unwrap_or_default()
}

pub fn current_span_id() -> String {
    CURRENT
        .try_with(|correlation| correlation.ids.span_id.clone())
        .unwrap_or_default()
}

pub fn current_request_id() -> String {
    CURRENT
        .try_with(|correlation| correlation.ids.request_id.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    struct FixedSource(Option<(&'static str, &'static str)>);

    impl TraceContextSource for FixedSource {
        fn span_ids(&self, _span: &Span) -> Option<(String, String)> {
            self.0.map(|(t, s)| (t.to_string(), s.to_string()))
        }
    }

    fn headers_with_id(id: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static(id));
        headers
    }

    #[test]
    fn response_header_wins_over_request_header() {
        let request = headers_with_id("req-id");
        let response = headers_with_id("resp-id");

        assert_eq!(resolve_request_id(&request, Some(&response)), "resp-id");
        assert_eq!(resolve_request_id(&request, None), "req-id");
        assert_eq!(resolve_request_id(&request, Some(&HeaderMap::new())), "req-id");
    }

    #[test]
    fn missing_request_id_resolves_to_empty() {
        assert_eq!(resolve_request_id(&HeaderMap::new(), None), "");
        assert_eq!(
            resolve_request_id(&HeaderMap::new(), Some(&HeaderMap::new())),
            ""
        );
    }

    #[test]
    fn trace_ids_are_empty_without_a_valid_span() {
        let ids = resolve(
            &headers_with_id("req-id"),
            None,
            &Span::none(),
            &OpenTelemetrySource,
        );
        assert_eq!(ids.trace_id, "");
        assert_eq!(ids.span_id, "");
        assert_eq!(ids.request_id, "req-id");
    }

    #[test]
    fn trace_ids_come_from_the_source() {
        let source = FixedSource(Some(("0102030405060708", "0a0b0c0d")));
        let ids = resolve(&HeaderMap::new(), None, &Span::none(), &source);
        assert_eq!(ids.trace_id, "0102030405060708");
        assert_eq!(ids.span_id, "0a0b0c0d");
    }

    #[test]
    fn accessors_degrade_without_a_bound_correlation() {
        let extensions = Extensions::new();

        assert_eq!(get_trace_id(&extensions), "");
        assert_eq!(get_span_id(&extensions), "");
        assert_eq!(get_request_id(&extensions), "");
        assert!(get_logger(&extensions).correlation().is_none());

        assert!(current().is_none());
        assert_eq!(current_trace_id(), "");
        assert_eq!(current_span_id(), "");
        assert_eq!(current_request_id(), "");
        assert!(current_logger().correlation().is_none());
    }

    #[test]
    fn both_access_paths_see_the_same_values() {
        let ids = CorrelationIds {
            request_id: "req-1".to_string(),
            trace_id: "aa".to_string(),
            span_id: "bb".to_string(),
        };
        let correlation = bind(ids.clone(), &Logger::global());

        let mut extensions = Extensions::new();
        extensions.insert(correlation.clone());

        sync_scope(correlation, || {
            assert_eq!(get_request_id(&extensions), current_request_id());
            assert_eq!(get_trace_id(&extensions), current_trace_id());
            assert_eq!(get_span_id(&extensions), current_span_id());
            assert!(get_logger(&extensions).ptr_eq(&current_logger()));
            assert_eq!(current_logger().correlation(), Some(&ids));
        });
    }

    #[tokio::test]
    async fn async_scope_reaches_nested_calls() {
        async fn repository_layer() -> String {
            current_request_id()
        }

        let correlation = bind(
            CorrelationIds {
                request_id: "nested".to_string(),
                ..CorrelationIds::default()
            },
            &Logger::global(),
        );

        let seen = scope(correlation, repository_layer()).await;
        assert_eq!(seen, "nested");
        assert_eq!(current_request_id(), "");
    }

    #[test]
    fn attach_is_a_no_op_without_a_valid_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = tracing::info_span!("request", request.id = tracing::field::Empty);
            assert!(!attach_request_id(&span, &OpenTelemetrySource, "req-1"));
            assert!(!attach_request_id(&span, &FixedSource(None), "req-1"));
        });
    }

    #[test]
    fn attach_needs_a_declared_request_id_slot() {
        let source = FixedSource(Some(("aa", "bb")));

        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let declared = tracing::info_span!("request", request.id = tracing::field::Empty);
            assert!(attach_request_id(&declared, &source, "req-1"));

            let undeclared = tracing::info_span!("other");
            assert!(!attach_request_id(&undeclared, &source, "req-1"));
        });
        assert!(!attach_request_id(&Span::none(), &source, "req-1"));
    }
}
