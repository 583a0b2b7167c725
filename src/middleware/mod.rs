//! Tower middleware.
//!
//! - [`observe::ObserveLayer`]: full request observability (correlation,
//!   body capture, classified request log, optional persistence).
//! - [`correlation::CorrelationLayer`]: correlation only, for services that
//!   log through their own means but want request-bound loggers and the
//!   request ID on their spans.

use http::Request;
use tracing::Span;

use crate::{
    correlation::{self as store, Correlation, TraceContextSource},
    http_injector,
    logger::Logger,
};

pub mod correlation;
pub mod observe;

/// Per-request entry: builds the request span from the propagated trace
/// context, resolves the identifiers, tags the span with the request ID and
/// binds the request logger into the request extensions.
pub(crate) fn enter<B>(
    request: &mut Request<B>,
    base: &Logger,
    source: &dyn TraceContextSource,
) -> (Span, Correlation) {
    let span = http_injector::extract_opentelemetry_context_from_request(request);
    let ids = store::resolve(request.headers(), None, &span, source);
    store::attach_request_id(&span, source, &ids.request_id);

    let correlation = store::bind(ids, base);
    request.extensions_mut().insert(correlation.clone());

    (span, correlation)
}
