use std::{
    sync::Arc,
    task::{Context, Poll},
};

use http::Request;
use tokio::task::futures::TaskLocalFuture;
use tower::Service;
use tower_layer::Layer;
use tracing::instrument::Instrumented;

use crate::{
    correlation::{self as store, Correlation, OpenTelemetrySource, TraceContextSource},
    logger::Logger,
};

/// Injects correlation data into route handlers.
///
/// Every request gets a span parented on the propagated trace context, the
/// request ID recorded on that span, and a request-bound [`Logger`] reachable
/// through [`store::get_logger`] and [`store::current_logger`].
///
/// The `CorrelationLayer` will not log http requests. Use
/// [`super::observe::ObserveLayer`] for that; it includes this behaviour.
///
/// ```ignore
/// let app = Router::new()
///     .route("/foo", get(|| async {}))
///     .route("/bar", get(|| async {}))
///     .layer(CorrelationLayer::new(Logger::global()));
/// ```
#[derive(Clone)]
pub struct CorrelationLayer {
    logger: Logger,
    source: Arc<dyn TraceContextSource>,
}

impl CorrelationLayer {
    pub fn new(logger: Logger) -> Self {
        CorrelationLayer {
            logger,
            source: Arc::new(OpenTelemetrySource),
        }
    }

    pub fn with_trace_source(mut self, source: impl TraceContextSource) -> Self {
        self.source = Arc::new(source);
        self
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CorrelationService {
            service,
            logger: self.logger.clone(),
            source: self.source.clone(),
        }
    }
}

/// This service implements the correlation behavior
#[derive(Clone)]
pub struct CorrelationService<S> {
    service: S,
    logger: Logger,
    source: Arc<dyn TraceContextSource>,
}

impl<S, Body> Service<Request<Body>> for CorrelationService<S>
where
    S: Service<Request<Body>>,
{
    type Error = S::Error;
    type Future = Instrumented<TaskLocalFuture<Correlation, S::Future>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let (span, correlation) = super::enter(&mut request, &self.logger, self.source.as_ref());

        let future = store::sync_scope(correlation.clone(), || self.service.call(request));
        tracing::Instrument::instrument(store::scope(correlation, future), span)
    }
}
