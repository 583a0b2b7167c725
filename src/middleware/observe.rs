use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Body;
use tokio::time::Instant;
use tower::{BoxError, Service};
use tower_layer::Layer;
use tracing::{Instrument, Span};

use crate::{
    body_dump::BodyDump,
    config::Settings,
    correlation::{self, Correlation, CorrelationIds, OpenTelemetrySource, TraceContextSource},
    logger::Logger,
    persist::{self, DocumentStore},
    policy,
    record::{self, RequestSnapshot},
    store::HttpDocumentStore,
    tee::{self, TeeBody},
};

/// Request observability middleware.
///
/// For every request it binds correlation data (see
/// [`super::correlation::CorrelationLayer`]), captures the request body and
/// tees the response body, then, once the response body has been fully sent,
/// logs one line classified by status and optionally hands the same record to
/// a [`DocumentStore`] on a detached task.
///
/// Protocol upgrades are passed through without body capture and logged as
/// soon as the handshake response is produced. Successful requests to
/// [`policy::HEALTH_CHECK_PATH`] are not logged at all.
///
/// The service fails with [`tower::BoxError`] (unreadable request bodies,
/// handler errors), so axum routers need a `HandleErrorLayer` on the outside:
///
/// ```ignore
/// let app = Router::new()
///     .route("/orders/{id}", get(order))
///     .layer(
///         ServiceBuilder::new()
///             .layer(HandleErrorLayer::new(handle_error))
///             .layer(ObserveLayer::new(Logger::global()).with_store(Arc::new(store))),
///     );
/// ```
#[derive(Clone)]
pub struct ObserveLayer {
    shared: Arc<Shared>,
}

type ErrorStatus = Arc<dyn Fn(&BoxError) -> StatusCode + Send + Sync>;

struct Shared {
    logger: Logger,
    source: Arc<dyn TraceContextSource>,
    store: Option<Arc<dyn DocumentStore>>,
    body_dump: Option<BodyDump>,
    error_status: ErrorStatus,
}

impl ObserveLayer {
    pub fn new(logger: Logger) -> Self {
        ObserveLayer {
            shared: Arc::new(Shared {
                logger,
                source: Arc::new(OpenTelemetrySource),
                store: None,
                body_dump: None,
                error_status: Arc::new(|_| StatusCode::INTERNAL_SERVER_ERROR),
            }),
        }
    }

    /// Layer configured from process settings: persistence to
    /// `LOG_STORE_URL` when set, body dumps outside production.
    pub fn from_settings(settings: &Settings, logger: Logger) -> Self {
        let body_dump = BodyDump::from_settings(settings, logger.clone());
        let layer = Self::new(logger).with_body_dump(body_dump);
        match HttpDocumentStore::from_settings(settings) {
            Some(store) => layer.with_store(Arc::new(store)),
            None => layer,
        }
    }

    pub fn with_store(self, store: Arc<dyn DocumentStore>) -> Self {
        self.map(|shared| shared.store = Some(store))
    }

    pub fn with_trace_source(self, source: impl TraceContextSource) -> Self {
        self.map(|shared| shared.source = Arc::new(source))
    }

    pub fn with_body_dump(self, body_dump: BodyDump) -> Self {
        self.map(|shared| shared.body_dump = Some(body_dump))
    }

    /// Status logged when the inner service fails, usually mirroring the
    /// error handler placed outside this layer. Defaults to 500.
    pub fn with_error_status<F>(self, status: F) -> Self
    where
        F: Fn(&BoxError) -> StatusCode + Send + Sync + 'static,
    {
        self.map(|shared| shared.error_status = Arc::new(status))
    }

    fn map(self, f: impl FnOnce(&mut Shared)) -> Self {
        let mut shared = match Arc::try_unwrap(self.shared) {
            Ok(shared) => shared,
            Err(shared) => Shared {
                logger: shared.logger.clone(),
                source: shared.source.clone(),
                store: shared.store.clone(),
                body_dump: shared.body_dump.clone(),
                error_status: shared.error_status.clone(),
            },
        };
        f(&mut shared);
        ObserveLayer {
            shared: Arc::new(shared),
        }
    }
}

impl<S> Layer<S> for ObserveLayer {
    type Service = ObserveService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ObserveService {
            service,
            shared: self.shared.clone(),
        }
    }
}

/// This service implements the observe behavior
#[derive(Clone)]
pub struct ObserveService<S> {
    service: S,
    shared: Arc<Shared>,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ObserveService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Body + From<Bytes> + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
{
    type Error = BoxError;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;
    type Response = Response<TeeBody<ResBody>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        // the ready service handles this request, a fresh clone takes its place
        let clone = self.service.clone();
        let service = std::mem::replace(&mut self.service, clone);

        let shared = self.shared.clone();
        let (span, correlation) = super::enter(&mut request, &shared.logger, shared.source.as_ref());

        Box::pin(observe(shared, service, request, correlation).instrument(span))
    }
}

async fn observe<S, ReqBody, ResBody>(
    shared: Arc<Shared>,
    mut service: S,
    mut request: Request<ReqBody>,
    bound: Correlation,
) -> Result<Response<TeeBody<ResBody>>, BoxError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
    ReqBody: Body + From<Bytes>,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes>,
{
    let started = Instant::now();
    let upgrade = tee::is_upgrade_request(request.headers());

    let request_body = if upgrade {
        None
    } else {
        Some(tee::capture_request_body(&mut request).await?)
    };

    let (mut parts, body) = request.into_parts();
    let params = record::route_params(&mut parts).await;
    let snapshot = RequestSnapshot::new(&parts, params, request_body);
    let request = Request::from_parts(parts, body);

    let future = correlation::sync_scope(bound.clone(), || service.call(request));
    let result = correlation::scope(bound.clone(), future).await;

    let exchange = Exchange {
        shared,
        snapshot,
        ids: bound.ids().clone(),
        started,
        span: Span::current(),
    };

    match result {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            let response_request_id = correlation::resolve_request_id(&parts.headers, None);
            parts.extensions.insert(bound);

            let body = if upgrade {
                exchange.finish(parts.status, response_request_id, None);
                TeeBody::passthrough(body)
            } else {
                let status = parts.status;
                let (body, capture) = tee::wrap_response_body(body);
                body.on_finish(move || {
                    exchange.finish(status, response_request_id, Some(capture.snapshot()));
                })
            };

            Ok(Response::from_parts(parts, body))
        }
        Err(err) => {
            let err: BoxError = err.into();
            let status = (exchange.shared.error_status)(&err);
            let response_body = (!upgrade).then(Bytes::new);
            exchange.finish(status, String::new(), response_body);
            Err(err)
        }
    }
}

/// State kept until the response body is done.
struct Exchange {
    shared: Arc<Shared>,
    snapshot: RequestSnapshot,
    ids: CorrelationIds,
    started: Instant,
    span: Span,
}

impl Exchange {
    fn finish(self, status: StatusCode, response_request_id: String, response_body: Option<Bytes>) {
        let Exchange {
            shared,
            snapshot,
            mut ids,
            started,
            span,
        } = self;

        // response header wins in the record only
        if !response_request_id.is_empty() {
            ids.request_id = response_request_id;
        }

        let record = record::build(&snapshot, status, &ids, response_body.as_ref(), started);
        if !policy::should_emit(&record.path, record.status) {
            return;
        }

        span.in_scope(|| {
            policy::emit(&shared.logger, &record);

            if let (Some(body_dump), Some(request_body), Some(response_body)) =
                (&shared.body_dump, &snapshot.body, &response_body)
            {
                body_dump.dump(&record, request_body, response_body);
            }
        });

        if let Some(store) = &shared.store {
            persist::persist_async(store.clone(), shared.logger.clone(), record.fields());
        }
    }
}
