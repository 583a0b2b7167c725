#![cfg(feature = "axum")]

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    error_handling::HandleErrorLayer,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use http::{Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, Full};
use request_observer::{
    body_dump::{BodyDump, MESSAGE_PREFIX},
    correlation::{self, Correlation, REQUEST_ID_HEADER},
    observer::{observe, ObservedLogs},
    persist::{Document, DocumentStore},
    Error, Logger, ObserveLayer, StoreError,
};
use serde_json::json;
use tokio::{sync::mpsc, time::Instant};
use tower::{service_fn, BoxError, Layer, ServiceBuilder, ServiceExt};
use tracing::Level;

async fn echo(Path(id): Path<String>, body: String) -> String {
    correlation::current_logger().debug("handling echo");
    format!("{id}:{body}")
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn handle_error(err: BoxError) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn app(layer: ObserveLayer) -> Router {
    Router::new()
        .route("/test/{id}", post(echo))
        .route("/status/{code}", get(status))
        .route(
            "/healthz",
            get(|headers: HeaderMap| async move {
                if headers.contains_key("x-fail") {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }),
        )
        .route(
            "/tagged",
            get(|| async { ([(REQUEST_ID_HEADER, "resp-id")], "tagged") }),
        )
        .route("/ws", get(|| async { StatusCode::SWITCHING_PROTOCOLS }))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_error))
                .layer(layer),
        )
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app.oneshot(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

fn middleware_events(logs: &ObservedLogs) -> Vec<request_observer::observer::ObservedEvent> {
    logs.all()
        .into_iter()
        .filter(|event| event.field("status").is_some())
        .collect()
}

#[tokio::test]
async fn logs_one_success_line_with_all_fields() {
    let (logger, logs) = observe(Level::INFO);

    let request = Request::post("/test/123?foo=bar")
        .header(REQUEST_ID_HEADER, "req-1")
        .header("content-type", "application/json")
        .header("user-agent", "observer-test")
        .body(Body::from(r#"{"foo":"bar"}"#))
        .unwrap();
    let (status, _, body) = send(app(ObserveLayer::new(logger)), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"123:{"foo":"bar"}"#);

    let events = logs.all();
    assert_eq!(events.len(), 1, "{events:?}");
    let event = &events[0];
    assert_eq!(event.level, Level::INFO);
    assert_eq!(event.message, "Success");
    assert_eq!(event.field("status"), Some(&json!(200)));
    assert_eq!(event.field_str("method"), Some("POST"));
    assert_eq!(event.field_str("path"), Some("/test/{id}"));
    assert_eq!(event.field_str("uri"), Some("/test/123?foo=bar"));
    assert_eq!(event.field_str("query"), Some("foo=bar"));
    assert_eq!(event.field_str("param"), Some(r#"["123"]"#));
    assert_eq!(event.field_str("request_id"), Some("req-1"));
    assert_eq!(event.field_str("user_agent"), Some("observer-test"));
    assert_eq!(event.field_str("body"), Some(r#"{"foo":"bar"}"#));
    assert_eq!(event.field_str("response"), Some(r#"123:{"foo":"bar"}"#));
    assert_eq!(event.field_str("trace_id"), Some(""));
    assert!(event.field("latency").is_some());
    assert!(event.field("timestamp").is_some());
}

#[tokio::test]
async fn handler_logger_carries_correlation_fields() {
    let (logger, logs) = observe(Level::DEBUG);

    let request = Request::post("/test/7")
        .header(REQUEST_ID_HEADER, "req-7")
        .body(Body::from("x"))
        .unwrap();
    send(app(ObserveLayer::new(logger)), request).await;

    let handler_events = logs.with_message("handling echo");
    assert_eq!(handler_events.len(), 1);
    assert_eq!(handler_events[0].field_str("request_id"), Some("req-7"));
}

#[tokio::test]
async fn response_carries_the_bound_correlation() {
    let (logger, _logs) = observe(Level::INFO);
    let service = ObserveLayer::new(logger).layer(service_fn(|request: Request<Full<Bytes>>| {
        async move {
            let id = correlation::get_request_id(request.extensions());
            Ok::<_, BoxError>(Response::new(Full::from(id)))
        }
    }));

    let response = service
        .oneshot(
            Request::get("/")
                .header(REQUEST_ID_HEADER, "req-2")
                .body(Full::default())
                .unwrap(),
        )
        .await
        .unwrap();

    let correlation = response.extensions().get::<Correlation>().unwrap();
    assert_eq!(correlation.ids().request_id, "req-2");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "req-2");
}

#[tokio::test]
async fn request_id_falls_back_to_the_response_header() {
    let (logger, logs) = observe(Level::INFO);

    let request = Request::get("/tagged").body(Body::empty()).unwrap();
    let (_, headers, _) = send(app(ObserveLayer::new(logger)), request).await;

    assert_eq!(headers[REQUEST_ID_HEADER], "resp-id");
    let events = logs.all();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field_str("request_id"), Some("resp-id"));
}

#[tokio::test]
async fn response_request_id_wins_over_the_request_header() {
    let (logger, logs) = observe(Level::INFO);
    let router = Router::new().route(
        "/renamed",
        get(|| async {
            let seen = correlation::current_request_id();
            ([(REQUEST_ID_HEADER, "resp-id")], seen)
        }),
    );

    let request = Request::get("/renamed")
        .header(REQUEST_ID_HEADER, "req-id")
        .body(Body::empty())
        .unwrap();
    let (_, headers, body) = send(app_with(router, ObserveLayer::new(logger)), request).await;

    // the handler keeps the value bound from the request
    assert_eq!(body, "req-id");
    assert_eq!(headers[REQUEST_ID_HEADER], "resp-id");

    let events = logs.all();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field_str("request_id"), Some("resp-id"));
}

#[tokio::test]
async fn missing_request_id_is_logged_empty() {
    let (logger, logs) = observe(Level::INFO);

    let request = Request::get("/status/204").body(Body::empty()).unwrap();
    send(app(ObserveLayer::new(logger)), request).await;

    assert_eq!(logs.all()[0].field_str("request_id"), Some(""));
}

#[tokio::test]
async fn status_classes_map_to_levels_and_messages() {
    let cases = [
        (201, Level::INFO, "Success"),
        (302, Level::INFO, "Redirection"),
        (404, Level::WARN, "Client error"),
        (418, Level::WARN, "Client error"),
        (500, Level::ERROR, "Server error"),
        (503, Level::ERROR, "Server error"),
    ];

    for (code, level, message) in cases {
        let (logger, logs) = observe(Level::TRACE);
        let request = Request::get(format!("/status/{code}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(app(ObserveLayer::new(logger)), request).await;

        assert_eq!(status.as_u16(), code);
        let events = logs.all();
        assert_eq!(events.len(), 1, "{code}");
        assert_eq!(events[0].level, level, "{code}");
        assert_eq!(events[0].message, message, "{code}");
        assert_eq!(events[0].field_str("path"), Some("/status/{code}"));
    }
}

#[tokio::test]
async fn successful_health_checks_are_not_logged() {
    let (logger, logs) = observe(Level::TRACE);
    let request = Request::get("/healthz").body(Body::empty()).unwrap();
    let (status, _, _) = send(app(ObserveLayer::new(logger)), request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(logs.is_empty());
}

#[tokio::test]
async fn failing_health_checks_are_logged() {
    let (logger, logs) = observe(Level::TRACE);
    let request = Request::get("/healthz")
        .header("x-fail", "1")
        .body(Body::empty())
        .unwrap();
    send(app(ObserveLayer::new(logger)), request).await;

    let events = logs.all();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].level, Level::ERROR);
    assert_eq!(events[0].field("status"), Some(&json!(503)));
}

#[tokio::test]
async fn upgrade_is_logged_at_handshake_without_bodies() {
    let (logger, logs) = observe(Level::INFO);

    let request = Request::get("/ws")
        .header("connection", "keep-alive, Upgrade")
        .header("upgrade", "websocket")
        .body(Body::empty())
        .unwrap();
    let response = app(ObserveLayer::new(logger)).oneshot(request).await.unwrap();

    // logged before the body is touched
    let events = logs.all();
    assert_eq!(events.len(), 1);
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(events[0].field("status"), Some(&json!(101)));
    assert!(events[0].field("body").is_none());
    assert!(events[0].field("response").is_none());

    drop(response);
    assert_eq!(logs.len(), 1);
}

struct BrokenBody;

impl http_body::Body for BrokenBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        Poll::Ready(Some(Err(io::Error::other("connection reset"))))
    }
}

#[tokio::test]
async fn unreadable_request_body_skips_the_handler() {
    let (logger, logs) = observe(Level::TRACE);
    let called = Arc::new(AtomicBool::new(false));

    let router = Router::new().route(
        "/upload",
        post({
            let called = called.clone();
            move || async move {
                called.store(true, Ordering::SeqCst);
                "stored"
            }
        }),
    );
    let service = ObserveLayer::new(logger).layer(router);

    let err = service
        .oneshot(
            Request::post("/upload")
                .body(Body::new(BrokenBody))
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert!(!called.load(Ordering::SeqCst));
    let err = err.downcast::<Error>().unwrap();
    assert!(matches!(*err, Error::BodyRead(_)));
    assert!(logs.is_empty());
}

#[tokio::test]
async fn handler_error_is_logged_as_server_error_and_forwarded() {
    let (logger, logs) = observe(Level::INFO);
    let service = ObserveLayer::new(logger).layer(service_fn(|_: Request<Full<Bytes>>| async {
        Err::<Response<Full<Bytes>>, _>(io::Error::other("database unavailable"))
    }));

    let err = service
        .oneshot(
            Request::post("/orders")
                .body(Full::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "database unavailable");
    assert!(err.downcast_ref::<io::Error>().is_some());

    let events = logs.all();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].level, Level::ERROR);
    assert_eq!(events[0].message, "Server error");
    assert_eq!(events[0].field("status"), Some(&json!(500)));
    assert_eq!(events[0].field_str("body"), Some("payload"));
    assert_eq!(events[0].field_str("response"), Some(""));
}

#[tokio::test]
async fn error_status_mirrors_the_outer_error_handler() {
    let (logger, logs) = observe(Level::INFO);
    let layer = ObserveLayer::new(logger).with_error_status(|err| {
        if err.is::<Error>() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    });
    let router = Router::new().route("/upload", post(|| async { "stored" }));

    // a broken body never reaches the handler, so it is not logged at all
    let request = Request::post("/upload").body(Body::new(BrokenBody)).unwrap();
    let (status, _, _) = send(app_with(router, layer.clone()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(logs.is_empty());

    let service = layer.layer(service_fn(|_: Request<Full<Bytes>>| async {
        Err::<Response<Full<Bytes>>, BoxError>(Box::new(Error::Config {
            key: "UPSTREAM",
            reason: "unreachable".to_string(),
        }))
    }));
    let err = service
        .oneshot(Request::get("/orders").body(Full::default()).unwrap())
        .await
        .unwrap_err();
    assert!(err.is::<Error>());

    let events = logs.all();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field("status"), Some(&json!(400)));
    assert_eq!(events[0].level, Level::WARN);
    assert_eq!(events[0].message, "Client error");
}

/// Response body split over several frames.
struct Chunks(VecDeque<Bytes>);

impl http_body::Body for Chunks {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        Poll::Ready(self.0.pop_front().map(|chunk| Ok(Frame::data(chunk))))
    }
}

#[tokio::test]
async fn both_sides_see_exactly_the_original_bytes() {
    let (logger, logs) = observe(Level::INFO);
    let payload: String = "0123456789abcdef".repeat(4096);

    let router = Router::new().route(
        "/stream",
        post({
            let expected = payload.clone();
            move |body: Bytes| async move {
                assert_eq!(body, expected.as_bytes());
                Body::new(Chunks(VecDeque::from([
                    Bytes::from_static(b"first,"),
                    Bytes::from_static(b"second,"),
                    Bytes::from_static(b"third"),
                ])))
                .into_response()
            }
        }),
    );

    let request = Request::post("/stream").body(Body::from(payload.clone())).unwrap();
    let (_, _, body) = send(app_with(router, ObserveLayer::new(logger)), request).await;

    assert_eq!(body, "first,second,third");
    let events = logs.all();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field_str("response"), Some("first,second,third"));
    assert_eq!(events[0].field_str("body"), Some(payload.as_str()));
}

fn app_with(router: Router, layer: ObserveLayer) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(handle_error))
            .layer(layer),
    )
}

#[tokio::test]
async fn body_dump_runs_outside_production() {
    let (logger, logs) = observe(Level::INFO);
    let layer = ObserveLayer::new(logger.clone())
        .with_body_dump(BodyDump::new("development", logger));

    let request = Request::post("/test/1")
        .body(Body::from("{\n\t\"a\": 1\n}"))
        .unwrap();
    send(app(layer), request).await;

    let dumps: Vec<_> = logs
        .all()
        .into_iter()
        .filter(|event| event.message.starts_with(MESSAGE_PREFIX))
        .collect();
    assert_eq!(dumps.len(), 1);
    assert!(dumps[0].message.contains(r#""request":"{\"a\": 1}""#));
    assert_eq!(middleware_events(&logs).len(), 1);
}

#[tokio::test]
async fn body_dump_is_silent_in_production() {
    let (logger, logs) = observe(Level::INFO);
    let layer = ObserveLayer::new(logger.clone())
        .with_body_dump(BodyDump::new("production", logger));

    send(app(layer), Request::post("/test/1").body(Body::from("x")).unwrap()).await;

    assert_eq!(logs.len(), 1);
}

struct ChannelStore(mpsc::UnboundedSender<Document>);

#[async_trait]
impl DocumentStore for ChannelStore {
    async fn insert_one(&self, document: Document, _deadline: Instant) -> Result<(), StoreError> {
        self.0.send(document).map_err(|err| StoreError::Transport(err.into()))
    }
}

struct RejectingStore;

#[async_trait]
impl DocumentStore for RejectingStore {
    async fn insert_one(&self, _document: Document, _deadline: Instant) -> Result<(), StoreError> {
        Err(StoreError::Rejected { status: 503 })
    }
}

#[tokio::test]
async fn persisted_document_matches_the_logged_record() {
    let (logger, logs) = observe(Level::INFO);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let layer = ObserveLayer::new(logger).with_store(Arc::new(ChannelStore(tx)));

    let request = Request::post("/test/123")
        .header(REQUEST_ID_HEADER, "req-9")
        .body(Body::from("ping"))
        .unwrap();
    send(app(layer), request).await;

    let document = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(document["status"], json!(200));
    assert_eq!(document["request_id"], json!("req-9"));
    assert_eq!(document["body"], json!("ping"));
    assert_eq!(document["response"], json!("123:ping"));
    assert_eq!(document["param"], json!(["123"]));
    assert_eq!(document["path"], json!("/test/{id}"));
    assert!(document["latency"].is_i64());
    assert!(document["time"].as_str().unwrap().ends_with('Z'));

    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn store_failure_does_not_affect_the_response() {
    let (logger, logs) = observe(Level::INFO);
    let layer = ObserveLayer::new(logger).with_store(Arc::new(RejectingStore));

    let request = Request::post("/test/5").body(Body::from("x")).unwrap();
    let (status, _, body) = send(app(layer), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "5:x");

    assert!(logs.wait_for(2, Duration::from_secs(1)).await);
    let failures = logs.with_message("failed to persist log record");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].level, Level::ERROR);
    assert!(failures[0]
        .field_str("error")
        .unwrap()
        .contains("503"));
}

#[tokio::test]
async fn skipped_health_checks_are_not_persisted() {
    let (logger, logs) = observe(Level::INFO);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let layer = ObserveLayer::new(logger).with_store(Arc::new(ChannelStore(tx)));

    send(app(layer), Request::get("/healthz").body(Body::empty()).unwrap()).await;

    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
    assert!(logs.is_empty());
}

#[tokio::test]
async fn global_logger_works_without_a_capture() {
    let request = Request::post("/test/1").body(Body::from("x")).unwrap();
    let (status, _, _) = send(app(ObserveLayer::new(Logger::global())), request).await;
    assert_eq!(status, StatusCode::OK);
}
