//! # Request observability
//! This crate instruments tower based http services (like
//! [`axum`](https://docs.rs/axum/latest/axum)) with per-request correlation,
//! structured request logs and optional persistence of those logs.
//!
//! ## Setup
//! Tracing and logs can be set up using [`setup::setup`] with [`Settings`]
//! read from the environment. This should be the first call of any server
//! binary.
//!
//! ## Middleware
//! [`ObserveLayer`] does the whole job: it extracts the propagated trace
//! context, binds a request-scoped [`Logger`], captures both bodies and emits
//! one classified log line per request once the response body is sent. The
//! same record can be written to a [`persist::DocumentStore`] in the
//! background.
//!
//! [`CorrelationLayer`] only does the correlation part.
//!
//! Generally, the middleware should be used on every http route, this usually
//! means that it can be registered globally and in the last position, to be the
//! first to run.
//!
//! ## Correlation
//! Handlers and the code they call read the bound logger and identifiers
//! through [`correlation`], either from the request extensions or from the
//! current task.
//!
//! ## Http Trace Propagation
//! [`http_injector`] provides functions for injecting and extracting tracing
//! data into/from [`http::Request`]s, for calls to downstream services.

pub mod body_dump;
pub mod config;
pub mod correlation;
pub mod error;
pub mod http_injector;
pub mod logger;
pub mod middleware;
pub mod observer;
pub mod persist;
pub mod policy;
pub mod record;
pub mod setup;
pub mod store;
pub mod tee;

pub use config::Settings;
pub use error::{Error, StoreError};
pub use logger::Logger;
pub use middleware::{correlation::CorrelationLayer, observe::ObserveLayer};
