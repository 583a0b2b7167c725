//! Injectable logger handle.
//!
//! [`Logger`] is a thin handle over a [`tracing::Dispatch`]. The middleware is
//! built with an explicit logger; code that has no logger at hand (called
//! outside the middleware chain) gets the process-wide [`fallback`], which
//! follows whatever default dispatcher is installed and can be swapped with
//! [`set_fallback`].

use std::{
    fmt,
    sync::{Arc, LazyLock},
};

use arc_swap::ArcSwapOption;
use tracing::{Dispatch, Level, Subscriber};

use crate::correlation::CorrelationIds;

/// Target of every event emitted by this crate.
pub const TARGET: &str = "request_observer";

static GLOBAL: LazyLock<Logger> = LazyLock::new(|| Logger {
    inner: Arc::new(Inner {
        dispatch: None,
        correlation: None,
    }),
});

static FALLBACK: LazyLock<ArcSwapOption<Logger>> = LazyLock::new(ArcSwapOption::empty);

/// Severity-aware logger, optionally carrying correlation fields.
///
/// Cloning is cheap and clones compare equal under [`Logger::ptr_eq`].
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

struct Inner {
    dispatch: Option<Dispatch>,
    correlation: Option<CorrelationIds>,
}

impl Logger {
    /// Logger that emits through the default dispatcher in effect at the time
    /// of each event.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    pub fn new(dispatch: Dispatch) -> Self {
        Logger {
            inner: Arc::new(Inner {
                dispatch: Some(dispatch),
                correlation: None,
            }),
        }
    }

    pub fn from_subscriber<S>(subscriber: S) -> Self
    where
        S: Subscriber + Send + Sync + 'static,
    {
        Self::new(Dispatch::new(subscriber))
    }

    /// Returns a new logger emitting through the same dispatcher, with
    /// `request_id`, `trace_id` and `span_id` attached to every event.
    pub fn with_correlation(&self, ids: CorrelationIds) -> Self {
        Logger {
            inner: Arc::new(Inner {
                dispatch: self.inner.dispatch.clone(),
                correlation: Some(ids),
            }),
        }
    }

    pub fn correlation(&self) -> Option<&CorrelationIds> {
        self.inner.correlation.as_ref()
    }

    /// Runs `f` with this logger's dispatcher as the default, so plain
    /// `tracing` macros inside `f` reach the same sink.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.inner.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }

    pub fn log(&self, level: Level, message: impl fmt::Display) {
        let ids = self.inner.correlation.as_ref();
        let request_id = ids.map(|ids| ids.request_id.as_str());
        let trace_id = ids.map(|ids| ids.trace_id.as_str());
        let span_id = ids.map(|ids| ids.span_id.as_str());

        self.in_scope(|| match level {
            Level::ERROR => {
                tracing::event!(target: TARGET, Level::ERROR, request_id, trace_id, span_id, "{message}")
            }
            Level::WARN => {
                tracing::event!(target: TARGET, Level::WARN, request_id, trace_id, span_id, "{message}")
            }
            Level::INFO => {
                tracing::event!(target: TARGET, Level::INFO, request_id, trace_id, span_id, "{message}")
            }
            Level::DEBUG => {
                tracing::event!(target: TARGET, Level::DEBUG, request_id, trace_id, span_id, "{message}")
            }
            _ => {
                tracing::event!(target: TARGET, Level::TRACE, request_id, trace_id, span_id, "{message}")
            }
        });
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(Level::DEBUG, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::INFO, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::WARN, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::ERROR, message);
    }

    pub fn ptr_eq(&self, other: &Logger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::global()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("dispatch", &self.inner.dispatch.is_some())
            .field("correlation", &self.inner.correlation)
            .finish()
    }
}

/// The last-resort logger handed out when no request-scoped logger exists.
pub fn fallback() -> Logger {
    match FALLBACK.load_full() {
        Some(logger) => Logger::clone(&logger),
        None => Logger::global(),
    }
}

/// Replaces the fallback logger, returning the previous override.
/// `None` restores [`Logger::global`].
pub fn set_fallback(logger: Option<Logger>) -> Option<Logger> {
    FALLBACK
        .swap(logger.map(Arc::new))
        .map(|previous| Logger::clone(&previous))
}
