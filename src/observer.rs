//! In-memory log sink for asserting on emitted events.
//!
//! ```ignore
//! let (logger, logs) = observe(Level::DEBUG);
//! let layer = ObserveLayer::new(logger);
//! // drive a request ...
//! assert_eq!(logs.all()[0].message, "Success");
//! ```

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, layer::SubscriberExt, Layer};

use crate::logger::Logger;

/// One recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, Value>,
}

impl ObservedEvent {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Shared handle over the recorded events.
#[derive(Debug, Clone, Default)]
pub struct ObservedLogs {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl ObservedLogs {
    pub fn all(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_message(&self, message: &str) -> Vec<ObservedEvent> {
        self.all()
            .into_iter()
            .filter(|event| event.message == message)
            .collect()
    }

    /// Polls until at least `count` events were recorded or `timeout` passed.
    /// Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn push(&self, event: ObservedEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// [`Layer`] that records every event at or above `max_level` verbosity.
#[derive(Debug, Clone)]
pub struct ObserverLayer {
    logs: ObservedLogs,
    max_level: Level,
}

impl ObserverLayer {
    pub fn new(max_level: Level) -> (Self, ObservedLogs) {
        let logs = ObservedLogs::default();
        let layer = ObserverLayer {
            logs: logs.clone(),
            max_level,
        };
        (layer, logs)
    }
}

impl<S: Subscriber> Layer<S> for ObserverLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.logs.push(ObservedEvent {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Builds a [`Logger`] whose events are recorded in the returned handle.
pub fn observe(max_level: Level) -> (Logger, ObservedLogs) {
    let (layer, logs) = ObserverLayer::new(max_level);
    let subscriber = tracing_subscriber::registry().with(layer);
    (Logger::from_subscriber(subscriber), logs)
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(rendered));
        }
    }
}
