//! Fire-and-forget persistence of log records.
//!
//! Each logged request spawns one detached task that converts the record into
//! a [`Document`] and makes a single write attempt bounded by
//! [`PERSIST_TIMEOUT`]. Failures are logged at error level and dropped.
//!
//! There is no queue and no concurrency cap: one task per logged request.
//! Under sustained load a slow store accumulates in-flight tasks; a bounded
//! worker pool with a drop policy would be the hardening step.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};

use crate::{
    error::StoreError,
    logger::{Logger, TARGET},
    record::{self, Field, FieldValue},
};

/// Deadline for one store write.
pub const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Generic key/value document handed to the store.
pub type Document = Map<String, Value>;

/// External sink accepting one document per call.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Writes `document`. Implementations should give up at `deadline`; the
    /// caller enforces it regardless.
    async fn insert_one(&self, document: Document, deadline: Instant) -> Result<(), StoreError>;
}

/// Converts typed fields into a document.
///
/// Integers become `i64` (unsigned values saturate), floats stay `f64`,
/// durations become integer nanoseconds, timestamps become RFC 3339 strings
/// and JSON values are stored as they are.
pub fn to_document(fields: &[Field]) -> Document {
    let mut document = Map::with_capacity(fields.len());
    for field in fields {
        let value = match &field.value {
            FieldValue::Str(value) => Value::from(value.as_str()),
            FieldValue::Int(value) => Value::from(*value),
            FieldValue::Uint(value) => Value::from(i64::try_from(*value).unwrap_or(i64::MAX)),
            FieldValue::Float(value) => Value::from(*value),
            FieldValue::Bool(value) => Value::from(*value),
            FieldValue::Duration(value) => {
                Value::from(i64::try_from(value.as_nanos()).unwrap_or(i64::MAX))
            }
            FieldValue::Time(value) => Value::from(record::format_time(value)),
            FieldValue::Json(value) => value.clone(),
        };
        document.insert(field.key.to_string(), value);
    }
    document
}

/// Spawns the detached write. Returns `None` when no tokio runtime is
/// available, in which case the attempt is skipped with a warning.
pub fn persist_async(
    store: Arc<dyn DocumentStore>,
    logger: Logger,
    fields: Vec<Field>,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = Handle::try_current() else {
        logger.warn("no async runtime available, log record not persisted");
        return None;
    };

    Some(runtime.spawn(async move {
        let document = to_document(&fields);
        if let Err(err) = write_once(store.as_ref(), document).await {
            logger.in_scope(|| {
                tracing::error!(target: TARGET, error = %err, "failed to persist log record");
            });
        }
    }))
}

async fn write_once(store: &dyn DocumentStore, document: Document) -> Result<(), StoreError> {
    let deadline = Instant::now() + PERSIST_TIMEOUT;
    match tokio::time::timeout_at(deadline, store.insert_one(document, deadline)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}
