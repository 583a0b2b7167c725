//! Which exchanges are logged, and at what level.

use http::StatusCode;
use tracing::Level;

use crate::{
    logger::{Logger, TARGET},
    record::LogRecord,
};

/// Health-check endpoint; successful checks are never logged.
pub const HEALTH_CHECK_PATH: &str = "/healthz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warn,
    Redirection,
    Success,
}

impl Severity {
    pub fn level(self) -> Level {
        match self {
            Severity::Error => Level::ERROR,
            Severity::Warn => Level::WARN,
            Severity::Redirection | Severity::Success => Level::INFO,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Severity::Error => "Server error",
            Severity::Warn => "Client error",
            Severity::Redirection => "Redirection",
            Severity::Success => "Success",
        }
    }
}

/// Maps a status code onto a severity band. Bands are checked from the
/// highest threshold down and include their lower bound.
pub fn classify(status: u16) -> Severity {
    match status {
        500.. => Severity::Error,
        400.. => Severity::Warn,
        300.. => Severity::Redirection,
        _ => Severity::Success,
    }
}

pub fn should_emit(path: &str, status: u16) -> bool {
    !(path == HEALTH_CHECK_PATH && status == StatusCode::OK.as_u16())
}

macro_rules! record_event {
    ($level:expr, $record:expr, $message:expr) => {{
        let record: &LogRecord = $record;
        tracing::event!(
            target: TARGET,
            $level,
            status = record.status,
            latency = ?record.latency,
            request_id = record.request_id.as_str(),
            trace_id = record.trace_id.as_str(),
            span_id = record.span_id.as_str(),
            time = %record.time_rfc3339(),
            timestamp = record.timestamp,
            method = record.method.as_str(),
            uri = record.uri.as_str(),
            host = record.host.as_str(),
            remote_ip = record.remote_ip.as_str(),
            header = record.header.as_str(),
            path = record.path.as_str(),
            query = record.query.as_str(),
            form = record.form.as_str(),
            param = %record.params_json(),
            body = record.body.as_deref(),
            user_agent = record.user_agent.as_str(),
            referer = record.referer.as_str(),
            request_proto = record.request_proto.as_str(),
            response = record.response.as_deref(),
            "{}",
            $message
        )
    }};
}

/// Emits the record as one event at its classified level. Returns the
/// severity used.
pub fn emit(logger: &Logger, record: &LogRecord) -> Severity {
    let severity = classify(record.status);
    let message = severity.message();

    logger.in_scope(|| match severity.level() {
        Level::ERROR => record_event!(Level::ERROR, record, message),
        Level::WARN => record_event!(Level::WARN, record, message),
        _ => record_event!(Level::INFO, record, message),
    });

    severity
}
