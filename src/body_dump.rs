//! Human-oriented dump of request and response bodies.
//!
//! A simpler sibling of the main request log: one info line per exchange,
//! disabled in production and for the health-check path, with control
//! characters stripped from both bodies so each dump stays on one line.

use serde::{Deserialize, Serialize};

use crate::{
    config::{Settings, PRODUCTION},
    logger::{Logger, TARGET},
    policy::HEALTH_CHECK_PATH,
    record::LogRecord,
};

/// Prefix of every dump message; the rest is the JSON entry.
pub const MESSAGE_PREFIX: &str = "Body dump: ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyDumpEntry {
    pub host: String,
    pub path: String,
    pub method: String,
    #[serde(rename = "remoteAddress")]
    pub remote_address: String,
    pub header: String,
    pub status: u16,
    pub request: String,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct BodyDump {
    environment: String,
    logger: Logger,
}

impl BodyDump {
    pub fn new(environment: impl Into<String>, logger: Logger) -> Self {
        BodyDump {
            environment: environment.into(),
            logger,
        }
    }

    pub fn from_settings(settings: &Settings, logger: Logger) -> Self {
        Self::new(settings.environment.clone(), logger)
    }

    pub fn enabled_for(&self, path: &str) -> bool {
        self.environment != PRODUCTION && path != HEALTH_CHECK_PATH
    }

    /// Logs one sanitized dump line for the exchange, unless disabled.
    /// Returns whether a line was written.
    pub fn dump(&self, record: &LogRecord, request_body: &[u8], response_body: &[u8]) -> bool {
        if !self.enabled_for(&record.path) {
            return false;
        }

        let entry = BodyDumpEntry {
            host: record.host.clone(),
            path: record.path.clone(),
            method: record.method.clone(),
            remote_address: record.remote_addr.clone(),
            header: record.header.clone(),
            status: record.status,
            request: sanitize(request_body),
            response: sanitize(response_body),
        };

        match serde_json::to_string(&entry) {
            Ok(json) => {
                self.logger.in_scope(|| {
                    tracing::info!(target: TARGET, "{MESSAGE_PREFIX}{json}");
                });
                true
            }
            Err(err) => {
                self.logger
                    .warn(format_args!("failed to encode body dump: {err}"));
                false
            }
        }
    }
}

/// Removes newline, carriage-return and tab characters; every other byte is
/// kept (invalid UTF-8 is replaced).
pub fn sanitize(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t'))
        .collect()
}
