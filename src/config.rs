use std::env;

use url::Url;

use crate::error::Error;

/// Value of `ENVIRONMENT` that marks a production deployment.
pub const PRODUCTION: &str = "production";

/// Process settings, read from the environment.
///
/// | variable                      | default                    |
/// |-------------------------------|----------------------------|
/// | `SERVICE_NAME`                | the crate name             |
/// | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317`    |
/// | `ENVIRONMENT`                 | empty                      |
/// | `LOG_STORE_URL`               | unset, persistence disabled |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub service_name: String,
    pub otlp_endpoint: String,
    pub environment: String,
    pub log_store_url: Option<Url>,
}

impl Settings {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup, so callers are not tied
    /// to the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name =
            non_empty(lookup("SERVICE_NAME")).unwrap_or(env!("CARGO_PKG_NAME").to_string());
        let otlp_endpoint = non_empty(lookup("OTEL_EXPORTER_OTLP_ENDPOINT"))
            .unwrap_or("http://localhost:4317".to_string());
        let environment = lookup("ENVIRONMENT").unwrap_or_default();

        let log_store_url = match non_empty(lookup("LOG_STORE_URL")) {
            Some(raw) => Some(Url::parse(&raw).map_err(|err| Error::Config {
                key: "LOG_STORE_URL",
                reason: err.to_string(),
            })?),
            None => None,
        };

        Ok(Settings {
            service_name,
            otlp_endpoint,
            environment,
            log_store_url,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == PRODUCTION
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
