//! Log event record for one request/response exchange.
//!
//! The record is materialised once, after the response is known, and is then
//! handed unchanged to the local log emission and to the persistence sink.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http::{
    header::{CONTENT_TYPE, HOST, REFERER, USER_AGENT},
    request::Parts,
    HeaderMap, StatusCode,
};
use serde_json::Value;
use tokio::time::Instant;
use url::form_urlencoded;

use crate::correlation::CorrelationIds;

/// Everything the record needs from the request, taken before the request is
/// handed to the handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSnapshot {
    pub method: String,
    pub uri: String,
    pub host: String,
    pub remote_ip: String,
    /// Raw peer `ip:port` of the connection; empty when the server does not
    /// expose it.
    pub remote_addr: String,
    pub header: String,
    pub path: String,
    pub query: String,
    pub form: String,
    pub params: Vec<String>,
    pub user_agent: String,
    pub referer: String,
    pub proto: String,
    /// Captured request body; `None` when capture was skipped.
    pub body: Option<Bytes>,
}

impl RequestSnapshot {
    pub fn new(parts: &Parts, params: Vec<String>, body: Option<Bytes>) -> Self {
        let query = parts.uri.query().unwrap_or_default().to_string();

        RequestSnapshot {
            method: parts.method.to_string(),
            uri: parts.uri.to_string(),
            host: host(parts),
            remote_ip: remote_ip(parts),
            remote_addr: peer_addr(parts).unwrap_or_default(),
            header: format!("{:?}", parts.headers),
            path: route_path(parts),
            form: form_values(&parts.headers, &query, body.as_ref()),
            query,
            params,
            user_agent: header_str(&parts.headers, USER_AGENT.as_str()),
            referer: header_str(&parts.headers, REFERER.as_str()),
            proto: format!("{:?}", parts.version),
            body,
        }
    }
}

/// Positional route parameters, in declaration order.
#[cfg(feature = "axum")]
pub async fn route_params(parts: &mut Parts) -> Vec<String> {
    use axum::extract::{FromRequestParts, RawPathParams};

    match RawPathParams::from_request_parts(parts, &()).await {
        Ok(params) => params.iter().map(|(_, value)| value.to_string()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Positional route parameters, in declaration order.
#[cfg(not(feature = "axum"))]
pub async fn route_params(_parts: &mut Parts) -> Vec<String> {
    Vec::new()
}

fn header_str(headers: &HeaderMap, key: &str) -> String {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn host(parts: &Parts) -> String {
    let from_header = header_str(&parts.headers, HOST.as_str());
    if !from_header.is_empty() {
        return from_header;
    }
    parts
        .uri
        .authority()
        .map(|authority| authority.to_string())
        .unwrap_or_default()
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// peer address when the server exposes it.
fn remote_ip(parts: &Parts) -> String {
    if let Some(forwarded) = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return forwarded.to_string();
    }

    let real_ip = header_str(&parts.headers, "x-real-ip");
    if !real_ip.is_empty() {
        return real_ip;
    }

    peer(parts)
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

fn peer_addr(parts: &Parts) -> Option<String> {
    peer(parts).map(|addr| addr.to_string())
}

#[cfg(feature = "axum")]
fn peer(parts: &Parts) -> Option<std::net::SocketAddr> {
    use std::net::SocketAddr;

    use axum::extract::ConnectInfo;

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

#[cfg(not(feature = "axum"))]
fn peer(_parts: &Parts) -> Option<std::net::SocketAddr> {
    None
}

/// Matched route pattern when the router exposes one, else the URI path.
#[cfg(feature = "axum")]
fn route_path(parts: &Parts) -> String {
    use axum::extract::MatchedPath;

    parts
        .extensions
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string())
}

#[cfg(not(feature = "axum"))]
fn route_path(parts: &Parts) -> String {
    parts.uri.path().to_string()
}

/// Query values merged with url-encoded form body values, encoded with keys
/// in sorted order.
fn form_values(headers: &HeaderMap, query: &str, body: Option<&Bytes>) -> String {
    let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        values.entry(key.into_owned()).or_default().push(value.into_owned());
    }

    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
    if let (true, Some(body)) = (is_form, body) {
        for (key, value) in form_urlencoded::parse(body) {
            values.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, entries) in &values {
        for value in entries {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

/// Typed value of a record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Duration(Duration),
    Time(DateTime<Utc>),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: &'static str,
    pub value: FieldValue,
}

impl Field {
    pub fn new(key: &'static str, value: FieldValue) -> Self {
        Field { key, value }
    }

    fn str(key: &'static str, value: &str) -> Self {
        Field::new(key, FieldValue::Str(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub status: u16,
    pub latency: Duration,
    pub request_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub time: DateTime<Utc>,
    pub timestamp: i64,
    pub method: String,
    pub uri: String,
    pub host: String,
    pub remote_ip: String,
    /// Peer `ip:port`; only used by the body dump, not part of [`fields`].
    ///
    /// [`fields`]: LogRecord::fields
    pub remote_addr: String,
    pub header: String,
    pub path: String,
    pub query: String,
    pub form: String,
    pub params: Vec<String>,
    /// Request body; absent when capture was skipped.
    pub body: Option<String>,
    pub user_agent: String,
    pub referer: String,
    pub request_proto: String,
    /// Response body; absent when capture was skipped.
    pub response: Option<String>,
}

/// Wall-clock rendering shared by the log line and the stored document:
/// RFC 3339, whole seconds, `Z` suffix.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl LogRecord {
    pub fn time_rfc3339(&self) -> String {
        format_time(&self.time)
    }

    /// Route parameters rendered as a JSON array.
    pub fn params_json(&self) -> Value {
        Value::from(self.params.clone())
    }

    /// The record as an ordered list of typed fields.
    pub fn fields(&self) -> Vec<Field> {
        let mut fields = vec![
            Field::new("status", FieldValue::Int(i64::from(self.status))),
            Field::new("latency", FieldValue::Duration(self.latency)),
            Field::str("request_id", &self.request_id),
            Field::str("trace_id", &self.trace_id),
            Field::str("span_id", &self.span_id),
            Field::new("time", FieldValue::Time(self.time)),
            Field::new("timestamp", FieldValue::Int(self.timestamp)),
            Field::str("method", &self.method),
            Field::str("uri", &self.uri),
            Field::str("host", &self.host),
            Field::str("remote_ip", &self.remote_ip),
            Field::str("header", &self.header),
            Field::str("path", &self.path),
            Field::str("query", &self.query),
            Field::str("form", &self.form),
            Field::new("param", FieldValue::Json(self.params_json())),
        ];
        if let Some(body) = &self.body {
            fields.push(Field::str("body", body));
        }
        fields.push(Field::str("user_agent", &self.user_agent));
        fields.push(Field::str("referer", &self.referer));
        fields.push(Field::str("request_proto", &self.request_proto));
        if let Some(response) = &self.response {
            fields.push(Field::str("response", response));
        }
        fields
    }
}

/// Assembles the record. Pure apart from reading the clock; never fails.
pub fn build(
    snapshot: &RequestSnapshot,
    status: StatusCode,
    ids: &CorrelationIds,
    response_body: Option<&Bytes>,
    started: Instant,
) -> LogRecord {
    let now = Utc::now();

    LogRecord {
        status: status.as_u16(),
        latency: started.elapsed(),
        request_id: ids.request_id.clone(),
        trace_id: ids.trace_id.clone(),
        span_id: ids.span_id.clone(),
        time: now,
        timestamp: now.timestamp(),
        method: snapshot.method.clone(),
        uri: snapshot.uri.clone(),
        host: snapshot.host.clone(),
        remote_ip: snapshot.remote_ip.clone(),
        remote_addr: snapshot.remote_addr.clone(),
        header: snapshot.header.clone(),
        path: snapshot.path.clone(),
        query: snapshot.query.clone(),
        form: snapshot.form.clone(),
        params: snapshot.params.clone(),
        body: snapshot
            .body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned()),
        user_agent: snapshot.user_agent.clone(),
        referer: snapshot.referer.clone(),
        request_proto: snapshot.proto.clone(),
        response: response_body.map(|body| String::from_utf8_lossy(body).into_owned()),
    }
}
