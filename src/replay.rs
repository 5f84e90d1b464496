// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Re-sending a stored request and reporting exactly what the origin said.

use crate::error::{ProxyError, Result};
use crate::reconstruct::{decode_body, header_pairs, is_proxy_only_header, reason_phrase};
use crate::record::Record;
use crate::upstream::{send_and_collect, HttpClient};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Request};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Headers recomputed by the client for every send.
const RECOMPUTED_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Origin answer to a replayed request. Error statuses are ordinary summaries.
#[derive(Serialize, Debug, Clone)]
pub struct ResponseSummary {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    #[serde(
        serialize_with = "crate::serde_helpers::serialize_body",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Bytes>,
    pub elapsed_ms: u64,
}

pub struct Replayer {
    client: HttpClient,
    timeout: Duration,
}

impl Replayer {
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Sends the record's request once. Redirects are returned, not followed.
    pub async fn replay(&self, record: &Record) -> Result<ResponseSummary> {
        let req = build_request(record)?;
        debug!(id = %record.id, method = %record.method, url = %record.url, "replaying");

        let started = Instant::now();
        let resp = send_and_collect(&self.client, req, self.timeout)
            .await
            .map_err(|e| ProxyError::ReplayTransport(e.to_string()))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let status = resp.status.as_u16();
        let headers = header_pairs(&resp.headers);
        let body = decode_body(&headers, &resp.body).unwrap_or_else(|e| {
            warn!(id = %record.id, error = %e, "replayed body could not be decoded");
            resp.body.clone()
        });

        Ok(ResponseSummary {
            status,
            status_text: resp
                .reason
                .unwrap_or_else(|| reason_phrase(status).to_string()),
            headers,
            body: if body.is_empty() { None } else { Some(body) },
            elapsed_ms,
        })
    }
}

/// Outbound request for a stored record: same method, URL and headers, minus
/// proxy-only and framing headers.
pub fn build_request(record: &Record) -> Result<Request<Full<Bytes>>> {
    let method = Method::from_bytes(record.method.as_bytes())
        .map_err(|e| ProxyError::MalformedRequest(format!("method {}: {e}", record.method)))?;
    if method == Method::CONNECT {
        return Err(ProxyError::MalformedRequest(
            "CONNECT records carry no replayable request".into(),
        ));
    }

    let mut builder = Request::builder().method(method).uri(record.url.as_str());
    for (name, value) in &record.headers {
        if is_proxy_only_header(name)
            || RECOMPUTED_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
        {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!(id = %record.id, header = %name, "skipping unsendable header");
            continue;
        };
        builder = builder.header(name, value);
    }

    // The stored body is decoded, so its content-encoding no longer applies.
    if record.body.is_some() {
        if let Some(headers) = builder.headers_mut() {
            headers.remove(hyper::header::CONTENT_ENCODING);
        }
    }

    builder
        .body(Full::new(record.body.clone().unwrap_or_default()))
        .map_err(|e| ProxyError::MalformedRequest(format!("{}: {e}", record.url)))
}
