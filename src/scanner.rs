// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Parameter reflection scanning.
//!
//! For every name in a dictionary a fresh random marker is placed in that
//! query parameter of a stored GET request; a parameter is reported as
//! reflected when its marker comes back verbatim in the decoded body.

use crate::error::{ProxyError, Result};
use crate::reconstruct::{decode_body, header_pairs, is_proxy_only_header};
use crate::record::Record;
use crate::upstream::{send_and_collect, HttpClient};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::Request;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MARKER_LEN: usize = 16;

const DROPPED_HEADERS: &[&str] = &["content-length", "transfer-encoding"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Fast,
    Full,
}

/// Source of parameter names to scan.
#[async_trait]
pub trait ParamDictionary: Send + Sync {
    async fn names(&self) -> Result<Vec<String>>;
}

/// One name per line; blank lines and `#` comments are skipped, repeats dropped.
pub struct FileDictionary {
    path: PathBuf,
}

impl FileDictionary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ParamDictionary for FileDictionary {
    async fn names(&self) -> Result<Vec<String>> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_dictionary(&text))
    }
}

pub struct StaticDictionary(pub Vec<String>);

#[async_trait]
impl ParamDictionary for StaticDictionary {
    async fn names(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

pub fn parse_dictionary(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect()
}

/// Outcome for one scanned parameter, or the single entry of a refused scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamResult {
    pub param: Option<String>,
    pub marker: Option<String>,
    pub found: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl ParamResult {
    fn scan_error(reason: impl ToString) -> Self {
        Self {
            param: None,
            marker: None,
            found: false,
            status: None,
            error: Some(reason.to_string()),
        }
    }
}

pub struct ReflectionScanner {
    client: HttpClient,
    fast: Arc<dyn ParamDictionary>,
    full: Arc<dyn ParamDictionary>,
    concurrency: usize,
    timeout: Duration,
}

impl ReflectionScanner {
    pub fn new(
        client: HttpClient,
        fast: Arc<dyn ParamDictionary>,
        full: Arc<dyn ParamDictionary>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            fast,
            full,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// One result per dictionary name, in completion order. Non-GET records,
    /// unreadable dictionaries and unusable URLs yield a single error entry.
    pub async fn scan(&self, record: &Record, mode: ScanMode) -> Vec<ParamResult> {
        if !record.method.eq_ignore_ascii_case("GET") {
            return vec![ParamResult::scan_error(format!(
                "only GET requests can be scanned, got {}",
                record.method
            ))];
        }

        let dictionary = match mode {
            ScanMode::Fast => &self.fast,
            ScanMode::Full => &self.full,
        };
        let names = match dictionary.names().await {
            Ok(n) => n,
            Err(e) => {
                warn!(?mode, error = %e, "parameter dictionary unavailable");
                return vec![ParamResult::scan_error(format!("dictionary: {e}"))];
            }
        };
        let base = match url::Url::parse(&record.url) {
            Ok(u) => u,
            Err(e) => return vec![ParamResult::scan_error(format!("url {}: {e}", record.url))],
        };
        let headers = scan_headers(&record.headers);

        info!(id = %record.id, ?mode, params = names.len(), "scanning");
        let results: Vec<ParamResult> = stream::iter(names)
            .map(|name| self.try_param(&base, &headers, name))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        debug!(
            id = %record.id,
            reflected = results.iter().filter(|r| r.found).count(),
            "scan finished"
        );
        results
    }

    async fn try_param(
        &self,
        base: &url::Url,
        headers: &[(HeaderName, HeaderValue)],
        param: String,
    ) -> ParamResult {
        let marker = new_marker();
        let url = with_param(base, &param, &marker);

        let outcome = async {
            let mut builder = Request::get(url.as_str());
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
            let req = builder
                .body(Full::new(Bytes::new()))
                .map_err(|e| ProxyError::ScanParam {
                    param: param.clone(),
                    reason: e.to_string(),
                })?;
            send_and_collect(&self.client, req, self.timeout)
                .await
                .map_err(|e| ProxyError::ScanParam {
                    param: param.clone(),
                    reason: e.to_string(),
                })
        }
        .await;

        match outcome {
            Ok(resp) => {
                let pairs = header_pairs(&resp.headers);
                let body = decode_body(&pairs, &resp.body).unwrap_or(resp.body);
                ParamResult {
                    found: contains(&body, marker.as_bytes()),
                    param: Some(param),
                    marker: Some(marker),
                    status: Some(resp.status.as_u16()),
                    error: None,
                }
            }
            Err(e) => ParamResult {
                param: Some(param),
                marker: Some(marker),
                found: false,
                status: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Random alphanumeric marker, 62^16 possible values.
pub fn new_marker() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(MARKER_LEN)
        .map(char::from)
        .collect()
}

/// Copy of `base` with `param` set to `value`, replacing any existing values.
pub fn with_param(base: &url::Url, param: &str, value: &str) -> url::Url {
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, value);
    url
}

fn scan_headers(headers: &[(String, String)]) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter(|(k, _)| {
            !is_proxy_only_header(k) && !DROPPED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(k))
        })
        .filter_map(|(k, v)| {
            Some((
                HeaderName::from_bytes(k.as_bytes()).ok()?,
                HeaderValue::from_str(v).ok()?,
            ))
        })
        .collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
