// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Canonical captured transaction used across capture, storage, replay and scanning.

use crate::error::{ProxyError, Result};
use crate::reconstruct::{
    format_http_version, header_pairs, parse_cookies, parse_form, parse_query, render_raw_request,
    stored_body,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::{HeaderMap, Uri};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Origin response attached to a record. Set exactly once.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    /// Body with any content-encoding removed.
    #[serde(
        default,
        serialize_with = "crate::serde_helpers::serialize_body",
        deserialize_with = "crate::serde_helpers::deserialize_body"
    )]
    pub body: Option<Bytes>,
    /// Wire-format rendering of the response.
    pub raw: String,
}

/// One captured request and, once the origin answered, its response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub cookies: BTreeMap<String, String>,
    #[serde(rename = "get_params")]
    pub query_params: BTreeMap<String, String>,
    #[serde(rename = "post_params")]
    pub form_params: BTreeMap<String, String>,
    /// Request payload with any content-encoding removed.
    #[serde(
        default,
        serialize_with = "crate::serde_helpers::serialize_body",
        deserialize_with = "crate::serde_helpers::deserialize_body"
    )]
    pub body: Option<Bytes>,
    pub raw_request: String,
    pub is_tls: bool,
    pub response: Option<RecordResponse>,
    pub created_at: DateTime<Utc>,
}

/// Fields a sink may change after creation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub raw_request: Option<String>,
    pub response: Option<RecordResponse>,
}

impl RecordPatch {
    pub fn response(response: RecordResponse) -> Self {
        Self {
            raw_request: None,
            response: Some(response),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw_request.is_none() && self.response.is_none()
    }

    /// Fails when the patch would attach a second response.
    pub fn check(&self, record: &Record) -> Result<()> {
        if self.response.is_some() && record.response.is_some() {
            return Err(ProxyError::AlreadyFinalized(record.id.to_string()));
        }
        Ok(())
    }

    /// Applies the patch. A response can only be attached to a record that has none.
    pub fn apply(self, record: &mut Record) -> Result<()> {
        self.check(record)?;
        if let Some(raw) = self.raw_request {
            record.raw_request = raw;
        }
        if let Some(response) = self.response {
            record.response = Some(response);
        }
        Ok(())
    }
}

impl Record {
    /// Builds a record from a proxied request with an absolute target.
    pub fn from_request(
        method: &str,
        uri: &Uri,
        version: hyper::Version,
        headers: &HeaderMap,
        body: &[u8],
        is_tls: bool,
    ) -> Result<Self> {
        let url = url::Url::parse(&uri.to_string())
            .map_err(|e| ProxyError::MalformedRequest(format!("{uri}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::MalformedRequest(format!("{uri}: missing host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::MalformedRequest(format!("{uri}: unknown port")))?;

        let headers = header_pairs(headers);
        let decoded = stored_body(&headers, body);

        let raw_request = render_raw_request(
            method,
            &uri.to_string(),
            format_http_version(version),
            &headers,
            decoded.as_deref().unwrap_or_default(),
        );

        Ok(Self {
            id: Uuid::new_v4(),
            method: method.to_string(),
            scheme: url.scheme().to_string(),
            path: url.path().to_string(),
            cookies: parse_cookies(&headers),
            query_params: parse_query(&url),
            form_params: decoded
                .as_deref()
                .map(|b| parse_form(&headers, b))
                .unwrap_or_default(),
            url: url.to_string(),
            host,
            port,
            headers,
            body: decoded,
            raw_request,
            is_tls,
            response: None,
            created_at: Utc::now(),
        })
    }

    /// Metadata-only record for a `CONNECT host:port` tunnel.
    pub fn from_connect(authority: &str, headers: &HeaderMap) -> Result<Self> {
        let (host, port) = split_authority(authority)?;
        let headers = header_pairs(headers);
        let url_host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.clone()
        };
        let raw_request = render_raw_request("CONNECT", authority, "HTTP/1.1", &headers, b"");

        Ok(Self {
            id: Uuid::new_v4(),
            method: "CONNECT".to_string(),
            url: format!("https://{url_host}:{port}/"),
            scheme: "https".to_string(),
            host,
            port,
            path: String::new(),
            cookies: parse_cookies(&headers),
            query_params: BTreeMap::new(),
            form_params: BTreeMap::new(),
            headers,
            body: None,
            raw_request,
            is_tls: true,
            response: None,
            created_at: Utc::now(),
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Splits `host:port` (IPv6 in brackets). The port defaults to 443.
pub fn split_authority(authority: &str) -> Result<(String, u16)> {
    let parsed: hyper::http::uri::Authority = authority
        .parse()
        .map_err(|e| ProxyError::MalformedRequest(format!("bad CONNECT target {authority}: {e}")))?;
    let host = parsed
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return Err(ProxyError::MalformedRequest(format!(
            "bad CONNECT target {authority}: empty host"
        )));
    }
    Ok((host, parsed.port_u16().unwrap_or(443)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_headers_from_pairs, make_test_record};
    use rstest::rstest;

    #[test]
    fn from_request_parses_target_and_params() -> anyhow::Result<()> {
        let headers = make_headers_from_pairs(&[
            ("host", "example.com"),
            ("cookie", "sid=42; theme=dark"),
            ("proxy-connection", "keep-alive"),
        ]);
        let uri: Uri = "http://example.com/search?x=1&q=rust".parse()?;
        let rec = Record::from_request("GET", &uri, hyper::Version::HTTP_11, &headers, b"", false)?;

        assert_eq!(rec.method, "GET");
        assert_eq!(rec.host, "example.com");
        assert_eq!(rec.port, 80);
        assert_eq!(rec.scheme, "http");
        assert_eq!(rec.path, "/search");
        assert_eq!(rec.query_params.get("x").map(String::as_str), Some("1"));
        assert_eq!(rec.cookies.get("theme").map(String::as_str), Some("dark"));
        assert!(rec.body.is_none());
        assert!(rec.response.is_none());
        assert!(!rec.is_tls);
        assert!(rec
            .raw_request
            .starts_with("GET http://example.com/search?x=1&q=rust HTTP/1.1\r\n"));
        Ok(())
    }

    #[test]
    fn from_request_decodes_form_body() -> anyhow::Result<()> {
        let headers =
            make_headers_from_pairs(&[("content-type", "application/x-www-form-urlencoded")]);
        let uri: Uri = "http://example.com:8080/login".parse()?;
        let rec = Record::from_request(
            "POST",
            &uri,
            hyper::Version::HTTP_11,
            &headers,
            b"user=a&pw=b",
            false,
        )?;
        assert_eq!(rec.port, 8080);
        assert_eq!(rec.form_params.get("user").map(String::as_str), Some("a"));
        assert_eq!(rec.body.as_deref(), Some(&b"user=a&pw=b"[..]));
        Ok(())
    }

    #[test]
    fn relative_target_is_malformed() -> anyhow::Result<()> {
        let uri: Uri = "/only/a/path".parse()?;
        let err = Record::from_request("GET", &uri, hyper::Version::HTTP_11, &HeaderMap::new(), b"", false)
            .expect_err("relative target must fail");
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
        Ok(())
    }

    #[rstest]
    #[case("secure.example.com:443", "secure.example.com", 443)]
    #[case("secure.example.com", "secure.example.com", 443)]
    #[case("10.0.0.1:8443", "10.0.0.1", 8443)]
    #[case("[::1]:9443", "::1", 9443)]
    fn connect_authorities(#[case] authority: &str, #[case] host: &str, #[case] port: u16) {
        let rec = Record::from_connect(authority, &HeaderMap::new()).expect("valid authority");
        assert_eq!(rec.host, host);
        assert_eq!(rec.port, port);
        assert!(rec.is_tls);
        assert_eq!(rec.method, "CONNECT");
        assert!(rec.response.is_none());
    }

    #[test]
    fn connect_rejects_garbage() {
        assert!(Record::from_connect("not a host", &HeaderMap::new()).is_err());
        assert!(Record::from_connect(":443", &HeaderMap::new()).is_err());
    }

    #[test]
    fn patch_sets_response_only_once() {
        let mut rec = make_test_record();
        let response = RecordResponse {
            status: 200,
            status_text: "OK".into(),
            headers: Vec::new(),
            body: Some(Bytes::from_static(b"ok")),
            raw: "HTTP/1.1 200 OK\r\n\r\nok".into(),
        };

        RecordPatch::response(response.clone()).apply(&mut rec).expect("first");
        assert_eq!(rec.response.as_ref().map(|r| r.status), Some(200));

        let err = RecordPatch::response(response).apply(&mut rec).expect_err("second");
        assert!(matches!(err, ProxyError::AlreadyFinalized(_)));

        // raw_request-only patches are still allowed
        RecordPatch {
            raw_request: Some("GET / HTTP/1.1\r\n\r\n".into()),
            response: None,
        }
        .apply(&mut rec)
        .expect("raw patch");
        assert_eq!(rec.raw_request, "GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn serde_uses_wire_names() -> anyhow::Result<()> {
        let rec = make_test_record();
        let v = serde_json::to_value(&rec)?;
        assert_eq!(v["get_params"]["x"], "1");
        assert!(v["post_params"].is_object());
        assert!(v["response"].is_null());

        let back: Record = serde_json::from_value(v)?;
        assert_eq!(back, rec);
        Ok(())
    }
}
