// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Turning wire-level pieces into the structured parts of a record:
//! header lists, cookie/query/form maps, decoded bodies and the textual
//! request/response rendering shown to testers.

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use hyper::HeaderMap;
use std::collections::BTreeMap;
use std::io::{self, Read};
use tracing::warn;

/// Headers stripped before anything leaves the proxy.
pub static PROXY_ONLY_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

pub fn is_proxy_only_header(name: &str) -> bool {
    PROXY_ONLY_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Header list in arrival order. Repeated names are kept as separate entries.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// First value of a header, case-insensitively.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parses every `Cookie` header. Fragments without `=` are ignored.
pub fn parse_cookies(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for (_, value) in headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case("cookie")) {
        for part in value.split(';') {
            if let Some((name, val)) = part.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    cookies.insert(name.to_string(), val.trim().to_string());
                }
            }
        }
    }
    cookies
}

/// Query-string parameters; later duplicates win.
pub fn parse_query(url: &url::Url) -> BTreeMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Form parameters, only for `application/x-www-form-urlencoded` bodies.
pub fn parse_form(headers: &[(String, String)], body: &[u8]) -> BTreeMap<String, String> {
    let is_form = header_value(headers, "content-type")
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
        .unwrap_or(false);
    if !is_form {
        return BTreeMap::new();
    }
    url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Removes `Content-Encoding` layers (`gzip`, `x-gzip`, `deflate`, `identity`).
///
/// Layers are undone last-applied first. Unknown codings are an error so the
/// caller can decide what to keep.
pub fn decode_body(headers: &[(String, String)], body: &[u8]) -> io::Result<Bytes> {
    let codings: Vec<String> = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("content-encoding"))
        .flat_map(|(_, v)| v.split(','))
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty() && c != "identity")
        .collect();

    if codings.is_empty() || body.is_empty() {
        return Ok(Bytes::copy_from_slice(body));
    }

    let mut data = body.to_vec();
    for coding in codings.iter().rev() {
        data = match coding.as_str() {
            "gzip" | "x-gzip" => {
                let mut out = Vec::new();
                MultiGzDecoder::new(&data[..]).read_to_end(&mut out)?;
                out
            }
            "deflate" => inflate(&data)?,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported content-encoding: {other}"),
                ))
            }
        };
    }
    Ok(Bytes::from(data))
}

/// Body as it is stored on a record: decoded, or `None` when empty or when
/// the encoding cannot be undone. Encoded bytes are never stored.
pub fn stored_body(headers: &[(String, String)], body: &[u8]) -> Option<Bytes> {
    if body.is_empty() {
        return None;
    }
    match decode_body(headers, body) {
        Ok(decoded) if decoded.is_empty() => None,
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(len = body.len(), error = %e, "body could not be decoded, not stored");
            None
        }
    }
}

// "deflate" is zlib-wrapped per RFC 9110, but some servers send raw deflate.
fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match ZlibDecoder::new(data).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(_) => {
            out.clear();
            DeflateDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Renders `METHOD target VERSION`, headers and body as text.
pub fn render_raw_request(
    method: &str,
    target: &str,
    version: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> String {
    let start = format!("{method} {target} {version}");
    render_message(&start, headers, body)
}

/// Renders `VERSION status reason`, headers and body as text.
pub fn render_raw_response(
    version: &str,
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> String {
    let start = format!("{version} {status} {reason}");
    render_message(start.trim_end(), headers, body)
}

fn render_message(start: &str, headers: &[(String, String)], body: &[u8]) -> String {
    let mut out = String::with_capacity(start.len() + 64 + body.len());
    out.push_str(start);
    out.push_str("\r\n");
    for (k, v) in headers {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(body));
    out
}

/// Canonical reason phrase, empty for unregistered codes.
pub fn reason_phrase(status: u16) -> &'static str {
    hyper::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

pub fn format_http_version(v: hyper::Version) -> &'static str {
    match v {
        hyper::Version::HTTP_09 => "HTTP/0.9",
        hyper::Version::HTTP_10 => "HTTP/1.0",
        hyper::Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}
