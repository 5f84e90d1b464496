// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Forward proxy listener: plain-HTTP capture and CONNECT dispatch.

use crate::ca::{CertificateAuthority, CertificateManager};
use crate::config::Config;
use crate::connection::ConnectionMetadata;
use crate::error::{ProxyError, Result};
use crate::reconstruct::{
    format_http_version, header_pairs, is_proxy_only_header, reason_phrase, render_raw_response,
    stored_body,
};
use crate::record::{Record, RecordPatch, RecordResponse};
use crate::sink::CaptureSink;
use crate::upstream::{self, HttpClient, UpstreamResponse};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::{service::service_fn, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

pub type ProxyBody = BoxBody<Bytes, Infallible>;

type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<ProxyBody>>> + Send>>;

/// Origin-form path on the proxy itself that serves the root CA certificate.
pub const CA_CERT_PATH: &str = "/_proxy/cert";

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything a connection handler needs, shared across connections.
pub struct ProxyContext {
    pub client: HttpClient,
    pub sink: Arc<dyn CaptureSink>,
    pub certs: Arc<CertificateManager>,
    pub ca: Arc<CertificateAuthority>,
    pub connector: TlsConnector,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ProxyContext {
    pub fn new(
        cfg: &Config,
        sink: Arc<dyn CaptureSink>,
        certs: Arc<CertificateManager>,
        ca: Arc<CertificateAuthority>,
    ) -> Result<Self> {
        let connect_timeout = cfg.upstream.connect_timeout();
        Ok(Self {
            client: upstream::build_client(connect_timeout)?,
            sink,
            certs,
            ca,
            connector: upstream::tls_connector()?,
            connect_timeout,
            idle_timeout: cfg.upstream.idle_timeout(),
        })
    }
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).boxed()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

pub fn text_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(text));
    *resp.status_mut() = status;
    resp
}

pub async fn run_proxy(listen: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "proxy listening");
    serve(listener, ctx, None).await
}

/// Accept loop over an already bound listener.
///
/// When `accept_limit` is `Some(n)`, the loop returns after accepting `n`
/// connections. Handlers are spawned and may still be running when this
/// function returns.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    accept_limit: Option<usize>,
) -> anyhow::Result<()> {
    let server_builder = AutoConnBuilder::new(TokioExecutor::new());

    let mut remaining = accept_limit;
    loop {
        if let Some(0) = remaining {
            break;
        }

        let (stream, remote_addr) = listener.accept().await?;

        if let Some(ref mut n) = remaining {
            *n -= 1;
        }

        let ctx = ctx.clone();
        let builder_clone = server_builder.clone();
        tokio::spawn(async move {
            let conn_metadata = Arc::new(ConnectionMetadata::new(remote_addr));
            debug!(conn = %conn_metadata.id, remote = %remote_addr, "accepted connection");
            let service = {
                let conn_metadata = conn_metadata.clone();
                service_fn(move |req: Request<Incoming>| {
                    let ctx = ctx.clone();
                    let conn_metadata = conn_metadata.clone();
                    let fut: ServiceFuture =
                        Box::pin(async move { handle_request(req, ctx, conn_metadata).await });
                    fut
                })
            };

            let io = TokioIo::new(stream);
            if let Err(e) = builder_clone
                .serve_connection_with_upgrades(io, service)
                .await
            {
                debug!(conn = %conn_metadata.id, error = %e, "connection closed with error");
            }
            debug!(
                conn = %conn_metadata.id,
                elapsed_ms = conn_metadata.age_ms(),
                "connection finished"
            );
        });
    }

    Ok(())
}

/// Routes one proxied request. Only a failed CONNECT returns `Err`, which
/// makes hyper drop the connection without answering.
pub async fn handle_request<B>(
    req: Request<B>,
    ctx: Arc<ProxyContext>,
    conn: Arc<ConnectionMetadata>,
) -> Result<Response<ProxyBody>>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        return crate::tunnel::accept_connect(req, ctx, conn).await;
    }

    // Absolute-form targets belong to origins, even when the path matches.
    if req.method() == Method::GET
        && req.uri().authority().is_none()
        && req.uri().path() == CA_CERT_PATH
    {
        let pem = ctx.ca.get_ca_cert_pem();
        return Ok(Response::builder()
            .header("Content-Type", "application/x-x509-ca-cert")
            .header(
                "Content-Disposition",
                "attachment; filename=\"mitm-capture-ca.crt\"",
            )
            .body(full_body(pem.clone()))
            .unwrap_or_else(|_| Response::new(full_body(pem))));
    }

    Ok(forward_plain(req, ctx, conn).await)
}

/// Captures and forwards one plain-HTTP request.
async fn forward_plain<B>(
    req: Request<B>,
    ctx: Arc<ProxyContext>,
    conn: Arc<ConnectionMetadata>,
) -> Response<ProxyBody>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();

    let uri = match absolute_target(&req) {
        Ok(u) => u,
        Err(e) => {
            error!(conn = %conn.id, error = %e, "cannot forward request");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "malformed request");
        }
    };

    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
            error!(conn = %conn.id, error = %boxed, "failed to collect request body");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request body collect error",
            );
        }
    };

    let record = match Record::from_request(
        parts.method.as_str(),
        &uri,
        parts.version,
        &parts.headers,
        &body_bytes,
        false,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!(conn = %conn.id, %uri, error = %e, "cannot forward request");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "malformed request");
        }
    };

    let record_id = match ctx.sink.create(record).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(conn = %conn.id, %uri, error = %e, "failed to store record, forwarding uncaptured");
            None
        }
    };

    let mut builder = Request::builder().method(parts.method.clone()).uri(uri.clone());
    for (name, value) in parts.headers.iter() {
        // The body is re-framed from the buffered bytes.
        if is_proxy_only_header(name.as_str()) || *name == hyper::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(Full::new(body_bytes)) {
        Ok(r) => r,
        Err(e) => {
            error!(conn = %conn.id, %uri, error = %e, "failed to build upstream request");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "malformed request");
        }
    };

    let resp = match upstream::send_and_collect(&ctx.client, upstream_req, ctx.idle_timeout).await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(conn = %conn.id, %uri, error = %e, "upstream request failed");
            return text_response(StatusCode::BAD_GATEWAY, "upstream error");
        }
    };

    info!(
        conn = %conn.id,
        method = %parts.method,
        %uri,
        status = resp.status.as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "proxied"
    );

    if let Some(id) = record_id {
        let patch = RecordPatch::response(record_response(&resp));
        if let Err(e) = ctx.sink.update(id, patch).await {
            warn!(record = %id, error = %e, "failed to store response");
        }
    }

    downstream_response(resp)
}

/// Absolute target for a proxied request.
///
/// Origin-form targets are addressed to the proxy itself and are refused, so a
/// `Host` naming the listener can never make the proxy call itself.
fn absolute_target<B>(req: &Request<B>) -> Result<Uri> {
    let uri = req.uri();
    match (uri.scheme_str(), uri.authority()) {
        (Some("http" | "https"), Some(_)) => Ok(uri.clone()),
        (_, None) => Err(ProxyError::MalformedRequest(format!(
            "{uri}: origin-form target on a forward proxy"
        ))),
        (scheme, Some(_)) => Err(ProxyError::MalformedRequest(format!(
            "{uri}: unsupported scheme {}",
            scheme.unwrap_or("<none>")
        ))),
    }
}

/// Stored form of an origin response: decoded body and textual rendering.
pub fn record_response(resp: &UpstreamResponse) -> RecordResponse {
    let status = resp.status.as_u16();
    let headers = header_pairs(&resp.headers);
    let body = stored_body(&headers, &resp.body);
    let status_text = resp
        .reason
        .clone()
        .unwrap_or_else(|| reason_phrase(status).to_string());
    let raw = render_raw_response(
        format_http_version(resp.version),
        status,
        &status_text,
        &headers,
        body.as_deref().unwrap_or_default(),
    );
    RecordResponse {
        status,
        status_text,
        headers,
        body,
        raw,
    }
}

// The client receives the origin's bytes untouched, minus hop-by-hop headers.
fn downstream_response(resp: UpstreamResponse) -> Response<ProxyBody> {
    let mut resp_builder = Response::builder().status(resp.status);
    if let Some(reason) = resp.reason.as_deref() {
        if let Ok(phrase) = hyper::ext::ReasonPhrase::try_from(reason.as_bytes().to_vec()) {
            resp_builder = resp_builder.extension(phrase);
        }
    }

    let connection_hop_headers =
        parse_connection_tokens(resp.headers.get(hyper::header::CONNECTION));
    for (name, value) in resp.headers.iter() {
        let name_str = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_header(&name_str, &connection_hop_headers) {
            continue;
        }
        resp_builder = resp_builder.header(name, value);
    }
    resp_builder
        .body(full_body(resp.body.clone()))
        .unwrap_or_else(|_| Response::new(full_body(resp.body)))
}

// Parse a Connection header value into a lowercased set of tokens
fn parse_connection_tokens(val: Option<&hyper::header::HeaderValue>) -> HashSet<String> {
    let mut set = HashSet::new();
    if let Some(conn_val) = val {
        if let Ok(conn_str) = conn_val.to_str() {
            for token in conn_str.split(',') {
                let trimmed = token.trim().to_ascii_lowercase();
                if !trimmed.is_empty() {
                    set.insert(trimmed);
                }
            }
        }
    }
    set
}

fn is_hop_by_hop_header(name: &str, connection_hop_headers: &HashSet<String>) -> bool {
    connection_hop_headers.contains(name) || HOP_BY_HOP_HEADERS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::test_helpers::{make_test_context, make_test_context_with};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tokio::fs;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn conn() -> Arc<ConnectionMetadata> {
        Arc::new(ConnectionMetadata::new(
            "127.0.0.1:12345".parse().expect("addr"),
        ))
    }

    fn make_request_with_headers(
        method: &str,
        uri: impl AsRef<str>,
        headers: &[(&str, &str)],
    ) -> anyhow::Result<Request<ProxyBody>> {
        let mut builder = Request::builder().method(method).uri(uri.as_ref());
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        Ok(builder.body(empty_body())?)
    }

    async fn only_record(sink: &MemorySink) -> anyhow::Result<Record> {
        let mut all = sink.list_all().await?;
        assert_eq!(all.len(), 1);
        Ok(all.remove(0))
    }

    #[tokio::test]
    async fn forwards_and_captures() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("x", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock)
            .await;

        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", format!("{}/?x=1", mock.uri()), &[])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 200);
        let body = resp.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"ok");

        let rec = only_record(&sink).await?;
        assert_eq!(rec.method, "GET");
        assert_eq!(rec.query_params.get("x").map(String::as_str), Some("1"));
        assert!(!rec.is_tls);
        let response = rec.response.expect("response stored");
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some(&b"ok"[..]));

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn gzip_is_decoded_for_storage_only() -> anyhow::Result<()> {
        let mut e = GzEncoder::new(Vec::new(), Compression::default());
        e.write_all(b"compressed payload")?;
        let gz = e.finish()?;

        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(gz.clone())
                    .insert_header("content-encoding", "gzip"),
            )
            .mount(&mock)
            .await;

        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", format!("{}/gz", mock.uri()), &[])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(
            resp.headers()
                .get("content-encoding")
                .and_then(|v| v.to_str().ok()),
            Some("gzip")
        );
        let relayed = resp.into_body().collect().await?.to_bytes();
        assert_eq!(&relayed[..], &gz[..]);

        let stored = only_record(&sink).await?.response.expect("response");
        assert_eq!(stored.body.as_deref(), Some(&b"compressed payload"[..]));

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn proxy_only_headers_are_stripped() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/h"))
            .and(header_exists("x-keep"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock)
            .await;

        let (ctx, _sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers(
            "GET",
            format!("{}/h", mock.uri()),
            &[
                ("proxy-connection", "keep-alive"),
                ("proxy-authorization", "Basic Zm9vOmJhcg=="),
                ("x-keep", "1"),
            ],
        )?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 200);

        let received = mock.received_requests().await.unwrap_or_default();
        assert_eq!(received.len(), 1);
        assert!(received[0].headers.get("proxy-connection").is_none());
        assert!(received[0].headers.get("proxy-authorization").is_none());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_body_is_relayed_but_not_stored() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"definitely not gzip".to_vec())
                    .insert_header("content-encoding", "gzip"),
            )
            .mount(&mock)
            .await;

        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", format!("{}/broken", mock.uri()), &[])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 200);
        let body = resp.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"definitely not gzip");

        let response = only_record(&sink).await?.response.expect("response stored");
        assert_eq!(response.status, 200);
        assert!(response.body.is_none());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn upstream_error_is_502_and_record_stays_open() -> anyhow::Result<()> {
        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", "http://127.0.0.1:9/", &[])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 502);

        let rec = only_record(&sink).await?;
        assert!(rec.response.is_none());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn origin_form_request_is_not_forwarded_to_host() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(0)
            .mount(&mock)
            .await;

        let (ctx, sink, ca_dir) = make_test_context().await;
        let host = mock.address().to_string();
        let req = make_request_with_headers("GET", "/rel", &[("host", host.as_str())])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 500);
        let body = resp.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"malformed request");
        assert!(sink.is_empty());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn origin_cert_path_is_forwarded() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CA_CERT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("origin owned"))
            .expect(1)
            .mount(&mock)
            .await;

        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", format!("{}{CA_CERT_PATH}", mock.uri()), &[])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 200);
        let body = resp.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"origin owned");
        assert_eq!(only_record(&sink).await?.path, CA_CERT_PATH);

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_target_is_500_without_details() -> anyhow::Result<()> {
        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", "/no-host", &[])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 500);
        let body = resp.into_body().collect().await?.to_bytes();
        assert_eq!(&body[..], b"malformed request");
        assert!(sink.is_empty());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn serves_ca_cert() -> anyhow::Result<()> {
        let (ctx, _sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", CA_CERT_PATH, &[])?;
        let resp = handle_request(req, ctx, conn()).await?;
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("application/x-x509-ca-cert")
        );
        let body = resp.into_body().collect().await?.to_bytes();
        assert!(String::from_utf8(body.to_vec())?.contains("BEGIN CERTIFICATE"));

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn connect_answers_and_stores_metadata_record() -> anyhow::Result<()> {
        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("CONNECT", "secure.example.com:443", &[])?;
        let resp = handle_request(req, ctx.clone(), conn()).await?;
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.extensions()
                .get::<hyper::ext::ReasonPhrase>()
                .map(|r| r.as_bytes().to_vec()),
            Some(b"Connection Established".to_vec())
        );
        assert!(ctx.certs.cached("secure.example.com").is_some());

        let rec = only_record(&sink).await?;
        assert_eq!(rec.method, "CONNECT");
        assert_eq!(rec.host, "secure.example.com");
        assert!(rec.is_tls);
        assert!(rec.response.is_none());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    struct FailingIssuer;

    impl crate::ca::LeafIssuer for FailingIssuer {
        fn issue(&self, _host: &str) -> anyhow::Result<crate::ca::IssuedLeaf> {
            anyhow::bail!("issuer unavailable")
        }
    }

    #[tokio::test]
    async fn connect_with_failed_issuance_drops_without_200() -> anyhow::Result<()> {
        let certs = Arc::new(CertificateManager::new(Arc::new(FailingIssuer), None));
        let (ctx, sink, ca_dir) = make_test_context_with(certs).await;
        let req = make_request_with_headers("CONNECT", "secure.example.com:443", &[])?;
        let err = handle_request(req, ctx, conn())
            .await
            .expect_err("issuance failure must abort");
        assert!(matches!(err, ProxyError::CertificateIssuance { .. }));
        // The metadata record was already stored before issuance.
        assert!(only_record(&sink).await?.response.is_none());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn connect_without_port_defaults_to_443() -> anyhow::Result<()> {
        let (ctx, sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("CONNECT", "noport.example.com", &[])?;
        let _ = handle_request(req, ctx, conn()).await?;
        assert_eq!(only_record(&sink).await?.port, 443);
        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn filters_hop_by_hop_headers() -> anyhow::Result<()> {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hop"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("ok")
                    .insert_header("connection", "keep-alive, foo")
                    .insert_header("foo", "bar")
                    .insert_header("x-end-to-end", "1"),
            )
            .mount(&mock)
            .await;

        let (ctx, _sink, ca_dir) = make_test_context().await;
        let req = make_request_with_headers("GET", format!("{}/hop", mock.uri()), &[])?;
        let resp = handle_request(req, ctx, conn()).await?;

        assert!(resp.headers().get("connection").is_none());
        assert!(resp.headers().get("foo").is_none());
        assert!(resp.headers().get("x-end-to-end").is_some());

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        let set: HashSet<String> = HashSet::new();
        for &h in HOP_BY_HOP_HEADERS.iter() {
            assert!(is_hop_by_hop_header(h, &set));
        }
        assert!(!is_hop_by_hop_header("x-not-hop", &set));

        let mut conn_set: HashSet<String> = HashSet::new();
        conn_set.insert("x-not-hop".to_string());
        assert!(is_hop_by_hop_header("x-not-hop", &conn_set));
    }

    #[test]
    fn parse_connection_tokens_handles_odd_values() {
        use hyper::header::HeaderValue;
        let parsed = parse_connection_tokens(Some(&HeaderValue::from_static("keep-alive, Foo ,")));
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains("foo"));

        let hv = HeaderValue::from_bytes(&[0xffu8]).expect("create header val");
        assert!(parse_connection_tokens(Some(&hv)).is_empty());
    }

    #[tokio::test]
    async fn serve_with_limit_accepts_one_connection_and_returns() -> anyhow::Result<()> {
        let (ctx, _sink, ca_dir) = make_test_context().await;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(serve(listener, ctx, Some(1)));

        let stream = tokio::net::TcpStream::connect(addr).await?;
        let res = tokio::time::timeout(Duration::from_secs(2), task).await??;
        assert!(res.is_ok());
        drop(stream);

        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn run_proxy_bind_fails_when_port_taken() -> anyhow::Result<()> {
        let l = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = l.local_addr()?;
        let (ctx, _sink, ca_dir) = make_test_context().await;
        assert!(run_proxy(addr, ctx).await.is_err());
        drop(l);
        let _ = fs::remove_dir_all(&ca_dir).await;
        Ok(())
    }

    #[test]
    fn record_response_prefers_origin_reason() {
        let resp = UpstreamResponse {
            status: StatusCode::OK,
            reason: Some("Fine".into()),
            version: hyper::Version::HTTP_11,
            headers: hyper::HeaderMap::new(),
            body: Bytes::from_static(b"x"),
        };
        let stored = record_response(&resp);
        assert_eq!(stored.status_text, "Fine");
        assert!(stored.raw.starts_with("HTTP/1.1 200 Fine\r\n"));
    }
}
