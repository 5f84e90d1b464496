// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use crate::ca::{CertificateAuthority, CertificateManager};
use crate::config::Config;
use crate::proxy::ProxyContext;
use crate::record::Record;
use crate::sink::MemorySink;
use hyper::HeaderMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Build a HeaderMap from (name, value) pairs, appending repeated names.
pub fn make_headers_from_pairs(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut hm = HeaderMap::new();
    for (k, v) in pairs {
        let name = hyper::header::HeaderName::from_bytes(k.as_bytes()).expect("valid header name");
        hm.append(name, v.parse().expect("valid header value"));
    }
    hm
}

/// A GET record for `http://example.com/?x=1` with no response yet.
pub fn make_test_record() -> Record {
    make_test_record_for("GET", "http://example.com/?x=1")
}

pub fn make_test_record_for(method: &str, url: &str) -> Record {
    let uri: hyper::Uri = url.parse().expect("valid test url");
    let headers = make_headers_from_pairs(&[("host", "example.com"), ("user-agent", "test-agent")]);
    Record::from_request(method, &uri, hyper::Version::HTTP_11, &headers, b"", false)
        .expect("valid test record")
}

/// Unique path under the system temp dir.
pub fn temp_path(prefix: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}_{}.{ext}", Uuid::new_v4()))
}

/// Certificate manager backed by a throwaway CA; returns the CA dir for cleanup.
pub async fn make_test_cert_manager() -> (Arc<CertificateManager>, Arc<CertificateAuthority>, PathBuf) {
    let dir = std::env::temp_dir().join(format!("mitm_test_ca_{}", Uuid::new_v4()));
    let ca = CertificateAuthority::load_or_generate(&dir.join("ca.crt"), &dir.join("ca.key"))
        .await
        .expect("generate test CA");
    let manager = Arc::new(CertificateManager::new(ca.clone(), None));
    (manager, ca, dir)
}

/// Proxy context over a fresh `MemorySink` and throwaway CA.
pub async fn make_test_context() -> (Arc<ProxyContext>, Arc<MemorySink>, PathBuf) {
    let (certs, ca, dir) = make_test_cert_manager().await;
    make_context(certs, ca, dir)
}

/// Like [`make_test_context`] but with a caller-supplied certificate manager.
pub async fn make_test_context_with(
    certs: Arc<CertificateManager>,
) -> (Arc<ProxyContext>, Arc<MemorySink>, PathBuf) {
    let (_, ca, dir) = make_test_cert_manager().await;
    make_context(certs, ca, dir)
}

fn make_context(
    certs: Arc<CertificateManager>,
    ca: Arc<CertificateAuthority>,
    dir: PathBuf,
) -> (Arc<ProxyContext>, Arc<MemorySink>, PathBuf) {
    let sink = Arc::new(MemorySink::new());
    let mut cfg = Config::default();
    cfg.upstream.connect_timeout_secs = 2;
    cfg.upstream.idle_timeout_secs = 5;
    let ctx = ProxyContext::new(&cfg, sink.clone(), certs, ca).expect("test proxy context");
    (Arc::new(ctx), sink, dir)
}
