// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use mitm_capture::api::{serve_api, ApiState};
use mitm_capture::ca::{CertificateAuthority, CertificateManager};
use mitm_capture::config::Config;
use mitm_capture::proxy::{serve, ProxyContext};
use mitm_capture::record::Record;
use mitm_capture::replay::Replayer;
use mitm_capture::scanner::{FileDictionary, ReflectionScanner};
use mitm_capture::sink::{CaptureSink, MemorySink};

pub struct TestProxy {
    pub addr: SocketAddr,
    pub sink: Arc<MemorySink>,
    pub ca: Arc<CertificateAuthority>,
    pub ctx: Arc<ProxyContext>,
    pub ca_dir: PathBuf,
    pub handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.handle.abort();
        let _ = std::fs::remove_dir_all(&self.ca_dir);
    }
}

// Start the proxy on an ephemeral port over a fresh CA and in-memory sink.
pub async fn start_proxy() -> anyhow::Result<TestProxy> {
    let ca_dir = std::env::temp_dir().join(format!("mitm_integ_ca_{}", uuid::Uuid::new_v4()));
    let ca =
        CertificateAuthority::load_or_generate(&ca_dir.join("ca.crt"), &ca_dir.join("ca.key"))
            .await?;
    let certs = Arc::new(CertificateManager::new(ca.clone(), None));

    let mut cfg = Config::default();
    cfg.upstream.connect_timeout_secs = 2;
    cfg.upstream.idle_timeout_secs = 5;

    let sink = Arc::new(MemorySink::new());
    let ctx = Arc::new(ProxyContext::new(&cfg, sink.clone(), certs, ca.clone())?);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let serve_ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let _ = serve(listener, serve_ctx, None).await;
    });

    Ok(TestProxy {
        addr,
        sink,
        ca,
        ctx,
        ca_dir,
        handle,
    })
}

// Start the control API over the proxy's sink. The dictionary file feeds both scan modes.
pub async fn start_api(
    proxy: &TestProxy,
    dictionary: PathBuf,
) -> anyhow::Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    let dict = Arc::new(FileDictionary::new(dictionary));
    let state = Arc::new(ApiState {
        sink: proxy.sink.clone(),
        replayer: Replayer::new(proxy.ctx.client.clone(), Duration::from_secs(5)),
        scanner: ReflectionScanner::new(
            proxy.ctx.client.clone(),
            dict.clone(),
            dict,
            2,
            Duration::from_secs(5),
        ),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = serve_api(listener, state).await;
    });
    Ok((handle, addr))
}

// Read until EOF, an error after some data, or the deadline.
pub async fn read_until_close<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            break;
        }
        match timeout(Duration::from_millis(500), stream.read(&mut tmp)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&tmp[..n]),
            Ok(Err(e)) if buf.is_empty() => return Err(e.into()),
            Ok(Err(_)) => break,
            Err(_) => continue,
        }
    }
    Ok(buf)
}

// Poll the sink until some record satisfies `pred`.
pub async fn wait_for_record<F>(sink: &MemorySink, pred: F) -> anyhow::Result<Record>
where
    F: Fn(&Record) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(rec) = sink.list_all().await?.into_iter().find(|r| pred(r)) {
            return Ok(rec);
        }
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!("timeout waiting for record"));
        }
        sleep(Duration::from_millis(50)).await;
    }
}
