// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! CONNECT handling: TLS termination toward the client, a fresh TLS session
//! toward the origin, and a byte relay between the two that copies traffic
//! into the capture side channel.

use crate::connection::ConnectionMetadata;
use crate::error::{ProxyError, Result};
use crate::proxy::{text_response, ProxyBody, ProxyContext};
use crate::reassembly::Reassembler;
use crate::record::Record;
use bytes::Bytes;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::sign::CertifiedKey;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const RELAY_BUF_SIZE: usize = 16 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Accepted,
    CertReady,
    TlsEstablishedClient,
    OriginConnecting,
    OriginTlsEstablished,
    Relaying,
    Closed,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::CertReady => "cert_ready",
            Self::TlsEstablishedClient => "tls_established_client",
            Self::OriginConnecting => "origin_connecting",
            Self::OriginTlsEstablished => "origin_tls_established",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Accepted => Some(Self::CertReady),
            Self::CertReady => Some(Self::TlsEstablishedClient),
            Self::TlsEstablishedClient => Some(Self::OriginConnecting),
            Self::OriginConnecting => Some(Self::OriginTlsEstablished),
            Self::OriginTlsEstablished => Some(Self::Relaying),
            Self::Relaying => Some(Self::Closed),
            Self::Closed => None,
        }
    }

    /// Moves forward one step, or to `Closed` from anywhere but `Closed`.
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Closed, _) => false,
            (_, Self::Closed) => true,
            (from, to) => from.next() == Some(to),
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One CONNECT tunnel and the record it feeds.
#[derive(Debug)]
pub struct Tunnel {
    pub host: String,
    pub port: u16,
    pub record_id: Uuid,
    pub conn_id: Uuid,
    state: TunnelState,
}

impl Tunnel {
    pub fn new(host: String, port: u16, record_id: Uuid, conn_id: Uuid) -> Self {
        Self {
            host,
            port,
            record_id,
            conn_id,
            state: TunnelState::Accepted,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn advance(&mut self, to: TunnelState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(ProxyError::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        trace!(conn = %self.conn_id, host = %self.host, from = %self.state, %to, "tunnel state");
        self.state = to;
        Ok(())
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if self.state != TunnelState::Closed {
            trace!(conn = %self.conn_id, host = %self.host, from = %self.state, "tunnel closed");
            self.state = TunnelState::Closed;
        }
    }

    fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Answers a CONNECT request.
///
/// The record is stored and the leaf certificate obtained before `200` is
/// sent. If issuance fails the error is returned so the connection is dropped
/// without a response.
pub async fn accept_connect<B>(
    req: Request<B>,
    ctx: Arc<ProxyContext>,
    conn: Arc<ConnectionMetadata>,
) -> Result<Response<ProxyBody>>
where
    B: Send + 'static,
{
    let authority = match req.uri().authority() {
        Some(a) => a.to_string(),
        None => {
            warn!(conn = %conn.id, uri = %req.uri(), "CONNECT without authority");
            return Ok(text_response(StatusCode::BAD_REQUEST, "bad CONNECT target"));
        }
    };
    let record = match Record::from_connect(&authority, req.headers()) {
        Ok(r) => r,
        Err(e) => {
            warn!(conn = %conn.id, error = %e, "rejecting CONNECT");
            return Ok(text_response(StatusCode::BAD_REQUEST, "bad CONNECT target"));
        }
    };

    let mut tunnel = Tunnel::new(record.host.clone(), record.port, record.id, conn.id);
    if let Err(e) = ctx.sink.create(record).await {
        error!(conn = %conn.id, error = %e, "failed to store CONNECT record");
        return Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "capture storage unavailable",
        ));
    }
    info!(conn = %conn.id, host = %tunnel.host, port = tunnel.port, record = %tunnel.record_id, "CONNECT accepted");

    let cert = match ctx.certs.certificate_for(&tunnel.host).await {
        Ok(c) => c,
        Err(e) => {
            error!(conn = %conn.id, host = %tunnel.host, error = %e, "aborting tunnel");
            tunnel.close();
            return Err(e);
        }
    };
    tunnel.advance(TunnelState::CertReady)?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = run_tunnel(TokioIo::new(upgraded), &mut tunnel, cert, ctx).await {
                    warn!(conn = %tunnel.conn_id, host = %tunnel.host, state = %tunnel.state(), error = %e, "tunnel failed");
                }
            }
            Err(e) => error!(conn = %tunnel.conn_id, host = %tunnel.host, error = %e, "upgrade failed"),
        }
        tunnel.close();
    });

    let mut resp = Response::new(crate::proxy::empty_body());
    resp.extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    Ok(resp)
}

/// Drives an upgraded CONNECT stream from client TLS to close.
///
/// On return the tunnel is `Closed`, both sockets are released and the
/// record has been patched with whatever the side channel captured.
pub async fn run_tunnel<IO>(
    io: IO,
    tunnel: &mut Tunnel,
    fallback: Arc<CertifiedKey>,
    ctx: Arc<ProxyContext>,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let result = drive(io, tunnel, fallback, &ctx).await;
    tunnel.close();
    result
}

async fn drive<IO>(
    io: IO,
    tunnel: &mut Tunnel,
    fallback: Arc<CertifiedKey>,
    ctx: &ProxyContext,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io)
        .await
        .map_err(|e| ProxyError::ClientTls(e.to_string()))?;

    // The resolver only reads the cache, so warm it for the SNI name first.
    let sni = start.client_hello().server_name().map(str::to_string);
    if let Some(name) = sni.as_deref() {
        if !name.eq_ignore_ascii_case(&tunnel.host) {
            if let Err(e) = ctx.certs.certificate_for(name).await {
                warn!(conn = %tunnel.conn_id, sni = %name, error = %e, "no certificate for SNI name");
            }
        }
    }

    let config = ctx.certs.server_config(fallback)?;
    let client_tls = start
        .into_stream(config)
        .await
        .map_err(|e| ProxyError::ClientTls(e.to_string()))?;
    tunnel.advance(TunnelState::TlsEstablishedClient)?;

    tunnel.advance(TunnelState::OriginConnecting)?;
    let target = tunnel.target();
    let tcp = tokio::time::timeout(
        ctx.connect_timeout,
        TcpStream::connect((tunnel.host.as_str(), tunnel.port)),
    )
    .await
    .map_err(|_| ProxyError::upstream_connect(&target, "timed out"))?
    .map_err(|e| ProxyError::upstream_connect(&target, e))?;

    let server_name = ServerName::try_from(sni.unwrap_or_else(|| tunnel.host.clone()))
        .map_err(|e| ProxyError::upstream_tls(&target, e))?;
    let origin_tls = tokio::time::timeout(ctx.connect_timeout, ctx.connector.connect(server_name, tcp))
        .await
        .map_err(|_| ProxyError::upstream_tls(&target, "handshake timed out"))?
        .map_err(|e| ProxyError::upstream_tls(&target, e))?;
    tunnel.advance(TunnelState::OriginTlsEstablished)?;

    let (tap, taps) = mpsc::unbounded_channel();
    let capture = spawn_capture(ctx, tunnel.record_id, taps);

    tunnel.advance(TunnelState::Relaying)?;
    let stats = relay(client_tls, origin_tls, ctx.idle_timeout, Some(tap)).await;
    debug!(
        conn = %tunnel.conn_id,
        host = %tunnel.host,
        up = stats.client_to_origin,
        down = stats.origin_to_client,
        ended = ?stats.ended_by,
        "relay finished"
    );

    if let Err(e) = capture.await {
        warn!(conn = %tunnel.conn_id, error = %e, "capture task failed");
    }
    Ok(())
}

/// Bytes observed by the relay, tagged with the direction they travelled.
#[derive(Debug, Clone)]
pub enum Tap {
    Client(Bytes),
    Origin(Bytes),
}

fn spawn_capture(
    ctx: &ProxyContext,
    record_id: Uuid,
    mut taps: mpsc::UnboundedReceiver<Tap>,
) -> tokio::task::JoinHandle<()> {
    let sink = ctx.sink.clone();
    tokio::spawn(async move {
        let mut reassembler = Reassembler::new();
        while let Some(tap) = taps.recv().await {
            match tap {
                Tap::Client(b) => reassembler.push_client(&b),
                Tap::Origin(b) => reassembler.push_origin(&b),
            }
        }
        let patch = reassembler.finish().into_patch();
        if patch.is_empty() {
            return;
        }
        if let Err(e) = sink.update(record_id, patch).await {
            warn!(record = %record_id, error = %e, "failed to store tunnel capture");
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    OriginClosed,
    ClientError,
    OriginError,
    Idle,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
    pub ended_by: RelayEnd,
}

/// Copies bytes both ways until one side closes, fails, or both sides stay
/// silent for `idle`. Both write halves are then shut down, so the end of
/// either leg ends the other.
pub async fn relay<C, O>(
    client: C,
    origin: O,
    idle: Duration,
    tap: Option<mpsc::UnboundedSender<Tap>>,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut origin_rd, mut origin_wr) = tokio::io::split(origin);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);

    let ended_by = {
        let activity = Activity {
            started,
            last: &last_activity,
        };
        let upstream = pump(
            &mut client_rd,
            &mut origin_wr,
            &up,
            activity,
            tap.clone(),
            Tap::Client,
        );
        let downstream = pump(
            &mut origin_rd,
            &mut client_wr,
            &down,
            activity,
            tap,
            Tap::Origin,
        );
        tokio::select! {
            r = upstream => match r {
                Ok(()) => RelayEnd::ClientClosed,
                Err(e) => {
                    trace!(error = %e, "client leg error");
                    RelayEnd::ClientError
                }
            },
            r = downstream => match r {
                Ok(()) => RelayEnd::OriginClosed,
                Err(e) => {
                    trace!(error = %e, "origin leg error");
                    RelayEnd::OriginError
                }
            },
            _ = watchdog(activity, idle) => RelayEnd::Idle,
        }
    };

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, origin_wr.shutdown()).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, client_wr.shutdown()).await;

    RelayStats {
        client_to_origin: up.load(Ordering::Relaxed),
        origin_to_client: down.load(Ordering::Relaxed),
        ended_by,
    }
}

#[derive(Clone, Copy)]
struct Activity<'a> {
    started: Instant,
    last: &'a AtomicU64,
}

impl Activity<'_> {
    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last.store(ms, Ordering::Relaxed);
    }

    fn last_seen(&self) -> Instant {
        self.started + Duration::from_millis(self.last.load(Ordering::Relaxed))
    }
}

async fn watchdog(activity: Activity<'_>, idle: Duration) {
    loop {
        let deadline = activity.last_seen() + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: Activity<'_>,
    tap: Option<mpsc::UnboundedSender<Tap>>,
    wrap: fn(Bytes) -> Tap,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();
        if let Some(tx) = &tap {
            // Capture is best effort; a gone receiver never stops forwarding.
            let _ = tx.send(wrap(Bytes::copy_from_slice(&buf[..n])));
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
