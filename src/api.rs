// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Control API over captured records.
//!
//! - `GET /requests`: every record, newest first
//! - `GET /requests/:id`: one record
//! - `POST /repeat/:id`: replay a record
//! - `POST /scan/:id`, `POST /scan/:id/fast`: reflection scan

use crate::error::ProxyError;
use crate::proxy::{full_body, ProxyBody};
use crate::replay::Replayer;
use crate::scanner::{ReflectionScanner, ScanMode};
use crate::sink::CaptureSink;
use hyper::body::Incoming;
use hyper::{service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ApiState {
    pub sink: Arc<dyn CaptureSink>,
    pub replayer: Replayer,
    pub scanner: ReflectionScanner,
}

pub async fn run_api(listen: SocketAddr, state: Arc<ApiState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "control API listening");
    serve_api(listener, state).await
}

pub async fn serve_api(listener: TcpListener, state: Arc<ApiState>) -> anyhow::Result<()> {
    let builder = AutoConnBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let state = state.clone();
        let builder = builder.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle_api(req, state).await) }
            });
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                debug!(remote = %remote_addr, error = %e, "API connection error");
            }
        });
    }
}

enum Route {
    List,
    Get(Uuid),
    Repeat(Uuid),
    Scan(Uuid, ScanMode),
}

fn route(method: &Method, path: &str) -> Option<Route> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        (&Method::GET, ["requests"]) => Some(Route::List),
        (&Method::GET, ["requests", i]) => parse_id(i).map(Route::Get),
        (&Method::POST, ["repeat", i]) => parse_id(i).map(Route::Repeat),
        (&Method::POST, ["scan", i]) => parse_id(i).map(|i| Route::Scan(i, ScanMode::Full)),
        (&Method::POST, ["scan", i, "fast"]) => parse_id(i).map(|i| Route::Scan(i, ScanMode::Fast)),
        _ => None,
    }
}

fn parse_id(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s).ok()
}

pub async fn handle_api<B>(req: Request<B>, state: Arc<ApiState>) -> Response<ProxyBody> {
    let Some(route) = route(req.method(), req.uri().path()) else {
        return error_json(StatusCode::NOT_FOUND, "not found");
    };

    match route {
        Route::List => match state.sink.list_all().await {
            Ok(records) => json_response(StatusCode::OK, &records),
            Err(e) => storage_error(e),
        },
        Route::Get(id) => match state.sink.get(id).await {
            Ok(record) => json_response(StatusCode::OK, &record),
            Err(e) => storage_error(e),
        },
        Route::Repeat(id) => {
            let record = match state.sink.get(id).await {
                Ok(r) => r,
                Err(e) => return storage_error(e),
            };
            match state.replayer.replay(&record).await {
                Ok(summary) => json_response(StatusCode::OK, &summary),
                Err(e @ ProxyError::MalformedRequest(_)) => {
                    error_json(StatusCode::BAD_REQUEST, &e.to_string())
                }
                Err(e) => {
                    warn!(%id, error = %e, "replay failed");
                    error_json(StatusCode::BAD_GATEWAY, &e.to_string())
                }
            }
        }
        Route::Scan(id, mode) => {
            let record = match state.sink.get(id).await {
                Ok(r) => r,
                Err(e) => return storage_error(e),
            };
            let results = state.scanner.scan(&record, mode).await;
            match results.as_slice() {
                [only] if only.param.is_none() => error_json(
                    StatusCode::BAD_REQUEST,
                    only.error.as_deref().unwrap_or("scan refused"),
                ),
                _ => json_response(StatusCode::OK, &results),
            }
        }
    }
}

fn storage_error(e: ProxyError) -> Response<ProxyBody> {
    match e {
        ProxyError::NotFound(_) => error_json(StatusCode::NOT_FOUND, "not found"),
        other => {
            error!(error = %other, "capture storage failure");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut resp = Response::new(full_body(body));
            *resp.status_mut() = status;
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(e) => {
            error!(error = %e, "failed to encode API response");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
        }
    }
}

fn error_json(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(json!({ "error": message }).to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}
