// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error taxonomy shared by the interception, replay and scanning paths.
//!
//! Every variant describes a failure that is scoped to one connection, one
//! replay or one scanned parameter. None of them is allowed to take the
//! process down; callers log and turn them into a status code, a closed
//! socket or an inline error field.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Leaf certificate could not be produced for a host.
    #[error("certificate issuance failed for {host}: {reason}")]
    CertificateIssuance { host: String, reason: String },

    /// TCP connection to the origin could not be established.
    #[error("upstream connect to {target} failed: {reason}")]
    UpstreamConnect { target: String, reason: String },

    /// TLS handshake with the origin failed.
    #[error("upstream TLS with {target} failed: {reason}")]
    UpstreamTls { target: String, reason: String },

    /// TLS handshake with the intercepted client failed.
    #[error("client TLS failed: {0}")]
    ClientTls(String),

    /// Request target or framing could not be understood.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A single scanned parameter could not be tested.
    #[error("scan of parameter {param} failed: {reason}")]
    ScanParam { param: String, reason: String },

    /// Replay did not get any response from the origin.
    #[error("replay transport error: {0}")]
    ReplayTransport(String),

    #[error("record {0} not found")]
    NotFound(String),

    /// A record's response was already set once.
    #[error("record {0} already has a response")]
    AlreadyFinalized(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// A tunnel was driven out of order.
    #[error("invalid tunnel transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn issuance(host: &str, reason: impl ToString) -> Self {
        Self::CertificateIssuance {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn upstream_connect(target: &str, reason: impl ToString) -> Self {
        Self::UpstreamConnect {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn upstream_tls(target: &str, reason: impl ToString) -> Self {
        Self::UpstreamTls {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure happened before any origin byte was received.
    pub fn is_gateway_error(&self) -> bool {
        matches!(
            self,
            Self::UpstreamConnect { .. } | Self::UpstreamTls { .. } | Self::ReplayTransport(_)
        )
    }
}
