// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP/HTTPS proxy with request capture, replay and reflection
//! scanning.
//!
//! Plain requests are forwarded and recorded. CONNECT tunnels are terminated
//! with a leaf certificate issued for the requested host so the exchange can
//! be captured before it is relayed to the origin. Captured records are served
//! by a small control API that can also replay them or scan them for
//! reflected query parameters.

pub mod api;
pub mod ca;
pub mod capture;
pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod reassembly;
pub mod reconstruct;
pub mod record;
pub mod replay;
pub mod scanner;
pub mod serde_helpers;
pub mod sink;
pub mod tunnel;
pub mod upstream;

#[cfg(test)]
mod test_helpers;
