// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Per-client connection metadata shared by plain requests and tunnels.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One accepted client TCP connection. Every request served on it, and the
/// tunnel it may turn into, logs under the same `id`.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub established: Instant,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            established: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }

    pub fn age_ms(&self) -> u64 {
        self.age().as_millis() as u64
    }
}
