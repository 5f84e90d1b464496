// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Proxy listen address, e.g. 127.0.0.1:8080
    pub listen: String,

    /// Control API listen address
    pub api_listen: String,

    /// Optional JSONL journal the capture sink appends to and replays on startup
    pub journal: Option<String>,

    /// Records older than this are removed by the retention task (default: 24)
    pub retention_hours: u64,

    /// How often the retention task runs
    pub purge_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            api_listen: "127.0.0.1:8000".to_string(),
            journal: None,
            retention_hours: 24,
            purge_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_cert_path: String,
    pub ca_key_path: String,
    /// Directory holding `<host>.crt` / `<host>.key` leaf certificates.
    pub certs_dir: String,
    /// External program invoked as `<issuer_command> <host>`. When unset the
    /// local CA signs leaves in-process.
    pub issuer_command: Option<String>,
    /// Shared leaf key written by the external issuer, defaults to `<certs_dir>/cert.key`.
    pub issuer_key_path: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: "ca/ca.crt".to_string(),
            ca_key_path: "ca/ca.key".to_string(),
            certs_dir: "certs".to_string(),
            issuer_command: None,
            issuer_key_path: None,
        }
    }
}

impl TlsConfig {
    pub fn issuer_key_path(&self) -> PathBuf {
        self.issuer_key_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&self.certs_dir).join("cert.key"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_secs: u64,
    /// A tunnel with no traffic in either direction for this long is closed.
    pub idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            idle_timeout_secs: 120,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub fast_dictionary: String,
    pub full_dictionary: String,
    /// Parameters scanned in parallel per scan.
    pub concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            fast_dictionary: "params/fast.txt".to_string(),
            full_dictionary: "params/full.txt".to_string(),
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub tls: TlsConfig,
    pub upstream: UpstreamConfig,
    pub scan: ScanConfig,
}

impl Config {
    /// Load configuration from a TOML file. Missing tables and keys keep their defaults.
    ///
    /// [general]
    /// listen = "127.0.0.1:8080"
    /// retention_hours = 24
    ///
    /// [tls]
    /// certs_dir = "certs"
    /// issuer_command = "./scripts/gen_cert.sh"
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scan.concurrency == 0 {
            anyhow::bail!("scan.concurrency must be at least 1");
        }
        if self.general.retention_hours == 0 {
            anyhow::bail!("general.retention_hours must be at least 1");
        }
        Ok(())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.general.retention_hours as i64)
    }
}
