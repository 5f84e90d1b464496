// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use mitm_capture::api::{self, ApiState};
use mitm_capture::ca::{CertificateAuthority, CertificateManager, CommandIssuer, LeafIssuer};
use mitm_capture::capture::JournalSink;
use mitm_capture::config::Config;
use mitm_capture::proxy::{self, ProxyContext};
use mitm_capture::replay::Replayer;
use mitm_capture::scanner::{FileDictionary, ReflectionScanner};
use mitm_capture::sink::{spawn_retention_task, CaptureSink, MemorySink};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mitm-capture")]
struct Args {
    /// Proxy listen address, e.g. 127.0.0.1:8080 (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Control API listen address (overrides the config file)
    #[arg(long)]
    api_listen: Option<String>,

    /// Optional config TOML path
    #[arg(long)]
    config: Option<String>,
}

async fn load_config(args: &Args) -> Config {
    let mut cfg = if let Some(ref p) = args.config {
        Config::load_from_path(p).await.unwrap_or_else(|e| {
            warn!(%p, %e, "failed to load config, using defaults");
            Config::default()
        })
    } else {
        Config::default()
    };
    if let Some(ref listen) = args.listen {
        cfg.general.listen = listen.clone();
    }
    if let Some(ref api_listen) = args.api_listen {
        cfg.general.api_listen = api_listen.clone();
    }
    cfg
}

async fn open_sink(cfg: &Config) -> anyhow::Result<Arc<dyn CaptureSink>> {
    let sink: Arc<dyn CaptureSink> = match cfg.general.journal {
        Some(ref path) => {
            let sink = JournalSink::open(path).await?;
            info!(journal = %path, "capture journal opened");
            Arc::new(sink)
        }
        None => Arc::new(MemorySink::new()),
    };
    Ok(sink)
}

fn leaf_issuer(cfg: &Config, ca: Arc<CertificateAuthority>) -> Arc<dyn LeafIssuer> {
    match cfg.tls.issuer_command {
        Some(ref program) => {
            info!(%program, "issuing leaf certificates with external command");
            Arc::new(CommandIssuer::new(
                program,
                &cfg.tls.certs_dir,
                cfg.tls.issuer_key_path(),
            ))
        }
        None => ca,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let cfg = load_config(&args).await;

    let addr: SocketAddr = cfg.general.listen.parse()?;
    let api_addr: SocketAddr = cfg.general.api_listen.parse()?;

    let ca = CertificateAuthority::load_or_generate(
        &PathBuf::from(&cfg.tls.ca_cert_path),
        &PathBuf::from(&cfg.tls.ca_key_path),
    )
    .await?;
    let certs = Arc::new(
        CertificateManager::new(
            leaf_issuer(&cfg, ca.clone()),
            Some(PathBuf::from(&cfg.tls.certs_dir)),
        )
        .with_shared_key(cfg.tls.issuer_key_path()),
    );

    let sink = open_sink(&cfg).await?;
    spawn_retention_task(
        sink.clone(),
        cfg.retention(),
        Duration::from_secs(cfg.general.purge_interval_secs.max(1)),
    );

    let ctx = Arc::new(ProxyContext::new(&cfg, sink.clone(), certs, ca)?);
    let request_timeout = cfg.upstream.connect_timeout() * 3;
    let api_state = Arc::new(ApiState {
        sink,
        replayer: Replayer::new(ctx.client.clone(), request_timeout),
        scanner: ReflectionScanner::new(
            ctx.client.clone(),
            Arc::new(FileDictionary::new(&cfg.scan.fast_dictionary)),
            Arc::new(FileDictionary::new(&cfg.scan.full_dictionary)),
            cfg.scan.concurrency,
            request_timeout,
        ),
    });

    let server = proxy::run_proxy(addr, ctx);
    let control = api::run_api(api_addr, api_state);

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "proxy server error");
            }
        }
        res = control => {
            if let Err(e) = res {
                error!(%e, "control API error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
