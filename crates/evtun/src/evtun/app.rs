use std::{path::PathBuf, time::Duration};

use anyhow::Context;

use crate::evtun::{
    config, logging, net,
    tunnel::{
        client::{Client, ClientOptions},
        session::SessionOptions,
    },
};

/// Startup inputs taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub metadata_file: Option<PathBuf>,
    pub server_addr: Option<String>,
}

pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(opts.config_path)?;
    let (cfg, found) = config::load_resolved(&resolved)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let metadata_file = opts.metadata_file.or_else(|| cfg.client.metadata_file.clone());
    let metadata = match &metadata_file {
        Some(p) => config::load_metadata(p)?,
        None => cfg.metadata.clone(),
    };

    let server_addr = match opts.server_addr.as_deref() {
        Some(s) => net::normalize_server_addr(s),
        None => cfg.client.server_addr.clone(),
    };

    let metadata_source = metadata_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "inline".into());

    tracing::info!(
        config = %resolved.path.display(),
        config_source = %resolved.source,
        config_found = found,
        server = %server_addr,
        bind_host = %cfg.client.bind_host,
        metadata = %metadata_source,
        reconnect_interval = %humantime::format_duration(cfg.client.reconnect_interval),
        "evtun: starting"
    );

    let client = Client::new(ClientOptions {
        server_addr,
        metadata,
        reconnect_interval: cfg.client.reconnect_interval,
        connect_timeout: cfg.client.connect_timeout,
        session: SessionOptions {
            bind_host: cfg.client.bind_host,
            buffer_cap: cfg.client.buffer_cap,
            ..SessionOptions::default()
        },
    })
    .context("tunnel: client")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut task = tokio::spawn(async move { client.run(shutdown_rx).await });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = &mut task => {
            return res.context("tunnel: client task")?;
        }
    }

    // The session closes its listeners as soon as it observes shutdown; only a stuck
    // write can hold it up.
    let drain_timeout = Duration::from_secs(5);
    match tokio::time::timeout(drain_timeout, &mut task).await {
        Ok(res) => res.context("tunnel: client task")?,
        Err(_) => {
            tracing::warn!(timeout = %humantime::format_duration(drain_timeout), "shutdown: client did not stop; aborting");
            task.abort();
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
