//! Process topologies.
//!
//! | Entry point | Role | Components |
//! |-------------|------|------------|
//! | [`run_monolithic`] | `access-csv run` | tailer → pipeline, download API |
//! | [`run_watcher`] | `access-csv watch` | tailer → relay publisher |
//! | [`run_collector`] | `access-csv collect` | relay subscriber → pipeline, download API |
//!
//! All three stop on Ctrl-C.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::SystemClock;
use crate::config::{Config, LogConfig, StartFrom};
use crate::db;
use crate::migrate;
use crate::pipeline::CsvPipeline;
use crate::registry::{Registry, SqliteRegistry};
use crate::relay::{self, RelayPublisher, RelaySubscriber};
use crate::server::{self, AppState};
use crate::tailer::LogTailer;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("No access log found at {}", path.display())]
    MissingLogFile { path: PathBuf, exit_code: i32 },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::MissingLogFile { exit_code, .. } => *exit_code,
        }
    }
}

/// Fails with [`StartupError::MissingLogFile`] unless the access log exists.
pub fn ensure_log_file(log: &LogConfig) -> Result<(), StartupError> {
    if log.path.is_file() {
        Ok(())
    } else {
        Err(StartupError::MissingLogFile {
            path: log.path.clone(),
            exit_code: log.missing_file_exit_code,
        })
    }
}

/// Opens the SQLite registry, creating its schema if needed.
pub async fn open_registry(config: &Config) -> Result<Arc<dyn Registry>> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool)
        .await
        .context("Failed to prepare registry schema")?;
    Ok(Arc::new(SqliteRegistry::new(pool)))
}

/// Builds the tailer and, for `start_from = "end"`, skips existing lines.
pub fn start_tailer(log: &LogConfig) -> Result<LogTailer> {
    let mut tailer = LogTailer::from_config(log);
    if log.start_from == StartFrom::End {
        let existing = tailer.prime()?;
        info!(lines = existing, "skipping lines already in the log");
    }
    Ok(tailer)
}

/// Completes once Ctrl-C has been received. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn on_ctrl_c() -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    let _ = tx.send(true);
                }
                Err(err) => {
                    warn!(error = %err, "cannot listen for Ctrl-C; running until killed");
                    std::future::pending::<()>().await;
                }
            }
        });
        Self(rx)
    }

    pub async fn wait(mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

async fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} on {}", what, addr))
}

async fn open_pipeline(config: &Config, registry: Arc<dyn Registry>) -> Result<CsvPipeline> {
    let mut pipeline = CsvPipeline::new(registry, Arc::new(SystemClock), &config.output.dir);
    pipeline.roll_over().await?;
    Ok(pipeline)
}

/// Tails the log and writes CSV in this process.
pub async fn run_monolithic(config: &Config) -> Result<()> {
    ensure_log_file(&config.log)?;
    let registry = open_registry(config).await?;
    let mut pipeline = open_pipeline(config, registry.clone()).await?;
    let mut tailer = start_tailer(&config.log)?;

    let listener = bind(&config.server.bind, "download server").await?;
    let shutdown = Shutdown::on_ctrl_c();
    let state = AppState::new(
        registry,
        &config.output.dir,
        pipeline.current_key_receiver(),
    );
    let server = tokio::spawn(server::serve(listener, state, shutdown.clone().wait()));

    tailer
        .run(&mut pipeline, config.log.poll_interval(), shutdown.wait())
        .await;

    server.await??;
    Ok(())
}

/// Tails the log and publishes new lines to connected collectors.
pub async fn run_watcher(config: &Config) -> Result<()> {
    ensure_log_file(&config.log)?;
    let mut tailer = start_tailer(&config.log)?;
    let mut publisher = RelayPublisher::new(config.relay.capacity);

    let listener = bind(&config.relay.bind, "relay").await?;
    let shutdown = Shutdown::on_ctrl_c();
    let relay = tokio::spawn(relay::serve_relay(
        listener,
        publisher.clone(),
        shutdown.clone().wait(),
    ));

    tailer
        .run(&mut publisher, config.log.poll_interval(), shutdown.wait())
        .await;

    relay.await??;
    Ok(())
}

/// Subscribes to a watcher and writes CSV for every relayed line.
pub async fn run_collector(config: &Config) -> Result<()> {
    let registry = open_registry(config).await?;
    let mut pipeline = open_pipeline(config, registry.clone()).await?;

    let listener = bind(&config.server.bind, "download server").await?;
    let shutdown = Shutdown::on_ctrl_c();
    let state = AppState::new(
        registry,
        &config.output.dir,
        pipeline.current_key_receiver(),
    );
    let server = tokio::spawn(server::serve(listener, state, shutdown.clone().wait()));

    let subscriber = RelaySubscriber::new(
        config.relay.url.clone(),
        Duration::from_secs(config.relay.reconnect_secs),
    );
    subscriber.run(&mut pipeline, shutdown.wait()).await;

    server.await??;
    Ok(())
}
