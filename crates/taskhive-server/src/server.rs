use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use libtaskhive::{BacklogFile, Coordinator, SharedCoordinator, Subscription};
use taskhive_protocol::{EventKind, ParallelMarker, paths};

use crate::config::ServerConfig;
use crate::connection::{self, ConnectionLimits};

pub struct Server {
    config: ServerConfig,
    coordinator: SharedCoordinator,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Server {
    /// Load the backlog and bind the listener. Nothing is served until
    /// [`Server::run`].
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.state_dir).with_context(|| {
            format!("failed to create state dir {}", config.state_dir.display())
        })?;

        let coordinator = Coordinator::open(
            BacklogFile::in_state_dir(&config.state_dir),
            config.coordinator_config()?,
        )
        .context("failed to load backlog")?
        .into_shared();

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

        Ok(Self {
            config,
            coordinator,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Cancelling this token stops the accept loop and background tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn coordinator(&self) -> SharedCoordinator {
        self.coordinator.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Server {
            config,
            coordinator,
            listener,
            shutdown,
        } = self;

        let addr = listener.local_addr()?;
        let marker_path = paths::marker_path(&config.state_dir);
        let pid_path = paths::pid_path(&config.state_dir);
        write_marker(&marker_path, &config.host, addr.port())?;
        std::fs::write(&pid_path, std::process::id().to_string())
            .with_context(|| format!("failed to write {}", pid_path.display()))?;
        info!(
            addr = %addr,
            state_dir = %config.state_dir.display(),
            pid = std::process::id(),
            "coordinator started"
        );

        let tracker = TaskTracker::new();
        tracker.spawn(reap_loop(
            coordinator.clone(),
            config.reap_interval(),
            shutdown.clone(),
        ));
        tracker.spawn(flush_loop(
            coordinator.clone(),
            config.flush_interval(),
            shutdown.clone(),
        ));
        let (events, completions) = {
            let mut coord = coordinator.lock().await;
            (coord.subscribe(), coord.watch_completions())
        };
        tracker.spawn(watch_events(coordinator.clone(), events, shutdown.clone()));
        if config.exit_on_complete {
            tracker.spawn(stop_on_complete(completions, shutdown.clone()));
        }

        let limits = ConnectionLimits {
            max_body_bytes: config.max_body_bytes,
            read_timeout: config.read_timeout(),
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "connection accepted");
                        tracker.spawn(connection::handle_client(stream, coordinator.clone(), limits));
                    }
                    Err(e) => error!("accept error: {e}"),
                },
            }
        }

        drop(listener);
        info!("shutting down...");
        tracker.close();
        if timeout(config.shutdown_grace(), tracker.wait()).await.is_err() {
            warn!(
                pending = tracker.len(),
                "shutdown grace period elapsed with tasks still running"
            );
        }

        if let Err(e) = coordinator.lock().await.flush() {
            error!("final flush failed: {e}");
        }
        let _ = std::fs::remove_file(&marker_path);
        let _ = std::fs::remove_file(&pid_path);
        info!("coordinator stopped");
        Ok(())
    }
}

fn write_marker(path: &Path, host: &str, port: u16) -> anyhow::Result<()> {
    let marker = ParallelMarker {
        host: host.to_string(),
        port,
        pid: std::process::id(),
        started_at: Utc::now(),
    };
    std::fs::write(path, serde_json::to_vec_pretty(&marker)?)
        .with_context(|| format!("failed to write {}", path.display()))
}

async fn reap_loop(coordinator: SharedCoordinator, period: Duration, shutdown: CancellationToken) {
    let mut tick = interval(period);
    // The first tick completes immediately.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let reaped = coordinator.lock().await.reap_stale_sessions();
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "reaped stale sessions");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("reaper stopped");
}

async fn flush_loop(coordinator: SharedCoordinator, period: Duration, shutdown: CancellationToken) {
    let mut tick = interval(period);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = coordinator.lock().await.flush() {
                    warn!("periodic flush failed: {e}");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("flusher stopped");
}

/// Log coordinator events. The broker drops subscribers that fall behind,
/// so a closed stream is replaced with a fresh subscription.
async fn watch_events(
    coordinator: SharedCoordinator,
    mut events: Subscription,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.events.recv() => event,
            _ = shutdown.cancelled() => break,
        };
        let Some(event) = event else {
            warn!(subscriber = events.id, "event watcher fell behind, resubscribing");
            events = coordinator.lock().await.subscribe();
            continue;
        };

        debug!(event = ?event.kind, "coordinator event");
        if let EventKind::ParallelComplete { message } = &event.kind {
            info!("{message}");
        }
    }
}

/// Stop the server the first time the last worker ends.
async fn stop_on_complete(mut completions: watch::Receiver<u64>, shutdown: CancellationToken) {
    tokio::select! {
        changed = completions.changed() => {
            if changed.is_ok() {
                info!("exit_on_complete set, stopping");
                shutdown.cancel();
            }
        }
        _ = shutdown.cancelled() => {}
    }
}
