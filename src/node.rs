//! Startup and shutdown of one node: snapshot restore, peer resolution, the HTTP
//! listener and the periodic snapshot worker.

use std::{fs, io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    cluster::NodeConfig,
    config::Config,
    http::{AppState, build_app},
    snapshot::{self, SnapshotHandle, spawn_snapshot_worker},
    store::Store,
};

/// A node that is serving requests. Call [`RunningNode::shutdown`] to stop it.
pub struct RunningNode {
    local_addr: SocketAddr,
    store: Arc<Store>,
    snapshots: SnapshotHandle,
    stop_tx: Option<oneshot::Sender<()>>,
    server: JoinHandle<io::Result<()>>,
    grace: Duration,
}

impl RunningNode {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Resolves only if the HTTP server exits on its own.
    pub async fn wait(&mut self) -> Result<()> {
        server_result((&mut self.server).await)
    }

    /// Final snapshot, stop the timer, then drain in-flight requests within the
    /// grace period. Running out of grace is an error.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(addr = %self.local_addr, "shutting down");
        self.snapshots.save_now().await;
        self.snapshots.shutdown().await;
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(self.grace, &mut self.server).await {
            Ok(joined) => server_result(joined)?,
            Err(_) => {
                self.server.abort();
                anyhow::bail!(
                    "in-flight requests did not finish within {}s",
                    self.grace.as_secs()
                );
            }
        }
        info!(addr = %self.local_addr, "stopped");
        Ok(())
    }
}

fn server_result(joined: Result<io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined
        .context("http server task failed")?
        .context("http server error")
}

/// Binds `config.bind` and starts serving.
pub async fn start(config: &Config) -> Result<RunningNode> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    start_on(config, listener).await
}

/// Starts serving on an already bound listener; `config.bind` is ignored.
pub async fn start_on(config: &Config, listener: TcpListener) -> Result<RunningNode> {
    prepare_snapshot_dir(&config.snapshot_dir)?;
    let local_addr = listener.local_addr().context("listener local addr")?;
    let snapshot_path = config.snapshot_path();

    let store = Arc::new(Store::new());
    snapshot::load(&store, &snapshot_path).await;

    let node = NodeConfig::resolve(config).await;
    let client = reqwest::Client::builder()
        .build()
        .context("build http client")?;
    let app = build_app(
        AppState::new(node, store.clone(), client),
        config.request_timeout(),
    );

    let snapshots = spawn_snapshot_worker(
        store.clone(),
        snapshot_path.clone(),
        config.snapshot_interval(),
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    info!(
        addr = %local_addr,
        role = config.role.as_str(),
        snapshot = %snapshot_path.display(),
        "replikv listening"
    );
    Ok(RunningNode {
        local_addr,
        store,
        snapshots,
        stop_tx: Some(stop_tx),
        server,
        grace: config.shutdown_grace(),
    })
}

/// Serves until SIGINT/SIGTERM, then shuts down.
pub async fn run(config: Config) -> Result<()> {
    let mut node = start(&config).await?;
    tokio::select! {
        res = node.wait() => return res,
        _ = shutdown_signal() => {}
    }
    node.shutdown().await
}

fn prepare_snapshot_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("create snapshot dir {}", dir.display()))
}

/// Renders the snapshot at `path` as a pretty-printed JSON object.
pub fn inspect(path: &Path) -> Result<String> {
    let decoded = snapshot::read(path)
        .with_context(|| format!("read snapshot {}", path.display()))?
        .with_context(|| format!("no snapshot at {}", path.display()))?;
    for key in &decoded.skipped {
        warn!(
            path = %path.display(),
            key = %key,
            "snapshot entry is not valid json; skipped"
        );
    }
    serde_json::to_string_pretty(&decoded.entries).context("render snapshot as json")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
