//! The marchive coordinator daemon.
//!
//! Wires together the durable catalog, the file system watcher, the RPC
//! server for encode workers and the finalizer that installs finished
//! archives. [`start`] brings the whole plane up; [`Daemon::wait`] runs the
//! finalizer loop to completion, which is the daemon's lifetime.

use std::sync::Arc;

use anyhow::{Context, Result};

pub mod coordinator;
pub mod events;
pub mod finalizer;
pub mod server;
pub mod session;
pub mod signals;

pub use coordinator::Coordinator;

use common::config::DaemonConfig;

pub struct Daemon {
    coordinator: Arc<Coordinator>,
    addr: std::net::SocketAddr,
    finalizer: tokio::task::JoinHandle<()>,
    server: server::RpcServer,
    fs_watcher: Option<watcher::FsWatcher>,
    events_task: Option<tokio::task::JoinHandle<()>>,
}

/// Open the catalog, subscribe to the watched folders and start the RPC
/// server and finalizer.
pub async fn start(cfg: DaemonConfig) -> Result<Daemon> {
    if let Some(parent) = cfg.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create catalog directory {:?}", parent))?;
        }
    }
    let catalog = catalog::Catalog::open(&cfg.db_path, true)
        .await
        .with_context(|| format!("cannot open catalog at {:?}", cfg.db_path))?;
    if !cfg.temp_folder.as_os_str().is_empty() {
        tokio::fs::create_dir_all(&cfg.temp_folder)
            .await
            .with_context(|| format!("cannot create temp folder {:?}", cfg.temp_folder))?;
    }
    let coordinator = Arc::new(Coordinator::new(cfg.clone(), catalog)?);

    let folders = cfg.watch_folders();
    let (fs_watcher, events_task) = if folders.is_empty() {
        (None, None)
    } else {
        let specs = folders
            .iter()
            .map(|folder| watcher::DirSpec::parse(folder))
            .collect::<Result<Vec<_>>>()?;
        let (tx, rx) = tokio::sync::mpsc::channel(1024);
        let fs_watcher = watcher::FsWatcher::spawn(&specs, tx, cfg.move_pair_timeout())?;
        let events_task = tokio::spawn(events::run(coordinator.clone(), rx));
        (Some(fs_watcher), Some(events_task))
    };

    let rpc_server = server::RpcServer::start(coordinator.clone()).await?;
    let addr = rpc_server.local_addr();
    let finalizer = tokio::spawn(finalizer::run(coordinator.clone()));
    Ok(Daemon {
        coordinator,
        addr,
        finalizer,
        server: rpc_server,
        fs_watcher,
        events_task,
    })
}

impl Daemon {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Run until the finalizer observes a requested stop with nothing in
    /// flight, then tear down the server and watcher.
    pub async fn wait(self) -> Result<()> {
        self.finalizer
            .await
            .context("finalizer task terminated abnormally")?;
        // only now stop taking calls
        self.coordinator.stop_accepting();
        self.server.stop().await;
        if let Some(fs_watcher) = self.fs_watcher {
            fs_watcher.stop().await;
        }
        if let Some(events_task) = self.events_task {
            let _ = events_task.await;
        }
        Ok(())
    }

    /// Forced stop and full teardown; used by tests and error paths.
    pub async fn shutdown(self) -> Result<()> {
        self.coordinator.stop(true).await;
        self.wait().await
    }
}
