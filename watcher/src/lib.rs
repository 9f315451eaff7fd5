//! Recursive file system watcher feeding the coordinator.
//!
//! Watches a set of directory specs, emits a `FileDiscovered` notification
//! for every file found during the initial walk, then translates kernel
//! events: close-after-write becomes `FileCreated`, deletes become
//! `FileDeleted`, and the two halves of a rename are correlated by their
//! kernel cookie within a configurable window into a single `FileMoved`.
//! Directory bookkeeping stays internal; only the removal of a watch root
//! surfaces, as `Unmounted`.

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

mod movepair;

pub use movepair::MovePairTracker;

/// What happened to a file, as reported to the listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsEvent {
    FileDiscovered,
    FileCreated,
    FileDeleted,
    FileMoved,
    Unmounted,
}

/// A single change notification. `src` is only populated for the origin of
/// a move; one-sided moves leave the unobserved endpoint empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub event: FsEvent,
    pub src: Option<std::path::PathBuf>,
    pub dst: Option<std::path::PathBuf>,
}

impl Notification {
    fn discovered(path: std::path::PathBuf) -> Self {
        Self {
            event: FsEvent::FileDiscovered,
            src: None,
            dst: Some(path),
        }
    }

    fn created(path: std::path::PathBuf) -> Self {
        Self {
            event: FsEvent::FileCreated,
            src: None,
            dst: Some(path),
        }
    }

    fn deleted(path: std::path::PathBuf) -> Self {
        Self {
            event: FsEvent::FileDeleted,
            src: None,
            dst: Some(path),
        }
    }

    fn moved(src: Option<std::path::PathBuf>, dst: Option<std::path::PathBuf>) -> Self {
        Self {
            event: FsEvent::FileMoved,
            src,
            dst,
        }
    }

    fn unmounted(path: std::path::PathBuf) -> Self {
        Self {
            event: FsEvent::Unmounted,
            src: Some(path.clone()),
            dst: Some(path),
        }
    }
}

/// A watch target: either a literal directory, or a start folder whose
/// subdirectories are matched against a regex (`start_folder::regex` form).
#[derive(Clone, Debug)]
pub struct DirSpec {
    root: std::path::PathBuf,
    pattern: Option<regex::Regex>,
}

impl DirSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.split_once("::") {
            Some((root, pattern)) => {
                let pattern = regex::Regex::new(pattern)
                    .with_context(|| format!("invalid directory pattern in spec {spec:?}"))?;
                Ok(Self {
                    root: std::path::PathBuf::from(root),
                    pattern: Some(pattern),
                })
            }
            None => Ok(Self {
                root: std::path::PathBuf::from(spec),
                pattern: None,
            }),
        }
    }

    /// Expand the spec to concrete watch roots. Literal specs resolve to
    /// themselves; pattern specs walk the start folder and keep every
    /// directory whose path matches.
    fn resolve(&self) -> Result<Vec<std::path::PathBuf>> {
        let Some(pattern) = &self.pattern else {
            return Ok(vec![self.root.clone()]);
        };
        let mut matched = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            if pattern.is_match(&dir.to_string_lossy()) {
                matched.push(dir.clone());
                continue;
            }
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    stack.push(entry.path());
                }
            }
        }
        Ok(matched)
    }
}

/// Handle to the running watcher task.
pub struct FsWatcher {
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl FsWatcher {
    /// Register kernel subscriptions for all specs (synchronously), then
    /// start the event task. The task first emits `FileDiscovered` for
    /// every file already present, then forwards live events until
    /// [`FsWatcher::stop`].
    pub fn spawn(
        specs: &[DirSpec],
        listener: tokio::sync::mpsc::Sender<Notification>,
        move_pair_timeout: std::time::Duration,
    ) -> Result<Self> {
        let mut roots = Vec::new();
        for spec in specs {
            roots.extend(spec.resolve()?);
        }
        let (raw_tx, raw_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut fs_watcher = RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| {
                let _ = raw_tx.send(result);
            },
            notify::Config::default(),
        )
        .context("failed to initialize file system notifications")?;
        for root in &roots {
            fs_watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("cannot watch directory {:?}", root))?;
            tracing::info!("watching {:?}", root);
        }
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(event_task(
            fs_watcher,
            roots,
            raw_rx,
            listener,
            move_pair_timeout,
            shutdown.clone(),
        ));
        Ok(Self { shutdown, task })
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Emit `FileDiscovered` for every regular file under `root`.
async fn discover_files(
    root: &std::path::Path,
    listener: &tokio::sync::mpsc::Sender<Notification>,
) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", dir))?
        {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file()
                && listener
                    .send(Notification::discovered(entry.path()))
                    .await
                    .is_err()
            {
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn event_task(
    fs_watcher: RecommendedWatcher,
    roots: Vec<std::path::PathBuf>,
    mut raw_rx: tokio::sync::mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    listener: tokio::sync::mpsc::Sender<Notification>,
    move_pair_timeout: std::time::Duration,
    shutdown: CancellationToken,
) {
    // keep the kernel subscriptions alive for the lifetime of the task
    let _fs_watcher = fs_watcher;
    for root in &roots {
        if let Err(error) = discover_files(root, &listener).await {
            tracing::error!("initial enumeration of {:?} failed: {:#}", root, error);
        }
    }
    let mut tracker = MovePairTracker::new(move_pair_timeout);
    loop {
        let deadline = tracker.deadline();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep_until(deadline), if deadline.is_some() => {
                if let Some(orphan) = tracker.flush_expired(std::time::Instant::now()) {
                    if listener.send(orphan).await.is_err() {
                        break;
                    }
                }
            }
            raw = raw_rx.recv() => {
                let event = match raw {
                    Some(Ok(event)) => event,
                    Some(Err(error)) => {
                        tracing::warn!("file system notification error: {error}");
                        continue;
                    }
                    None => break,
                };
                for notification in translate(&mut tracker, &roots, event) {
                    if listener.send(notification).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    tracing::debug!("watcher task exiting");
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Map one kernel event to listener notifications.
fn translate(
    tracker: &mut MovePairTracker,
    roots: &[std::path::PathBuf],
    event: notify::Event,
) -> Vec<Notification> {
    let now = std::time::Instant::now();
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => event
            .paths
            .into_iter()
            .map(Notification::created)
            .collect(),
        EventKind::Remove(RemoveKind::File) => {
            event.paths.into_iter().map(Notification::deleted).collect()
        }
        EventKind::Remove(RemoveKind::Folder) | EventKind::Remove(RemoveKind::Any) => event
            .paths
            .into_iter()
            .filter(|path| roots.contains(path))
            .map(Notification::unmounted)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(src), Some(dst)) => vec![Notification::moved(Some(src), Some(dst))],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            let cookie = event.attrs.tracker();
            event
                .paths
                .into_iter()
                .flat_map(|path| tracker.on_half(cookie, true, path, now))
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            let cookie = event.attrs.tracker();
            event
                .paths
                .into_iter()
                .flat_map(|path| tracker.on_half(cookie, false, path, now))
                .collect()
        }
        // directory creation and other modifications are handled by the
        // recursive subscription itself
        _ => Vec::new(),
    }
}
