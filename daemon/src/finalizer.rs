//! Installs completed uploads next to their sources and records the
//! outcome.
//!
//! Runs until a stop was requested and the daemon is idle: no open
//! download/upload streams and an empty move queue.

use std::sync::Arc;

use crate::coordinator::{Coordinator, FileToMove};
use common::media::status;

pub async fn run(coordinator: Arc<Coordinator>) {
    loop {
        let item = {
            let mut state = coordinator.state.lock().await;
            loop {
                if let Some(item) = state.files_to_move.pop_front() {
                    break Some(item);
                }
                if coordinator.stop_requested() && coordinator.open_stream_count() == 0 {
                    break None;
                }
                let notified = coordinator.queue_cv.notified();
                drop(state);
                notified.await;
                state = coordinator.state.lock().await;
            }
        };
        let Some(item) = item else {
            break;
        };
        finalize(&coordinator, item).await;
    }
    tracing::info!("finalizer drained, daemon is idle");
}

async fn finalize(coordinator: &Coordinator, item: FileToMove) {
    tracing::info!(
        "archive file of id {} ({:?}) ready to move",
        item.record.source_id,
        item.record.path
    );
    if item.record.source_id == 0 {
        return;
    }
    if item.record.info.status != status::OK || item.record.info.file_length == 0 {
        tracing::error!(
            "process (file id {}) resulted in error {}: {}",
            item.record.source_id,
            item.record.info.status,
            item.record.info.error
        );
        record(coordinator, &item.record).await;
        return;
    }
    match common::fs::move_file(&item.tmp, &item.record.path, item.times).await {
        Ok(()) => {
            tracing::info!(
                "file {} {:?} was moved into place",
                item.record.source_id,
                item.record.path
            );
            record(coordinator, &item.record).await;
        }
        Err(error) => {
            tracing::error!(
                "file {} ({:?}) move error: {:#}",
                item.record.source_id,
                item.record.path,
                error
            );
            let mut failed = item.record.clone();
            failed.info.status = status::SERVER_IO_ERROR;
            failed.info.file_length = 0;
            failed.info.error = format!("{error:#}");
            record(coordinator, &failed).await;
            if let Err(error) = tokio::fs::remove_file(&item.tmp).await {
                tracing::debug!("could not remove temp file {:?}: {error}", item.tmp);
            }
        }
    }
}

async fn record(coordinator: &Coordinator, file: &common::media::EncodedFile) {
    if let Err(error) = coordinator.catalog().add_encoded(file).await {
        tracing::error!(
            "could not record outcome for file {}: {error}",
            file.source_id
        );
    }
}
