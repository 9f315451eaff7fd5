//! Feeds file system observations into the catalog.
//!
//! For each create/discover/move the target path is classified as an
//! archive (result suffix + final extension) or an interesting source
//! (filename pattern), its counterpart path is derived by the naming rule,
//! and both are reported to the catalog so the queue reflects what is on
//! disk. Deletes are ignored by the core.

use std::sync::Arc;

use crate::coordinator::Coordinator;
use catalog::FileInfo;
use common::media;
use watcher::{FsEvent, Notification};

pub async fn run(
    coordinator: Arc<Coordinator>,
    mut notifications: tokio::sync::mpsc::Receiver<Notification>,
) {
    while let Some(notification) = notifications.recv().await {
        if let Err(error) = handle_event(&coordinator, notification).await {
            tracing::error!("file system event handling failed: {:#}", error);
        }
    }
    tracing::debug!("file system event channel closed");
}

async fn handle_event(coordinator: &Coordinator, notification: Notification) -> anyhow::Result<()> {
    tracing::trace!(
        "fs event {:?}: src={:?} dst={:?}",
        notification.event,
        notification.src,
        notification.dst
    );
    match notification.event {
        FsEvent::FileDeleted => return Ok(()),
        FsEvent::Unmounted => {
            tracing::warn!("watched directory unmounted: {:?}", notification.dst);
            return Ok(());
        }
        FsEvent::FileDiscovered | FsEvent::FileCreated | FsEvent::FileMoved => {}
    }
    // one-sided moves out of the watched tree carry no destination
    let Some(dst) = notification.dst else {
        return Ok(());
    };
    let dst_size = match common::fs::size(&dst).await {
        Ok(dst_size) => dst_size,
        Err(error) => {
            tracing::debug!("skipping event for unreadable {:?}: {:#}", dst, error);
            return Ok(());
        }
    };

    let cfg = coordinator.cfg();
    let dst_is_archive = media::is_archive(&dst, &cfg.result_file_suffix, &cfg.final_extension);
    let counterpart = if dst_is_archive {
        media::source_name_for_archive(&dst, &cfg.result_file_suffix)
    } else if coordinator.matcher().is_interesting(&dst) {
        coordinator.archived_name(&dst)
    } else {
        return Ok(());
    };
    let counterpart_size = common::fs::size(&counterpart).await.unwrap_or(0);

    let (source, archive) = if dst_is_archive {
        (
            FileInfo {
                path: counterpart,
                size: counterpart_size,
            },
            FileInfo {
                path: dst,
                size: dst_size,
            },
        )
    } else {
        (
            FileInfo {
                path: dst,
                size: dst_size,
            },
            FileInfo {
                path: counterpart,
                size: counterpart_size,
            },
        )
    };

    // the source half is reported when the event is about a source, or an
    // archive whose source is present; same rule mirrored for the archive
    // half. A plain source with no archive on disk gets enqueued.
    let src_known = !dst_is_archive || counterpart_size > 0;
    let dst_known = dst_is_archive || counterpart_size > 0;
    let enqueue = src_known;
    coordinator
        .catalog()
        .add_file(
            src_known.then_some(&source),
            dst_known.then_some(&archive),
            enqueue,
        )
        .await?;
    Ok(())
}
