//! Signal handling: first SIGINT drains and exits, a second SIGINT or a
//! SIGABRT forces the shutdown.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use crate::coordinator::Coordinator;

pub fn spawn(coordinator: Arc<Coordinator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!("could not install SIGINT handler: {error}");
                return;
            }
        };
        let mut abort = match signal(SignalKind::from_raw(libc::SIGABRT)) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!("could not install SIGABRT handler: {error}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    if coordinator.stop_requested() {
                        tracing::warn!("aborting process");
                        coordinator.stop(true).await;
                        break;
                    }
                    tracing::warn!(
                        "termination requested, finishing the current encoding steps"
                    );
                    coordinator.stop(false).await;
                }
                _ = abort.recv() => {
                    tracing::warn!("aborting process");
                    coordinator.stop(true).await;
                    break;
                }
            }
        }
    })
}
