//! Ctrl+C handling shared by `init` and `run`.
//!
//! The first interrupt flips a watch flag so the running step can clean up.
//! A second one exits the process without waiting for cleanup.

use crate::errors::{FleetError, Result};
use futures::{Stream, StreamExt};
use std::future::Future;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Exit status after a forced exit, as for a process killed by SIGINT
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Resolves once `rx` reads `true`. A dropped sender never cancels.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Run `fut` unless an interrupt arrives first.
pub(crate) async fn interruptible<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if *cancel.borrow() {
        return Err(FleetError::Interrupted);
    }
    tokio::select! {
        out = fut => out,
        _ = cancelled(cancel) => Err(FleetError::Interrupted),
    }
}

/// A receiver that never reads `true`.
pub(crate) fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Flip `cancel` on the first signal. Returns `true` once a second signal
/// arrives, `false` if the signal source ends first.
pub(crate) async fn forward_interrupts<S>(mut signals: S, cancel: &watch::Sender<bool>) -> bool
where
    S: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        return false;
    }
    info!("Received shutdown signal (Ctrl+C), cleaning up. Press Ctrl+C again to exit now.");
    let _ = cancel.send(true);

    signals.next().await.is_some()
}

/// Watch Ctrl+C for the rest of the process.
///
/// The receiver flips on the first interrupt. A second interrupt exits with
/// [`INTERRUPTED_EXIT_CODE`]. Abort the handle once the guarded work is done.
pub fn watch_ctrl_c() -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let signals = futures::stream::unfold((), |()| async {
            signal::ctrl_c().await.ok().map(|()| ((), ()))
        });
        if forward_interrupts(Box::pin(signals), &cancel_tx).await {
            warn!("Second interrupt, exiting without cleanup");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });

    (cancel_rx, handle)
}
