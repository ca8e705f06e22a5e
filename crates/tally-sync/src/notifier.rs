//! # Change Notifier
//!
//! Turns Local Store change events into debounced automatic syncs.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  change ─┐   change ─┐          change ─┐                               │
//! │          ▼           ▼                  ▼                               │
//! │  ────────[====2s====[====2s====]────────[====2s====]──────► time        │
//! │                                 │                   │                   │
//! │                                 ▼                   ▼                   │
//! │                              auto sync           auto sync              │
//! │                                                                         │
//! │  Each change (re)arms the timer. Disabling auto-sync cancels it.       │
//! │  flush() fires a pending timer right away.                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Whatever runs the automatic sync once the debounce window closes.
#[async_trait]
pub trait AutoSyncTarget: Send + Sync {
    async fn auto_sync(&self);
}

#[derive(Debug)]
enum NotifierCommand {
    Changed,
    SetEnabled(bool),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle for feeding and controlling a running notifier.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    cmd_tx: mpsc::Sender<NotifierCommand>,
}

impl NotifierHandle {
    /// Reports one local mutation. Never blocks; callable from store hooks.
    pub fn notify_change(&self) {
        match self.cmd_tx.try_send(NotifierCommand::Changed) {
            Ok(()) => {}
            // A full queue already holds a change, which rearms the timer anyway.
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Change notifier stopped, change not scheduled");
            }
        }
    }

    pub async fn set_enabled(&self, enabled: bool) -> SyncResult<()> {
        self.cmd_tx
            .send(NotifierCommand::SetEnabled(enabled))
            .await
            .map_err(|_| SyncError::ChannelError("Notifier channel closed".into()))
    }

    /// Runs a pending debounced sync now and waits for it.
    pub async fn flush(&self) -> SyncResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(NotifierCommand::Flush(ack_tx))
            .await
            .map_err(|_| SyncError::ChannelError("Notifier channel closed".into()))?;
        ack_rx
            .await
            .map_err(|_| SyncError::ChannelError("Notifier dropped flush".into()))
    }

    /// Flushes, then stops the notifier.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(NotifierCommand::Shutdown(ack_tx))
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        ack_rx.await.map_err(|_| SyncError::ShuttingDown)
    }
}

/// Debounces change events into automatic syncs.
pub struct ChangeNotifier {
    target: Arc<dyn AutoSyncTarget>,
    debounce: Duration,
    enabled: bool,
}

impl ChangeNotifier {
    pub fn new(target: Arc<dyn AutoSyncTarget>, debounce: Duration, enabled: bool) -> Self {
        ChangeNotifier {
            target,
            debounce,
            enabled,
        }
    }

    /// Spawns the notifier task and returns its handle.
    pub fn start(self) -> NotifierHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        tokio::spawn(async move {
            self.run(cmd_rx).await;
        });

        NotifierHandle { cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<NotifierCommand>) {
        info!(
            debounce_ms = self.debounce.as_millis() as u64,
            enabled = self.enabled,
            "Change notifier started"
        );

        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(NotifierCommand::Changed) => {
                            if self.enabled {
                                deadline = Some(Instant::now() + self.debounce);
                            }
                        }
                        Some(NotifierCommand::SetEnabled(enabled)) => {
                            self.enabled = enabled;
                            if !enabled && deadline.take().is_some() {
                                debug!("Auto-sync disabled, pending sync cancelled");
                            }
                        }
                        Some(NotifierCommand::Flush(ack)) => {
                            if deadline.take().is_some() {
                                self.fire().await;
                            }
                            let _ = ack.send(());
                        }
                        Some(NotifierCommand::Shutdown(ack)) => {
                            if deadline.take().is_some() {
                                self.fire().await;
                            }
                            info!("Change notifier shutting down");
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            warn!("All notifier handles dropped");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.fire().await;
                }
            }
        }
    }

    async fn fire(&self) {
        if !self.enabled {
            return;
        }
        debug!("Debounce window closed, starting automatic sync");
        self.target.auto_sync().await;
    }
}
