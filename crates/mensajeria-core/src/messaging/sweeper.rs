//! Background maintenance task.
//!
//! Every `cleanup_interval` the task flushes dirty chats and deletes expired
//! messages. Shutdown is cooperative: a pass that already started runs to
//! completion before the task exits.

use super::engine::ChatEngine;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handle to a running cleanup task.
pub struct CleanupTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Ask the task to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "cleanup task ended abnormally");
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl ChatEngine {
    /// Start the periodic flush and expiry task on the current runtime.
    ///
    /// Dropping the returned handle also stops the task after its current
    /// pass. A zero `cleanup_interval` is rejected.
    pub fn spawn_cleanup(self: &Arc<Self>) -> Result<CleanupTask> {
        let period = self.config().cleanup_interval;
        if period.is_zero() {
            return Err(Error::InvalidConfig("cleanup interval must be positive".into()));
        }
        let engine = Arc::clone(self);
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "cleanup task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.sweep().await,
                    _ = stopped.changed() => break,
                }
            }
            info!("cleanup task stopped");
        });

        Ok(CleanupTask { stop, handle })
    }

    /// One maintenance pass: flush dirty chats, then delete expired messages.
    ///
    /// Failures are logged and retried on the next pass.
    pub async fn sweep(&self) {
        if let Err(e) = self.flush_all().await {
            warn!(error = %e, "sweep could not flush every chat");
        }
        match self.cleanup_expired_messages().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "sweep removed expired messages"),
            Err(e) => warn!(error = %e, "sweep could not delete expired messages"),
        }
    }
}
