//! Background sync worker
//!
//! Owns the drain triggers that do not come from API calls: reconnect events
//! from the network monitor and the periodic background wake.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::engine::{DrainOutcome, SyncEngine};
use crate::error::{Result, SyncError};

/// Commands for the sync worker
#[derive(Debug)]
pub enum SyncCommand {
    /// Drain now (host background task, push notification, ...)
    Wake,
    /// Stop the worker
    Stop,
}

/// Background sync worker
pub struct SyncWorker {
    sender: mpsc::Sender<SyncCommand>,
    task: JoinHandle<()>,
    polling: JoinHandle<()>,
}

impl SyncWorker {
    /// Start polling connectivity and listening for drain triggers
    pub fn start(engine: SyncEngine) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SyncCommand>(100);
        let mut network_events = engine.network().subscribe();
        let polling = engine.network().spawn_polling();

        let wake_every = Duration::from_secs(engine.config().wake_interval_secs);

        let task = tokio::spawn(async move {
            let mut wake_interval = interval_at(Instant::now() + wake_every, wake_every);
            wake_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                wake_interval_secs = wake_every.as_secs(),
                "sync worker started"
            );

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(SyncCommand::Wake) => Self::run_drain(&engine, "wake").await,
                            Some(SyncCommand::Stop) | None => break,
                        }
                    }
                    event = network_events.recv() => {
                        match event {
                            Ok(event) if event.came_online => {
                                Self::run_drain(&engine, "reconnect").await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                // A missed flip is caught by the next wake
                                tracing::debug!(skipped, "network events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = wake_interval.tick() => {
                        Self::run_drain(&engine, "periodic").await;
                    }
                }
            }

            tracing::info!("sync worker stopped");
        });

        Self {
            sender,
            task,
            polling,
        }
    }

    async fn run_drain(engine: &SyncEngine, trigger: &str) {
        match engine.drain().await {
            Ok(DrainOutcome::Completed(report)) => {
                tracing::debug!(trigger, dispatched = report.dispatched.len(), "triggered drain finished");
            }
            Ok(outcome) => {
                tracing::debug!(trigger, ?outcome, "triggered drain skipped");
            }
            Err(e) => {
                tracing::error!(trigger, error = %e, "triggered drain failed");
            }
        }
    }

    /// Request a drain
    pub async fn wake(&self) -> Result<()> {
        self.sender
            .send(SyncCommand::Wake)
            .await
            .map_err(|_| SyncError::Sync("Worker channel closed".to_string()))?;
        Ok(())
    }

    /// Stop the worker and its connectivity polling
    pub async fn stop(self) -> Result<()> {
        self.polling.abort();
        self.sender
            .send(SyncCommand::Stop)
            .await
            .map_err(|_| SyncError::Sync("Worker channel closed".to_string()))?;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("sync worker panicked: {}", e)))?;
        Ok(())
    }
}
