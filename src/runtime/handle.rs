use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{Duration, Instant, Interval, MissedTickBehavior},
};

use crate::{
    config::ClientConfig,
    sync::refetch::{RefetchCoordinator, RefreshReport},
    types::CollectionKind,
};

use super::events::CacheEvent;

/// Refresh loop handle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The loop task has exited.
    #[error("refresh loop has stopped")]
    ChannelClosed,
}

/// Clonable handle to a running refresh loop.
#[derive(Clone)]
pub struct RefreshLoopHandle {
    cmd_tx: mpsc::Sender<Command>,
    coordinator: Arc<RefetchCoordinator>,
}

enum Command {
    RefreshNow {
        kind: Option<CollectionKind>,
        resp: oneshot::Sender<RefreshReport>,
    },
    RefreshBalances {
        resp: oneshot::Sender<Option<usize>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Spawns the background task that refreshes collections on a fixed tick and on demand.
///
/// The first tick fires one full interval after spawning. Must be called inside a tokio
/// runtime.
pub fn spawn_refresh_loop(coordinator: Arc<RefetchCoordinator>, config: &ClientConfig) -> RefreshLoopHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(32);
    let mut ticker = config.refresh_interval().map(interval_after);
    let loop_coordinator = Arc::clone(&coordinator);

    tokio::spawn(async move {
        let coordinator = loop_coordinator;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if handle_command(cmd, &coordinator).await {
                        break;
                    }
                }
                _ = next_tick(&mut ticker) => {
                    let report = coordinator.refresh_all().await;
                    log::debug!("periodic refresh: {report:?}");
                }
            }
        }
        log::debug!("refresh loop stopped");
    });

    RefreshLoopHandle { cmd_tx, coordinator }
}

fn interval_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl RefreshLoopHandle {
    /// Broadcast receiver for committed cache changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.coordinator.store().subscribe()
    }

    /// Refreshes one collection, or every collection when `kind` is `None`.
    pub async fn refresh_now(&self, kind: Option<CollectionKind>) -> Result<RefreshReport, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RefreshNow { kind, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Runs the throttled balances-only refresh on the loop task.
    pub async fn refresh_balances(&self) -> Result<Option<usize>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RefreshBalances { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Stops the loop after acknowledging.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }
}

async fn handle_command(cmd: Command, coordinator: &RefetchCoordinator) -> bool {
    match cmd {
        Command::RefreshNow { kind, resp } => {
            let report = match kind {
                None => coordinator.refresh_all().await,
                Some(CollectionKind::Users) => RefreshReport {
                    users: coordinator.refresh_users().await.map(|c| c.len()),
                    ..RefreshReport::default()
                },
                Some(CollectionKind::Products) => RefreshReport {
                    products: coordinator.refresh_products().await.map(|c| c.len()),
                    ..RefreshReport::default()
                },
            };
            let _ = resp.send(report);
        }
        Command::RefreshBalances { resp } => {
            let _ = resp.send(coordinator.refresh_balances().await);
        }
        Command::Shutdown { resp } => {
            let _ = resp.send(());
            return true;
        }
    }

    false
}
