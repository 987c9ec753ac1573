//! Single-worker actor that turns sync triggers into drain cycles.
//!
//! Every trigger goes through one bounded mailbox, so at most one cycle runs
//! at a time. Triggers that pile up while a cycle runs are discarded when it
//! ends instead of being replayed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::orchestrator::{SyncOrchestrator, SyncOutcome, SyncReport};
use crate::connectivity::{ConnectivityEdge, ConnectivityMonitor};

const MAILBOX_CAPACITY: usize = 1;

/// What asked for a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    BecameReachable,
    /// Periodic tick. Only runs a cycle when something is pending.
    Timer,
    Manual,
}

struct SyncRequest {
    trigger: SyncTrigger,
    reply: Option<oneshot::Sender<SyncOutcome>>,
}

/// Cloneable handle for submitting triggers to a running [`SyncWorker`].
#[derive(Clone)]
pub struct SyncHandle {
    mailbox: mpsc::Sender<SyncRequest>,
}

impl SyncHandle {
    /// Queue a trigger without waiting. Returns false when it was dropped.
    pub fn request(&self, trigger: SyncTrigger) -> bool {
        let queued = self
            .mailbox
            .try_send(SyncRequest {
                trigger,
                reply: None,
            })
            .is_ok();
        if !queued {
            tracing::debug!(?trigger, "Sync trigger dropped");
        }
        queued
    }

    /// Operator-requested sync; waits for the cycle it started.
    ///
    /// Returns [`SyncOutcome::AlreadyRunning`] when the request was dropped
    /// because another cycle was running or queued.
    pub async fn sync_now(&self) -> SyncOutcome {
        let (reply, outcome) = oneshot::channel();
        let request = SyncRequest {
            trigger: SyncTrigger::Manual,
            reply: Some(reply),
        };
        if self.mailbox.try_send(request).is_err() {
            return SyncOutcome::AlreadyRunning;
        }
        outcome.await.unwrap_or(SyncOutcome::AlreadyRunning)
    }
}

pub struct SyncWorker {
    orchestrator: Arc<SyncOrchestrator>,
    mailbox: mpsc::Receiver<SyncRequest>,
    edges: broadcast::Receiver<ConnectivityEdge>,
    edges_open: bool,
    monitor: ConnectivityMonitor,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SyncWorker {
    /// Start the worker. It runs until `shutdown` becomes true or every
    /// handle is dropped.
    ///
    /// The timer fires once immediately, so records left over from a previous
    /// session are attempted at startup.
    pub fn spawn(
        orchestrator: Arc<SyncOrchestrator>,
        monitor: &ConnectivityMonitor,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (sender, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = Self {
            orchestrator,
            mailbox,
            edges: monitor.subscribe(),
            edges_open: true,
            monitor: monitor.clone(),
            interval,
            shutdown,
        };
        let handle = tokio::spawn(worker.run());
        (SyncHandle { mailbox: sender }, handle)
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Sync worker started");

        loop {
            let request = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                request = self.mailbox.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                edge = self.edges.recv(), if self.edges_open => {
                    match self.edge_trigger(edge) {
                        Some(trigger) => SyncRequest { trigger, reply: None },
                        None => continue,
                    }
                }
                _ = ticker.tick() => SyncRequest { trigger: SyncTrigger::Timer, reply: None },
            };

            let outcome = self.handle(request.trigger).await;
            if let Some(reply) = request.reply {
                let _ = reply.send(outcome);
            }
            self.discard_stale_triggers();
        }

        tracing::info!("Sync worker stopped");
    }

    fn edge_trigger(
        &mut self,
        edge: Result<ConnectivityEdge, RecvError>,
    ) -> Option<SyncTrigger> {
        match edge {
            Ok(ConnectivityEdge::BecameReachable) => Some(SyncTrigger::BecameReachable),
            Ok(ConnectivityEdge::BecameUnreachable) => None,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Connectivity edges lagged");
                self.monitor
                    .current()
                    .is_reachable()
                    .then_some(SyncTrigger::BecameReachable)
            }
            Err(RecvError::Closed) => {
                self.edges_open = false;
                None
            }
        }
    }

    async fn handle(&self, trigger: SyncTrigger) -> SyncOutcome {
        if trigger == SyncTrigger::Timer {
            match self.orchestrator.refresh_counts().await {
                Ok(counts) if counts.is_empty() => {
                    tracing::trace!("Timer tick with nothing pending");
                    return SyncOutcome::Ran(SyncReport {
                        kinds: Vec::new(),
                        remaining: counts,
                    });
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "Failed to count pending records"),
            }
        }

        tracing::debug!(?trigger, "Running sync cycle");
        self.orchestrator.attempt_sync().await
    }

    /// Drop triggers that arrived while the last cycle ran.
    fn discard_stale_triggers(&mut self) {
        while let Ok(request) = self.mailbox.try_recv() {
            tracing::debug!(trigger = ?request.trigger, "Discarding trigger queued during sync");
            if let Some(reply) = request.reply {
                let _ = reply.send(SyncOutcome::AlreadyRunning);
            }
        }
        while self.edges_open {
            match self.edges.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => self.edges_open = false,
            }
        }
    }
}
