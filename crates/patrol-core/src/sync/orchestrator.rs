//! Single-flight drain of the outbox to the ingestion endpoint.
//!
//! Two layers keep drains from overlapping: an in-process flag for triggers
//! sharing one orchestrator, and a lease row in the outbox file for separate
//! processes opening the same database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use super::client::{IngestionClient, SubmitError};
use crate::models::{EventKind, PendingCounts, PendingEvent};
use crate::services::OutboxStore;

const EVENT_CHANNEL_CAPACITY: usize = 32;
/// Slack on top of the submit timeout before an abandoned lease can be taken over.
const LEASE_GRACE: Duration = Duration::from_secs(30);

/// Why the drain of one kind stopped before the kind was empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    Submit(SubmitError),
    Storage(String),
    /// The drain lease expired and another process took it over.
    Superseded,
}

/// Result of draining one kind during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindReport {
    pub kind: EventKind,
    pub accepted: u64,
    pub halted: Option<HaltReason>,
}

/// Result of one full sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub kinds: Vec<KindReport>,
    /// Counts recomputed from the store once both kinds were attempted.
    pub remaining: PendingCounts,
}

impl SyncReport {
    pub fn accepted(&self) -> u64 {
        self.kinds.iter().map(|report| report.accepted).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another cycle, here or in another process, was draining; nothing was attempted.
    AlreadyRunning,
    Ran(SyncReport),
}

/// Notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A kind's drain was cut short; its remaining records wait for the next trigger.
    Deferred { kind: EventKind, reason: HaltReason },
    Finished(SyncReport),
    /// A cycle ended with nothing pending.
    Complete,
}

/// Coordinates draining unsynced records, at most one cycle at a time.
pub struct SyncOrchestrator {
    store: OutboxStore,
    client: Arc<dyn IngestionClient>,
    submit_timeout: Duration,
    lease_holder: String,
    lease_ttl: Duration,
    in_progress: AtomicBool,
    counts: watch::Sender<PendingCounts>,
    events: broadcast::Sender<SyncEvent>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: OutboxStore,
        client: Arc<dyn IngestionClient>,
        submit_timeout: Duration,
    ) -> Self {
        let (counts, _) = watch::channel(PendingCounts::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            client,
            submit_timeout,
            lease_holder: uuid::Uuid::now_v7().to_string(),
            lease_ttl: submit_timeout.saturating_add(LEASE_GRACE),
            in_progress: AtomicBool::new(false),
            counts,
            events,
        }
    }

    pub const fn store(&self) -> &OutboxStore {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Latest published counts.
    pub fn pending_counts(&self) -> PendingCounts {
        *self.counts.borrow()
    }

    pub fn subscribe_counts(&self) -> watch::Receiver<PendingCounts> {
        self.counts.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Recount unsynced records and publish the result.
    pub async fn refresh_counts(&self) -> crate::Result<PendingCounts> {
        let counts = self.store.pending_counts().await?;
        self.counts.send_replace(counts);
        Ok(counts)
    }

    /// Run one drain cycle unless one is already running.
    ///
    /// Never returns an error: failures defer records to the next trigger and
    /// are reported through [`SyncReport`] and [`SyncEvent::Deferred`].
    pub async fn attempt_sync(&self) -> SyncOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in progress; trigger dropped");
            return SyncOutcome::AlreadyRunning;
        }
        let _guard = InFlightGuard(&self.in_progress);

        let kinds = match self.renew_lease().await {
            Ok(true) => {
                tracing::debug!(holder = %self.lease_holder, "Sync cycle started");
                let mut kinds = Vec::with_capacity(EventKind::ALL.len());
                for kind in EventKind::ALL {
                    kinds.push(self.drain_kind(kind).await);
                }
                if let Err(error) = self.store.release_drain_lease(&self.lease_holder).await {
                    tracing::warn!(%error, "Failed to release drain lease");
                }
                kinds
            }
            Ok(false) => {
                tracing::debug!("Another process is draining the outbox; trigger dropped");
                return SyncOutcome::AlreadyRunning;
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to take drain lease");
                EventKind::ALL
                    .into_iter()
                    .map(|kind| KindReport {
                        kind,
                        accepted: 0,
                        halted: Some(HaltReason::Storage(error.to_string())),
                    })
                    .collect()
            }
        };

        for report in &kinds {
            if let Some(reason) = &report.halted {
                let _ = self.events.send(SyncEvent::Deferred {
                    kind: report.kind,
                    reason: reason.clone(),
                });
            }
        }

        let (remaining, recounted) = match self.refresh_counts().await {
            Ok(counts) => (counts, true),
            Err(error) => {
                tracing::warn!(%error, "Failed to recount pending records");
                (self.pending_counts(), false)
            }
        };

        let report = SyncReport { kinds, remaining };
        tracing::info!(
            accepted = report.accepted(),
            pending = remaining.total(),
            "Sync cycle finished"
        );
        let _ = self.events.send(SyncEvent::Finished(report.clone()));
        if recounted && report.is_complete() {
            tracing::info!("Sync complete");
            let _ = self.events.send(SyncEvent::Complete);
        }
        SyncOutcome::Ran(report)
    }

    /// Submit one kind's unsynced records oldest first, stopping at the first failure.
    async fn drain_kind(&self, kind: EventKind) -> KindReport {
        let mut cursor = self.store.unsynced(kind);
        let mut accepted = 0;

        let halted = loop {
            let event = match cursor.next().await {
                Ok(Some(event)) => event,
                Ok(None) => break None,
                Err(error) => {
                    tracing::warn!(kind = kind.label(), %error, "Failed to read outbox");
                    break Some(HaltReason::Storage(error.to_string()));
                }
            };

            // Renew before every submission so a stalled drain cannot outlive its lease.
            match self.renew_lease().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(kind = kind.label(), "Drain lease lost; stopping");
                    break Some(HaltReason::Superseded);
                }
                Err(error) => {
                    tracing::warn!(kind = kind.label(), %error, "Failed to renew drain lease");
                    break Some(HaltReason::Storage(error.to_string()));
                }
            }

            if let Err(error) = self.submit(&event).await {
                tracing::warn!(
                    kind = kind.label(),
                    local_id = event.local_id().get(),
                    retryable = error.is_retryable(),
                    %error,
                    "Submission failed; deferring remaining records"
                );
                break Some(HaltReason::Submit(error));
            }

            match self.store.mark_synced(kind, event.local_id()).await {
                Ok(_) => {
                    accepted += 1;
                    if let Ok(counts) = self.store.pending_counts().await {
                        self.counts.send_replace(counts);
                    }
                }
                Err(error) => {
                    // The endpoint deduplicates by offline id, so resubmitting later is safe.
                    tracing::warn!(
                        kind = kind.label(),
                        local_id = event.local_id().get(),
                        %error,
                        "Failed to mark record synced"
                    );
                    break Some(HaltReason::Storage(error.to_string()));
                }
            }
        };

        KindReport {
            kind,
            accepted,
            halted,
        }
    }

    async fn renew_lease(&self) -> crate::Result<bool> {
        self.store
            .acquire_drain_lease(&self.lease_holder, self.lease_ttl)
            .await
    }

    async fn submit(&self, event: &PendingEvent) -> Result<(), SubmitError> {
        let receipt = tokio::time::timeout(self.submit_timeout, self.client.submit(event))
            .await
        .map_err(|_| SubmitError::Timeout(self.submit_timeout))??;

        tracing::debug!(
            kind = event.kind().label(),
            local_id = event.local_id().get(),
            offline_id = %event.offline_id(),
            operator_id = %event.operator_id(),
            server_record_id = receipt.server_record_id,
            duplicate = receipt.duplicate,
            "Submission accepted"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::{NewCheckIn, NewIncidentReport, OfflineId, OperatorId};
    use crate::sync::client::SubmitResult;
    use crate::wire::IngestReceipt;

    /// Scriptable fake endpoint that records every submission it sees.
    #[derive(Default)]
    pub(crate) struct FakeIngestion {
        submitted: Mutex<Vec<(OfflineId, OperatorId)>>,
        script: Mutex<VecDeque<Option<SubmitError>>>,
        offline: AtomicBool,
        delay: Option<Duration>,
    }

    impl FakeIngestion {
        pub(crate) fn accepting() -> Self {
            Self::default()
        }

        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        /// Queue per-call outcomes; `None` accepts. Unscripted calls accept.
        pub(crate) fn scripted(outcomes: Vec<Option<SubmitError>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        pub(crate) fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub(crate) fn submitted(&self) -> Vec<OfflineId> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|(offline_id, _)| offline_id.clone())
                .collect()
        }

        pub(crate) fn submitted_by(&self) -> Vec<String> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|(_, operator)| operator.as_str().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl IngestionClient for FakeIngestion {
        async fn submit(&self, event: &PendingEvent) -> SubmitResult<IngestReceipt> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(SubmitError::Unreachable("network down".to_string()));
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.script.lock().unwrap().pop_front().flatten();
            if let Some(error) = scripted {
                return Err(error);
            }

            let mut submitted = self.submitted.lock().unwrap();
            submitted.push((event.offline_id(), event.operator_id().clone()));
            Ok(IngestReceipt {
                accepted: true,
                server_record_id: i64::try_from(submitted.len()).unwrap(),
                duplicate: false,
            })
        }
    }

    pub(crate) fn orchestrator(
        store: &OutboxStore,
        client: Arc<FakeIngestion>,
    ) -> Arc<SyncOrchestrator> {
        Arc::new(SyncOrchestrator::new(
            store.clone(),
            client,
            Duration::from_secs(5),
        ))
    }

    fn ran(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Ran(report) => report,
            SyncOutcome::AlreadyRunning => panic!("expected the cycle to run"),
        }
    }

    async fn capture(store: &OutboxStore, tag: &str, captured_at: i64) -> OfflineId {
        store
            .append_check_in(&NewCheckIn::new(tag).captured_at(captured_at))
            .await
            .unwrap()
            .offline_id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_converges_pending_count_to_zero() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        for (index, tag) in ["a", "b", "c", "d"].iter().enumerate() {
            capture(&store, tag, i64::try_from(index).unwrap()).await;
        }
        store
            .append_incident_report(&NewIncidentReport::new("leak"))
            .await
            .unwrap();

        let client = Arc::new(FakeIngestion::accepting());
        let orchestrator = orchestrator(&store, client.clone());
        let report = ran(orchestrator.attempt_sync().await);

        assert_eq!(report.accepted(), 5);
        assert!(report.is_complete());
        assert_eq!(store.pending_counts().await.unwrap().total(), 0);
        assert_eq!(orchestrator.pending_counts(), PendingCounts::default());
        assert!(!orchestrator.is_syncing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_halts_kind_and_keeps_newest_pending() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        let first = capture(&store, "t1", 10).await;
        let second = capture(&store, "t2", 20).await;
        capture(&store, "t3", 30).await;

        let client = Arc::new(FakeIngestion::scripted(vec![
            None,
            None,
            Some(SubmitError::Unreachable("dropped".to_string())),
        ]));
        let orchestrator = orchestrator(&store, client.clone());
        let report = ran(orchestrator.attempt_sync().await);

        assert_eq!(client.submitted(), vec![first, second]);
        assert_eq!(report.remaining.check_ins, 1);
        let pending = store.history(EventKind::CheckIn, 10).await.unwrap();
        let unsynced: Vec<i64> = pending
            .iter()
            .filter(|event| !event.is_synced())
            .map(PendingEvent::captured_at)
            .collect();
        assert_eq!(unsynced, vec![30]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kinds_drain_independently() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        capture(&store, "t1", 1).await;
        store
            .append_incident_report(&NewIncidentReport::new("broken gate").captured_at(2))
            .await
            .unwrap();

        let client = Arc::new(FakeIngestion::scripted(vec![Some(SubmitError::Rejected {
            status: 400,
            message: "bad tag".to_string(),
        })]));
        let orchestrator = orchestrator(&store, client.clone());
        let mut events = orchestrator.subscribe_events();
        let report = ran(orchestrator.attempt_sync().await);

        assert_eq!(report.kinds[0].accepted, 0);
        assert!(report.kinds[0].halted.is_some());
        assert_eq!(report.kinds[1].accepted, 1);
        assert_eq!(report.remaining.check_ins, 1);
        assert_eq!(report.remaining.incident_reports, 0);

        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Deferred {
                kind: EventKind::CheckIn,
                ..
            }
        ));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Finished(_)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_attempts_submit_each_record_once() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        capture(&store, "a", 1).await;
        capture(&store, "b", 2).await;

        let client = Arc::new(FakeIngestion::with_delay(Duration::from_millis(50)));
        let orchestrator = orchestrator(&store, client.clone());

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.attempt_sync().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = orchestrator.attempt_sync().await;

        assert_eq!(second, SyncOutcome::AlreadyRunning);
        let report = ran(first.await.unwrap());
        assert_eq!(report.accepted(), 2);
        assert_eq!(client.submitted().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_after_rejection_does_not_resubmit_accepted_record() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        let first = capture(&store, "a", 1).await;
        let second = capture(&store, "b", 2).await;

        let client = Arc::new(FakeIngestion::scripted(vec![
            None,
            Some(SubmitError::Rejected {
                status: 503,
                message: "busy".to_string(),
            }),
        ]));
        let orchestrator = orchestrator(&store, client.clone());

        let report = ran(orchestrator.attempt_sync().await);
        assert_eq!(report.remaining.total(), 1);

        let report = ran(orchestrator.attempt_sync().await);
        assert_eq!(report.remaining.total(), 0);
        assert_eq!(client.submitted(), vec![first, second]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_submission_times_out_and_releases_guard() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        capture(&store, "a", 1).await;

        let client = Arc::new(FakeIngestion::with_delay(Duration::from_millis(500)));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            client,
            Duration::from_millis(20),
        ));

        let report = ran(orchestrator.attempt_sync().await);
        assert_eq!(
            report.kinds[0].halted,
            Some(HaltReason::Submit(SubmitError::Timeout(
                Duration::from_millis(20)
            )))
        );
        assert!(!orchestrator.is_syncing());
        assert_eq!(report.remaining.check_ins, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn complete_fires_only_when_nothing_remains() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        capture(&store, "a", 1).await;

        let client = Arc::new(FakeIngestion::accepting());
        client.set_offline(true);
        let orchestrator = orchestrator(&store, client.clone());
        let mut events = orchestrator.subscribe_events();

        orchestrator.attempt_sync().await;
        client.set_offline(false);
        orchestrator.attempt_sync().await;

        let mut completes = 0;
        while let Ok(event) = events.try_recv() {
            if event == SyncEvent::Complete {
                completes += 1;
            }
        }
        assert_eq!(completes, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_from_two_store_handles_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        let first_store = OutboxStore::open_path(&path).await.unwrap();
        let second_store = OutboxStore::open_path(&path).await.unwrap();
        capture(&first_store, "a", 1).await;

        let client = Arc::new(FakeIngestion::with_delay(Duration::from_millis(100)));
        let first = orchestrator(&first_store, client.clone());
        let second = orchestrator(&second_store, client.clone());

        let (left, right) = tokio::join!(first.attempt_sync(), second.attempt_sync());
        let ran_count = [&left, &right]
            .iter()
            .filter(|outcome| matches!(outcome, SyncOutcome::Ran(_)))
            .count();
        assert_eq!(ran_count, 1);
        assert!(left == SyncOutcome::AlreadyRunning || right == SyncOutcome::AlreadyRunning);
        assert_eq!(client.submitted().len(), 1);

        // The lease is released once the winning cycle ends.
        capture(&second_store, "b", 2).await;
        let report = ran(second.attempt_sync().await);
        assert_eq!(report.accepted(), 1);
        assert_eq!(client.submitted().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_foreign_lease_blocks_cycle() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        capture(&store, "a", 1).await;
        assert!(store
            .acquire_drain_lease("other-process", Duration::from_secs(60))
            .await
            .unwrap());

        let client = Arc::new(FakeIngestion::accepting());
        let orchestrator = orchestrator(&store, client.clone());
        assert_eq!(orchestrator.attempt_sync().await, SyncOutcome::AlreadyRunning);
        assert!(client.submitted().is_empty());

        store.release_drain_lease("other-process").await.unwrap();
        assert_eq!(ran(orchestrator.attempt_sync().await).accepted(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submissions_carry_capturing_operator() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        store
            .append_check_in(
                &NewCheckIn::new("a")
                    .captured_at(1)
                    .captured_by(OperatorId::new("alice")),
            )
            .await
            .unwrap();
        store
            .append_check_in(
                &NewCheckIn::new("b")
                    .captured_at(2)
                    .captured_by(OperatorId::new("bob")),
            )
            .await
            .unwrap();

        let client = Arc::new(FakeIngestion::accepting());
        let orchestrator = orchestrator(&store, client.clone());
        ran(orchestrator.attempt_sync().await);

        assert_eq!(client.submitted_by(), vec!["alice", "bob"]);
    }
}
