//! Fire-and-forget ingestion of domain events into the run queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use tenantry_kernel::{
    DeploymentMode, KernelError, ManagerId, OpsRepository, PropertyId, Run, RunId, SharedClock,
    TriggerType, WorkflowType,
};

use crate::replay::{ConsumeOutcome, ReplayCache};

pub const EVENTS_NAMESPACE: &str = "events";
pub const DEFAULT_EVENT_DEDUP_TTL_SECS: i64 = 2 * 60 * 60;

/// A domain fact detected by the application, e.g. a preventive
/// maintenance item falling due.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub manager_id: ManagerId,
    #[serde(default)]
    pub property_id: Option<PropertyId>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Bucket time; ingestion time when absent.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, manager_id: impl Into<ManagerId>) -> Self {
        Self {
            event_type: event_type.into(),
            manager_id: manager_id.into(),
            property_id: None,
            entity_id: None,
            payload: Value::Null,
            occurred_at: None,
        }
    }

    pub fn with_property(mut self, property_id: impl Into<PropertyId>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// `{type}:{entity or property}:{hour bucket}`; repeats inside the same
    /// hour collapse to one id.
    pub fn event_id(&self, now: DateTime<Utc>) -> String {
        let subject = self
            .entity_id
            .as_deref()
            .or(self.property_id.as_deref())
            .unwrap_or("-");
        let bucket = self.occurred_at.unwrap_or(now).format("%Y-%m-%dT%H");
        format!("{}:{}:{}", self.event_type, subject, bucket)
    }
}

/// Which workflow an event type starts.
#[derive(Clone, Debug, Default)]
pub struct EventRoutes {
    routes: HashMap<String, WorkflowType>,
}

impl EventRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(
        mut self,
        event_type: impl Into<String>,
        workflow_type: impl Into<WorkflowType>,
    ) -> Self {
        self.routes.insert(event_type.into(), workflow_type.into());
        self
    }

    pub fn workflow_for(&self, event_type: &str) -> Option<&WorkflowType> {
        self.routes.get(event_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Enqueued { run_id: RunId },
    Duplicate,
    /// The dedup cache was unreachable in production; nothing enqueued.
    Skipped,
    Unrouted,
}

pub struct EventPublisher {
    repo: Arc<dyn OpsRepository>,
    replay: Arc<ReplayCache>,
    routes: EventRoutes,
    clock: SharedClock,
    dedup_ttl: Duration,
    mode: DeploymentMode,
}

impl EventPublisher {
    pub fn new(
        repo: Arc<dyn OpsRepository>,
        replay: Arc<ReplayCache>,
        routes: EventRoutes,
        clock: SharedClock,
        mode: DeploymentMode,
    ) -> Self {
        Self {
            repo,
            replay,
            routes,
            clock,
            dedup_ttl: Duration::seconds(DEFAULT_EVENT_DEDUP_TTL_SECS),
            mode,
        }
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Spawns [`ingest`](Self::ingest) and returns at once. Failures are
    /// logged inside the task; the handle exists for tests and shutdown.
    pub fn publish(self: &Arc<Self>, event: DomainEvent) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            let event_type = event.event_type.clone();
            if let Err(err) = publisher.ingest(event).await {
                tracing::error!(event_type = %event_type, error = %err, "event_publish_failed");
            }
        })
    }

    /// Dedup then enqueue. The run's `trigger_ref` uniqueness backs up the
    /// cache when it expires early or is unavailable.
    pub async fn ingest(&self, event: DomainEvent) -> Result<IngestOutcome, KernelError> {
        let Some(workflow_type) = self.routes.workflow_for(&event.event_type).cloned() else {
            tracing::debug!(event_type = %event.event_type, "event_unrouted");
            return Ok(IngestOutcome::Unrouted);
        };
        let now = self.clock.now();
        let event_id = event.event_id(now);

        match self
            .replay
            .consume(EVENTS_NAMESPACE, &event_id, self.dedup_ttl)
            .await
        {
            ConsumeOutcome::Accepted => {}
            ConsumeOutcome::Duplicate => return Ok(IngestOutcome::Duplicate),
            ConsumeOutcome::Unavailable if self.mode.allows_local_fallback() => {}
            ConsumeOutcome::Unavailable => {
                tracing::warn!(event_id = %event_id, "event_skipped_fail_closed");
                return Ok(IngestOutcome::Skipped);
            }
        }

        let mut run = Run::pending(workflow_type, event.manager_id, TriggerType::Event, now)
            .with_trigger_ref(event_id.clone());
        if let Some(property_id) = event.property_id {
            run = run.with_property(property_id);
        }
        if !event.payload.is_null() {
            run = run.with_payload(event.payload);
        }
        match self.repo.insert_run(&run).await {
            Ok(()) => {}
            Err(KernelError::Conflict(_)) => {
                tracing::debug!(event_id = %event_id, "event_duplicate_trigger_ref");
                return Ok(IngestOutcome::Duplicate);
            }
            Err(err) => {
                // nothing was enqueued; a redelivery must not look like a duplicate
                let released = self.replay.release(EVENTS_NAMESPACE, &event_id).await;
                tracing::warn!(event_id = %event_id, released, error = %err, "event_enqueue_failed");
                return Err(err);
            }
        }
        tracing::info!(
            event_id = %event_id,
            run_id = %run.id,
            workflow_type = %run.workflow_type,
            "event_enqueued"
        );
        Ok(IngestOutcome::Enqueued { run_id: run.id })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use tenantry_kernel::testing::FlakyRepository;
    use tenantry_kernel::{InMemoryRepository, ManualClock, RunQuery};

    use super::*;
    use crate::coordinator::testing::UnreachableCoordinator;
    use crate::coordinator::{InMemoryCoordinator, KeySpace};

    fn publisher(
        repo: Arc<dyn OpsRepository>,
        coordinator: Arc<dyn crate::coordinator::Coordinator>,
        mode: DeploymentMode,
    ) -> (Arc<ManualClock>, Arc<EventPublisher>) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 9, 10, 0).unwrap());
        let replay = Arc::new(ReplayCache::new(coordinator, KeySpace::new("test"), clock.clone()));
        let routes = EventRoutes::new().route("PM_DUE", "PM_DUE");
        let publisher = EventPublisher::new(repo, replay, routes, clock.clone(), mode);
        (clock, Arc::new(publisher))
    }

    fn pm_due() -> DomainEvent {
        DomainEvent::new("PM_DUE", "mgr-1")
            .with_property("P1")
            .with_entity("S1")
            .with_payload(json!({"schedule": "S1"}))
    }

    #[test]
    fn event_id_buckets_by_hour() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 59).unwrap();
        assert_eq!(pm_due().event_id(at), "PM_DUE:S1:2026-03-01T09");
        let no_entity = DomainEvent::new("LEASE_EXPIRING", "mgr-1").with_property("P1");
        assert_eq!(no_entity.event_id(at), "LEASE_EXPIRING:P1:2026-03-01T09");
    }

    #[tokio::test]
    async fn same_hour_collapses_next_hour_enqueues_again() {
        let repo = Arc::new(InMemoryRepository::new());
        let (clock, publisher) = publisher(
            repo.clone(),
            Arc::new(InMemoryCoordinator::new()),
            DeploymentMode::Production,
        );
        assert!(matches!(
            publisher.ingest(pm_due()).await.unwrap(),
            IngestOutcome::Enqueued { .. }
        ));
        clock.advance(Duration::minutes(30));
        assert_eq!(publisher.ingest(pm_due()).await.unwrap(), IngestOutcome::Duplicate);

        clock.advance(Duration::minutes(30));
        assert!(matches!(
            publisher.ingest(pm_due()).await.unwrap(),
            IngestOutcome::Enqueued { .. }
        ));
        assert_eq!(repo.list_runs(&RunQuery::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_cache_fails_closed_in_production_only() {
        let repo = Arc::new(InMemoryRepository::new());
        let (_, prod) = publisher(
            repo.clone(),
            Arc::new(UnreachableCoordinator),
            DeploymentMode::Production,
        );
        assert_eq!(prod.ingest(pm_due()).await.unwrap(), IngestOutcome::Skipped);

        let (_, dev) = publisher(
            repo.clone(),
            Arc::new(UnreachableCoordinator),
            DeploymentMode::Development,
        );
        assert!(matches!(
            dev.ingest(pm_due()).await.unwrap(),
            IngestOutcome::Enqueued { .. }
        ));
        // the trigger_ref backstop still catches the repeat
        assert_eq!(dev.ingest(pm_due()).await.unwrap(), IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn unrouted_events_are_dropped_and_publish_never_fails() {
        let repo = Arc::new(InMemoryRepository::new());
        let (_, publisher) = publisher(
            repo.clone(),
            Arc::new(InMemoryCoordinator::new()),
            DeploymentMode::Production,
        );
        assert_eq!(
            publisher
                .ingest(DomainEvent::new("UNKNOWN", "mgr-1"))
                .await
                .unwrap(),
            IngestOutcome::Unrouted
        );
        publisher.publish(pm_due()).await.unwrap();
        let runs = repo.list_runs(&RunQuery::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_ref.as_deref(), Some("PM_DUE:S1:2026-03-01T09"));
        assert_eq!(runs[0].trigger_type, TriggerType::Event);
    }

    #[tokio::test]
    async fn failed_insert_releases_the_marker_for_redelivery() {
        let repo = Arc::new(FlakyRepository::new());
        repo.fail_next("insert_run", 1);
        let (_, publisher) = publisher(
            repo.clone(),
            Arc::new(InMemoryCoordinator::new()),
            DeploymentMode::Production,
        );
        assert!(matches!(
            publisher.ingest(pm_due()).await,
            Err(KernelError::Store(_))
        ));
        assert!(repo.inner().list_runs(&RunQuery::default()).await.unwrap().is_empty());

        assert!(matches!(
            publisher.ingest(pm_due()).await.unwrap(),
            IngestOutcome::Enqueued { .. }
        ));
        assert_eq!(publisher.ingest(pm_due()).await.unwrap(), IngestOutcome::Duplicate);
        assert_eq!(repo.inner().list_runs(&RunQuery::default()).await.unwrap().len(), 1);
    }
}
