//! Exception lifecycle: OPEN → ACK → RESOLVED, scoped to the owning manager.

use std::sync::Arc;

use serde_json::json;

use tenantry_kernel::{
    new_id, CallerIdentity, ExceptionQuery, ExceptionRecord, ExceptionStatus, KernelError,
    Notification, Notifier, OpsRepository, SharedClock,
};

use crate::engine::{ExceptionDraft, RecordOrigin};

pub struct ExceptionService {
    repo: Arc<dyn OpsRepository>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
}

impl ExceptionService {
    pub fn new(
        repo: Arc<dyn OpsRepository>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            repo,
            notifier,
            clock,
        }
    }

    pub async fn raise(
        &self,
        origin: RecordOrigin,
        draft: ExceptionDraft,
    ) -> Result<ExceptionRecord, KernelError> {
        if draft.title.trim().is_empty() {
            return Err(KernelError::Validation("exception title is required".into()));
        }
        let now = self.clock.now();
        let record = ExceptionRecord {
            id: new_id("exc"),
            run_id: origin.run_id,
            manager_id: origin.manager_id,
            property_id: origin.property_id,
            severity: draft.severity,
            category: draft.category,
            title: draft.title,
            details: draft.details,
            context: if draft.context.is_null() {
                json!({})
            } else {
                draft.context
            },
            status: ExceptionStatus::Open,
            requires_by: draft
                .requires_by
                .unwrap_or_else(|| now + draft.severity.response_window()),
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.insert_exception(&record).await?;
        tracing::info!(
            exception_id = %record.id,
            manager_id = %record.manager_id,
            severity = record.severity.as_str(),
            category = %record.category,
            "exception_raised"
        );
        self.notify(&record);
        Ok(record)
    }

    fn notify(&self, record: &ExceptionRecord) {
        let notifier = self.notifier.clone();
        let notification = Notification::new(
            record.manager_id.clone(),
            "exception_raised",
            record.title.clone(),
            json!({
                "exception_id": record.id,
                "severity": record.severity,
                "requires_by": record.requires_by,
            }),
        );
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(notification).await {
                tracing::warn!(error = %err, "exception_notification_failed");
            }
        });
    }

    /// Loads a record the caller may see; others are masked as not found.
    async fn visible(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<ExceptionRecord, KernelError> {
        match self.repo.get_exception(id).await? {
            Some(record) if caller.can_access(&record.manager_id) => Ok(record),
            _ => Err(KernelError::not_found("exception", id)),
        }
    }

    pub async fn get(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<ExceptionRecord, KernelError> {
        self.visible(caller, id).await
    }

    pub async fn acknowledge(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<ExceptionRecord, KernelError> {
        let current = self.visible(caller, id).await?;
        if current.status != ExceptionStatus::Open {
            return Err(KernelError::Conflict(format!(
                "exception '{}' is {}, not OPEN",
                id,
                current.status.as_str()
            )));
        }
        let mut next = current.clone();
        next.status = ExceptionStatus::Ack;
        next.updated_at = self.clock.now();
        if !self
            .repo
            .compare_and_swap_exception(ExceptionStatus::Open, &next)
            .await?
        {
            return Err(KernelError::Conflict(format!(
                "exception '{}' changed concurrently",
                id
            )));
        }
        tracing::info!(exception_id = %id, by = %caller.id, "exception_acknowledged");
        Ok(next)
    }

    pub async fn resolve(
        &self,
        caller: &CallerIdentity,
        id: &str,
        note: Option<String>,
    ) -> Result<ExceptionRecord, KernelError> {
        let current = self.visible(caller, id).await?;
        if current.status == ExceptionStatus::Resolved {
            return Err(KernelError::Conflict(format!(
                "exception '{}' is already RESOLVED",
                id
            )));
        }
        let now = self.clock.now();
        let mut next = current.clone();
        next.status = ExceptionStatus::Resolved;
        next.resolved_by = Some(caller.id.clone());
        next.resolved_at = Some(now);
        next.updated_at = now;
        if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
            if let Some(context) = next.context.as_object_mut() {
                context.insert("resolution_note".into(), json!(note));
            }
        }
        if !self
            .repo
            .compare_and_swap_exception(current.status, &next)
            .await?
        {
            return Err(KernelError::Conflict(format!(
                "exception '{}' changed concurrently",
                id
            )));
        }
        tracing::info!(exception_id = %id, by = %caller.id, "exception_resolved");
        Ok(next)
    }

    /// Managers only ever see their own items; admins may filter by manager.
    pub async fn list(
        &self,
        caller: &CallerIdentity,
        mut query: ExceptionQuery,
    ) -> Result<Vec<ExceptionRecord>, KernelError> {
        if !caller.is_admin() {
            query.manager_id = Some(caller.id.clone());
        }
        self.repo.list_exceptions(&query).await
    }
}
