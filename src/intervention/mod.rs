//! Intervention engine: pause runs for humans instead of failing them.
//!
//! When the classifier decides evidence warrants a human (captured
//! session needed, stale login, captcha past the last tier, broken
//! selectors), the run moves to waiting-for-human and a persisted task
//! describes what to do. Resolving the task re-enqueues the run;
//! expiring it keeps the run paused. Pause is an outcome, not an error.

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classifier::Decision;
use crate::config::InterventionTtls;
use crate::engines::CapturedSession;
use crate::events::{messages, EventLevel, EventStream};
use crate::run::Run;
use crate::session_pool::SessionPool;
use crate::store::{InterventionTaskRow, Store, StoreError};
use crate::utils::now_unix;

/// Cap on pending tasks per job before dedup kicks in.
const MAX_PENDING_PER_JOB: i64 = 5;

/// Cap on pending tasks per domain before dedup kicks in.
const MAX_PENDING_PER_DOMAIN: i64 = 20;

/// Typed error at the intervention seam.
#[derive(Debug, thiserror::Error)]
pub enum InterventionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("session pool error: {0}")]
    Pool(#[from] crate::session_pool::PoolError),
    #[error("task {0} not found")]
    TaskNotFound(String),
}

pub type InterventionResult<T> = Result<T, InterventionError>;

/// What a human must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterventionType {
    ManualAccess,
    LoginRefresh,
    CaptchaSolve,
    SelectorFix,
    FieldConfirm,
}

impl InterventionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualAccess => "manual_access",
            Self::LoginRefresh => "login_refresh",
            Self::CaptchaSolve => "captcha_solve",
            Self::SelectorFix => "selector_fix",
            Self::FieldConfirm => "field_confirm",
        }
    }

    /// The pause decision that produces this task type, if any.
    #[must_use]
    pub fn from_decision(decision: Decision) -> Option<Self> {
        match decision {
            Decision::PauseManualAccess => Some(Self::ManualAccess),
            Decision::PauseLoginRefresh => Some(Self::LoginRefresh),
            Decision::PauseCaptchaSolve => Some(Self::CaptchaSolve),
            Decision::PauseSelectorFix => Some(Self::SelectorFix),
            Decision::PauseFieldConfirm => Some(Self::FieldConfirm),
            _ => None,
        }
    }

    /// Advisory TTL before a pending task expires.
    #[must_use]
    pub fn ttl_secs(&self, ttls: &InterventionTtls) -> i64 {
        match self {
            Self::ManualAccess => ttls.manual_access_secs,
            Self::LoginRefresh => ttls.login_refresh_secs,
            Self::CaptchaSolve => ttls.captcha_solve_secs,
            Self::SelectorFix => ttls.selector_fix_secs,
            Self::FieldConfirm => ttls.field_confirm_secs,
        }
    }

    /// Higher numbers surface first in the human queue.
    #[must_use]
    pub fn priority(&self) -> i64 {
        match self {
            Self::ManualAccess => 30,
            Self::LoginRefresh => 25,
            Self::CaptchaSolve => 20,
            Self::SelectorFix => 10,
            Self::FieldConfirm => 5,
        }
    }
}

/// Structured resolution payload accepted from the surrounding API layer.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    #[serde(default)]
    pub note: Option<String>,
    /// Arbitrary structured context from the resolver
    #[serde(default)]
    pub data: serde_json::Value,
}

pub struct InterventionEngine {
    store: Store,
    events: EventStream,
    ttls: InterventionTtls,
    proxy_identity: String,
}

impl InterventionEngine {
    #[must_use]
    pub fn new(
        store: Store,
        events: EventStream,
        ttls: InterventionTtls,
        proxy_identity: String,
    ) -> Self {
        Self {
            store,
            events,
            ttls,
            proxy_identity,
        }
    }

    /// Pause a run: flip it to waiting-for-human, persist a task, emit an
    /// event. Idempotent on run id; throttled per job and per domain with
    /// dedup on (type, trigger-reason).
    pub async fn pause_run(
        &self,
        run: &Run,
        domain: &str,
        task_type: InterventionType,
        trigger_reason: &str,
        payload: serde_json::Value,
    ) -> InterventionResult<InterventionTaskRow> {
        // Idempotency: a pending task for this run means the pause
        // already happened
        if let Some(existing) = self.store.pending_task_for_run(&run.id).await? {
            self.store.pause_run_row(&run.id).await?;
            return Ok(existing);
        }

        let throttled = self.store.pending_task_count_for_job(&run.job_id).await?
            >= MAX_PENDING_PER_JOB
            || self.store.pending_task_count_for_domain(domain).await? >= MAX_PENDING_PER_DOMAIN;

        if throttled {
            if let Some(duplicate) = self
                .store
                .pending_duplicate_task(&run.job_id, task_type.as_str(), trigger_reason)
                .await?
            {
                // Append evidence instead of minting another task
                let mut merged = duplicate.payload.clone();
                let evidence = merged
                    .as_object_mut()
                    .map(|o| o.entry("evidence").or_insert_with(|| json!([])));
                if let Some(serde_json::Value::Array(items)) = evidence {
                    items.push(json!({
                        "run_id": run.id,
                        "observed_at": now_unix(),
                        "payload": payload,
                    }));
                }
                self.store
                    .update_task_payload(&duplicate.id, &merged)
                    .await?;
                self.store.pause_run_row(&run.id).await?;
                info!(task = %duplicate.id, run = %run.id, "evidence appended to pending task");
                return Ok(duplicate);
            }
            warn!(
                job = %run.job_id,
                domain,
                "pending-task throttle exceeded with no duplicate; creating anyway"
            );
        }

        let paused = self.store.pause_run_row(&run.id).await?;
        if !paused {
            // Run was not running; a queued/terminal run cannot pause.
            // Re-check idempotency before giving up.
            if let Some(existing) = self.store.pending_task_for_run(&run.id).await? {
                return Ok(existing);
            }
        }

        let task_id = Uuid::new_v4().to_string();
        let expires_at = now_unix() + task_type.ttl_secs(&self.ttls);
        self.store
            .insert_intervention_task(
                &task_id,
                &run.job_id,
                Some(&run.id),
                domain,
                task_type.as_str(),
                trigger_reason,
                &payload,
                task_type.priority(),
                Some(expires_at),
            )
            .await?;

        self.events
            .emit(
                &run.id,
                EventLevel::Warn,
                messages::INTERVENTION_CREATED,
                json!({
                    "task_id": task_id,
                    "type": task_type.as_str(),
                    "reason": trigger_reason,
                    "domain": domain,
                    "expires_at": expires_at,
                }),
            )
            .await?;

        let task = self
            .store
            .fetch_intervention_task(&task_id)
            .await?
            .ok_or_else(|| InterventionError::TaskNotFound(task_id))?;

        info!(task = %task.id, run = %run.id, kind = task_type.as_str(), "run paused for intervention");
        Ok(task)
    }

    /// Resolve a task. Registers captured session material with the pool
    /// under the task's domain, flips the task to resolved, and moves the
    /// run back to queued. Idempotent: resolving a resolved task returns
    /// false and re-enqueues nothing.
    pub async fn resolve(
        &self,
        task_id: &str,
        resolution: &Resolution,
        resolver: &str,
        captured_session: Option<CapturedSession>,
        pool: &SessionPool,
    ) -> InterventionResult<bool> {
        let task = self
            .store
            .fetch_intervention_task(task_id)
            .await?
            .ok_or_else(|| InterventionError::TaskNotFound(task_id.to_string()))?;

        let resolution_value = serde_json::to_value(resolution).map_err(StoreError::from)?;
        let flipped = self
            .store
            .resolve_task_row(task_id, &resolution_value, resolver)
            .await?;
        if !flipped {
            return Ok(false);
        }

        if let Some(captured) = captured_session {
            pool.create(
                &task.domain,
                &self.proxy_identity,
                captured.cookies,
                captured.storage_state,
                captured.user_agent,
                captured.viewport,
            )
            .await?;
            if let Some(run_id) = &task.run_id {
                self.events
                    .emit(
                        run_id,
                        EventLevel::Info,
                        messages::SESSION_CAPTURED,
                        json!({"domain": task.domain, "source": "intervention"}),
                    )
                    .await?;
            }
        }

        if let Some(run_id) = &task.run_id {
            let requeued = self.store.requeue_run(run_id, now_unix()).await?;
            self.events
                .emit(
                    run_id,
                    EventLevel::Info,
                    messages::INTERVENTION_RESOLVED,
                    json!({
                        "task_id": task_id,
                        "resolver": resolver,
                        "requeued": requeued,
                    }),
                )
                .await?;
            if requeued {
                info!(task = task_id, run = %run_id, "intervention resolved; run re-enqueued");
            }
        }

        Ok(true)
    }

    /// Cancel a task. The run stays paused until manually resumed or
    /// administratively failed.
    pub async fn cancel(&self, task_id: &str) -> InterventionResult<bool> {
        let task = self
            .store
            .fetch_intervention_task(task_id)
            .await?
            .ok_or_else(|| InterventionError::TaskNotFound(task_id.to_string()))?;

        let flipped = self.store.cancel_task_row(task_id).await?;
        if flipped {
            if let Some(run_id) = &task.run_id {
                self.events
                    .emit(
                        run_id,
                        EventLevel::Warn,
                        messages::INTERVENTION_CANCELLED,
                        json!({"task_id": task_id}),
                    )
                    .await?;
            }
        }
        Ok(flipped)
    }

    /// Advisory expiry sweep: pending → expired for overdue tasks. Runs
    /// stay paused; nothing fails silently.
    pub async fn expire_overdue(&self) -> InterventionResult<usize> {
        let expired = self.store.expire_overdue_tasks(now_unix()).await?;
        for task in &expired {
            if let Some(run_id) = &task.run_id {
                self.events
                    .emit(
                        run_id,
                        EventLevel::Warn,
                        messages::INTERVENTION_EXPIRED,
                        json!({
                            "task_id": task.id,
                            "type": task.task_type,
                            "run_stays_paused": true,
                        }),
                    )
                    .await?;
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "intervention tasks expired");
        }
        Ok(expired.len())
    }
}
