//! Run executor: one end-to-end attempt cycle per invocation.
//!
//! Claims the run with a compare-and-set lease, consults domain
//! intelligence, resolves a session, walks the planner's tier ladder
//! under the classifier's direction, commits records transactionally,
//! reports every outcome to the learning stores, and emits an event for
//! every decision made along the way.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::classifier::{self, Classification, ClassifierInput, Decision};
use crate::config::OrchestratorConfig;
use crate::domain_intel::{DomainIntel, DomainSnapshot, SessionRequirement};
use crate::engines::{EngineOutcome, Engines};
use crate::events::{messages, EventLevel, EventStream};
use crate::extract::schema::FieldMap;
use crate::intervention::{InterventionEngine, InterventionType};
use crate::job::{CrawlMode, EngineMode, Job};
use crate::planner::{self, PlannedEngine};
use crate::run::{retry_backoff_secs, EngineAttempt, EngineTier, FailureCode, Run, RunStatus};
use crate::session_pool::{SessionKey, SessionPool, SessionRecord};
use crate::store::Store;
use crate::utils::{extract_domain, now_unix};
use crate::worker::PolitenessLimiter;

/// Typed error for executor plumbing failures (the run outcome itself is
/// an [`ExecutionOutcome`], not an error).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("session pool error: {0}")]
    Pool(#[from] crate::session_pool::PoolError),
    #[error("intervention error: {0}")]
    Intervention(#[from] crate::intervention::InterventionError),
    #[error("run {0} not found")]
    RunNotFound(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// How one executor invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { records: usize },
    Failed { code: FailureCode, retry_scheduled: bool },
    Paused { task_id: String },
    /// The lease CAS lost or the run was cancelled mid-flight
    Skipped,
}

/// Everything a single run execution needs, passed in explicitly.
pub struct RunExecutor {
    store: Store,
    intel: Arc<DomainIntel>,
    pool: Arc<SessionPool>,
    engines: Arc<Engines>,
    events: EventStream,
    intervention: Arc<InterventionEngine>,
    limiter: Arc<PolitenessLimiter>,
    config: OrchestratorConfig,
}

impl RunExecutor {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Store,
        intel: Arc<DomainIntel>,
        pool: Arc<SessionPool>,
        engines: Arc<Engines>,
        events: EventStream,
        intervention: Arc<InterventionEngine>,
        limiter: Arc<PolitenessLimiter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            intel,
            pool,
            engines,
            events,
            intervention,
            limiter,
            config,
        }
    }

    /// Execute exactly one attempt cycle for a run.
    pub async fn execute(&self, run_id: &str) -> ExecutorResult<ExecutionOutcome> {
        let Some(run) = self.store.fetch_run(run_id).await? else {
            return Err(ExecutorError::RunNotFound(run_id.to_string()));
        };

        if !matches!(run.status, RunStatus::Queued) {
            debug!(run = run_id, status = run.status.as_str(), "refusing non-queued run");
            return Ok(ExecutionOutcome::Skipped);
        }

        // Non-blocking lease: a duplicate enqueue loses this race cleanly
        if !self.store.claim_run(run_id).await? {
            debug!(run = run_id, "lease CAS lost; another executor owns this run");
            return Ok(ExecutionOutcome::Skipped);
        }

        let run = self
            .store
            .fetch_run(run_id)
            .await?
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;

        self.events
            .emit(
                run_id,
                EventLevel::Info,
                messages::RUN_STARTED,
                json!({"attempt": run.attempt, "job_id": run.job_id}),
            )
            .await?;

        // Load the job and its field map; a run without either fails
        // terminally with unknown.
        let Some(job) = self.store.fetch_job(&run.job_id).await? else {
            return self
                .fail_run(&run, None, FailureCode::Unknown, "job not found", &[])
                .await;
        };
        let field_map = self.store.fetch_field_map(&job.id).await?;

        let domain = match extract_domain(&job.target_url) {
            Ok(domain) => domain,
            Err(e) => {
                return self
                    .fail_run(&run, None, FailureCode::Unknown, &e, &[])
                    .await;
            }
        };

        let snapshot = self.intel.lookup(&domain).await?;

        // Hard-blocked domains short-circuit before any fetch is paid for
        if snapshot.requires_session == SessionRequirement::Required
            && !self
                .pool
                .has_healthy_session(&domain, self.config.proxy_identity())
                .await
        {
            let task = self
                .intervention
                .pause_run(
                    &run,
                    &domain,
                    InterventionType::ManualAccess,
                    "domain requires a captured session and none is pooled",
                    json!({"domain": domain, "access_class": snapshot.access_class.as_str()}),
                )
                .await?;
            return Ok(ExecutionOutcome::Paused { task_id: task.id });
        }

        let session = self
            .pool
            .acquire(&domain, self.config.proxy_identity())
            .await?;
        let session_key = SessionKey::new(domain.clone(), self.config.proxy_identity());

        let mode = planner::effective_mode(&job, self.config.strategy_override(&domain));
        let plan = planner::initial_engine(&job, mode, &snapshot);

        self.attempt_loop(run, job, field_map, domain, snapshot, mode, plan, session, session_key)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        run: Run,
        job: Job,
        field_map: FieldMap,
        domain: String,
        snapshot: DomainSnapshot,
        mode: EngineMode,
        mut plan: PlannedEngine,
        mut session: Option<SessionRecord>,
        session_key: SessionKey,
    ) -> ExecutorResult<ExecutionOutcome> {
        let max_attempts = run.max_attempts.min(self.config.max_attempts().max(1));
        let mut attempts: Vec<EngineAttempt> = run.engine_attempts.clone();
        let mut escalations = 0u32;

        loop {
            let tier = plan.tier;

            if tier == EngineTier::Http {
                self.limiter.wait_for_slot(&domain).await;
            }

            info!(
                run = %run.id,
                engine = tier.as_str(),
                reason = %plan.bias_reason,
                "engine attempt starting"
            );

            let outcome = self
                .engines
                .fetch_and_extract(tier, &job, &field_map, session.as_ref())
                .await;

            let classification = self.classify_outcome(&job, &snapshot, &outcome, session.is_some());
            let had_captcha = classification
                .signals
                .iter()
                .any(|s| s.starts_with("captcha-marker"));

            attempts.push(EngineAttempt {
                engine: tier,
                bias_reason: plan.bias_reason.clone(),
                response_code: outcome.status,
                signals: classification.signals.clone(),
                decision: classification.decision.as_str().to_string(),
                timestamp: chrono::Utc::now(),
                success: classification.decision == Decision::Proceed,
            });
            self.store.update_engine_attempts(&run.id, &attempts).await?;

            self.events
                .emit(
                    &run.id,
                    EventLevel::Info,
                    messages::ENGINE_ATTEMPT,
                    json!({
                        "engine": tier.as_str(),
                        "bias_reason": plan.bias_reason,
                        "status": outcome.status,
                        "signals": classification.signals,
                        "decision": classification.decision.as_str(),
                        "reason": classification.reason,
                        "pages_fetched": outcome.pages_fetched,
                        "duration_ms": outcome.duration.as_millis() as u64,
                    }),
                )
                .await?;

            match classification.decision {
                Decision::Proceed => {
                    return self
                        .commit_success(
                            &run, &domain, tier, &outcome, had_captcha, escalations,
                            session.take(), &session_key, attempts.len() as u32,
                        )
                        .await;
                }
                decision if decision.is_escalation() => {
                    self.record_attempt_outcome(&domain, tier, false, 0, escalations, had_captcha, outcome.status)
                        .await?;

                    if session.is_some() {
                        self.pool.mark_failure(&session_key).await?;
                        session = None;
                    }

                    if !self.run_still_live(&run.id).await? {
                        return Ok(ExecutionOutcome::Skipped);
                    }

                    match planner::next_engine(
                        tier,
                        decision,
                        mode,
                        attempts.len() as u32,
                        max_attempts,
                    ) {
                        Some(next) => {
                            escalations += 1;
                            self.events
                                .emit(
                                    &run.id,
                                    EventLevel::Warn,
                                    messages::ENGINE_ESCALATED,
                                    json!({
                                        "from": tier.as_str(),
                                        "to": next.tier.as_str(),
                                        "reason": classification.reason,
                                    }),
                                )
                                .await?;
                            plan = next;
                        }
                        None => {
                            // Escalation demanded but nowhere to go: the
                            // classifier's code becomes the run's verdict
                            let code =
                                classification.failure_code.unwrap_or(FailureCode::Unknown);
                            return self
                                .fail_run(
                                    &run,
                                    Some(tier),
                                    code,
                                    &format!("{} with no tier left", classification.reason),
                                    &classification.signals,
                                )
                                .await;
                        }
                    }
                }
                decision if decision.is_pause() => {
                    self.record_attempt_outcome(&domain, tier, false, 0, escalations, had_captcha, outcome.status)
                        .await?;
                    self.settle_session_on_pause(decision, &mut session, &session_key)
                        .await?;

                    let task_type = InterventionType::from_decision(decision)
                        .unwrap_or(InterventionType::ManualAccess);
                    let task = self
                        .intervention
                        .pause_run(
                            &run,
                            &domain,
                            task_type,
                            &classification.reason,
                            json!({
                                "signals": classification.signals,
                                "engine": tier.as_str(),
                                "status": outcome.status,
                                "url": job.target_url,
                                "low_confidence_fields": outcome.low_confidence_fields,
                            }),
                        )
                        .await?;
                    return Ok(ExecutionOutcome::Paused { task_id: task.id });
                }
                _ => {
                    self.record_attempt_outcome(&domain, tier, false, 0, escalations, had_captcha, outcome.status)
                        .await?;
                    if session.is_some() {
                        self.pool.mark_failure(&session_key).await?;
                        session = None;
                    }
                    let code = classification.failure_code.unwrap_or(FailureCode::Unknown);
                    return self
                        .fail_run(
                            &run,
                            Some(tier),
                            code,
                            &classification.reason,
                            &classification.signals,
                        )
                        .await;
                }
            }
        }
    }

    fn classify_outcome(
        &self,
        job: &Job,
        snapshot: &DomainSnapshot,
        outcome: &EngineOutcome,
        session_present: bool,
    ) -> Classification {
        // A list crawl truncated to zero items has nothing to extract
        // and that is success, not a selector miss
        let required_fields = match (&job.crawl_mode, &job.list_config) {
            (CrawlMode::List, Some(list)) if list.max_items == 0 => 0,
            _ => outcome.required_fields,
        };

        classifier::classify(&ClassifierInput {
            engine: outcome.engine,
            status: outcome.status,
            body: outcome.body.as_deref(),
            body_size: outcome.body_size,
            duration: outcome.duration,
            timed_out: outcome.timed_out,
            network_error: outcome.network_error.as_deref(),
            session_present,
            requires_session: snapshot.requires_session,
            provider_enabled: self.config.provider_enabled(),
            required_fields,
            extracted_fields: outcome.extracted_fields,
            low_confidence_fields: &outcome.low_confidence_fields,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_success(
        &self,
        run: &Run,
        domain: &str,
        tier: EngineTier,
        outcome: &EngineOutcome,
        had_captcha: bool,
        escalations: u32,
        session: Option<SessionRecord>,
        session_key: &SessionKey,
        attempts_used: u32,
    ) -> ExecutorResult<ExecutionOutcome> {
        // Records land in one transaction; a failure here aborts the
        // attempt as if the engine had failed
        let persisted = match self.store.insert_records(&run.id, &outcome.records).await {
            Ok(count) => count,
            Err(e) => {
                warn!(run = %run.id, "record transaction failed: {e}");
                if session.is_some() {
                    self.pool.mark_failure(session_key).await?;
                }
                return self
                    .fail_run(
                        run,
                        Some(tier),
                        FailureCode::Unknown,
                        &format!("record persistence failed: {e}"),
                        &[],
                    )
                    .await;
            }
        };

        self.events
            .emit(
                &run.id,
                EventLevel::Info,
                messages::RECORDS_PERSISTED,
                json!({"count": persisted, "engine": tier.as_str()}),
            )
            .await?;

        self.record_attempt_outcome(
            domain,
            tier,
            true,
            persisted as u64,
            escalations,
            had_captcha,
            outcome.status,
        )
        .await?;

        // Session bookkeeping: a browser capture on a sessionless run
        // seeds the pool; an existing session gets credit for the win
        if session.is_some() {
            self.pool.mark_success(session_key, had_captcha).await?;
        } else if let Some(captured) = &outcome.captured_session {
            if tier == EngineTier::Browser {
                self.pool
                    .create(
                        domain,
                        self.config.proxy_identity(),
                        captured.cookies.clone(),
                        captured.storage_state.clone(),
                        captured.user_agent.clone(),
                        captured.viewport,
                    )
                    .await?;
                self.events
                    .emit(
                        &run.id,
                        EventLevel::Info,
                        messages::SESSION_CAPTURED,
                        json!({"domain": domain, "source": "extraction"}),
                    )
                    .await?;
            }
        }

        let stats = json!({
            "records": persisted,
            "escalations": escalations,
            "attempts": attempts_used,
            "pages_fetched": outcome.pages_fetched,
            "duration_ms": outcome.duration.as_millis() as u64,
            "engine_used": tier.as_str(),
        });
        let finished = self
            .store
            .finish_run(&run.id, RunStatus::Completed, None, Some(tier), &stats)
            .await?;
        if !finished {
            // Administratively flipped mid-flight; exit without claiming
            // a completion that did not happen
            warn!(run = %run.id, "run no longer running at commit; exiting cleanly");
            return Ok(ExecutionOutcome::Skipped);
        }

        self.events
            .emit(
                &run.id,
                EventLevel::Info,
                messages::RUN_COMPLETED,
                json!({"records": persisted, "engine_used": tier.as_str(), "escalations": escalations}),
            )
            .await?;

        info!(run = %run.id, records = persisted, engine = tier.as_str(), "run completed");
        Ok(ExecutionOutcome::Completed { records: persisted })
    }

    async fn fail_run(
        &self,
        run: &Run,
        tier: Option<EngineTier>,
        code: FailureCode,
        reason: &str,
        signals: &[String],
    ) -> ExecutorResult<ExecutionOutcome> {
        let stats = json!({
            "reason": reason,
            "signals": signals,
        });
        let finished = self
            .store
            .finish_run(&run.id, RunStatus::Failed, Some(code), tier, &stats)
            .await?;
        if !finished {
            warn!(run = %run.id, "run no longer running at failure; exiting cleanly");
            return Ok(ExecutionOutcome::Skipped);
        }

        self.events
            .emit(
                &run.id,
                EventLevel::Error,
                messages::RUN_FAILED,
                json!({"failure_code": code.as_str(), "reason": reason, "signals": signals}),
            )
            .await?;

        let retry_scheduled = if code.is_retryable() && run.attempt < run.max_attempts {
            let delay = retry_backoff_secs(run.attempt);
            // The next run keeps the requested strategy unless this one
            // escalated; then it starts at the tier already reached
            let strategy = match tier {
                Some(tier) if tier != EngineTier::Http => match tier {
                    EngineTier::Browser => EngineMode::Browser,
                    EngineTier::Provider => EngineMode::Provider,
                    EngineTier::Http => EngineMode::Http,
                },
                _ => run.requested_strategy,
            };
            let next = self
                .store
                .create_run(
                    &run.job_id,
                    strategy,
                    run.attempt + 1,
                    run.max_attempts,
                    now_unix() + delay,
                )
                .await?;
            self.events
                .emit(
                    &run.id,
                    EventLevel::Info,
                    messages::RUN_REQUEUED,
                    json!({
                        "next_run_id": next.id,
                        "delay_secs": delay,
                        "strategy": strategy.as_str(),
                    }),
                )
                .await?;
            info!(run = %run.id, next = %next.id, delay, "retry run scheduled");
            true
        } else {
            false
        };

        warn!(run = %run.id, code = code.as_str(), reason, "run failed");
        Ok(ExecutionOutcome::Failed {
            code,
            retry_scheduled,
        })
    }

    /// A login-refresh or captcha pause indicts the session; a
    /// selector-level pause means the session did its job.
    async fn settle_session_on_pause(
        &self,
        decision: Decision,
        session: &mut Option<SessionRecord>,
        session_key: &SessionKey,
    ) -> ExecutorResult<()> {
        if session.take().is_none() {
            return Ok(());
        }
        match decision {
            Decision::PauseLoginRefresh | Decision::PauseCaptchaSolve => {
                self.pool.mark_failure(session_key).await?;
            }
            _ => {
                self.pool.mark_success(session_key, false).await?;
            }
        }
        Ok(())
    }

    async fn record_attempt_outcome(
        &self,
        domain: &str,
        tier: EngineTier,
        success: bool,
        records: u64,
        escalations: u32,
        had_captcha: bool,
        status: Option<u16>,
    ) -> ExecutorResult<()> {
        self.intel
            .record_outcome(domain, tier, success, records, escalations, had_captcha, status)
            .await?;
        Ok(())
    }

    /// Administrative cancellation check between attempts.
    async fn run_still_live(&self, run_id: &str) -> ExecutorResult<bool> {
        let status = self
            .store
            .fetch_run(run_id)
            .await?
            .map(|r| r.status);
        Ok(matches!(status, Some(RunStatus::Running)))
    }
}
