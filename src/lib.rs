//! fieldhand: a self-adaptive web-scraping orchestrator.
//!
//! Declarative jobs in, structured records out. The run execution core
//! selects an extraction engine from learned per-domain statistics,
//! classifies block signals in real time, escalates across tiers with
//! bounded cost (HTTP → stealth browser → commercial fetch provider),
//! reuses trust-scored browser sessions, pauses runs for human
//! intervention when evidence warrants, and records every outcome so the
//! next run is smarter.

pub mod classifier;
pub mod config;
pub mod domain_intel;
pub mod engines;
pub mod events;
pub mod executor;
pub mod extract;
pub mod intervention;
pub mod job;
pub mod planner;
pub mod run;
pub mod session_pool;
pub mod store;
pub mod utils;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use classifier::{Classification, ClassifierInput, Decision};
pub use config::{InterventionTtls, OrchestratorConfig, OrchestratorConfigBuilder};
pub use domain_intel::{AccessClass, DomainIntel, DomainSnapshot, SessionRequirement};
pub use engines::{CapturedSession, EngineMetadata, EngineOutcome, Engines};
pub use events::{EventLevel, EventStream, RunEvent, RunSubscription};
pub use executor::{ExecutionOutcome, RunExecutor};
pub use extract::schema::{FieldMap, FieldMapping, SelectorSpec, TypedFieldKind};
pub use intervention::{InterventionEngine, InterventionType, Resolution};
pub use job::{CrawlMode, EngineMode, Job, ListConfig};
pub use run::{EngineAttempt, EngineTier, FailureCode, Run, RunStatus};
pub use session_pool::{PoolLimits, PoolStats, SessionKey, SessionPool, SessionRecord};
pub use store::Store;
pub use worker::{PolitenessLimiter, Worker};

/// Fully wired orchestrator: every collaborator constructed once and
/// passed explicitly to the executor, lifecycle bounded by the process.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Store,
    events: EventStream,
    intel: Arc<DomainIntel>,
    pool: Arc<SessionPool>,
    intervention: Arc<InterventionEngine>,
    executor: Arc<RunExecutor>,
}

impl Orchestrator {
    /// Open the store and the session vault, seed provider keys, and wire
    /// the execution core together.
    pub async fn init(config: OrchestratorConfig) -> Result<Self> {
        let store = Store::open(config.store_path())
            .await
            .context("failed to open store")?;

        for key in config.provider_api_keys() {
            store
                .seed_api_key(key)
                .await
                .context("failed to seed provider api key")?;
        }

        let events = EventStream::new(store.clone());
        let intel = Arc::new(DomainIntel::new(store.clone()));
        let pool = Arc::new(
            SessionPool::open(
                config.vault_dir(),
                PoolLimits {
                    trust_floor: config.session_trust_floor(),
                    max_uses: config.session_max_uses(),
                    max_age_secs: config.session_max_age_secs(),
                },
            )
            .await
            .context("failed to open session pool")?,
        );
        let engines = Arc::new(
            Engines::new(&config, store.clone()).context("failed to build engines")?,
        );
        let intervention = Arc::new(InterventionEngine::new(
            store.clone(),
            events.clone(),
            config.intervention_ttls().clone(),
            config.proxy_identity().to_string(),
        ));
        let limiter = Arc::new(PolitenessLimiter::new(config.politeness_rate_rps()));

        let executor = Arc::new(RunExecutor::new(
            store.clone(),
            Arc::clone(&intel),
            Arc::clone(&pool),
            engines,
            events.clone(),
            Arc::clone(&intervention),
            limiter,
            config.clone(),
        ));

        Ok(Self {
            config,
            store,
            events,
            intel,
            pool,
            intervention,
            executor,
        })
    }

    /// Register (or update) a job and its field map.
    pub async fn register_job(&self, job: &Job, field_map: &FieldMap) -> Result<()> {
        self.store.insert_job(job).await?;
        self.store.save_field_map(&job.id, field_map).await?;
        Ok(())
    }

    /// `enqueue-run(job-id)`: create a queued run due immediately.
    pub async fn enqueue_run(&self, job_id: &str) -> Result<Run> {
        let job = self
            .store
            .fetch_job(job_id)
            .await?
            .with_context(|| format!("job {job_id} not found"))?;

        let run = self
            .store
            .create_run(
                &job.id,
                job.engine_mode,
                1,
                self.config.max_attempts(),
                crate::utils::now_unix(),
            )
            .await?;
        Ok(run)
    }

    /// `resolve-intervention(task-id, resolution, captured-session?)`.
    pub async fn resolve_intervention(
        &self,
        task_id: &str,
        resolution: &Resolution,
        resolver: &str,
        captured_session: Option<CapturedSession>,
    ) -> Result<bool> {
        Ok(self
            .intervention
            .resolve(task_id, resolution, resolver, captured_session, &self.pool)
            .await?)
    }

    /// A worker loop bound to this orchestrator's executor.
    #[must_use]
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.store.clone(),
            Arc::clone(&self.executor),
            Arc::clone(&self.intervention),
            self.config.worker_concurrency(),
        )
    }

    #[must_use]
    pub fn executor(&self) -> Arc<RunExecutor> {
        Arc::clone(&self.executor)
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn events(&self) -> &EventStream {
        &self.events
    }

    #[must_use]
    pub fn session_pool(&self) -> Arc<SessionPool> {
        Arc::clone(&self.pool)
    }

    #[must_use]
    pub fn domain_intel(&self) -> Arc<DomainIntel> {
        Arc::clone(&self.intel)
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
