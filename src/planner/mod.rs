//! Engine escalation planner.
//!
//! Chooses the first tier from the job's engine mode and the domain's
//! learned statistics, then advances tiers on classifier signals. Every
//! choice carries a bias-reason string that lands in the run's attempt
//! audit.

use crate::classifier::Decision;
use crate::domain_intel::{DomainSnapshot, MIN_SAMPLE};
use crate::job::{EngineMode, Job};
use crate::run::EngineTier;

/// HTTP success rate below which a sampled domain starts at the browser.
const HTTP_GIVE_UP_RATE: f64 = 0.20;

/// Browser success rate above which a sampled domain skips the HTTP probe.
const BROWSER_PREFER_RATE: f64 = 0.85;

/// One planned engine choice with its audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEngine {
    pub tier: EngineTier,
    pub bias_reason: String,
}

/// The effective strategy for a run: the domain-level override wins over
/// the job's engine mode.
#[must_use]
pub fn effective_mode(job: &Job, domain_override: Option<EngineMode>) -> EngineMode {
    domain_override.unwrap_or(job.engine_mode)
}

/// Pick the first tier for a run with no previous attempts.
#[must_use]
pub fn initial_engine(
    job: &Job,
    mode: EngineMode,
    snapshot: &DomainSnapshot,
) -> PlannedEngine {
    if let Some(tier) = EngineTier::from_mode(mode) {
        return PlannedEngine {
            tier,
            bias_reason: format!("explicit engine mode: {}", mode.as_str()),
        };
    }

    if job.requires_auth {
        return PlannedEngine {
            tier: EngineTier::Browser,
            bias_reason: "job requires auth; starting at browser".to_string(),
        };
    }

    if let Some(http) = snapshot.engine(EngineTier::Http) {
        if http.attempts >= MIN_SAMPLE && http.success_rate() < HTTP_GIVE_UP_RATE {
            return PlannedEngine {
                tier: EngineTier::Browser,
                bias_reason: format!(
                    "http success rate {:.0}% over {} attempts; starting at browser",
                    http.success_rate() * 100.0,
                    http.attempts
                ),
            };
        }
    }

    if let Some(browser) = snapshot.engine(EngineTier::Browser) {
        if browser.attempts >= MIN_SAMPLE && browser.success_rate() > BROWSER_PREFER_RATE {
            return PlannedEngine {
                tier: EngineTier::Browser,
                bias_reason: format!(
                    "browser success rate {:.0}% over {} attempts; starting at browser",
                    browser.success_rate() * 100.0,
                    browser.attempts
                ),
            };
        }
    }

    PlannedEngine {
        tier: EngineTier::Http,
        bias_reason: "no adverse history; starting at http".to_string(),
    }
}

/// Advance after a classifier decision. `None` means the run stops at the
/// current tier (attempt cap, pinned mode, or nowhere left to go).
#[must_use]
pub fn next_engine(
    current: EngineTier,
    decision: Decision,
    mode: EngineMode,
    attempts_used: u32,
    max_attempts: u32,
) -> Option<PlannedEngine> {
    if attempts_used >= max_attempts {
        return None;
    }

    // An explicit engine mode never escalates past its pin
    if EngineTier::from_mode(mode).is_some() {
        return None;
    }

    let target = match decision {
        Decision::EscalateToBrowser => EngineTier::Browser,
        Decision::EscalateToProvider => EngineTier::Provider,
        _ => return None,
    };

    if target <= current {
        return None;
    }

    Some(PlannedEngine {
        tier: target,
        bias_reason: format!(
            "escalated from {} on classifier decision {}",
            current.as_str(),
            decision.as_str()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EngineStatsRow;

    fn job(engine_mode: EngineMode, requires_auth: bool) -> Job {
        Job {
            id: "j1".to_string(),
            name: String::new(),
            target_url: "https://example.com".to_string(),
            fields: vec!["title".to_string()],
            requires_auth,
            crawl_mode: crate::job::CrawlMode::Single,
            list_config: None,
            engine_mode,
            browser_profile: None,
        }
    }

    fn snapshot_with(tier: EngineTier, attempts: u32, successes: u32) -> DomainSnapshot {
        let mut snapshot = DomainSnapshot::default();
        snapshot.per_engine.insert(
            tier,
            EngineStatsRow {
                attempts,
                successes,
                ..Default::default()
            },
        );
        snapshot
    }

    #[test]
    fn explicit_mode_is_pinned() {
        let plan = initial_engine(
            &job(EngineMode::Provider, false),
            EngineMode::Provider,
            &DomainSnapshot::default(),
        );
        assert_eq!(plan.tier, EngineTier::Provider);

        // And never escalates
        assert!(next_engine(
            EngineTier::Provider,
            Decision::EscalateToBrowser,
            EngineMode::Provider,
            1,
            3
        )
        .is_none());
    }

    #[test]
    fn auth_jobs_start_at_browser() {
        let plan = initial_engine(
            &job(EngineMode::Auto, true),
            EngineMode::Auto,
            &DomainSnapshot::default(),
        );
        assert_eq!(plan.tier, EngineTier::Browser);
    }

    #[test]
    fn cold_domain_starts_at_http() {
        let plan = initial_engine(
            &job(EngineMode::Auto, false),
            EngineMode::Auto,
            &DomainSnapshot::default(),
        );
        assert_eq!(plan.tier, EngineTier::Http);
    }

    #[test]
    fn poor_http_history_biases_to_browser() {
        let snapshot = snapshot_with(EngineTier::Http, 10, 1);
        let plan = initial_engine(&job(EngineMode::Auto, false), EngineMode::Auto, &snapshot);
        assert_eq!(plan.tier, EngineTier::Browser);
        assert!(plan.bias_reason.contains("http success rate"));
    }

    #[test]
    fn strong_browser_history_biases_to_browser() {
        let snapshot = snapshot_with(EngineTier::Browser, 10, 9);
        let plan = initial_engine(&job(EngineMode::Auto, false), EngineMode::Auto, &snapshot);
        assert_eq!(plan.tier, EngineTier::Browser);
    }

    #[test]
    fn small_samples_never_bias() {
        let snapshot = snapshot_with(EngineTier::Http, 4, 0);
        let plan = initial_engine(&job(EngineMode::Auto, false), EngineMode::Auto, &snapshot);
        assert_eq!(plan.tier, EngineTier::Http);
    }

    #[test]
    fn escalation_walks_up_and_stops_at_cap() {
        let up = next_engine(
            EngineTier::Http,
            Decision::EscalateToBrowser,
            EngineMode::Auto,
            1,
            3,
        )
        .expect("escalation");
        assert_eq!(up.tier, EngineTier::Browser);

        // Attempt cap
        assert!(next_engine(
            EngineTier::Http,
            Decision::EscalateToBrowser,
            EngineMode::Auto,
            3,
            3
        )
        .is_none());

        // No backwards moves
        assert!(next_engine(
            EngineTier::Provider,
            Decision::EscalateToBrowser,
            EngineMode::Auto,
            1,
            3
        )
        .is_none());
    }

    #[test]
    fn non_escalation_decisions_stop_the_loop() {
        assert!(next_engine(
            EngineTier::Http,
            Decision::Proceed,
            EngineMode::Auto,
            1,
            3
        )
        .is_none());
        assert!(next_engine(
            EngineTier::Http,
            Decision::PauseSelectorFix,
            EngineMode::Auto,
            1,
            3
        )
        .is_none());
    }
}
