//! Session trust scoring.
//!
//! Trust is always computed on demand from session metadata and never
//! stored. The additive model starts at 100 and applies:
//! - −0.5 per minute of age beyond 60 minutes
//! - −15 per consecutive failure
//! - +20 when the last success is within 5 minutes
//! - −1 per use beyond 50, capped at −30 (the 200-use hard cap owns
//!   end-of-life; the score only nudges selection before that)
//! clamped to [0, 100].
//!
//! Hard retirement is enforced independently of the score, so reweighting
//! this formula cannot leak a session past the retirement invariants.

/// Inputs to the trust computation, all derived from session metadata.
#[derive(Debug, Clone, Copy)]
pub struct TrustInputs {
    pub age_secs: i64,
    pub consecutive_failures: u32,
    /// Seconds since the most recent success, if any
    pub secs_since_success: Option<i64>,
    pub total_uses: u32,
}

const BASE: f64 = 100.0;
const AGE_GRACE_MINUTES: f64 = 60.0;
const AGE_PENALTY_PER_MINUTE: f64 = 0.5;
const FAILURE_PENALTY: f64 = 15.0;
const RECENT_SUCCESS_BONUS: f64 = 20.0;
const RECENT_SUCCESS_WINDOW_SECS: i64 = 300;
const USE_GRACE: f64 = 50.0;
const USE_PENALTY_PER_USE: f64 = 1.0;
const USE_PENALTY_CAP: f64 = 30.0;

/// Compute the trust score for a session.
#[must_use]
pub fn compute(inputs: &TrustInputs) -> f64 {
    let mut trust = BASE;

    let age_minutes = inputs.age_secs.max(0) as f64 / 60.0;
    if age_minutes > AGE_GRACE_MINUTES {
        trust -= AGE_PENALTY_PER_MINUTE * (age_minutes - AGE_GRACE_MINUTES);
    }

    trust -= FAILURE_PENALTY * f64::from(inputs.consecutive_failures);

    if inputs
        .secs_since_success
        .is_some_and(|s| s >= 0 && s <= RECENT_SUCCESS_WINDOW_SECS)
    {
        trust += RECENT_SUCCESS_BONUS;
    }

    let uses = f64::from(inputs.total_uses);
    if uses > USE_GRACE {
        trust -= (USE_PENALTY_PER_USE * (uses - USE_GRACE)).min(USE_PENALTY_CAP);
    }

    trust.clamp(0.0, 100.0)
}
