//! Block/failure classifier for engine attempt outcomes.
//!
//! A pure function from observation to decision: no I/O, no randomness,
//! no probabilistic reasoning. Every signal that feeds a decision is
//! recorded on the classification for audit, and the same inputs always
//! produce the same decision.

use std::time::Duration;

use crate::domain_intel::SessionRequirement;
use crate::run::{EngineTier, FailureCode};

/// Body markers that identify an anti-bot interstitial.
const BLOCK_MARKERS: &[&str] = &[
    "checking your browser",
    "just a moment",
    "cf-browser-verification",
    "cf-mitigated",
    "attention required",
    "access denied",
    "verify you are human",
    "ddos protection",
    "px-captcha",
    "datadome",
];

/// Body markers that identify a captcha challenge specifically.
const CAPTCHA_MARKERS: &[&str] = &[
    "captcha",
    "g-recaptcha",
    "h-captcha",
    "cf-turnstile",
];

/// Markers that identify a JS-rendered shell the HTTP tier cannot see
/// through.
const JS_GATE_MARKERS: &[&str] = &[
    "__next_data__",
    "data-reactroot",
    "ng-version",
    "window.__nuxt__",
];

/// A page smaller than this with zero extractions is not treated as a
/// valid page for the selector-fix decision; it is more likely a shell
/// or an interstitial that carried no marker we know.
const MIN_VALID_PAGE_BYTES: usize = 2_048;

/// Classifier decision tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    EscalateToBrowser,
    EscalateToProvider,
    PauseManualAccess,
    PauseLoginRefresh,
    PauseCaptchaSolve,
    PauseSelectorFix,
    PauseFieldConfirm,
    FailNetwork,
    FailUnknown,
}

impl Decision {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::EscalateToBrowser => "escalate_to_browser",
            Self::EscalateToProvider => "escalate_to_provider",
            Self::PauseManualAccess => "pause_manual_access",
            Self::PauseLoginRefresh => "pause_login_refresh",
            Self::PauseCaptchaSolve => "pause_captcha_solve",
            Self::PauseSelectorFix => "pause_selector_fix",
            Self::PauseFieldConfirm => "pause_field_confirm",
            Self::FailNetwork => "fail_network",
            Self::FailUnknown => "fail_unknown",
        }
    }

    #[must_use]
    pub fn is_pause(&self) -> bool {
        matches!(
            self,
            Self::PauseManualAccess
                | Self::PauseLoginRefresh
                | Self::PauseCaptchaSolve
                | Self::PauseSelectorFix
                | Self::PauseFieldConfirm
        )
    }

    #[must_use]
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::EscalateToBrowser | Self::EscalateToProvider)
    }

    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::FailNetwork | Self::FailUnknown)
    }
}

/// Everything the classifier is allowed to look at.
#[derive(Debug)]
pub struct ClassifierInput<'a> {
    pub engine: EngineTier,
    /// HTTP status; None when the fetch never produced a response
    pub status: Option<u16>,
    pub body: Option<&'a str>,
    pub body_size: usize,
    pub duration: Duration,
    /// The bounded wait was exceeded
    pub timed_out: bool,
    /// Hard network-level error (DNS/TLS/connect/reset), post-retry
    pub network_error: Option<&'a str>,
    pub session_present: bool,
    pub requires_session: SessionRequirement,
    /// Whether the provider tier is configured at all
    pub provider_enabled: bool,
    /// Mapped fields on the job
    pub required_fields: usize,
    /// Fields that produced a non-null value
    pub extracted_fields: usize,
    /// Required typed fields under the confidence floor
    pub low_confidence_fields: &'a [String],
}

/// Decision plus the evidence that produced it.
#[derive(Debug, Clone)]
pub struct Classification {
    pub decision: Decision,
    pub reason: String,
    pub signals: Vec<String>,
    /// Failure code the run carries if this attempt turns out to be the
    /// last word (set for failures and for escalations that may exhaust)
    pub failure_code: Option<FailureCode>,
}

/// Classify one engine attempt outcome.
#[must_use]
pub fn classify(input: &ClassifierInput<'_>) -> Classification {
    let mut signals = Vec::new();

    if let Some(err) = input.network_error {
        signals.push(format!("network:{err}"));
        return Classification {
            decision: Decision::FailNetwork,
            reason: format!("hard network error: {err}"),
            signals,
            failure_code: Some(FailureCode::Network),
        };
    }

    if input.timed_out {
        signals.push("timeout".to_string());
        return escalate_or_fail(
            input,
            signals,
            FailureCode::Timeout,
            format!("engine timed out after {:?}", input.duration),
        );
    }

    let body_lower = input.body.map(str::to_lowercase).unwrap_or_default();
    let captcha = matched_markers(&body_lower, CAPTCHA_MARKERS);
    let blocked = matched_markers(&body_lower, BLOCK_MARKERS);
    let js_gate = matched_markers(&body_lower, JS_GATE_MARKERS);

    for m in &captcha {
        signals.push(format!("captcha-marker:{m}"));
    }
    for m in &blocked {
        signals.push(format!("anti-bot:{m}"));
    }

    if let Some(status) = input.status {
        signals.push(format!("status:{status}"));
    }

    if !captcha.is_empty() {
        // Captcha past the provider tier (or with no provider configured)
        // is a human's problem, not an escalation target.
        if input.engine == EngineTier::Provider || !input.provider_enabled {
            return Classification {
                decision: Decision::PauseCaptchaSolve,
                reason: "captcha challenge with no remaining tier".to_string(),
                signals,
                failure_code: Some(FailureCode::Blocked),
            };
        }
        return escalate_or_fail(
            input,
            signals,
            FailureCode::Blocked,
            "captcha challenge detected".to_string(),
        );
    }

    match input.status {
        Some(status @ (401 | 403)) => {
            if input.session_present {
                Classification {
                    decision: Decision::PauseLoginRefresh,
                    reason: format!("status {status} with a session present; session is stale"),
                    signals,
                    failure_code: Some(FailureCode::Blocked),
                }
            } else if input.requires_session == SessionRequirement::Required {
                Classification {
                    decision: Decision::PauseManualAccess,
                    reason: format!(
                        "status {status} on a domain that requires a captured session"
                    ),
                    signals,
                    failure_code: Some(FailureCode::Blocked),
                }
            } else {
                escalate_or_fail(
                    input,
                    signals,
                    FailureCode::Blocked,
                    format!("explicit deny (status {status})"),
                )
            }
        }
        Some(429) => {
            signals.push("rate-limited".to_string());
            escalate_or_fail(
                input,
                signals,
                FailureCode::RateLimited,
                "rate limited (status 429)".to_string(),
            )
        }
        Some(status) if (200..300).contains(&status) => {
            if !blocked.is_empty() {
                return escalate_or_fail(
                    input,
                    signals,
                    FailureCode::Blocked,
                    "anti-bot interstitial served with 2xx".to_string(),
                );
            }
            classify_2xx(input, signals, &body_lower, &js_gate)
        }
        Some(_) if !blocked.is_empty() => escalate_or_fail(
            input,
            signals,
            FailureCode::Blocked,
            "anti-bot interstitial".to_string(),
        ),
        Some(status) => Classification {
            decision: Decision::FailUnknown,
            reason: format!("unexpected response status {status}"),
            signals,
            failure_code: Some(FailureCode::BadResponse),
        },
        None => Classification {
            decision: Decision::FailUnknown,
            reason: "no response and no classified error".to_string(),
            signals,
            failure_code: Some(FailureCode::Unknown),
        },
    }
}

fn classify_2xx(
    input: &ClassifierInput<'_>,
    mut signals: Vec<String>,
    body_lower: &str,
    js_gate: &[&str],
) -> Classification {
    if input.extracted_fields == 0 && input.required_fields > 0 {
        signals.push("selector-miss".to_string());

        if !js_gate.is_empty() {
            for m in js_gate {
                signals.push(format!("js-gate:{m}"));
            }
            return escalate_or_fail(
                input,
                signals,
                FailureCode::Blocked,
                "page appears JS-gated; selectors found nothing".to_string(),
            );
        }

        if robots_noindex(body_lower) {
            signals.push("robots-noindex".to_string());
            return escalate_or_fail(
                input,
                signals,
                FailureCode::Blocked,
                "robots noindex with zero extracted items".to_string(),
            );
        }

        if input.body_size >= MIN_VALID_PAGE_BYTES {
            return Classification {
                decision: Decision::PauseSelectorFix,
                reason: "valid page but the field map extracted nothing".to_string(),
                signals,
                failure_code: None,
            };
        }

        // Tiny 2xx shell with nothing recognizable; a heavier tier may
        // see the real page.
        return escalate_or_fail(
            input,
            signals,
            FailureCode::Unknown,
            "near-empty 2xx response with zero extractions".to_string(),
        );
    }

    if !input.low_confidence_fields.is_empty() {
        for f in input.low_confidence_fields {
            signals.push(format!("low-confidence:{f}"));
        }
        return Classification {
            decision: Decision::PauseFieldConfirm,
            reason: format!(
                "{} required field(s) below the confidence floor",
                input.low_confidence_fields.len()
            ),
            signals,
            failure_code: None,
        };
    }

    Classification {
        decision: Decision::Proceed,
        reason: format!("{} field(s) extracted", input.extracted_fields),
        signals,
        failure_code: None,
    }
}

/// Pick the escalation target for the current tier, or fall back to a
/// terminal failure when no higher tier can run.
fn escalate_or_fail(
    input: &ClassifierInput<'_>,
    signals: Vec<String>,
    code: FailureCode,
    reason: String,
) -> Classification {
    let decision = match input.engine {
        EngineTier::Http => Some(Decision::EscalateToBrowser),
        EngineTier::Browser if input.provider_enabled => Some(Decision::EscalateToProvider),
        EngineTier::Browser | EngineTier::Provider => None,
    };

    match decision {
        Some(decision) => Classification {
            decision,
            reason,
            signals,
            failure_code: Some(code),
        },
        None => Classification {
            decision: if code == FailureCode::Network {
                Decision::FailNetwork
            } else {
                Decision::FailUnknown
            },
            reason: format!("{reason}; no higher tier available"),
            signals,
            failure_code: Some(code),
        },
    }
}

fn matched_markers<'a>(body_lower: &str, markers: &[&'a str]) -> Vec<&'a str> {
    if body_lower.is_empty() {
        return Vec::new();
    }
    markers
        .iter()
        .filter(|m| body_lower.contains(*m))
        .copied()
        .collect()
}

fn robots_noindex(body_lower: &str) -> bool {
    // <meta name="robots" content="noindex"> in any attribute order
    body_lower.contains("noindex")
        && body_lower.contains("robots")
        && body_lower.contains("<meta")
}
