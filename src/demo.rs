use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::vitals::PatientVitals;
use crate::{
    AnalysisData, AnalysisSource, ImageId, Prediction, Severity, MOCK_LATENCY_JITTER_MS,
    MOCK_LATENCY_MS, PROBE_CACHE_WINDOW,
};

pub const MOCK_HEATMAP_DATA_URI: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

pub const MOCK_BASE_NARRATIVE: &str =
    "Demo mode: This would show a diagnosis based on X-ray and vitals.";

pub const MOCK_TREATMENTS: [&str; 3] = [
    "Demo mode: Antibiotic therapy example",
    "Demo mode: Follow-up recommendations",
    "Demo mode: Supportive care suggestions",
];

pub const HIGH_FEVER_THRESHOLD_C: f64 = 38.5;
pub const MILD_FEVER_THRESHOLD_C: f64 = 37.5;

/// Build-time stance on demo mode. Forcing it on or off always wins over
/// anything decided at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemoModePolicy {
    ForcedOn,
    ForcedOff,
    #[default]
    Auto,
}

impl DemoModePolicy {
    /// "true" forces demo on, "false" forces it off, anything else
    /// (including unset) leaves the decision to runtime.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("true") => DemoModePolicy::ForcedOn,
            Some("false") => DemoModePolicy::ForcedOff,
            _ => DemoModePolicy::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemoReason {
    ForcedByBuild,
    RuntimeOverride,
    NoApiConfigured,
    BackendUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemoDecision {
    Server,
    Demo(DemoReason),
}

impl DemoDecision {
    pub fn is_demo(&self) -> bool {
        matches!(self, DemoDecision::Demo(_))
    }
}

/// Resolves whether to serve mock results, in strict precedence order:
/// forced-on, forced-off, runtime override, then backend reachability.
/// `last_probe` is the most recent completed probe answer; a backend that
/// has never answered counts as unreachable.
pub fn decide(
    policy: DemoModePolicy,
    override_on: bool,
    api_configured: bool,
    last_probe: Option<bool>,
) -> DemoDecision {
    match policy {
        DemoModePolicy::ForcedOn => DemoDecision::Demo(DemoReason::ForcedByBuild),
        DemoModePolicy::ForcedOff => DemoDecision::Server,
        DemoModePolicy::Auto => {
            if override_on {
                return DemoDecision::Demo(DemoReason::RuntimeOverride);
            }
            if !api_configured {
                return DemoDecision::Demo(DemoReason::NoApiConfigured);
            }
            match last_probe {
                Some(true) => DemoDecision::Server,
                Some(false) | None => DemoDecision::Demo(DemoReason::BackendUnavailable),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub available: bool,
    pub checked_at_ms: u64,
}

/// Cached health-probe state. Only one probe runs at a time; completions
/// from a superseded generation are dropped so a slow old probe cannot
/// overwrite a newer answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendProbe {
    generation: u32,
    in_flight: bool,
    started_at_ms: Option<u64>,
    last_result: Option<ProbeResult>,
}

impl BackendProbe {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Latest completed answer, however old.
    pub fn availability(&self) -> Option<bool> {
        self.last_result.map(|r| r.available)
    }

    pub fn is_fresh(&self, now_ms: u64) -> bool {
        self.last_result.is_some_and(|r| {
            now_ms.saturating_sub(r.checked_at_ms) < PROBE_CACHE_WINDOW.as_millis() as u64
        })
    }

    pub fn should_start(&self, now_ms: u64) -> bool {
        !self.in_flight && !self.is_fresh(now_ms)
    }

    pub fn start(&mut self, now_ms: u64) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.in_flight = true;
        self.started_at_ms = Some(now_ms);
        self.generation
    }

    /// Records a probe answer. Returns false when the answer belongs to a
    /// superseded generation and was dropped.
    pub fn complete(&mut self, generation: u32, available: bool, now_ms: u64) -> bool {
        if generation != self.generation || !self.in_flight {
            return false;
        }
        self.in_flight = false;
        self.last_result = Some(ProbeResult {
            available,
            checked_at_ms: now_ms,
        });
        true
    }
}

pub fn mock_analysis(now_ms: u64) -> AnalysisData {
    AnalysisData {
        image_id: Some(ImageId::generate()),
        predictions: vec![
            Prediction {
                label: "Pneumonia".to_string(),
                probability: 0.89,
            },
            Prediction {
                label: "COVID-19".to_string(),
                probability: 0.45,
            },
            Prediction {
                label: "Normal".to_string(),
                probability: 0.12,
            },
        ],
        top_prediction: Prediction {
            label: "Pneumonia".to_string(),
            probability: 0.89,
        },
        severity: Severity::Moderate,
        heatmap_url: Some(MOCK_HEATMAP_DATA_URI.to_string()),
        narrative: Some(MOCK_BASE_NARRATIVE.to_string()),
        source: AnalysisSource::Demo,
        analyzed_at_ms: now_ms,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VitalsNarrative {
    pub risk_level: Severity,
    pub narrative: String,
    pub treatments: Vec<String>,
}

/// Folds measured vitals into the canned demo diagnosis. Pure: same vitals,
/// same words.
pub fn apply_vitals(vitals: &PatientVitals) -> VitalsNarrative {
    let (risk_level, mut narrative) = match vitals.temperature {
        Some(t) if t > HIGH_FEVER_THRESHOLD_C => (
            Severity::High,
            format!("Demo mode: High fever ({t}\u{b0}C) with pneumonia findings suggests severe infection."),
        ),
        Some(t) if t > MILD_FEVER_THRESHOLD_C => (
            Severity::Moderate,
            format!("Demo mode: Mild fever ({t}\u{b0}C) with pneumonia findings suggests moderate infection."),
        ),
        _ => (
            Severity::Low,
            "Demo mode: Normal temperature with pneumonia findings suggests early or resolving infection."
                .to_string(),
        ),
    };

    if vitals.has_cough == Some(true) {
        narrative.push_str(" Productive cough supports this diagnosis.");
    }

    VitalsNarrative {
        risk_level,
        narrative,
        treatments: MOCK_TREATMENTS.iter().map(|t| t.to_string()).collect(),
    }
}

/// Artificial latency for the demo path so canned results do not come back
/// suspiciously fast.
pub fn mock_latency_ms() -> u64 {
    MOCK_LATENCY_MS + rand::thread_rng().gen_range(0..=MOCK_LATENCY_JITTER_MS)
}
