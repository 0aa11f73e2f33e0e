// lib.rs - Shared application core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod api;
pub mod capabilities;
pub mod demo;
pub mod session;
pub mod vitals;

use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::capabilities::{HttpError, HttpResult, StorageError, StorageResult, ValidatedUrl};
use crate::demo::{BackendProbe, DemoModePolicy, DemoReason};
use crate::session::{AuthTokens, ImageBlob, SessionError, UserProfile};
use crate::vitals::{PatientVitals, VitalsError};

pub use api::ApiError;
pub use app::App;
pub use capabilities::{Capabilities, Effect};

/// Access tokens are minted for 60 minutes; refresh proactively a little
/// before that so a request never goes out with a token about to lapse.
pub const TOKEN_REFRESH_AGE: Duration = Duration::from_secs(55 * 60);

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const PROBE_CACHE_WINDOW: Duration = Duration::from_secs(30);
pub const PROBE_WAIT_BOUND: Duration = Duration::from_secs(5);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const ANALYZE_TIMEOUT: Duration = Duration::from_secs(10);

pub const MOCK_LATENCY_MS: u64 = 1_500;
pub const MOCK_LATENCY_JITTER_MS: u64 = 500;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Margin added to a toast's lifetime before the expiry check fires, so the
/// check always lands after the deadline rather than racing it.
pub const TOAST_EXPIRY_SLACK_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Validation,
    NotFound,
    Server,
    Storage,
    Serialization,
    ImageTooLarge,
    ImageFormatUnsupported,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Server => "SERVER_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::ImageFormatUnsupported => "IMAGE_FORMAT_UNSUPPORTED",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Server | Self::Storage => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::Internal => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Validation
            | Self::NotFound
            | Self::ImageTooLarge
            | Self::ImageFormatUnsupported
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Server | Self::Storage
        )
    }

    #[must_use]
    pub const fn http_status_hint(self) -> Option<u16> {
        match self {
            Self::Authentication => Some(401),
            Self::NotFound => Some(404),
            Self::Validation => Some(400),
            Self::Server | Self::Internal => Some(500),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            retry_after_ms: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => {
                if self.message.is_empty() {
                    "Your session has expired. Please sign in again.".into()
                } else {
                    self.message.clone()
                }
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested resource could not be found.".into(),
            ErrorKind::Server => {
                "The server ran into a problem. Please try again shortly.".into()
            }
            ErrorKind::Storage => "Unable to save data on this device.".into(),
            ErrorKind::Serialization => "A data error occurred. Please try again.".into(),
            ErrorKind::ImageTooLarge => {
                format!(
                    "The image is too large. Please use an image smaller than {} MB.",
                    MAX_IMAGE_BYTES / 1_000_000
                )
            }
            ErrorKind::ImageFormatUnsupported => {
                "This image format is not supported. Please use a JPEG or PNG X-ray image.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again.".into()
            }
        }
    }

    /// Builds an error from a rejected HTTP exchange, mining the response
    /// body for a server-provided detail message when one is present.
    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 => ErrorKind::Validation,
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(api::extract_error_message)
            .unwrap_or_else(|| match status {
                401 => "Invalid credentials".to_string(),
                _ => format!("HTTP error: {status}"),
            });

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let kind = match &e {
            HttpError::Dns { .. } | HttpError::Connection { .. } | HttpError::Tls { .. } => {
                ErrorKind::Network
            }
            HttpError::Timeout { .. } | HttpError::Cancelled { .. } => ErrorKind::Timeout,
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::TooManyHeaders { .. }
            | HttpError::BodyTooLarge { .. }
            | HttpError::InvalidRequest { .. } => ErrorKind::Validation,
            HttpError::ResponseTooLarge { .. } | HttpError::InvalidResponse { .. } => {
                ErrorKind::Server
            }
            HttpError::Serialization { .. } => ErrorKind::Serialization,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        Self::new(ErrorKind::Storage, e.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Storage(inner) => inner.into(),
            other => Self::new(ErrorKind::Serialization, other.to_string()),
        }
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        let message = e.to_string();
        match e {
            ApiError::InvalidImage { .. } => Self::new(ErrorKind::Validation, message),
            ApiError::UnsupportedImageFormat => {
                Self::new(ErrorKind::ImageFormatUnsupported, message)
            }
            ApiError::ImageTooLarge { .. } => Self::new(ErrorKind::ImageTooLarge, message),
            ApiError::MalformedResponse { .. } => Self::new(ErrorKind::Serialization, message),
            ApiError::Http(inner) => inner.into(),
        }
    }
}

impl From<VitalsError> for AppError {
    fn from(e: VitalsError) -> Self {
        Self::new(ErrorKind::Validation, e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calendar date for a wall-clock timestamp, used when an assessment needs
/// an age in whole years.
#[must_use]
pub fn today_from_ms(now_ms: u64) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(now_ms as i64)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Server-assigned identifier of an uploaded scan. Demo results mint their
/// own so downstream code never has to special-case the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Moderate,
    High,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Moderate => "Moderate",
            Self::High => "High",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Server,
    Demo,
}

/// Confidence values leave this module only inside [0, 1]; anything
/// non-finite collapses to zero rather than poisoning comparisons.
#[must_use]
pub fn clamp_probability(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Maximum-confidence prediction, ties broken by first-seen order.
#[must_use]
pub fn top_prediction(predictions: &[Prediction]) -> Option<&Prediction> {
    let mut best: Option<&Prediction> = None;
    for candidate in predictions {
        match best {
            Some(current) if candidate.probability > current.probability => {
                best = Some(candidate);
            }
            None => best = Some(candidate),
            _ => {}
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisData {
    pub image_id: Option<ImageId>,
    pub predictions: Vec<Prediction>,
    pub top_prediction: Prediction,
    pub severity: Severity,
    pub heatmap_url: Option<String>,
    pub narrative: Option<String>,
    pub source: AnalysisSource,
    pub analyzed_at_ms: u64,
}

impl AnalysisData {
    /// Normalizes raw predictions into a result ordered by descending
    /// confidence, with the top prediction recomputed locally. Equal
    /// confidences keep their arrival order. Returns `None` when there is
    /// nothing to rank.
    #[must_use]
    pub fn from_predictions(
        image_id: Option<ImageId>,
        predictions: Vec<Prediction>,
        severity: Severity,
        heatmap_url: Option<String>,
        narrative: Option<String>,
        source: AnalysisSource,
        now_ms: u64,
    ) -> Option<Self> {
        let mut predictions: Vec<Prediction> = predictions
            .into_iter()
            .map(|p| Prediction {
                label: p.label,
                probability: clamp_probability(p.probability),
            })
            .collect();
        predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        let top = top_prediction(&predictions)?.clone();

        Some(Self {
            image_id,
            predictions,
            top_prediction: top,
            severity,
            heatmap_url,
            narrative,
            source,
            analyzed_at_ms: now_ms,
        })
    }

    #[must_use]
    pub fn indicates_pneumonia(&self) -> bool {
        self.top_prediction.label.eq_ignore_ascii_case("pneumonia")
            && self.top_prediction.probability >= 0.5
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLikelihood {
    pub condition: String,
    pub percent: f64,
}

/// The complete outcome of one analysis run: the scan-level result plus
/// everything derived from the submitted vitals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDiagnosis {
    pub analysis: AnalysisData,
    pub vitals: PatientVitals,
    pub risk_level: Severity,
    pub narrative: String,
    pub treatments: Vec<String>,
    pub condition_likelihoods: Vec<ConditionLikelihood>,
    pub finalized_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastMessage {
    pub message: String,
    pub kind: ToastKind,
    pub created_at_ms: u64,
    pub duration_ms: u64,
}

impl ToastMessage {
    #[must_use]
    pub fn new(message: impl Into<String>, kind: ToastKind) -> Self {
        Self {
            message: message.into(),
            kind,
            created_at_ms: get_current_time_ms(),
            duration_ms: kind.default_duration_ms(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    Starting,
    Unauthenticated,
    Authenticating,
    Ready,
    Analyzing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    CheckingBackend,
    RefreshingToken,
    Uploading,
    AssessingVitals,
    MockLatency,
}

impl AnalysisPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CheckingBackend => "checking_backend",
            Self::RefreshingToken => "refreshing_token",
            Self::Uploading => "uploading",
            Self::AssessingVitals => "assessing_vitals",
            Self::MockLatency => "mock_latency",
        }
    }
}

/// One analysis request in flight. The image stays unvalidated until a
/// server submission actually needs it; the mock path never reads it.
#[derive(Debug, Clone)]
pub struct ActiveAnalysis {
    pub image: Option<ImageBlob>,
    pub image_error: Option<AppError>,
    pub vitals: PatientVitals,
    pub phase: AnalysisPhase,
    pub demo_reason: Option<DemoReason>,
    pub base: Option<Box<AnalysisData>>,
    pub started_at_ms: u64,
}

impl ActiveAnalysis {
    #[must_use]
    pub fn new(
        image: Option<ImageBlob>,
        image_error: Option<AppError>,
        vitals: PatientVitals,
        now_ms: u64,
    ) -> Self {
        Self {
            image,
            image_error,
            vitals,
            phase: AnalysisPhase::CheckingBackend,
            demo_reason: None,
            base: None,
            started_at_ms: now_ms,
        }
    }

    #[must_use]
    pub fn is_demo(&self) -> bool {
        self.demo_reason.is_some()
    }
}

/// In-memory session credentials. Wrapped so a stray debug log of the model
/// never prints a bearer token; persistence goes through [`AuthTokens`].
#[derive(Clone)]
pub struct SessionTokens {
    access: SecretString,
    refresh: SecretString,
}

impl SessionTokens {
    #[must_use]
    pub fn from_stored(tokens: &AuthTokens) -> Self {
        Self {
            access: SecretString::new(tokens.access.clone()),
            refresh: SecretString::new(tokens.refresh.clone()),
        }
    }

    #[must_use]
    pub fn access(&self) -> &str {
        self.access.expose_secret()
    }

    #[must_use]
    pub fn refresh(&self) -> &str {
        self.refresh.expose_secret()
    }

    #[must_use]
    pub fn is_demo(&self) -> bool {
        self.access() == session::DEMO_ACCESS_TOKEN
    }

    #[must_use]
    pub fn can_refresh(&self) -> bool {
        !self.refresh().is_empty() && !self.is_demo()
    }

    #[must_use]
    pub fn to_stored(&self) -> AuthTokens {
        AuthTokens {
            access: self.access().to_string(),
            refresh: self.refresh().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub api_url: Option<ValidatedUrl>,
    pub demo_policy: DemoModePolicy,
}

impl AppConfig {
    /// Builds the runtime configuration from raw build-environment strings.
    /// An empty or unparsable URL means "no remote API configured", which
    /// downstream resolves to demo mode rather than an error.
    #[must_use]
    pub fn from_env_strings(api_url: Option<&str>, demo_flag: Option<&str>) -> Self {
        let api_url = api_url
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| match ValidatedUrl::new(raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring invalid API URL from environment");
                    None
                }
            });

        Self {
            api_url,
            demo_policy: DemoModePolicy::from_env_value(demo_flag),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env_strings(Some(api::DEFAULT_API_URL), None)
    }
}

pub struct Model {
    pub state: AppState,
    pub config: AppConfig,
    pub tokens: Option<SessionTokens>,
    pub user: Option<UserProfile>,
    pub force_demo: bool,
    pub probe: BackendProbe,
    pub analysis: Option<ActiveAnalysis>,
    pub last_result: Option<Box<FinalDiagnosis>>,
    pub refresh_in_flight: bool,
    pub latency_generation: u32,
    pub toast_seq: u32,
    pub armed_toast_seq: u32,
    pub active_error: Option<AppError>,
    pub active_toast: Option<ToastMessage>,
    pub view_timestamp_ms: u64,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            state: AppState::Starting,
            config: AppConfig::default(),
            tokens: None,
            user: None,
            force_demo: false,
            probe: BackendProbe::default(),
            analysis: None,
            last_result: None,
            refresh_in_flight: false,
            latency_generation: 0,
            toast_seq: 0,
            armed_toast_seq: 0,
            active_error: None,
            active_toast: None,
            view_timestamp_ms: get_current_time_ms(),
        }
    }
}

impl Model {
    pub fn update_timestamp(&mut self) {
        self.view_timestamp_ms = get_current_time_ms();
    }

    pub fn set_error(&mut self, error: AppError) {
        self.active_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.active_error = None;
    }

    pub fn show_toast(&mut self, message: impl Into<String>, kind: ToastKind) {
        self.toast_seq = self.toast_seq.wrapping_add(1);
        self.active_toast = Some(ToastMessage::new(message, kind));
    }

    pub fn clear_toast(&mut self) {
        self.active_toast = None;
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    #[must_use]
    pub fn session_is_demo(&self) -> bool {
        self.tokens.as_ref().is_some_and(SessionTokens::is_demo)
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(SessionTokens::access)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    // Lifecycle
    AppStarted,
    ConfigLoaded {
        api_url: Option<String>,
        demo_flag: Option<String>,
    },
    SessionRestored(Box<StorageResult>),
    ExternalStorageChanged,

    // Authentication
    LoginRequested {
        username: String,
        password: String,
    },
    SignupRequested {
        username: String,
        email: String,
        password: String,
        first_name: Option<String>,
        last_name: Option<String>,
    },
    DemoLoginRequested,
    LoginResponse(Box<HttpResult>),
    SignupResponse(Box<HttpResult>),
    ProfileResponse(Box<HttpResult>),
    RefreshResponse(Box<HttpResult>),
    LogoutRequested,
    SessionPersisted(Box<StorageResult>),
    SessionCleared(Box<StorageResult>),

    // Demo mode and backend availability
    ForceDemoChanged {
        enabled: bool,
    },
    ForceDemoPersisted(Box<StorageResult>),
    BackendProbeRequested,
    ProbeResponse {
        generation: u32,
        result: Box<HttpResult>,
    },
    ProbeWaitElapsed {
        generation: u32,
    },

    // Analysis
    AnalyzeRequested {
        image_bytes: Vec<u8>,
        vitals: Box<PatientVitals>,
    },
    MockLatencyElapsed {
        generation: u32,
    },
    UploadResponse(Box<HttpResult>),
    VitalsResponse(Box<HttpResult>),
    HandoffStored(Box<StorageResult>),

    // Results
    ResultsOpened,
    HandoffLoaded(Box<StorageResult>),

    // Surface chrome
    DismissError,
    DismissToast,
    ToastExpiryCheck {
        generation: u32,
    },
    Noop,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppStarted => "app_started",
            Self::ConfigLoaded { .. } => "config_loaded",
            Self::SessionRestored(_) => "session_restored",
            Self::ExternalStorageChanged => "external_storage_changed",
            Self::LoginRequested { .. } => "login_requested",
            Self::SignupRequested { .. } => "signup_requested",
            Self::DemoLoginRequested => "demo_login_requested",
            Self::LoginResponse(_) => "login_response",
            Self::SignupResponse(_) => "signup_response",
            Self::ProfileResponse(_) => "profile_response",
            Self::RefreshResponse(_) => "refresh_response",
            Self::LogoutRequested => "logout_requested",
            Self::SessionPersisted(_) => "session_persisted",
            Self::SessionCleared(_) => "session_cleared",
            Self::ForceDemoChanged { .. } => "force_demo_changed",
            Self::ForceDemoPersisted(_) => "force_demo_persisted",
            Self::BackendProbeRequested => "backend_probe_requested",
            Self::ProbeResponse { .. } => "probe_response",
            Self::ProbeWaitElapsed { .. } => "probe_wait_elapsed",
            Self::AnalyzeRequested { .. } => "analyze_requested",
            Self::MockLatencyElapsed { .. } => "mock_latency_elapsed",
            Self::UploadResponse(_) => "upload_response",
            Self::VitalsResponse(_) => "vitals_response",
            Self::HandoffStored(_) => "handoff_stored",
            Self::ResultsOpened => "results_opened",
            Self::HandoffLoaded(_) => "handoff_loaded",
            Self::DismissError => "dismiss_error",
            Self::DismissToast => "dismiss_toast",
            Self::ToastExpiryCheck { .. } => "toast_expiry_check",
            Self::Noop => "noop",
        }
    }

    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Self::LoginRequested { .. }
                | Self::SignupRequested { .. }
                | Self::DemoLoginRequested
                | Self::LogoutRequested
                | Self::ForceDemoChanged { .. }
                | Self::BackendProbeRequested
                | Self::AnalyzeRequested { .. }
                | Self::ResultsOpened
                | Self::DismissError
                | Self::DismissToast
        )
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::Noop
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PredictionView {
    pub label: String,
    pub percent: f64,
}

impl From<&Prediction> for PredictionView {
    fn from(p: &Prediction) -> Self {
        Self {
            label: p.label.clone(),
            percent: display_percent(p.probability),
        }
    }
}

/// Probability as a display percentage with one decimal place.
#[must_use]
pub fn display_percent(probability: f64) -> f64 {
    (probability * 1000.0).round() / 10.0
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiagnosisView {
    pub top_label: String,
    pub top_percent: f64,
    pub severity: String,
    pub risk_level: String,
    pub narrative: String,
    pub treatments: Vec<String>,
    pub predictions: Vec<PredictionView>,
    pub condition_likelihoods: Vec<ConditionLikelihood>,
    pub heatmap_url: Option<String>,
    pub notes: Option<String>,
    pub is_demo: bool,
    pub analyzed_at_ms: u64,
}

impl From<&FinalDiagnosis> for DiagnosisView {
    fn from(d: &FinalDiagnosis) -> Self {
        Self {
            top_label: d.analysis.top_prediction.label.clone(),
            top_percent: display_percent(d.analysis.top_prediction.probability),
            severity: d.analysis.severity.as_str().to_string(),
            risk_level: d.risk_level.as_str().to_string(),
            narrative: d.narrative.clone(),
            treatments: d.treatments.clone(),
            predictions: d.analysis.predictions.iter().map(PredictionView::from).collect(),
            condition_likelihoods: d.condition_likelihoods.clone(),
            heatmap_url: d.analysis.heatmap_url.clone(),
            notes: d.vitals.notes.clone(),
            is_demo: d.analysis.source == AnalysisSource::Demo,
            analyzed_at_ms: d.analysis.analyzed_at_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewState {
    Starting,
    Unauthenticated,
    Authenticating,
    Ready {
        username: Option<String>,
        demo_active: bool,
        force_demo: bool,
        backend_available: Option<bool>,
        result: Option<DiagnosisView>,
    },
    Analyzing {
        phase: String,
        is_demo: bool,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToastView {
    pub message: String,
    pub kind: ToastKind,
    pub duration_ms: u64,
}

impl From<&ToastMessage> for ToastView {
    fn from(t: &ToastMessage) -> Self {
        Self {
            message: t.message.clone(),
            kind: t.kind,
            duration_ms: t.duration_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub state: ViewState,
    pub error: Option<UserFacingError>,
    pub toast: Option<ToastView>,
    pub is_authenticated: bool,
    pub demo_session: bool,
}

pub mod app {
    use super::*;
    use crate::api::{ApiClient, AuthResponse};
    use crate::capabilities::{Capabilities, StorageEntry, StorageKey, StorageOutput};
    use crate::demo::DemoDecision;
    use crate::session::{HandoffSlot, RestoredSession, SessionKeys};

    #[derive(Default)]
    pub struct App;

    impl App {
        fn api_client(model: &Model) -> Option<ApiClient> {
            model.config.api_url.clone().map(ApiClient::new)
        }

        fn storage_keys() -> Option<SessionKeys> {
            match SessionKeys::load() {
                Ok(keys) => Some(keys),
                Err(e) => {
                    tracing::error!(error = %e, "session storage keys unavailable");
                    None
                }
            }
        }

        fn settled_state(model: &Model) -> AppState {
            if model.is_authenticated() {
                AppState::Ready
            } else {
                AppState::Unauthenticated
            }
        }

        /// Demo-mode answer for render-time consumers. Conservative: with no
        /// completed probe this reports demo, never a hopeful "server".
        fn demo_badge_active(model: &Model) -> bool {
            model.session_is_demo()
                || demo::decide(
                    model.config.demo_policy,
                    model.force_demo,
                    model.config.api_url.is_some(),
                    model.probe.availability(),
                )
                .is_demo()
        }

        /// Mode for a new analysis request. `None` means the cached probe is
        /// stale and the answer has to wait for a fresh health check.
        fn resolve_demo_mode(model: &Model) -> Option<DemoDecision> {
            if model.session_is_demo() {
                return Some(DemoDecision::Demo(DemoReason::RuntimeOverride));
            }

            let api_configured = model.config.api_url.is_some();
            let policy = model.config.demo_policy;
            if policy != DemoModePolicy::Auto || model.force_demo || !api_configured {
                return Some(demo::decide(policy, model.force_demo, api_configured, None));
            }

            if model.probe.is_fresh(model.view_timestamp_ms) {
                return Some(demo::decide(
                    policy,
                    model.force_demo,
                    api_configured,
                    model.probe.availability(),
                ));
            }

            None
        }

        fn demo_login_applies(model: &Model) -> bool {
            matches!(model.config.demo_policy, DemoModePolicy::ForcedOn)
                || model.force_demo
                || model.config.api_url.is_none()
        }

        fn request_session_restore(caps: &Capabilities) {
            let Some(keys) = Self::storage_keys() else {
                return;
            };
            caps.storage.get_multi(keys.restore_set(), |result| {
                Event::SessionRestored(Box::new(result))
            });
        }

        fn apply_restored_session(model: &mut Model, caps: &Capabilities, entries: &[StorageEntry]) {
            let restored = RestoredSession::from_entries(entries);

            model.force_demo = restored.force_demo.unwrap_or(false);
            if !restored.warnings.is_empty() {
                model.show_toast("Some saved session data could not be read", ToastKind::Warning);
            }
            for key in restored.corrupt_keys() {
                caps.storage.delete(key.clone(), |result| {
                    Event::SessionCleared(Box::new(result))
                });
            }

            let Some(tokens) = restored.effective_tokens() else {
                if model.state != AppState::Analyzing {
                    model.state = AppState::Unauthenticated;
                }
                return;
            };

            if restored.migrated_from_legacy() {
                tracing::info!("migrating legacy single-token session record");
                Self::persist_session(caps, &tokens, None);
                if let Some(keys) = Self::storage_keys() {
                    caps.storage.delete(keys.legacy_token, |result| {
                        Event::SessionPersisted(Box::new(result))
                    });
                }
            }

            let is_demo = tokens.is_demo();
            model.user = restored.user.or_else(|| is_demo.then(UserProfile::demo));
            model.tokens = Some(SessionTokens::from_stored(&tokens));
            if model.state != AppState::Analyzing {
                model.state = AppState::Ready;
            }

            if !is_demo {
                if session::needs_refresh(&tokens.access, model.view_timestamp_ms)
                    && tokens.can_refresh()
                {
                    Self::start_refresh(model, caps);
                }
                if model.user.is_none() {
                    Self::request_profile(model, caps);
                }
            }
        }

        fn persist_session(caps: &Capabilities, tokens: &AuthTokens, user: Option<&UserProfile>) {
            if tokens.access.is_empty() {
                tracing::error!("refusing to persist a session with an empty access token");
                return;
            }
            let Some(keys) = Self::storage_keys() else {
                return;
            };

            match session::encode_tokens(tokens) {
                Ok(bytes) => {
                    caps.storage.set(keys.tokens.clone(), bytes, |result| {
                        Event::SessionPersisted(Box::new(result))
                    });
                }
                Err(e) => tracing::error!(error = %e, "token record failed to encode"),
            }

            if let Some(user) = user {
                Self::persist_profile(caps, user);
            }
        }

        fn persist_profile(caps: &Capabilities, user: &UserProfile) {
            let Some(keys) = Self::storage_keys() else {
                return;
            };
            match session::encode_profile(user) {
                Ok(bytes) => {
                    caps.storage.set(keys.user.clone(), bytes, |result| {
                        Event::SessionPersisted(Box::new(result))
                    });
                }
                Err(e) => tracing::error!(error = %e, "profile record failed to encode"),
            }
        }

        fn persist_force_demo(caps: &Capabilities, enabled: bool) {
            let Some(keys) = Self::storage_keys() else {
                return;
            };
            match session::encode_force_demo(enabled) {
                Ok(bytes) => {
                    caps.storage.set(keys.force_demo.clone(), bytes, |result| {
                        Event::ForceDemoPersisted(Box::new(result))
                    });
                }
                Err(e) => tracing::error!(error = %e, "demo override failed to encode"),
            }
        }

        fn clear_session(model: &mut Model, caps: &Capabilities) {
            if let Some(keys) = Self::storage_keys() {
                caps.storage.delete_multi(keys.logout_set(), |result| {
                    Event::SessionCleared(Box::new(result))
                });
            }
            let handoff_keys: Vec<StorageKey> = HandoffSlot::all()
                .iter()
                .filter_map(|slot| slot.storage_key().ok())
                .collect();
            caps.storage.delete_multi(handoff_keys, |result| {
                Event::SessionCleared(Box::new(result))
            });

            model.tokens = None;
            model.user = None;
            model.analysis = None;
            model.last_result = None;
            model.refresh_in_flight = false;
            model.state = AppState::Unauthenticated;
        }

        fn start_login(model: &mut Model, caps: &Capabilities, username: &str, password: &str) {
            let username = username.trim();
            if username.is_empty() || password.is_empty() {
                model.set_error(AppError::new(
                    ErrorKind::Validation,
                    "Username and password are required",
                ));
                return;
            }

            if Self::demo_login_applies(model) {
                Self::complete_demo_login(model, caps);
                return;
            }

            let Some(client) = Self::api_client(model) else {
                Self::complete_demo_login(model, caps);
                return;
            };

            match client.login_request(username, password) {
                Ok(request) => {
                    model.state = AppState::Authenticating;
                    model.clear_error();
                    caps.http
                        .send(request, |result| Event::LoginResponse(Box::new(result)));
                }
                Err(e) => model.set_error(e.into()),
            }
        }

        fn start_signup(
            model: &mut Model,
            caps: &Capabilities,
            username: &str,
            email: &str,
            password: &str,
            first_name: Option<String>,
            last_name: Option<String>,
        ) {
            let username = username.trim();
            let email = email.trim();
            if username.is_empty() || email.is_empty() || password.is_empty() {
                model.set_error(AppError::new(
                    ErrorKind::Validation,
                    "Username, email and password are required",
                ));
                return;
            }

            if Self::demo_login_applies(model) {
                Self::complete_demo_login(model, caps);
                return;
            }

            let Some(client) = Self::api_client(model) else {
                Self::complete_demo_login(model, caps);
                return;
            };

            let signup = api::SignupRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                first_name,
                last_name,
            };
            match client.signup_request(&signup) {
                Ok(request) => {
                    model.state = AppState::Authenticating;
                    model.clear_error();
                    caps.http
                        .send(request, |result| Event::SignupResponse(Box::new(result)));
                }
                Err(e) => model.set_error(e.into()),
            }
        }

        fn complete_demo_login(model: &mut Model, caps: &Capabilities) {
            let tokens = AuthTokens::demo();
            let user = UserProfile::demo();
            Self::persist_session(caps, &tokens, Some(&user));

            model.tokens = Some(SessionTokens::from_stored(&tokens));
            model.user = Some(user);
            model.state = AppState::Ready;
            model.clear_error();
            model.show_toast("Demo mode: results are simulated", ToastKind::Info);
        }

        fn handle_auth_response(model: &mut Model, caps: &Capabilities, result: HttpResult) {
            match result {
                Ok(response) if response.is_success() => {
                    match response.json::<AuthResponse>() {
                        Ok(auth) => Self::complete_server_login(model, caps, auth),
                        Err(e) => {
                            model.state = AppState::Unauthenticated;
                            model.set_error(AppError::from(e).with_internal("auth response body"));
                        }
                    }
                }
                Ok(response) => {
                    model.state = AppState::Unauthenticated;
                    model.set_error(AppError::from_http_status(
                        response.status(),
                        Some(response.body()),
                    ));
                }
                Err(e) => {
                    model.state = AppState::Unauthenticated;
                    model.set_error(e.into());
                }
            }
        }

        fn complete_server_login(model: &mut Model, caps: &Capabilities, auth: AuthResponse) {
            let tokens = AuthTokens {
                access: auth.access,
                refresh: auth.refresh,
            };
            Self::persist_session(caps, &tokens, auth.user.as_ref());

            model.tokens = Some(SessionTokens::from_stored(&tokens));
            model.user = auth.user;
            model.state = AppState::Ready;
            model.clear_error();
            model.show_toast("Signed in", ToastKind::Success);

            if model.user.is_none() {
                Self::request_profile(model, caps);
            }
        }

        fn request_profile(model: &Model, caps: &Capabilities) {
            let Some(client) = Self::api_client(model) else {
                return;
            };
            let Some(access) = model.access_token() else {
                return;
            };
            match client.profile_request(access) {
                Ok(request) => {
                    caps.http
                        .send(request, |result| Event::ProfileResponse(Box::new(result)));
                }
                Err(e) => tracing::warn!(error = %e, "profile request could not be built"),
            }
        }

        fn start_refresh(model: &mut Model, caps: &Capabilities) {
            if model.refresh_in_flight {
                return;
            }
            let Some(client) = Self::api_client(model) else {
                return;
            };
            let Some(tokens) = model.tokens.as_ref() else {
                return;
            };
            if !tokens.can_refresh() {
                return;
            }

            match client.refresh_request(tokens.refresh()) {
                Ok(request) => {
                    model.refresh_in_flight = true;
                    caps.http
                        .send(request, |result| Event::RefreshResponse(Box::new(result)));
                }
                Err(e) => tracing::warn!(error = %e, "refresh request could not be built"),
            }
        }

        fn handle_refresh_response(model: &mut Model, caps: &Capabilities, result: HttpResult) {
            model.refresh_in_flight = false;
            let analysis_waiting = matches!(
                &model.analysis,
                Some(a) if a.phase == AnalysisPhase::RefreshingToken
            );

            match result {
                Ok(response) if response.is_success() => {
                    match response.json::<api::RefreshResponse>() {
                        Ok(refreshed) => {
                            let refresh = refreshed.refresh.unwrap_or_else(|| {
                                model
                                    .tokens
                                    .as_ref()
                                    .map(|t| t.refresh().to_string())
                                    .unwrap_or_default()
                            });
                            let tokens = AuthTokens {
                                access: refreshed.access,
                                refresh,
                            };
                            Self::persist_session(caps, &tokens, None);
                            model.tokens = Some(SessionTokens::from_stored(&tokens));
                            tracing::debug!("access token refreshed");

                            if analysis_waiting {
                                Self::start_upload(model, caps);
                            }
                        }
                        Err(e) => Self::handle_refresh_failure(model, caps, e.into()),
                    }
                }
                Ok(response) => {
                    let error =
                        AppError::from_http_status(response.status(), Some(response.body()));
                    Self::handle_refresh_failure(model, caps, error);
                }
                Err(e) if e.is_network_class() => {
                    // Connectivity trouble says nothing about token validity.
                    // Keep the session; a waiting analysis degrades to demo.
                    tracing::warn!(error = %e, "token refresh unreachable");
                    if analysis_waiting {
                        Self::fall_back_to_demo(model, caps);
                    }
                }
                Err(e) => Self::handle_refresh_failure(model, caps, e.into()),
            }
        }

        fn handle_refresh_failure(model: &mut Model, caps: &Capabilities, error: AppError) {
            tracing::warn!(error = %error, "token refresh rejected, signing out");
            Self::clear_session(model, caps);
            model.set_error(AppError::new(
                ErrorKind::Authentication,
                "Your session has expired. Please sign in again.",
            ));
        }

        fn ensure_probe(model: &mut Model, caps: &Capabilities) {
            let now_ms = model.view_timestamp_ms;
            if !model.probe.should_start(now_ms) {
                return;
            }
            let Some(client) = Self::api_client(model) else {
                return;
            };

            let generation = model.probe.start(now_ms);
            match client.health_request() {
                Ok(request) => {
                    caps.http.send(request, move |result| Event::ProbeResponse {
                        generation,
                        result: Box::new(result),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "health request could not be built");
                    model.probe.complete(generation, false, now_ms);
                }
            }
        }

        fn resume_after_probe(model: &mut Model, caps: &Capabilities) {
            let waiting = matches!(
                &model.analysis,
                Some(a) if a.phase == AnalysisPhase::CheckingBackend
            );
            if !waiting {
                return;
            }
            let decision = demo::decide(
                model.config.demo_policy,
                model.force_demo,
                model.config.api_url.is_some(),
                model.probe.availability(),
            );
            Self::dispatch_analysis(model, caps, decision);
        }

        fn start_analysis(
            model: &mut Model,
            caps: &Capabilities,
            image_bytes: Vec<u8>,
            vitals: PatientVitals,
        ) {
            if model.analysis.is_some() {
                model.show_toast("An analysis is already running", ToastKind::Warning);
                return;
            }

            let today = today_from_ms(model.view_timestamp_ms);
            if let Err(e) = vitals.validate(today) {
                model.set_error(e.into());
                return;
            }

            let (image, image_error) = if image_bytes.is_empty() {
                (
                    None,
                    Some(AppError::new(
                        ErrorKind::Validation,
                        "Please select an X-ray image first",
                    )),
                )
            } else {
                match api::image_blob(image_bytes) {
                    Ok(blob) => (Some(blob), None),
                    Err(e) => (None, Some(e.into())),
                }
            };

            model.clear_error();
            model.analysis = Some(ActiveAnalysis::new(
                image,
                image_error,
                vitals,
                model.view_timestamp_ms,
            ));
            model.state = AppState::Analyzing;

            match Self::resolve_demo_mode(model) {
                Some(decision) => Self::dispatch_analysis(model, caps, decision),
                None => Self::await_backend_probe(model, caps),
            }
        }

        fn await_backend_probe(model: &mut Model, caps: &Capabilities) {
            Self::ensure_probe(model, caps);
            let generation = model.probe.generation();
            caps.timer.notify_after(PROBE_WAIT_BOUND, move |_| {
                Event::ProbeWaitElapsed { generation }
            });
        }

        fn dispatch_analysis(model: &mut Model, caps: &Capabilities, decision: DemoDecision) {
            match decision {
                DemoDecision::Demo(reason) => Self::start_mock_analysis(model, caps, reason),
                DemoDecision::Server => Self::start_server_analysis(model, caps),
            }
        }

        fn start_mock_analysis(model: &mut Model, caps: &Capabilities, reason: DemoReason) {
            let Some(analysis) = model.analysis.as_mut() else {
                return;
            };
            analysis.demo_reason = Some(reason);
            analysis.phase = AnalysisPhase::MockLatency;
            tracing::info!(reason = ?reason, "analysis served by the mock generator");

            model.latency_generation = model.latency_generation.wrapping_add(1);
            let generation = model.latency_generation;
            caps.timer.notify_after_ms(demo::mock_latency_ms(), move |_| {
                Event::MockLatencyElapsed { generation }
            });
        }

        fn complete_mock_analysis(model: &mut Model, caps: &Capabilities) {
            let Some(active) = model.analysis.take() else {
                return;
            };
            let now_ms = model.view_timestamp_ms;
            let base = demo::mock_analysis(now_ms);

            let (risk_level, narrative, treatments) = if active.vitals.has_any_signal() {
                let outcome = demo::apply_vitals(&active.vitals);
                (outcome.risk_level, outcome.narrative, outcome.treatments)
            } else {
                (
                    base.severity,
                    base.narrative
                        .clone()
                        .unwrap_or_else(|| demo::MOCK_BASE_NARRATIVE.to_string()),
                    demo::MOCK_TREATMENTS.iter().map(|t| (*t).to_string()).collect(),
                )
            };

            let today = today_from_ms(now_ms);
            let condition_likelihoods = if active.vitals.has_any_signal() {
                vitals::assess_conditions(&active.vitals, today, base.indicates_pneumonia())
            } else {
                Vec::new()
            };

            let diagnosis = FinalDiagnosis {
                analysis: base,
                vitals: active.vitals.clone(),
                risk_level,
                narrative,
                treatments,
                condition_likelihoods,
                finalized_at_ms: now_ms,
            };
            Self::finish_analysis(model, caps, diagnosis, &active);
        }

        fn start_server_analysis(model: &mut Model, caps: &Capabilities) {
            if Self::api_client(model).is_none() {
                Self::start_mock_analysis(model, caps, DemoReason::NoApiConfigured);
                return;
            }

            let Some(access) = model.access_token().map(str::to_string) else {
                Self::abort_analysis(
                    model,
                    AppError::new(ErrorKind::Authentication, "Please sign in to run an analysis"),
                );
                return;
            };

            let missing_image = model
                .analysis
                .as_ref()
                .is_some_and(|a| a.image.is_none());
            if missing_image {
                let error = model
                    .analysis
                    .as_ref()
                    .and_then(|a| a.image_error.clone())
                    .unwrap_or_else(|| {
                        AppError::new(ErrorKind::Validation, "Please select an X-ray image first")
                    });
                Self::abort_analysis(model, error);
                return;
            }

            let stale = session::needs_refresh(&access, model.view_timestamp_ms);
            let can_refresh = model
                .tokens
                .as_ref()
                .is_some_and(SessionTokens::can_refresh);
            if stale && can_refresh {
                if let Some(analysis) = model.analysis.as_mut() {
                    analysis.phase = AnalysisPhase::RefreshingToken;
                }
                Self::start_refresh(model, caps);
                return;
            }

            Self::start_upload(model, caps);
        }

        fn start_upload(model: &mut Model, caps: &Capabilities) {
            let Some(client) = Self::api_client(model) else {
                return;
            };

            let request = {
                let Some(analysis) = model.analysis.as_ref() else {
                    return;
                };
                let Some(image) = analysis.image.as_ref() else {
                    return;
                };
                let Some(access) = model.access_token() else {
                    return;
                };
                let vitals = analysis.vitals.has_any_signal().then_some(&analysis.vitals);
                client.upload_scan_request(access, image, vitals)
            };

            match request {
                Ok(request) => {
                    if let Some(analysis) = model.analysis.as_mut() {
                        analysis.phase = AnalysisPhase::Uploading;
                    }
                    caps.http
                        .send(request, |result| Event::UploadResponse(Box::new(result)));
                }
                Err(e) => Self::abort_analysis(model, e.into()),
            }
        }

        fn handle_upload_response(model: &mut Model, caps: &Capabilities, result: HttpResult) {
            let uploading = matches!(
                &model.analysis,
                Some(a) if a.phase == AnalysisPhase::Uploading
            );
            if !uploading {
                tracing::debug!("ignoring upload response with no analysis in flight");
                return;
            }

            match result {
                Ok(response) if response.is_success() => {
                    match api::parse_analysis_response(&response, model.view_timestamp_ms) {
                        Ok(base) => Self::continue_with_base_result(model, caps, base),
                        Err(e) => {
                            tracing::warn!(error = %e, "analysis response unusable, serving demo result");
                            Self::fall_back_to_demo(model, caps);
                        }
                    }
                }
                Ok(response) => {
                    let error =
                        AppError::from_http_status(response.status(), Some(response.body()));
                    Self::abort_analysis(model, error);
                }
                Err(e) if e.is_network_class() => {
                    tracing::warn!(error = %e, "scan upload unreachable, serving demo result");
                    Self::fall_back_to_demo(model, caps);
                }
                Err(e) => Self::abort_analysis(model, e.into()),
            }
        }

        /// One-shot recovery path: flip the persisted override so later
        /// requests skip the doomed remote attempt, then finish locally.
        fn fall_back_to_demo(model: &mut Model, caps: &Capabilities) {
            model.force_demo = true;
            Self::persist_force_demo(caps, true);
            model.show_toast(
                "Server unreachable, showing demo results",
                ToastKind::Warning,
            );
            if let Some(analysis) = model.analysis.as_mut() {
                analysis.demo_reason = Some(DemoReason::BackendUnavailable);
            }
            Self::complete_mock_analysis(model, caps);
        }

        fn continue_with_base_result(model: &mut Model, caps: &Capabilities, base: AnalysisData) {
            let has_vitals = model
                .analysis
                .as_ref()
                .is_some_and(|a| a.vitals.has_any_signal());
            let Some(image_id) = base.image_id.clone().filter(|_| has_vitals) else {
                if has_vitals {
                    tracing::warn!("response carries no image id, skipping the vitals endpoint");
                }
                Self::finalize_server_analysis(model, caps, base, None);
                return;
            };

            let request = {
                let Some(client) = Self::api_client(model) else {
                    Self::finalize_server_analysis(model, caps, base, None);
                    return;
                };
                let Some(access) = model.access_token() else {
                    Self::finalize_server_analysis(model, caps, base, None);
                    return;
                };
                let Some(analysis) = model.analysis.as_ref() else {
                    return;
                };
                client.analyze_vitals_request(access, &image_id, &analysis.vitals)
            };

            match request {
                Ok(request) => {
                    if let Some(analysis) = model.analysis.as_mut() {
                        analysis.base = Some(Box::new(base));
                        analysis.phase = AnalysisPhase::AssessingVitals;
                    }
                    caps.http
                        .send(request, |result| Event::VitalsResponse(Box::new(result)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vitals request could not be built");
                    Self::finalize_server_analysis(model, caps, base, None);
                }
            }
        }

        fn handle_vitals_response(model: &mut Model, caps: &Capabilities, result: HttpResult) {
            let assessing = matches!(
                &model.analysis,
                Some(a) if a.phase == AnalysisPhase::AssessingVitals
            );
            if !assessing {
                tracing::debug!("ignoring vitals response with no analysis in flight");
                return;
            }
            let Some(base) = model.analysis.as_mut().and_then(|a| a.base.take()) else {
                return;
            };

            // The scan-level result is already complete; a failed vitals
            // round-trip degrades to it instead of degrading to the mock.
            let update = match result {
                Ok(response) if response.is_success() => {
                    match api::parse_analysis_response(&response, model.view_timestamp_ms) {
                        Ok(updated) => Some(updated),
                        Err(e) => {
                            tracing::warn!(error = %e, "vitals response unusable, keeping scan result");
                            None
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(
                        status = response.status(),
                        "vitals endpoint rejected the request, keeping scan result"
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vitals endpoint unreachable, keeping scan result");
                    None
                }
            };

            Self::finalize_server_analysis(model, caps, *base, update);
        }

        fn finalize_server_analysis(
            model: &mut Model,
            caps: &Capabilities,
            base: AnalysisData,
            vitals_update: Option<AnalysisData>,
        ) {
            let Some(active) = model.analysis.take() else {
                return;
            };
            let now_ms = model.view_timestamp_ms;
            let combined = vitals_update.unwrap_or(base);

            let narrative = combined.narrative.clone().unwrap_or_else(|| {
                format!(
                    "Most likely finding: {} ({}% confidence)",
                    combined.top_prediction.label,
                    display_percent(combined.top_prediction.probability)
                )
            });

            let condition_likelihoods = if active.vitals.has_any_signal() {
                vitals::assess_conditions(
                    &active.vitals,
                    today_from_ms(now_ms),
                    combined.indicates_pneumonia(),
                )
            } else {
                Vec::new()
            };

            let diagnosis = FinalDiagnosis {
                risk_level: combined.severity,
                analysis: combined,
                vitals: active.vitals.clone(),
                narrative,
                treatments: Vec::new(),
                condition_likelihoods,
                finalized_at_ms: now_ms,
            };
            Self::finish_analysis(model, caps, diagnosis, &active);
        }

        fn finish_analysis(
            model: &mut Model,
            caps: &Capabilities,
            diagnosis: FinalDiagnosis,
            active: &ActiveAnalysis,
        ) {
            Self::store_handoff(caps, &diagnosis, active);
            model.state = Self::settled_state(model);
            model.last_result = Some(Box::new(diagnosis));
            if model.active_toast.is_none() {
                model.show_toast("Analysis complete", ToastKind::Success);
            }
        }

        fn abort_analysis(model: &mut Model, error: AppError) {
            tracing::warn!(error = %error, "analysis aborted");
            model.analysis = None;
            model.state = Self::settled_state(model);
            model.set_error(error);
        }

        fn store_handoff(caps: &Capabilities, diagnosis: &FinalDiagnosis, active: &ActiveAnalysis) {
            Self::store_handoff_slot(caps, HandoffSlot::Result, &diagnosis.analysis);
            Self::store_handoff_slot(caps, HandoffSlot::Vitals, &diagnosis.vitals);
            Self::store_handoff_slot(caps, HandoffSlot::FinalResult, diagnosis);
            if let Some(image) = active.image.as_ref() {
                Self::store_handoff_slot(caps, HandoffSlot::OriginalImage, image);
            }
        }

        fn store_handoff_slot<T: Serialize>(caps: &Capabilities, slot: HandoffSlot, value: &T) {
            let key = match slot.storage_key() {
                Ok(key) => key,
                Err(e) => {
                    tracing::error!(error = %e, "handoff key could not be built");
                    return;
                }
            };
            match session::encode_handoff(slot, value) {
                Ok(bytes) => {
                    caps.storage.set(key, bytes, |result| {
                        Event::HandoffStored(Box::new(result))
                    });
                }
                Err(e) => tracing::error!(error = %e, "handoff record failed to encode"),
            }
        }

        fn request_handoff_load(caps: &Capabilities) {
            let keys: Vec<StorageKey> = HandoffSlot::all()
                .iter()
                .filter_map(|slot| slot.storage_key().ok())
                .collect();
            caps.storage.get_multi(keys, |result| {
                Event::HandoffLoaded(Box::new(result))
            });
        }

        fn apply_handoff_entries(model: &mut Model, entries: &[StorageEntry]) {
            let final_key = HandoffSlot::FinalResult.storage_key().ok();
            let bytes = entries
                .iter()
                .find(|entry| Some(&entry.key) == final_key.as_ref())
                .and_then(|entry| entry.value.as_deref());

            match session::load_final(bytes) {
                Some(diagnosis) => model.last_result = Some(Box::new(diagnosis)),
                None => {
                    tracing::debug!("no stored result to reopen");
                    model.last_result = None;
                }
            }
        }

        fn log_storage_ack(context: &'static str, result: &StorageResult) {
            if let Err(e) = result {
                tracing::warn!(context, error = %e, "storage write failed");
            }
        }

        fn arm_toast_timer(model: &mut Model, caps: &Capabilities) {
            let Some(toast) = &model.active_toast else {
                return;
            };
            if model.armed_toast_seq == model.toast_seq {
                return;
            }
            model.armed_toast_seq = model.toast_seq;
            let generation = model.toast_seq;
            caps.timer.notify_after_ms(
                toast.duration_ms + TOAST_EXPIRY_SLACK_MS,
                move |_| Event::ToastExpiryCheck { generation },
            );
        }
    }

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
            model.update_timestamp();

            let event_name = event.name();
            tracing::debug!(event = event_name, "handling event");
            if event.is_user_initiated() {
                tracing::info!(event = event_name, "user action");
            }

            match event {
                Event::Noop => {}

                Event::AppStarted => {
                    model.state = AppState::Starting;
                    Self::request_session_restore(caps);
                    Self::ensure_probe(model, caps);
                    caps.render.render();
                }

                Event::ConfigLoaded { api_url, demo_flag } => {
                    model.config =
                        AppConfig::from_env_strings(api_url.as_deref(), demo_flag.as_deref());
                    model.probe = BackendProbe::default();
                    caps.render.render();
                }

                Event::SessionRestored(result) => {
                    match *result {
                        Ok(StorageOutput::Multi { entries }) => {
                            Self::apply_restored_session(model, caps, &entries);
                        }
                        Ok(other) => {
                            tracing::error!(output = ?other, "unexpected restore payload");
                            model.state = AppState::Unauthenticated;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "session restore failed, starting signed out");
                            model.state = AppState::Unauthenticated;
                        }
                    }
                    caps.render.render();
                }

                Event::ExternalStorageChanged => {
                    // Another tab signed in or out; converge on its record.
                    Self::request_session_restore(caps);
                }

                Event::LoginRequested { username, password } => {
                    Self::start_login(model, caps, &username, &password);
                    caps.render.render();
                }

                Event::SignupRequested {
                    username,
                    email,
                    password,
                    first_name,
                    last_name,
                } => {
                    Self::start_signup(
                        model, caps, &username, &email, &password, first_name, last_name,
                    );
                    caps.render.render();
                }

                Event::DemoLoginRequested => {
                    Self::complete_demo_login(model, caps);
                    caps.render.render();
                }

                Event::LoginResponse(result) | Event::SignupResponse(result) => {
                    Self::handle_auth_response(model, caps, *result);
                    caps.render.render();
                }

                Event::ProfileResponse(result) => {
                    match *result {
                        Ok(response) if response.is_success() => {
                            match response.json::<UserProfile>() {
                                Ok(user) => {
                                    Self::persist_profile(caps, &user);
                                    model.user = Some(user);
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "profile body failed to parse");
                                }
                            }
                        }
                        Ok(response) => {
                            tracing::warn!(status = response.status(), "profile fetch rejected");
                        }
                        Err(e) => tracing::warn!(error = %e, "profile fetch failed"),
                    }
                    caps.render.render();
                }

                Event::RefreshResponse(result) => {
                    Self::handle_refresh_response(model, caps, *result);
                    caps.render.render();
                }

                Event::LogoutRequested => {
                    Self::clear_session(model, caps);
                    model.show_toast("Signed out", ToastKind::Info);
                    caps.render.render();
                }

                Event::SessionPersisted(result) => {
                    Self::log_storage_ack("session", &result);
                }

                Event::SessionCleared(result) => {
                    Self::log_storage_ack("logout", &result);
                }

                Event::ForceDemoChanged { enabled } => {
                    if !enabled && model.config.demo_policy == DemoModePolicy::ForcedOn {
                        model.show_toast(
                            "Demo mode is enforced by this build and cannot be disabled",
                            ToastKind::Info,
                        );
                    } else {
                        model.force_demo = enabled;
                        Self::persist_force_demo(caps, enabled);
                        if enabled {
                            model.show_toast("Demo mode on: results are simulated", ToastKind::Info);
                        } else {
                            model.show_toast("Demo mode off", ToastKind::Info);
                        }
                    }
                    caps.render.render();
                }

                Event::ForceDemoPersisted(result) => {
                    Self::log_storage_ack("demo_override", &result);
                }

                Event::BackendProbeRequested => {
                    Self::ensure_probe(model, caps);
                    caps.render.render();
                }

                Event::ProbeResponse { generation, result } => {
                    let available = matches!(&*result, Ok(response) if response.is_success());
                    if let Err(e) = &*result {
                        tracing::debug!(error = %e, "health probe failed");
                    }
                    let now_ms = model.view_timestamp_ms;
                    if model.probe.complete(generation, available, now_ms) {
                        tracing::debug!(available, "backend availability refreshed");
                        Self::resume_after_probe(model, caps);
                    }
                    caps.render.render();
                }

                Event::ProbeWaitElapsed { generation } => {
                    let waiting = matches!(
                        &model.analysis,
                        Some(a) if a.phase == AnalysisPhase::CheckingBackend
                    );
                    if waiting
                        && generation == model.probe.generation()
                        && model.probe.is_in_flight()
                    {
                        tracing::warn!("health probe still pending, proceeding in demo mode");
                        Self::dispatch_analysis(
                            model,
                            caps,
                            DemoDecision::Demo(DemoReason::BackendUnavailable),
                        );
                        caps.render.render();
                    }
                }

                Event::AnalyzeRequested { image_bytes, vitals } => {
                    Self::start_analysis(model, caps, image_bytes, *vitals);
                    caps.render.render();
                }

                Event::MockLatencyElapsed { generation } => {
                    let pending = matches!(
                        &model.analysis,
                        Some(a) if a.phase == AnalysisPhase::MockLatency
                    );
                    if pending && generation == model.latency_generation {
                        Self::complete_mock_analysis(model, caps);
                        caps.render.render();
                    }
                }

                Event::UploadResponse(result) => {
                    Self::handle_upload_response(model, caps, *result);
                    caps.render.render();
                }

                Event::VitalsResponse(result) => {
                    Self::handle_vitals_response(model, caps, *result);
                    caps.render.render();
                }

                Event::HandoffStored(result) => {
                    Self::log_storage_ack("handoff", &result);
                }

                Event::ResultsOpened => {
                    if model.last_result.is_none() {
                        Self::request_handoff_load(caps);
                    }
                    caps.render.render();
                }

                Event::HandoffLoaded(result) => {
                    match *result {
                        Ok(StorageOutput::Multi { entries }) => {
                            Self::apply_handoff_entries(model, &entries);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "result handoff unavailable"),
                    }
                    caps.render.render();
                }

                Event::DismissError => {
                    model.clear_error();
                    caps.render.render();
                }

                Event::DismissToast => {
                    model.clear_toast();
                    caps.render.render();
                }

                Event::ToastExpiryCheck { generation } => {
                    if generation == model.toast_seq && model.active_toast.is_some() {
                        model.clear_toast();
                        caps.render.render();
                    }
                }
            }

            Self::arm_toast_timer(model, caps);
        }

        fn view(&self, model: &Model) -> ViewModel {
            let state = match model.state {
                AppState::Starting => ViewState::Starting,

                AppState::Unauthenticated => ViewState::Unauthenticated,

                AppState::Authenticating => ViewState::Authenticating,

                AppState::Ready => ViewState::Ready {
                    username: model.user.as_ref().map(UserProfile::display_name),
                    demo_active: Self::demo_badge_active(model),
                    force_demo: model.force_demo,
                    backend_available: model.probe.availability(),
                    result: model.last_result.as_deref().map(DiagnosisView::from),
                },

                AppState::Analyzing => {
                    let (phase, is_demo) = model
                        .analysis
                        .as_ref()
                        .map_or((AnalysisPhase::CheckingBackend, false), |a| {
                            (a.phase, a.is_demo())
                        });
                    ViewState::Analyzing {
                        phase: phase.as_str().to_string(),
                        is_demo,
                    }
                }
            };

            ViewModel {
                state,
                error: model.active_error.as_ref().map(UserFacingError::from),
                toast: model.active_toast.as_ref().map(ToastView::from),
                is_authenticated: model.is_authenticated(),
                demo_session: model.session_is_demo(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(label: &str, probability: f64) -> Prediction {
        Prediction {
            label: label.to_string(),
            probability,
        }
    }

    mod error_tests {
        use super::*;

        #[test]
        fn test_http_status_maps_to_kind() {
            assert_eq!(AppError::from_http_status(400, None).kind, ErrorKind::Validation);
            assert_eq!(
                AppError::from_http_status(401, None).kind,
                ErrorKind::Authentication
            );
            assert_eq!(AppError::from_http_status(404, None).kind, ErrorKind::NotFound);
            assert_eq!(AppError::from_http_status(503, None).kind, ErrorKind::Server);
            assert_eq!(AppError::from_http_status(418, None).kind, ErrorKind::Unknown);
        }

        #[test]
        fn test_unauthorized_defaults_to_invalid_credentials() {
            let error = AppError::from_http_status(401, None);
            assert_eq!(error.message, "Invalid credentials");
        }

        #[test]
        fn test_server_detail_wins_over_default() {
            let body = br#"{"detail":"No active account found with the given credentials"}"#;
            let error = AppError::from_http_status(401, Some(body));
            assert_eq!(
                error.message,
                "No active account found with the given credentials"
            );
            assert_eq!(error.context.get("http_status").map(String::as_str), Some("401"));
        }

        #[test]
        fn test_field_errors_are_mined() {
            let body = br#"{"username":["A user with that username already exists."]}"#;
            let error = AppError::from_http_status(400, Some(body));
            assert!(error.message.contains("username"));
            assert!(error.message.contains("already exists"));
        }

        #[test]
        fn test_retryable_follows_kind_and_severity() {
            assert!(AppError::new(ErrorKind::Network, "x").is_retryable());
            assert!(AppError::new(ErrorKind::Server, "x").is_retryable());
            assert!(!AppError::new(ErrorKind::Validation, "x").is_retryable());
            assert!(!AppError::new(ErrorKind::Network, "x")
                .with_severity(ErrorSeverity::Fatal)
                .is_retryable());
        }

        #[test]
        fn test_image_too_large_message_names_the_limit() {
            let message = AppError::new(ErrorKind::ImageTooLarge, "").user_facing_message();
            assert!(message.contains("10 MB"));
        }

        #[test]
        fn test_transport_errors_convert_by_class() {
            let timeout = HttpError::Timeout {
                timeout_ms: 2000,
                request_id: "r".to_string(),
            };
            assert_eq!(AppError::from(timeout).kind, ErrorKind::Timeout);

            let dns = HttpError::Dns {
                host: "api.example.com".to_string(),
                message: "nope".to_string(),
            };
            assert_eq!(AppError::from(dns).kind, ErrorKind::Network);
        }

        #[test]
        fn test_api_error_conversion() {
            let error = AppError::from(ApiError::UnsupportedImageFormat);
            assert_eq!(error.kind, ErrorKind::ImageFormatUnsupported);

            let error = AppError::from(ApiError::ImageTooLarge {
                size: MAX_IMAGE_BYTES + 1,
                max: MAX_IMAGE_BYTES,
            });
            assert_eq!(error.kind, ErrorKind::ImageTooLarge);
        }

        #[test]
        fn test_display_includes_code_and_internal() {
            let error = AppError::new(ErrorKind::Storage, "write failed")
                .with_internal("quota exceeded");
            let rendered = error.to_string();
            assert!(rendered.contains("STORAGE_ERROR"));
            assert!(rendered.contains("write failed"));
            assert!(rendered.contains("quota exceeded"));
        }
    }

    mod severity_tests {
        use super::*;

        #[test]
        fn test_parse_is_case_insensitive() {
            assert_eq!(Severity::parse("high"), Some(Severity::High));
            assert_eq!(Severity::parse("HIGH"), Some(Severity::High));
            assert_eq!(Severity::parse(" Moderate "), Some(Severity::Moderate));
            assert_eq!(Severity::parse("low"), Some(Severity::Low));
            assert_eq!(Severity::parse("critical"), None);
            assert_eq!(Severity::parse(""), None);
        }

        #[test]
        fn test_as_str_round_trips() {
            for severity in [Severity::Low, Severity::Moderate, Severity::High] {
                assert_eq!(Severity::parse(severity.as_str()), Some(severity));
            }
        }
    }

    mod prediction_tests {
        use super::*;

        #[test]
        fn test_top_prediction_picks_maximum() {
            let predictions = vec![
                prediction("Normal", 0.1),
                prediction("Pneumonia", 0.8),
                prediction("COVID-19", 0.3),
            ];
            let top = top_prediction(&predictions);
            assert_eq!(top.map(|p| p.label.as_str()), Some("Pneumonia"));
        }

        #[test]
        fn test_top_prediction_tie_keeps_first_seen() {
            let predictions = vec![
                prediction("First", 0.5),
                prediction("Second", 0.5),
            ];
            let top = top_prediction(&predictions);
            assert_eq!(top.map(|p| p.label.as_str()), Some("First"));
        }

        #[test]
        fn test_top_prediction_empty_is_none() {
            assert!(top_prediction(&[]).is_none());
        }

        #[test]
        fn test_clamp_probability() {
            assert_eq!(clamp_probability(1.5), 1.0);
            assert_eq!(clamp_probability(-0.2), 0.0);
            assert_eq!(clamp_probability(0.42), 0.42);
            assert_eq!(clamp_probability(f64::NAN), 0.0);
            assert_eq!(clamp_probability(f64::INFINITY), 0.0);
        }

        #[test]
        fn test_from_predictions_recomputes_top() {
            let data = AnalysisData::from_predictions(
                None,
                vec![prediction("Normal", 0.2), prediction("Pneumonia", 0.9)],
                Severity::Moderate,
                None,
                None,
                AnalysisSource::Server,
                0,
            )
            .unwrap();
            assert_eq!(data.top_prediction.label, "Pneumonia");
        }

        #[test]
        fn test_from_predictions_clamps_values() {
            let data = AnalysisData::from_predictions(
                None,
                vec![prediction("A", 1.5), prediction("B", -0.2)],
                Severity::Low,
                None,
                None,
                AnalysisSource::Server,
                0,
            )
            .unwrap();
            assert_eq!(data.predictions[0].probability, 1.0);
            assert_eq!(data.predictions[1].probability, 0.0);
            assert_eq!(data.top_prediction.label, "A");
        }

        #[test]
        fn test_from_predictions_orders_by_descending_confidence() {
            let data = AnalysisData::from_predictions(
                None,
                vec![
                    prediction("Normal", 0.09),
                    prediction("Pneumonia", 0.91),
                    prediction("COVID-19", 0.91),
                ],
                Severity::Moderate,
                None,
                None,
                AnalysisSource::Server,
                0,
            )
            .unwrap();
            let labels: Vec<&str> = data.predictions.iter().map(|p| p.label.as_str()).collect();
            assert_eq!(labels, ["Pneumonia", "COVID-19", "Normal"]);
            assert_eq!(data.top_prediction.label, "Pneumonia");
        }

        #[test]
        fn test_from_predictions_empty_is_none() {
            let data = AnalysisData::from_predictions(
                None,
                Vec::new(),
                Severity::Low,
                None,
                None,
                AnalysisSource::Server,
                0,
            );
            assert!(data.is_none());
        }

        #[test]
        fn test_indicates_pneumonia_needs_majority_confidence() {
            let mut data = AnalysisData::from_predictions(
                None,
                vec![prediction("Pneumonia", 0.49)],
                Severity::Moderate,
                None,
                None,
                AnalysisSource::Server,
                0,
            )
            .unwrap();
            assert!(!data.indicates_pneumonia());

            data.top_prediction.probability = 0.5;
            assert!(data.indicates_pneumonia());

            data.top_prediction.label = "PNEUMONIA".to_string();
            assert!(data.indicates_pneumonia());

            data.top_prediction.label = "Normal".to_string();
            assert!(!data.indicates_pneumonia());
        }

        #[test]
        fn test_display_percent_rounds_to_one_decimal() {
            assert_eq!(display_percent(0.89), 89.0);
            assert_eq!(display_percent(0.4567), 45.7);
            assert_eq!(display_percent(1.0), 100.0);
        }
    }

    mod toast_tests {
        use super::*;

        #[test]
        fn test_durations_vary_by_kind() {
            assert_eq!(ToastKind::Info.default_duration_ms(), 3000);
            assert_eq!(ToastKind::Success.default_duration_ms(), 2000);
            assert_eq!(ToastKind::Warning.default_duration_ms(), 4000);
            assert_eq!(ToastKind::Error.default_duration_ms(), 5000);
        }

        #[test]
        fn test_expiry_is_strictly_after_duration() {
            let toast = ToastMessage {
                message: "hello".to_string(),
                kind: ToastKind::Info,
                created_at_ms: 1000,
                duration_ms: 3000,
            };
            assert!(!toast.is_expired(4000));
            assert!(toast.is_expired(4001));
        }
    }

    mod config_tests {
        use super::*;

        #[test]
        fn test_empty_url_means_no_api() {
            let config = AppConfig::from_env_strings(Some(""), None);
            assert!(config.api_url.is_none());

            let config = AppConfig::from_env_strings(Some("   "), None);
            assert!(config.api_url.is_none());

            let config = AppConfig::from_env_strings(None, None);
            assert!(config.api_url.is_none());
        }

        #[test]
        fn test_invalid_url_is_dropped() {
            let config = AppConfig::from_env_strings(Some("ftp://example.com"), None);
            assert!(config.api_url.is_none());
        }

        #[test]
        fn test_valid_url_and_policy() {
            let config =
                AppConfig::from_env_strings(Some("https://api.example.com/api"), Some("true"));
            assert!(config.api_url.is_some());
            assert_eq!(config.demo_policy, DemoModePolicy::ForcedOn);
        }

        #[test]
        fn test_default_points_at_local_backend() {
            let config = AppConfig::default();
            assert!(config.api_url.is_some());
            assert_eq!(config.demo_policy, DemoModePolicy::Auto);
        }
    }

    mod token_tests {
        use super::*;

        #[test]
        fn test_demo_tokens_are_recognized() {
            let tokens = SessionTokens::from_stored(&AuthTokens::demo());
            assert!(tokens.is_demo());
            assert!(!tokens.can_refresh());
        }

        #[test]
        fn test_server_tokens_can_refresh() {
            let tokens = SessionTokens::from_stored(&AuthTokens {
                access: "a".to_string(),
                refresh: "r".to_string(),
            });
            assert!(!tokens.is_demo());
            assert!(tokens.can_refresh());
        }

        #[test]
        fn test_legacy_tokens_cannot_refresh() {
            let tokens = SessionTokens::from_stored(&AuthTokens {
                access: "a".to_string(),
                refresh: String::new(),
            });
            assert!(!tokens.can_refresh());
        }

        #[test]
        fn test_round_trip_preserves_values() {
            let stored = AuthTokens {
                access: "access-token".to_string(),
                refresh: "refresh-token".to_string(),
            };
            let tokens = SessionTokens::from_stored(&stored);
            assert_eq!(tokens.to_stored(), stored);
        }
    }

    mod model_tests {
        use super::*;

        #[test]
        fn test_default_model_starts_unauthenticated() {
            let model = Model::default();
            assert_eq!(model.state, AppState::Starting);
            assert!(!model.is_authenticated());
            assert!(!model.session_is_demo());
            assert!(model.analysis.is_none());
            assert!(model.last_result.is_none());
        }

        #[test]
        fn test_show_toast_bumps_sequence() {
            let mut model = Model::default();
            let initial = model.toast_seq;
            model.show_toast("one", ToastKind::Info);
            model.show_toast("two", ToastKind::Error);
            assert_eq!(model.toast_seq, initial.wrapping_add(2));
            assert_eq!(
                model.active_toast.as_ref().map(|t| t.message.as_str()),
                Some("two")
            );
        }

        #[test]
        fn test_error_helpers() {
            let mut model = Model::default();
            model.set_error(AppError::new(ErrorKind::Network, "down"));
            assert!(model.active_error.is_some());
            model.clear_error();
            assert!(model.active_error.is_none());
        }

        #[test]
        fn test_access_token_exposes_secret() {
            let mut model = Model::default();
            assert!(model.access_token().is_none());
            model.tokens = Some(SessionTokens::from_stored(&AuthTokens {
                access: "secret-access".to_string(),
                refresh: String::new(),
            }));
            assert_eq!(model.access_token(), Some("secret-access"));
        }
    }

    mod event_tests {
        use super::*;

        #[test]
        fn test_names_are_snake_case() {
            let events = [
                Event::AppStarted,
                Event::DemoLoginRequested,
                Event::LogoutRequested,
                Event::BackendProbeRequested,
                Event::ResultsOpened,
                Event::Noop,
            ];
            for event in events {
                let name = event.name();
                assert!(!name.is_empty());
                assert!(name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            }
        }

        #[test]
        fn test_default_event_is_noop() {
            assert!(matches!(Event::default(), Event::Noop));
        }

        #[test]
        fn test_user_initiated_classification() {
            assert!(Event::DemoLoginRequested.is_user_initiated());
            assert!(Event::DismissToast.is_user_initiated());
            assert!(!Event::AppStarted.is_user_initiated());
            assert!(!Event::Noop.is_user_initiated());
            assert!(!Event::ToastExpiryCheck { generation: 1 }.is_user_initiated());
        }
    }

    mod view_tests {
        use super::*;

        fn sample_diagnosis() -> FinalDiagnosis {
            let analysis = AnalysisData::from_predictions(
                Some(ImageId::new("img-7")),
                vec![prediction("Pneumonia", 0.89), prediction("Normal", 0.11)],
                Severity::Moderate,
                Some("https://example.com/heatmap.png".to_string()),
                None,
                AnalysisSource::Demo,
                1_700_000_000_000,
            )
            .unwrap();
            FinalDiagnosis {
                analysis,
                vitals: PatientVitals {
                    notes: Some("patient reports fatigue".to_string()),
                    ..PatientVitals::default()
                },
                risk_level: Severity::High,
                narrative: "Demo narrative".to_string(),
                treatments: vec!["Rest".to_string()],
                condition_likelihoods: vec![ConditionLikelihood {
                    condition: "Covid-19".to_string(),
                    percent: 21.67,
                }],
                finalized_at_ms: 1_700_000_000_000,
            }
        }

        #[test]
        fn test_diagnosis_view_reflects_result() {
            let view = DiagnosisView::from(&sample_diagnosis());
            assert_eq!(view.top_label, "Pneumonia");
            assert_eq!(view.top_percent, 89.0);
            assert_eq!(view.severity, "Moderate");
            assert_eq!(view.risk_level, "High");
            assert!(view.is_demo);
            assert_eq!(view.predictions.len(), 2);
            assert_eq!(view.notes.as_deref(), Some("patient reports fatigue"));
        }

        #[test]
        fn test_user_facing_error_marks_transient() {
            let error = AppError::new(ErrorKind::Network, "down");
            let view = UserFacingError::from(&error);
            assert!(view.is_transient);
            assert!(view.is_retryable);
            assert_eq!(view.error_code, "NETWORK_ERROR");

            let error = AppError::new(ErrorKind::Validation, "bad input");
            let view = UserFacingError::from(&error);
            assert!(!view.is_transient);
            assert_eq!(view.message, "bad input");
        }
    }

    mod invariant_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn from_predictions_top_is_maximum(values in proptest::collection::vec(-2.0f64..2.0, 1..8)) {
                let predictions: Vec<Prediction> = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Prediction {
                        label: format!("label-{i}"),
                        probability: *v,
                    })
                    .collect();

                let data = AnalysisData::from_predictions(
                    None,
                    predictions,
                    Severity::Moderate,
                    None,
                    None,
                    AnalysisSource::Server,
                    0,
                )
                .unwrap();

                for p in &data.predictions {
                    prop_assert!(p.probability >= 0.0 && p.probability <= 1.0);
                    prop_assert!(data.top_prediction.probability >= p.probability);
                }
            }
        }
    }
}
