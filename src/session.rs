use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{KeyNamespace, StorageEntry, StorageError, StorageKey, StorageValue};
use crate::vitals::PatientVitals;
use crate::{AnalysisData, FinalDiagnosis, TOKEN_REFRESH_AGE};

pub const DEMO_ACCESS_TOKEN: &str = "mock-access-token-for-demo-mode";
pub const DEMO_REFRESH_TOKEN: &str = "mock-refresh-token-for-demo-mode";
pub const DEMO_USERNAME: &str = "demo";

const TOKENS_NAME: &str = "tokens";
const USER_NAME: &str = "user";
const LEGACY_TOKEN_NAME: &str = "token";
const FORCE_DEMO_NAME: &str = "force_demo";

const TOKENS_FULL_KEY: &str = "auth:tokens";
const USER_FULL_KEY: &str = "auth:user";
const LEGACY_FULL_KEY: &str = "auth:token";
const FORCE_DEMO_FULL_KEY: &str = "settings:force_demo";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("failed to encode record: {message}")]
    Encode { message: String },

    #[error("corrupt record under '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The fixed set of keys the session store owns. Building them goes through
/// normal key validation so a typo in a name fails loudly in tests rather
/// than silently writing to a stray key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub tokens: StorageKey,
    pub user: StorageKey,
    pub legacy_token: StorageKey,
    pub force_demo: StorageKey,
}

impl SessionKeys {
    pub fn load() -> Result<Self, StorageError> {
        Ok(Self {
            tokens: KeyNamespace::Auth.key(TOKENS_NAME)?,
            user: KeyNamespace::Auth.key(USER_NAME)?,
            legacy_token: KeyNamespace::Auth.key(LEGACY_TOKEN_NAME)?,
            force_demo: KeyNamespace::Settings.key(FORCE_DEMO_NAME)?,
        })
    }

    /// Everything the restore pass reads in one batch.
    pub fn restore_set(&self) -> Vec<StorageKey> {
        vec![
            self.tokens.clone(),
            self.user.clone(),
            self.legacy_token.clone(),
            self.force_demo.clone(),
        ]
    }

    /// Keys cleared on logout. The demo-mode setting survives sign-out.
    pub fn logout_set(&self) -> Vec<StorageKey> {
        vec![
            self.tokens.clone(),
            self.user.clone(),
            self.legacy_token.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access: String,
    pub refresh: String,
}

impl AuthTokens {
    pub fn demo() -> Self {
        Self {
            access: DEMO_ACCESS_TOKEN.to_string(),
            refresh: DEMO_REFRESH_TOKEN.to_string(),
        }
    }

    pub fn is_demo(&self) -> bool {
        self.access == DEMO_ACCESS_TOKEN
    }

    pub fn can_refresh(&self) -> bool {
        !self.refresh.is_empty() && !self.is_demo()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<u64>,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl UserProfile {
    pub fn demo() -> Self {
        Self {
            id: None,
            username: DEMO_USERNAME.to_string(),
            email: "demo@example.com".to_string(),
            first_name: String::new(),
            last_name: String::new(),
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

#[derive(Deserialize)]
struct JwtClaims {
    #[serde(default)]
    iat: Option<u64>,
}

/// Pulls the issued-at claim out of a JWT without verifying the signature.
/// The age is only used to decide when to refresh, never for trust.
pub fn token_issued_at_ms(token: &str) -> Option<u64> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let payload = payload.trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&decoded).ok()?;
    claims.iat.map(|secs| secs.saturating_mul(1000))
}

pub fn token_age_ms(token: &str, now_ms: u64) -> Option<u64> {
    token_issued_at_ms(token).map(|iat_ms| now_ms.saturating_sub(iat_ms))
}

/// A token we cannot date is used as-is until the server rejects it.
/// Proactive refresh only kicks in for a readable issued-at claim.
pub fn needs_refresh(token: &str, now_ms: u64) -> bool {
    match token_age_ms(token, now_ms) {
        Some(age_ms) => age_ms >= TOKEN_REFRESH_AGE.as_millis() as u64,
        None => false,
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, SessionError> {
    let data = serde_json::to_vec(value).map_err(|e| SessionError::Encode {
        message: e.to_string(),
    })?;
    Ok(StorageValue::new(data).encode()?)
}

fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, SessionError> {
    let envelope = StorageValue::decode(bytes).map_err(|_| SessionError::Corrupt {
        key: key.to_string(),
        message: "not a versioned record".to_string(),
    })?;
    serde_json::from_slice(envelope.data()).map_err(|e| SessionError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub fn encode_tokens(tokens: &AuthTokens) -> Result<Vec<u8>, SessionError> {
    encode_json(tokens)
}

pub fn decode_tokens(bytes: &[u8]) -> Result<AuthTokens, SessionError> {
    decode_json(TOKENS_FULL_KEY, bytes)
}

pub fn encode_profile(profile: &UserProfile) -> Result<Vec<u8>, SessionError> {
    encode_json(profile)
}

pub fn decode_profile(bytes: &[u8]) -> Result<UserProfile, SessionError> {
    decode_json(USER_FULL_KEY, bytes)
}

pub fn encode_force_demo(enabled: bool) -> Result<Vec<u8>, SessionError> {
    encode_json(&enabled)
}

/// Accepts both the versioned record and the bare "true"/"false" strings
/// earlier releases wrote straight into browser storage.
pub fn decode_force_demo(bytes: &[u8]) -> Result<bool, SessionError> {
    if let Ok(flag) = decode_json::<bool>(FORCE_DEMO_FULL_KEY, bytes) {
        return Ok(flag);
    }
    match std::str::from_utf8(bytes).map(|s| s.trim().trim_matches('"')) {
        Ok("true") => Ok(true),
        Ok("false") => Ok(false),
        _ => Err(SessionError::Corrupt {
            key: FORCE_DEMO_FULL_KEY.to_string(),
            message: "neither a versioned record nor a boolean string".to_string(),
        }),
    }
}

/// Legacy single-token records predate the versioned envelope and hold the
/// raw access token, possibly JSON-quoted.
pub fn decode_legacy_token(bytes: &[u8]) -> Option<String> {
    let raw = std::str::from_utf8(bytes).ok()?;
    let token = raw.trim().trim_matches('"').trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// What came back from the restore batch. Corrupt records degrade to `None`
/// with a warning instead of failing the whole restore; their keys are kept
/// so the caller can delete them and the next restore starts clean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoredSession {
    pub tokens: Option<AuthTokens>,
    pub user: Option<UserProfile>,
    pub legacy_access: Option<String>,
    pub force_demo: Option<bool>,
    pub warnings: Vec<String>,
    corrupt: Vec<StorageKey>,
}

impl RestoredSession {
    pub fn from_entries(entries: &[StorageEntry]) -> Self {
        let mut restored = Self::default();

        for entry in entries {
            let Some(bytes) = entry.value.as_deref() else {
                continue;
            };
            match entry.key.as_str() {
                TOKENS_FULL_KEY => match decode_tokens(bytes) {
                    Ok(tokens) => restored.tokens = Some(tokens),
                    Err(e) => restored.warn(&entry.key, e),
                },
                USER_FULL_KEY => match decode_profile(bytes) {
                    Ok(user) => restored.user = Some(user),
                    Err(e) => restored.warn(&entry.key, e),
                },
                LEGACY_FULL_KEY => match decode_legacy_token(bytes) {
                    Some(access) => restored.legacy_access = Some(access),
                    None => restored.warn(
                        &entry.key,
                        SessionError::Corrupt {
                            key: LEGACY_FULL_KEY.to_string(),
                            message: "unreadable legacy token record".to_string(),
                        },
                    ),
                },
                FORCE_DEMO_FULL_KEY => match decode_force_demo(bytes) {
                    Ok(flag) => restored.force_demo = Some(flag),
                    Err(e) => restored.warn(&entry.key, e),
                },
                other => {
                    tracing::debug!(key = other, "ignoring unrecognized record in restore batch");
                }
            }
        }

        restored
    }

    fn warn(&mut self, key: &StorageKey, error: SessionError) {
        tracing::warn!(key = key.as_str(), %error, "dropping corrupt session record");
        self.warnings.push(format!("{}: {error}", key.as_str()));
        self.corrupt.push(key.clone());
    }

    /// Records that existed but failed to parse, due for deletion.
    pub fn corrupt_keys(&self) -> &[StorageKey] {
        &self.corrupt
    }

    /// Tokens to run with, falling back to a legacy single-token record.
    /// A legacy session has no refresh token and re-authenticates on the
    /// first rejected request instead of refreshing.
    pub fn effective_tokens(&self) -> Option<AuthTokens> {
        self.tokens.clone().or_else(|| {
            self.legacy_access.clone().map(|access| AuthTokens {
                access,
                refresh: String::new(),
            })
        })
    }

    pub fn migrated_from_legacy(&self) -> bool {
        self.tokens.is_none() && self.legacy_access.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some() || self.legacy_access.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffSlot {
    Result,
    OriginalImage,
    Vitals,
    FinalResult,
}

impl HandoffSlot {
    pub fn all() -> [HandoffSlot; 4] {
        [
            HandoffSlot::Result,
            HandoffSlot::OriginalImage,
            HandoffSlot::Vitals,
            HandoffSlot::FinalResult,
        ]
    }

    fn key_name(&self) -> &'static str {
        match self {
            HandoffSlot::Result => "result",
            HandoffSlot::OriginalImage => "original_image",
            HandoffSlot::Vitals => "vitals",
            HandoffSlot::FinalResult => "final_result",
        }
    }

    pub fn storage_key(&self) -> Result<StorageKey, StorageError> {
        KeyNamespace::Handoff.key(self.key_name())
    }

    fn full_key(&self) -> String {
        format!("handoff:{}", self.key_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlob {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    pub mime: String,
}

pub fn encode_handoff<T: Serialize>(slot: HandoffSlot, value: &T) -> Result<Vec<u8>, SessionError> {
    let mut data = Vec::new();
    ciborium::ser::into_writer(value, &mut data).map_err(|e| SessionError::Encode {
        message: format!("{}: {}", slot.full_key(), e),
    })?;
    Ok(StorageValue::new(data).encode()?)
}

pub fn decode_handoff<T: DeserializeOwned>(
    slot: HandoffSlot,
    bytes: &[u8],
) -> Result<T, SessionError> {
    let envelope = StorageValue::decode(bytes).map_err(|_| SessionError::Corrupt {
        key: slot.full_key(),
        message: "not a versioned record".to_string(),
    })?;
    ciborium::de::from_reader(envelope.data()).map_err(|e| SessionError::Corrupt {
        key: slot.full_key(),
        message: e.to_string(),
    })
}

/// Outcome of reading the analysis slot. Anything short of a valid record
/// is `NoResult`; the screen behind it redirects rather than rendering a
/// half-parsed diagnosis.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedAnalysis {
    Ready(Box<AnalysisData>),
    NoResult,
}

pub fn load_analysis(bytes: Option<&[u8]>) -> LoadedAnalysis {
    let Some(bytes) = bytes else {
        return LoadedAnalysis::NoResult;
    };
    match decode_handoff::<AnalysisData>(HandoffSlot::Result, bytes) {
        Ok(analysis) => LoadedAnalysis::Ready(Box::new(analysis)),
        Err(e) => {
            tracing::warn!(%e, "analysis handoff record unreadable");
            LoadedAnalysis::NoResult
        }
    }
}

pub fn load_final(bytes: Option<&[u8]>) -> Option<FinalDiagnosis> {
    let bytes = bytes?;
    match decode_handoff::<FinalDiagnosis>(HandoffSlot::FinalResult, bytes) {
        Ok(diagnosis) => Some(diagnosis),
        Err(e) => {
            tracing::warn!(%e, "final diagnosis handoff record unreadable");
            None
        }
    }
}

pub fn load_vitals(bytes: Option<&[u8]>) -> Option<PatientVitals> {
    let bytes = bytes?;
    match decode_handoff::<PatientVitals>(HandoffSlot::Vitals, bytes) {
        Ok(vitals) => Some(vitals),
        Err(e) => {
            tracing::warn!(%e, "vitals handoff record unreadable");
            None
        }
    }
}

pub fn load_image(bytes: Option<&[u8]>) -> Option<ImageBlob> {
    let bytes = bytes?;
    match decode_handoff::<ImageBlob>(HandoffSlot::OriginalImage, bytes) {
        Ok(blob) => Some(blob),
        Err(e) => {
            tracing::warn!(%e, "original image handoff record unreadable");
            None
        }
    }
}
