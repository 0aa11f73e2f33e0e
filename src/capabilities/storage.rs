use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Event;

// The shell maps tiers onto whatever it has: on web, Durable is
// localStorage and Session is sessionStorage. Browser storage can refuse
// access outright (private mode, disabled cookies), so every operation can
// come back AccessDenied and callers must treat that as a soft failure.

pub type StorageCapability = Storage<Event>;

pub const MAX_KEY_LENGTH: usize = 256;
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_BATCH_SIZE: usize = 16;

pub const STORAGE_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageTier {
    /// Survives restarts. localStorage on web.
    Durable,
    /// Lives as long as the shell session. sessionStorage on web.
    Session,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Durable => "durable",
            StorageTier::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Auth,
    Settings,
    Handoff,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Auth => "auth",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Handoff => "handoff",
        }
    }

    pub fn tier(&self) -> StorageTier {
        match self {
            KeyNamespace::Auth => StorageTier::Durable,
            KeyNamespace::Settings => StorageTier::Durable,
            KeyNamespace::Handoff => StorageTier::Session,
        }
    }

    pub fn key(&self, name: &str) -> Result<StorageKey, StorageError> {
        StorageKey::new(format!("{}:{}", self.prefix(), name), self.tier())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    key: String,
    tier: StorageTier,
}

impl StorageKey {
    pub fn new(key: impl Into<String>, tier: StorageTier) -> Result<Self, StorageError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self { key, tier })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn tier(&self) -> StorageTier {
        self.tier
    }

    fn validate(key: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(StorageError::InvalidKey {
                key: key.chars().take(64).collect(),
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }
        if key.chars().any(|c| c.is_whitespace()) {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain whitespace".to_string(),
            });
        }
        if key.chars().any(|c| c.is_control()) {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain control characters".to_string(),
            });
        }
        if key.contains("..") {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain '..'".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.tier.as_str(), self.key)
    }
}

/// Versioned envelope every record is stored inside. Raw bytes that do not
/// decode as an envelope are either a value written by an older release or
/// garbage; callers decide which.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageValue {
    version: u16,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl StorageValue {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            version: STORAGE_FORMAT_VERSION,
            data,
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| StorageError::Encoding {
            message: e.to_string(),
        })?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        ciborium::de::from_reader(bytes).map_err(|e| StorageError::Encoding {
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageOperation {
    Get {
        key: StorageKey,
    },
    Set {
        key: StorageKey,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        key: StorageKey,
    },
    GetMulti {
        keys: Vec<StorageKey>,
    },
    DeleteMulti {
        keys: Vec<StorageKey>,
    },
}

impl Operation for StorageOperation {
    type Output = StorageResult;
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("batch too large: {count} keys exceeds maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("storage access denied: {message}")]
    AccessDenied { message: String },

    #[error("storage backend error: {message}")]
    Backend { message: String },

    #[error("encoding error: {message}")]
    Encoding { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: StorageKey,
    #[serde(with = "serde_bytes")]
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageOutput {
    Value {
        key: StorageKey,
        #[serde(with = "serde_bytes")]
        value: Option<Vec<u8>>,
    },
    Written {
        key: StorageKey,
    },
    Deleted {
        key: StorageKey,
        existed: bool,
    },
    Multi {
        entries: Vec<StorageEntry>,
    },
}

pub type StorageResult = Result<StorageOutput, StorageError>;

pub struct Storage<Ev> {
    context: CapabilityContext<StorageOperation, Ev>,
}

impl<Ev> Capability<Ev> for Storage<Ev> {
    type Operation = StorageOperation;
    type MappedSelf<MappedEv> = Storage<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static,
    {
        Storage::new(self.context.map_event(f))
    }
}

impl<Ev> Storage<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<StorageOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn get<F>(&self, key: StorageKey, make_event: F)
    where
        F: Fn(StorageResult) -> Ev + Send + Sync + 'static,
    {
        self.perform(StorageOperation::Get { key }, make_event);
    }

    pub fn set<F>(&self, key: StorageKey, value: Vec<u8>, make_event: F)
    where
        F: Fn(StorageResult) -> Ev + Send + Sync + 'static,
    {
        if value.len() > MAX_VALUE_SIZE {
            self.context.update_app(make_event(Err(StorageError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            })));
            return;
        }
        self.perform(StorageOperation::Set { key, value }, make_event);
    }

    pub fn delete<F>(&self, key: StorageKey, make_event: F)
    where
        F: Fn(StorageResult) -> Ev + Send + Sync + 'static,
    {
        self.perform(StorageOperation::Delete { key }, make_event);
    }

    pub fn get_multi<F>(&self, keys: Vec<StorageKey>, make_event: F)
    where
        F: Fn(StorageResult) -> Ev + Send + Sync + 'static,
    {
        if keys.len() > MAX_BATCH_SIZE {
            self.context.update_app(make_event(Err(StorageError::BatchTooLarge {
                count: keys.len(),
                max: MAX_BATCH_SIZE,
            })));
            return;
        }
        self.perform(StorageOperation::GetMulti { keys }, make_event);
    }

    pub fn delete_multi<F>(&self, keys: Vec<StorageKey>, make_event: F)
    where
        F: Fn(StorageResult) -> Ev + Send + Sync + 'static,
    {
        if keys.len() > MAX_BATCH_SIZE {
            self.context.update_app(make_event(Err(StorageError::BatchTooLarge {
                count: keys.len(),
                max: MAX_BATCH_SIZE,
            })));
            return;
        }
        self.perform(StorageOperation::DeleteMulti { keys }, make_event);
    }

    fn perform<F>(&self, operation: StorageOperation, make_event: F)
    where
        F: Fn(StorageResult) -> Ev + Send + Sync + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let result = context.request_from_shell(operation).await;
            context.update_app(make_event(result));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(StorageKey::new("auth:tokens", StorageTier::Durable).is_ok());
        assert!(StorageKey::new("", StorageTier::Durable).is_err());
        assert!(StorageKey::new("has space", StorageTier::Durable).is_err());
        assert!(StorageKey::new("has\ttab", StorageTier::Durable).is_err());
        assert!(StorageKey::new("nul\0byte", StorageTier::Durable).is_err());
        assert!(StorageKey::new("dot..dot", StorageTier::Durable).is_err());
        assert!(StorageKey::new("x".repeat(MAX_KEY_LENGTH + 1), StorageTier::Durable).is_err());
    }

    #[test]
    fn test_namespace_prefixes() {
        let key = KeyNamespace::Auth.key("tokens").unwrap();
        assert_eq!(key.as_str(), "auth:tokens");
        assert_eq!(key.tier(), StorageTier::Durable);

        let key = KeyNamespace::Handoff.key("result").unwrap();
        assert_eq!(key.as_str(), "handoff:result");
        assert_eq!(key.tier(), StorageTier::Session);
    }

    #[test]
    fn test_namespace_rejects_bad_names() {
        assert!(KeyNamespace::Settings.key("force demo").is_err());
        assert!(KeyNamespace::Settings.key("").is_err());
    }

    #[test]
    fn test_value_envelope_round_trip() {
        let value = StorageValue::new(b"payload".to_vec());
        let bytes = value.encode().unwrap();
        let decoded = StorageValue::decode(&bytes).unwrap();
        assert_eq!(decoded.version(), STORAGE_FORMAT_VERSION);
        assert_eq!(decoded.data(), b"payload");
    }

    #[test]
    fn test_value_envelope_rejects_garbage() {
        assert!(StorageValue::decode(b"plain-legacy-token").is_err());
        assert!(StorageValue::decode(&[]).is_err());
    }
}
