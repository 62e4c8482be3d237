//! Recovery record for an in-flight identity verification.
//!
//! The record is written when the provider redirects back and read once when
//! the verification controller starts. Expired or malformed records are
//! deleted on first access and reported as absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::SessionStorage;
use crate::clock::{Clock, SystemClock};

pub const DEFAULT_CALLBACK_KEY: &str = "pending_verify_callback";
pub const DEFAULT_CALLBACK_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallback {
    pub auth_token: String,
    pub callback_code: Option<String>,
    pub callback_success: Option<bool>,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl PendingCallback {
    pub fn new(
        auth_token: impl Into<String>,
        callback_code: Option<String>,
        callback_success: Option<bool>,
        created_at: i64,
    ) -> Self {
        Self {
            auth_token: auth_token.into(),
            callback_code,
            callback_success,
            created_at,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let auth_token = value.get("authToken")?.as_str()?;
        if auth_token.is_empty() {
            return None;
        }
        let created_at = value.get("createdAt")?.as_i64()?;
        if created_at == 0 {
            return None;
        }
        let callback_code = match value.get("callbackCode") {
            None | Some(Value::Null) => None,
            Some(Value::String(code)) => Some(code.clone()),
            Some(Value::Number(code)) => Some(code.to_string()),
            Some(_) => return None,
        };
        let callback_success = match value.get("callbackSuccess") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(flag)) => Some(*flag),
            Some(_) => return None,
        };
        Some(Self::new(auth_token, callback_code, callback_success, created_at))
    }
}

/// Session-scoped store for [`PendingCallback`] with TTL and corruption recovery.
///
/// Every operation is infallible from the caller's point of view: without a
/// backend, or when the backend fails, writes are dropped and reads return
/// `None`.
#[derive(Clone)]
pub struct CallbackStore {
    storage: Option<Arc<dyn SessionStorage>>,
    clock: Arc<dyn Clock>,
    key: String,
    ttl: Duration,
}

impl std::fmt::Debug for CallbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackStore")
            .field("storage", &self.storage.is_some())
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CallbackStore {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            storage: Some(storage),
            clock: Arc::new(SystemClock),
            key: DEFAULT_CALLBACK_KEY.to_string(),
            ttl: DEFAULT_CALLBACK_TTL,
        }
    }

    /// A store with no backend, e.g. outside a browsing session.
    pub fn unavailable() -> Self {
        Self {
            storage: None,
            clock: Arc::new(SystemClock),
            key: DEFAULT_CALLBACK_KEY.to_string(),
            ttl: DEFAULT_CALLBACK_TTL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_available(&self) -> bool {
        self.storage.is_some()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn save(&self, record: &PendingCallback) {
        let Some(storage) = &self.storage else {
            return;
        };
        let serialized = match serde_json::to_string(record) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(error = %e, "Failed to serialize pending callback");
                return;
            }
        };
        match storage.set_item(&self.key, &serialized) {
            Ok(()) => debug!(key = %self.key, created_at = record.created_at, "Pending callback saved"),
            Err(e) => warn!(key = %self.key, error = %e, "Failed to save pending callback"),
        }
    }

    pub fn read(&self) -> Option<PendingCallback> {
        let storage = self.storage.as_ref()?;
        let raw = match storage.get_item(&self.key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to read pending callback");
                return None;
            }
        };

        let record = serde_json::from_str::<Value>(&raw)
            .ok()
            .as_ref()
            .and_then(PendingCallback::from_value);
        let Some(record) = record else {
            warn!(key = %self.key, "Discarding malformed pending callback");
            self.clear();
            return None;
        };

        let age_ms = self.clock.now_ms() - record.created_at;
        if age_ms > self.ttl.as_millis() as i64 {
            info!(key = %self.key, age_ms, "Pending callback expired");
            self.clear();
            return None;
        }

        Some(record)
    }

    pub fn clear(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(e) = storage.remove_item(&self.key) {
            warn!(key = %self.key, error = %e, "Failed to clear pending callback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStorage, StorageError};

    const T0: i64 = 1_700_000_000_000;

    fn store_at(clock: &ManualClock) -> (Arc<MemoryStorage>, CallbackStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = CallbackStore::new(storage.clone()).with_clock(Arc::new(clock.clone()));
        (storage, store)
    }

    #[test]
    fn test_save_and_read() {
        let clock = ManualClock::from_millis(T0);
        let (_, store) = store_at(&clock);
        let record = PendingCallback::new("tok-1", Some("0".to_string()), Some(true), T0);

        store.save(&record);
        assert_eq!(store.read(), Some(record.clone()));
        // reads are idempotent
        assert_eq!(store.read(), Some(record));
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let record = PendingCallback::new("tok", None, Some(false), T0);
        let json: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["authToken"], "tok");
        assert_eq!(json["callbackCode"], Value::Null);
        assert_eq!(json["callbackSuccess"], false);
        assert_eq!(json["createdAt"], T0);
    }

    #[test]
    fn test_expired_record_is_deleted() {
        let clock = ManualClock::from_millis(T0);
        let (storage, store) = store_at(&clock);
        store.save(&PendingCallback::new("tok", None, None, T0));

        clock.advance(chrono::Duration::minutes(30));
        assert!(store.read().is_some(), "exactly at the TTL is still valid");

        clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(store.read(), None);
        assert!(storage.is_empty());
        assert_eq!(store.read(), None);
    }

    #[test]
    fn test_malformed_records_are_deleted() {
        let clock = ManualClock::from_millis(T0);
        let (storage, store) = store_at(&clock);

        for raw in [
            "not json",
            r#"{"callbackCode":"0","createdAt":1700000000000}"#,
            r#"{"authToken":42,"createdAt":1700000000000}"#,
            r#"{"authToken":"tok","createdAt":0}"#,
            r#"{"authToken":"tok"}"#,
            r#"{"authToken":"tok","createdAt":1700000000000,"callbackSuccess":"yes"}"#,
        ] {
            storage.set_item(store.key(), raw).unwrap();
            assert_eq!(store.read(), None, "{raw}");
            assert!(storage.is_empty(), "{raw} should be deleted");
        }
    }

    #[test]
    fn test_numeric_code_is_accepted() {
        let clock = ManualClock::from_millis(T0);
        let (storage, store) = store_at(&clock);
        storage
            .set_item(store.key(), r#"{"authToken":"tok","callbackCode":4,"createdAt":1700000000000}"#)
            .unwrap();
        assert_eq!(store.read().and_then(|r| r.callback_code).as_deref(), Some("4"));
    }

    #[test]
    fn test_unavailable_store_is_noop() {
        let store = CallbackStore::unavailable();
        store.save(&PendingCallback::new("tok", None, None, T0));
        assert_eq!(store.read(), None);
        store.clear();
        assert!(!store.is_available());
    }

    struct BrokenStorage;

    impl SessionStorage for BrokenStorage {
        fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable { reason: "quota".to_string() })
        }

        fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable { reason: "quota".to_string() })
        }

        fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable { reason: "quota".to_string() })
        }
    }

    #[test]
    fn test_backend_failures_do_not_propagate() {
        let store = CallbackStore::new(Arc::new(BrokenStorage));
        store.save(&PendingCallback::new("tok", None, None, T0));
        assert_eq!(store.read(), None);
        store.clear();
    }
}
