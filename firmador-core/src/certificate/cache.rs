//! Per-tenant cache of encrypted certificate bundles.
//!
//! Only the encrypted bytes and the password are cached. Decryption happens
//! again on every signing call, so no private key outlives the operation that
//! used it.
use super::CertificateError;
use crate::config::Config;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Source of encrypted bundles, one per tenant.
pub trait CertificateStore {
    fn fetch(&self, tenant: &str) -> Result<EncryptedBundle, CertificateError>;
}

/// PKCS#12 bytes and their password, wiped from memory on drop.
pub struct EncryptedBundle {
    bytes: Zeroizing<Vec<u8>>,
    password: Zeroizing<String>,
}

impl EncryptedBundle {
    pub fn new(bytes: Vec<u8>, password: String) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            password: Zeroizing::new(password),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for EncryptedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBundle")
            .field("bytes", &self.bytes.len())
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct BundleCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Arc<EncryptedBundle>, Instant)>>,
}

impl BundleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cache_ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached bundle for `tenant`, fetching it from `store` when
    /// absent or older than the TTL.
    pub fn get_or_fetch(
        &self,
        tenant: &str,
        store: &dyn CertificateStore,
    ) -> Result<Arc<EncryptedBundle>, CertificateError> {
        self.get_or_fetch_at(tenant, store, Instant::now())
    }

    fn get_or_fetch_at(
        &self,
        tenant: &str,
        store: &dyn CertificateStore,
        now: Instant,
    ) -> Result<Arc<EncryptedBundle>, CertificateError> {
        if let Some(bundle) = self.fresh(tenant, now) {
            tracing::debug!(tenant, "certificate bundle served from cache");
            return Ok(bundle);
        }

        // The lock is not held across the store lookup.
        let bundle = Arc::new(store.fetch(tenant)?);
        tracing::debug!(tenant, "certificate bundle fetched from store");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.to_string(), (Arc::clone(&bundle), now));
        Ok(bundle)
    }

    fn fresh(&self, tenant: &str, now: Instant) -> Option<Arc<EncryptedBundle>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (bundle, fetched_at) = entries.get(tenant)?;
        (now.saturating_duration_since(*fetched_at) < self.ttl).then(|| Arc::clone(bundle))
    }

    /// Drops the entry for `tenant`; returns whether one existed.
    pub fn invalidate(&self, tenant: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::mpsc;
    use std::thread;

    struct CountingStore {
        calls: Cell<usize>,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
            }
        }
    }

    impl CertificateStore for CountingStore {
        fn fetch(&self, tenant: &str) -> Result<EncryptedBundle, CertificateError> {
            self.calls.set(self.calls.get() + 1);
            if tenant == "missing" {
                return Err(CertificateError::NotFound {
                    tenant: tenant.to_string(),
                });
            }
            Ok(EncryptedBundle::new(
                tenant.as_bytes().to_vec(),
                format!("pw-{tenant}"),
            ))
        }
    }

    #[test]
    fn second_lookup_within_ttl_hits_cache() {
        let cache = BundleCache::new(Duration::from_secs(60));
        let store = CountingStore::new();
        let start = Instant::now();

        let first = cache.get_or_fetch_at("acme", &store, start).expect("first");
        let second = cache
            .get_or_fetch_at("acme", &store, start + Duration::from_secs(30))
            .expect("second");

        assert_eq!(store.calls.get(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.password(), "pw-acme");
    }

    #[test]
    fn expired_entry_is_refetched() {
        let cache = BundleCache::new(Duration::from_secs(60));
        let store = CountingStore::new();
        let start = Instant::now();

        cache.get_or_fetch_at("acme", &store, start).expect("first");
        cache
            .get_or_fetch_at("acme", &store, start + Duration::from_secs(61))
            .expect("refetch");

        assert_eq!(store.calls.get(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_and_clear_drop_entries() {
        let cache = BundleCache::new(Duration::from_secs(60));
        let store = CountingStore::new();
        cache.get_or_fetch("a", &store).expect("a");
        cache.get_or_fetch("b", &store).expect("b");

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn store_errors_are_not_cached() {
        let cache = BundleCache::new(Duration::from_secs(60));
        let store = CountingStore::new();

        assert!(matches!(
            cache.get_or_fetch("missing", &store),
            Err(CertificateError::NotFound { .. })
        ));
        assert!(cache.get_or_fetch("missing", &store).is_err());
        assert_eq!(store.calls.get(), 2);
        assert!(cache.is_empty());
    }

    struct SlowStore {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl CertificateStore for SlowStore {
        fn fetch(&self, tenant: &str) -> Result<EncryptedBundle, CertificateError> {
            if tenant == "slow" {
                let _ = self.entered.lock().unwrap().send(());
                self.release
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(|_| CertificateError::Store {
                        tenant: tenant.to_string(),
                        message: "timed out waiting for release".into(),
                    })?;
            }
            Ok(EncryptedBundle::new(tenant.as_bytes().to_vec(), String::new()))
        }
    }

    #[test]
    fn slow_fetch_does_not_block_other_tenants() {
        let cache = BundleCache::new(Duration::from_secs(60));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = SlowStore {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };

        thread::scope(|scope| {
            let slow = scope.spawn(|| cache.get_or_fetch("slow", &store));
            entered_rx.recv().expect("slow fetch started");

            let fast = cache.get_or_fetch("fast", &store).expect("fast");
            assert_eq!(fast.bytes(), b"fast");
            release_tx.send(()).expect("release");

            let slow = slow.join().expect("join").expect("slow");
            assert_eq!(slow.bytes(), b"slow");
        });
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn debug_output_redacts_password() {
        let bundle = EncryptedBundle::new(vec![1, 2, 3], "hunter2".into());
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
