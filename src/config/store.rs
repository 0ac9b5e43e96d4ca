use crate::config::types::Settings;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// In-process snapshot of the runtime settings record.
///
/// Reads are lock-free (`ArcSwap::load`); the whole record is replaced
/// atomically when a newer version is installed. Middleware and the engine
/// load a snapshot per request and never hold a long-lived reference, so a
/// reload is observed by the very next request.
#[derive(Clone)]
pub struct SettingsStore {
    current: Arc<ArcSwap<Settings>>,
    version: Arc<AtomicI64>,
}

impl SettingsStore {
    pub fn new(settings: Settings, version: i64) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(settings)),
            version: Arc::new(AtomicI64::new(version)),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Install a newer settings record. Returns `false` (and leaves the
    /// snapshot untouched) when `version` is not newer than the installed one.
    pub fn install(&self, settings: Settings, version: i64) -> bool {
        let mut seen = self.version.load(Ordering::Acquire);
        loop {
            if version <= seen {
                return false;
            }
            match self.version.compare_exchange(
                seen,
                version,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => seen = actual,
            }
        }
        self.current.store(Arc::new(settings));
        true
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(Settings::default(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_newer_version() {
        let store = SettingsStore::default();
        let mut s = Settings::default();
        s.rotation.method = "round-robin".to_string();
        assert!(store.install(s, 1));
        assert_eq!(store.version(), 1);
        assert_eq!(store.current().rotation.method, "round-robin");
    }

    #[test]
    fn test_install_stale_version_ignored() {
        let store = SettingsStore::new(Settings::default(), 5);
        let mut s = Settings::default();
        s.rotation.method = "rate-limited".to_string();
        assert!(!store.install(s, 5));
        assert_eq!(store.version(), 5);
        assert_eq!(store.current().rotation.method, "random");
    }
}
