//! Process-wide bundle identity cache
//!
//! Registered bundles are owned by the `all` list and live as long as the
//! registry does. The location index holds weak references, so a bundle
//! that is being torn down is never found by a lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bundle::{Bundle, BundleId};

#[derive(Default)]
struct Tables {
    all: Vec<Arc<Bundle>>,
    by_location: HashMap<PathBuf, Weak<Bundle>>,
    by_identifier: HashMap<String, Vec<Arc<Bundle>>>,
    pending_unload: HashMap<BundleId, Weak<Bundle>>,
}

pub struct BundleRegistry {
    tables: Mutex<Tables>,
    draining: AtomicBool,
    unretained: bool,
}

impl BundleRegistry {
    /// `unretained` enables [`evict`](Self::evict).
    pub fn new(unretained: bool) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            draining: AtomicBool::new(false),
            unretained,
        }
    }

    pub fn lookup_by_location(&self, location: &Path) -> Option<Arc<Bundle>> {
        let mut tables = self.tables.lock();
        let found = tables.by_location.get(location)?.upgrade();
        if found.is_none() {
            tables.by_location.remove(location);
        }
        found
    }

    /// Insert `bundle` unless its location is already registered.
    ///
    /// Returns the registered bundle and whether `bundle` was the one inserted.
    pub fn insert_or_fetch(&self, bundle: Bundle) -> (Arc<Bundle>, bool) {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables
            .by_location
            .get(bundle.location())
            .and_then(Weak::upgrade)
        {
            return (existing, false);
        }

        let bundle = Arc::new(bundle);
        tables.all.push(Arc::clone(&bundle));
        tables
            .by_location
            .insert(bundle.location().to_path_buf(), Arc::downgrade(&bundle));
        if let Some(identifier) = bundle.identifier() {
            let list = tables.by_identifier.entry(identifier.to_string()).or_default();
            let version = bundle.version();
            let position = list
                .iter()
                .position(|other| other.version() < version)
                .unwrap_or(list.len());
            list.insert(position, Arc::clone(&bundle));
        }
        (bundle, true)
    }

    /// Best bundle declaring `identifier`: the first loaded one, else the
    /// newest.
    pub fn lookup_by_identifier(&self, identifier: &str) -> Option<Arc<Bundle>> {
        let tables = self.tables.lock();
        let list = tables.by_identifier.get(identifier)?;
        list.iter()
            .find(|bundle| bundle.is_loaded())
            .or_else(|| list.first())
            .cloned()
    }

    /// Every bundle declaring `identifier`, newest first.
    pub fn bundles_with_identifier(&self, identifier: &str) -> Vec<Arc<Bundle>> {
        self.tables
            .lock()
            .by_identifier
            .get(identifier)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<Bundle>> {
        self.tables.lock().all.clone()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule_unload(&self, bundle: &Arc<Bundle>) {
        tracing::debug!(bundle = %bundle.location().display(), "Scheduling unload");
        self.tables
            .lock()
            .pending_unload
            .insert(bundle.id(), Arc::downgrade(bundle));
    }

    pub fn unschedule_unload(&self, bundle: &Bundle) {
        self.tables.lock().pending_unload.remove(&bundle.id());
    }

    pub fn is_scheduled(&self, bundle: &Bundle) -> bool {
        self.tables.lock().pending_unload.contains_key(&bundle.id())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Unload everything scheduled so far.
    ///
    /// Requests made while draining wait for the next drain.
    pub fn drain_scheduled_unloads(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<Weak<Bundle>> = {
            let mut tables = self.tables.lock();
            tables.pending_unload.drain().map(|(_, bundle)| bundle).collect()
        };
        for bundle in pending.iter().filter_map(Weak::upgrade) {
            tracing::debug!(bundle = %bundle.location().display(), "Draining scheduled unload");
            bundle.unload();
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    /// Drop `bundle` from every index. Only honoured with unretained tables.
    ///
    /// Handles already given out stay valid; they just stop being found.
    pub fn evict(&self, bundle: &Bundle) -> bool {
        if !self.unretained {
            tracing::warn!(
                bundle = %bundle.location().display(),
                "Eviction requires registry.unretained_tables"
            );
            return false;
        }
        let mut tables = self.tables.lock();
        let before = tables.all.len();
        tables.all.retain(|other| other.id() != bundle.id());
        if tables.all.len() == before {
            return false;
        }
        tables.by_location.remove(bundle.location());
        if let Some(identifier) = bundle.identifier()
            && let Some(list) = tables.by_identifier.get_mut(identifier)
        {
            list.retain(|other| other.id() != bundle.id());
            if list.is_empty() {
                tables.by_identifier.remove(identifier);
            }
        }
        tables.pending_unload.remove(&bundle.id());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn bundle(tmp: &TempDir, name: &str, manifest: &str) -> Bundle {
        let location = tmp.path().join(name);
        fs::create_dir_all(&location).unwrap();
        fs::write(location.join("Info.toml"), manifest).unwrap();
        Bundle::construct(Weak::new(), &location, false).unwrap()
    }

    #[test]
    fn second_insert_returns_first() {
        let tmp = TempDir::new().unwrap();
        let registry = BundleRegistry::new(false);
        let (first, inserted) = registry.insert_or_fetch(bundle(&tmp, "A.bundle", ""));
        assert!(inserted);
        let (second, inserted) = registry.insert_or_fetch(bundle(&tmp, "A.bundle", ""));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn identifier_lists_are_sorted_newest_first() {
        let tmp = TempDir::new().unwrap();
        let registry = BundleRegistry::new(false);
        for (name, version) in [("v1.bundle", 1), ("v5.bundle", 5), ("v3.bundle", 3)] {
            registry.insert_or_fetch(bundle(
                &tmp,
                name,
                &format!("identifier = \"org.example.multi\"\nversion = {version}\n"),
            ));
        }
        let versions: Vec<u32> = registry
            .bundles_with_identifier("org.example.multi")
            .iter()
            .map(|b| b.version())
            .collect();
        assert_eq!(versions, vec![5, 3, 1]);
        assert_eq!(registry.lookup_by_identifier("org.example.multi").unwrap().version(), 5);
    }

    #[test]
    fn equal_versions_keep_registration_order() {
        let tmp = TempDir::new().unwrap();
        let registry = BundleRegistry::new(false);
        let manifest = "identifier = \"org.example.tie\"\nversion = 2\n";
        let (first, _) = registry.insert_or_fetch(bundle(&tmp, "first.bundle", manifest));
        registry.insert_or_fetch(bundle(&tmp, "second.bundle", manifest));
        assert!(Arc::ptr_eq(&registry.lookup_by_identifier("org.example.tie").unwrap(), &first));
    }

    #[test]
    fn scheduling_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = BundleRegistry::new(false);
        let (b, _) = registry.insert_or_fetch(bundle(&tmp, "S.bundle", ""));
        registry.schedule_unload(&b);
        registry.schedule_unload(&b);
        assert!(registry.is_scheduled(&b));
        registry.unschedule_unload(&b);
        registry.unschedule_unload(&b);
        assert!(!registry.is_scheduled(&b));
    }

    #[test]
    fn drain_clears_pending_set() {
        let tmp = TempDir::new().unwrap();
        let registry = BundleRegistry::new(false);
        let (b, _) = registry.insert_or_fetch(bundle(&tmp, "D.bundle", ""));
        registry.schedule_unload(&b);
        registry.drain_scheduled_unloads();
        assert!(!registry.is_scheduled(&b));
        assert!(!registry.is_draining());
    }

    #[test]
    fn eviction_needs_unretained_tables() {
        let tmp = TempDir::new().unwrap();
        let retained = BundleRegistry::new(false);
        let (b, _) = retained.insert_or_fetch(bundle(&tmp, "E.bundle", "identifier = \"org.example.e\"\n"));
        assert!(!retained.evict(&b));
        assert!(retained.lookup_by_location(b.location()).is_some());

        let unretained = BundleRegistry::new(true);
        let (b, _) = unretained.insert_or_fetch(bundle(&tmp, "E.bundle", "identifier = \"org.example.e\"\n"));
        assert!(unretained.evict(&b));
        assert!(unretained.lookup_by_location(b.location()).is_none());
        assert!(unretained.lookup_by_identifier("org.example.e").is_none());
        assert!(unretained.is_empty());
        // The handle itself is still usable.
        assert_eq!(b.identifier(), Some("org.example.e"));
    }
}
