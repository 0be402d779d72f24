use std::fmt;
use std::sync::Arc;

use bundlekit_plugin_api::FactoryFn;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::bundle::Bundle;

/// How a factory produces instances.
#[derive(Clone)]
pub enum CreationFn {
    /// A function already in this process.
    Direct(FactoryFn),
    /// A symbol in `bundle`, resolved on first use. The cached pointer is
    /// dropped whenever the bundle unloads.
    ByName {
        bundle: Arc<Bundle>,
        symbol: String,
        resolved: Option<FactoryFn>,
    },
}

impl CreationFn {
    pub fn by_name(bundle: &Arc<Bundle>, symbol: impl Into<String>) -> Self {
        Self::ByName {
            bundle: Arc::clone(bundle),
            symbol: symbol.into(),
            resolved: None,
        }
    }

    pub fn owner(&self) -> Option<&Arc<Bundle>> {
        match self {
            Self::Direct(_) => None,
            Self::ByName { bundle, .. } => Some(bundle),
        }
    }
}

impl fmt::Debug for CreationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("Direct"),
            Self::ByName {
                bundle,
                symbol,
                resolved,
            } => f
                .debug_struct("ByName")
                .field("bundle", &bundle.location())
                .field("symbol", symbol)
                .field("resolved", &resolved.is_some())
                .finish(),
        }
    }
}

/// A named, typed creation function.
///
/// Once unregistered a factory is disabled for good: it leaves every
/// index and loses its creation function, but stays allocated while live
/// instances still refer to it.
pub struct Factory {
    id: Uuid,
    inner: Mutex<FactoryInner>,
}

struct FactoryInner {
    enabled: bool,
    creation: Option<CreationFn>,
    types: Vec<Uuid>,
}

impl Factory {
    pub(crate) fn new(id: Uuid, creation: CreationFn) -> Self {
        Self {
            id,
            inner: Mutex::new(FactoryInner {
                enabled: true,
                creation: Some(creation),
                types: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn supported_types(&self) -> Vec<Uuid> {
        self.inner.lock().types.clone()
    }

    pub fn supports(&self, type_id: &Uuid) -> bool {
        self.inner.lock().types.contains(type_id)
    }

    /// Bundle whose code implements this factory.
    pub fn owner(&self) -> Option<Arc<Bundle>> {
        self.inner.lock().creation.as_ref()?.owner().cloned()
    }

    /// Creation symbol name, for factories resolved by name.
    pub fn symbol_name(&self) -> Option<String> {
        match self.inner.lock().creation.as_ref()? {
            CreationFn::ByName { symbol, .. } => Some(symbol.clone()),
            CreationFn::Direct(_) => None,
        }
    }

    /// Swap the creation mechanism, keeping id and types. Returns the old owner.
    pub(crate) fn replace_creation(&self, creation: CreationFn) -> Option<Arc<Bundle>> {
        let mut inner = self.inner.lock();
        let previous = inner.creation.replace(creation);
        previous.and_then(|old| old.owner().cloned())
    }

    /// Returns false when the type was already listed.
    pub(crate) fn add_type(&self, type_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        if inner.types.contains(&type_id) {
            return false;
        }
        inner.types.push(type_id);
        true
    }

    pub(crate) fn remove_type(&self, type_id: &Uuid) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.types.len();
        inner.types.retain(|t| t != type_id);
        inner.types.len() != before
    }

    /// Disable and strip the factory. Returns the types it supported and its owner.
    pub(crate) fn disable(&self) -> (Vec<Uuid>, Option<Arc<Bundle>>) {
        let mut inner = self.inner.lock();
        inner.enabled = false;
        let owner = inner.creation.take().and_then(|c| c.owner().cloned());
        (std::mem::take(&mut inner.types), owner)
    }

    pub(crate) fn flush_resolved(&self) {
        if let Some(CreationFn::ByName { resolved, .. }) = self.inner.lock().creation.as_mut() {
            *resolved = None;
        }
    }

    /// The creation function, resolving (and loading the owner) if needed.
    ///
    /// Never holds the factory's own lock while calling into the bundle.
    pub(crate) fn creation_function(&self) -> Option<FactoryFn> {
        let (bundle, symbol) = {
            let inner = self.inner.lock();
            match inner.creation.as_ref()? {
                CreationFn::Direct(create) => return Some(*create),
                CreationFn::ByName {
                    resolved: Some(create),
                    ..
                } => return Some(*create),
                CreationFn::ByName { bundle, symbol, .. } => (Arc::clone(bundle), symbol.clone()),
            }
        };
        if symbol.is_empty() {
            return None;
        }

        let Some(address) = bundle.function_pointer_for_name(&symbol) else {
            tracing::warn!(
                factory = %self.id,
                symbol = %symbol,
                bundle = %bundle.location().display(),
                "Cannot find creation function"
            );
            return None;
        };
        // SAFETY: creation symbols named in a manifest or registered by name
        // follow the FactoryFn contract.
        let create: FactoryFn = unsafe { address.cast() };

        if let Some(CreationFn::ByName {
            bundle: owner,
            resolved,
            ..
        }) = self.inner.lock().creation.as_mut()
            && Arc::ptr_eq(owner, &bundle)
        {
            *resolved = Some(create);
        }
        Some(create)
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Factory")
            .field("id", &self.id)
            .field("enabled", &inner.enabled)
            .field("creation", &inner.creation)
            .field("types", &inner.types)
            .finish()
    }
}
