//! Id allocation and lookup for attached adapters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::adapter::{Adapter, AdapterId};
use crate::config::Config;
use crate::error::Error;
use crate::hw::Hardware;
use crate::reconcile::UnitHost;
use crate::state::ControllerState;

/// Holds every attached adapter under the lowest free id.
pub struct AdapterRegistry {
    max_adapters: u32,
    adapters: Mutex<BTreeMap<AdapterId, Arc<Adapter>>>,
    offline: Arc<Mutex<BTreeSet<AdapterId>>>,
}

impl AdapterRegistry {
    pub fn new(max_adapters: u32) -> Self {
        AdapterRegistry {
            max_adapters,
            adapters: Mutex::new(BTreeMap::new()),
            offline: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Create an adapter under the lowest free id. It is not started.
    pub fn attach(
        &self,
        hw: Arc<dyn Hardware>,
        config: Config,
        host: Arc<dyn UnitHost>,
    ) -> Result<Arc<Adapter>, Error> {
        let mut adapters = self.adapters.lock();
        let id = (0..self.max_adapters)
            .map(AdapterId)
            .find(|id| !adapters.contains_key(id))
            .ok_or(Error::RegistryFull)?;

        let adapter = Arc::new(Adapter::new(id, hw, config, host)?);
        let offline = self.offline.clone();
        adapter.on_offline(move |id| {
            offline.lock().insert(id);
        });
        adapters.insert(id, adapter.clone());
        info!(adapter = %id, "registered");
        Ok(adapter)
    }

    /// Quiesce (if operational), stop and forget an adapter. Its id
    /// becomes free.
    pub fn detach(&self, id: AdapterId) -> Result<(), Error> {
        let adapter = self
            .adapters
            .lock()
            .remove(&id)
            .ok_or(Error::UnknownAdapter(id))?;
        self.offline.lock().remove(&id);
        if adapter.state() == ControllerState::Operational
            && let Err(e) = adapter.shutdown()
        {
            warn!(adapter = %id, error = %e, "shutdown failed during detach");
        }
        adapter.stop();
        info!(adapter = %id, "unregistered");
        Ok(())
    }

    pub fn get(&self, id: AdapterId) -> Option<Arc<Adapter>> {
        self.adapters.lock().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<AdapterId> {
        self.adapters.lock().keys().copied().collect()
    }

    /// Adapters that exhausted their reset budget.
    pub fn offline(&self) -> Vec<AdapterId> {
        self.offline.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
