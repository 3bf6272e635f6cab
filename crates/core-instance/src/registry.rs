//! Process-wide instance registry.
//!
//! Invariants:
//! - At most one viewer per container id; a second `load` fails with
//!   `ContainerBusy` (the container is reserved for the whole boot, so
//!   concurrent loads against the same container cannot both win).
//! - Instance ids are monotonically unique for the registry's lifetime.
//! - After `destroy` every operation fails with `SystemTornDown`.
//!
//! The runtime environment (host surface, document provider, memory gauge)
//! is configured once per registry; the optional process-global registry
//! wraps exactly one environment.

use std::sync::{Mutex, MutexGuard, OnceLock};

use ahash::AHashMap;
use core_dom::HostSurface;
use core_events::InstanceId;
use core_pool::{MemoryGauge, NoopGauge};
use core_provider::DocumentProvider;
use std::sync::Arc;
use tracing::{debug, info};

use crate::RegistryError;
use crate::instance::{InstanceHandle, ViewerInstance};
use crate::options::{LoadOptions, ViewerFileConfig, load_defaults_from};

/// Host-side collaborators, configured once.
#[derive(Clone)]
pub struct Environment {
    pub surface: HostSurface,
    pub provider: Arc<dyn DocumentProvider>,
    pub gauge: Arc<dyn MemoryGauge>,
}

impl Environment {
    pub fn new(surface: HostSurface, provider: Arc<dyn DocumentProvider>) -> Self {
        Self {
            surface,
            provider,
            gauge: Arc::new(NoopGauge),
        }
    }

    pub fn with_gauge(mut self, gauge: Arc<dyn MemoryGauge>) -> Self {
        self.gauge = gauge;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_instances: usize,
    pub next_instance_id: u64,
    pub torn_down: bool,
}

#[derive(Default)]
struct RegState {
    instances: AHashMap<u64, InstanceHandle>,
    containers: AHashMap<String, u64>,
    next_id: u64,
    torn_down: bool,
}

pub struct Registry {
    env: Environment,
    defaults: ViewerFileConfig,
    state: Mutex<RegState>,
}

impl Registry {
    pub fn new(env: Environment) -> Self {
        Self::with_defaults(env, load_defaults_from(None))
    }

    pub fn with_defaults(env: Environment, defaults: ViewerFileConfig) -> Self {
        Self {
            env,
            defaults,
            state: Mutex::new(RegState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a viewer for `options.container_id`.
    pub async fn load(&self, options: LoadOptions) -> Result<InstanceHandle, RegistryError> {
        let container_id = options.container_id.clone();
        let id = {
            let mut state = self.lock();
            if state.torn_down {
                return Err(RegistryError::SystemTornDown);
            }
            if state.containers.contains_key(&container_id) {
                return Err(RegistryError::ContainerBusy(container_id));
            }
            state.next_id += 1;
            let id = state.next_id;
            // Reserve the container for the whole boot.
            state.containers.insert(container_id.clone(), id);
            id
        };

        match ViewerInstance::boot(&self.env, InstanceId(id), options, &self.defaults).await {
            Ok(instance) => {
                let handle = InstanceHandle::new(instance);
                let mut state = self.lock();
                if state.torn_down {
                    // Torn down while booting: the viewer must not outlive
                    // the system.
                    state.containers.remove(&container_id);
                    drop(state);
                    handle.destroy();
                    return Err(RegistryError::SystemTornDown);
                }
                state.instances.insert(id, handle.clone());
                info!(target: "registry", instance = id, container = container_id.as_str(), "instance_registered");
                Ok(handle)
            }
            Err(error) => {
                self.lock().containers.remove(&container_id);
                Err(RegistryError::Load(error))
            }
        }
    }

    pub fn get_by_instance(&self, id: u64) -> Result<InstanceHandle, RegistryError> {
        let state = self.lock();
        if state.torn_down {
            return Err(RegistryError::SystemTornDown);
        }
        state
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("instance {id}")))
    }

    pub fn get_by_container(&self, container_id: &str) -> Result<InstanceHandle, RegistryError> {
        let state = self.lock();
        if state.torn_down {
            return Err(RegistryError::SystemTornDown);
        }
        state
            .containers
            .get(container_id)
            .and_then(|id| state.instances.get(id))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("container {container_id:?}")))
    }

    pub fn get_all(&self) -> Vec<InstanceHandle> {
        let state = self.lock();
        let mut handles: Vec<InstanceHandle> = state.instances.values().cloned().collect();
        handles.sort_by_key(|h| h.instance_id());
        handles
    }

    pub fn unload(&self, id: u64) -> Result<(), RegistryError> {
        let handle = {
            let mut state = self.lock();
            if state.torn_down {
                return Err(RegistryError::SystemTornDown);
            }
            let handle = state
                .instances
                .remove(&id)
                .ok_or_else(|| RegistryError::NotFound(format!("instance {id}")))?;
            state.containers.retain(|_, mapped| *mapped != id);
            handle
        };
        handle.destroy();
        debug!(target: "registry", instance = id, "instance_unloaded");
        Ok(())
    }

    pub fn unload_by_container(&self, container_id: &str) -> Result<(), RegistryError> {
        let id = {
            let state = self.lock();
            if state.torn_down {
                return Err(RegistryError::SystemTornDown);
            }
            state.containers.get(container_id).copied().ok_or_else(|| {
                RegistryError::NotFound(format!("container {container_id:?}"))
            })?
        };
        self.unload(id)
    }

    /// Destroy every live instance. The registry stays usable.
    pub fn unload_all(&self) {
        let handles: Vec<InstanceHandle> = {
            let mut state = self.lock();
            state.containers.clear();
            state.instances.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.destroy();
        }
    }

    /// Global teardown: destroy everything and refuse further use.
    pub fn destroy(&self) {
        {
            let mut state = self.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
        }
        let handles: Vec<InstanceHandle> = {
            let mut state = self.lock();
            state.containers.clear();
            state.instances.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.destroy();
        }
        info!(target: "registry", "registry_destroyed");
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        RegistryStats {
            active_instances: state.instances.len(),
            next_instance_id: state.next_id + 1,
            torn_down: state.torn_down,
        }
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Configure the process-global registry. The first call wins; later calls
/// return the existing registry unchanged.
pub fn init_global(env: Environment) -> &'static Registry {
    GLOBAL.get_or_init(|| Registry::new(env))
}

pub fn global() -> Option<&'static Registry> {
    GLOBAL.get()
}
