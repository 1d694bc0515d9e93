//! Kernel module registry and lifecycle manager.
//!
//! The manager keeps the set of registered modules in registration order and
//! brokers their `load`/`unload`/`restart` calls.  It does not construct
//! modules and does not assign status: after every lifecycle call it reads
//! back what the module reports about itself.
//!
//! Routine conditions are values, not errors: an unknown id, a duplicate
//! registration, or a module whose own `load()` fails all come back as
//! `false` (and are logged).
//!
//! Dependencies are metadata unless [`ModuleConfig::enforce_dependencies`]
//! is set.  In that mode a module cannot be registered before its
//! dependencies and cannot be loaded until all of them are `Active`.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use chimera_kernel::module::KernelModule;
//! # use chimera_kernel::manager::ModuleManager;
//! # async fn example(net: Arc<dyn KernelModule>) {
//! let manager = ModuleManager::new();
//! assert!(manager.register_module(net));
//!
//! let report = manager.load_all().await.expect("acyclic dependencies");
//! println!("{} modules active", manager.get_active_modules().len());
//! # let _ = report;
//! # }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::config::ModuleConfig;
use crate::error::{KernelError, Result};
use crate::ipc::{Event, IpcBus};
use crate::module::{KernelModule, ModuleInfo, ModulePriority, ModuleStatus};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Outcome of [`ModuleManager::load_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Modules whose `load()` succeeded, in load order.
    pub loaded: Vec<String>,
    /// Modules that failed or were refused, in load order.
    pub failed: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct RegisteredModule {
    /// Registration sequence number.
    seq: u64,
    module: Arc<dyn KernelModule>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Registry of kernel modules.
///
/// Cheaply cloneable (`Arc`-backed).  Map guards are never held across a
/// module's `load()`, so a hung module only blocks the caller awaiting it.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    modules: DashMap<String, RegisteredModule>,
    next_seq: AtomicU64,
    config: ModuleConfig,
    bus: Option<IpcBus>,
}

impl ModuleManager {
    /// Create a permissive manager with no event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ModuleConfig::default(), None)
    }

    #[must_use]
    pub fn with_config(config: ModuleConfig, bus: Option<IpcBus>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                modules: DashMap::new(),
                next_seq: AtomicU64::new(0),
                config,
                bus,
            }),
        }
    }

    /// Add a module to the registry.
    ///
    /// Returns `false` if a module with the same id is already registered
    /// (the existing one is kept), or, with dependency enforcement, if one
    /// of its dependencies is not registered yet.
    pub fn register_module(&self, module: Arc<dyn KernelModule>) -> bool {
        let id = module.id().to_owned();

        if self.inner.config.enforce_dependencies {
            let missing = module
                .descriptor()
                .dependencies
                .iter()
                .find(|dep| !self.inner.modules.contains_key(dep.as_str()))
                .cloned();
            if let Some(dependency) = missing {
                tracing::warn!(
                    module_id = %id,
                    dependency = %dependency,
                    "module rejected: dependency not registered"
                );
                return false;
            }
        }

        match self.inner.modules.entry(id.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(module_id = %id, "module already registered");
                return false;
            }
            Entry::Vacant(slot) => {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(RegisteredModule { seq, module });
            }
        }

        tracing::info!(module_id = %id, "module registered");
        self.publish(Event::ModuleRegistered { module_id: id });
        true
    }

    /// Run a module's `load()` and report whether it succeeded.
    ///
    /// Unknown ids, failures raised by the module, and (with dependency
    /// enforcement) dependencies that are not `Active` all yield `false`.
    /// The module's status is left exactly as the module set it.
    pub async fn load_module(&self, id: &str) -> bool {
        let Some(module) = self.module(id) else {
            tracing::warn!(module_id = %id, "load requested for unknown module");
            return false;
        };

        if !self.dependencies_ready(module.as_ref(), "load") {
            return false;
        }

        let before = module.status();
        tracing::debug!(module_id = %id, "loading module");
        let result = module.load().await;
        self.finish(module.as_ref(), "load", before, result)
    }

    /// Run a module's `unload()` and report whether it succeeded.
    ///
    /// The module stays registered whatever the outcome.
    pub fn unload_module(&self, id: &str) -> bool {
        let Some(module) = self.module(id) else {
            tracing::warn!(module_id = %id, "unload requested for unknown module");
            return false;
        };

        let before = module.status();
        let result = module.unload();
        self.finish(module.as_ref(), "unload", before, result)
    }

    /// Run a module's own `restart()` capability.
    ///
    /// Same refusal rules as [`load_module`](Self::load_module).
    pub async fn restart_module(&self, id: &str) -> bool {
        let Some(module) = self.module(id) else {
            tracing::warn!(module_id = %id, "restart requested for unknown module");
            return false;
        };

        if !self.dependencies_ready(module.as_ref(), "restart") {
            return false;
        }

        let before = module.status();
        let result = module.restart().await;
        self.finish(module.as_ref(), "restart", before, result)
    }

    /// Snapshot of every registered module in registration order.
    pub fn get_modules(&self) -> Vec<ModuleInfo> {
        self.ordered_modules()
            .iter()
            .map(|module| ModuleInfo::capture(module.as_ref()))
            .collect()
    }

    /// Snapshot of the modules currently reporting `Active`, in registration
    /// order.
    pub fn get_active_modules(&self) -> Vec<ModuleInfo> {
        self.get_modules()
            .into_iter()
            .filter(|info| info.status == ModuleStatus::Active)
            .collect()
    }

    /// Look up a module handle.  Use [`KernelModule::as_driver`] or
    /// [`KernelModule::as_subsystem`] to reach variant capabilities.
    pub fn module(&self, id: &str) -> Option<Arc<dyn KernelModule>> {
        self.inner
            .modules
            .get(id)
            .map(|entry| Arc::clone(&entry.module))
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.modules.contains_key(id)
    }

    pub fn module_count(&self) -> usize {
        self.inner.modules.len()
    }

    /// Order in which the registered modules can be loaded so that every
    /// module comes after its dependencies.
    ///
    /// Among modules whose dependencies are already placed, the most
    /// important [`ModulePriority`] goes first, then registration order.
    pub fn load_order(&self) -> Result<Vec<String>> {
        let modules = self.ordered_modules();

        // (priority, registration index) of modules with no pending deps.
        let mut ready: BTreeSet<(ModulePriority, usize)> = BTreeSet::new();
        let mut pending: HashMap<&str, usize> = HashMap::new();
        let mut dependants: HashMap<&str, Vec<usize>> = HashMap::new();

        for (index, module) in modules.iter().enumerate() {
            let descriptor = module.descriptor();
            let deps: BTreeSet<&str> = descriptor.dependencies.iter().map(String::as_str).collect();

            for dep in &deps {
                if !self.inner.modules.contains_key(*dep) {
                    return Err(KernelError::MissingDependency {
                        module_id: descriptor.id.clone(),
                        dependency: (*dep).to_owned(),
                    });
                }
                dependants.entry(*dep).or_default().push(index);
            }

            if deps.is_empty() {
                ready.insert((descriptor.priority, index));
            }
            pending.insert(descriptor.id.as_str(), deps.len());
        }

        let mut order = Vec::with_capacity(modules.len());
        while let Some((_, index)) = ready.pop_first() {
            let id = modules[index].id();
            order.push(id.to_owned());

            for &dependant in dependants.get(id).map(Vec::as_slice).unwrap_or_default() {
                let dependant_id = modules[dependant].id();
                if let Some(count) = pending.get_mut(dependant_id) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert((modules[dependant].descriptor().priority, dependant));
                    }
                }
            }
        }

        if order.len() < modules.len() {
            let stuck = modules
                .iter()
                .map(|module| module.id().to_owned())
                .filter(|id| !order.contains(id))
                .collect();
            return Err(KernelError::DependencyCycle { modules: stuck });
        }

        Ok(order)
    }

    /// Load every registered module, one at a time, in [`load_order`]
    /// sequence.
    ///
    /// [`load_order`]: Self::load_order
    pub async fn load_all(&self) -> Result<LoadReport> {
        let order = self.load_order()?;
        let mut report = LoadReport::default();

        for id in order {
            if self.load_module(&id).await {
                report.loaded.push(id);
            } else {
                report.failed.push(id);
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "module load pass finished"
        );
        Ok(report)
    }

    // -- Private helpers ----------------------------------------------------

    fn ordered_modules(&self) -> Vec<Arc<dyn KernelModule>> {
        let mut entries: Vec<(u64, Arc<dyn KernelModule>)> = self
            .inner
            .modules
            .iter()
            .map(|entry| (entry.seq, Arc::clone(&entry.module)))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, module)| module).collect()
    }

    /// With dependency enforcement, check that every dependency is `Active`.
    fn dependencies_ready(&self, module: &dyn KernelModule, operation: &'static str) -> bool {
        if !self.inner.config.enforce_dependencies {
            return true;
        }

        let inactive: Vec<&String> = module
            .descriptor()
            .dependencies
            .iter()
            .filter(|dep| {
                self.module(dep)
                    .is_none_or(|m| m.status() != ModuleStatus::Active)
            })
            .collect();

        if inactive.is_empty() {
            return true;
        }
        tracing::warn!(
            module_id = %module.id(),
            operation,
            dependencies = ?inactive,
            "module operation refused: dependencies not active"
        );
        false
    }

    /// Log and publish the outcome of a lifecycle call.
    fn finish(
        &self,
        module: &dyn KernelModule,
        operation: &'static str,
        before: ModuleStatus,
        result: Result<()>,
    ) -> bool {
        let id = module.id();
        let after = module.status();

        if before != after {
            self.publish(Event::ModuleStatusChanged {
                module_id: id.to_owned(),
                old_status: before,
                new_status: after,
                timestamp: Utc::now(),
            });
        }

        match result {
            Ok(()) => {
                tracing::info!(module_id = %id, operation, status = %after, "module operation succeeded");
                true
            }
            Err(err) => {
                tracing::error!(
                    module_id = %id,
                    operation,
                    status = %after,
                    error = %err,
                    "module operation failed"
                );
                self.publish(Event::ModuleOperationFailed {
                    module_id: id.to_owned(),
                    operation: operation.to_owned(),
                    reason: err.to_string(),
                    timestamp: Utc::now(),
                });
                false
            }
        }
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.inner.bus {
            bus.publish(event);
        }
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
