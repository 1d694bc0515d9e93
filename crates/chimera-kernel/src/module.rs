//! Kernel module capability traits and supporting types.
//!
//! Every module (driver or subsystem) implements [`KernelModule`].  The
//! [`ModuleManager`](crate::manager::ModuleManager) never constructs modules
//! and never decides their status: it sequences their lifecycle calls and
//! reads back whatever [`KernelModule::status`] reports.  Implementations are
//! therefore responsible for moving their own status through
//! `Loading -> Active | Standby | Error`.
//!
//! Capability methods take `&self`, so implementations keep their mutable
//! state behind interior mutability.  This lets the manager hand out
//! snapshots while a slow `load()` is still in flight.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Self-reported module status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    /// Registered, `load()` not yet completed.
    Loading,
    /// Fully operational.
    Active,
    /// Loaded but idle (e.g. unloaded or waiting for hardware).
    Standby,
    /// Failed.
    Error,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Active => write!(f, "active"),
            Self::Standby => write!(f, "standby"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Importance class of a module.  Ordered most important first, which is
/// also the tie-break order used when computing a load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulePriority {
    Critical,
    System,
    Driver,
    Service,
    Application,
}

/// Metadata shared by every module variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub priority: ModulePriority,
    /// Ids of modules this one depends on, in declaration order.
    pub dependencies: Vec<String>,
}

impl ModuleDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        priority: ModulePriority,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            priority,
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }
}

/// Which capability variant a module implements, with its variant fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleKind {
    Driver {
        hardware_id: String,
        driver_type: String,
    },
    Subsystem {
        subsystem_type: String,
    },
    /// A module exposing neither capability set.
    Generic,
}

/// Serializable snapshot of a registered module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: ModuleStatus,
    pub priority: ModulePriority,
    pub dependencies: Vec<String>,
    pub kind: ModuleKind,
}

impl ModuleInfo {
    /// Capture the current state of `module`.
    pub fn capture(module: &dyn KernelModule) -> Self {
        let descriptor = module.descriptor();
        let kind = if let Some(driver) = module.as_driver() {
            ModuleKind::Driver {
                hardware_id: driver.hardware_id().to_owned(),
                driver_type: driver.driver_type().to_owned(),
            }
        } else if let Some(subsystem) = module.as_subsystem() {
            ModuleKind::Subsystem {
                subsystem_type: subsystem.subsystem_type().to_owned(),
            }
        } else {
            ModuleKind::Generic
        };

        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            status: module.status(),
            priority: descriptor.priority,
            dependencies: descriptor.dependencies.clone(),
            kind,
        }
    }
}

/// Options passed to [`Subsystem::configure`].
pub type SubsystemOptions = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// The lifecycle contract every kernel module honors.
#[async_trait]
pub trait KernelModule: Send + Sync {
    /// Identity and dependency metadata.
    fn descriptor(&self) -> &ModuleDescriptor;

    /// The module's own view of its status.
    fn status(&self) -> ModuleStatus;

    /// Bring the module up.  May suspend (simulated driver I/O).
    async fn load(&self) -> Result<()>;

    /// Take the module down.  Synchronous by contract.
    fn unload(&self) -> Result<()>;

    /// Cycle the module.  Defaults to `unload` followed by `load`.
    async fn restart(&self) -> Result<()> {
        self.unload()?;
        self.load().await
    }

    /// Driver capabilities, if this module is a driver.
    fn as_driver(&self) -> Option<&dyn Driver> {
        None
    }

    /// Subsystem capabilities, if this module is a subsystem.
    fn as_subsystem(&self) -> Option<&dyn Subsystem> {
        None
    }

    fn id(&self) -> &str {
        &self.descriptor().id
    }
}

/// A hardware driver.
#[async_trait]
pub trait Driver: KernelModule {
    fn hardware_id(&self) -> &str;

    /// Driver family (e.g. "network", "storage", "input").
    fn driver_type(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Service an interrupt raised by the device.
    fn handle_interrupt(&self, irq: u32) -> Result<()>;
}

/// A software subsystem (guest OS personality, filesystem layer, ...).
#[async_trait]
pub trait Subsystem: KernelModule {
    /// Subsystem family (e.g. "windows", "linux", "filesystem").
    fn subsystem_type(&self) -> &str;

    async fn initialize(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    fn configure(&self, options: &SubsystemOptions) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Plain {
        descriptor: ModuleDescriptor,
        status: Mutex<ModuleStatus>,
        loads: Mutex<u32>,
    }

    impl Plain {
        fn new() -> Self {
            Self {
                descriptor: ModuleDescriptor::new("timer", "System Timer", "1.0.0", ModulePriority::Critical)
                    .depends_on("clock"),
                status: Mutex::new(ModuleStatus::Loading),
                loads: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl KernelModule for Plain {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }

        fn status(&self) -> ModuleStatus {
            *self.status.lock().unwrap()
        }

        async fn load(&self) -> Result<()> {
            *self.loads.lock().unwrap() += 1;
            *self.status.lock().unwrap() = ModuleStatus::Active;
            Ok(())
        }

        fn unload(&self) -> Result<()> {
            *self.status.lock().unwrap() = ModuleStatus::Standby;
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_restart_unloads_then_loads() {
        let module = Plain::new();
        module.load().await.unwrap();
        module.restart().await.unwrap();
        assert_eq!(module.status(), ModuleStatus::Active);
        assert_eq!(*module.loads.lock().unwrap(), 2);
    }

    #[test]
    fn capture_of_generic_module() {
        let module = Plain::new();
        let info = ModuleInfo::capture(&module);
        assert_eq!(info.id, "timer");
        assert_eq!(info.status, ModuleStatus::Loading);
        assert_eq!(info.dependencies, vec!["clock".to_string()]);
        assert_eq!(info.kind, ModuleKind::Generic);
        assert_eq!(module.id(), "timer");
    }

    #[test]
    fn priority_orders_critical_first() {
        assert!(ModulePriority::Critical < ModulePriority::System);
        assert!(ModulePriority::Service < ModulePriority::Application);
    }

    #[test]
    fn kind_serializes_with_tag() {
        let kind = ModuleKind::Subsystem {
            subsystem_type: "linux".into(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "subsystem");
        assert_eq!(json["subsystem_type"], "linux");
    }
}
