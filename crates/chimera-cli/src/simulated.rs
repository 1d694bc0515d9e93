//! Simulated kernel modules for the host loop.
//!
//! Nothing here touches real hardware: drivers "connect" by sleeping for
//! their configured latency and subsystems keep their options in memory.
//! Each module owns its status and moves it itself, as the manager expects.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chimera_kernel::module::{Driver, Subsystem, SubsystemOptions};
use chimera_kernel::{
    Domain, KernelError, KernelModule, ModuleDescriptor, ModulePriority, ModuleStatus, Result,
};

// ---------------------------------------------------------------------------
// Status cell
// ---------------------------------------------------------------------------

/// Interior-mutable status shared by the simulated modules.
struct StatusCell(Mutex<ModuleStatus>);

impl StatusCell {
    fn new() -> Self {
        Self(Mutex::new(ModuleStatus::Loading))
    }

    fn get(&self) -> ModuleStatus {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set(&self, status: ModuleStatus) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// A device driver whose connection takes `latency` to come up.
pub struct SimulatedDriver {
    descriptor: ModuleDescriptor,
    hardware_id: String,
    driver_type: String,
    latency: Duration,
    status: StatusCell,
    /// Fail the next `connect()` once.
    fail_next_connect: AtomicBool,
    interrupts: AtomicU64,
}

impl SimulatedDriver {
    pub fn new(
        descriptor: ModuleDescriptor,
        hardware_id: impl Into<String>,
        driver_type: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            descriptor,
            hardware_id: hardware_id.into(),
            driver_type: driver_type.into(),
            latency,
            status: StatusCell::new(),
            fail_next_connect: AtomicBool::new(false),
            interrupts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn flaky(self) -> Self {
        self.fail_next_connect.store(true, Ordering::Relaxed);
        self
    }

    pub fn interrupts_handled(&self) -> u64 {
        self.interrupts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KernelModule for SimulatedDriver {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ModuleStatus {
        self.status.get()
    }

    async fn load(&self) -> Result<()> {
        self.status.set(ModuleStatus::Loading);
        match self.connect().await {
            Ok(()) => {
                self.status.set(ModuleStatus::Active);
                Ok(())
            }
            Err(e) => {
                self.status.set(ModuleStatus::Error);
                Err(e)
            }
        }
    }

    fn unload(&self) -> Result<()> {
        self.status.set(ModuleStatus::Standby);
        Ok(())
    }

    fn as_driver(&self) -> Option<&dyn Driver> {
        Some(self)
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    fn driver_type(&self) -> &str {
        &self.driver_type
    }

    async fn connect(&self) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        if self.fail_next_connect.swap(false, Ordering::Relaxed) {
            return Err(KernelError::module_failed(
                self.id(),
                "connect",
                format!("device {} did not answer", self.hardware_id),
            ));
        }
        tracing::debug!(module_id = %self.id(), hardware_id = %self.hardware_id, "device connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.status.set(ModuleStatus::Standby);
        Ok(())
    }

    fn handle_interrupt(&self, irq: u32) -> Result<()> {
        if self.status.get() != ModuleStatus::Active {
            return Err(KernelError::module_failed(
                self.id(),
                "handle_interrupt",
                format!("irq {irq} raised while driver is not active"),
            ));
        }
        self.interrupts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(module_id = %self.id(), irq, "interrupt handled");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Subsystem
// ---------------------------------------------------------------------------

/// A subsystem hosting one OS domain's personality.
pub struct SimulatedSubsystem {
    descriptor: ModuleDescriptor,
    subsystem_type: String,
    domain: Domain,
    status: StatusCell,
    options: Mutex<SubsystemOptions>,
}

impl SimulatedSubsystem {
    pub fn new(descriptor: ModuleDescriptor, subsystem_type: impl Into<String>, domain: Domain) -> Self {
        Self {
            descriptor,
            subsystem_type: subsystem_type.into(),
            domain,
            status: StatusCell::new(),
            options: Mutex::new(SubsystemOptions::new()),
        }
    }

    /// Which scheduling domain this subsystem's tasks belong to.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Value of a configured option, if set.
    pub fn option(&self, key: &str) -> Option<serde_json::Value> {
        self.options
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl KernelModule for SimulatedSubsystem {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ModuleStatus {
        self.status.get()
    }

    async fn load(&self) -> Result<()> {
        self.initialize().await
    }

    fn unload(&self) -> Result<()> {
        self.status.set(ModuleStatus::Standby);
        Ok(())
    }

    fn as_subsystem(&self) -> Option<&dyn Subsystem> {
        Some(self)
    }
}

#[async_trait]
impl Subsystem for SimulatedSubsystem {
    fn subsystem_type(&self) -> &str {
        &self.subsystem_type
    }

    async fn initialize(&self) -> Result<()> {
        tokio::task::yield_now().await;
        self.status.set(ModuleStatus::Active);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.status.set(ModuleStatus::Standby);
        Ok(())
    }

    fn configure(&self, options: &SubsystemOptions) -> Result<()> {
        let mut current = self.options.lock().unwrap_or_else(|p| p.into_inner());
        for (key, value) in options {
            current.insert(key.clone(), value.clone());
        }
        tracing::debug!(module_id = %self.id(), keys = options.len(), "subsystem configured");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The simulated machine: drivers plus one subsystem per domain.
pub struct Catalog {
    pub drivers: Vec<Arc<SimulatedDriver>>,
    pub subsystems: Vec<Arc<SimulatedSubsystem>>,
}

impl Catalog {
    pub fn build(flaky_network: bool) -> Self {
        let timer = SimulatedDriver::new(
            ModuleDescriptor::new("timer", "Programmable Interval Timer", "1.0.0", ModulePriority::Critical),
            "isa:pit",
            "timer",
            Duration::from_millis(1),
        );
        let storage = SimulatedDriver::new(
            ModuleDescriptor::new("nvme", "NVMe Storage", "2.4.1", ModulePriority::Driver).depends_on("timer"),
            "pci:144d:a808",
            "storage",
            Duration::from_millis(15),
        );
        let mut network = SimulatedDriver::new(
            ModuleDescriptor::new("wifi", "Wi-Fi Adapter", "5.2.0", ModulePriority::Driver).depends_on("timer"),
            "pci:8086:2723",
            "network",
            Duration::from_millis(25),
        );
        if flaky_network {
            network = network.flaky();
        }

        let kernel = SimulatedSubsystem::new(
            ModuleDescriptor::new("chimera-core", "Chimera Core Services", "0.9.0", ModulePriority::System)
                .depends_on("timer")
                .depends_on("nvme"),
            "chimera",
            Domain::Native,
        );
        let windows = SimulatedSubsystem::new(
            ModuleDescriptor::new("win32", "Windows Personality", "10.0.0", ModulePriority::Service)
                .depends_on("chimera-core"),
            "windows",
            Domain::GuestA,
        );
        let linux = SimulatedSubsystem::new(
            ModuleDescriptor::new("posix", "Linux Personality", "6.1.0", ModulePriority::Service)
                .depends_on("chimera-core")
                .depends_on("wifi"),
            "linux",
            Domain::GuestB,
        );

        Self {
            drivers: vec![Arc::new(timer), Arc::new(storage), Arc::new(network)],
            subsystems: vec![Arc::new(kernel), Arc::new(windows), Arc::new(linux)],
        }
    }

    /// Every module, drivers first, as registry handles.
    pub fn modules(&self) -> Vec<Arc<dyn KernelModule>> {
        let drivers = self
            .drivers
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn KernelModule>);
        let subsystems = self
            .subsystems
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn KernelModule>);
        drivers.chain(subsystems).collect()
    }
}

/// Registry handles for the simulated machine.
pub fn catalog(flaky_network: bool) -> Vec<Arc<dyn KernelModule>> {
    Catalog::build(flaky_network).modules()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flaky_driver_fails_once_then_recovers() {
        let driver = SimulatedDriver::new(
            ModuleDescriptor::new("wifi", "Wi-Fi", "1.0.0", ModulePriority::Driver),
            "pci:0000:0000",
            "network",
            Duration::ZERO,
        )
        .flaky();

        assert!(driver.load().await.is_err());
        assert_eq!(driver.status(), ModuleStatus::Error);
        assert!(driver.handle_interrupt(11).is_err());

        driver.restart().await.expect("second attempt connects");
        assert_eq!(driver.status(), ModuleStatus::Active);
        driver.handle_interrupt(11).expect("active driver handles irq");
        assert_eq!(driver.interrupts_handled(), 1);
    }

    #[test]
    fn subsystem_merges_options() {
        let subsystem = SimulatedSubsystem::new(
            ModuleDescriptor::new("win32", "Windows", "10.0.0", ModulePriority::Service),
            "windows",
            Domain::GuestA,
        );
        let mut options = SubsystemOptions::new();
        options.insert("dpi".into(), serde_json::json!(96));
        subsystem.configure(&options).unwrap();
        options.insert("dpi".into(), serde_json::json!(144));
        subsystem.configure(&options).unwrap();
        assert_eq!(subsystem.option("dpi"), Some(serde_json::json!(144)));
    }

    #[test]
    fn catalog_lists_every_module_once() {
        let modules = catalog(false);
        assert_eq!(modules.len(), 6);
        let mut ids: Vec<_> = modules.iter().map(|m| m.id().to_owned()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }
}
