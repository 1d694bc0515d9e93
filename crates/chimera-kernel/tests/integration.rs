//! Integration tests for the chimera-kernel crate.
//!
//! These tests drive the scheduler, module manager and event bus together
//! the way a host main loop does.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chimera_kernel::config::{ModuleConfig, SchedulerConfig};
use chimera_kernel::{
    Domain, Event, HybridScheduler, IpcBus, KernelError, KernelModule, ModuleDescriptor,
    ModuleKind, ModuleManager, ModulePriority, ModuleStatus, NewTask, Result, Subsystem,
    SubsystemOptions, TaskState,
};
use tokio::sync::Notify;

// ═══════════════════════════════════════════════════════════════════════
//  Test modules
// ═══════════════════════════════════════════════════════════════════════

/// Guest OS personality that spawns work once initialized.
struct GuestPersonality {
    descriptor: ModuleDescriptor,
    flavor: &'static str,
    status: Mutex<ModuleStatus>,
    options: Mutex<SubsystemOptions>,
    fail_first_load: Mutex<bool>,
}

impl GuestPersonality {
    fn new(id: &str, flavor: &'static str) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(id, format!("{flavor} personality"), "1.0.0", ModulePriority::System)
                .depends_on("hal"),
            flavor,
            status: Mutex::new(ModuleStatus::Loading),
            options: Mutex::new(HashMap::new()),
            fail_first_load: Mutex::new(false),
        }
    }

    fn set_status(&self, status: ModuleStatus) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl KernelModule for GuestPersonality {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ModuleStatus {
        *self.status.lock().unwrap()
    }

    async fn load(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fail = std::mem::replace(&mut *self.fail_first_load.lock().unwrap(), false);
        if fail {
            self.set_status(ModuleStatus::Error);
            return Err(KernelError::module_failed(self.id(), "load", "boot image missing"));
        }
        self.initialize().await
    }

    fn unload(&self) -> Result<()> {
        self.set_status(ModuleStatus::Standby);
        Ok(())
    }

    fn as_subsystem(&self) -> Option<&dyn Subsystem> {
        Some(self)
    }
}

#[async_trait]
impl Subsystem for GuestPersonality {
    fn subsystem_type(&self) -> &str {
        self.flavor
    }

    async fn initialize(&self) -> Result<()> {
        self.set_status(ModuleStatus::Active);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.set_status(ModuleStatus::Standby);
        Ok(())
    }

    fn configure(&self, options: &SubsystemOptions) -> Result<()> {
        self.options.lock().unwrap().extend(options.clone());
        Ok(())
    }
}

/// Hardware abstraction layer; always comes up.
struct Hal {
    descriptor: ModuleDescriptor,
    status: Mutex<ModuleStatus>,
}

impl Hal {
    fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::new("hal", "Hardware Abstraction Layer", "3.1.0", ModulePriority::Critical),
            status: Mutex::new(ModuleStatus::Loading),
        }
    }
}

#[async_trait]
impl KernelModule for Hal {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ModuleStatus {
        *self.status.lock().unwrap()
    }

    async fn load(&self) -> Result<()> {
        *self.status.lock().unwrap() = ModuleStatus::Active;
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        *self.status.lock().unwrap() = ModuleStatus::Standby;
        Ok(())
    }
}

/// Module whose `load()` parks until the test opens the gate.
struct GatedModule {
    descriptor: ModuleDescriptor,
    status: Mutex<ModuleStatus>,
    entered: AtomicBool,
    gate: Notify,
}

impl GatedModule {
    fn new(id: &str) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(id, "Firmware Loader", "0.3.0", ModulePriority::Driver),
            status: Mutex::new(ModuleStatus::Loading),
            entered: AtomicBool::new(false),
            gate: Notify::new(),
        }
    }
}

#[async_trait]
impl KernelModule for GatedModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn status(&self) -> ModuleStatus {
        *self.status.lock().unwrap()
    }

    async fn load(&self) -> Result<()> {
        self.entered.store(true, Ordering::SeqCst);
        self.gate.notified().await;
        *self.status.lock().unwrap() = ModuleStatus::Active;
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        *self.status.lock().unwrap() = ModuleStatus::Standby;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Module manager integration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn boot_sequence_loads_in_dependency_order() {
    let manager = ModuleManager::with_config(
        ModuleConfig {
            enforce_dependencies: true,
        },
        None,
    );

    assert!(manager.register_module(Arc::new(Hal::new())));
    assert!(manager.register_module(Arc::new(GuestPersonality::new("win32", "windows"))));
    assert!(manager.register_module(Arc::new(GuestPersonality::new("posix", "linux"))));

    let order = manager.load_order().unwrap();
    assert_eq!(order, ["hal", "win32", "posix"]);

    let report = manager.load_all().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(manager.get_active_modules().len(), 3);

    let kinds: Vec<_> = manager.get_modules().into_iter().map(|m| m.kind).collect();
    assert_eq!(kinds[0], ModuleKind::Generic);
    assert_eq!(
        kinds[1],
        ModuleKind::Subsystem {
            subsystem_type: "windows".into()
        }
    );
}

#[tokio::test]
async fn failed_load_then_restart_recovers() {
    let manager = ModuleManager::new();
    let posix = Arc::new(GuestPersonality::new("posix", "linux"));
    *posix.fail_first_load.lock().unwrap() = true;

    manager.register_module(Arc::new(Hal::new()));
    manager.register_module(posix.clone());

    assert!(manager.load_module("hal").await);
    assert!(!manager.load_module("posix").await);
    assert_eq!(posix.status(), ModuleStatus::Error);

    assert!(manager.restart_module("posix").await);
    assert_eq!(posix.status(), ModuleStatus::Active);
}

#[tokio::test]
async fn subsystem_configuration_through_registry_handle() {
    let manager = ModuleManager::new();
    manager.register_module(Arc::new(GuestPersonality::new("win32", "windows")));

    let module = manager.module("win32").unwrap();
    let subsystem = module.as_subsystem().unwrap();

    let mut options = SubsystemOptions::new();
    options.insert("dpi".into(), serde_json::json!(144));
    subsystem.configure(&options).unwrap();
    assert_eq!(subsystem.subsystem_type(), "windows");
}

#[tokio::test]
async fn duplicate_and_missing_modules_are_values_not_errors() {
    let manager = ModuleManager::new();
    assert!(manager.register_module(Arc::new(Hal::new())));
    assert!(!manager.register_module(Arc::new(Hal::new())));
    assert_eq!(manager.module_count(), 1);

    assert!(!manager.load_module("missing").await);
    assert!(!manager.unload_module("missing"));
}

#[tokio::test]
async fn hung_load_blocks_only_its_caller() {
    let manager = ModuleManager::new();
    let firmware = Arc::new(GatedModule::new("firmware"));
    manager.register_module(firmware.clone());
    manager.register_module(Arc::new(Hal::new()));

    let loader = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load_module("firmware").await })
    };

    // Let the spawned task run until it is parked inside `load()`.
    while !firmware.entered.load(Ordering::SeqCst) {
        tokio::task::yield_now().await;
    }
    assert!(!loader.is_finished());

    // The registry stays usable while that load is in flight.
    let snapshot = manager.get_modules();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].status, ModuleStatus::Loading);
    assert!(manager.load_module("hal").await);
    let active: Vec<_> = manager.get_active_modules().into_iter().map(|m| m.id).collect();
    assert_eq!(active, ["hal"]);

    firmware.gate.notify_one();
    assert!(loader.await.unwrap());
    assert_eq!(manager.get_active_modules().len(), 2);
}

// ═══════════════════════════════════════════════════════════════════════
//  Scheduler integration
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn host_loop_runs_every_task_to_completion() {
    let scheduler = HybridScheduler::with_config(
        SchedulerConfig {
            rng_seed: Some(9),
            strict_transitions: true,
            ..SchedulerConfig::default()
        },
        None,
    );

    for i in 0..5 {
        scheduler.register_task(NewTask::new(format!("win-{i}"), Domain::GuestA, 40 + i));
        scheduler.register_task(NewTask::new(format!("linux-{i}"), Domain::GuestB, 60 - i));
    }
    scheduler.register_task(NewTask::new("pager", Domain::Native, 10));

    let mut executed = Vec::new();
    while let Some(task) = scheduler.get_next_task() {
        assert!(scheduler.update_task_state(task.id, TaskState::Running));
        executed.push(task.domain);
        assert!(scheduler.update_task_state(task.id, TaskState::Terminated));
    }

    assert_eq!(executed.len(), 11);
    assert_eq!(executed[0], Domain::Native);
    assert_eq!(scheduler.ready_count(), 0);

    // Terminated tasks are retained until the host compacts.
    assert_eq!(scheduler.task_count(), 11);
    assert_eq!(scheduler.purge_terminated(), 11);
    assert_eq!(scheduler.task_count(), 0);
}

#[test]
fn guest_frequency_converges_to_ratio() {
    let scheduler = HybridScheduler::with_config(
        SchedulerConfig {
            rng_seed: Some(2024),
            ..SchedulerConfig::default()
        },
        None,
    );
    scheduler.register_task(NewTask::new("win", Domain::GuestA, 10));
    scheduler.register_task(NewTask::new("linux", Domain::GuestB, 90));
    scheduler.adjust_os_ratio(Some(0.7));

    let rounds = 5_000;
    for _ in 0..rounds {
        scheduler.get_next_task().unwrap();
    }

    let stats = scheduler.stats();
    assert_eq!(stats.guest_a_selections + stats.guest_b_selections, rounds);
    let frequency = stats.guest_a_selections as f64 / rounds as f64;
    assert!((frequency - 0.7).abs() < 0.05, "frequency was {frequency}");
}

#[test]
fn automatic_adjustment_is_always_in_band() {
    let scheduler = HybridScheduler::new();
    assert_eq!(scheduler.adjust_os_ratio(Some(0.9)), 0.7);

    scheduler.register_task(NewTask::new("win", Domain::GuestA, 95));
    scheduler.register_task(NewTask::new("linux", Domain::GuestB, 5));
    let ratio = scheduler.adjust_os_ratio(None);
    assert!((0.3..=0.7).contains(&ratio));
}

#[tokio::test]
async fn scheduler_events_reach_subscribers() {
    let bus = IpcBus::new(32);
    let mut rx = bus.subscribe();
    let scheduler = HybridScheduler::with_config(SchedulerConfig::default(), Some(bus));

    let id = scheduler.register_task(NewTask::new("compositor", Domain::Native, 70));
    scheduler.update_task_state(id, TaskState::Running);
    scheduler.adjust_os_ratio(Some(0.6));

    match rx.recv().await.unwrap().as_ref() {
        Event::TaskRegistered { task_id, domain, .. } => {
            assert_eq!(*task_id, id);
            assert_eq!(*domain, Domain::Native);
        }
        other => panic!("expected TaskRegistered, got {other:?}"),
    }
    match rx.recv().await.unwrap().as_ref() {
        Event::TaskStateChanged {
            old_state,
            new_state,
            ..
        } => {
            assert_eq!(*old_state, TaskState::Ready);
            assert_eq!(*new_state, TaskState::Running);
        }
        other => panic!("expected TaskStateChanged, got {other:?}"),
    }
    match rx.recv().await.unwrap().as_ref() {
        Event::GuestRatioAdjusted {
            new_ratio,
            automatic,
            ..
        } => {
            assert_eq!(*new_ratio, 0.6);
            assert!(!automatic);
        }
        other => panic!("expected GuestRatioAdjusted, got {other:?}"),
    }
}

#[test]
fn unknown_ids_are_reported_as_false() {
    let scheduler = HybridScheduler::new();
    assert!(!scheduler.update_task_state(uuid::Uuid::now_v7(), TaskState::Running));
    assert!(scheduler.task(uuid::Uuid::now_v7()).is_none());
}
