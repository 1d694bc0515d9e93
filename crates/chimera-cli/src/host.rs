//! Host main loop.
//!
//! The host is the only place where "work" happens.  It boots the simulated
//! modules through the [`ModuleManager`], seeds the [`HybridScheduler`] with
//! tasks from every active subsystem, then repeatedly asks for the next
//! task, pretends to run it for one quantum, and reports the outcome back.

use std::collections::HashMap;
use std::sync::Arc;

use chimera_kernel::config::KernelConfig;
use chimera_kernel::module::SubsystemOptions;
use chimera_kernel::{
    CpuAllocation, Domain, Driver, Event, HybridScheduler, IpcBus, KernelModule, ModuleManager,
    ModuleStatus, NewTask, SchedulerStats, TaskId, TaskState,
};

use crate::simulated::{Catalog, SimulatedSubsystem};

/// Interrupt line raised by the timer driver every few ticks.
const TIMER_IRQ: u32 = 0;
/// Ticks between timer interrupts.
const TIMER_PERIOD: u32 = 10;

/// What the host reports after a run.
#[derive(Debug)]
pub struct RunSummary {
    pub total_modules: usize,
    pub active_modules: usize,
    pub failed_modules: Vec<String>,
    pub ticks_executed: u32,
    pub tasks_completed: usize,
    pub stats: SchedulerStats,
    pub final_ratio: f64,
    pub sample_allocation: Option<CpuAllocation>,
    /// Interrupts serviced by the timer driver.
    pub timer_interrupts: u64,
}

/// Remaining simulated work for one task.
struct Workload {
    /// Quanta left before the task terminates.
    remaining: u32,
    /// Block on I/O every `io_every` quanta (0 = never).
    io_every: u32,
    ran: u32,
}

pub struct Host {
    config: KernelConfig,
    catalog: Catalog,
    manager: ModuleManager,
    scheduler: HybridScheduler,
    failed_modules: Vec<String>,
    workloads: HashMap<TaskId, Workload>,
    blocked: Vec<TaskId>,
}

impl Host {
    /// Register and load every simulated module, then seed the scheduler.
    pub async fn boot(config: KernelConfig, flaky_network: bool) -> chimera_kernel::Result<Self> {
        let bus = IpcBus::new(config.ipc.capacity);
        spawn_event_logger(&bus);

        let manager = ModuleManager::with_config(config.modules.clone(), Some(bus.clone()));
        let scheduler = HybridScheduler::with_config(config.scheduler.clone(), Some(bus));

        let catalog = Catalog::build(flaky_network);
        for module in catalog.modules() {
            manager.register_module(module);
        }

        let report = manager.load_all().await?;

        // One retry for anything that failed on the first pass.
        let mut failed_modules = Vec::new();
        for id in &report.failed {
            if manager.restart_module(id).await {
                tracing::info!(module_id = %id, "module recovered after restart");
            } else {
                failed_modules.push(id.clone());
            }
        }

        let mut host = Self {
            config,
            catalog,
            manager,
            scheduler,
            failed_modules,
            workloads: HashMap::new(),
            blocked: Vec::new(),
        };
        host.configure_subsystems();
        host.seed_tasks();
        Ok(host)
    }

    /// Execute up to `ticks` scheduling decisions.
    pub fn run(mut self, ticks: u32) -> RunSummary {
        let ratio_interval = self.config.scheduler.ratio_interval.max(1);
        let sample_allocation = self.sample_allocation();

        let mut executed = 0;
        let mut completed = 0;

        for tick in 1..=ticks {
            if tick % TIMER_PERIOD == 0 {
                self.raise_timer_interrupt();
                self.wake_blocked();
            }
            if tick % ratio_interval == 0 {
                let ratio = self.scheduler.adjust_os_ratio(None);
                tracing::debug!(tick, ratio, "guest ratio recomputed");
            }

            let Some(task) = self.scheduler.get_next_task() else {
                if self.blocked.is_empty() {
                    tracing::info!(tick, "no runnable work left");
                    break;
                }
                self.wake_blocked();
                continue;
            };

            self.scheduler.update_task_state(task.id, TaskState::Running);
            executed += 1;

            let next_state = self.execute_quantum(task.id);
            self.scheduler.update_task_state(task.id, next_state);
            match next_state {
                TaskState::Terminated => completed += 1,
                TaskState::Blocked => self.blocked.push(task.id),
                TaskState::Ready | TaskState::Running => {}
            }
        }

        let purged = self.scheduler.purge_terminated();
        tracing::debug!(purged, "terminated tasks compacted");

        let modules = self.manager.get_modules();
        let timer_interrupts = self.timer_interrupts();
        RunSummary {
            total_modules: modules.len(),
            active_modules: self.manager.get_active_modules().len(),
            failed_modules: self.failed_modules,
            ticks_executed: executed,
            tasks_completed: completed,
            stats: self.scheduler.stats(),
            final_ratio: self.scheduler.guest_ratio(),
            sample_allocation,
            timer_interrupts,
        }
    }

    // -- Private helpers ----------------------------------------------------

    fn active_subsystems(&self) -> Vec<Arc<SimulatedSubsystem>> {
        self.catalog
            .subsystems
            .iter()
            .filter(|s| {
                self.manager
                    .module(s.id())
                    .is_some_and(|m| m.status() == ModuleStatus::Active)
            })
            .cloned()
            .collect()
    }

    fn configure_subsystems(&self) {
        for subsystem in self.active_subsystems() {
            let Some(module) = self.manager.module(subsystem.id()) else {
                continue;
            };
            let Some(handle) = module.as_subsystem() else {
                continue;
            };
            let mut options = SubsystemOptions::new();
            options.insert("domain".into(), serde_json::json!(subsystem.domain()));
            if let Some(quantum_ms) = self.config.scheduler.default_quantum_ms {
                options.insert("quantum_ms".into(), serde_json::json!(quantum_ms));
            }
            if let Err(e) = handle.configure(&options) {
                tracing::warn!(module_id = %subsystem.id(), error = %e, "subsystem configuration failed");
            }
        }
    }

    /// Register a fixed workload for every domain whose subsystem is up.
    fn seed_tasks(&mut self) {
        for subsystem in self.active_subsystems() {
            let domain = subsystem.domain();
            let quantum_ms = subsystem
                .option("quantum_ms")
                .and_then(|value| value.as_u64());
            let plan: &[(&str, i32, u32, u32)] = match domain {
                Domain::Native => &[("pager", 90, 2, 0), ("compositor", 70, 6, 3)],
                Domain::GuestA => &[
                    ("explorer.exe", 60, 12, 4),
                    ("svchost.exe", 40, 8, 0),
                    ("game.exe", 80, 20, 5),
                ],
                Domain::GuestB => &[
                    ("bash", 30, 6, 2),
                    ("cargo", 70, 18, 0),
                    ("sshd", 20, 4, 1),
                ],
            };

            for &(name, priority, quanta, io_every) in plan {
                let mut task =
                    NewTask::new(name, domain, priority).with_memory_usage(u64::from(quanta) << 20);
                if let Some(quantum_ms) = quantum_ms {
                    task = task.with_quantum_ms(quantum_ms);
                }
                let id = self.scheduler.register_task(task);
                self.workloads.insert(
                    id,
                    Workload {
                        remaining: quanta,
                        io_every,
                        ran: 0,
                    },
                );
            }
        }
        tracing::info!(tasks = self.workloads.len(), "scheduler seeded");
    }

    /// Run one quantum of the task and decide its next state.
    fn execute_quantum(&mut self, id: TaskId) -> TaskState {
        let Some(work) = self.workloads.get_mut(&id) else {
            return TaskState::Terminated;
        };
        work.ran += 1;
        work.remaining = work.remaining.saturating_sub(1);

        if work.remaining == 0 {
            TaskState::Terminated
        } else if work.io_every > 0 && work.ran % work.io_every == 0 {
            TaskState::Blocked
        } else {
            TaskState::Ready
        }
    }

    fn wake_blocked(&mut self) {
        for id in self.blocked.drain(..) {
            self.scheduler.update_task_state(id, TaskState::Ready);
        }
    }

    fn raise_timer_interrupt(&self) {
        for driver in &self.catalog.drivers {
            let Some(module) = self.manager.module(driver.id()) else {
                continue;
            };
            if let Some(handle) = module.as_driver().filter(|d| d.driver_type() == "timer") {
                if let Err(e) = handle.handle_interrupt(TIMER_IRQ) {
                    tracing::warn!(error = %e, "timer interrupt dropped");
                }
            }
        }
    }

    fn timer_interrupts(&self) -> u64 {
        self.catalog
            .drivers
            .iter()
            .filter(|driver| driver.driver_type() == "timer")
            .map(|driver| driver.interrupts_handled())
            .sum()
    }

    /// Split between the highest-priority guest A and guest B tasks.
    fn sample_allocation(&self) -> Option<CpuAllocation> {
        let top = |domain| {
            self.scheduler
                .tasks_by_domain(domain)
                .into_iter()
                .max_by_key(|t| t.priority)
        };
        let guest_a = top(Domain::GuestA)?;
        let guest_b = top(Domain::GuestB)?;
        Some(self.scheduler.allocate_cpu(&guest_a, &guest_b))
    }
}

/// Mirror bus traffic into the log at debug level.
fn spawn_event_logger(bus: &IpcBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.as_ref() {
                    Event::ModuleStatusChanged {
                        module_id,
                        old_status,
                        new_status,
                        ..
                    } => tracing::debug!(%module_id, %old_status, %new_status, "module status changed"),
                    Event::ModuleOperationFailed {
                        module_id, reason, ..
                    } => tracing::debug!(%module_id, %reason, "module operation failed"),
                    other => tracing::trace!(event = ?other, "kernel event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::trace!(missed, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
