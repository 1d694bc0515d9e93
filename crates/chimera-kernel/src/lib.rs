//! Chimera hybrid kernel control plane.
//!
//! This crate is the decision-making core of the Chimera hybrid desktop: it
//! decides which task runs next and sequences kernel module lifecycles, but
//! performs no I/O and runs nothing itself.  The host drives it.
//!
//! - **[`scheduler`]** -- Hybrid task scheduler.  Native work preempts guest
//!   work; the two guest domains share selection weight through a clamped,
//!   load-adjusted ratio.
//! - **[`manager`]** -- Kernel module registry that brokers load, unload and
//!   restart calls and computes dependency-respecting load orders.
//! - **[`module`]** -- Capability traits implemented by drivers and
//!   subsystems.
//! - **[`ipc`]** -- Broadcast event bus announcing task and module changes.
//! - **[`config`]** -- TOML-backed kernel settings.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync`.  Both components are plain values:
//! construct one of each at startup and hand clones to whoever needs them.

pub mod config;
pub mod error;
pub mod ipc;
pub mod manager;
pub mod module;
pub mod scheduler;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use ipc::{Event, IpcBus};
pub use manager::{LoadReport, ModuleManager};
pub use module::{
    Driver, KernelModule, ModuleDescriptor, ModuleInfo, ModuleKind, ModulePriority, ModuleStatus,
    Subsystem, SubsystemOptions,
};
pub use scheduler::{
    CpuAllocation, Domain, HybridScheduler, NewTask, SchedulerStats, Task, TaskId, TaskState,
};
