//! Kernel error types.
//!
//! The control plane reports routine conditions (unknown ids, empty ready
//! queues, duplicate registrations) as `bool`/`Option` values.  Everything
//! else surfaces through [`KernelError`]: failures raised by a module's own
//! capability calls, dependency graph problems, and configuration loading.

/// Unified error type for the Chimera hybrid kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Module errors ------------------------------------------------------
    /// A module's own capability call (load, unload, connect, ...) failed.
    #[error("module `{module_id}` failed during {operation}: {reason}")]
    ModuleFailed {
        module_id: String,
        operation: &'static str,
        reason: String,
    },

    /// A module declares a dependency that is not registered.
    #[error("module `{module_id}` depends on unregistered module `{dependency}`")]
    MissingDependency {
        module_id: String,
        dependency: String,
    },

    /// The declared dependencies form a cycle; `modules` lists every module
    /// that could not be ordered.
    #[error("dependency cycle among modules: {}", modules.join(", "))]
    DependencyCycle { modules: Vec<String> },

    // -- Configuration errors -----------------------------------------------
    /// Reading or parsing the configuration file failed.
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

impl KernelError {
    /// Shorthand used by module implementations to report a failed
    /// capability call.
    pub fn module_failed(
        module_id: impl Into<String>,
        operation: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::ModuleFailed {
            module_id: module_id.into(),
            operation,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
