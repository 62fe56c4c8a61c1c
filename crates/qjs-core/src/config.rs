//! Configuration types for QuickJS runtimes.

use serde::Deserialize;

use crate::error::QjsResult;
use crate::runtime::QjsRuntime;

/// Runtime construction options.
///
/// Limits are enforced by the engine itself: exceeding the memory limit
/// surfaces as an `out of memory` script exception and exceeding the stack
/// size as a stack-overflow script exception.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Heap limit in bytes.
    /// Default: unlimited
    pub memory_limit: Option<usize>,

    /// Maximum native stack used by script execution, in bytes.
    /// Default: the engine's built-in limit
    pub max_stack_size: Option<usize>,

    /// Install built-in globals beyond the core language primitives
    /// (`Date`, `RegExp`, `JSON`, `Map`, typed arrays, ...) in every context.
    /// Default: true
    pub include_standard_library: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: None,
            include_standard_library: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heap limit in bytes.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set the maximum stack size in bytes.
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    /// Enable or disable the standard library.
    pub fn include_standard_library(mut self, enabled: bool) -> Self {
        self.include_standard_library = enabled;
        self
    }

    /// Create contexts with only the core language intrinsics.
    pub fn without_std_lib(self) -> Self {
        self.include_standard_library(false)
    }
}

/// Builder for creating a [`QjsRuntime`] with custom limits
///
/// # Example
///
/// ```
/// use qjs_core::QjsRuntime;
///
/// let runtime = QjsRuntime::builder()
///     .with_memory_limit(16 * 1024 * 1024)
///     .with_max_stack_size(512 * 1024)
///     .build()
///     .unwrap();
/// let context = runtime.create_context().unwrap();
/// assert_eq!(context.eval("6 * 7").unwrap().as_integer().unwrap(), 42);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.config.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.config.max_stack_size = Some(bytes);
        self
    }

    pub fn without_std_lib(mut self) -> Self {
        self.config.include_standard_library = false;
        self
    }

    /// Allocate the runtime on the calling thread, which becomes its owner
    pub fn build(self) -> QjsResult<QjsRuntime> {
        QjsRuntime::with_config(self.config)
    }
}
