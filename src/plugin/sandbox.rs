//! Bounded execution of plugin code.
//!
//! Plugin hooks run on their own task with a wall-clock timeout. A
//! [`ResourceMeter`] tracks memory, open files and network connections the
//! plugin reports through its context; going over a ceiling is recorded as a
//! breach and fails the surrounding hook even if the plugin ignores the error.

use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{PluginError, PluginResult};

/// Ceilings applied to every plugin hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock budget per hook, in seconds.
    pub execution_timeout_secs: u64,
    pub max_memory_bytes: u64,
    pub max_file_descriptors: u64,
    pub max_network_connections: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 30,
            max_memory_bytes: 256 * 1024 * 1024, // 256 MiB
            max_file_descriptors: 100,
            max_network_connections: 10,
        }
    }
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Snapshot of a plugin's resource usage against its limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageStats {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub file_descriptors: u64,
    pub file_descriptor_limit: u64,
    pub network_connections: u64,
    pub network_connection_limit: u64,
    /// Duration of the last hook run.
    pub execution_duration_seconds: f64,
    pub execution_timeout_seconds: u64,
}

#[derive(Debug, Default)]
struct Usage {
    memory_bytes: u64,
    file_descriptors: u64,
    network_connections: u64,
    last_execution: Duration,
    breach: Option<(&'static str, u64, u64)>,
}

/// Per-plugin resource accounting.
#[derive(Debug)]
pub struct ResourceMeter {
    plugin_id: String,
    limits: ResourceLimits,
    usage: Mutex<Usage>,
}

impl ResourceMeter {
    pub fn new(plugin_id: &str, limits: ResourceLimits) -> Self {
        Self { plugin_id: plugin_id.to_string(), limits, usage: Mutex::new(Usage::default()) }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn acquire(
        &self,
        resource: &'static str,
        amount: u64,
        limit: u64,
        counter: impl FnOnce(&mut Usage) -> &mut u64,
    ) -> PluginResult<()> {
        let mut usage = self.usage.lock();
        let current = counter(&mut *usage);
        let used = current.saturating_add(amount);
        if used > limit {
            usage.breach.get_or_insert((resource, limit, used));
            warn!(plugin = %self.plugin_id, resource, limit, used, "resource ceiling hit");
            return Err(PluginError::ResourceLimitExceeded {
                plugin: self.plugin_id.clone(),
                resource: resource.to_string(),
                limit,
                used,
            });
        }
        *current = used;
        Ok(())
    }

    /// Account for `bytes` of memory.
    pub fn allocate(&self, bytes: u64) -> PluginResult<()> {
        self.acquire("memory", bytes, self.limits.max_memory_bytes, |u| &mut u.memory_bytes)
    }

    pub fn release(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.memory_bytes = usage.memory_bytes.saturating_sub(bytes);
    }

    pub fn open_file(&self) -> PluginResult<()> {
        self.acquire("file descriptors", 1, self.limits.max_file_descriptors, |u| {
            &mut u.file_descriptors
        })
    }

    pub fn close_file(&self) {
        let mut usage = self.usage.lock();
        usage.file_descriptors = usage.file_descriptors.saturating_sub(1);
    }

    pub fn open_connection(&self) -> PluginResult<()> {
        self.acquire("network connections", 1, self.limits.max_network_connections, |u| {
            &mut u.network_connections
        })
    }

    pub fn close_connection(&self) {
        let mut usage = self.usage.lock();
        usage.network_connections = usage.network_connections.saturating_sub(1);
    }

    pub fn usage(&self) -> ResourceUsageStats {
        let usage = self.usage.lock();
        ResourceUsageStats {
            memory_bytes: usage.memory_bytes,
            memory_limit_bytes: self.limits.max_memory_bytes,
            file_descriptors: usage.file_descriptors,
            file_descriptor_limit: self.limits.max_file_descriptors,
            network_connections: usage.network_connections,
            network_connection_limit: self.limits.max_network_connections,
            execution_duration_seconds: usage.last_execution.as_secs_f64(),
            execution_timeout_seconds: self.limits.execution_timeout_secs,
        }
    }

    fn take_breach(&self) -> Option<PluginError> {
        self.usage.lock().breach.take().map(|(resource, limit, used)| {
            PluginError::ResourceLimitExceeded {
                plugin: self.plugin_id.clone(),
                resource: resource.to_string(),
                limit,
                used,
            }
        })
    }

    /// Forget all usage, e.g. after a failed activation.
    pub(crate) fn reset(&self) {
        *self.usage.lock() = Usage::default();
    }
}

/// Which hook is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Activate,
    Deactivate,
    Execute,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Self::Activate => "activation",
            Self::Deactivate => "deactivation",
            Self::Execute => "command",
        }
    }

    fn fault(self, plugin: &str, message: String) -> PluginError {
        match self {
            Self::Activate => PluginError::ActivationFailure { plugin: plugin.to_string(), message },
            Self::Deactivate | Self::Execute => {
                PluginError::Execution { plugin: plugin.to_string(), message }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run a plugin hook on its own task under the meter's limits.
///
/// Timeouts, panics and resource breaches become typed errors. During
/// activation every hook error is reported as `ActivationFailure` unless a
/// resource ceiling was hit; other phases pass hook errors through.
pub(crate) async fn run_bounded<F, T>(meter: &ResourceMeter, phase: Phase, hook: F) -> PluginResult<T>
where
    F: Future<Output = PluginResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let plugin = meter.plugin_id.as_str();
    let limit = meter.limits.timeout();
    let started = Instant::now();

    let mut task = tokio::spawn(hook);
    let outcome = tokio::time::timeout(limit, &mut task).await;
    meter.usage.lock().last_execution = started.elapsed();

    let result = match outcome {
        Err(_) => {
            task.abort();
            Err(phase.fault(
                plugin,
                format!("{} timed out after {}s", phase.label(), limit.as_secs()),
            ))
        }
        Ok(Err(join)) if join.is_panic() => {
            let payload = join.into_panic();
            Err(phase.fault(
                plugin,
                format!("{} panicked: {}", phase.label(), panic_message(payload.as_ref())),
            ))
        }
        Ok(Err(join)) => Err(phase.fault(plugin, format!("{} aborted: {join}", phase.label()))),
        Ok(Ok(result)) => result,
    };

    if let Some(breach) = meter.take_breach() {
        return Err(breach);
    }

    match (phase, result) {
        (Phase::Activate, Err(e))
            if !matches!(
                e,
                PluginError::ActivationFailure { .. } | PluginError::ResourceLimitExceeded { .. }
            ) =>
        {
            Err(phase.fault(plugin, e.to_string()))
        }
        (_, result) => result,
    }
}
