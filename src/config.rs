//! Engine configuration with built-in defaults.

use std::time::Duration;

/// Tunables for admission control, session governors, and container caps.
///
/// Defaults are production values; tests construct cut-down variants with
/// short timeouts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of sessions holding an execution slot at once.
    pub max_concurrency: usize,
    /// Per-stream output byte limit. Breach terminates the session.
    pub output_cap: usize,
    /// Inactivity window on stdout/stdin before a session is stopped.
    pub idle_timeout: Duration,
    /// How long a clientless running session survives before termination.
    pub detach_grace: Duration,
    /// How long a pending session may wait for a slot.
    pub slot_wait_timeout: Duration,
    /// Container memory limit in bytes.
    pub container_memory: i64,
    /// Container CPU quota in whole-CPU units.
    pub container_cpus: f64,
    /// Container pids limit.
    pub container_pids: i64,
    /// Size of the writable /tmp tmpfs inside the container, in MiB.
    pub tmpfs_size_mib: u64,
    /// Flush cadence for streaming clients.
    pub poll_interval: Duration,
    /// HTTP listen port.
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            output_cap: 1 << 20,
            idle_timeout: Duration::from_secs(30),
            detach_grace: Duration::from_secs(60),
            slot_wait_timeout: Duration::from_secs(120),
            container_memory: 200 * 1024 * 1024,
            container_cpus: 0.5,
            container_pids: 32,
            tmpfs_size_mib: 32,
            poll_interval: Duration::from_millis(40),
            port: 8080,
        }
    }
}
