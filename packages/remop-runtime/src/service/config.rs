/// Performer-level configuration for the operation pipeline.
///
/// Controls invocation timeouts and concurrency limits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported by this performer in logs.
    pub application: String,
    /// Timeout applied to every invocation in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent invocations before load shedding.
    pub max_concurrent_operations: u32,
    /// Share of `max_concurrent_operations` kept for invocations above
    /// normal priority.
    pub priority_reserve: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            application: "remop".to_string(),
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            priority_reserve: 0,
        }
    }
}
