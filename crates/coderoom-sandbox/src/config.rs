//! Execution limits.

/// Wall-clock limit applied to every run.
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

/// Captured output cap, counting each line plus its newline.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Nested call limit before a `RangeError` is raised.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Limits for a [`Sandbox`](crate::Sandbox).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
    pub max_call_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl SandboxConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}
