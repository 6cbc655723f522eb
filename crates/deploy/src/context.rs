use std::time::Duration;

use uuid::Uuid;

const DEFAULT_TIMEOUT_MINUTES: u64 = 10;
/// Upper bound on any execution timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-execution switches shared by the deploy strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployFlags {
    pub prune: bool,
    pub versioning: bool,
    pub skip_steady_state: bool,
}

impl Default for DeployFlags {
    fn default() -> Self {
        Self { prune: false, versioning: true, skip_steady_state: false }
    }
}

/// Immutable inputs threaded through every pipeline stage.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub run_id: Uuid,
    pub release_name: String,
    pub namespace: String,
    pub timeout: Duration,
    pub flags: DeployFlags,
}

impl PipelineContext {
    /// `timeout_minutes` of zero falls back to the default; anything past a day is clamped.
    pub fn new(release_name: &str, namespace: &str, timeout_minutes: u64) -> Self {
        let minutes = if timeout_minutes == 0 { DEFAULT_TIMEOUT_MINUTES } else { timeout_minutes };
        Self {
            run_id: Uuid::new_v4(),
            release_name: release_name.to_string(),
            namespace: namespace.to_string(),
            timeout: Duration::from_secs(minutes.saturating_mul(60)).min(MAX_TIMEOUT),
            flags: DeployFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: DeployFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(MAX_TIMEOUT);
        self
    }
}
