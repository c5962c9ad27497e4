//! Runtime configuration shared by every command.

use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_CONTEXT_PREFIX: &str = "kube2";
pub const DEFAULT_S3_BUCKET: &str = "kube2-volumes";
pub const DEFAULT_DOCKER_IMAGE: &str = "leogao2/gpt-neox:main";

/// Settings resolved once from the global flags and passed to each manager.
#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub context_prefix: String,
    pub s3_bucket: String,
    /// Delay between readiness checks
    pub poll_interval: Duration,
    /// Readiness checks before giving up
    pub max_poll_attempts: u32,
    /// Passed to `kubectl rollout status --timeout`
    pub rollout_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            context_prefix: DEFAULT_CONTEXT_PREFIX.to_string(),
            s3_bucket: DEFAULT_S3_BUCKET.to_string(),
            poll_interval: Duration::from_secs(1),
            max_poll_attempts: 120,
            rollout_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Name of the local kubectl context that points at `cluster_name`.
    pub fn context_name(&self, cluster_name: &str) -> String {
        format!("{}-{}", self.context_prefix, cluster_name)
    }

    /// Recover the cluster name from a context created by kube2, if it is one.
    pub fn cluster_name_from_context(&self, context_name: &str) -> Option<String> {
        context_name
            .strip_prefix(&self.context_prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    /// Whether `context_name` follows kube2's naming convention.
    pub fn is_managed_context(&self, context_name: &str) -> bool {
        self.cluster_name_from_context(context_name).is_some()
    }
}
