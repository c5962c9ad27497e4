//! Named stages of multi-step provisioning flows.
//!
//! Nothing is rolled back when a stage fails. The tracker records the last
//! stage that completed so the error tells the operator which external
//! resources were left behind.

use anyhow::Result;
use std::fmt;

/// Steps of `job deploy`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStage {
    SecretCreated,
    PodsApplied,
    PodsReady,
    FilesCopied,
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployStage::SecretCreated => "secret created",
            DeployStage::PodsApplied => "pods applied",
            DeployStage::PodsReady => "pods ready",
            DeployStage::FilesCopied => "files copied",
        };
        write!(f, "{}", s)
    }
}

/// Steps of `volume create`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStage {
    FsxEnabled,
    SecurityGroupReady,
    ManifestApplied,
    ClaimBound,
}

impl fmt::Display for VolumeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeStage::FsxEnabled => "FSx driver enabled",
            VolumeStage::SecurityGroupReady => "security group ready",
            VolumeStage::ManifestApplied => "manifest applied",
            VolumeStage::ClaimBound => "claim bound",
        };
        write!(f, "{}", s)
    }
}

/// Runs stages one after another and remembers the last one that finished.
#[derive(Debug)]
pub struct StageTracker<S> {
    operation: String,
    last_completed: Option<S>,
}

impl<S: Copy + fmt::Display> StageTracker<S> {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            last_completed: None,
        }
    }

    #[allow(dead_code)]
    pub fn last_completed(&self) -> Option<S> {
        self.last_completed
    }

    /// Run `step` as `stage`. On failure the error is annotated with the
    /// stage that failed and the last one that completed.
    pub fn run<T>(&mut self, stage: S, step: impl FnOnce() -> Result<T>) -> Result<T> {
        tracing::debug!(operation = %self.operation, stage = %stage, "starting stage");
        match step() {
            Ok(value) => {
                tracing::info!(operation = %self.operation, "{}", stage);
                self.last_completed = Some(stage);
                Ok(value)
            }
            Err(e) => {
                let last = self
                    .last_completed
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string());
                Err(e.context(format!(
                    "{} failed before \"{}\" (last completed stage: {}); \
                     resources created so far were left in place",
                    self.operation, stage, last
                )))
            }
        }
    }
}
