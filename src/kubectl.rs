//! Thin wrapper over the `kubectl` binary.

use crate::error::Kube2Error;
use crate::utils::{parse_contexts, CommandResult, CommandRunner, KubeContext};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

/// Label carried by every pod, service and secret that belongs to a job.
pub const JOB_LABEL: &str = "kube2/job";

/// CSI driver backing FSx for Lustre volumes.
pub const FSX_CSI_DRIVER: &str = "fsx.csi.aws.com";

const FSX_CSI_KUSTOMIZATION: &str =
    "github.com/kubernetes-sigs/aws-fsx-csi-driver/deploy/kubernetes/overlays/stable/?ref=master";

/// Issues kubectl commands against one explicit context, or kubectl's
/// current context when none is given.
pub struct Kubectl<'a> {
    runner: &'a dyn CommandRunner,
    context: Option<String>,
}

impl<'a> Kubectl<'a> {
    pub fn new(runner: &'a dyn CommandRunner, context: Option<String>) -> Self {
        Self { runner, context }
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    fn command<'s>(&'s self, args: &[&'s str]) -> Vec<&'s str> {
        let mut cmd = vec!["kubectl"];
        if let Some(ctx) = &self.context {
            cmd.push("--context");
            cmd.push(ctx);
        }
        cmd.extend_from_slice(args);
        cmd
    }

    pub fn run(&self, args: &[&str], check: bool) -> Result<CommandResult> {
        self.runner.run(&self.command(args), check)
    }

    pub fn run_with_stdin(&self, args: &[&str], stdin: &str, check: bool) -> Result<CommandResult> {
        self.runner
            .run_with_stdin(&self.command(args), Some(stdin), check)
    }

    pub fn run_interactive(&self, args: &[&str]) -> Result<()> {
        self.runner.run_interactive(&self.command(args))
    }

    /// Raw `kubectl get pods` output including the job label column.
    /// Stderr is folded in so callers can show it when nothing parses.
    pub fn get_pods_output(&self) -> Result<String> {
        let result = self.run(&["get", "pods", "-L", JOB_LABEL], false)?;
        Ok(result.combined_output())
    }

    /// Name of kubectl's current context, or None when it is unset.
    pub fn current_context(&self) -> Result<Option<String>> {
        let result = self.run(&["config", "current-context"], false)?;
        let name = result.stdout.trim();
        if result.return_code != 0 || name.is_empty() || name.starts_with("error") {
            return Ok(None);
        }
        Ok(Some(name.to_string()))
    }

    pub fn contexts(&self) -> Result<Vec<KubeContext>> {
        let args = ["config", "get-contexts"];
        let result = self.run(&args, false)?;
        parse_contexts(&result.stdout).ok_or_else(|| {
            Kube2Error::UnexpectedOutput {
                command: self.command(&args).join(" "),
                output: result.combined_output(),
            }
            .into()
        })
    }

    pub fn rename_context(&self, from: &str, to: &str) -> Result<()> {
        self.run(&["config", "rename-context", from, to], true)?;
        Ok(())
    }

    pub fn use_context(&self, name: &str) -> Result<()> {
        self.run(&["config", "use-context", name], true)?;
        Ok(())
    }

    pub fn delete_context(&self, name: &str) -> Result<()> {
        self.run(&["config", "delete-context", name], true)?;
        Ok(())
    }

    /// `kubectl apply` a manifest passed on stdin, returning kubectl's report.
    pub fn apply(&self, manifest: &str) -> Result<String> {
        let result = self
            .run_with_stdin(&["apply", "-f", "-"], manifest, true)
            .context("Failed to apply manifest")?;
        Ok(result.stdout)
    }

    /// Create a generic secret from `(key, path)` pairs.
    pub fn create_secret(&self, name: &str, files: &[(&str, &Path)]) -> Result<()> {
        let from_files: Vec<String> = files
            .iter()
            .map(|(key, path)| format!("--from-file={}={}", key, path.display()))
            .collect();
        let mut args = vec!["create", "secret", "generic", name];
        args.extend(from_files.iter().map(String::as_str));
        self.run(&args, true)
            .with_context(|| format!("Failed to create secret {}", name))?;
        Ok(())
    }

    pub fn label(&self, resource: &str, label: &str) -> Result<()> {
        self.run(&["label", resource, label], true)?;
        Ok(())
    }

    /// Block until the StatefulSet has rolled out, bounded by kubectl's timeout.
    pub fn rollout_status(&self, statefulset: &str, timeout: Duration) -> Result<()> {
        let target = format!("statefulsets/{}", statefulset);
        let timeout = format!("--timeout={}s", timeout.as_secs());
        self.run(&["rollout", "status", "--watch", &timeout, &target], true)
            .with_context(|| format!("{} did not become ready", target))?;
        Ok(())
    }

    /// Run a non-interactive command inside a pod.
    pub fn exec(&self, pod: &str, command: &[&str]) -> Result<CommandResult> {
        let mut args = vec!["exec", "--stdin", pod, "--"];
        args.extend_from_slice(command);
        self.run(&args, false)
    }

    pub fn copy_to_pod(&self, local: &Path, pod: &str, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        let target = format!("{}:{}", pod, remote);
        self.run(&["cp", &local, &target], true)
            .with_context(|| format!("Failed to copy {} to {}", local, target))?;
        Ok(())
    }

    /// Delete a single resource such as `statefulsets/train`.
    pub fn delete(&self, resource: &str) -> Result<()> {
        self.run(&["delete", resource], true)?;
        Ok(())
    }

    pub fn delete_by_label(&self, kind: &str, selector: &str) -> Result<()> {
        self.run(&["delete", kind, "-l", selector], true)?;
        Ok(())
    }

    /// PersistentVolumeClaim list as JSON.
    pub fn claims_json(&self) -> Result<String> {
        let result = self
            .run(&["get", "pvc", "-o", "json"], true)
            .context("Failed to list persistent volume claims")?;
        Ok(result.stdout)
    }

    /// Current phase of a claim (`Pending`, `Bound`, ...). Empty when unknown.
    pub fn claim_phase(&self, claim: &str) -> Result<String> {
        let result = self.run(
            &["get", "pvc", claim, "-o", "jsonpath={..status.phase}"],
            false,
        )?;
        if result.return_code != 0 {
            tracing::debug!(claim, stderr = %result.stderr.trim(), "claim phase unavailable");
            return Ok(String::new());
        }
        Ok(result.stdout.trim().to_string())
    }

    /// Last line of `kubectl describe pvc`, normally the latest event.
    pub fn claim_last_event(&self, claim: &str) -> Result<Option<String>> {
        let result = self.run(&["describe", "pvc", claim], false)?;
        Ok(result
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    pub fn fsx_driver_installed(&self) -> Result<bool> {
        let result = self.run(&["get", "csidrivers.storage.k8s.io", FSX_CSI_DRIVER], false)?;
        Ok(result.return_code == 0 && result.stdout.trim().starts_with("NAME"))
    }

    pub fn install_fsx_driver(&self) -> Result<()> {
        self.run(&["create", "-k", FSX_CSI_KUSTOMIZATION], true)
            .context("Failed to install the FSx CSI driver")?;
        Ok(())
    }
}
