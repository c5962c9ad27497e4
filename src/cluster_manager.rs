//! Cluster Manager: create, delete and select EKS clusters.

use crate::cloud::{CloudProvider, Cluster};
use crate::config::Config;
use crate::error::Kube2Error;
use crate::kubectl::Kubectl;
use crate::manifest;
use crate::utils::{check_name, CommandRunner};
use anyhow::{Context, Result};
use std::io::Write;

/// Note printed after a cluster is first added to the local kubeconfig.
pub const AWS_AUTH_NOTE: &str = "For now, you must manually add your user account to the \
ConfigMap for this cluster: https://aws.amazon.com/premiumsupport/knowledge-center/eks-cluster-connection/";

/// Parameters of `cluster create`.
#[derive(Debug, Clone)]
pub struct CreateClusterRequest {
    pub name: String,
    pub nodes: u32,
    pub instance_type: String,
}

/// What `switch` had to do to select a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The context was already in the kubeconfig
    Selected,
    /// The cluster was added to the kubeconfig first
    Added,
}

pub struct ClusterManager<'a> {
    runner: &'a dyn CommandRunner,
    cloud: &'a dyn CloudProvider,
    config: &'a Config,
}

impl<'a> ClusterManager<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        cloud: &'a dyn CloudProvider,
        config: &'a Config,
    ) -> Self {
        Self {
            runner,
            cloud,
            config,
        }
    }

    /// Kubeconfig operations always act on the file, never on one context.
    fn kubectl(&self) -> Kubectl<'a> {
        Kubectl::new(self.runner, None)
    }

    pub fn list(&self) -> Result<Vec<Cluster>> {
        self.cloud.list_clusters()
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|c| c.name == name))
    }

    fn require(&self, name: &str) -> Result<()> {
        if !self.exists(name)? {
            return Err(Kube2Error::NotFound {
                kind: "cluster",
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Create a new EKS cluster, then rename its context to kube2's convention.
    ///
    /// `confirm` is shown the rendered configuration and decides whether to go on.
    pub fn create<F>(&self, request: &CreateClusterRequest, confirm: F) -> Result<()>
    where
        F: FnOnce(&str) -> Result<bool>,
    {
        let name = request.name.as_str();
        check_name(name)?;
        if self.exists(name)? {
            return Err(Kube2Error::AlreadyExists {
                kind: "cluster",
                name: name.to_string(),
            }
            .into());
        }

        let cluster_config = manifest::cluster_config(
            name,
            &self.config.region,
            request.nodes,
            &request.instance_type,
        )?;
        if !confirm(&cluster_config)? {
            return Err(Kube2Error::Aborted.into());
        }

        let mut file = tempfile::Builder::new()
            .prefix("cluster")
            .suffix(".yml")
            .tempfile()
            .context("Failed to create cluster config file")?;
        file.write_all(cluster_config.as_bytes())
            .context("Failed to write cluster config file")?;
        let path = file.path().to_string_lossy().to_string();

        tracing::info!(cluster = name, "creating cluster, this can take up to an hour");
        self.runner
            .run_interactive(&["eksctl", "create", "cluster", "-f", &path])
            .with_context(|| format!("Failed to create cluster {}", name))?;

        // eksctl selects the new cluster under its own context name
        let kubectl = self.kubectl();
        let current = kubectl
            .current_context()?
            .ok_or_else(|| anyhow::anyhow!("eksctl did not select a context for {}", name))?;
        let context_name = self.config.context_name(name);
        if current != context_name {
            kubectl.rename_context(&current, &context_name)?;
        }
        Ok(())
    }

    /// Delete a cluster and forget its local context.
    pub fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.require(name)?;

        self.runner
            .run_interactive(&[
                "eksctl",
                "delete",
                "cluster",
                "--name",
                name,
                "--region",
                &self.config.region,
            ])
            .with_context(|| format!("Failed to delete cluster {}", name))?;

        let kubectl = self.kubectl();
        let context_name = self.config.context_name(name);
        match kubectl.contexts() {
            Ok(contexts) if contexts.iter().any(|c| c.name == context_name) => {
                if let Err(e) = kubectl.delete_context(&context_name) {
                    tracing::warn!(context = %context_name, error = %e, "could not remove context");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not read local contexts"),
        }
        Ok(())
    }

    /// Cluster selected by the current context, if it is a kube2 context.
    pub fn selected(&self) -> Result<Option<String>> {
        Ok(self
            .kubectl()
            .current_context()?
            .and_then(|ctx| self.config.cluster_name_from_context(&ctx)))
    }

    /// The selected cluster, verified to still exist.
    pub fn current(&self) -> Result<String> {
        let name = self.selected()?.ok_or(Kube2Error::NoClusterSelected)?;
        self.require(&name)?;
        Ok(name)
    }

    /// Make `name` the current cluster, adding it to the kubeconfig if needed.
    pub fn switch(&self, name: &str) -> Result<SwitchOutcome> {
        check_name(name)?;
        self.require(name)?;

        let kubectl = self.kubectl();
        let context_name = self.config.context_name(name);
        let known = kubectl
            .contexts()?
            .into_iter()
            .filter(|c| self.config.is_managed_context(&c.name))
            .find(|c| c.name == context_name);

        if let Some(context) = known {
            if !context.selected {
                kubectl.use_context(&context_name)?;
            }
            return Ok(SwitchOutcome::Selected);
        }

        self.cloud.update_kubeconfig(name, &context_name)?;
        Ok(SwitchOutcome::Added)
    }
}
