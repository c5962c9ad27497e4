//! Volume Manager: shared FSx for Lustre volumes backed by S3.

use crate::cloud::CloudProvider;
use crate::config::Config;
use crate::ensure::{ensure_fsx_driver, ensure_security_group, security_group_name};
use crate::error::Kube2Error;
use crate::job_manager::get_jobs;
use crate::kubectl::Kubectl;
use crate::manifest::{self, FsxSpec, VOLUME_MOUNT_ROOT};
use crate::readiness::ReadinessPoll;
use crate::stages::{StageTracker, VolumeStage};
use crate::utils::check_name;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

const CLAIM_PREFIX: &str = "pvc-";
const STORAGE_CLASS_PREFIX: &str = "sc-";

/// A shared volume, projected from its PersistentVolumeClaim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub capacity: String,
    pub usage: String,
    pub created_at: DateTime<Utc>,
}

pub fn claim_name(volume_name: &str) -> String {
    format!("{}{}", CLAIM_PREFIX, volume_name)
}

pub fn storage_class_name(volume_name: &str) -> String {
    format!("{}{}", STORAGE_CLASS_PREFIX, volume_name)
}

#[derive(Deserialize)]
struct ClaimList {
    items: Vec<Claim>,
}

#[derive(Deserialize)]
struct Claim {
    metadata: ClaimMetadata,
    #[serde(default)]
    status: ClaimStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimMetadata {
    name: String,
    creation_timestamp: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
struct ClaimStatus {
    #[serde(default)]
    capacity: HashMap<String, String>,
}

/// Parse `kubectl get pvc -o json` into volumes.
pub fn parse_claims(json: &str) -> Result<Vec<Volume>> {
    let list: ClaimList =
        serde_json::from_str(json).context("Could not parse persistent volume claims")?;

    Ok(list
        .items
        .into_iter()
        .map(|claim| {
            let name = claim.metadata.name;
            Volume {
                name: name
                    .strip_prefix(CLAIM_PREFIX)
                    .map(str::to_string)
                    .unwrap_or(name.clone()),
                capacity: claim
                    .status
                    .capacity
                    .get("storage")
                    .cloned()
                    .unwrap_or_else(|| "-".to_string()),
                usage: "-".to_string(),
                created_at: claim.metadata.creation_timestamp,
            }
        })
        .collect())
}

/// The `Used` column of `df -hP <mount>`.
pub fn parse_df_used(output: &str) -> Option<String> {
    output
        .lines()
        .nth(1)?
        .split_whitespace()
        .nth(2)
        .map(str::to_string)
}

pub fn get_volumes(kubectl: &Kubectl) -> Result<Vec<Volume>> {
    parse_claims(&kubectl.claims_json()?)
}

/// Creates, lists and deletes volumes on one cluster.
pub struct VolumeManager<'a> {
    kubectl: Kubectl<'a>,
    cloud: &'a dyn CloudProvider,
    config: &'a Config,
}

impl<'a> VolumeManager<'a> {
    pub fn new(kubectl: Kubectl<'a>, cloud: &'a dyn CloudProvider, config: &'a Config) -> Self {
        Self {
            kubectl,
            cloud,
            config,
        }
    }

    /// Create a new FSx volume backed by S3 on `cluster_name` and wait until
    /// its claim is bound.
    pub fn create(
        &self,
        name: &str,
        storage_size: &str,
        cluster_name: Option<&str>,
    ) -> Result<()> {
        check_name(name)?;
        if get_volumes(&self.kubectl)?.iter().any(|v| v.name == name) {
            return Err(Kube2Error::AlreadyExists {
                kind: "volume",
                name: name.to_string(),
            }
            .into());
        }
        let cluster_name = cluster_name.ok_or(Kube2Error::NoClusterSelected)?;

        let claim = claim_name(name);
        let storage_class = storage_class_name(name);
        let mut tracker = StageTracker::new(format!("volume create {}", name));

        tracker.run(VolumeStage::FsxEnabled, || {
            ensure_fsx_driver(&self.kubectl).map(|_| ())
        })?;

        let (subnet_id, security_group_id) = tracker.run(VolumeStage::SecurityGroupReady, || {
            let vpc_id = self.cloud.cluster_vpc_id(cluster_name)?;
            let subnet_id = self
                .cloud
                .list_subnets(&vpc_id)?
                .into_iter()
                .find(|s| s.vpc_id == vpc_id)
                .map(|s| s.id)
                .ok_or_else(|| Kube2Error::NotFound {
                    kind: "subnet in VPC",
                    name: vpc_id.clone(),
                })?;
            let security_group_id = ensure_security_group(
                self.cloud,
                &vpc_id,
                &security_group_name(cluster_name, name),
                &format!("SG for FSx {}-{}", cluster_name, name),
            )?;
            Ok((subnet_id, security_group_id))
        })?;

        tracker.run(VolumeStage::ManifestApplied, || {
            let import_path = format!("s3://{}/{}", self.config.s3_bucket, name);
            let export_path = format!("{}/export", import_path);
            let manifest = manifest::fsx_manifest(&FsxSpec {
                storage_class_name: &storage_class,
                claim_name: &claim,
                storage_size,
                subnet_id: &subnet_id,
                security_group_id: &security_group_id,
                s3_import_path: &import_path,
                s3_export_path: &export_path,
            })?;
            println!("Creating volume...");
            self.kubectl.apply(&manifest).map(|_| ())
        })?;

        println!(
            "Waiting for FSx filesystem to be created (check progress here: \
             https://console.aws.amazon.com/fsx/home?region={})...",
            self.config.region
        );
        tracker.run(VolumeStage::ClaimBound, || {
            ReadinessPoll::from_config(self.config)
                .wait_until(&format!("claim {} to be bound", claim), || {
                    Ok(self.kubectl.claim_phase(&claim)? == "Bound")
                })
        })?;

        if let Some(event) = self.kubectl.claim_last_event(&claim)? {
            println!("{}", event);
        }
        Ok(())
    }

    /// Volumes on the cluster. Usage is filled in for volumes mounted by a
    /// running job and left as `-` otherwise.
    pub fn list(&self) -> Result<Vec<Volume>> {
        let mut volumes = get_volumes(&self.kubectl)?;
        if volumes.is_empty() {
            return Ok(volumes);
        }

        let jobs = get_jobs(&self.kubectl, true)?.jobs;
        for volume in volumes.iter_mut() {
            let pod = jobs
                .iter()
                .find(|j| j.attached_volumes.contains(&volume.name))
                .and_then(|j| j.pods.first());
            if let Some(used) = pod.and_then(|pod| self.usage_from_pod(pod, &volume.name)) {
                volume.usage = used;
            }
        }
        Ok(volumes)
    }

    fn usage_from_pod(&self, pod: &str, volume: &str) -> Option<String> {
        let mount = format!("{}/{}", VOLUME_MOUNT_ROOT, volume);
        match self.kubectl.exec(pod, &["df", "-hP", &mount]) {
            Ok(result) if result.return_code == 0 => parse_df_used(&result.stdout),
            Ok(result) => {
                tracing::debug!(pod, volume, stderr = %result.stderr.trim(), "df failed");
                None
            }
            Err(e) => {
                tracing::debug!(pod, volume, error = %e, "df failed");
                None
            }
        }
    }

    /// Delete a volume's claim and storage class. Refuses while a running job
    /// has it mounted unless `force` is set.
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        check_name(name)?;
        if !get_volumes(&self.kubectl)?.iter().any(|v| v.name == name) {
            return Err(Kube2Error::NotFound {
                kind: "volume",
                name: name.to_string(),
            }
            .into());
        }

        if !force {
            let users: Vec<String> = get_jobs(&self.kubectl, true)?
                .jobs
                .into_iter()
                .filter(|j| j.attached_volumes.iter().any(|v| v == name))
                .map(|j| j.name)
                .collect();
            if !users.is_empty() {
                anyhow::bail!(
                    "Volume \"{}\" is attached to job(s) {}. Kill them first or pass --force.",
                    name,
                    users.join(", ")
                );
            }
        }

        let mut failed = false;
        for resource in [
            format!("pvc/{}", claim_name(name)),
            format!("storageclass/{}", storage_class_name(name)),
        ] {
            if let Err(e) = self.kubectl.delete(&resource) {
                eprintln!("{:#}", e);
                failed = true;
            }
        }
        if failed {
            anyhow::bail!("Volume \"{}\" was only partially deleted", name);
        }
        Ok(())
    }
}
