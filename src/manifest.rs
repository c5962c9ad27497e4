//! Manifests handed to eksctl and kubectl.

use crate::kubectl::{FSX_CSI_DRIVER, JOB_LABEL};
use anyhow::{Context, Result};
use serde_json::{json, Value};

/// Runs in every job pod after start: installs the job's SSH key pair so the
/// replicas can reach each other, then starts sshd when the image has one.
pub const POST_START_SCRIPT: &str = r#"#!/bin/bash
set -e
mkdir -p /root/.ssh
cp /secrets/id_rsa /root/.ssh/id_rsa
cp /secrets/id_rsa.pub /root/.ssh/id_rsa.pub
cat /secrets/id_rsa.pub >> /root/.ssh/authorized_keys
printf 'Host *\n  StrictHostKeyChecking no\n' > /root/.ssh/config
chmod 700 /root/.ssh
chmod 600 /root/.ssh/id_rsa /root/.ssh/authorized_keys /root/.ssh/config
if [ -x /usr/sbin/sshd ]; then
  mkdir -p /run/sshd
  /usr/sbin/sshd
fi
"#;

/// Where each attached volume shows up inside job pods.
pub const VOLUME_MOUNT_ROOT: &str = "/mnt";

fn render(documents: &[Value]) -> Result<String> {
    let docs = documents
        .iter()
        .map(|doc| serde_yaml::to_string(doc).context("Failed to render manifest"))
        .collect::<Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// eksctl `ClusterConfig` for a single managed node group.
pub fn cluster_config(name: &str, region: &str, nodes: u32, instance_type: &str) -> Result<String> {
    render(&[json!({
        "apiVersion": "eksctl.io/v1alpha5",
        "kind": "ClusterConfig",
        "metadata": {
            "name": name,
            "region": region,
        },
        "managedNodeGroups": [{
            "name": format!("{}-nodes", name),
            "instanceType": instance_type,
            "desiredCapacity": nodes,
            "minSize": nodes,
            "maxSize": nodes,
        }],
    })])
}

/// Inputs of a job's Service + StatefulSet.
#[derive(Debug, Clone)]
pub struct JobSpec<'a> {
    pub name: &'a str,
    pub docker_image: &'a str,
    pub replicas: u32,
    pub secret_name: &'a str,
    /// `(volume, claim)` pairs, each mounted under `/mnt/<volume>`
    pub volumes: &'a [(String, String)],
}

/// Headless Service plus StatefulSet giving every replica a stable hostname.
pub fn job_manifest(spec: &JobSpec) -> Result<String> {
    let labels = json!({ JOB_LABEL: spec.name });

    let mut mounts = vec![json!({ "name": "secrets", "mountPath": "/secrets" })];
    let mut volumes = vec![json!({
        "name": "secrets",
        "secret": { "secretName": spec.secret_name, "defaultMode": 0o600 },
    })];
    for (volume, claim) in spec.volumes {
        mounts.push(json!({
            "name": claim,
            "mountPath": format!("{}/{}", VOLUME_MOUNT_ROOT, volume),
        }));
        volumes.push(json!({
            "name": claim,
            "persistentVolumeClaim": { "claimName": claim },
        }));
    }

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": spec.name, "labels": labels },
        "spec": {
            "clusterIP": "None",
            "selector": labels,
            "ports": [{ "name": "ssh", "port": 22 }],
        },
    });

    let statefulset = json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": { "name": spec.name, "labels": labels },
        "spec": {
            "serviceName": spec.name,
            "replicas": spec.replicas,
            "podManagementPolicy": "Parallel",
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": spec.name,
                        "image": spec.docker_image,
                        "command": ["/bin/bash", "-c", "sleep infinity"],
                        "ports": [{ "containerPort": 22, "name": "ssh" }],
                        "lifecycle": {
                            "postStart": {
                                "exec": {
                                    "command": ["/bin/bash", "/secrets/post_start_script.sh"],
                                },
                            },
                        },
                        "volumeMounts": mounts,
                    }],
                    "volumes": volumes,
                },
            },
        },
    });

    render(&[service, statefulset])
}

/// Inputs of an S3-backed FSx for Lustre volume.
#[derive(Debug, Clone)]
pub struct FsxSpec<'a> {
    pub storage_class_name: &'a str,
    pub claim_name: &'a str,
    pub storage_size: &'a str,
    pub subnet_id: &'a str,
    pub security_group_id: &'a str,
    pub s3_import_path: &'a str,
    pub s3_export_path: &'a str,
}

/// StorageClass provisioning through the FSx CSI driver plus the claim using it.
pub fn fsx_manifest(spec: &FsxSpec) -> Result<String> {
    let storage_class = json!({
        "apiVersion": "storage.k8s.io/v1",
        "kind": "StorageClass",
        "metadata": { "name": spec.storage_class_name },
        "provisioner": FSX_CSI_DRIVER,
        "parameters": {
            "subnetId": spec.subnet_id,
            "securityGroupIds": spec.security_group_id,
            "s3ImportPath": spec.s3_import_path,
            "s3ExportPath": spec.s3_export_path,
            "deploymentType": "SCRATCH_2",
        },
    });

    let claim = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": spec.claim_name },
        "spec": {
            "accessModes": ["ReadWriteMany"],
            "storageClassName": spec.storage_class_name,
            "resources": { "requests": { "storage": spec.storage_size } },
        },
    });

    render(&[storage_class, claim])
}
