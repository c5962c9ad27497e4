//! Lookup-or-create for resources keyed by name.
//!
//! Lookup and creation run serially within one invocation; another operator
//! racing for the same name is handled by treating "already exists" from the
//! create call as a reason to look up again.

use crate::cloud::{CloudProvider, SecurityGroup, FSX_INGRESS};
use crate::error::Kube2Error;
use crate::kubectl::Kubectl;
use anyhow::{Context, Result};

/// Deterministic name of the security group guarding a volume's file system.
pub fn security_group_name(cluster_name: &str, volume_name: &str) -> String {
    format!("{}-{}-fsx", cluster_name, volume_name)
}

fn find_security_group(
    cloud: &dyn CloudProvider,
    vpc_id: &str,
    group_name: &str,
) -> Result<Option<SecurityGroup>> {
    let groups = cloud
        .list_security_groups(vpc_id)
        .with_context(|| format!("Could not look up security group {}", group_name))?;
    Ok(groups
        .into_iter()
        .find(|sg| sg.name == group_name && sg.vpc_id == vpc_id))
}

/// Add the FSx rule to a group found by lookup if it does not let Lustre
/// traffic through yet.
fn reuse_security_group(cloud: &dyn CloudProvider, group: SecurityGroup) -> Result<String> {
    if !group.allows(&FSX_INGRESS) {
        tracing::warn!(group_name = %group.name, id = %group.id, "security group lacks the FSx ingress rule, adding it");
        authorize_fsx(cloud, &group.name, &group.id)?;
    }
    Ok(group.id)
}

fn authorize_fsx(cloud: &dyn CloudProvider, group_name: &str, id: &str) -> Result<()> {
    cloud.authorize_ingress(id, &FSX_INGRESS).with_context(|| {
        format!(
            "Security group {} ({}) exists but its ingress rule was not applied",
            group_name, id
        )
    })
}

/// Return the id of the security group `group_name` in `vpc_id`, creating it
/// if it does not exist yet. The group always ends up with the FSx ingress rule.
pub fn ensure_security_group(
    cloud: &dyn CloudProvider,
    vpc_id: &str,
    group_name: &str,
    description: &str,
) -> Result<String> {
    if let Some(group) = find_security_group(cloud, vpc_id, group_name)? {
        tracing::info!(group_name, id = %group.id, "security group already exists, reusing it");
        return reuse_security_group(cloud, group);
    }

    tracing::info!(group_name, vpc_id, "security group does not exist, creating it");
    let id = match cloud.create_security_group(vpc_id, group_name, description) {
        Ok(id) => id,
        Err(e) if matches!(
            e.downcast_ref::<Kube2Error>(),
            Some(Kube2Error::AlreadyExists { .. })
        ) =>
        {
            // created by someone else since our lookup
            tracing::warn!(group_name, "security group appeared concurrently, reusing it");
            return match find_security_group(cloud, vpc_id, group_name)? {
                Some(group) => reuse_security_group(cloud, group),
                None => Err(e),
            };
        }
        Err(e) => return Err(e),
    };

    authorize_fsx(cloud, group_name, &id)?;
    Ok(id)
}

/// Install the FSx CSI driver on the cluster unless it is already there.
/// Returns true when it had to be installed.
pub fn ensure_fsx_driver(kubectl: &Kubectl) -> Result<bool> {
    if kubectl.fsx_driver_installed()? {
        tracing::debug!("FSx CSI driver already installed");
        return Ok(false);
    }
    tracing::info!("enabling FSx on this cluster");
    kubectl.install_fsx_driver()?;
    Ok(true)
}
