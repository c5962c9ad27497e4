//! Cloud provider access: EKS clusters, EC2 security groups and subnets.

use crate::error::Kube2Error;
use crate::utils::CommandRunner;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::Filter;
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::runtime::Runtime;

const DUPLICATE_GROUP: &str = "InvalidGroup.Duplicate";
const DUPLICATE_PERMISSION: &str = "InvalidPermission.Duplicate";

/// A managed Kubernetes cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

/// One inbound permission of a security group as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressPermission {
    /// `tcp`, `udp`, ... or `-1` for all traffic
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub cidrs: Vec<String>,
}

impl IngressPermission {
    pub fn covers(&self, rule: &IngressRule) -> bool {
        let all_traffic = self.protocol == "-1";
        let port = i32::from(rule.port);
        (all_traffic || (self.protocol == rule.protocol && self.from_port <= port && port <= self.to_port))
            && self.cidrs.iter().any(|c| c == rule.cidr)
    }
}

impl From<&IngressRule> for IngressPermission {
    fn from(rule: &IngressRule) -> Self {
        Self {
            protocol: rule.protocol.to_string(),
            from_port: i32::from(rule.port),
            to_port: i32::from(rule.port),
            cidrs: vec![rule.cidr.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
    pub ingress: Vec<IngressPermission>,
}

impl SecurityGroup {
    /// Whether some inbound permission of the group lets `rule` through.
    pub fn allows(&self, rule: &IngressRule) -> bool {
        self.ingress.iter().any(|p| p.covers(rule))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub vpc_id: String,
}

/// A single-port inbound rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: &'static str,
    pub port: u16,
    pub cidr: &'static str,
}

/// Lustre traffic from the cluster's pod network.
pub const FSX_INGRESS: IngressRule = IngressRule {
    protocol: "tcp",
    port: 988,
    cidr: "192.168.0.0/16",
};

/// Operations kube2 needs from the cloud provider.
pub trait CloudProvider {
    fn list_clusters(&self) -> Result<Vec<Cluster>>;

    fn cluster_vpc_id(&self, cluster_name: &str) -> Result<String>;

    /// Security groups belonging to `vpc_id`, with their inbound permissions.
    fn list_security_groups(&self, vpc_id: &str) -> Result<Vec<SecurityGroup>>;

    /// Create a group and return its id. A name collision is reported as
    /// `Kube2Error::AlreadyExists`.
    fn create_security_group(&self, vpc_id: &str, name: &str, description: &str)
        -> Result<String>;

    /// Add an inbound rule. A rule that is already present is not an error.
    fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> Result<()>;

    fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>>;

    /// Add the cluster to the local kubeconfig under `alias` and select it.
    fn update_kubeconfig(&self, cluster_name: &str, alias: &str) -> Result<()>;
}

fn sdk_failure<E: std::error::Error>(what: &str, err: E) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", what, DisplayErrorContext(err))
}

fn vpc_filter(vpc_id: &str) -> Filter {
    Filter::builder().name("vpc-id").values(vpc_id).build()
}

fn cluster_from_sdk(cluster: &aws_sdk_eks::types::Cluster) -> Result<Cluster> {
    let name = cluster.name().unwrap_or_default().to_string();
    let created = cluster
        .created_at()
        .ok_or_else(|| anyhow::anyhow!("Cluster {} has no creation time", name))?;
    let created_at = DateTime::<Utc>::from_timestamp(created.secs(), created.subsec_nanos())
        .ok_or_else(|| anyhow::anyhow!("Cluster {} has an invalid creation time", name))?;
    Ok(Cluster {
        created_at,
        status: cluster
            .status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        name,
    })
}

fn security_group_from_sdk(group: &aws_sdk_ec2::types::SecurityGroup) -> SecurityGroup {
    SecurityGroup {
        id: group.group_id().unwrap_or_default().to_string(),
        name: group.group_name().unwrap_or_default().to_string(),
        vpc_id: group.vpc_id().unwrap_or_default().to_string(),
        ingress: group
            .ip_permissions()
            .iter()
            .map(|p| IngressPermission {
                protocol: p.ip_protocol().unwrap_or_default().to_string(),
                from_port: p.from_port().unwrap_or(-1),
                to_port: p.to_port().unwrap_or(-1),
                cidrs: p
                    .ip_ranges()
                    .iter()
                    .filter_map(|r| r.cidr_ip())
                    .map(str::to_string)
                    .collect(),
            })
            .collect(),
    }
}

/// `aws eks update-kubeconfig`, which the SDK has no counterpart for.
pub fn update_kubeconfig(
    runner: &dyn CommandRunner,
    region: &str,
    cluster_name: &str,
    alias: &str,
) -> Result<()> {
    runner
        .run(
            &[
                "aws",
                "eks",
                "--region",
                region,
                "update-kubeconfig",
                "--name",
                cluster_name,
                "--alias",
                alias,
            ],
            true,
        )
        .with_context(|| format!("Failed to add cluster {} to the kubeconfig", cluster_name))?;
    Ok(())
}

/// `CloudProvider` backed by the AWS SDK. Calls are driven to completion on a
/// private single-threaded runtime, so every method blocks.
pub struct AwsSdk<'a> {
    eks: aws_sdk_eks::Client,
    ec2: aws_sdk_ec2::Client,
    runner: &'a dyn CommandRunner,
    region: String,
    // dropped after the clients
    runtime: Runtime,
}

impl<'a> AwsSdk<'a> {
    pub fn new(runner: &'a dyn CommandRunner, region: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start the AWS client runtime")?;
        let config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()))
                .load(),
        );
        Ok(Self {
            eks: aws_sdk_eks::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
            runtime,
            runner,
            region: region.to_string(),
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn describe_cluster(&self, name: &str) -> Result<aws_sdk_eks::types::Cluster> {
        let output = self
            .block_on(self.eks.describe_cluster().name(name).send())
            .map_err(|e| sdk_failure(&format!("Failed to describe cluster {}", name), e))?;
        output
            .cluster()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No description returned for cluster {}", name))
    }
}

impl CloudProvider for AwsSdk<'_> {
    fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .block_on(self.eks.list_clusters().set_next_token(next_token).send())
                .map_err(|e| sdk_failure("Failed to list EKS clusters", e))?;
            names.extend(output.clusters().iter().cloned());
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        names
            .iter()
            .map(|name| cluster_from_sdk(&self.describe_cluster(name)?))
            .collect()
    }

    fn cluster_vpc_id(&self, cluster_name: &str) -> Result<String> {
        self.describe_cluster(cluster_name)?
            .resources_vpc_config()
            .and_then(|vpc| vpc.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Cluster {} reports no VPC", cluster_name))
    }

    fn list_security_groups(&self, vpc_id: &str) -> Result<Vec<SecurityGroup>> {
        let output = self
            .block_on(
                self.ec2
                    .describe_security_groups()
                    .filters(vpc_filter(vpc_id))
                    .send(),
            )
            .map_err(|e| sdk_failure("Failed to list security groups", e))?;
        Ok(output
            .security_groups()
            .iter()
            .map(security_group_from_sdk)
            .collect())
    }

    fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        let result = self.block_on(
            self.ec2
                .create_security_group()
                .group_name(name)
                .description(description)
                .vpc_id(vpc_id)
                .send(),
        );
        let output = match result {
            Ok(output) => output,
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some(DUPLICATE_GROUP) => {
                return Err(Kube2Error::AlreadyExists {
                    kind: "security group",
                    name: name.to_string(),
                }
                .into());
            }
            Err(e) => {
                return Err(sdk_failure(
                    &format!("Failed to create security group {}", name),
                    e,
                ))
            }
        };
        output
            .group_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("No id returned for security group {}", name))
    }

    fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> Result<()> {
        let port = i32::from(rule.port);
        let result = self.block_on(
            self.ec2
                .authorize_security_group_ingress()
                .group_id(group_id)
                .ip_protocol(rule.protocol)
                .from_port(port)
                .to_port(port)
                .cidr_ip(rule.cidr)
                .send(),
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some(DUPLICATE_PERMISSION) => {
                tracing::debug!(group_id, "ingress rule already present");
                Ok(())
            }
            Err(e) => Err(sdk_failure(
                &format!("Failed to authorize ingress on {}", group_id),
                e,
            )),
        }
    }

    fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        let output = self
            .block_on(self.ec2.describe_subnets().filters(vpc_filter(vpc_id)).send())
            .map_err(|e| sdk_failure("Failed to list subnets", e))?;
        Ok(output
            .subnets()
            .iter()
            .map(|s| Subnet {
                id: s.subnet_id().unwrap_or_default().to_string(),
                vpc_id: s.vpc_id().unwrap_or_default().to_string(),
            })
            .collect())
    }

    fn update_kubeconfig(&self, cluster_name: &str, alias: &str) -> Result<()> {
        update_kubeconfig(self.runner, &self.region, cluster_name, alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use aws_sdk_ec2::types::{IpPermission, IpRange};
    use aws_sdk_eks::types::{ClusterStatus, VpcConfigResponse};

    fn fsx_permission(cidr: &str) -> IpPermission {
        IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(988)
            .to_port(988)
            .ip_ranges(IpRange::builder().cidr_ip(cidr).build())
            .build()
    }

    #[test]
    fn test_cluster_from_sdk() {
        let described = aws_sdk_eks::types::Cluster::builder()
            .name("gpu")
            .status(ClusterStatus::Active)
            .created_at(aws_sdk_eks::primitives::DateTime::from_secs(1_714_566_600))
            .resources_vpc_config(VpcConfigResponse::builder().vpc_id("vpc-123").build())
            .build();
        let cluster = cluster_from_sdk(&described).unwrap();
        assert_eq!(cluster.name, "gpu");
        assert_eq!(cluster.status, "ACTIVE");
        assert_eq!(cluster.created_at.to_rfc3339(), "2024-05-01T12:30:00+00:00");
    }

    #[test]
    fn test_cluster_without_creation_time() {
        let described = aws_sdk_eks::types::Cluster::builder().name("gpu").build();
        assert!(cluster_from_sdk(&described).is_err());
    }

    #[test]
    fn test_security_group_from_sdk() {
        let described = aws_sdk_ec2::types::SecurityGroup::builder()
            .group_id("sg-1")
            .group_name("gpu-data-fsx")
            .vpc_id("vpc-123")
            .ip_permissions(fsx_permission("192.168.0.0/16"))
            .build();
        let group = security_group_from_sdk(&described);
        assert_eq!(group.id, "sg-1");
        assert_eq!(group.name, "gpu-data-fsx");
        assert_eq!(group.vpc_id, "vpc-123");
        assert!(group.allows(&FSX_INGRESS));
    }

    #[test]
    fn test_group_without_fsx_ingress() {
        let bare = security_group_from_sdk(
            &aws_sdk_ec2::types::SecurityGroup::builder()
                .group_id("sg-1")
                .group_name("gpu-data-fsx")
                .vpc_id("vpc-123")
                .build(),
        );
        assert!(!bare.allows(&FSX_INGRESS));

        let wrong_cidr = security_group_from_sdk(
            &aws_sdk_ec2::types::SecurityGroup::builder()
                .group_id("sg-2")
                .ip_permissions(fsx_permission("10.0.0.0/8"))
                .build(),
        );
        assert!(!wrong_cidr.allows(&FSX_INGRESS));
    }

    #[test]
    fn test_permission_covers() {
        let range = IngressPermission {
            protocol: "tcp".to_string(),
            from_port: 0,
            to_port: 1024,
            cidrs: vec!["192.168.0.0/16".to_string()],
        };
        assert!(range.covers(&FSX_INGRESS));

        let all_traffic = IngressPermission {
            protocol: "-1".to_string(),
            from_port: -1,
            to_port: -1,
            cidrs: vec!["192.168.0.0/16".to_string()],
        };
        assert!(all_traffic.covers(&FSX_INGRESS));

        let udp = IngressPermission {
            protocol: "udp".to_string(),
            ..IngressPermission::from(&FSX_INGRESS)
        };
        assert!(!udp.covers(&FSX_INGRESS));
        assert!(IngressPermission::from(&FSX_INGRESS).covers(&FSX_INGRESS));
    }

    #[test]
    fn test_update_kubeconfig_arguments() {
        let runner = ScriptedRunner::new();
        update_kubeconfig(&runner, "us-east-1", "gpu", "kube2-gpu").unwrap();
        assert_eq!(
            runner.calls(),
            vec!["aws eks --region us-east-1 update-kubeconfig --name gpu --alias kube2-gpu"]
        );
    }

    #[test]
    fn test_update_kubeconfig_failure() {
        let runner = ScriptedRunner::new().fail("aws eks", "ResourceNotFoundException");
        let err = update_kubeconfig(&runner, "us-east-1", "gone", "kube2-gone").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Kube2Error>(),
            Some(Kube2Error::CommandFailed { .. })
        ));
    }
}
