//! CLI entry point and command definitions.

use crate::cloud::{AwsSdk, Cluster};
use crate::cluster_manager::{ClusterManager, CreateClusterRequest, SwitchOutcome, AWS_AUTH_NOTE};
use crate::config::{Config, DEFAULT_CONTEXT_PREFIX, DEFAULT_DOCKER_IMAGE, DEFAULT_REGION, DEFAULT_S3_BUCKET};
use crate::error::Kube2Error;
use crate::job_manager::{DeployRequest, Job, JobManager};
use crate::kubectl::Kubectl;
use crate::utils::{assert_binary_on_path, check_name, humanize_date, make_table, CommandRunner};
use crate::volume_manager::{Volume, VolumeManager};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

const KUBECTL_HINT: &str = "Install it from https://kubernetes.io/docs/tasks/tools/";
const EKSCTL_HINT: &str = "Install it from https://eksctl.io/installation/";
const AWS_HINT: &str = "Install the AWS CLI v2 and run `aws configure`.";
const SSH_KEYGEN_HINT: &str = "Install an OpenSSH client.";

/// kube2 - Run multi-node GPU jobs on EKS with shared FSx volumes.
#[derive(Parser)]
#[command(name = "kube2")]
#[command(version = "0.1.0")]
#[command(about = "Run multi-node jobs on EKS with shared FSx volumes")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// AWS region clusters live in
    #[arg(long, global = true, env = "KUBE2_REGION", default_value = DEFAULT_REGION)]
    pub region: String,
    /// Prefix of the kubectl contexts kube2 manages
    #[arg(long, global = true, env = "KUBE2_CONTEXT_PREFIX", default_value = DEFAULT_CONTEXT_PREFIX)]
    pub context_prefix: String,
    /// S3 bucket backing volumes
    #[arg(long, global = true, env = "KUBE2_S3_BUCKET", default_value = DEFAULT_S3_BUCKET)]
    pub s3_bucket: String,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    pub fn config(&self) -> Config {
        Config {
            region: self.region.clone(),
            context_prefix: self.context_prefix.clone(),
            s3_bucket: self.s3_bucket.clone(),
            ..Config::default()
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, list and select EKS clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },
    /// Deploy and manage jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Create and manage shared volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
}

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// Create a new cluster
    Create {
        /// Name of the cluster
        #[arg(long)]
        name: String,
        /// Number of worker nodes
        #[arg(long)]
        nodes: u32,
        /// EC2 instance type of the worker nodes
        #[arg(long)]
        instance_type: String,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// List clusters in the region
    List,
    /// Delete a cluster
    Delete {
        /// Name of the cluster
        #[arg(long)]
        name: String,
    },
    /// Show the selected cluster
    Current,
    /// Select a cluster
    Switch {
        /// Name of the cluster
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Deploy a new job
    Deploy {
        /// Name of the job
        #[arg(long)]
        name: String,
        /// Cluster to use instead of the selected one
        #[arg(long)]
        cluster: Option<String>,
        /// Docker image every replica runs
        #[arg(long, default_value = DEFAULT_DOCKER_IMAGE)]
        docker_image: String,
        /// Number of pods
        #[arg(long, default_value_t = 1)]
        replicas: u32,
        /// Volumes to mount under /mnt (comma separated)
        #[arg(long, value_delimiter = ',')]
        attach_volumes: Vec<String>,
        /// Files to copy into /root of every pod
        #[arg(long)]
        copy: Vec<PathBuf>,
    },
    /// List jobs
    List {
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Kill a job
    Kill {
        #[arg(long)]
        name: String,
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Open a shell in a job's first pod
    Ssh {
        #[arg(long)]
        name: String,
        #[arg(long)]
        cluster: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum VolumeCommands {
    /// Create a new volume backed by S3
    Create {
        /// Name of the volume
        #[arg(long)]
        name: String,
        /// Requested size, e.g. 1200Gi
        #[arg(long)]
        storage_size: String,
        #[arg(long)]
        cluster: Option<String>,
    },
    /// List volumes
    List {
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Delete a volume
    Delete {
        #[arg(long)]
        name: String,
        #[arg(long)]
        cluster: Option<String>,
        /// Delete even when a running job has it attached
        #[arg(long)]
        force: bool,
    },
}

/// Cluster a job or volume command acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Context every kubectl call is pinned to
    pub context: Option<String>,
    /// Cluster name when the context is one kube2 manages
    pub cluster: Option<String>,
}

/// Resolve `--cluster`, or fall back to the context selected right now.
pub fn resolve_target(
    runner: &dyn CommandRunner,
    config: &Config,
    cluster: Option<&str>,
) -> Result<Target> {
    if let Some(name) = cluster {
        check_name(name)?;
        return Ok(Target {
            context: Some(config.context_name(name)),
            cluster: Some(name.to_string()),
        });
    }

    let current = Kubectl::new(runner, None).current_context()?;
    let cluster = current
        .as_deref()
        .and_then(|ctx| config.cluster_name_from_context(ctx));
    tracing::debug!(context = ?current, cluster = ?cluster, "resolved target");
    Ok(Target {
        context: current,
        cluster,
    })
}

/// Dispatch a parsed command.
pub fn run(command: Commands, config: &Config, runner: &dyn CommandRunner) -> Result<()> {
    match command {
        Commands::Cluster { command } => handle_cluster(command, config, runner),
        Commands::Job { command } => handle_job(command, config, runner),
        Commands::Volume { command } => handle_volume(command, config, runner),
    }
}

/// Handle the cluster commands.
pub fn handle_cluster(command: ClusterCommands, config: &Config, runner: &dyn CommandRunner) -> Result<()> {
    if let ClusterCommands::Create { name, .. }
    | ClusterCommands::Delete { name }
    | ClusterCommands::Switch { name } = &command
    {
        check_name(name)?;
    }
    let cloud = AwsSdk::new(runner, &config.region)?;
    let manager = ClusterManager::new(runner, &cloud, config);

    match command {
        ClusterCommands::Create {
            name,
            nodes,
            instance_type,
            yes,
        } => {
            assert_binary_on_path("eksctl", EKSCTL_HINT)?;
            assert_binary_on_path("kubectl", KUBECTL_HINT)?;
            let request = CreateClusterRequest {
                name,
                nodes,
                instance_type,
            };
            manager.create(&request, |cluster_config| {
                println!("Cluster config:");
                for line in cluster_config.lines() {
                    println!(">> {}", line);
                }
                if yes {
                    return Ok(true);
                }
                confirm("Proceed?")
            })?;
            println!("Cluster \"{}\" created and selected.", request.name);
        }
        ClusterCommands::List => {
            let clusters = manager.list().context("Failed to list clusters")?;
            println!("{}", clusters_table(&clusters, Utc::now()));
        }
        ClusterCommands::Delete { name } => {
            assert_binary_on_path("eksctl", EKSCTL_HINT)?;
            assert_binary_on_path("kubectl", KUBECTL_HINT)?;
            manager.delete(&name)?;
            println!("Cluster \"{}\" deleted.", name);
        }
        ClusterCommands::Current => {
            assert_binary_on_path("kubectl", KUBECTL_HINT)?;
            match manager.current() {
                Ok(name) => println!("{}", name),
                Err(e) => {
                    if let Some(Kube2Error::NoClusterSelected) = e.downcast_ref::<Kube2Error>() {
                        return Err(e.context(
                            "Select one with `kube2 cluster switch --name <name>` or create one with `kube2 cluster create`",
                        ));
                    }
                    return Err(e);
                }
            }
        }
        ClusterCommands::Switch { name } => {
            assert_binary_on_path("kubectl", KUBECTL_HINT)?;
            assert_binary_on_path("aws", AWS_HINT)?;
            match manager.switch(&name)? {
                SwitchOutcome::Selected => {}
                SwitchOutcome::Added => println!("{}", AWS_AUTH_NOTE),
            }
            println!("Switched to cluster \"{}\".", name);
        }
    }
    Ok(())
}

/// Handle the job commands.
pub fn handle_job(command: JobCommands, config: &Config, runner: &dyn CommandRunner) -> Result<()> {
    let cluster = match &command {
        JobCommands::Deploy { name, cluster, .. }
        | JobCommands::Kill { name, cluster }
        | JobCommands::Ssh { name, cluster } => {
            check_name(name)?;
            cluster.clone()
        }
        JobCommands::List { cluster } => cluster.clone(),
    };
    assert_binary_on_path("kubectl", KUBECTL_HINT)?;
    let target = resolve_target(runner, config, cluster.as_deref())?;
    let manager = JobManager::new(Kubectl::new(runner, target.context), config);

    match command {
        JobCommands::Deploy {
            name,
            docker_image,
            replicas,
            attach_volumes,
            copy,
            ..
        } => {
            assert_binary_on_path("ssh-keygen", SSH_KEYGEN_HINT)?;
            manager.deploy(&DeployRequest {
                name,
                docker_image,
                replicas,
                attach_volumes,
                copy_paths: copy,
            })?;
        }
        JobCommands::List { .. } => {
            let listing = manager.list()?;
            if listing.jobs.is_empty() {
                // Nothing parsed: show kubectl's own words, error or not
                print!("{}", listing.raw);
            } else {
                println!("{}", jobs_table(&listing.jobs));
            }
        }
        JobCommands::Kill { name, .. } => {
            manager.kill(&name)?;
            println!("Job \"{}\" killed.", name);
        }
        JobCommands::Ssh { name, .. } => manager.ssh(&name)?,
    }
    Ok(())
}

/// Handle the volume commands.
pub fn handle_volume(command: VolumeCommands, config: &Config, runner: &dyn CommandRunner) -> Result<()> {
    let cluster = match &command {
        VolumeCommands::Create { name, cluster, .. } | VolumeCommands::Delete { name, cluster, .. } => {
            check_name(name)?;
            cluster.clone()
        }
        VolumeCommands::List { cluster } => cluster.clone(),
    };
    assert_binary_on_path("kubectl", KUBECTL_HINT)?;
    let target = resolve_target(runner, config, cluster.as_deref())?;
    let cloud = AwsSdk::new(runner, &config.region)?;
    let manager = VolumeManager::new(Kubectl::new(runner, target.context), &cloud, config);

    match command {
        VolumeCommands::Create {
            name, storage_size, ..
        } => {
            manager.create(&name, &storage_size, target.cluster.as_deref())?;
            println!("Volume \"{}\" created.", name);
        }
        VolumeCommands::List { .. } => {
            let volumes = manager.list()?;
            if volumes.is_empty() {
                println!("No volumes.");
            } else {
                println!("{}", volumes_table(&volumes, Utc::now()));
            }
        }
        VolumeCommands::Delete { name, force, .. } => {
            manager.delete(&name, force)?;
            println!("Volume \"{}\" deleted.", name);
        }
    }
    Ok(())
}

/// Ask a yes/no question on the terminal.
fn confirm(question: &str) -> Result<bool> {
    print!("{} [y|n] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn clusters_table(clusters: &[Cluster], now: DateTime<Utc>) -> String {
    let mut rows = vec![vec!["NAME".to_string(), "CREATED".to_string(), "STATUS".to_string()]];
    rows.extend(clusters.iter().map(|c| {
        vec![
            c.name.clone(),
            humanize_date(c.created_at, now),
            c.status.clone(),
        ]
    }));
    make_table(rows)
}

fn jobs_table(jobs: &[Job]) -> String {
    let mut rows = vec![["NAME", "NODES", "RESTARTS", "STATUS", "AGE", "VOLUMES"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()];
    rows.extend(jobs.iter().map(|j| {
        vec![
            j.name.clone(),
            j.nodes.to_string(),
            j.restarts.clone(),
            j.status.clone(),
            j.age.clone(),
            j.attached_volumes.join(","),
        ]
    }));
    make_table(rows)
}

fn volumes_table(volumes: &[Volume], now: DateTime<Utc>) -> String {
    let mut rows = vec![["NAME", "CAPACITY", "USAGE", "CREATED"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()];
    rows.extend(volumes.iter().map(|v| {
        vec![
            v.name.clone(),
            v.capacity.clone(),
            v.usage.clone(),
            humanize_date(v.created_at, now),
        ]
    }));
    make_table(rows)
}
