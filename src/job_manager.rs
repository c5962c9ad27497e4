//! Job Manager: deploy, list, kill and enter groups of networked pods.

use crate::config::Config;
use crate::error::Kube2Error;
use crate::kubectl::{Kubectl, JOB_LABEL};
use crate::manifest::{self, JobSpec, POST_START_SCRIPT, VOLUME_MOUNT_ROOT};
use crate::stages::{DeployStage, StageTracker};
use crate::utils::{check_name, parse_pod_table, PodRow};
use crate::volume_manager::{claim_name, get_volumes};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ALL_RUNNING: &str = "All Running";

/// A group of pods backing one StatefulSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub nodes: usize,
    /// Restarts of the first pod, as kubectl printed them
    pub restarts: String,
    pub status: String,
    /// Age of the first pod
    pub age: String,
    pub attached_volumes: Vec<String>,
    /// Member pods in listing order
    pub pods: Vec<String>,
}

impl Job {
    pub fn is_all_running(&self) -> bool {
        self.status == ALL_RUNNING
    }
}

/// Key a pod is grouped under: its job label when present, otherwise its name
/// minus the trailing `-<ordinal>`. A name without any `-` is its own job.
fn job_key(row: &PodRow) -> String {
    if let Some(label) = &row.job_label {
        return label.clone();
    }
    match row.name.rsplit_once('-') {
        Some((prefix, _ordinal)) => prefix.to_string(),
        None => row.name.clone(),
    }
}

/// Fold pod rows into jobs, in order of each job's first appearance.
pub fn group_pods(rows: &[PodRow]) -> Vec<Job> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<&PodRow>> = HashMap::new();
    for row in rows {
        let key = job_key(row);
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }

    order
        .into_iter()
        .filter_map(|name| {
            let members = buckets.remove(&name)?;
            let first = members.first()?;
            let status = if members.iter().all(|p| p.phase == "Running") {
                ALL_RUNNING.to_string()
            } else {
                members
                    .iter()
                    .map(|p| p.phase.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            Some(Job {
                nodes: members.len(),
                restarts: first.restarts.clone(),
                age: first.age.clone(),
                status,
                attached_volumes: Vec::new(),
                pods: members.iter().map(|p| p.name.clone()).collect(),
                name,
            })
        })
        .collect()
}

/// Names of the volumes mounted in a job, read from its first pod. Any failure
/// means "none" so one broken pod cannot break the listing.
fn attached_volume_names(kubectl: &Kubectl, job: &Job) -> Vec<String> {
    let Some(pod) = job.pods.first() else {
        return Vec::new();
    };
    let listing = format!("ls {}", VOLUME_MOUNT_ROOT);
    match kubectl.exec(pod, &["/bin/bash", "-c", &listing]) {
        Ok(result) if result.return_code == 0 => result
            .stdout
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        Ok(result) => {
            tracing::warn!(pod = %pod, stderr = %result.stderr.trim(), "could not list attached volumes");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(pod = %pod, error = %e, "could not list attached volumes");
            Vec::new()
        }
    }
}

/// Jobs plus the raw listing they were parsed from.
#[derive(Debug, Clone)]
pub struct JobListing {
    pub jobs: Vec<Job>,
    pub raw: String,
}

/// List the jobs on the cluster. With `with_volumes`, fully running jobs are
/// asked which volumes they have mounted.
pub fn get_jobs(kubectl: &Kubectl, with_volumes: bool) -> Result<JobListing> {
    let raw = kubectl.get_pods_output()?;
    let mut jobs = group_pods(&parse_pod_table(&raw));
    if with_volumes {
        for job in jobs.iter_mut().filter(|j| j.is_all_running()) {
            job.attached_volumes = attached_volume_names(kubectl, job);
        }
    }
    Ok(JobListing { jobs, raw })
}

/// Parameters of `job deploy`.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub name: String,
    pub docker_image: String,
    pub replicas: u32,
    pub attach_volumes: Vec<String>,
    pub copy_paths: Vec<PathBuf>,
}

/// Manages job deployment, listing and teardown on one cluster.
pub struct JobManager<'a> {
    kubectl: Kubectl<'a>,
    config: &'a Config,
}

impl<'a> JobManager<'a> {
    pub fn new(kubectl: Kubectl<'a>, config: &'a Config) -> Self {
        Self { kubectl, config }
    }

    fn find_job(&self, name: &str) -> Result<Job> {
        get_jobs(&self.kubectl, false)?
            .jobs
            .into_iter()
            .find(|j| j.name == name)
            .ok_or_else(|| {
                Kube2Error::NotFound {
                    kind: "job",
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Deploy a new job (a group of networked pods) and wait for it to be ready.
    pub fn deploy(&self, request: &DeployRequest) -> Result<()> {
        let name = request.name.as_str();
        check_name(name)?;
        for path in &request.copy_paths {
            if !path.exists() {
                anyhow::bail!("File not found: {}", path.display());
            }
        }

        let existing = get_jobs(&self.kubectl, false)?;
        if existing.jobs.iter().any(|j| j.name == name) {
            return Err(Kube2Error::AlreadyExists {
                kind: "job",
                name: name.to_string(),
            }
            .into());
        }

        let mut volumes = Vec::new();
        let known_volumes = if request.attach_volumes.is_empty() {
            Vec::new()
        } else {
            get_volumes(&self.kubectl)?
        };
        for volume in &request.attach_volumes {
            if !known_volumes.iter().any(|v| &v.name == volume) {
                return Err(Kube2Error::NotFound {
                    kind: "volume",
                    name: volume.clone(),
                }
                .into());
            }
            volumes.push((volume.clone(), claim_name(volume)));
        }

        let tmpdir = tempfile::tempdir().context("Failed to create a scratch directory")?;
        let secret_name = format!("{}-{}", name, chrono::Local::now().format("%Y-%m-%d-%H-%M"));
        let mut tracker = StageTracker::new(format!("job deploy {}", name));

        tracker.run(DeployStage::SecretCreated, || {
            self.create_secret(name, &secret_name, tmpdir.path())
        })?;

        tracker.run(DeployStage::PodsApplied, || {
            let manifest = manifest::job_manifest(&JobSpec {
                name,
                docker_image: &request.docker_image,
                replicas: request.replicas,
                secret_name: &secret_name,
                volumes: &volumes,
            })?;
            let report = self.kubectl.apply(&manifest)?;
            print!("{}", report);
            Ok(())
        })?;

        tracker.run(DeployStage::PodsReady, || {
            self.kubectl.rollout_status(name, self.config.rollout_timeout)
        })?;

        if !request.copy_paths.is_empty() {
            tracker.run(DeployStage::FilesCopied, || {
                self.copy_into_pods(name, request.replicas, &request.copy_paths)
            })?;
        }

        println!("Job \"{}\" is running on {} node(s).", name, request.replicas);
        Ok(())
    }

    /// Generate the job's key pair and store it with the post-start script.
    fn create_secret(&self, job_name: &str, secret_name: &str, dir: &Path) -> Result<()> {
        let key_path = dir.join("id_rsa");
        let pub_path = dir.join("id_rsa.pub");
        let script_path = dir.join("post_start_script.sh");

        let key = key_path.to_string_lossy();
        self.kubectl
            .runner()
            .run(
                &["ssh-keygen", "-t", "rsa", "-b", "4096", "-N", "", "-q", "-f", &key],
                true,
            )
            .context("Failed to generate an SSH key pair")?;
        std::fs::write(&script_path, POST_START_SCRIPT)
            .with_context(|| format!("Failed to write {}", script_path.display()))?;

        self.kubectl.create_secret(
            secret_name,
            &[
                ("id_rsa", key_path.as_path()),
                ("id_rsa.pub", pub_path.as_path()),
                ("post_start_script.sh", script_path.as_path()),
            ],
        )?;
        self.kubectl.label(
            &format!("secret/{}", secret_name),
            &format!("{}={}", JOB_LABEL, job_name),
        )
    }

    fn copy_into_pods(&self, name: &str, replicas: u32, paths: &[PathBuf]) -> Result<()> {
        for ordinal in 0..replicas {
            let pod = format!("{}-{}", name, ordinal);
            for path in paths {
                let file_name = path
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| "upload".to_string());
                self.kubectl
                    .copy_to_pod(path, &pod, &format!("/root/{}", file_name))?;
            }
        }
        Ok(())
    }

    /// Jobs with their attached volumes.
    pub fn list(&self) -> Result<JobListing> {
        get_jobs(&self.kubectl, true)
    }

    /// Kill a job: its StatefulSet first, then its Service and secrets.
    pub fn kill(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.find_job(name)?;

        self.kubectl
            .delete(&format!("statefulsets/{}", name))
            .with_context(|| format!("Failed to kill job {}", name))?;

        if let Err(e) = self.kubectl.delete(&format!("services/{}", name)) {
            tracing::warn!(job = name, error = %e, "could not delete job service");
        }
        let selector = format!("{}={}", JOB_LABEL, name);
        if let Err(e) = self.kubectl.delete_by_label("secrets", &selector) {
            tracing::warn!(job = name, error = %e, "could not delete job secrets");
        }
        Ok(())
    }

    /// Open an interactive shell in the job's root replica.
    pub fn ssh(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let job = self.find_job(name)?;
        let pod = job
            .pods
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{}-0", name));
        self.kubectl
            .run_interactive(&["exec", "--stdin", "--tty", &pod, "--", "/bin/bash"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    fn row(name: &str, ready: &str, phase: &str, restarts: &str, age: &str) -> PodRow {
        PodRow {
            name: name.to_string(),
            ready: ready.to_string(),
            phase: phase.to_string(),
            restarts: restarts.to_string(),
            age: age.to_string(),
            job_label: None,
        }
    }

    const PODS: &str = "NAME      READY   STATUS             RESTARTS   AGE   JOB\n\
                        train-0   1/1     Running            0          5m    train\n\
                        train-1   1/1     Running            0          5m    train\n\
                        eval-0    0/1     CrashLoopBackOff   3          2m    eval\n";

    #[test]
    fn test_group_all_running() {
        let rows = vec![
            row("train-0", "1/1", "Running", "0", "5m"),
            row("train-1", "1/1", "Running", "0", "5m"),
        ];
        let jobs = group_pods(&rows);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "train");
        assert_eq!(jobs[0].nodes, 2);
        assert_eq!(jobs[0].status, "All Running");
        assert_eq!(jobs[0].restarts, "0");
        assert_eq!(jobs[0].age, "5m");
        assert_eq!(jobs[0].pods, vec!["train-0", "train-1"]);
    }

    #[test]
    fn test_group_mixed_phases() {
        let rows = vec![
            row("train-0", "1/1", "Running", "0", "5m"),
            row("train-1", "0/1", "CrashLoopBackOff", "3", "5m"),
        ];
        let jobs = group_pods(&rows);
        assert_eq!(jobs[0].status, "Running,CrashLoopBackOff");
        // taken from the first member, not aggregated
        assert_eq!(jobs[0].restarts, "0");
    }

    #[test]
    fn test_group_preserves_first_seen_order() {
        let rows = vec![
            row("b-job-0", "1/1", "Running", "0", "1m"),
            row("a-job-0", "1/1", "Pending", "0", "1m"),
            row("b-job-1", "1/1", "Pending", "0", "1m"),
            row("a-job-1", "1/1", "Pending", "0", "1m"),
        ];
        let jobs = group_pods(&rows);
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["b-job", "a-job"]);
        assert_eq!(jobs[0].status, "Running,Pending");
        assert_eq!(jobs[1].status, "Pending,Pending");
        assert!(jobs.iter().all(|j| j.nodes == 2));
    }

    #[test]
    fn test_group_single_pod_and_hyphenless_names() {
        let rows = vec![row("solo-0", "1/1", "Running", "0", "1d"), row("x", "1/1", "Running", "0", "1d")];
        let jobs = group_pods(&rows);
        assert_eq!(jobs[0].name, "solo");
        assert_eq!(jobs[0].nodes, 1);
        assert_eq!(jobs[1].name, "x");
    }

    #[test]
    fn test_group_prefers_label() {
        let mut labelled = row("exp-run-0", "1/1", "Running", "0", "1m");
        labelled.job_label = Some("exp".to_string());
        let mut sibling = row("exp-run-1", "1/1", "Running", "0", "1m");
        sibling.job_label = Some("exp".to_string());
        let unlabelled = row("exp-run-2", "1/1", "Running", "0", "1m");

        let jobs = group_pods(&[labelled, sibling, unlabelled]);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "exp");
        assert_eq!(jobs[0].nodes, 2);
        // no label, so the ordinal suffix is stripped
        assert_eq!(jobs[1].name, "exp-run");
    }

    #[test]
    fn test_group_counts_match_rows() {
        let mut rows = Vec::new();
        for job in ["alpha", "beta-x", "gamma"] {
            for i in 0..3 {
                rows.push(row(&format!("{}-{}", job, i), "1/1", "Running", "0", "1m"));
            }
        }
        let jobs = group_pods(&rows);
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.nodes == 3));
    }

    #[test]
    fn test_get_jobs_attaches_volumes_to_running_jobs() {
        let runner = ScriptedRunner::new()
            .on("kubectl get pods", PODS)
            .on("kubectl exec --stdin train-0", "data\nckpt\n");
        let kubectl = Kubectl::new(&runner, None);

        let listing = get_jobs(&kubectl, true).unwrap();
        assert_eq!(listing.jobs.len(), 2);
        assert_eq!(listing.jobs[0].attached_volumes, vec!["data", "ckpt"]);
        assert!(listing.jobs[1].attached_volumes.is_empty());
        assert_eq!(runner.count("kubectl exec"), 1);
    }

    #[test]
    fn test_get_jobs_tolerates_volume_lookup_failure() {
        let runner = ScriptedRunner::new()
            .on("kubectl get pods", PODS)
            .fail("kubectl exec", "error: unable to upgrade connection");
        let kubectl = Kubectl::new(&runner, None);

        let listing = get_jobs(&kubectl, true).unwrap();
        assert_eq!(listing.jobs.len(), 2);
        assert!(listing.jobs[0].attached_volumes.is_empty());
    }

    #[test]
    fn test_get_jobs_empty_listing_keeps_raw_output() {
        let runner = ScriptedRunner::new().fail("kubectl get pods", "error: connection refused");
        let kubectl = Kubectl::new(&runner, None);
        let listing = get_jobs(&kubectl, true).unwrap();
        assert!(listing.jobs.is_empty());
        assert!(listing.raw.contains("connection refused"));
    }

    #[test]
    fn test_deploy_rejects_duplicate() {
        let runner = ScriptedRunner::new().on("kubectl get pods", PODS);
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, None), &config);
        let err = manager
            .deploy(&DeployRequest {
                name: "train".to_string(),
                docker_image: "ubuntu".to_string(),
                replicas: 2,
                attach_volumes: vec![],
                copy_paths: vec![],
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Kube2Error>(),
            Some(Kube2Error::AlreadyExists { kind: "job", .. })
        ));
        assert_eq!(runner.count("kubectl apply"), 0);
    }

    #[test]
    fn test_deploy_rejects_invalid_name_before_any_call() {
        let runner = ScriptedRunner::new();
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, None), &config);
        let err = manager
            .deploy(&DeployRequest {
                name: "my job".to_string(),
                docker_image: "ubuntu".to_string(),
                replicas: 1,
                attach_volumes: vec![],
                copy_paths: vec![],
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Kube2Error>(),
            Some(Kube2Error::InvalidName(_))
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_deploy_rejects_unknown_volume() {
        let runner = ScriptedRunner::new()
            .on("kubectl get pods", "No resources found in default namespace.\n")
            .on("kubectl get pvc", r#"{"items": []}"#);
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, None), &config);
        let err = manager
            .deploy(&DeployRequest {
                name: "train".to_string(),
                docker_image: "ubuntu".to_string(),
                replicas: 1,
                attach_volumes: vec!["data".to_string()],
                copy_paths: vec![],
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Kube2Error>(),
            Some(Kube2Error::NotFound { kind: "volume", .. })
        ));
    }

    #[test]
    fn test_deploy_runs_all_stages() {
        let runner = ScriptedRunner::new()
            .on("kubectl get pods", "No resources found in default namespace.\n")
            .on("kubectl apply", "statefulset.apps/train created\n");
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, Some("kube2-gpu".to_string())), &config);
        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("train.py");
        std::fs::write(&upload, "print('hi')").unwrap();

        manager
            .deploy(&DeployRequest {
                name: "train".to_string(),
                docker_image: "ubuntu".to_string(),
                replicas: 2,
                attach_volumes: vec![],
                copy_paths: vec![upload],
            })
            .unwrap();

        let calls = runner.calls();
        let position = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix)).unwrap();
        assert!(position("ssh-keygen") < position("kubectl --context kube2-gpu create secret"));
        assert!(
            position("kubectl --context kube2-gpu create secret")
                < position("kubectl --context kube2-gpu apply")
        );
        assert!(
            position("kubectl --context kube2-gpu apply")
                < position("kubectl --context kube2-gpu rollout status --watch --timeout=300s statefulsets/train")
        );
        assert_eq!(runner.count("kubectl --context kube2-gpu cp"), 2);
        assert!(calls.iter().any(|c| c.ends_with("train-1:/root/train.py")));
        assert!(runner.inputs()[0].contains("kind: StatefulSet"));
    }

    #[test]
    fn test_deploy_reports_last_completed_stage() {
        let runner = ScriptedRunner::new()
            .on("kubectl get pods", "")
            .fail("kubectl rollout status", "error: timed out waiting for the condition");
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, None), &config);
        let err = manager
            .deploy(&DeployRequest {
                name: "train".to_string(),
                docker_image: "ubuntu".to_string(),
                replicas: 1,
                attach_volumes: vec![],
                copy_paths: vec![],
            })
            .unwrap_err();
        assert!(format!("{:#}", err).contains("last completed stage: pods applied"));
    }

    #[test]
    fn test_kill_unknown_job() {
        let runner = ScriptedRunner::new().on("kubectl get pods", PODS);
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, None), &config);
        assert!(manager.kill("nope").is_err());
        assert_eq!(runner.count("kubectl delete"), 0);
    }

    #[test]
    fn test_kill_deletes_job_resources() {
        let runner = ScriptedRunner::new().on("kubectl get pods", PODS);
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, None), &config);
        manager.kill("train").unwrap();
        assert_eq!(
            &runner.calls()[1..],
            &[
                "kubectl delete statefulsets/train",
                "kubectl delete services/train",
                "kubectl delete secrets -l kube2/job=train",
            ]
        );
    }

    #[test]
    fn test_ssh_enters_first_pod() {
        let runner = ScriptedRunner::new().on("kubectl get pods", PODS);
        let config = Config::default();
        let manager = JobManager::new(Kubectl::new(&runner, None), &config);
        manager.ssh("train").unwrap();
        assert_eq!(
            runner.calls().last().unwrap(),
            "kubectl exec --stdin --tty train-0 -- /bin/bash"
        );
    }
}
