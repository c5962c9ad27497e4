//! Test doubles for the external tools.

use crate::cloud::{CloudProvider, Cluster, IngressPermission, IngressRule, SecurityGroup, Subnet};
use crate::error::Kube2Error;
use crate::utils::{CommandResult, CommandRunner};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

struct Rule {
    prefix: String,
    responses: VecDeque<CommandResult>,
}

/// Answers commands from a script keyed by command-line prefix and records
/// every command it was asked to run. The last response of a rule repeats.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<String>>,
    inputs: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `stdout` for commands starting with `prefix`.
    pub fn on(self, prefix: &str, stdout: &str) -> Self {
        self.on_sequence(prefix, &[stdout])
    }

    /// Succeed with each of `outputs` in turn, repeating the last one.
    pub fn on_sequence(self, prefix: &str, outputs: &[&str]) -> Self {
        let responses = outputs
            .iter()
            .map(|out| CommandResult {
                stdout: out.to_string(),
                ..Default::default()
            })
            .collect();
        self.push(prefix, responses)
    }

    /// Exit with code 1 and `stderr` for commands starting with `prefix`.
    pub fn fail(self, prefix: &str, stderr: &str) -> Self {
        let response = CommandResult {
            stderr: stderr.to_string(),
            return_code: 1,
            ..Default::default()
        };
        self.push(prefix, VecDeque::from([response]))
    }

    fn push(self, prefix: &str, responses: VecDeque<CommandResult>) -> Self {
        self.rules.borrow_mut().push(Rule {
            prefix: prefix.to_string(),
            responses,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(&self, cmd: &[&str], stdin: Option<&str>) -> Result<CommandResult> {
        let line = cmd.join(" ");
        self.calls.borrow_mut().push(line.clone());
        if let Some(input) = stdin {
            self.inputs.borrow_mut().push(input.to_string());
        }

        let mut rules = self.rules.borrow_mut();
        let Some(rule) = rules.iter_mut().find(|r| line.starts_with(&r.prefix)) else {
            return Ok(CommandResult::default());
        };
        let response = if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        };
        Ok(response.unwrap_or_default())
    }

    fn run_interactive(&self, cmd: &[&str]) -> Result<()> {
        self.execute(cmd, None)?.check(cmd)?;
        Ok(())
    }
}

fn fake_group(id: &str, name: &str, vpc_id: &str, ingress: &[IngressRule]) -> SecurityGroup {
    SecurityGroup {
        id: id.to_string(),
        name: name.to_string(),
        vpc_id: vpc_id.to_string(),
        ingress: ingress.iter().map(IngressPermission::from).collect(),
    }
}

/// In-memory cloud account.
#[derive(Default)]
pub struct FakeCloud {
    clusters: RefCell<Vec<(Cluster, String)>>,
    groups: RefCell<Vec<SecurityGroup>>,
    hidden: RefCell<Option<SecurityGroup>>,
    subnets: RefCell<Vec<Subnet>>,
    ingress: RefCell<Vec<(String, IngressRule)>>,
    kubeconfig_updates: RefCell<Vec<(String, String)>>,
    creates: Cell<usize>,
    lookups_fail: Cell<bool>,
}

impl FakeCloud {
    /// Add an ACTIVE cluster living in `vpc_id`.
    pub fn add_cluster(&self, name: &str, vpc_id: &str) {
        let cluster = Cluster {
            name: name.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            status: "ACTIVE".to_string(),
        };
        self.clusters
            .borrow_mut()
            .push((cluster, vpc_id.to_string()));
    }

    /// Add a group whose inbound permissions are exactly `ingress`.
    pub fn add_security_group(&self, id: &str, name: &str, vpc_id: &str, ingress: &[IngressRule]) {
        self.groups
            .borrow_mut()
            .push(fake_group(id, name, vpc_id, ingress));
    }

    /// The group exists but the next lookup will not see it.
    pub fn hide_next_lookup(&self, id: &str, name: &str, vpc_id: &str, ingress: &[IngressRule]) {
        *self.hidden.borrow_mut() = Some(fake_group(id, name, vpc_id, ingress));
    }

    pub fn add_subnet(&self, id: &str, vpc_id: &str) {
        self.subnets.borrow_mut().push(Subnet {
            id: id.to_string(),
            vpc_id: vpc_id.to_string(),
        });
    }

    pub fn fail_lookups(&self) {
        self.lookups_fail.set(true);
    }

    pub fn create_calls(&self) -> usize {
        self.creates.get()
    }

    pub fn ingress_rules(&self) -> Vec<(String, IngressRule)> {
        self.ingress.borrow().clone()
    }

    pub fn kubeconfig_updates(&self) -> Vec<(String, String)> {
        self.kubeconfig_updates.borrow().clone()
    }
}

impl CloudProvider for FakeCloud {
    fn list_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters.borrow().iter().map(|(c, _)| c.clone()).collect())
    }

    fn cluster_vpc_id(&self, cluster_name: &str) -> Result<String> {
        self.clusters
            .borrow()
            .iter()
            .find(|(c, _)| c.name == cluster_name)
            .map(|(_, vpc)| vpc.clone())
            .ok_or_else(|| anyhow::anyhow!("ResourceNotFoundException: {}", cluster_name))
    }

    fn list_security_groups(&self, vpc_id: &str) -> Result<Vec<SecurityGroup>> {
        if self.lookups_fail.get() {
            anyhow::bail!("UnauthorizedOperation");
        }
        let visible: Vec<SecurityGroup> = self
            .groups
            .borrow()
            .iter()
            .filter(|g| g.vpc_id == vpc_id)
            .cloned()
            .collect();
        if let Some(hidden) = self.hidden.borrow_mut().take() {
            self.groups.borrow_mut().push(hidden);
        }
        Ok(visible)
    }

    fn create_security_group(&self, vpc_id: &str, name: &str, _description: &str) -> Result<String> {
        self.creates.set(self.creates.get() + 1);
        let exists = self
            .groups
            .borrow()
            .iter()
            .any(|g| g.name == name && g.vpc_id == vpc_id);
        if exists {
            return Err(Kube2Error::AlreadyExists {
                kind: "security group",
                name: name.to_string(),
            }
            .into());
        }
        let id = format!("sg-{}", self.creates.get());
        self.add_security_group(&id, name, vpc_id, &[]);
        Ok(id)
    }

    fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> Result<()> {
        self.ingress
            .borrow_mut()
            .push((group_id.to_string(), *rule));
        if let Some(group) = self.groups.borrow_mut().iter_mut().find(|g| g.id == group_id) {
            group.ingress.push(IngressPermission::from(rule));
        }
        Ok(())
    }

    fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        Ok(self
            .subnets
            .borrow()
            .iter()
            .filter(|s| s.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    fn update_kubeconfig(&self, cluster_name: &str, alias: &str) -> Result<()> {
        self.kubeconfig_updates
            .borrow_mut()
            .push((cluster_name.to_string(), alias.to_string()));
        Ok(())
    }
}
