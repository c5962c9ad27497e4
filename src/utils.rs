//! Utility functions for external command execution and output parsing.

use crate::error::Kube2Error;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::thread;
use tabled::builder::Builder;
use tabled::settings::{Padding, Style};

/// Result of running an external command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

impl CommandResult {
    /// Turn a non-zero exit into `Kube2Error::CommandFailed`.
    pub fn check(self, cmd: &[&str]) -> Result<Self> {
        if self.return_code != 0 {
            return Err(Kube2Error::CommandFailed {
                command: cmd.join(" "),
                code: self.return_code,
                stderr: self.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(self)
    }

    /// Stdout followed by stderr, the way a terminal would have shown them.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Spawns the external tools kube2 wraps.
pub trait CommandRunner {
    /// Run `cmd` to completion, capturing its output. Only fails if the
    /// process could not be started.
    fn execute(&self, cmd: &[&str], stdin: Option<&str>) -> Result<CommandResult>;

    /// Run `cmd` attached to the user's terminal.
    fn run_interactive(&self, cmd: &[&str]) -> Result<()>;

    /// Execute a command and return stdout, stderr, and return code.
    ///
    /// # Arguments
    /// * `cmd` - Command and arguments as a slice
    /// * `check` - If true, return error on non-zero return code
    fn run(&self, cmd: &[&str], check: bool) -> Result<CommandResult> {
        self.run_with_stdin(cmd, None, check)
    }

    /// Same as `run`, feeding `stdin` to the child process.
    fn run_with_stdin(
        &self,
        cmd: &[&str],
        stdin: Option<&str>,
        check: bool,
    ) -> Result<CommandResult> {
        let result = self.execute(cmd, stdin)?;
        if check {
            result.check(cmd)
        } else {
            Ok(result)
        }
    }
}

/// Runs commands as child processes of kube2.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn execute(&self, cmd: &[&str], stdin: Option<&str>) -> Result<CommandResult> {
        if cmd.is_empty() {
            anyhow::bail!("Empty command");
        }
        tracing::debug!(command = %cmd.join(" "), "running");

        let mut child = Command::new(cmd[0])
            .args(&cmd[1..])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", cmd[0]))?;

        // The child may fill its stdout pipe before reading all of stdin, so
        // stdin is fed from its own thread while output is drained here.
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.to_string();
                Some(thread::spawn(move || pipe.write_all(input.as_bytes())))
            }
            _ => None,
        };

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for command: {}", cmd[0]))?;

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                // exited without reading everything; its exit code tells the story
                Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!(command = cmd[0], "child closed stdin early");
                }
                Ok(Err(e)) => {
                    return Err(e).with_context(|| format!("Failed to write stdin of {}", cmd[0]));
                }
                Err(_) => anyhow::bail!("Stdin writer for {} panicked", cmd[0]),
            }
        }

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            return_code: output.status.code().unwrap_or(-1),
        })
    }

    fn run_interactive(&self, cmd: &[&str]) -> Result<()> {
        if cmd.is_empty() {
            anyhow::bail!("Empty command");
        }
        tracing::debug!(command = %cmd.join(" "), "running interactively");

        let status = Command::new(cmd[0])
            .args(&cmd[1..])
            .status()
            .with_context(|| format!("Failed to execute command: {}", cmd[0]))?;

        if !status.success() {
            return Err(Kube2Error::CommandFailed {
                command: cmd.join(" "),
                code: status.code().unwrap_or(-1),
                stderr: String::new(),
            }
            .into());
        }
        Ok(())
    }
}

/// Abort unless `binary` can be found on PATH.
pub fn assert_binary_on_path(binary: &str, hint: &str) -> Result<()> {
    which::which(binary)
        .map(|_| ())
        .map_err(|_| anyhow::anyhow!("Unable to find `{}` on your path. {}", binary, hint))
}

/// Reject names kube2 cannot safely embed in resource names.
pub fn check_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z0-9_-]+$")?;
    if !re.is_match(name) {
        return Err(Kube2Error::InvalidName(name.to_string()).into());
    }
    Ok(())
}

/// One row of `kubectl get pods` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRow {
    pub name: String,
    #[allow(dead_code)]
    pub ready: String,
    pub phase: String,
    pub restarts: String,
    pub age: String,
    /// Value of the job label column, when the listing asked for it
    pub job_label: Option<String>,
}

/// Parse the columnar output of `kubectl get pods [-L <label>]`.
///
/// Anything that does not start with the `NAME` header (empty output, an
/// error message, "No resources found") yields no rows.
pub fn parse_pod_table(output: &str) -> Vec<PodRow> {
    let output = output.trim();
    if !output.starts_with("NAME") {
        return Vec::new();
    }

    // RESTARTS may read "3 (2m ago)" on recent kubectl versions
    let Ok(re) = Regex::new(
        r"^(\S+)\s+(\S+)\s+(\S+)\s+(\d+(?:\s+\([^)]*\))?)\s+(\S+)(?:\s+(\S+))?\s*$",
    ) else {
        return Vec::new();
    };

    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let Some(caps) = re.captures(line.trim()) else {
                tracing::debug!(line, "skipping unparseable pod row");
                return None;
            };
            Some(PodRow {
                name: caps[1].to_string(),
                ready: caps[2].to_string(),
                phase: caps[3].to_string(),
                restarts: caps[4].to_string(),
                age: caps[5].to_string(),
                job_label: caps.get(6).map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}

/// An entry of the local kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeContext {
    pub name: String,
    pub selected: bool,
}

/// Parse `kubectl config get-contexts`. Returns None when the output does not
/// carry the `CURRENT` header, i.e. kubectl printed an error instead.
pub fn parse_contexts(output: &str) -> Option<Vec<KubeContext>> {
    let output = output.trim();
    if !output.starts_with("CURRENT") {
        return None;
    }

    let contexts = output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut items = line.split_whitespace();
            match items.next()? {
                "*" => Some(KubeContext {
                    name: items.next()?.to_string(),
                    selected: true,
                }),
                name => Some(KubeContext {
                    name: name.to_string(),
                    selected: false,
                }),
            }
        })
        .collect();

    Some(contexts)
}

/// Relative, human-friendly rendering of a past timestamp.
pub fn humanize_date(date: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - date).num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    let plural = |n: i64, unit: &str| format!("{} {}s ago", n, unit);
    let minutes = secs / 60;
    let hours = secs / 3600;
    let days = secs / 86_400;

    match secs {
        0..=44 => "just now".to_string(),
        45..=89 => "a minute ago".to_string(),
        _ if minutes < 45 => plural(minutes.max(2), "minute"),
        _ if minutes < 90 => "an hour ago".to_string(),
        _ if hours < 22 => plural(hours.max(2), "hour"),
        _ if hours < 36 => "a day ago".to_string(),
        _ if days < 26 => plural(days.max(2), "day"),
        _ if days < 45 => "a month ago".to_string(),
        _ if days < 320 => plural((days / 30).max(2), "month"),
        _ if days < 548 => "a year ago".to_string(),
        _ => plural((days / 365).max(2), "year"),
    }
}

/// Render rows as a borderless table. The first row is the heading.
pub fn make_table(rows: Vec<Vec<String>>) -> String {
    let mut builder = Builder::default();
    for row in rows {
        builder.push_record(row);
    }
    let mut table = builder.build();
    table.with(Style::empty()).with(Padding::new(0, 2, 0, 0));
    table.to_string()
}
