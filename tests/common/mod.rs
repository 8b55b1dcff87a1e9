// Common test utilities for zsync-restore integration tests
#![allow(dead_code)]

use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use zsync_restore::decide::DecisionProvider;
use zsync_restore::exec::{CommandOutput, CommandRunner};
use zsync_restore::Settings;

pub const HOST: &str = "backup";
pub const POOL: &str = "tank/replica";
pub const CONFIG_PATH: &str = "/var/lib/pve-zsync";

/// Settings for a run against [`HOST`], with hypervisor root and lock dir in `root`
pub fn settings(root: &Path) -> Settings {
    Settings {
        host: HOST.to_string(),
        ssh_user: "root".to_string(),
        source_pool: POOL.to_string(),
        backup_name: "daily".to_string(),
        config_path: CONFIG_PATH.to_string(),
        filter: None,
        keyfile: None,
        pve_root: root.join("pve"),
        lock_dir: root.join("lock"),
        dry_run: false,
        debug: false,
        json: false,
    }
}

/// Write a live VM configuration under the settings' hypervisor root
pub fn write_vm_config(settings: &Settings, id: &str, text: &str) -> std::path::PathBuf {
    let dir = settings.pve_root.join("qemu-server");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.conf", id));
    std::fs::write(&path, text).unwrap();
    path
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Query(String),
    Execute(String),
}

struct Rule {
    pattern: String,
    /// Answered in order; the last one repeats
    outputs: VecDeque<CommandOutput>,
}

/// Scripted [`CommandRunner`].
///
/// Each command line is answered by the rule with the longest pattern it
/// contains (later rules win ties). Unanswered queries fail with exit 1,
/// unanswered mutations succeed.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.on_sequence(pattern, vec![output])
    }

    /// Answer successive matching commands with `outputs` in turn
    pub fn on_sequence(&self, pattern: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            outputs: outputs.into(),
        });
        self
    }

    pub fn respond(&self, pattern: &str, stdout: &str) -> &Self {
        self.on(pattern, CommandOutput::ok(stdout))
    }

    pub fn fail(&self, pattern: &str, stderr: &str) -> &Self {
        self.on(pattern, CommandOutput::failed(1, stderr))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Mutating command lines in execution order
    pub fn executed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Execute(cmd) => Some(cmd),
                Call::Query(_) => None,
            })
            .collect()
    }

    pub fn executed_matching(&self, needle: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|cmd| cmd.contains(needle))
            .collect()
    }

    /// Position of the first mutating command containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.executed().iter().position(|cmd| cmd.contains(needle))
    }

    fn answer(&self, command: &str, fallback: CommandOutput) -> CommandOutput {
        let mut rules = self.rules.lock().unwrap();
        let mut best: Option<usize> = None;
        for (index, rule) in rules.iter().enumerate() {
            if !command.contains(&rule.pattern) {
                continue;
            }
            if best.map_or(true, |b| rule.pattern.len() >= rules[b].pattern.len()) {
                best = Some(index);
            }
        }
        let Some(index) = best else {
            return fallback;
        };
        let outputs = &mut rules[index].outputs;
        if outputs.len() > 1 {
            outputs.pop_front().unwrap_or(fallback)
        } else {
            outputs.front().cloned().unwrap_or(fallback)
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for FakeRunner {
    async fn query(&self, argv: &[&str]) -> Result<CommandOutput> {
        let command = argv.join(" ");
        self.calls.lock().unwrap().push(Call::Query(command.clone()));
        Ok(self.answer(&command, CommandOutput::failed(1, "")))
    }

    async fn execute(&self, argv: &[&str]) -> Result<CommandOutput> {
        let command = argv.join(" ");
        self.calls.lock().unwrap().push(Call::Execute(command.clone()));
        Ok(self.answer(&command, CommandOutput::default()))
    }

    async fn execute_shell(&self, script: &str) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Execute(script.to_string()));
        Ok(self.answer(script, CommandOutput::default()))
    }
}

/// [`DecisionProvider`] answering from queues, recording every question
#[derive(Default)]
pub struct ScriptedDecisions {
    confirms: VecDeque<bool>,
    choices: VecDeque<String>,
    pub questions: Vec<String>,
}

impl ScriptedDecisions {
    pub fn new(confirms: &[bool], choices: &[&str]) -> Self {
        Self {
            confirms: confirms.iter().copied().collect(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
            questions: Vec::new(),
        }
    }

    /// Whether every scripted answer was consumed
    pub fn exhausted(&self) -> bool {
        self.confirms.is_empty() && self.choices.is_empty()
    }
}

impl DecisionProvider for ScriptedDecisions {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        self.questions.push(question.to_string());
        match self.confirms.pop_front() {
            Some(answer) => Ok(answer),
            None => bail!("unexpected confirmation: {}", question),
        }
    }

    fn choose<'o>(&mut self, question: &str, options: &[&'o str]) -> Result<&'o str> {
        self.questions.push(question.to_string());
        let Some(wanted) = self.choices.pop_front() else {
            bail!("unexpected choice: {}", question);
        };
        match options.iter().find(|option| **option == wanted) {
            Some(option) => Ok(*option),
            None => bail!("{} is not one of {:?}", wanted, options),
        }
    }
}

/// Live configuration of VM 100 with two disks and two recorded snapshots
pub const VM_100_CONFIG: &str = "\
boot: order=scsi0
cores: 2
scsi0: local-zfs:vm-100-disk-0,size=32G
scsi1: local-zfs:vm-100-disk-1,size=8G
parent: daily_2024-01-02

[daily_2024-01-01]
scsi0: local-zfs:vm-100-disk-0,size=32G
scsi1: local-zfs:vm-100-disk-1,size=8G
snaptime: 1704067200

[daily_2024-01-02]
parent: daily_2024-01-01
scsi0: local-zfs:vm-100-disk-0,size=32G
scsi1: local-zfs:vm-100-disk-1,size=8G
snaptime: 1704153600
";

/// Script the backup host: pool `tank/replica` holding the given disks of VM
/// 100, each with `daily_2024-01-01` and `daily_2024-01-02`, plus the
/// point-in-time configuration for `daily_2024-01-02`.
pub fn backup_host(runner: &FakeRunner, disks: &[&str], config: &str) {
    let mut objects = vec![POOL.to_string()];
    for disk in disks {
        let object = format!("{}/{}", POOL, disk);
        runner.respond(
            &format!("-s creation {}", object),
            &format!("{0}@daily_2024-01-01\n{0}@daily_2024-01-02\n", object),
        );
        runner.respond(
            &format!("pvesm path local-zfs:{}", disk),
            &format!("/dev/zvol/rpool/data/{}\n", disk),
        );
        objects.push(object);
    }
    runner.respond("zfs list -rH -o name", &format!("{}\n", objects.join("\n")));
    runner.respond(
        &format!("ls -1 {}", CONFIG_PATH),
        "100.conf.qemu.daily_2024-01-01\n100.conf.qemu.daily_2024-01-02\n",
    );
    runner.respond(
        &format!("cat {}/100.conf.qemu.daily_2024-01-02", CONFIG_PATH),
        config,
    );
}

/// Script a local dataset with the given snapshot names
pub fn local_dataset(runner: &FakeRunner, dataset: &str, snapshots: &[&str]) {
    runner.respond(&format!("zfs list -H -o name {}", dataset), &format!("{}\n", dataset));
    let listing: String = snapshots
        .iter()
        .map(|snap| format!("{}@{}\n", dataset, snap))
        .collect();
    runner.respond(&format!("-d 1 {}", dataset), &listing);
}
