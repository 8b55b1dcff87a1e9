//! External command execution.
//!
//! Every storage, hypervisor and remote operation goes through a
//! [`CommandRunner`]. Read-only commands always run; mutating commands are
//! suppressed in dry-run mode and report a synthetic success instead.

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, trace};

/// Captured result of one command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Non-empty, trimmed stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    /// Fail with the captured stdout/stderr unless the command exited 0
    pub fn check(&self, what: &str) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        bail!(
            "{} failed (exit {}): stdout: {:?} stderr: {:?}",
            what,
            self.code,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

/// Runs external commands on the local host
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command that only reads state. Executed even in dry-run mode.
    async fn query(&self, argv: &[&str]) -> Result<CommandOutput>;

    /// Run a command that changes state.
    async fn execute(&self, argv: &[&str]) -> Result<CommandOutput>;

    /// Run a mutating shell pipeline through `sh -c`.
    async fn execute_shell(&self, script: &str) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes
pub struct SystemRunner {
    dry_run: bool,
    log_output: bool,
}

impl SystemRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            log_output: false,
        }
    }

    /// Log exit code and captured output of every command at debug level
    pub fn with_output_logging(mut self, enabled: bool) -> Self {
        self.log_output = enabled;
        self
    }

    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let output = Self::spawn(argv).await?;
        if self.log_output {
            debug!(
                command = %argv.join(" "),
                code = output.code,
                stdout = %output.stdout.trim(),
                stderr = %output.stderr.trim(),
                "command finished"
            );
        }
        Ok(output)
    }

    async fn spawn(argv: &[&str]) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            bail!("command cannot be empty");
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("executing {}", argv.join(" ")))?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn query(&self, argv: &[&str]) -> Result<CommandOutput> {
        trace!(command = %argv.join(" "), "executing read-only command");
        self.run(argv).await
    }

    async fn execute(&self, argv: &[&str]) -> Result<CommandOutput> {
        if self.dry_run {
            info!(command = %argv.join(" "), "dry run: would execute");
            return Ok(CommandOutput::default());
        }
        trace!(command = %argv.join(" "), "executing command");
        self.run(argv).await
    }

    async fn execute_shell(&self, script: &str) -> Result<CommandOutput> {
        if self.dry_run {
            info!(command = %script, "dry run: would execute");
            return Ok(CommandOutput::default());
        }
        trace!(command = %script, "executing shell command");
        self.run(&["sh", "-c", script]).await
    }
}

/// Build the argv for running `remote` on `host` over non-interactive ssh
pub fn ssh_argv<'a>(destination: &'a str, remote: &[&'a str]) -> Vec<&'a str> {
    let mut argv = vec!["ssh", "-o", "BatchMode yes", destination];
    argv.extend_from_slice(remote);
    argv
}
