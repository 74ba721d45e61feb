//! Process-ending capabilities: device reboot and agent restart.
//!
//! The default implementations run a configured command with a timeout.

use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::config::CommandConfig;

pub trait Rebooter {
    fn reboot(&self) -> Result<()>;
}

pub trait AgentRestarter {
    fn restart_agent(&self) -> Result<()>;
}

/// Reboots by running `reboot.command`.
#[derive(Debug, Clone)]
pub struct CommandRebooter {
    config: CommandConfig,
}

impl CommandRebooter {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

impl Rebooter for CommandRebooter {
    fn reboot(&self) -> Result<()> {
        info!(command = ?self.config.command, "rebooting device");
        run_command(&self.config).context("reboot")
    }
}

/// Restarts the agent by running `restart.command`.
#[derive(Debug, Clone)]
pub struct CommandRestarter {
    config: CommandConfig,
}

impl CommandRestarter {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

impl AgentRestarter for CommandRestarter {
    fn restart_agent(&self) -> Result<()> {
        info!(command = ?self.config.command, "restarting agent");
        run_command(&self.config).context("restart agent")
    }
}

/// Run the command and wait at most `timeout_secs`; non-zero exit and timeout are errors.
#[instrument(skip_all, fields(timeout_secs = config.timeout_secs))]
fn run_command(config: &CommandConfig) -> Result<()> {
    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    debug!(program = %program, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = %program, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {program}"));
        }
    };

    let status = match child
        .wait_timeout(config.timeout())
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(timeout_secs = config.timeout_secs, "command timed out, killing");
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?;
            return Err(anyhow!(
                "{program} timed out after {}s",
                config.timeout_secs
            ));
        }
    };

    debug!(exit_code = ?status.code(), "command finished");
    if !status.success() {
        return Err(anyhow!("{program} failed with status {:?}", status.code()));
    }
    Ok(())
}
