//! Hooks Module
//!
//! Reload hooks connect the membership layer to the template engine. A
//! peer asking this node to `restart` ends up in [`ReloadHook::reload`].

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

pub use crate::remote::{ReloadHook, ReloadReport};

#[cfg(test)]
mod tests;

/// Environment variable telling a reload command whether to rebuild everything
pub const RELOAD_ALL_ENV: &str = "TEACLUSTER_RELOAD_ALL";

/// Runs a shell command to reload templates.
///
/// Each non-empty stdout line of a successful run names a reloaded
/// template. A failing run reports its stderr lines, or its exit status
/// when stderr is empty.
#[derive(Debug, Clone)]
pub struct CommandReloadHook {
    command: String,
}

impl CommandReloadHook {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

fn lines(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl ReloadHook for CommandReloadHook {
    async fn reload(&self, all: bool) -> ReloadReport {
        info!("Running reload command (all={}): {}", all, self.command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(RELOAD_ALL_ENV, all.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to spawn reload command: {}", e);
                return ReloadReport::failed(format!("failed to run '{}': {}", self.command, e));
            }
        };

        if output.status.success() {
            return ReloadReport {
                reloaded: lines(&output.stdout),
                errors: Vec::new(),
            };
        }

        let mut errors = lines(&output.stderr);
        if errors.is_empty() {
            errors.push(format!("'{}' exited with {}", self.command, output.status));
        }
        warn!("Reload command failed: {:?}", errors);
        ReloadReport {
            reloaded: Vec::new(),
            errors,
        }
    }
}
