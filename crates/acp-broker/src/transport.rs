//! Child process transport construction.
//!
//! Builds the `tokio::process::Command` for a provider's ACP agent: piped
//! stdio, a layered environment (base allow-list + provider overrides), and
//! process-group isolation so a kill reaches the whole subtree.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::traits::ProviderSpec;

/// Build the spawn command for a provider, rooted at `cwd`.
///
/// The child's environment is exactly: `base_env_vars` copied verbatim from
/// the broker's own environment, then `spec.env_allow_list` copied the same
/// way, then `spec.env` overlaid on top. Nothing else is inherited.
pub fn build_command(spec: &ProviderSpec, cwd: &Path, base_env_vars: &[&str]) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .kill_on_drop(true);

    for var in base_env_vars {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }
    for var in &spec.env_allow_list {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    // Isolate the child in its own process group so `kill_process_group`
    // can terminate the whole subtree rather than just the immediate child.
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    cmd
}

/// Send SIGTERM to the child's process group, wait out the grace period,
/// then SIGKILL if it hasn't exited. No-op on platforms without a pid.
#[cfg(unix)]
pub async fn kill_process_group(pid: u32, grace_period: std::time::Duration) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
    tokio::time::sleep(grace_period).await;
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub async fn kill_process_group(_pid: u32, _grace_period: std::time::Duration) {}
