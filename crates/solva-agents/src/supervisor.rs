// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Multi-process agent supervisor.
//!
//! One long-running `solva worker` process spawns one child process per
//! agent role (`solva agent <role>`), each with its own bus connection
//! and consumer group.  Crashed children are restarted with a small
//! backoff; SIGINT/SIGTERM tears everything down.  Parallelism comes
//! from independent processes — there is no shared memory between
//! agents, the bus is the only coordination medium.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// CLI role names, one child per role.
pub const ROLES: &[&str] = &[
    "classifier",
    "improvement",
    "generator",
    "freetalker",
    "observer",
];

/// Exits faster than this count as crash loops and widen the backoff.
const FAST_EXIT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Supervise all agent roles until SIGINT/SIGTERM.
pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut monitors = Vec::new();
    for role in ROLES {
        monitors.push(tokio::spawn(supervise_role(
            exe.clone(),
            role,
            config_path.clone(),
            shutdown_rx.clone(),
        )));
    }

    info!(roles = ROLES.len(), "agent worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping agents");
    let _ = shutdown_tx.send(true);

    for monitor in monitors {
        let _ = monitor.await;
    }
    info!("all agent processes stopped");
    Ok(())
}

/// Keep one role's child process alive until shutdown.
async fn supervise_role(
    exe: PathBuf,
    role: &'static str,
    config_path: Option<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_fast_exits: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut command = Command::new(&exe);
        command.arg("agent").arg(role);
        if let Some(path) = &config_path {
            command.arg("--config").arg(path);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(role, "failed to spawn agent process: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        let pid = child.id().unwrap_or_default();
        info!(role, pid, "agent process started");
        let started = tokio::time::Instant::now();

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => warn!(role, pid, %status, "agent process exited"),
                    Err(e) => error!(role, pid, "wait failed: {e}"),
                }
                if started.elapsed() < FAST_EXIT {
                    consecutive_fast_exits += 1;
                } else {
                    consecutive_fast_exits = 0;
                }
                let backoff = restart_backoff(consecutive_fast_exits);
                if !backoff.is_zero() {
                    warn!(role, backoff_secs = backoff.as_secs(), "delaying restart");
                    tokio::time::sleep(backoff).await;
                }
            }
            _ = shutdown.changed() => {
                info!(role, pid, "stopping agent process");
                if let Err(e) = child.kill().await {
                    warn!(role, pid, "kill failed: {e}");
                }
                let _ = child.wait().await;
                return;
            }
        }
    }
}

/// Exponential restart delay for crash-looping children; an isolated
/// exit restarts immediately.
fn restart_backoff(consecutive_fast_exits: u32) -> Duration {
    if consecutive_fast_exits == 0 {
        return Duration::ZERO;
    }
    let secs = 1u64 << (consecutive_fast_exits - 1).min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_roles_one_per_agent() {
        assert_eq!(ROLES.len(), 5);
        for role in ["classifier", "improvement", "generator", "freetalker", "observer"] {
            assert!(ROLES.contains(&role));
        }
    }

    #[test]
    fn isolated_exit_restarts_immediately() {
        assert_eq!(restart_backoff(0), Duration::ZERO);
    }

    #[test]
    fn crash_loop_backoff_grows_and_caps() {
        assert_eq!(restart_backoff(1), Duration::from_secs(1));
        assert_eq!(restart_backoff(2), Duration::from_secs(2));
        assert_eq!(restart_backoff(3), Duration::from_secs(4));
        assert_eq!(restart_backoff(20), MAX_BACKOFF);
    }
}
