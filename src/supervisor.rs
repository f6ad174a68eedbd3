/// Child process lifecycle: reset the monitor, spawn the node with inherited
/// stdio, wait for it to exit, and start over.
use crate::reset::ResetSender;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;

/// The child currently being supervised, as seen by the kill escalator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildState {
    /// Set while a spawned child has not yet been reaped.
    pub pid: Option<u32>,
    /// Number of spawn attempts so far, failed ones included. Bumped in the
    /// same update that publishes `pid`.
    pub generation: u64,
}

/// Program and arguments passed through verbatim.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ChildCommand {
    /// Split a command line into program and arguments. `None` if empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl std::fmt::Display for ChildCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

pub struct Supervisor {
    command: ChildCommand,
    reset: ResetSender,
    child_tx: watch::Sender<ChildState>,
    restart_delay: Duration,
}

impl Supervisor {
    /// Create a supervisor and the receiver through which it publishes child state.
    pub fn new(
        command: ChildCommand,
        reset: ResetSender,
        restart_delay: Duration,
    ) -> (Self, watch::Receiver<ChildState>) {
        let (child_tx, child_rx) = watch::channel(ChildState::default());
        let supervisor = Self {
            command,
            reset,
            child_tx,
            restart_delay,
        };
        (supervisor, child_rx)
    }

    /// Run the child forever, restarting it whenever it exits.
    pub async fn run(mut self) {
        loop {
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "child run failed");
            }
            tracing::info!(
                delay_secs = self.restart_delay.as_secs_f64(),
                "restarting child"
            );
            tokio::time::sleep(self.restart_delay).await;
        }
    }

    /// One reset/spawn/wait cycle.
    ///
    /// The reset is acknowledged by the monitor before the child is spawned.
    pub async fn run_once(&mut self) -> Result<ExitStatus, SupervisorError> {
        if !self.reset.notify().await {
            tracing::warn!("stall reset was not acknowledged by the monitor");
        }

        tracing::info!(command = %self.command, "starting child");

        let spawned = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        // Published even when the spawn failed: the monitor may be waiting
        // for this attempt to finish before it shuts down.
        let pid = spawned.as_ref().ok().and_then(|child| child.id());
        let generation = self.child_tx.borrow().generation + 1;
        self.child_tx.send_replace(ChildState { pid, generation });

        let mut child = spawned.map_err(|e| SupervisorError::Spawn {
            program: self.command.program.clone(),
            source: e,
        })?;
        tracing::info!(pid = ?pid, generation, "child started");

        let status = child.wait().await;
        self.child_tx.send_modify(|state| state.pid = None);
        let status = status.map_err(|e| SupervisorError::Wait { source: e })?;

        if status.success() {
            tracing::info!(pid = ?pid, "child exited");
        } else {
            tracing::warn!(
                pid = ?pid,
                exit_code = ?status.code(),
                signal = ?status.signal(),
                "child exited with failure"
            );
        }
        Ok(status)
    }
}

/// Errors from a single child run.
#[derive(Debug)]
pub enum SupervisorError {
    /// Failed to spawn the child.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed while waiting for the child to exit.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            SupervisorError::Wait { source } => {
                write!(f, "failed to wait for child: {}", source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::Wait { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reset::{reset_channel, ResetReceiver};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn sh(script: &str) -> ChildCommand {
        ChildCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    /// Acknowledge every reset, counting them.
    fn spawn_acker(mut rx: ResetReceiver) -> Arc<AtomicU32> {
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                seen.fetch_add(1, Ordering::SeqCst);
                notice.acknowledge();
            }
        });
        count
    }

    #[test]
    fn test_child_command_from_argv() {
        let argv: Vec<String> = ["geth", "--datadir", "/data"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cmd = ChildCommand::from_argv(&argv).unwrap();
        assert_eq!(cmd.program, "geth");
        assert_eq!(cmd.args, vec!["--datadir", "/data"]);
        assert_eq!(cmd.to_string(), "geth --datadir /data");
        assert!(ChildCommand::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn test_run_once_reports_exit_status() {
        let (tx, rx) = reset_channel();
        let resets = spawn_acker(rx);
        let (mut supervisor, child_rx) = Supervisor::new(sh("exit 3"), tx, Duration::ZERO);

        let status = supervisor.run_once().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(
            *child_rx.borrow(),
            ChildState {
                pid: None,
                generation: 1
            }
        );
    }

    #[tokio::test]
    async fn test_run_once_spawn_failure() {
        let (tx, rx) = reset_channel();
        spawn_acker(rx);
        let command = ChildCommand {
            program: "nonexistent-binary-xyz".to_string(),
            args: vec![],
        };
        let (mut supervisor, child_rx) = Supervisor::new(command, tx, Duration::ZERO);

        let err = supervisor.run_once().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn nonexistent-binary-xyz"));
        assert_eq!(
            *child_rx.borrow(),
            ChildState {
                pid: None,
                generation: 1
            }
        );
    }

    #[tokio::test]
    async fn test_spawn_waits_for_reset_acknowledgement() {
        let (tx, mut rx) = reset_channel();
        let (mut supervisor, child_rx) = Supervisor::new(sh("exit 0"), tx, Duration::ZERO);
        let run = tokio::spawn(async move { supervisor.run_once().await });

        let notice = rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(child_rx.borrow().generation, 0);

        notice.acknowledge();
        assert!(run.await.unwrap().unwrap().success());
        assert_eq!(child_rx.borrow().generation, 1);
    }

    #[tokio::test]
    async fn test_pid_published_while_running() {
        let (tx, rx) = reset_channel();
        spawn_acker(rx);
        let (mut supervisor, mut child_rx) = Supervisor::new(sh("sleep 0.3"), tx, Duration::ZERO);
        let run = tokio::spawn(async move { supervisor.run_once().await });

        let running = *child_rx.wait_for(|s| s.pid.is_some()).await.unwrap();
        assert_eq!(running.generation, 1);
        assert!(running.pid.unwrap() > 0);

        run.await.unwrap().unwrap();
        assert_eq!(child_rx.borrow().pid, None);
    }

    #[tokio::test]
    async fn test_run_restarts_exited_child() {
        let (tx, rx) = reset_channel();
        let resets = spawn_acker(rx);
        let (supervisor, mut child_rx) =
            Supervisor::new(sh("exit 1"), tx, Duration::from_millis(10));
        let handle = tokio::spawn(supervisor.run());

        tokio::time::timeout(
            Duration::from_secs(5),
            child_rx.wait_for(|s| s.generation >= 3),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(resets.load(Ordering::SeqCst) >= 3);
        handle.abort();
    }

    #[tokio::test]
    async fn test_run_survives_spawn_failures() {
        let (tx, rx) = reset_channel();
        let resets = spawn_acker(rx);
        let command = ChildCommand {
            program: "nonexistent-binary-xyz".to_string(),
            args: vec![],
        };
        let (supervisor, _child_rx) = Supervisor::new(command, tx, Duration::from_millis(10));
        let handle = tokio::spawn(supervisor.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(resets.load(Ordering::SeqCst) >= 2);
        assert!(!handle.is_finished());
        handle.abort();
    }
}
