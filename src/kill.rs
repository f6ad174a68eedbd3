/// Kill escalation: interrupt the child once, force-kill it if that fails.
///
/// The policy is `after_delivery`, a pure transition over `KillStage`;
/// `KillEscalator` only drives it against a real process.
use crate::supervisor::ChildState;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStage {
    /// Ask the child to shut down cleanly.
    Graceful,
    /// Unconditional kill.
    Forced,
}

impl KillStage {
    pub fn signal(self) -> Signal {
        match self {
            KillStage::Graceful => Signal::SIGINT,
            KillStage::Forced => Signal::SIGKILL,
        }
    }
}

/// Result of sending one stage's signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The process no longer exists.
    Gone,
    Failed(Errno),
}

/// Final result of a terminate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// No child was running.
    NoChild,
    /// The child was already gone when signalled.
    AlreadyExited,
    /// The child exited after the graceful signal.
    Exited,
    /// The unconditional kill was delivered; the supervisor observes the exit.
    Forced,
    /// Neither signal reached the process.
    Failed(Errno),
}

impl KillOutcome {
    pub fn succeeded(self) -> bool {
        !matches!(self, KillOutcome::Failed(_))
    }
}

/// Next step after a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Wait for the child to exit.
    AwaitExit,
    Escalate(KillStage),
    Finish(KillOutcome),
}

/// Escalation policy: try gently once, else force.
pub fn after_delivery(stage: KillStage, delivery: Delivery) -> Next {
    match (stage, delivery) {
        (_, Delivery::Gone) => Next::Finish(KillOutcome::AlreadyExited),
        (KillStage::Graceful, Delivery::Delivered) => Next::AwaitExit,
        (KillStage::Graceful, Delivery::Failed(_)) => Next::Escalate(KillStage::Forced),
        (KillStage::Forced, Delivery::Delivered) => Next::Finish(KillOutcome::Forced),
        (KillStage::Forced, Delivery::Failed(errno)) => Next::Finish(KillOutcome::Failed(errno)),
    }
}

/// Sends signals to a process.
pub trait Signaller {
    fn send(&self, pid: u32, signal: Signal) -> Result<(), Errno>;
}

/// Signals real processes through `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn send(&self, pid: u32, signal: Signal) -> Result<(), Errno> {
        let pid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
        kill(Pid::from_raw(pid), signal)
    }
}

pub struct KillEscalator<K = NixSignaller> {
    signaller: K,
    child: watch::Receiver<ChildState>,
    grace_period: Option<Duration>,
}

impl<K: Signaller> KillEscalator<K> {
    /// `grace_period` bounds the wait after a delivered graceful signal;
    /// `None` waits until the child exits.
    pub fn new(
        signaller: K,
        child: watch::Receiver<ChildState>,
        grace_period: Option<Duration>,
    ) -> Self {
        Self {
            signaller,
            child,
            grace_period,
        }
    }

    /// The child as last published by the supervisor.
    pub fn child(&self) -> ChildState {
        *self.child.borrow()
    }

    /// Wait until the supervisor has finished the spawn attempt that follows
    /// `generation`, whether or not it produced a child.
    pub async fn await_spawn(&mut self, generation: u64) {
        let _ = self
            .child
            .wait_for(|state| state.generation != generation)
            .await;
    }

    /// Terminate the current child, escalating as needed.
    pub async fn terminate(&mut self) -> KillOutcome {
        let current = self.child.borrow().pid;
        let Some(pid) = current else {
            tracing::info!("no child running, nothing to terminate");
            return KillOutcome::NoChild;
        };

        let mut stage = KillStage::Graceful;
        loop {
            let delivery = self.deliver(pid, stage);
            match after_delivery(stage, delivery) {
                Next::AwaitExit => {
                    if self.wait_for_exit(pid).await {
                        tracing::info!(pid, "child exited after graceful signal");
                        return KillOutcome::Exited;
                    }
                    tracing::warn!(pid, "grace period elapsed, forcing kill");
                    stage = KillStage::Forced;
                }
                Next::Escalate(next) => stage = next,
                Next::Finish(outcome) => {
                    if let KillOutcome::Failed(errno) = outcome {
                        tracing::error!(pid, error = %errno, "failed to kill child");
                    }
                    return outcome;
                }
            }
        }
    }

    fn deliver(&self, pid: u32, stage: KillStage) -> Delivery {
        let signal = stage.signal();
        match self.signaller.send(pid, signal) {
            Ok(()) => {
                tracing::info!(pid, signal = %signal, "signalled child");
                Delivery::Delivered
            }
            Err(Errno::ESRCH) => {
                tracing::info!(pid, "child already exited");
                Delivery::Gone
            }
            Err(errno) => {
                tracing::warn!(pid, signal = %signal, error = %errno, "signal delivery failed");
                Delivery::Failed(errno)
            }
        }
    }

    /// Wait until `pid` is no longer the current child. `false` if the grace
    /// period ran out first.
    async fn wait_for_exit(&mut self, pid: u32) -> bool {
        let exited = self.child.wait_for(|state| state.pid != Some(pid));
        match self.grace_period {
            None => {
                let _ = exited.await;
                true
            }
            Some(grace) => tokio::time::timeout(grace, exited).await.is_ok(),
        }
    }
}
