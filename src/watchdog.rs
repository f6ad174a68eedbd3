/// Chain-height monitor for the supervised node.
///
/// Runs alongside the supervisor, polling the node's RPC on a fixed interval.
/// If the height fails to advance for `stall_threshold` consecutive polls
/// (failed polls included), the child is terminated and the supervisor
/// restarts it.
use crate::config::Settings;
use crate::kill::{KillEscalator, KillOutcome, NixSignaller, Signaller};
use crate::reset::ResetReceiver;
use crate::rpc::{BlockMarker, LivenessSource, RpcError};
use crate::signals::ShutdownSignal;
use crate::stall::StallTracker;
use crate::status::{StatusData, StatusFile, WatchState};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub struct Monitor<S, K = NixSignaller> {
    source: S,
    tracker: StallTracker,
    escalator: KillEscalator<K>,
    resets: ResetReceiver,
    poll_interval: Duration,
    status: Option<StatusFile>,
    /// Child generation at the last acknowledged reset. The supervisor spawns
    /// right after the ack, so shutdown waits for that attempt to land.
    pending_spawn: Option<u64>,
}

impl<S: LivenessSource, K: Signaller> Monitor<S, K> {
    pub fn new(
        source: S,
        escalator: KillEscalator<K>,
        resets: ResetReceiver,
        settings: &Settings,
    ) -> Self {
        Self {
            source,
            tracker: StallTracker::new(settings.stall_threshold),
            escalator,
            resets,
            poll_interval: settings.poll_interval,
            status: settings.status_file.clone().map(StatusFile::new),
            pending_spawn: None,
        }
    }

    /// Handle ticks, resets and the shutdown signal one at a time until
    /// `shutdown` resolves. The child is stopped before returning.
    pub async fn run<F>(&mut self, shutdown: F) -> ShutdownSignal
    where
        F: Future<Output = ShutdownSignal>,
    {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        let mut resets_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll().await;
                }
                notice = self.resets.recv(), if resets_open => match notice {
                    Some(notice) => {
                        self.reset();
                        self.pending_spawn = Some(self.escalator.child().generation);
                        notice.acknowledge();
                    }
                    None => resets_open = false,
                },
                signal = &mut shutdown => {
                    tracing::info!(%signal, "shutdown signal received, stopping child");
                    self.publish(WatchState::ShuttingDown);
                    if let Some(generation) = self.pending_spawn.take() {
                        self.escalator.await_spawn(generation).await;
                    }
                    let outcome = self.escalator.terminate().await;
                    tracing::info!(?outcome, "child stopped");
                    return signal;
                }
            }
        }
    }

    /// Poll once and escalate if the stall threshold is reached.
    ///
    /// Returns the kill outcome when an escalation happened.
    pub async fn poll(&mut self) -> Option<KillOutcome> {
        let stalled = match self.sample().await {
            Ok((height, marker)) => {
                tracing::info!(height, number = marker.number, hash = %marker.hash, "read block");
                self.tracker.observe(height, Some(marker))
            }
            Err(e) => {
                tracing::warn!(error = %e, "poll failed");
                self.tracker.record_failure()
            }
        };

        tracing::info!(
            height = ?self.tracker.state().map(|s| s.last_height),
            stall_count = self.tracker.stall_count(),
            "status"
        );

        let outcome = if stalled {
            Some(self.escalate().await)
        } else {
            None
        };
        self.publish(self.current_state());
        outcome
    }

    /// Fetch the progress height and the block at that height.
    async fn sample(&self) -> Result<(u64, BlockMarker), PollError> {
        let height = match self.source.sync_progress().await? {
            Some(progress) => {
                tracing::debug!(
                    current = progress.current_block,
                    highest = progress.highest_block,
                    "node is syncing"
                );
                progress.current_block
            }
            None => self.source.block_number().await?,
        };
        if height == 0 {
            return Err(PollError::ZeroHeight);
        }

        let marker = self
            .source
            .block_by_number(height)
            .await?
            .ok_or(PollError::MissingBlock(height))?;
        Ok((height, marker))
    }

    async fn escalate(&mut self) -> KillOutcome {
        tracing::warn!(
            stall_count = self.tracker.stall_count(),
            threshold = self.tracker.threshold(),
            "chain stalled, terminating child"
        );
        self.publish(WatchState::Escalating);

        let outcome = self.escalator.terminate().await;
        if outcome.succeeded() {
            self.tracker.reset();
        }
        outcome
    }

    fn reset(&mut self) {
        self.tracker.reset();
        tracing::info!("stall state cleared");
        self.publish(WatchState::Waiting);
    }

    fn current_state(&self) -> WatchState {
        match self.tracker.state() {
            None => WatchState::Waiting,
            Some(s) if s.stall_count == 0 => WatchState::Tracking,
            Some(_) => WatchState::Stalled,
        }
    }

    fn publish(&self, state: WatchState) {
        let Some(file) = &self.status else {
            return;
        };
        let child = self.escalator.child();
        let tracked = self.tracker.state();
        let data = StatusData {
            pid: std::process::id(),
            child_pid: child.pid,
            generation: child.generation,
            state,
            height: tracked.map(|s| s.last_height),
            block_hash: tracked
                .and_then(|s| s.last_marker.as_ref())
                .map(|m| m.hash.clone()),
            stall_count: self.tracker.stall_count(),
            stall_threshold: self.tracker.threshold(),
            last_update: Utc::now(),
        };
        if let Err(e) = file.write(&data) {
            tracing::warn!(error = %e, path = %file.path().display(), "failed to write status file");
        }
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &StallTracker {
        &self.tracker
    }
}

/// Why a poll produced no usable height.
#[derive(Debug)]
pub enum PollError {
    Rpc(RpcError),
    ZeroHeight,
    MissingBlock(u64),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Rpc(e) => write!(f, "{e}"),
            PollError::ZeroHeight => write!(f, "node reported height 0"),
            PollError::MissingBlock(height) => write!(f, "no block at height {height}"),
        }
    }
}

impl std::error::Error for PollError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RpcError> for PollError {
    fn from(e: RpcError) -> Self {
        PollError::Rpc(e)
    }
}
