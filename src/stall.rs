use crate::rpc::BlockMarker;
use tracing::{debug, warn};

/// Height fed to the tracker when a poll produced no usable height.
///
/// Zero never exceeds a recorded height, so a failed poll always counts as
/// a stall tick.
pub const FAILED_POLL: u64 = 0;

/// Progress last confirmed for the current child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallState {
    pub last_height: u64,
    /// Diagnostics only.
    pub last_marker: Option<BlockMarker>,
    /// Consecutive polls (failed or not) without forward progress.
    pub stall_count: u32,
}

/// Tracks consecutive polls without chain progress.
///
/// State is absent after construction and after every `reset`, so each
/// child is judged only on its own progress.
#[derive(Debug)]
pub struct StallTracker {
    threshold: u32,
    state: Option<StallState>,
}

impl StallTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            state: None,
        }
    }

    /// Feed a freshly polled height. Returns `true` once the stall count has
    /// reached the threshold.
    pub fn observe(&mut self, height: u64, marker: Option<BlockMarker>) -> bool {
        let state = match self.state.as_mut() {
            None => {
                debug!(height, "first observation for this child");
                self.state = Some(StallState {
                    last_height: height,
                    last_marker: marker,
                    stall_count: 0,
                });
                return false;
            }
            Some(state) => state,
        };

        if height > state.last_height {
            state.last_height = height;
            state.last_marker = marker;
            state.stall_count = 0;
            return false;
        }

        state.stall_count = state.stall_count.saturating_add(1);
        let stalled = state.stall_count >= self.threshold;
        if stalled {
            warn!(
                height = state.last_height,
                stall_count = state.stall_count,
                threshold = self.threshold,
                "stall threshold reached"
            );
        }
        stalled
    }

    /// Count a failed poll as a poll without progress.
    pub fn record_failure(&mut self) -> bool {
        self.observe(FAILED_POLL, None)
    }

    /// Discard all state.
    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn state(&self) -> Option<&StallState> {
        self.state.as_ref()
    }

    /// Current stall count (0 when no state is held).
    pub fn stall_count(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.stall_count)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
