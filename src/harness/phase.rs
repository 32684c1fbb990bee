//! Phase names, per-phase durations and the session state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Independently timed stage of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Setup,
    PrepareEnv,
    Kernel,
    FreeMemory,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Setup,
        Phase::PrepareEnv,
        Phase::Kernel,
        Phase::FreeMemory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::PrepareEnv => "prepare_env",
            Phase::Kernel => "kernel",
            Phase::FreeMemory => "free_memory",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One optional duration per [`Phase`]. A phase that never ran has no entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub setup: Option<Duration>,
    pub prepare_env: Option<Duration>,
    pub kernel: Option<Duration>,
    pub free_memory: Option<Duration>,
}

impl PhaseTimings {
    pub fn get(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::Setup => self.setup,
            Phase::PrepareEnv => self.prepare_env,
            Phase::Kernel => self.kernel,
            Phase::FreeMemory => self.free_memory,
        }
    }

    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        let slot = match phase {
            Phase::Setup => &mut self.setup,
            Phase::PrepareEnv => &mut self.prepare_env,
            Phase::Kernel => &mut self.kernel,
            Phase::FreeMemory => &mut self.free_memory,
        };
        *slot = Some(elapsed);
    }

    /// Phases that produced a measurement, in execution order.
    pub fn recorded(&self) -> impl Iterator<Item = (Phase, Duration)> + '_ {
        Phase::ALL
            .iter()
            .filter_map(move |&p| self.get(p).map(|d| (p, d)))
    }

    pub fn is_complete(&self) -> bool {
        Phase::ALL.iter().all(|&p| self.get(p).is_some())
    }

    pub fn total(&self) -> Duration {
        self.recorded().map(|(_, d)| d).sum()
    }
}

/// Measures one phase from construction until [`PhaseTimer::stop`].
#[derive(Debug)]
pub struct PhaseTimer {
    phase: Phase,
    start: Instant,
}

impl PhaseTimer {
    pub fn start(phase: Phase) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }

    pub fn stop(self, timings: &mut PhaseTimings) -> Duration {
        let elapsed = self.start.elapsed();
        timings.record(self.phase, elapsed);
        elapsed
    }
}

/// Lifecycle of one session. No state is revisited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Initializing,
    Preparing,
    Executing,
    CopyingBack,
    TearingDown,
    Done,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Preparing)
                | (Initializing, Done)
                | (Preparing, Executing)
                | (Preparing, TearingDown)
                | (Executing, CopyingBack)
                | (Executing, TearingDown)
                | (CopyingBack, TearingDown)
                | (TearingDown, Done)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
