//! Session harness: one complete host → device → host round trip.
//!
//! A session selects the configured device, resets it, then runs the three
//! caller-supplied operations of a [`SessionProgram`] (environment
//! preparation, kernel sequence, copy-back) through a [`DeviceSession`]. Every
//! allocation made through that session is released during teardown, which
//! runs whenever setup succeeded, including after a failed phase.
//!
//! Failures are carried as data: the first error of the session is stored in
//! [`SessionResult::error`] and later non-teardown phases are skipped.

pub mod environment;
pub mod phase;
pub mod session;

pub use environment::{DeviceArrayRef, EnvironmentBuilder, StagedEnvironment};
pub use phase::{Phase, PhaseTimer, PhaseTimings, SessionState};
pub use session::{Allocation, DeviceSession, TeardownReport};

use crate::config::HarnessConfig;
use crate::device::Device;
use crate::error::{ErrorCode, HarnessError};
use serde::Serialize;
use std::marker::PhantomData;
use tracing::{debug, info, info_span, warn};

/// The three insertion points of a session, supplied by the caller.
///
/// `Staged` carries whatever the preparation step produced (typically device
/// slices) into the later steps. Every device allocation must go through the
/// provided [`DeviceSession`] so teardown can release it.
pub trait SessionProgram {
    type Environment;
    type Staged;
    type Output;

    /// Allocate device memory and mirror the environment onto the device.
    fn prepare_environment(
        &mut self,
        session: &mut DeviceSession<'_>,
        env: &Self::Environment,
    ) -> Result<Self::Staged, HarnessError>;

    /// Run one or more kernel invocation units, in order.
    fn launch_kernels(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &mut Self::Staged,
    ) -> Result<(), HarnessError>;

    /// Copy device-resident results into a host buffer.
    fn copy_back(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &Self::Staged,
    ) -> Result<Vec<Self::Output>, HarnessError>;
}

/// [`SessionProgram`] assembled from three closures.
pub struct ClosureProgram<E, S, R, P, K, C> {
    prepare: P,
    launch: K,
    copy_back: C,
    _marker: PhantomData<fn(&E) -> (S, R)>,
}

/// Build a [`SessionProgram`] from closures.
pub fn program_fn<E, S, R, P, K, C>(
    prepare: P,
    launch: K,
    copy_back: C,
) -> ClosureProgram<E, S, R, P, K, C>
where
    P: FnMut(&mut DeviceSession<'_>, &E) -> Result<S, HarnessError>,
    K: FnMut(&mut DeviceSession<'_>, &mut S) -> Result<(), HarnessError>,
    C: FnMut(&mut DeviceSession<'_>, &S) -> Result<Vec<R>, HarnessError>,
{
    ClosureProgram {
        prepare,
        launch,
        copy_back,
        _marker: PhantomData,
    }
}

impl<E, S, R, P, K, C> SessionProgram for ClosureProgram<E, S, R, P, K, C>
where
    P: FnMut(&mut DeviceSession<'_>, &E) -> Result<S, HarnessError>,
    K: FnMut(&mut DeviceSession<'_>, &mut S) -> Result<(), HarnessError>,
    C: FnMut(&mut DeviceSession<'_>, &S) -> Result<Vec<R>, HarnessError>,
{
    type Environment = E;
    type Staged = S;
    type Output = R;

    fn prepare_environment(
        &mut self,
        session: &mut DeviceSession<'_>,
        env: &E,
    ) -> Result<S, HarnessError> {
        (self.prepare)(session, env)
    }

    fn launch_kernels(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &mut S,
    ) -> Result<(), HarnessError> {
        (self.launch)(session, staged)
    }

    fn copy_back(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &S,
    ) -> Result<Vec<R>, HarnessError> {
        (self.copy_back)(session, staged)
    }
}

/// Everything a session reports back to its caller.
#[derive(Clone, Debug, Serialize)]
pub struct SessionResult<R> {
    /// First failure of the session, `Success` otherwise.
    pub error: ErrorCode,
    /// Display form of the failure behind `error`.
    pub failure: Option<String>,
    pub timings: PhaseTimings,
    /// Allocations still owned by the session when teardown ran.
    pub released_allocations: usize,
    /// Host output buffer, set once copy-back succeeded.
    pub output: Option<Vec<R>>,
    pub final_state: SessionState,
}

impl<R> Default for SessionResult<R> {
    fn default() -> Self {
        Self {
            error: ErrorCode::Success,
            failure: None,
            timings: PhaseTimings::default(),
            released_allocations: 0,
            output: None,
            final_state: SessionState::Idle,
        }
    }
}

impl<R> SessionResult<R> {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.error.is_success()
    }

    /// Store `err` unless an earlier failure was already recorded.
    pub fn record_failure(&mut self, err: &HarnessError) {
        if self.error.is_success() {
            self.error = err.code();
            self.failure = Some(err.to_string());
        }
    }

    /// Output buffer if the session succeeded.
    pub fn into_output(self) -> Result<Vec<R>, ErrorCode> {
        match (self.error, self.output) {
            (ErrorCode::Success, Some(out)) => Ok(out),
            (ErrorCode::Success, None) => Ok(Vec::new()),
            (code, _) => Err(code),
        }
    }
}

fn advance(state: &mut SessionState, next: SessionState) {
    debug_assert!(
        state.can_advance_to(next),
        "illegal session transition {state} -> {next}"
    );
    debug!(from = %*state, to = %next, "session state");
    *state = next;
}

#[derive(Clone, Debug, Default)]
pub struct SessionHarness {
    config: HarnessConfig,
}

impl SessionHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(HarnessConfig::from_env())
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run one session on `device`. Never fails: errors are reported through
    /// the returned [`SessionResult`].
    pub fn run<P: SessionProgram>(
        &self,
        device: &mut dyn Device,
        program: &mut P,
        env: &P::Environment,
    ) -> SessionResult<P::Output> {
        let ordinal = self.config.device_ordinal;
        let span = info_span!("session", device = device.name(), ordinal);
        let _enter = span.enter();

        let mut result = SessionResult::default();
        let mut state = SessionState::Idle;
        advance(&mut state, SessionState::Initializing);

        let timer = PhaseTimer::start(Phase::Setup);
        if let Err(err) = device.select(ordinal) {
            let err = match err {
                e @ HarnessError::DeviceUnavailable { .. } => e,
                other => HarnessError::DeviceUnavailable {
                    ordinal,
                    reason: other.to_string(),
                },
            };
            warn!(error = %err, "device selection failed");
            result.record_failure(&err);
            advance(&mut state, SessionState::Done);
            result.final_state = state;
            return result;
        }
        if let Err(err) = device.reset() {
            warn!(error = %err, "device reset failed");
            result.record_failure(&err);
            advance(&mut state, SessionState::Done);
            result.final_state = state;
            return result;
        }
        timer.stop(&mut result.timings);

        let mut session = DeviceSession::new(device, self.config.clone());
        Self::run_phases(&mut session, program, env, &mut result, &mut state);

        advance(&mut state, SessionState::TearingDown);
        let timer = PhaseTimer::start(Phase::FreeMemory);
        let report = session.teardown();
        timer.stop(&mut result.timings);
        result.released_allocations = report.released.len();
        if let Some(err) = report.first_error {
            result.record_failure(&err);
        }

        advance(&mut state, SessionState::Done);
        result.final_state = state;
        info!(
            error = %result.error,
            released = result.released_allocations,
            total_us = result.timings.total().as_micros() as u64,
            "session finished"
        );
        result
    }

    fn run_phases<P: SessionProgram>(
        session: &mut DeviceSession<'_>,
        program: &mut P,
        env: &P::Environment,
        result: &mut SessionResult<P::Output>,
        state: &mut SessionState,
    ) {
        advance(state, SessionState::Preparing);
        let timer = PhaseTimer::start(Phase::PrepareEnv);
        let staged = program.prepare_environment(session, env);
        timer.stop(&mut result.timings);
        let mut staged = match staged {
            Ok(s) => s,
            Err(err) => {
                warn!(phase = %Phase::PrepareEnv, error = %err, "phase failed");
                result.record_failure(&err);
                return;
            }
        };

        advance(state, SessionState::Executing);
        let timer = PhaseTimer::start(Phase::Kernel);
        let launched = program.launch_kernels(session, &mut staged);
        timer.stop(&mut result.timings);
        if let Err(err) = launched {
            warn!(phase = %Phase::Kernel, error = %err, "phase failed");
            result.record_failure(&err);
            return;
        }

        advance(state, SessionState::CopyingBack);
        match program.copy_back(session, &staged) {
            Ok(out) => result.output = Some(out),
            Err(err) => {
                warn!(phase = "copy_back", error = %err, "phase failed");
                result.record_failure(&err);
            }
        }
    }
}
