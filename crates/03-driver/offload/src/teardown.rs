use std::fmt;

/// Teardown steps, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    SignalStop,
    StopProcessor,
    Unregister,
    FreeBuffer,
    ClosePool,
    Detach,
    Destroy,
    /// Co-processor side: dropping its handle on the shared pool.
    ReleasePoolView,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Nothing to release; an earlier teardown (or a failed setup) already did.
    AlreadyReleased,
    Failed(String),
}

/// Outcome of every teardown step. Later steps run even when earlier ones fail.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    steps: Vec<(TeardownStep, StepOutcome)>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, step: TeardownStep, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Failed(reason) => {
                tracing::error!(%step, reason = %reason, "teardown step failed");
            }
            StepOutcome::Done => tracing::debug!(%step, "teardown step done"),
            StepOutcome::AlreadyReleased => {
                tracing::trace!(%step, "teardown step already released")
            }
        }
        self.steps.push((step, outcome));
    }

    /// Runs `op` if `live`, recording the result.
    pub(crate) fn step<E: fmt::Display>(
        &mut self,
        step: TeardownStep,
        live: bool,
        op: impl FnOnce() -> Result<(), E>,
    ) {
        let outcome = if !live {
            StepOutcome::AlreadyReleased
        } else {
            match op() {
                Ok(()) => StepOutcome::Done,
                Err(err) => StepOutcome::Failed(err.to_string()),
            }
        };
        self.record(step, outcome);
    }

    pub fn steps(&self) -> &[(TeardownStep, StepOutcome)] {
        &self.steps
    }

    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, outcome)| outcome)
    }

    /// The first failure, which stands as the overall status.
    pub fn first_failure(&self) -> Option<(TeardownStep, &str)> {
        self.steps.iter().find_map(|(step, outcome)| match outcome {
            StepOutcome::Failed(reason) => Some((*step, reason.as_str())),
            _ => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.first_failure().is_none()
    }

    /// Whether every step was a no-op.
    pub fn all_released(&self) -> bool {
        self.steps
            .iter()
            .all(|(_, outcome)| *outcome == StepOutcome::AlreadyReleased)
    }
}
