//! Teardown of processes a step left bound to its program description.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::ReapError;
use crate::config::ReaperConfig;
use crate::fabric::{FabricError, QswFabric, TaskSignal};

/// Escalation tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// First sleep between attempts; doubles every round.
    pub backoff_unit: Duration,
    /// Destroy attempts before giving up. `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl From<&ReaperConfig> for ReapPolicy {
    fn from(cfg: &ReaperConfig) -> Self {
        Self {
            backoff_unit: cfg.backoff_unit(),
            max_attempts: cfg.max_attempts,
        }
    }
}

/// One escalation round: the signal sent and the sleep that followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub signal: TaskSignal,
    pub sleep: Duration,
}

/// What it took to destroy the program description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub escalations: Vec<Escalation>,
}

/// Destroy program description `prognum`, signalling and waiting while
/// processes remain attached. The first round sends `SIGTERM`, later rounds
/// `SIGKILL`; the wait doubles each round.
///
/// An unknown program counts as already destroyed.
///
/// # Errors
///
/// - `Stubborn` once `max_attempts` destroy attempts have failed
/// - `Destroy` for any failure other than attached children
pub fn reap(
    fabric: &dyn QswFabric,
    prognum: u32,
    policy: &ReapPolicy,
) -> Result<ReapReport, ReapError> {
    let mut report = ReapReport::default();
    let mut sleep = policy.backoff_unit;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match fabric.prg_destroy(prognum) {
            Ok(()) => {
                if !report.escalations.is_empty() {
                    info!(prognum, attempts, "program description destroyed");
                }
                return Ok(report);
            }
            Err(FabricError::UnknownProgram(_)) => {
                debug!(prognum, "program description already gone");
                return Ok(report);
            }
            Err(FabricError::ChildrenAttached { .. }) => {}
            Err(e) => {
                error!(prognum, error = %e, "can't destroy program description");
                return Err(ReapError::Destroy(e));
            }
        }

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            error!(prognum, attempts, "processes still attached, giving up");
            return Err(ReapError::Stubborn { attempts });
        }

        let signal = if report.escalations.is_empty() {
            TaskSignal::Terminate
        } else {
            TaskSignal::Kill
        };
        match fabric.prg_signal(prognum, signal) {
            Ok(()) | Err(FabricError::UnknownProgram(_)) => {}
            Err(e) => warn!(prognum, %signal, error = %e, "can't signal attached processes"),
        }
        debug!(prognum, %signal, sleep_ms = sleep.as_millis(), "waiting for attached processes");
        std::thread::sleep(sleep);
        report.escalations.push(Escalation { signal, sleep });
        sleep = sleep.saturating_mul(2);
    }
}
