//! Error types for switch plugins.

use thiserror::Error;

/// Why the local interconnect refused a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramFailureCause {
    /// The driver device could not be opened. Usually the kernel module
    /// backing the interconnect is not loaded.
    MissingKernelModule,
    /// Any other rejection by the hardware or driver stack.
    Rejected,
}

/// Errors surfaced by a switch plugin to the workload manager.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// Process count is zero, exceeds the hardware task capacity, or cannot
    /// be placed on the requested node set.
    #[error("bad task count: {requested} (hardware maximum {max})")]
    BadTaskCount {
        /// Requested process count.
        requested: u32,
        /// Hardware task capacity.
        max: u32,
    },

    /// One or more hosts could not be mapped to an interconnect node ID.
    #[error("interconnect failure: cannot resolve host(s) {}", hosts.join(","))]
    InterconnectResolution {
        /// Every host that failed resolution, in input order.
        hosts: Vec<String>,
    },

    /// A packed descriptor was truncated or internally inconsistent.
    #[error("malformed switch descriptor: {0}")]
    MalformedDescriptor(String),

    /// The local interconnect rejected the capability.
    #[error("{}", program_failure_message(*cause, detail))]
    InterconnectProgram {
        /// Distinguishes a missing kernel component from other rejections.
        cause: ProgramFailureCause,
        /// Underlying driver message.
        detail: String,
    },

    /// No hardware contexts or program numbers are free for a new step.
    #[error("interconnect resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// Library state was used before `libstate_restore` or after teardown.
    #[error("switch library state is not initialized")]
    StateNotInitialized,

    /// Writing the recovery file failed.
    #[error("can't save switch state: {0}")]
    StateSave(String),

    /// Reading the recovery file failed.
    #[error("can't restore switch state: {0}")]
    StateRestore(String),

    /// The fault resolver service did not start.
    #[error("node initialization failed: {0}")]
    NodeInit(String),

    /// Processes bound to a step survived the configured number of kill
    /// attempts.
    #[error("step processes still attached after {attempts} kill attempts")]
    StubbornProcesses {
        /// Destroy attempts made before giving up.
        attempts: u32,
    },

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

fn program_failure_message(cause: ProgramFailureCause, detail: &str) -> String {
    match cause {
        ProgramFailureCause::MissingKernelModule => format!(
            "initializing interconnect: is the rms kernel module loaded? ({detail})"
        ),
        ProgramFailureCause::Rejected => format!("interconnect init failed: {detail}"),
    }
}

impl SwitchError {
    /// True when the error rejects the request itself and retrying the same
    /// input cannot succeed.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::BadTaskCount { .. } | Self::MalformedDescriptor(_)
        )
    }
}
