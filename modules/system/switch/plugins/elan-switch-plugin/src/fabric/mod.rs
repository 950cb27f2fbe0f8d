//! Hardware seam between the plugin and the Elan driver stack.
//!
//! Every call the plugin makes into the interconnect goes through
//! [`QswFabric`], so the domain logic can run against the loopback fabric in
//! development and against scripted fabrics in tests.

#[cfg(unix)]
mod loopback;
#[cfg(test)]
pub mod testing;

#[cfg(unix)]
pub use loopback::LoopbackFabric;

use std::fmt;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::jobinfo::ElanJobInfo;

/// Signal delivered to every process of a program description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSignal {
    /// Polite request to exit (`SIGTERM`).
    Terminate,
    /// Forced exit (`SIGKILL`).
    Kill,
}

impl fmt::Display for TaskSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => f.write_str("SIGTERM"),
            Self::Kill => f.write_str("SIGKILL"),
        }
    }
}

/// Errors reported by the interconnect driver stack.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The program description still has live processes attached.
    #[error("program description {prognum} still has attached processes")]
    ChildrenAttached { prognum: u32 },

    /// The fault resolver endpoint is already owned by another instance.
    #[error("fault resolver endpoint already in use")]
    AddressInUse,

    /// The driver device is missing, usually because the kernel module is
    /// not loaded.
    #[error("interconnect device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("unknown program description {0}")]
    UnknownProgram(u32),

    #[error("capability rejected: {0}")]
    Rejected(String),

    #[error("interconnect I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the plugin needs from the Elan driver stack.
pub trait QswFabric: Send + Sync {
    /// Highest node ID known to the fabric, if any.
    fn max_node_id(&self) -> Option<u32>;

    /// Interconnect node ID of `host`.
    fn node_id_by_host(&self, host: &str) -> Option<u32>;

    /// Hostname of interconnect node `node_id`.
    fn host_by_node_id(&self, node_id: u32) -> Option<String>;

    /// Create the program description for a step and install its
    /// capability on this node.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when the driver cannot be reached, `Rejected` when
    /// the capability is refused.
    fn prog_init(&self, jobinfo: &ElanJobInfo, uid: u32) -> Result<(), FabricError>;

    /// Remove the step's capability from this node. The program description
    /// stays until [`QswFabric::prg_destroy`] succeeds.
    fn prog_fini(&self, jobinfo: &ElanJobInfo);

    /// Bind process `pid`, task `proc_id` of the step, to the capability.
    ///
    /// # Errors
    ///
    /// `UnknownProgram` if `prog_init` was not called for this step.
    fn set_capability(&self, jobinfo: &ElanJobInfo, proc_id: u32, pid: u32)
    -> Result<(), FabricError>;

    /// Destroy a program description.
    ///
    /// # Errors
    ///
    /// `ChildrenAttached` while processes are still bound to it.
    fn prg_destroy(&self, prognum: u32) -> Result<(), FabricError>;

    /// Signal every process bound to a program description.
    ///
    /// # Errors
    ///
    /// `UnknownProgram` if the description does not exist.
    fn prg_signal(&self, prognum: u32, signal: TaskSignal) -> Result<(), FabricError>;

    /// Prepare the network error resolver service.
    ///
    /// # Errors
    ///
    /// Any driver failure.
    fn init_neterr_svc(&self) -> Result<(), FabricError>;

    /// Teach the error resolver the hostname of a node.
    ///
    /// # Errors
    ///
    /// Any driver failure.
    fn load_neterr_svc(&self, node_id: u32, host: &str) -> Result<(), FabricError>;

    /// Register this process as the node's error resolver.
    ///
    /// # Errors
    ///
    /// `AddressInUse` when another resolver is already registered.
    fn register_neterr_svc(&self) -> Result<(), FabricError>;

    /// Service fault reports until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Any driver failure that ends the service.
    fn run_neterr_svc(&self, cancel: &CancellationToken) -> Result<(), FabricError>;
}
