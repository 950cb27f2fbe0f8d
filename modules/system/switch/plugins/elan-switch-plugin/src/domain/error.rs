//! Domain errors of the Elan switch plugin and their mapping onto
//! [`SwitchError`].

use std::path::PathBuf;

use switch_sdk::SwitchError;
use thiserror::Error;

use crate::fabric::FabricError;

/// Failures while turning a host list into a node bitmap.
#[derive(Error, Debug)]
pub enum NodeSetError {
    #[error("{requested} processes exceed the hardware capacity of {max}")]
    CapacityExceeded { requested: u32, max: u32 },

    /// Every host that could not be mapped to a node ID, in input order.
    #[error("cannot resolve host(s) {}", hosts.join(","))]
    Unresolved { hosts: Vec<String> },
}

/// Failures building or decoding a capability descriptor.
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("bad task count {requested} (maximum {max})")]
    BadTaskCount { requested: u32, max: u32 },

    #[error("descriptor has not been built")]
    NotBuilt,

    #[error("truncated descriptor: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("bad descriptor magic {0:#010x}")]
    BadMagic(u32),

    #[error("descriptor decode failed: {0}")]
    Decode(#[source] postcard::Error),

    #[error("descriptor encode failed: {0}")]
    Encode(#[source] postcard::Error),

    #[error("inconsistent descriptor: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    State(#[from] LibStateError),
}

/// Failures of the allocation state and its recovery file.
#[derive(Error, Debug)]
pub enum LibStateError {
    #[error("no free range of {width} hardware contexts")]
    ContextsExhausted { width: u32 },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("truncated state: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("bad state magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported state version {0}")]
    UnsupportedVersion(u8),

    #[error("state decode failed: {0}")]
    Decode(#[source] postcard::Error),

    #[error("state encode failed: {0}")]
    Encode(#[source] postcard::Error),

    #[error("state too large to encode")]
    TooLarge,

    #[error("inconsistent state: {0}")]
    Inconsistent(String),
}

impl LibStateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of the fault resolver worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NeterrError {
    #[error("can't spawn fault resolver thread: {0}")]
    Spawn(String),

    #[error("fault service init failed: {0}")]
    Init(String),

    #[error("fault service registration failed: {0}")]
    Register(String),

    #[error("fault resolver thread exited before reporting")]
    WorkerLost,

    #[error("fault resolver is not running")]
    NotRunning,

    #[error("fault resolver did not stop within the grace period")]
    StopTimeout,
}

/// Failures tearing down a step's processes.
#[derive(Error, Debug)]
pub enum ReapError {
    #[error("processes still attached after {attempts} destroy attempts")]
    Stubborn { attempts: u32 },

    #[error("can't destroy program description: {0}")]
    Destroy(#[source] FabricError),
}

impl From<NodeSetError> for SwitchError {
    fn from(e: NodeSetError) -> Self {
        match e {
            NodeSetError::CapacityExceeded { requested, max } => {
                SwitchError::BadTaskCount { requested, max }
            }
            NodeSetError::Unresolved { hosts } => SwitchError::InterconnectResolution { hosts },
        }
    }
}

impl From<LibStateError> for SwitchError {
    fn from(e: LibStateError) -> Self {
        match e {
            LibStateError::ContextsExhausted { .. } => SwitchError::ResourcesExhausted(e.to_string()),
            other => SwitchError::Internal(other.to_string()),
        }
    }
}

impl From<DescriptorError> for SwitchError {
    fn from(e: DescriptorError) -> Self {
        match e {
            DescriptorError::BadTaskCount { requested, max } => {
                SwitchError::BadTaskCount { requested, max }
            }
            DescriptorError::State(state) => state.into(),
            DescriptorError::Encode(_) | DescriptorError::NotBuilt => {
                SwitchError::Internal(e.to_string())
            }
            DescriptorError::Truncated { .. }
            | DescriptorError::BadMagic(_)
            | DescriptorError::Decode(_)
            | DescriptorError::Inconsistent(_) => SwitchError::MalformedDescriptor(e.to_string()),
        }
    }
}

impl From<NeterrError> for SwitchError {
    fn from(e: NeterrError) -> Self {
        SwitchError::NodeInit(e.to_string())
    }
}

impl From<ReapError> for SwitchError {
    fn from(e: ReapError) -> Self {
        match e {
            ReapError::Stubborn { attempts } => SwitchError::StubbornProcesses { attempts },
            ReapError::Destroy(_) => SwitchError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_exceeded_surfaces_as_bad_task_count() {
        let err: SwitchError = NodeSetError::CapacityExceeded {
            requested: 9,
            max: 8,
        }
        .into();
        assert!(matches!(
            err,
            SwitchError::BadTaskCount {
                requested: 9,
                max: 8
            }
        ));
    }

    #[test]
    fn unresolved_hosts_are_all_named() {
        let err: SwitchError = NodeSetError::Unresolved {
            hosts: vec!["n4".to_owned(), "n9".to_owned()],
        }
        .into();
        assert_eq!(
            err.to_string(),
            "interconnect failure: cannot resolve host(s) n4,n9"
        );
    }

    #[test]
    fn decode_failures_are_malformed_descriptors() {
        let err: SwitchError = DescriptorError::Truncated {
            needed: 8,
            available: 3,
        }
        .into();
        assert!(matches!(err, SwitchError::MalformedDescriptor(_)));
        assert!(err.is_validation());

        let err: SwitchError = DescriptorError::BadMagic(0xdead_beef).into();
        assert!(err.to_string().contains("0xdeadbeef"), "{err}");
    }

    #[test]
    fn exhausted_contexts_are_resource_errors() {
        let err: SwitchError =
            DescriptorError::State(LibStateError::ContextsExhausted { width: 4 }).into();
        assert!(matches!(err, SwitchError::ResourcesExhausted(_)));
    }

    #[test]
    fn stubborn_processes_keep_attempt_count() {
        let err: SwitchError = ReapError::Stubborn { attempts: 6 }.into();
        assert!(matches!(err, SwitchError::StubbornProcesses { attempts: 6 }));
    }
}
