//! Switch SDK
//!
//! This crate provides the public API for interconnect switch plugins:
//!
//! - [`SwitchPluginClient`] - Plugin API trait driven by the workload manager
//! - [`HostList`], [`NodeBitmap`], [`PlacementMode`], [`TaskIdentity`] - Models
//! - [`SwitchError`] - Error types
//!
//! ## Usage
//!
//! ```ignore
//! use switch_sdk::{HostList, PlacementMode, SwitchPluginClient};
//!
//! plugin.libstate_restore(Some(state_dir))?;
//!
//! let mut jobinfo = plugin.alloc_jobinfo();
//! let hosts = HostList::parse("n[1-3]")?;
//! plugin.build_jobinfo(&mut jobinfo, &hosts, 3, PlacementMode::Block)?;
//!
//! let mut buf = bytes::BytesMut::new();
//! plugin.pack_jobinfo(&jobinfo, &mut buf)?;
//! ```

pub mod api;
pub mod error;
pub mod models;

pub use api::SwitchPluginClient;
pub use error::{ProgramFailureCause, SwitchError};
pub use models::{
    HostList, HostListError, MAX_HOSTLIST_EXPANSION, NodeBitmap, PlacementMode, PluginInfo,
    TaskIdentity,
};
