//! Per-step Elan capability descriptor.
//!
//! A descriptor starts empty ([`ElanJobInfo::default`]), is built once on the
//! controller, then travels to every node of the step in packed form. The
//! wire frame is `u32 length | u32 magic | postcard payload`, so a descriptor
//! can sit in the middle of a larger message.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use switch_sdk::{NodeBitmap, PlacementMode, ProgramFailureCause, SwitchError};

use super::error::DescriptorError;
use super::libstate::{Allocation, LibraryState};
use crate::fabric::{FabricError, QswFabric};

/// Tag identifying a packed Elan descriptor.
pub const JOBINFO_MAGIC: u32 = 0xf00f_f00e;

/// Rail mask of single-rail capabilities.
const DEFAULT_RAIL_MASK: u32 = 0x1;

/// Hardware capability of a step, as programmed into each node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElanCapability {
    /// Random key shared by all processes of the step.
    pub user_key: [u32; 4],
    pub placement: PlacementMode,
    /// First hardware context reserved for the step on each node.
    pub low_context: u32,
    /// Last hardware context reserved for the step on each node.
    pub high_context: u32,
    pub low_node: u32,
    pub high_node: u32,
    /// Number of virtual processes.
    pub entries: u32,
    pub rail_mask: u32,
}

/// A built step: placement, node set and the capability derived from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCapability {
    /// Program description number; unique among live steps.
    pub prognum: u32,
    pub nprocs: u32,
    pub nodeset: NodeBitmap,
    pub cap: ElanCapability,
    /// Node ID hosting each rank.
    pub task_map: Vec<u32>,
}

/// Opaque-to-callers descriptor handed through the plugin surface.
///
/// Only the descriptor returned by [`ElanJobInfo::allocate`] owns the
/// library state reservation. Clones and unpacked copies describe the same
/// step but never release it. Equality ignores ownership.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ElanJobInfo {
    step: Option<StepCapability>,
    #[serde(skip)]
    owns_allocation: bool,
}

impl Clone for ElanJobInfo {
    fn clone(&self) -> Self {
        Self {
            step: self.step.clone(),
            owns_allocation: false,
        }
    }
}

impl PartialEq for ElanJobInfo {
    fn eq(&self, other: &Self) -> bool {
        self.step == other.step
    }
}

impl Eq for ElanJobInfo {}

impl ElanJobInfo {
    /// Build a descriptor for `nprocs` processes on `nodeset`, reserving a
    /// program number and context range from `state`.
    ///
    /// # Errors
    ///
    /// - `BadTaskCount` if `nprocs` is zero, above the bitmap capacity, or
    ///   below the number of nodes, or if `nodeset` is empty
    /// - `State` if `state` has no room for the step
    pub fn allocate(
        nprocs: u32,
        nodeset: NodeBitmap,
        placement: PlacementMode,
        state: &mut LibraryState,
    ) -> Result<Self, DescriptorError> {
        let max = nodeset.capacity();
        let nnodes = nodeset.count();
        let bad_count = DescriptorError::BadTaskCount {
            requested: nprocs,
            max,
        };
        let (Some(low_node), Some(high_node)) = (nodeset.first(), nodeset.last()) else {
            return Err(bad_count);
        };
        if nprocs == 0 || nprocs > max || nnodes > nprocs {
            return Err(bad_count);
        }

        let task_map = layout_tasks(&nodeset, nprocs, placement);
        let width = nprocs.div_ceil(nnodes);
        let allocation = state.allocate(width)?;

        let step = StepCapability {
            prognum: allocation.prognum,
            nprocs,
            cap: ElanCapability {
                user_key: rand::random(),
                placement,
                low_context: allocation.low_context,
                high_context: allocation.high_context,
                low_node,
                high_node,
                entries: nprocs,
                rail_mask: DEFAULT_RAIL_MASK,
            },
            nodeset,
            task_map,
        };
        tracing::debug!(
            prognum = step.prognum,
            nprocs,
            %placement,
            nodes = %step.nodeset,
            "built elan capability"
        );
        Ok(Self {
            step: Some(step),
            owns_allocation: true,
        })
    }

    /// The built step, if any.
    #[must_use]
    pub fn step(&self) -> Option<&StepCapability> {
        self.step.as_ref()
    }

    /// The built step.
    ///
    /// # Errors
    ///
    /// `NotBuilt` for a descriptor that was allocated but never built.
    pub fn built(&self) -> Result<&StepCapability, DescriptorError> {
        self.step.as_ref().ok_or(DescriptorError::NotBuilt)
    }

    /// Whether dropping this descriptor's step should release its
    /// reservation.
    #[must_use]
    pub fn owns_allocation(&self) -> bool {
        self.owns_allocation
    }

    /// Empty the descriptor, returning the step and whether it owned the
    /// reservation.
    pub(crate) fn take(&mut self) -> Option<(StepCapability, bool)> {
        let owned = std::mem::take(&mut self.owns_allocation);
        self.step.take().map(|step| (step, owned))
    }

    /// Append the framed wire form to `buf`.
    ///
    /// # Errors
    ///
    /// `Encode` if postcard cannot serialize the descriptor.
    pub fn pack(&self, buf: &mut BytesMut) -> Result<(), DescriptorError> {
        let payload = postcard::to_allocvec(self).map_err(DescriptorError::Encode)?;
        let len = u32::try_from(payload.len() + 4)
            .map_err(|_| DescriptorError::Inconsistent("descriptor too large".to_owned()))?;
        buf.reserve(payload.len() + 8);
        buf.put_u32(len);
        buf.put_u32(JOBINFO_MAGIC);
        buf.put_slice(&payload);
        Ok(())
    }

    /// Read one framed descriptor from the front of `buf`.
    ///
    /// On error `buf` is left wherever decoding stopped; the caller is
    /// expected to discard the whole message.
    ///
    /// # Errors
    ///
    /// `Truncated`, `BadMagic`, `Decode` or `Inconsistent` for input that is
    /// not a valid descriptor.
    pub fn unpack(buf: &mut Bytes) -> Result<Self, DescriptorError> {
        ensure_remaining(buf, 8)?;
        let len = buf.get_u32() as usize;
        let magic = buf.get_u32();
        if magic != JOBINFO_MAGIC {
            return Err(DescriptorError::BadMagic(magic));
        }
        let payload_len = len
            .checked_sub(4)
            .ok_or_else(|| DescriptorError::Inconsistent(format!("frame length {len}")))?;
        ensure_remaining(buf, payload_len)?;
        let payload = buf.split_to(payload_len);

        let (jobinfo, rest): (Self, &[u8]) =
            postcard::take_from_bytes(&payload[..]).map_err(DescriptorError::Decode)?;
        if !rest.is_empty() {
            return Err(DescriptorError::Inconsistent(format!(
                "{} trailing bytes in descriptor frame",
                rest.len()
            )));
        }
        if let Some(step) = &jobinfo.step {
            step.validate()?;
        }
        Ok(jobinfo)
    }

    /// Install the capability on this node for `uid`.
    ///
    /// # Errors
    ///
    /// `InterconnectProgram`, with the missing-kernel-module cause when the
    /// driver device is absent.
    pub fn program_local(&self, fabric: &dyn QswFabric, uid: u32) -> Result<(), SwitchError> {
        self.built()?;
        fabric
            .prog_init(self, uid)
            .map_err(|e| program_failure(&e))
    }
}

/// Map a driver rejection onto the plugin surface error.
pub(crate) fn program_failure(err: &FabricError) -> SwitchError {
    let cause = match err {
        FabricError::DeviceUnavailable(_) => ProgramFailureCause::MissingKernelModule,
        _ => ProgramFailureCause::Rejected,
    };
    SwitchError::InterconnectProgram {
        cause,
        detail: err.to_string(),
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), DescriptorError> {
    if buf.remaining() < needed {
        return Err(DescriptorError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn layout_tasks(nodeset: &NodeBitmap, nprocs: u32, placement: PlacementMode) -> Vec<u32> {
    let nodes: Vec<u32> = nodeset.iter().collect();
    let nnodes = u32::try_from(nodes.len()).unwrap_or(u32::MAX);
    match placement {
        PlacementMode::Cyclic => (0..nprocs)
            .map(|rank| nodes[rank.rem_euclid(nnodes) as usize])
            .collect(),
        PlacementMode::Block => {
            let base = nprocs.div_euclid(nnodes);
            let extra = nprocs.rem_euclid(nnodes);
            nodes
                .iter()
                .zip(0u32..)
                .flat_map(|(&node, i)| {
                    let here = base + u32::from(i < extra);
                    std::iter::repeat_n(node, here as usize)
                })
                .collect()
        }
    }
}

impl StepCapability {
    /// The library state reservation this step was built from.
    #[must_use]
    pub fn allocation(&self) -> Allocation {
        Allocation {
            prognum: self.prognum,
            low_context: self.cap.low_context,
            high_context: self.cap.high_context,
        }
    }

    /// Highest number of ranks placed on one node.
    #[must_use]
    pub fn tasks_per_node(&self) -> u32 {
        let mut counts = std::collections::BTreeMap::<u32, u32>::new();
        for &node in &self.task_map {
            *counts.entry(node).or_default() += 1;
        }
        counts.into_values().max().unwrap_or(0)
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        let bad = |msg: String| Err(DescriptorError::Inconsistent(msg));
        let nnodes = self.nodeset.count();

        if self.nprocs == 0 || self.nprocs > self.nodeset.capacity() {
            return bad(format!("process count {}", self.nprocs));
        }
        if self.task_map.len() != self.nprocs as usize {
            return bad(format!(
                "declared {} processes but task map has {} entries",
                self.nprocs,
                self.task_map.len()
            ));
        }
        if nnodes == 0 || nnodes > self.nprocs {
            return bad(format!(
                "{nnodes} nodes set for {} processes",
                self.nprocs
            ));
        }
        if let Some(node) = self.task_map.iter().find(|&&n| !self.nodeset.contains(n)) {
            return bad(format!("task placed on node {node} outside the node set"));
        }
        let mut used = NodeBitmap::new(self.nodeset.capacity());
        for &node in &self.task_map {
            used.set(node);
        }
        if used != self.nodeset {
            return bad("node set contains nodes without tasks".to_owned());
        }
        if self.cap.entries != self.nprocs {
            return bad(format!(
                "capability has {} entries for {} processes",
                self.cap.entries, self.nprocs
            ));
        }
        if Some(self.cap.low_node) != self.nodeset.first()
            || Some(self.cap.high_node) != self.nodeset.last()
        {
            return bad("capability node range does not match node set".to_owned());
        }
        if self.cap.high_context < self.cap.low_context
            || self.cap.high_context - self.cap.low_context + 1 < self.tasks_per_node()
        {
            return bad(format!(
                "context range {:#x}-{:#x} too small for {} tasks per node",
                self.cap.low_context,
                self.cap.high_context,
                self.tasks_per_node()
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ElanCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [k0, k1, k2, k3] = self.user_key;
        write!(
            f,
            "key={k0:08x}.{k1:08x}.{k2:08x}.{k3:08x} type={} ctx={:#x}-{:#x} nodes={}-{} entries={} rail={:#x}",
            self.placement,
            self.low_context,
            self.high_context,
            self.low_node,
            self.high_node,
            self.entries,
            self.rail_mask
        )
    }
}

impl fmt::Display for ElanJobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "prg={} {} nodeset=[{}]", step.prognum, step.cap, step.nodeset),
            None => f.write_str("(unbuilt)"),
        }
    }
}
