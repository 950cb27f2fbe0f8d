use switch_sdk::{HostList, NodeBitmap};
use tracing::error;

use super::error::NodeSetError;
use crate::fabric::QswFabric;

/// Maps a step's host list onto interconnect node IDs.
pub struct NodeSetBuilder<'a> {
    fabric: &'a dyn QswFabric,
    capacity: u32,
}

impl<'a> NodeSetBuilder<'a> {
    /// `capacity` is the hardware task maximum; it bounds both the process
    /// count and the node IDs that fit in the bitmap.
    #[must_use]
    pub fn new(fabric: &'a dyn QswFabric, capacity: u32) -> Self {
        Self { fabric, capacity }
    }

    /// Resolve every host in `hosts`.
    ///
    /// Resolution continues past failures so that one error names every bad
    /// host. Partial bitmaps are never returned.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` if `nprocs` is above the capacity
    /// - `Unresolved` listing each host without a usable node ID
    pub fn build(&self, hosts: &HostList, nprocs: u32) -> Result<NodeBitmap, NodeSetError> {
        if nprocs > self.capacity {
            return Err(NodeSetError::CapacityExceeded {
                requested: nprocs,
                max: self.capacity,
            });
        }

        let mut nodeset = NodeBitmap::new(self.capacity);
        let mut failed = Vec::new();
        for host in hosts.iter() {
            match self.fabric.node_id_by_host(host) {
                Some(node_id) if nodeset.set(node_id) => {}
                Some(node_id) => {
                    error!(host, node_id, capacity = self.capacity, "node ID out of range");
                    failed.push(host.to_owned());
                }
                None => {
                    error!(host, "no interconnect node ID for host");
                    failed.push(host.to_owned());
                }
            }
        }

        if failed.is_empty() {
            Ok(nodeset)
        } else {
            Err(NodeSetError::Unresolved { hosts: failed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::testing::ScriptedFabric;

    fn fabric() -> ScriptedFabric {
        ScriptedFabric::with_hosts(&[("n1", 1), ("n2", 2), ("n3", 3), ("big", 99)])
    }

    #[test]
    fn resolves_every_host() {
        let fabric = fabric();
        let builder = NodeSetBuilder::new(&fabric, 64);
        let nodeset = builder
            .build(&HostList::from_iter(["n1", "n2", "n3"]), 3)
            .unwrap();
        assert_eq!(nodeset.iter().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn host_order_does_not_matter() {
        let fabric = fabric();
        let builder = NodeSetBuilder::new(&fabric, 64);
        let a = builder.build(&HostList::from_iter(["n3", "n1", "n2"]), 3).unwrap();
        let b = builder.build(&HostList::from_iter(["n1", "n2", "n3"]), 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn names_every_unresolved_host() {
        let fabric = fabric();
        let builder = NodeSetBuilder::new(&fabric, 64);
        let err = builder
            .build(&HostList::from_iter(["n1", "n4", "n2", "big", "n9"]), 5)
            .unwrap_err();
        match err {
            NodeSetError::Unresolved { hosts } => assert_eq!(hosts, ["n4", "big", "n9"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_process_count_above_capacity() {
        let fabric = fabric();
        let builder = NodeSetBuilder::new(&fabric, 64);
        assert!(matches!(
            builder.build(&HostList::from_iter(["n1"]), 65),
            Err(NodeSetError::CapacityExceeded {
                requested: 65,
                max: 64
            })
        ));
    }
}
