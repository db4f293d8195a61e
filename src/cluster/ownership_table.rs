use crate::cluster::control_message::{NodeAnnouncement, TableAction};
use crate::cluster::identity::NodeIdentity;
use crate::cluster::partition::PartitionNumber;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OwnershipTableError {
    #[error("Invalid table update action {0:?}, expected add, update or remove")]
    InvalidTableUpdate(Option<String>),
}

/// OwnershipTable is this node's view of which partitions every known node holds. It is rebuilt
/// from peer announcements, so it can lag the truth.
#[derive(Debug, Clone, Default)]
pub struct OwnershipTable {
    ownership: HashMap<NodeIdentity, BTreeSet<PartitionNumber>>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        OwnershipTable::default()
    }

    pub fn update_table(&mut self, announcement: &NodeAnnouncement) -> Result<(), OwnershipTableError> {
        let action = announcement.update.as_deref().and_then(TableAction::parse);
        match action {
            Some(TableAction::Add) | Some(TableAction::Update) => {
                self.update_node(announcement.node.clone(), announcement.vnodes.iter().copied());
                Ok(())
            }
            Some(TableAction::Remove) => {
                self.remove_node(&announcement.node);
                Ok(())
            }
            None => Err(OwnershipTableError::InvalidTableUpdate(announcement.update.clone())),
        }
    }

    /// Replaces whatever was known about `node`.
    pub fn update_node<I>(&mut self, node: NodeIdentity, partitions: I)
    where
        I: IntoIterator<Item = PartitionNumber>,
    {
        self.ownership.insert(node, partitions.into_iter().collect());
    }

    /// Returns whether the node was known. Removing an unknown node is fine.
    pub fn remove_node(&mut self, node: &NodeIdentity) -> bool {
        self.ownership.remove(node).is_some()
    }

    pub fn partitions_of(&self, node: &NodeIdentity) -> Option<&BTreeSet<PartitionNumber>> {
        self.ownership.get(node)
    }

    pub fn len(&self) -> usize {
        self.ownership.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ownership.is_empty()
    }

    /// Sorted by identity, so views from different nodes compare equal.
    pub fn entries(&self) -> Vec<(NodeIdentity, Vec<PartitionNumber>)> {
        let mut entries: Vec<_> = self
            .ownership
            .iter()
            .map(|(node, partitions)| (node.clone(), partitions.iter().copied().collect()))
            .collect();
        entries.sort();

        entries
    }

    /// The node holding the lowest-numbered partition. Nodes holding nothing can't lead; equal
    /// minimums (a transient double claim) go to the smaller identity.
    pub fn leader(&self) -> Option<&NodeIdentity> {
        self.ownership
            .iter()
            .filter_map(|(node, partitions)| partitions.iter().next().map(|lowest| (*lowest, node)))
            .min()
            .map(|(_, node)| node)
    }

    /// An empty table, or one where every node holds nothing, has no leader, and nobody leads.
    pub fn local_node_is_leader(&self, local: &NodeIdentity) -> bool {
        if self.leader() == Some(local) {
            return true;
        }

        self.ownership
            .get(local)
            .map(|partitions| partitions.contains(&PartitionNumber::new(0)))
            .unwrap_or(false)
    }
}
