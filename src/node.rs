use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// NodeId identifies a participant in the deployment, whether it hosts replica
/// groups (active), owns reconfiguration records (reconfigurator), or both.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(node_id: impl Into<String>) -> Self {
        NodeId(node_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ServiceName is the primary key of a reconfiguration record. The
/// distinguished name [`ServiceName::NODE_CONFIG`] tracks the reconfigurator
/// set itself.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ServiceName(String);

impl ServiceName {
    pub const NODE_CONFIG: &'static str = "NODE_CONFIG";

    pub fn new(name: impl Into<String>) -> Self {
        ServiceName(name.into())
    }

    pub fn node_config() -> Self {
        ServiceName(Self::NODE_CONFIG.to_string())
    }

    pub fn is_node_config(&self) -> bool {
        self.0 == Self::NODE_CONFIG
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Epoch tags a particular replica-group assignment of a name. Every
/// transition increments it by exactly one.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Epoch(u32);

impl Epoch {
    pub fn initial() -> Self {
        Epoch(0)
    }

    pub fn new(epoch: u32) -> Self {
        Epoch(epoch)
    }

    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    /// The epoch one before this one, or None for epoch 0 (creation has no
    /// predecessor group).
    pub fn prev(self) -> Option<Epoch> {
        self.0.checked_sub(1).map(Epoch)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// NodeRoles says which daemons a host entry runs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeRoles {
    pub active: bool,
    pub reconfigurator: bool,
}

/// NodeMetadata is identity/connection metadata describing one node.
#[derive(Clone, Debug)]
pub struct NodeMetadata {
    id: NodeId,
    ip: Ipv4Addr,
    port: u16,
    roles: NodeRoles,
}

impl NodeMetadata {
    pub fn new(id: NodeId, ip: Ipv4Addr, port: u16, roles: NodeRoles) -> Self {
        NodeMetadata { id, ip, port, roles }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        self.ip
    }

    /// The server-to-server listen port.
    pub fn server_port(&self) -> u16 {
        self.port
    }

    pub fn roles(&self) -> NodeRoles {
        self.roles
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// The client-facing address: server port shifted by the configured
    /// offset so client traffic can use a different transport policy.
    pub fn client_addr(&self, client_port_offset: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port + client_port_offset))
    }
}

/// NodeMap is the deployment's host table: every node we may talk to, with
/// its role flags. The reconfigurator set portion is also tracked as the
/// `NODE_CONFIG` record and changes through the same epoch protocol as any
/// other name.
#[derive(Clone)]
pub struct NodeMap {
    nodes: HashMap<NodeId, NodeMetadata>,
}

impl NodeMap {
    pub fn try_create(node_metadata: Vec<NodeMetadata>) -> Result<Self, InvalidNodeMap> {
        let nodes = map_with_unique_index(node_metadata, |m| m.id.clone())
            .map_err(|dupe| InvalidNodeMap::DuplicateNodeId(dupe.into_inner()))?;

        let map = NodeMap { nodes };
        if map.reconfigurators().is_empty() {
            return Err(InvalidNodeMap::NoReconfigurators);
        }

        Ok(map)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn metadata(&self, id: &NodeId) -> Option<&NodeMetadata> {
        self.nodes.get(id)
    }

    pub fn reconfigurators(&self) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|m| m.roles.reconfigurator)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn actives(&self) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|m| m.roles.active)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeMetadata> {
        self.nodes.values()
    }

    /// Applies a NODE_CONFIG add/remove to the current reconfigurator set,
    /// validating that added nodes are known, that the result still has a
    /// reconfigurator, and that `me` survives the change.
    pub fn reconfigured_rc_set(
        &self,
        me: &NodeId,
        current: &BTreeSet<NodeId>,
        added: &BTreeSet<NodeId>,
        removed: &BTreeSet<NodeId>,
    ) -> Result<BTreeSet<NodeId>, InvalidNodeMap> {
        for id in added {
            if !self.contains(id) {
                return Err(InvalidNodeMap::UnknownNode(id.clone().into_inner()));
            }
        }

        let mut rc_set = current.clone();
        for id in added {
            rc_set.insert(id.clone());
        }
        for id in removed {
            rc_set.remove(id);
        }

        if rc_set.is_empty() {
            return Err(InvalidNodeMap::NoReconfigurators);
        }
        if !rc_set.contains(me) && removed.contains(me) {
            return Err(InvalidNodeMap::RemovesSelf(me.clone().into_inner()));
        }

        Ok(rc_set)
    }
}

/// Majority threshold for a group of `group_size` members.
pub fn majority(group_size: usize) -> usize {
    group_size / 2 + 1
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidNodeMap {
    #[error("duplicate node '{0}' in node map")]
    DuplicateNodeId(String),
    #[error("node map has no reconfigurator")]
    NoReconfigurators,
    #[error("node '{0}' is not in the node map")]
    UnknownNode(String),
    #[error("change removes the serving node '{0}' from the node map")]
    RemovesSelf(String),
}

/// Returns a HashMap that is guaranteed to have uniquely indexed all of the
/// values. If a duplicate is present, the key for the duplicate is returned
/// as an Err.
fn map_with_unique_index<K, V, F>(values: Vec<V>, key_for_value: F) -> Result<HashMap<K, V>, K>
where
    K: std::hash::Hash + Eq,
    F: Fn(&V) -> K,
{
    let mut map = HashMap::with_capacity(values.len());

    for v in values {
        if let Some(duplicate) = map.insert(key_for_value(&v), v) {
            return Err(key_for_value(&duplicate));
        }
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(id: &str, port: u16, active: bool, reconfigurator: bool) -> NodeMetadata {
        NodeMetadata::new(
            NodeId::new(id),
            Ipv4Addr::LOCALHOST,
            port,
            NodeRoles { active, reconfigurator },
        )
    }

    #[test]
    fn node_map_rejects_duplicates() {
        let result = NodeMap::try_create(vec![md("n1", 3001, true, true), md("n1", 3002, true, false)]);
        assert!(matches!(result, Err(InvalidNodeMap::DuplicateNodeId(_))));
    }

    #[test]
    fn node_map_requires_a_reconfigurator() {
        let result = NodeMap::try_create(vec![md("a1", 3001, true, false)]);
        assert!(matches!(result, Err(InvalidNodeMap::NoReconfigurators)));
    }

    #[test]
    fn role_filters() {
        let map = NodeMap::try_create(vec![
            md("a1", 3001, true, false),
            md("r1", 3101, false, true),
            md("both", 3201, true, true),
        ])
        .unwrap();

        assert_eq!(
            map.actives(),
            [NodeId::new("a1"), NodeId::new("both")].into_iter().collect()
        );
        assert_eq!(
            map.reconfigurators(),
            [NodeId::new("r1"), NodeId::new("both")].into_iter().collect()
        );
    }

    #[test]
    fn rc_set_change_validation() {
        let map = NodeMap::try_create(vec![
            md("r1", 3101, false, true),
            md("r2", 3102, false, true),
            md("a1", 3001, true, false),
        ])
        .unwrap();
        let me = NodeId::new("r1");
        let current: BTreeSet<NodeId> = [NodeId::new("r1"), NodeId::new("r2")].into_iter().collect();

        let added = [NodeId::new("a1")].into_iter().collect();
        let removed = BTreeSet::new();
        let rc_set = map.reconfigured_rc_set(&me, &current, &added, &removed).unwrap();
        assert_eq!(rc_set.len(), 3);

        let added = [NodeId::new("ghost")].into_iter().collect();
        assert!(map.reconfigured_rc_set(&me, &current, &added, &removed).is_err());

        let added = BTreeSet::new();
        let removed = [NodeId::new("r1"), NodeId::new("r2")].into_iter().collect();
        assert!(map.reconfigured_rc_set(&me, &current, &added, &removed).is_err());
    }

    #[test]
    fn majority_thresholds() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn epoch_arithmetic() {
        let e0 = Epoch::initial();
        assert_eq!(e0.prev(), None);
        let e1 = e0.next();
        assert_eq!(e1.prev(), Some(e0));
        assert_eq!(e1.as_u32(), 1);
    }
}
