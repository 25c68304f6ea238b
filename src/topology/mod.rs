//! Compiled execution graph.
//!
//! A [`GraphDescription`] maps node names to their children. It is compiled
//! once into an immutable [`TopologyGraph`] which every request shares; the
//! per-request state lives in the executor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, info};
use petgraph::{graphmap::DiGraphMap, visit::Dfs, Direction};
use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::core::GatewayResult;

/// Universal entry of every request.
pub const START_GATEWAY: &str = "start-gateway";
/// Universal exit; its join produces the response.
pub const END_GATEWAY: &str = "end-gateway";

/// Node name to ordered list of child names.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphDescription(BTreeMap<String, Vec<String>>);

impl GraphDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the JSON object form, e.g. `{"start-gateway": ["d0"], "d0": ["end-gateway"]}`.
    pub fn from_json(json: &str) -> GatewayResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builder-style insertion of a node and its children.
    pub fn with_node<I, S>(mut self, name: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .insert(name.into(), children.into_iter().map(Into::into).collect());
        self
    }

    pub fn children(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, Vec<String>>> for GraphDescription {
    fn from(value: BTreeMap<String, Vec<String>>) -> Self {
        Self(value)
    }
}

/// Where a node's work is sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingTarget {
    pub deployment: String,
    /// Overrides the request's endpoint when set
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl RoutingTarget {
    pub fn deployment(name: impl Into<String>) -> Self {
        Self {
            deployment: name.into(),
            endpoint: None,
        }
    }
}

/// A compiled node. The end-gateway is a node without a routing target.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub name: String,
    pub children: Vec<String>,
    /// Number of distinct parents, the start-gateway included
    pub in_degree: usize,
    pub target: Option<RoutingTarget>,
    /// False for hanging branches
    pub reaches_sink: bool,
}

impl Node {
    pub fn is_sink(&self) -> bool {
        self.name == END_GATEWAY
    }
}

/// Immutable runtime structure shared by all requests.
#[derive(Debug, Default)]
pub struct TopologyGraph {
    nodes: BTreeMap<String, Node>,
    origin_children: Vec<String>,
}

impl TopologyGraph {
    /// Compiles with every node routed to the deployment of the same name.
    pub fn compile(description: &GraphDescription) -> GatewayResult<Self> {
        Self::compile_with_routing(description, &BTreeMap::new())
    }

    pub fn compile_with_routing(
        description: &GraphDescription,
        routing: &BTreeMap<String, RoutingTarget>,
    ) -> GatewayResult<Self> {
        // No deployments at all: requests pass straight through
        let sentinels_only = description.iter().all(|(name, children)| {
            (name == START_GATEWAY || name == END_GATEWAY) && children.is_empty()
        });
        if sentinels_only {
            if let Some(node) = routing.keys().next() {
                return Err(config_error!("routing entry for unknown node '{}'", node));
            }
            return Ok(Self::identity());
        }

        if description.children(START_GATEWAY).is_none() {
            return Err(config_error!(
                "graph description has no '{}' entry",
                START_GATEWAY
            ));
        }
        if description
            .children(END_GATEWAY)
            .is_some_and(|children| !children.is_empty())
        {
            return Err(config_error!("'{}' cannot have children", END_GATEWAY));
        }

        let declared: HashSet<&str> = description
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| *name != START_GATEWAY && *name != END_GATEWAY)
            .collect();

        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for (parent, children) in description.iter() {
            if parent == END_GATEWAY {
                continue;
            }
            let mut unique: Vec<&str> = Vec::with_capacity(children.len());
            for child in children {
                let child = child.as_str();
                if child == START_GATEWAY {
                    return Err(config_error!(
                        "'{}' lists '{}' as a child",
                        parent,
                        START_GATEWAY
                    ));
                }
                if child != END_GATEWAY && !declared.contains(child) {
                    return Err(config_error!(
                        "'{}' lists undeclared child '{}'",
                        parent,
                        child
                    ));
                }
                if unique.contains(&child) {
                    debug!("Duplicate edge {parent} -> {child} counted once");
                    continue;
                }
                unique.push(child);
            }
            edges.insert(parent.as_str(), unique);
        }

        for node in routing.keys() {
            if !declared.contains(node.as_str()) {
                return Err(config_error!("routing entry for unknown node '{}'", node));
            }
        }

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        graph.add_node(START_GATEWAY);
        graph.add_node(END_GATEWAY);
        for name in declared.iter().copied() {
            graph.add_node(name);
        }
        for (parent, children) in &edges {
            for child in children {
                graph.add_edge(*parent, *child, ());
            }
        }

        let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
            config_error!("graph description contains a cycle through '{}'", cycle.node_id())
        })?;

        let mut reachable: HashSet<&str> = HashSet::new();
        let mut dfs = Dfs::new(&graph, START_GATEWAY);
        while let Some(name) = dfs.next(&graph) {
            reachable.insert(name);
        }
        if let Some(name) = declared.iter().find(|name| !reachable.contains(*name)) {
            return Err(config_error!(
                "node '{}' is not reachable from '{}'",
                name,
                START_GATEWAY
            ));
        }
        if !reachable.contains(END_GATEWAY) {
            return Err(config_error!(
                "'{}' is not reachable from '{}'",
                END_GATEWAY,
                START_GATEWAY
            ));
        }

        // Children come before parents when walking the order backwards
        let mut reaches_sink: HashSet<&str> = HashSet::new();
        reaches_sink.insert(END_GATEWAY);
        for name in order.iter().rev().copied() {
            if graph
                .neighbors_directed(name, Direction::Outgoing)
                .any(|child| reaches_sink.contains(&child))
            {
                reaches_sink.insert(name);
            }
        }

        let mut nodes = BTreeMap::new();
        for name in order.iter().copied().filter(|name| *name != START_GATEWAY) {
            let children: Vec<String> = edges
                .get(name)
                .map(|children| children.iter().map(|c| c.to_string()).collect())
                .unwrap_or_default();
            let target = if name == END_GATEWAY {
                None
            } else {
                Some(
                    routing
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| RoutingTarget::deployment(name)),
                )
            };
            let node = Node {
                name: name.to_string(),
                children,
                in_degree: graph.neighbors_directed(name, Direction::Incoming).count(),
                target,
                reaches_sink: reaches_sink.contains(&name),
            };
            nodes.insert(node.name.clone(), node);
        }

        let origin_children: Vec<String> = edges
            .get(START_GATEWAY)
            .map(|children| children.iter().map(|c| c.to_string()).collect())
            .unwrap_or_default();

        info!(
            "Compiled topology with {} nodes, {} fed by '{}'",
            nodes.len() - 1,
            origin_children.len(),
            START_GATEWAY
        );

        Ok(Self {
            nodes,
            origin_children,
        })
    }

    /// The graph of an empty description: the request goes straight to the end-gateway.
    pub fn identity() -> Self {
        let sink = Node {
            name: END_GATEWAY.to_string(),
            children: Vec::new(),
            in_degree: 1,
            target: None,
            reaches_sink: true,
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(sink.name.clone(), sink);
        Self {
            nodes,
            origin_children: vec![END_GATEWAY.to_string()],
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Nodes fed directly with the request payload.
    pub fn origin_children(&self) -> &[String] {
        &self.origin_children
    }

    /// All compiled nodes, the end-gateway included, in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn is_identity(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Deployments referenced by the graph.
    pub fn deployments(&self) -> Vec<&str> {
        let mut deployments: Vec<&str> = self
            .nodes
            .values()
            .filter_map(|node| node.target.as_ref())
            .map(|target| target.deployment.as_str())
            .collect();
        deployments.sort_unstable();
        deployments.dedup();
        deployments
    }
}

/// Holds the active topology. Requests snapshot it at dispatch.
pub struct TopologyStore {
    active: ArcSwap<TopologyGraph>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new(TopologyGraph::identity())
    }
}

impl TopologyStore {
    pub fn new(graph: TopologyGraph) -> Self {
        Self {
            active: ArcSwap::new(Arc::new(graph)),
        }
    }

    pub fn current(&self) -> Arc<TopologyGraph> {
        self.active.load_full()
    }

    /// Compiles and activates a new description.
    ///
    /// On error the previously active topology keeps serving.
    pub fn activate(
        &self,
        description: &GraphDescription,
        routing: &BTreeMap<String, RoutingTarget>,
    ) -> GatewayResult<Arc<TopologyGraph>> {
        let graph = Arc::new(TopologyGraph::compile_with_routing(description, routing)?);
        self.active.store(graph.clone());
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GatewayError;

    fn linear() -> GraphDescription {
        GraphDescription::new()
            .with_node(START_GATEWAY, ["deployment0"])
            .with_node("deployment0", ["deployment1"])
            .with_node("deployment1", ["deployment2"])
            .with_node("deployment2", ["deployment3"])
            .with_node("deployment3", [END_GATEWAY])
    }

    fn bifurcation() -> GraphDescription {
        GraphDescription::from_json(
            r#"{
                "start-gateway": ["deployment0", "deployment4", "deployment6"],
                "deployment0": ["deployment1", "deployment2"],
                "deployment1": [],
                "deployment2": ["deployment3"],
                "deployment4": ["deployment5"],
                "deployment5": ["end-gateway"],
                "deployment3": ["deployment5"],
                "deployment6": []
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_linear() {
        let graph = TopologyGraph::compile(&linear()).unwrap();
        assert_eq!(graph.origin_children(), ["deployment0"]);
        assert_eq!(graph.nodes().count(), 5);
        for node in graph.nodes() {
            assert_eq!(node.in_degree, 1, "{}", node.name);
            assert!(node.reaches_sink);
        }
        let d0 = graph.node("deployment0").unwrap();
        assert_eq!(d0.children, ["deployment1"]);
        assert_eq!(d0.target, Some(RoutingTarget::deployment("deployment0")));
        assert!(graph.node(END_GATEWAY).unwrap().target.is_none());
    }

    #[test]
    fn test_compile_bifurcation() {
        let graph = TopologyGraph::compile(&bifurcation()).unwrap();
        assert_eq!(
            graph.origin_children(),
            ["deployment0", "deployment4", "deployment6"]
        );
        assert_eq!(graph.node("deployment5").unwrap().in_degree, 2);
        assert_eq!(graph.node(END_GATEWAY).unwrap().in_degree, 1);
        assert!(!graph.node("deployment1").unwrap().reaches_sink);
        assert!(!graph.node("deployment6").unwrap().reaches_sink);
        assert!(graph.node("deployment0").unwrap().reaches_sink);
        assert_eq!(
            graph.node("deployment0").unwrap().children,
            ["deployment1", "deployment2"]
        );
    }

    #[test]
    fn test_compile_empty_is_identity() {
        let graph = TopologyGraph::compile(&GraphDescription::new()).unwrap();
        assert!(graph.is_identity());
        assert_eq!(graph.origin_children(), [END_GATEWAY]);
        assert_eq!(graph.node(END_GATEWAY).unwrap().in_degree, 1);
        assert!(graph.deployments().is_empty());
    }

    #[test]
    fn test_start_gateway_straight_to_end() {
        let description = GraphDescription::new().with_node(START_GATEWAY, [END_GATEWAY]);
        let graph = TopologyGraph::compile(&description).unwrap();
        assert!(graph.is_identity());
    }

    #[test]
    fn test_origin_without_children_is_identity() {
        let description = GraphDescription::new().with_node(START_GATEWAY, Vec::<String>::new());
        assert!(TopologyGraph::compile(&description).unwrap().is_identity());

        let description = description.with_node(END_GATEWAY, Vec::<String>::new());
        assert!(TopologyGraph::compile(&description).unwrap().is_identity());

        let routing = BTreeMap::from([("a".to_string(), RoutingTarget::deployment("a"))]);
        assert!(TopologyGraph::compile_with_routing(&description, &routing).is_err());
    }

    #[test]
    fn test_reject_cycle() {
        let description = GraphDescription::new()
            .with_node(START_GATEWAY, ["a"])
            .with_node("a", ["b"])
            .with_node("b", ["a", END_GATEWAY]);
        let err = TopologyGraph::compile(&description).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_reject_dangling_child() {
        let description = GraphDescription::new()
            .with_node(START_GATEWAY, ["a"])
            .with_node("a", ["ghost"]);
        let err = TopologyGraph::compile(&description).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_reject_unreachable_node() {
        let description = GraphDescription::new()
            .with_node(START_GATEWAY, ["a"])
            .with_node("a", [END_GATEWAY])
            .with_node("orphan", ["a"]);
        let err = TopologyGraph::compile(&description).unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }

    #[test]
    fn test_reject_sink_unreachable() {
        let description = GraphDescription::new()
            .with_node(START_GATEWAY, ["a"])
            .with_node("a", Vec::<String>::new());
        assert!(TopologyGraph::compile(&description).is_err());
    }

    #[test]
    fn test_reject_misplaced_sentinels() {
        let description = GraphDescription::new()
            .with_node(START_GATEWAY, ["a"])
            .with_node("a", [START_GATEWAY]);
        assert!(TopologyGraph::compile(&description).is_err());

        let description = GraphDescription::new()
            .with_node(START_GATEWAY, [END_GATEWAY])
            .with_node(END_GATEWAY, ["a"])
            .with_node("a", Vec::<String>::new());
        assert!(TopologyGraph::compile(&description).is_err());

        let description = GraphDescription::new().with_node("a", [END_GATEWAY]);
        assert!(TopologyGraph::compile(&description).is_err());
    }

    #[test]
    fn test_duplicate_child_counts_once() {
        let description = GraphDescription::new()
            .with_node(START_GATEWAY, ["a"])
            .with_node("a", ["b", "b"])
            .with_node("b", [END_GATEWAY]);
        let graph = TopologyGraph::compile(&description).unwrap();
        assert_eq!(graph.node("a").unwrap().children, ["b"]);
        assert_eq!(graph.node("b").unwrap().in_degree, 1);
    }

    #[test]
    fn test_origin_counts_as_parent() {
        let description = GraphDescription::new()
            .with_node(START_GATEWAY, ["a", "b"])
            .with_node("a", ["b"])
            .with_node("b", [END_GATEWAY]);
        let graph = TopologyGraph::compile(&description).unwrap();
        assert_eq!(graph.node("b").unwrap().in_degree, 2);
        assert_eq!(graph.node("a").unwrap().in_degree, 1);
    }

    #[test]
    fn test_routing_overrides() {
        let mut routing = BTreeMap::new();
        routing.insert(
            "deployment1".to_string(),
            RoutingTarget {
                deployment: "encoder".to_string(),
                endpoint: Some("/encode".to_string()),
            },
        );
        let graph = TopologyGraph::compile_with_routing(&linear(), &routing).unwrap();
        let target = graph.node("deployment1").unwrap().target.clone().unwrap();
        assert_eq!(target.deployment, "encoder");
        assert_eq!(target.endpoint.as_deref(), Some("/encode"));
        assert!(graph.deployments().contains(&"encoder"));
        assert!(!graph.deployments().contains(&"deployment1"));

        routing.insert("nope".to_string(), RoutingTarget::deployment("x"));
        assert!(TopologyGraph::compile_with_routing(&linear(), &routing).is_err());
    }

    #[test]
    fn test_store_keeps_old_topology_on_error() {
        let store = TopologyStore::default();
        assert!(store.current().is_identity());

        store.activate(&linear(), &BTreeMap::new()).unwrap();
        let active = store.current();
        assert!(active.node("deployment3").is_some());

        let broken = GraphDescription::new()
            .with_node(START_GATEWAY, ["a"])
            .with_node("a", ["a"]);
        assert!(store.activate(&broken, &BTreeMap::new()).is_err());
        assert!(Arc::ptr_eq(&active, &store.current()));
    }
}
