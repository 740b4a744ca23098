//! Resource graph construction.
//!
//! Turns resource declarations into a validated dependency DAG with a
//! deterministic topological order.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::{ConfigHasher, ResourceConfig};
use crate::error::{GraphError, HalldyllError, Result};
use crate::provider::ProviderRegistry;

use super::expr::{Expr, Reference};

/// A resolved resource declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Unique address (`type.name`).
    pub address: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Resource name.
    pub name: String,
    /// Attribute expressions.
    pub attributes: BTreeMap<String, Expr>,
    /// Explicit ordering hints.
    pub depends_on: Vec<String>,
    /// Replacement policy override.
    pub create_before_destroy: Option<bool>,
    /// Fingerprint of the declaration.
    pub fingerprint: String,
}

impl ResourceSpec {
    /// Builds a spec from a configuration entry, parsing its expressions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidExpression` if an attribute holds a malformed reference.
    pub fn from_config(config: &ResourceConfig) -> std::result::Result<Self, GraphError> {
        let address = config.address();
        let attributes = config
            .attributes
            .iter()
            .map(|(key, value)| {
                Expr::parse(value)
                    .map(|expr| (key.clone(), expr))
                    .map_err(|reason| GraphError::InvalidExpression {
                        resource: address.clone(),
                        attribute: key.clone(),
                        reason,
                    })
            })
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        Ok(Self {
            fingerprint: ConfigHasher::new().hash_resource(config),
            address,
            resource_type: config.resource_type.clone(),
            name: config.name.clone(),
            attributes,
            depends_on: config.depends_on.clone(),
            create_before_destroy: config.lifecycle.create_before_destroy,
        })
    }

    /// Returns `(attribute, reference)` pairs in attribute order.
    pub fn references(&self) -> impl Iterator<Item = (&str, &Reference)> {
        self.attributes.iter().flat_map(|(attribute, expr)| {
            expr.references()
                .into_iter()
                .map(move |reference| (attribute.as_str(), reference))
        })
    }
}

/// Why one resource depends on another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeKind {
    /// An attribute references the target.
    Reference {
        /// Attribute holding the reference.
        attribute: String,
    },
    /// An explicit `depends_on` hint.
    Explicit,
}

/// "`from` depends on `to`".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DependencyEdge {
    /// The dependent resource.
    pub from: String,
    /// The dependency.
    pub to: String,
    /// Edge kind.
    #[serde(flatten)]
    pub kind: EdgeKind,
}

/// A validated, acyclic resource graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    /// Specs keyed by address.
    resources: BTreeMap<String, ResourceSpec>,
    /// Address -> addresses it depends on.
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Address -> addresses depending on it.
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// All edges, sorted.
    edges: Vec<DependencyEdge>,
    /// Deterministic topological order, dependencies first.
    order: Vec<String>,
}

impl ResourceGraph {
    /// Returns the declaration for an address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&ResourceSpec> {
        self.resources.get(address)
    }

    /// Returns true if the address is part of the graph.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.resources.contains_key(address)
    }

    /// Iterates over specs in topological order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.order.iter().filter_map(|a| self.resources.get(a))
    }

    /// Returns the topological order, dependencies first.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Returns the direct dependencies of a resource.
    pub fn dependencies_of(&self, address: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(address)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Returns the direct dependents of a resource.
    pub fn dependents_of(&self, address: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(address)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Returns every edge, sorted.
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Builds resource graphs.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphBuilder<'a> {
    /// Registry used to check types and computed attributes.
    registry: Option<&'a ProviderRegistry>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder that skips provider checks.
    ///
    /// Useful for offline validation; any attribute may then be referenced.
    #[must_use]
    pub const fn new() -> Self {
        Self { registry: None }
    }

    /// Creates a builder validating types and attributes against providers.
    #[must_use]
    pub const fn with_registry(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Builds a graph from configuration entries.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build); also fails on malformed expressions.
    pub fn build_from_config(&self, configs: &[ResourceConfig]) -> Result<ResourceGraph> {
        let specs = configs
            .iter()
            .map(ResourceSpec::from_config)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.build(specs)
    }

    /// Builds a graph from specs.
    ///
    /// # Errors
    ///
    /// Returns a graph error on duplicate addresses, unknown types,
    /// unresolved references, or cycles.
    pub fn build(&self, specs: Vec<ResourceSpec>) -> Result<ResourceGraph> {
        let mut resources = BTreeMap::new();
        for spec in specs {
            if let Some(registry) = self.registry
                && !registry.contains(&spec.resource_type)
            {
                return Err(GraphError::UnknownResourceType {
                    address: spec.address,
                    resource_type: spec.resource_type,
                }
                .into());
            }
            if resources.contains_key(&spec.address) {
                return Err(GraphError::DuplicateResource {
                    address: spec.address,
                }
                .into());
            }
            resources.insert(spec.address.clone(), spec);
        }

        let edges = self.collect_edges(&resources)?;

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = resources
            .keys()
            .map(|a| (a.clone(), BTreeSet::new()))
            .collect();
        let mut dependents = dependencies.clone();
        for edge in &edges {
            if let Some(deps) = dependencies.get_mut(&edge.from) {
                deps.insert(edge.to.clone());
            }
            if let Some(users) = dependents.get_mut(&edge.to) {
                users.insert(edge.from.clone());
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(HalldyllError::Graph(GraphError::CyclicDependency { cycle }));
        }

        let order = topological_order(&dependencies, &dependents);
        debug!(
            "Built resource graph: {} resources, {} edges",
            resources.len(),
            edges.len()
        );

        Ok(ResourceGraph {
            resources,
            dependencies,
            dependents,
            edges,
            order,
        })
    }

    /// Validates references and hints, returning the sorted edge list.
    fn collect_edges(
        &self,
        resources: &BTreeMap<String, ResourceSpec>,
    ) -> Result<Vec<DependencyEdge>> {
        let mut edges = BTreeSet::new();

        for spec in resources.values() {
            for (attribute, reference) in spec.references() {
                let Some(target) = resources.get(&reference.resource) else {
                    return Err(GraphError::UnresolvedReference {
                        resource: spec.address.clone(),
                        reference: reference.to_string(),
                        reason: format!("resource {} is not declared", reference.resource),
                    }
                    .into());
                };

                let root = reference.root_attribute();
                if !self.is_referenceable(target, root) {
                    return Err(GraphError::UnresolvedReference {
                        resource: spec.address.clone(),
                        reference: reference.to_string(),
                        reason: format!(
                            "{} has no configured or computed attribute '{root}'",
                            target.address
                        ),
                    }
                    .into());
                }

                edges.insert(DependencyEdge {
                    from: spec.address.clone(),
                    to: target.address.clone(),
                    kind: EdgeKind::Reference {
                        attribute: attribute.to_string(),
                    },
                });
            }

            for hint in &spec.depends_on {
                if !resources.contains_key(hint) {
                    return Err(GraphError::UnresolvedReference {
                        resource: spec.address.clone(),
                        reference: hint.clone(),
                        reason: String::from("depends_on target is not declared"),
                    }
                    .into());
                }
                edges.insert(DependencyEdge {
                    from: spec.address.clone(),
                    to: hint.clone(),
                    kind: EdgeKind::Explicit,
                });
            }
        }

        Ok(edges.into_iter().collect())
    }

    fn is_referenceable(&self, target: &ResourceSpec, attribute: &str) -> bool {
        if target.attributes.contains_key(attribute) || attribute == "id" {
            return true;
        }
        self.registry.is_none_or(|registry| {
            registry
                .schema(&target.resource_type)
                .is_some_and(|schema| schema.is_computed(attribute))
        })
    }
}

/// Finds a cycle, returned in cycle order with the first node repeated at the end.
fn find_cycle(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        dependencies: &'a BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == node)?;
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(ToString::to_string).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for next in dependencies.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(next, dependencies, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut stack = Vec::new();
    dependencies
        .keys()
        .find_map(|node| visit(node, dependencies, &mut marks, &mut stack))
}

/// Kahn's algorithm; ties broken by address.
fn topological_order(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut remaining: BTreeMap<&str, usize> = dependencies
        .iter()
        .map(|(node, deps)| (node.as_str(), deps.len()))
        .collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        for user in dependents.get(node).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(user.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(user.as_str());
                }
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::provider::{MemoryProvider, ResourceSchema};
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn resource(ty: &str, name: &str, attributes: Value) -> ResourceConfig {
        ResourceConfig {
            resource_type: ty.to_string(),
            name: name.to_string(),
            attributes: serde_json::from_value(attributes).unwrap(),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with(Arc::new(MemoryProvider::new(
                ResourceSchema::new("aws_vpc").with_computed(["arn"]),
            )))
            .with(Arc::new(MemoryProvider::new(ResourceSchema::new("aws_subnet"))))
            .with(Arc::new(MemoryProvider::new(ResourceSchema::new(
                "aws_route_table",
            ))))
    }

    fn vpc_topology() -> Vec<ResourceConfig> {
        vec![
            resource(
                "aws_route_table",
                "public",
                json!({"vpc_id": "${aws_vpc.main.id}", "subnet_ids": ["${aws_subnet.a.id}"]}),
            ),
            resource(
                "aws_subnet",
                "a",
                json!({"vpc_id": "${aws_vpc.main.id}", "cidr_block": "10.0.1.0/24"}),
            ),
            resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"})),
        ]
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let registry = registry();
        let graph = GraphBuilder::with_registry(&registry)
            .build_from_config(&vpc_topology())
            .unwrap();

        assert_eq!(
            graph.topological_order(),
            &["aws_vpc.main", "aws_subnet.a", "aws_route_table.public"]
        );

        let position = |a: &str| graph.topological_order().iter().position(|x| x == a);
        for edge in graph.edges() {
            assert!(position(&edge.to) < position(&edge.from), "{edge:?}");
        }

        assert_eq!(
            graph.dependents_of("aws_vpc.main").collect::<Vec<_>>(),
            vec!["aws_route_table.public", "aws_subnet.a"]
        );
        assert_eq!(
            graph.dependencies_of("aws_route_table.public").count(),
            2
        );
    }

    #[test]
    fn test_order_is_deterministic_for_independent_resources() {
        let configs = vec![
            resource("aws_vpc", "zeta", json!({"cidr_block": "10.2.0.0/16"})),
            resource("aws_vpc", "alpha", json!({"cidr_block": "10.1.0.0/16"})),
        ];
        let graph = GraphBuilder::new().build_from_config(&configs).unwrap();
        assert_eq!(graph.topological_order(), &["aws_vpc.alpha", "aws_vpc.zeta"]);
    }

    #[test]
    fn test_explicit_hint_adds_edge() {
        let mut configs = vec![
            resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"})),
            resource("aws_subnet", "a", json!({"cidr_block": "10.0.1.0/24"})),
        ];
        configs[0].depends_on.push(String::from("aws_subnet.a"));

        let graph = GraphBuilder::new().build_from_config(&configs).unwrap();
        assert_eq!(graph.topological_order(), &["aws_subnet.a", "aws_vpc.main"]);
        assert_eq!(graph.edges()[0].kind, EdgeKind::Explicit);
    }

    #[test]
    fn test_cycle_names_participants() {
        let configs = vec![
            resource("aws_vpc", "main", json!({"peer": "${aws_subnet.a.id}"})),
            resource("aws_subnet", "a", json!({"vpc_id": "${aws_vpc.main.id}"})),
        ];
        let err = GraphBuilder::new().build_from_config(&configs).unwrap_err();
        let HalldyllError::Graph(GraphError::CyclicDependency { cycle }) = err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(cycle, vec!["aws_subnet.a", "aws_vpc.main", "aws_subnet.a"]);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let configs = vec![resource(
            "aws_vpc",
            "main",
            json!({"cidr_block": "10.0.0.0/16", "copy": "${aws_vpc.main.cidr_block}"}),
        )];
        let err = GraphBuilder::new().build_from_config(&configs).unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::Graph(GraphError::CyclicDependency { ref cycle }) if cycle.len() == 2
        ));
    }

    #[test]
    fn test_reference_to_missing_resource() {
        let configs = vec![resource(
            "aws_subnet",
            "a",
            json!({"vpc_id": "${aws_vpc.nope.id}"}),
        )];
        let err = GraphBuilder::new().build_from_config(&configs).unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::Graph(GraphError::UnresolvedReference { ref reference, .. })
                if reference == "${aws_vpc.nope.id}"
        ));
    }

    #[test]
    fn test_reference_to_unknown_attribute() {
        let registry = registry();
        let configs = vec![
            resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"})),
            resource("aws_subnet", "a", json!({"owner": "${aws_vpc.main.owner_id}"})),
            resource("aws_subnet", "b", json!({"vpc_arn": "${aws_vpc.main.arn}"})),
        ];

        let err = GraphBuilder::with_registry(&registry)
            .build_from_config(&configs)
            .unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::Graph(GraphError::UnresolvedReference { ref resource, .. })
                if resource == "aws_subnet.a"
        ));

        // Offline builds cannot know computed attributes and accept the reference.
        assert!(GraphBuilder::new().build_from_config(&configs).is_ok());
        // `arn` is computed by the provider.
        assert!(
            GraphBuilder::with_registry(&registry)
                .build_from_config(&configs[..1])
                .is_ok()
        );
        let computed = vec![configs[0].clone(), configs[2].clone()];
        assert!(
            GraphBuilder::with_registry(&registry)
                .build_from_config(&computed)
                .is_ok()
        );
    }

    #[test]
    fn test_unknown_type_and_duplicates() {
        let registry = registry();
        let configs = vec![resource("aws_nat_gateway", "a", json!({}))];
        assert!(matches!(
            GraphBuilder::with_registry(&registry).build_from_config(&configs),
            Err(HalldyllError::Graph(GraphError::UnknownResourceType { .. }))
        ));

        let configs = vec![
            resource("aws_vpc", "main", json!({})),
            resource("aws_vpc", "main", json!({})),
        ];
        assert!(matches!(
            GraphBuilder::new().build_from_config(&configs),
            Err(HalldyllError::Graph(GraphError::DuplicateResource { .. }))
        ));
    }

    #[test]
    fn test_malformed_expression() {
        let configs = vec![resource(
            "aws_subnet",
            "a",
            json!({"name": "subnet-${aws_vpc.main.id}"}),
        )];
        assert!(matches!(
            GraphBuilder::new().build_from_config(&configs),
            Err(HalldyllError::Graph(GraphError::InvalidExpression { .. }))
        ));
    }
}
