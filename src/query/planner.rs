//! Turns parsed query specifications into executable node trees.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::hash::Hasher;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::links::{LinkRegistry, LinkSide, ResolvedLink};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::spec::{QuerySpec, SpecEntry};
use crate::store::{Filter, FindOptions, Projection};
use crate::types::Result;

/// One fetch in a query tree.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryNode {
    /// Collection fetched by this node.
    pub collection: String,
    /// Requested scalar fields; empty means every stored field.
    pub fields: BTreeSet<String>,
    /// User filter for this fetch.
    pub filter: Filter,
    /// Sort/skip/limit. On link children skip/limit apply per parent, and only
    /// `many` links accept them.
    pub options: FindOptions,
    /// Child fetches keyed by link name.
    pub children: BTreeMap<String, QueryNode>,
    /// Link attaching this node to its parent; `None` on the root.
    pub link: Option<ResolvedLink>,
}

impl QueryNode {
    fn from_spec(spec: &QuerySpec, link: Option<ResolvedLink>) -> Self {
        let mut node = QueryNode {
            collection: spec.collection.clone(),
            fields: BTreeSet::new(),
            filter: Filter::All,
            options: FindOptions::default(),
            children: BTreeMap::new(),
            link,
        };
        let mut filters = Vec::new();
        for entry in &spec.entries {
            match entry {
                SpecEntry::Field(name) => {
                    node.fields.insert(name.clone());
                }
                SpecEntry::Link { link, spec } => {
                    node.children.insert(
                        link.name.clone(),
                        QueryNode::from_spec(spec, Some(link.clone())),
                    );
                }
                SpecEntry::Filters(filter) => filters.push(filter.clone()),
                SpecEntry::Options(options) => node.options = options.clone(),
            }
        }
        node.filter = Filter::and(filters);
        node
    }

    /// Fields this node's documents must carry so links can be joined:
    /// storage fields of direct children plus its own storage field when it
    /// is attached through an inverse link.
    pub fn join_fields(&self) -> BTreeSet<String> {
        let mut fields: BTreeSet<String> = self
            .children
            .values()
            .filter_map(|child| child.link.as_ref())
            .filter(|link| link.side == LinkSide::Direct)
            .map(|link| link.storage_field.clone())
            .collect();
        if let Some(link) = &self.link {
            if link.side == LinkSide::Inverse {
                fields.insert(link.storage_field.clone());
            }
        }
        fields
    }

    /// Projection sent to the store for this node.
    pub fn projection(&self) -> Projection {
        if self.fields.is_empty() {
            return Projection::All;
        }
        let mut fields = self.fields.clone();
        fields.extend(self.join_fields());
        Projection::Fields(fields)
    }

    /// Join fields fetched only for joining, to be removed from results.
    pub fn join_only_fields(&self) -> Vec<String> {
        if self.fields.is_empty() {
            return Vec::new();
        }
        self.join_fields()
            .into_iter()
            .filter(|f| !self.fields.contains(f))
            .collect()
    }

    /// Number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.values().map(QueryNode::node_count).sum::<usize>()
    }

    /// Number of levels in this subtree.
    pub fn depth(&self) -> usize {
        1 + self.children.values().map(QueryNode::depth).max().unwrap_or(0)
    }
}

/// Planner output: the node tree plus its explain form and stable hash.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// Root fetch.
    pub root: QueryNode,
    /// Human-readable explain tree.
    pub explain: PlanExplain,
    /// Deterministic hash of the tree.
    pub plan_hash: u64,
}

impl QueryPlan {
    /// Total fetches the executor will issue.
    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Number of breadth-first levels.
    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

/// Human-readable explain tree.
#[derive(Clone, Debug)]
pub struct PlanExplain {
    /// Root node of the explain tree.
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

impl fmt::Display for PlanExplain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plan {:016x}", self.plan_hash)?;
        self.root.render(f, 0)
    }
}

/// Explain node describing one fetch.
#[derive(Clone, Debug)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Properties describing the operator.
    pub props: Vec<ExplainProp>,
    /// Child fetches.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    fn prop(mut self, key: &str, value: impl Into<String>) -> Self {
        self.props.push(ExplainProp {
            key: key.to_owned(),
            value: value.into(),
        });
        self
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(f, "{:width$}{}", "", self.op, width = indent * 2)?;
        for prop in &self.props {
            write!(f, " {}={}", prop.key, prop.value)?;
        }
        writeln!(f)?;
        for input in &self.inputs {
            input.render(f, indent + 1)?;
        }
        Ok(())
    }
}

/// Single property of an [`ExplainNode`].
#[derive(Clone, Debug)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
}

/// Builds query plans against a shared registry.
pub struct Planner {
    registry: Arc<LinkRegistry>,
}

impl Planner {
    /// Creates a planner over `registry`.
    pub fn new(registry: Arc<LinkRegistry>) -> Self {
        Self { registry }
    }

    /// Registry the planner resolves links against.
    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    /// Parses and plans `spec` rooted at `collection`.
    pub fn plan(&self, collection: &str, spec: &Value) -> Result<QueryPlan> {
        let timer = profile_timer();
        let parsed = QuerySpec::parse(&self.registry, collection, spec)?;
        let plan = self.plan_parsed(&parsed);
        record_profile_timer(QueryProfileKind::Plan, timer);
        Ok(plan)
    }

    /// Plans an already-parsed specification.
    pub fn plan_parsed(&self, spec: &QuerySpec) -> QueryPlan {
        let root = QueryNode::from_spec(spec, None);
        let plan_hash = compute_plan_hash(&root);
        let explain = PlanExplain {
            root: build_explain_tree(&root),
            plan_hash,
        };
        debug!(
            collection = %root.collection,
            nodes = root.node_count(),
            depth = root.depth(),
            plan_hash,
            "query.plan.built"
        );
        QueryPlan {
            root,
            explain,
            plan_hash,
        }
    }
}

fn build_explain_tree(node: &QueryNode) -> ExplainNode {
    let mut explain = ExplainNode::new("Fetch").prop("collection", node.collection.clone());
    if let Some(link) = &node.link {
        explain = explain
            .prop("link", link.name.clone())
            .prop(
                "side",
                match link.side {
                    LinkSide::Direct => "direct",
                    LinkSide::Inverse => "inverse",
                },
            )
            .prop("cardinality", format!("{:?}", link.cardinality).to_lowercase())
            .prop("join", link.join_path());
        if link.metadata {
            explain = explain.prop("metadata", "true");
        }
    }
    let projection = match node.projection() {
        Projection::All => "*".to_owned(),
        Projection::Fields(fields) => {
            let mut out = String::new();
            for (idx, field) in fields.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{field}");
            }
            out
        }
    };
    explain = explain.prop("project", projection);
    if node.filter != Filter::All {
        explain = explain.prop("filter", format!("{:?}", node.filter));
    }
    if node.options != FindOptions::default() {
        explain = explain.prop("options", format!("{:?}", node.options));
    }
    explain.inputs = node.children.values().map(build_explain_tree).collect();
    explain
}

fn hash_node(node: &QueryNode, hasher: &mut Xxh64) {
    hasher.write(node.collection.as_bytes());
    hasher.write_u8(0xff);
    for field in &node.fields {
        hasher.write(field.as_bytes());
        hasher.write_u8(0xfe);
    }
    hasher.write(format!("{:?}", node.filter).as_bytes());
    hasher.write(format!("{:?}", node.options).as_bytes());
    if let Some(link) = &node.link {
        hasher.write(link.name.as_bytes());
        hasher.write(link.direct_name.as_bytes());
        hasher.write_u8(link.side as u8);
        hasher.write_u8(link.cardinality as u8);
    }
    hasher.write_usize(node.children.len());
    for child in node.children.values() {
        hash_node(child, hasher);
    }
}

fn compute_plan_hash(root: &QueryNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_node(root, &mut hasher);
    hasher.finish()
}
